//! Registry of the script instances that live in one simulation scope.
//!
//! Instances sit in an arena addressed by [`InstanceHandle`]; dispatch order is a separate
//! vector of handles. Removal vacates the arena slot and leaves a tombstone in the order
//! vector, so a pass that is already walking the order neither skips nor revisits anyone.
//! Tombstones are compacted away between passes.

use std::collections::HashMap;

use log::{debug, warn};
use serde_json::Value;

use crate::context::{ScriptContext, ScriptHandle};
use crate::error::ScriptError;
use crate::instance::{InstancePhase, ScriptFailure, ScriptInstance};
use crate::Instance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    instance: Option<ScriptInstance>,
}

pub struct ScriptWorld {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: Vec<InstanceHandle>,
    tombstones: usize,
    by_instance: HashMap<Instance, InstanceHandle>,
    pass_depth: u32,
    pub(crate) failures: Vec<ScriptFailure>,
}

impl Default for ScriptWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptWorld {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            tombstones: 0,
            by_instance: HashMap::new(),
            pass_depth: 0,
            failures: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_instance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_instance.is_empty()
    }

    /// Appends `instance` to the dispatch order.
    ///
    /// An owning instance can carry one script instance per world; a duplicate is destroyed
    /// and rejected.
    pub fn add_instance(
        &mut self,
        scripts: &mut ScriptContext,
        instance: ScriptInstance,
    ) -> Result<InstanceHandle, ScriptError> {
        let owner = instance.instance();
        if self.by_instance.contains_key(&owner) {
            instance.destroy(scripts);
            return Err(ScriptError::DuplicateInstance(owner));
        }
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.instance = Some(instance);
                InstanceHandle { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, instance: Some(instance) });
                InstanceHandle { index, generation: 0 }
            }
        };
        self.order.push(handle);
        self.by_instance.insert(owner, handle);
        Ok(handle)
    }

    pub fn create_instance(
        &mut self,
        scripts: &mut ScriptContext,
        script: ScriptHandle,
        instance: Instance,
    ) -> Result<InstanceHandle, ScriptError> {
        if self.by_instance.contains_key(&instance) {
            return Err(ScriptError::DuplicateInstance(instance));
        }
        let created = ScriptInstance::create(scripts, script, instance)?;
        self.add_instance(scripts, created)
    }

    /// Unlinks the instance and hands it back to the caller, who must destroy it.
    pub fn remove_instance(&mut self, handle: InstanceHandle) -> Option<ScriptInstance> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let removed = slot.instance.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.by_instance.remove(&removed.instance());
        self.tombstones += 1;
        if self.pass_depth == 0 && self.tombstones * 2 > self.order.len() {
            self.compact();
        }
        Some(removed)
    }

    /// Removes and destroys in one step. Returns false when the handle is stale.
    pub fn destroy_instance(&mut self, scripts: &mut ScriptContext, handle: InstanceHandle) -> bool {
        match self.remove_instance(handle) {
            Some(instance) => {
                instance.destroy(scripts);
                true
            }
            None => false,
        }
    }

    /// Tears the world down. Instances are destroyed without running any entry point.
    pub fn destroy(mut self, scripts: &mut ScriptContext) {
        let count = self.len();
        for slot in &mut self.slots {
            if let Some(instance) = slot.instance.take() {
                instance.destroy(scripts);
            }
        }
        self.order.clear();
        self.by_instance.clear();
        self.tombstones = 0;
        debug!("[world] destroyed with {count} instance(s)");
    }

    pub fn handle_of(&self, instance: Instance) -> Option<InstanceHandle> {
        self.by_instance.get(&instance).copied()
    }

    pub fn get(&self, handle: InstanceHandle) -> Option<&ScriptInstance> {
        match self.slots.get(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation => slot.instance.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, handle: InstanceHandle) -> Option<&mut ScriptInstance> {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation => slot.instance.as_mut(),
            _ => None,
        }
    }

    pub fn contains(&self, handle: InstanceHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn phase(&self, instance: Instance) -> Option<InstancePhase> {
        self.handle_of(instance).and_then(|handle| self.get(handle)).map(ScriptInstance::phase)
    }

    pub fn state(&self, scripts: &ScriptContext, instance: Instance) -> Option<Value> {
        self.handle_of(instance).and_then(|handle| self.get(handle)).and_then(|i| i.state(scripts))
    }

    /// Live instances in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = (InstanceHandle, &ScriptInstance)> + '_ {
        self.order.iter().filter_map(move |handle| self.get(*handle).map(|instance| (*handle, instance)))
    }

    /// Failures collected by dispatch since the last call.
    pub fn take_failures(&mut self) -> Vec<ScriptFailure> {
        std::mem::take(&mut self.failures)
    }

    pub(crate) fn order_len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn order_at(&self, position: usize) -> Option<InstanceHandle> {
        self.order.get(position).copied()
    }

    pub(crate) fn begin_pass(&mut self) {
        if self.pass_depth == 0 && self.tombstones > 0 {
            self.compact();
        }
        self.pass_depth += 1;
    }

    pub(crate) fn end_pass(&mut self) {
        self.pass_depth = self.pass_depth.saturating_sub(1);
        if self.pass_depth == 0 && self.tombstones > 0 {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let slots = &self.slots;
        self.order.retain(|handle| match slots.get(handle.index as usize) {
            Some(slot) => slot.generation == handle.generation && slot.instance.is_some(),
            None => false,
        });
        self.tombstones = 0;
    }
}

impl Drop for ScriptWorld {
    fn drop(&mut self) {
        if !self.by_instance.is_empty() {
            warn!(
                "[world] dropped with {} live instance(s); their VM references stay allocated \
                 until the context shuts down",
                self.by_instance.len()
            );
        }
    }
}
