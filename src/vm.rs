//! Adapter over the embedded Rhai engine.
//!
//! Everything the runtime keeps inside the VM (entry-point callables, instance anchors and
//! state tables) lives in a reference table owned by [`ScriptVm`]. Native records only hold
//! [`VmRef`] handles into that table. A `VmRef` is not `Clone`, and releasing it consumes it,
//! so every acquired reference can be released at most once.

use std::fmt;
use std::rc::Rc;

use log::{debug, error, info};
use rhai::{CallFnOptions, Dynamic, Engine, Scope, AST};

use crate::api::{register_api, CommandQueueHandle};
use crate::config::VmConfig;
use crate::error::ScriptError;

/// Diagnostic label for log lines. Taken from the address of the VM's command queue, so it is
/// distinct among live VMs without any process-wide counter; a later VM may reuse it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(usize);

impl VmId {
    fn of(commands: &CommandQueueHandle) -> Self {
        Self(Rc::as_ptr(commands) as usize)
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm@{:x}", self.0)
    }
}

/// Owned handle to a value held in the VM reference table.
#[must_use = "dropping a VmRef without releasing it leaks the VM value"]
#[derive(Debug, PartialEq, Eq)]
pub struct VmRef {
    index: u32,
    generation: u32,
}

impl VmRef {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// A script function resolved from a compiled unit.
#[derive(Clone)]
pub struct Callable {
    unit: Rc<AST>,
    name: String,
    arity: usize,
}

impl Callable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").field("name", &self.name).field("arity", &self.arity).finish()
    }
}

#[derive(Debug, Clone)]
pub enum RefValue {
    Callable(Callable),
    Value(Dynamic),
}

pub struct CompiledUnit {
    filename: String,
    ast: Rc<AST>,
}

impl CompiledUnit {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Looks up a function exported by the unit.
    ///
    /// Returns `Ok(None)` when no function has that name. Overloads are allowed; the one taking
    /// the most parameters within `max_args` wins. A name that only exists with more than
    /// `max_args` parameters can never be called and is reported as a link error.
    pub fn resolve(&self, name: &str, max_args: usize) -> Result<Option<Callable>, ScriptError> {
        let mut best: Option<usize> = None;
        let mut too_wide: Option<usize> = None;
        for function in self.ast.iter_functions().filter(|f| f.name == name) {
            let arity = function.params.len();
            if arity <= max_args {
                best = Some(best.map_or(arity, |prev| prev.max(arity)));
            } else {
                too_wide = Some(arity);
            }
        }
        match (best, too_wide) {
            (Some(arity), _) => {
                Ok(Some(Callable { unit: Rc::clone(&self.ast), name: name.to_string(), arity }))
            }
            (None, Some(arity)) => Err(ScriptError::compile(
                &self.filename,
                format!("entry point '{name}' declares {arity} parameters; at most {max_args} are supplied"),
            )),
            (None, None) => Ok(None),
        }
    }
}

enum RefSlot {
    Vacant { generation: u32 },
    Occupied { generation: u32, value: RefValue },
}

/// Acquire/release counters, for leak checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefStats {
    pub acquired: u64,
    pub released: u64,
}

impl RefStats {
    pub fn live(&self) -> u64 {
        self.acquired - self.released
    }
}

pub struct ScriptVm {
    id: VmId,
    engine: Engine,
    slots: Vec<RefSlot>,
    free: Vec<u32>,
    live: usize,
    max_references: usize,
    stats: RefStats,
    commands: CommandQueueHandle,
}

impl ScriptVm {
    pub fn new(config: &VmConfig) -> Self {
        let commands = CommandQueueHandle::default();
        let id = VmId::of(&commands);
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        engine.set_max_operations(config.max_operations);
        engine.set_max_call_levels(config.max_call_levels);
        engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth);
        engine.on_print(move |text| info!("[script] {id}: {text}"));
        engine.on_debug(move |text, source, pos| debug!("[script] {id}: {} {pos:?}: {text}", source.unwrap_or("")));
        register_api(&mut engine);
        debug!("[vm] created {id} (max references {})", config.max_references);
        Self {
            id,
            engine,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            max_references: config.max_references,
            stats: RefStats::default(),
            commands,
        }
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn stats(&self) -> RefStats {
        self.stats
    }

    pub fn live_references(&self) -> usize {
        self.live
    }

    /// Queue shared with every `GameObject` anchored in this VM.
    pub fn commands(&self) -> &CommandQueueHandle {
        &self.commands
    }

    pub fn compile(&self, source: &[u8], filename: &str) -> Result<CompiledUnit, ScriptError> {
        let text = std::str::from_utf8(source)
            .map_err(|err| ScriptError::compile(filename, format!("source is not valid UTF-8: {err}")))?;
        let mut ast = self.engine.compile(text).map_err(|err| ScriptError::compile(filename, err.to_string()))?;
        ast.set_source(filename);
        Ok(CompiledUnit { filename: filename.to_string(), ast: Rc::new(ast) })
    }

    pub fn acquire(&mut self, value: RefValue) -> Result<VmRef, ScriptError> {
        if self.live >= self.max_references {
            return Err(ScriptError::ResourceExhaustion { capacity: self.max_references });
        }
        let reference = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let generation = slot_generation(slot);
                *slot = RefSlot::Occupied { generation, value };
                VmRef { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(RefSlot::Occupied { generation: 0, value });
                VmRef { index, generation: 0 }
            }
        };
        self.live += 1;
        self.stats.acquired += 1;
        Ok(reference)
    }

    pub fn release(&mut self, reference: VmRef) {
        self.release_slot(reference.index, reference.generation);
    }

    fn release_slot(&mut self, index: u32, generation: u32) {
        let occupied = matches!(
            self.slots.get(index as usize),
            Some(RefSlot::Occupied { generation: current, .. }) if *current == generation
        );
        if !occupied {
            error!("[vm] {}: release of stale reference {index}/{generation}", self.id);
            debug_assert!(false, "stale VM reference released");
            return;
        }
        self.slots[index as usize] = RefSlot::Vacant { generation: generation.wrapping_add(1) };
        self.free.push(index);
        self.live -= 1;
        self.stats.released += 1;
    }

    /// Starts a scoped acquisition; see [`RefBatch`].
    pub fn batch(&mut self) -> RefBatch<'_> {
        RefBatch { vm: self, pending: Vec::new() }
    }

    pub fn value(&self, reference: &VmRef) -> Option<&Dynamic> {
        match self.get(reference)? {
            RefValue::Value(value) => Some(value),
            RefValue::Callable(_) => None,
        }
    }

    pub fn callable(&self, reference: &VmRef) -> Option<&Callable> {
        match self.get(reference)? {
            RefValue::Callable(callable) => Some(callable),
            RefValue::Value(_) => None,
        }
    }

    /// Calls `function` with the value behind `receiver` bound as `this`.
    ///
    /// Arguments beyond the callable's declared parameter count are dropped. Errors come back as
    /// the VM's formatted message.
    pub fn call(&mut self, function: &VmRef, receiver: &VmRef, mut args: Vec<Dynamic>) -> Result<Dynamic, String> {
        let callable = match self.callable(function) {
            Some(callable) => callable.clone(),
            None => return Err(format!("{}: stale function reference {}", self.id, function.index)),
        };
        let mut this = match self.get_mut(receiver) {
            Some(RefValue::Value(value)) => std::mem::replace(value, Dynamic::UNIT),
            _ => return Err(format!("{}: stale receiver reference {}", self.id, receiver.index)),
        };
        args.truncate(callable.arity);

        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true).bind_this_ptr(&mut this);
        let result =
            self.engine.call_fn_with_options::<Dynamic>(options, &mut scope, &callable.unit, &callable.name, args);

        if let Some(RefValue::Value(value)) = self.get_mut(receiver) {
            *value = this;
        }
        result.map_err(|err| err.to_string())
    }

    fn get(&self, reference: &VmRef) -> Option<&RefValue> {
        match self.slots.get(reference.index as usize)? {
            RefSlot::Occupied { generation, value } if *generation == reference.generation => Some(value),
            _ => None,
        }
    }

    fn get_mut(&mut self, reference: &VmRef) -> Option<&mut RefValue> {
        match self.slots.get_mut(reference.index as usize)? {
            RefSlot::Occupied { generation, value } if *generation == reference.generation => Some(value),
            _ => None,
        }
    }
}

fn slot_generation(slot: &RefSlot) -> u32 {
    match slot {
        RefSlot::Vacant { generation } | RefSlot::Occupied { generation, .. } => *generation,
    }
}

/// Scoped acquisition of several references.
///
/// References acquired through the batch are released again when it is dropped, unless
/// [`RefBatch::commit`] ran first. Early returns with `?` between acquisitions therefore leave
/// the reference table as it was.
pub struct RefBatch<'vm> {
    vm: &'vm mut ScriptVm,
    pending: Vec<(u32, u32)>,
}

impl RefBatch<'_> {
    pub fn acquire(&mut self, value: RefValue) -> Result<VmRef, ScriptError> {
        let reference = self.vm.acquire(value)?;
        self.pending.push((reference.index, reference.generation));
        Ok(reference)
    }

    pub fn commit(mut self) {
        self.pending.clear();
    }
}

impl Drop for RefBatch<'_> {
    fn drop(&mut self) {
        for (index, generation) in self.pending.drain(..) {
            self.vm.release_slot(index, generation);
        }
    }
}
