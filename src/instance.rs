use std::fmt;
use std::rc::Rc;

use log::debug;
use rhai::{Dynamic, Map};
use serde_json::Value;

use crate::api::GameObject;
use crate::context::{Invocation, ScriptContext, ScriptHandle};
use crate::error::ScriptError;
use crate::events::ScriptMessage;
use crate::input::InputAction;
use crate::scripts::EntryPoint;
use crate::vm::{RefValue, ScriptVm, VmRef};
use crate::Instance;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    Uninitialized,
    Initialized,
    Running,
    Finalized,
}

impl InstancePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            InstancePhase::Uninitialized => "uninitialized",
            InstancePhase::Initialized => "initialized",
            InstancePhase::Running => "running",
            InstancePhase::Finalized => "finalized",
        }
    }
}

/// Runtime fault raised inside an entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFailure {
    pub instance: Instance,
    pub entry: EntryPoint,
    pub filename: String,
    pub message: String,
}

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} failed for {:?}: {}", self.filename, self.entry.name(), self.instance, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptResult {
    Ok,
    NoFunction,
    Failed(ScriptFailure),
}

impl ScriptResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ScriptResult::Ok)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ScriptResult::Failed(_))
    }

    pub fn failure(&self) -> Option<&ScriptFailure> {
        match self {
            ScriptResult::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// A script bound to one owning instance, with the instance's private state table.
#[derive(Debug)]
pub struct ScriptInstance {
    script: ScriptHandle,
    instance: Instance,
    anchor: VmRef,
    state: VmRef,
    phase: InstancePhase,
}

impl ScriptInstance {
    pub fn create(scripts: &mut ScriptContext, script: ScriptHandle, instance: Instance) -> Result<Self, ScriptError> {
        scripts.retain_script(script)?;
        let object = GameObject::new(instance, Rc::clone(scripts.vm().commands()));
        match acquire_refs(scripts.vm_mut(), object) {
            Ok((anchor, state)) => {
                debug!("[script] created instance for {instance:?}");
                Ok(Self { script, instance, anchor, state, phase: InstancePhase::Uninitialized })
            }
            Err(err) => {
                scripts.release_script(script);
                Err(err)
            }
        }
    }

    /// Releases the anchor and the state table. No entry point runs.
    ///
    /// Consuming `self` is what moves the instance into [`InstancePhase::Finalized`]; there is no
    /// handle left to observe afterwards.
    pub fn destroy(self, scripts: &mut ScriptContext) {
        debug!("[script] destroying instance for {:?}", self.instance);
        let vm = scripts.vm_mut();
        vm.release(self.anchor);
        vm.release(self.state);
        scripts.release_script(self.script);
    }

    pub fn instance(&self) -> Instance {
        self.instance
    }

    pub fn script(&self) -> ScriptHandle {
        self.script
    }

    pub fn phase(&self) -> InstancePhase {
        self.phase
    }

    /// JSON snapshot of the state table, `None` if it holds values JSON cannot express.
    pub fn state(&self, scripts: &ScriptContext) -> Option<Value> {
        let state = scripts.vm().value(&self.state)?;
        match rhai::serde::from_dynamic::<Value>(state) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!("[script] state of {:?} is not representable as JSON: {err}", self.instance);
                None
            }
        }
    }

    pub fn run_init(&mut self, scripts: &mut ScriptContext) -> ScriptResult {
        let (result, _) = self.invoke(scripts, EntryPoint::Init, Vec::new());
        if self.phase == InstancePhase::Uninitialized {
            self.phase = InstancePhase::Initialized;
        }
        result
    }

    pub fn run_update(&mut self, scripts: &mut ScriptContext, dt: f32) -> ScriptResult {
        let (result, _) = self.invoke(scripts, EntryPoint::Update, vec![Dynamic::from_float(dt as rhai::FLOAT)]);
        if self.phase == InstancePhase::Initialized {
            self.phase = InstancePhase::Running;
        }
        result
    }

    pub fn run_on_message(&mut self, scripts: &mut ScriptContext, message: &ScriptMessage) -> ScriptResult {
        match message.to_args() {
            Ok(args) => self.invoke(scripts, EntryPoint::OnMessage, args.into()).0,
            Err(message) => ScriptResult::Failed(self.failure(scripts, EntryPoint::OnMessage, message)),
        }
    }

    /// Also reports whether the handler consumed the input by returning `true`.
    pub fn run_on_input(&mut self, scripts: &mut ScriptContext, action: &InputAction) -> (ScriptResult, bool) {
        let (result, returned) = self.invoke(scripts, EntryPoint::OnInput, action.to_args().into());
        let consumed = returned.and_then(|value| value.as_bool().ok()).unwrap_or(false);
        (result, consumed)
    }

    fn invoke(
        &self,
        scripts: &mut ScriptContext,
        entry: EntryPoint,
        args: Vec<Dynamic>,
    ) -> (ScriptResult, Option<Dynamic>) {
        let Some(object) = scripts.vm().value(&self.anchor).cloned() else {
            let failure = self.failure(scripts, entry, "instance anchor is no longer live".to_string());
            return (ScriptResult::Failed(failure), None);
        };
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(object);
        call_args.extend(args);
        match scripts.invoke(self.script, entry, &self.state, call_args) {
            Invocation::Returned(value) => (ScriptResult::Ok, Some(value)),
            Invocation::NoFunction => (ScriptResult::NoFunction, None),
            Invocation::Failed { filename, message } => {
                let failure = ScriptFailure { instance: self.instance, entry, filename, message };
                (ScriptResult::Failed(failure), None)
            }
        }
    }

    fn failure(&self, scripts: &ScriptContext, entry: EntryPoint, message: String) -> ScriptFailure {
        let filename = scripts.script(self.script).map(|s| s.filename().to_string()).unwrap_or_default();
        ScriptFailure { instance: self.instance, entry, filename, message }
    }
}

fn acquire_refs(vm: &mut ScriptVm, object: GameObject) -> Result<(VmRef, VmRef), ScriptError> {
    let mut batch = vm.batch();
    let anchor = batch.acquire(RefValue::Value(Dynamic::from(object)))?;
    let state = batch.acquire(RefValue::Value(Dynamic::from_map(Map::new())))?;
    batch.commit();
    Ok((anchor, state))
}
