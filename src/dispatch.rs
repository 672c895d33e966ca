//! Per-frame dispatch of entry points into a [`ScriptWorld`].
//!
//! One failing instance never stops a pass: failures are logged, collected on the world and
//! the walk moves on. Script-issued world commands are applied right after the entry point
//! that queued them returns. Instances created that way join the order behind the pass
//! snapshot and are first visited by the next update; destroyed ones are skipped for the rest
//! of the pass, including any input still being routed.

use bevy_ecs::world::World;
use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::api::WorldCommand;
use crate::context::ScriptContext;
use crate::error::ScriptError;
use crate::events::ScriptMessage;
use crate::input::InputAction;
use crate::instance::{InstancePhase, ScriptFailure, ScriptResult};
use crate::scripts::EntryPoint;
use crate::world::{InstanceHandle, ScriptWorld};
use crate::Instance;

/// Entity side of the simulation, used when scripts create or destroy game objects.
pub trait InstanceHost {
    /// Allocates a new owning instance. `None` when the host cannot create instances.
    fn spawn_instance(&mut self) -> Option<Instance>;

    fn despawn_instance(&mut self, instance: Instance);
}

impl InstanceHost for World {
    fn spawn_instance(&mut self) -> Option<Instance> {
        Some(self.spawn_empty().id())
    }

    fn despawn_instance(&mut self, instance: Instance) {
        self.despawn(instance);
    }
}

/// Host for worlds whose entities are managed elsewhere; script-side creation is refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl InstanceHost for NullHost {
    fn spawn_instance(&mut self) -> Option<Instance> {
        None
    }

    fn despawn_instance(&mut self, _instance: Instance) {}
}

pub struct UpdateContext<'a> {
    pub dt: f32,
    pub host: &'a mut dyn InstanceHost,
}

impl<'a> UpdateContext<'a> {
    pub fn new(dt: f32, host: &'a mut dyn InstanceHost) -> Self {
        Self { dt, host }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub visited: usize,
    pub initialized: usize,
    pub failed: usize,
    pub created: usize,
    pub destroyed: usize,
}

impl ScriptWorld {
    /// Runs one update pass over the instances registered when the pass starts.
    pub fn update(&mut self, scripts: &mut ScriptContext, ctx: &mut UpdateContext<'_>) -> PassReport {
        let mut report = PassReport::default();
        self.begin_pass();
        let end = self.order_len();
        for position in 0..end {
            let Some(handle) = self.order_at(position) else { break };
            if !self.contains(handle) {
                continue;
            }
            report.visited += 1;
            self.ensure_initialized(scripts, ctx.host, handle, &mut report);

            let Some(instance) = self.get_mut(handle) else { continue };
            let owner = instance.instance();
            let result = instance.run_update(scripts, ctx.dt);
            self.record(scripts, result, &mut report);
            self.apply_commands(scripts, ctx.host, owner, EntryPoint::Update, &mut report);
        }
        self.end_pass();
        trace!("[world] update pass {report:?}");
        report
    }

    /// Delivers `message` to the script instance owned by `target`.
    pub fn dispatch_message(
        &mut self,
        scripts: &mut ScriptContext,
        host: &mut dyn InstanceHost,
        target: Instance,
        message: &ScriptMessage,
    ) -> Result<ScriptResult, ScriptError> {
        let handle = self.handle_of(target).ok_or(ScriptError::Routing { target })?;
        let mut report = PassReport::default();
        self.ensure_initialized(scripts, host, handle, &mut report);
        let instance = self.get_mut(handle).ok_or(ScriptError::Routing { target })?;
        let result = instance.run_on_message(scripts, message);
        self.record(scripts, result.clone(), &mut report);
        self.apply_commands(scripts, host, target, EntryPoint::OnMessage, &mut report);
        Ok(result)
    }

    /// Offers `action` to each instance in order until one consumes it.
    pub fn dispatch_input(
        &mut self,
        scripts: &mut ScriptContext,
        host: &mut dyn InstanceHost,
        action: &InputAction,
    ) -> bool {
        let mut report = PassReport::default();
        let mut consumed = false;
        self.begin_pass();
        let end = self.order_len();
        for position in 0..end {
            let Some(handle) = self.order_at(position) else { break };
            if !self.contains(handle) {
                continue;
            }
            self.ensure_initialized(scripts, host, handle, &mut report);
            let Some(instance) = self.get_mut(handle) else { continue };
            let owner = instance.instance();
            let (result, taken) = instance.run_on_input(scripts, action);
            self.record(scripts, result, &mut report);
            self.apply_commands(scripts, host, owner, EntryPoint::OnInput, &mut report);
            if taken {
                trace!("[world] input '{}' consumed by {owner:?}", action.action);
                consumed = true;
                break;
            }
        }
        self.end_pass();
        consumed
    }

    /// Runs `init` the first time an instance takes part in any dispatch, so every entry
    /// point sees the state `init` prepared. The instance may be gone afterwards if `init`
    /// destroyed it.
    fn ensure_initialized(
        &mut self,
        scripts: &mut ScriptContext,
        host: &mut dyn InstanceHost,
        handle: InstanceHandle,
        report: &mut PassReport,
    ) {
        let Some(instance) = self.get_mut(handle) else { return };
        if instance.phase() != InstancePhase::Uninitialized {
            return;
        }
        let owner = instance.instance();
        let result = instance.run_init(scripts);
        report.initialized += 1;
        self.record(scripts, result, report);
        self.apply_commands(scripts, host, owner, EntryPoint::Init, report);
    }

    fn record(&mut self, scripts: &ScriptContext, result: ScriptResult, report: &mut PassReport) {
        if let ScriptResult::Failed(failure) = result {
            self.push_failure(scripts, failure, report);
        }
    }

    fn push_failure(&mut self, scripts: &ScriptContext, failure: ScriptFailure, report: &mut PassReport) {
        if scripts.log_failures() {
            warn!("[script] {failure}");
        }
        report.failed += 1;
        self.failures.push(failure);
    }

    fn apply_commands(
        &mut self,
        scripts: &mut ScriptContext,
        host: &mut dyn InstanceHost,
        requester: Instance,
        entry: EntryPoint,
        report: &mut PassReport,
    ) {
        let commands = scripts.vm().commands().borrow_mut().drain_commands();
        if commands.is_empty() {
            return;
        }
        let filename = self.script_filename(scripts, requester);
        for command in commands {
            let outcome = match command {
                WorldCommand::Create { script, .. } => self.create_from_script(scripts, host, &script, report),
                WorldCommand::Destroy { target, .. } => match self.handle_of(target) {
                    Some(handle) => {
                        self.destroy_instance(scripts, handle);
                        host.despawn_instance(target);
                        report.destroyed += 1;
                        Ok(())
                    }
                    None => Err(format!("destroy: {target:?} has no script instance")),
                },
            };
            if let Err(message) = outcome {
                let failure = ScriptFailure { instance: requester, entry, filename: filename.clone(), message };
                self.push_failure(scripts, failure, report);
            }
        }
    }

    fn create_from_script(
        &mut self,
        scripts: &mut ScriptContext,
        host: &mut dyn InstanceHost,
        script: &str,
        report: &mut PassReport,
    ) -> Result<(), String> {
        let handle = scripts.find_script(script).ok_or_else(|| format!("create: unknown script '{script}'"))?;
        let owner = host.spawn_instance().ok_or_else(|| "create: host cannot spawn instances".to_string())?;
        match self.create_instance(scripts, handle, owner) {
            Ok(_) => {
                report.created += 1;
                Ok(())
            }
            Err(err) => {
                host.despawn_instance(owner);
                Err(format!("create: {err}"))
            }
        }
    }

    fn script_filename(&self, scripts: &ScriptContext, instance: Instance) -> String {
        self.handle_of(instance)
            .and_then(|handle| self.get(handle))
            .and_then(|instance| scripts.script(instance.script()))
            .map(|script| script.filename().to_string())
            .unwrap_or_default()
    }
}
