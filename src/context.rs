use std::collections::HashMap;

use log::{debug, warn};
use rhai::Dynamic;

use crate::api::{ScriptLog, WorldCommand};
use crate::config::RuntimeConfig;
use crate::error::ScriptError;
use crate::scripts::{EntryPoint, Script};
use crate::vm::{RefStats, ScriptVm, VmRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptHandle {
    index: u32,
    generation: u32,
}

/// Raw outcome of calling one entry point.
pub(crate) enum Invocation {
    Returned(Dynamic),
    NoFunction,
    Failed { filename: String, message: String },
}

struct ScriptEntry {
    generation: u32,
    script: Option<Script>,
    users: usize,
}

/// Per-simulation-scope script state: the VM adapter plus every loaded script.
///
/// Created when a scope starts and passed explicitly into every dispatch call. The context is
/// not `Send`; each thread driving worlds builds its own.
pub struct ScriptContext {
    vm: ScriptVm,
    log_failures: bool,
    scripts: Vec<ScriptEntry>,
    free: Vec<u32>,
    names: HashMap<String, ScriptHandle>,
}

impl ScriptContext {
    pub fn new(config: &RuntimeConfig) -> Self {
        let vm = ScriptVm::new(&config.vm);
        vm.commands().borrow_mut().set_log_capacity(config.dispatch.log_capacity);
        Self {
            vm,
            log_failures: config.dispatch.log_failures,
            scripts: Vec::new(),
            free: Vec::new(),
            names: HashMap::new(),
        }
    }

    pub fn vm(&self) -> &ScriptVm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut ScriptVm {
        &mut self.vm
    }

    pub fn log_failures(&self) -> bool {
        self.log_failures
    }

    pub fn load_script(&mut self, source: &[u8], filename: &str) -> Result<ScriptHandle, ScriptError> {
        if self.names.contains_key(filename) {
            return Err(ScriptError::AlreadyLoaded(filename.to_string()));
        }
        let script = Script::load(&mut self.vm, source, filename)?;
        let handle = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.scripts[index as usize];
                entry.script = Some(script);
                entry.users = 0;
                ScriptHandle { index, generation: entry.generation }
            }
            None => {
                let index = self.scripts.len() as u32;
                self.scripts.push(ScriptEntry { generation: 0, script: Some(script), users: 0 });
                ScriptHandle { index, generation: 0 }
            }
        };
        self.names.insert(filename.to_string(), handle);
        Ok(handle)
    }

    /// Recompiles the script behind `handle`, optionally under a new filename.
    ///
    /// A filename already registered to another script is refused with `AlreadyLoaded`.
    pub fn reload_script(&mut self, handle: ScriptHandle, source: &[u8], filename: &str) -> Result<(), ScriptError> {
        if matches!(self.names.get(filename), Some(owner) if *owner != handle) {
            return Err(ScriptError::AlreadyLoaded(filename.to_string()));
        }
        let entry = match self.scripts.get_mut(handle.index as usize) {
            Some(entry) if entry.generation == handle.generation => entry,
            _ => return Err(ScriptError::UnknownScript),
        };
        let script = entry.script.as_mut().ok_or(ScriptError::UnknownScript)?;
        let previous_name = script.filename().to_string();
        script.reload(&mut self.vm, source, filename)?;
        if previous_name != filename {
            self.names.remove(&previous_name);
            self.names.insert(filename.to_string(), handle);
        }
        Ok(())
    }

    /// Hot-reload notification: the source behind `filename` changed.
    ///
    /// Returns `Ok(false)` when no script is registered under that name.
    pub fn source_changed(&mut self, filename: &str, source: &[u8]) -> Result<bool, ScriptError> {
        let Some(handle) = self.find_script(filename) else {
            debug!("[script] change notification for unloaded {filename}, ignoring");
            return Ok(false);
        };
        self.reload_script(handle, source, filename)?;
        Ok(true)
    }

    pub fn delete_script(&mut self, handle: ScriptHandle) -> Result<(), ScriptError> {
        let entry = match self.scripts.get_mut(handle.index as usize) {
            Some(entry) if entry.generation == handle.generation && entry.script.is_some() => entry,
            _ => return Err(ScriptError::UnknownScript),
        };
        if entry.users > 0 {
            let filename = entry.script.as_ref().map(|s| s.filename().to_string()).unwrap_or_default();
            return Err(ScriptError::ScriptInUse { filename, users: entry.users });
        }
        if let Some(script) = entry.script.take() {
            self.names.remove(script.filename());
            script.delete(&mut self.vm);
        }
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(())
    }

    pub fn script(&self, handle: ScriptHandle) -> Option<&Script> {
        match self.scripts.get(handle.index as usize) {
            Some(entry) if entry.generation == handle.generation => entry.script.as_ref(),
            _ => None,
        }
    }

    pub fn find_script(&self, filename: &str) -> Option<ScriptHandle> {
        self.names.get(filename).copied()
    }

    /// Number of live instances created from `handle`.
    pub fn script_users(&self, handle: ScriptHandle) -> usize {
        match self.scripts.get(handle.index as usize) {
            Some(entry) if entry.generation == handle.generation => entry.users,
            _ => 0,
        }
    }

    /// World commands queued by the last entry-point call and not yet applied.
    ///
    /// Dispatch applies these itself. Callers driving `ScriptInstance` entry points directly
    /// collect them here; the next entry-point call discards whatever is left.
    pub fn take_commands(&mut self) -> Vec<WorldCommand> {
        self.vm.commands().borrow_mut().drain_commands()
    }

    /// Script `log` lines captured since the last call, at most `dispatch.log_capacity` of them.
    pub fn take_logs(&mut self) -> Vec<ScriptLog> {
        self.vm.commands().borrow_mut().take_logs()
    }

    /// Deletes every script regardless of users and returns the final reference counters.
    pub fn shutdown(mut self) -> RefStats {
        for entry in &mut self.scripts {
            if let Some(script) = entry.script.take() {
                if entry.users > 0 {
                    warn!("[script] shutting down with {} live instance(s) of {}", entry.users, script.filename());
                }
                script.delete(&mut self.vm);
            }
        }
        self.names.clear();
        let stats = self.vm.stats();
        if stats.live() > 0 {
            warn!("[vm] {}: {} reference(s) still live at shutdown", self.vm.id(), stats.live());
        }
        stats
    }

    pub(crate) fn invoke(
        &mut self,
        handle: ScriptHandle,
        entry: EntryPoint,
        receiver: &VmRef,
        args: Vec<Dynamic>,
    ) -> Invocation {
        let script = match self.scripts.get(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation => slot.script.as_ref(),
            _ => None,
        };
        let Some(script) = script else {
            return Invocation::Failed { filename: String::new(), message: "script was deleted".to_string() };
        };
        let stale = self.vm.commands().borrow_mut().drain_commands();
        if !stale.is_empty() {
            warn!(
                "[script] discarding {} world command(s) left by an earlier call; collect them with take_commands",
                stale.len()
            );
        }
        let Some(function) = script.entry(entry) else {
            return Invocation::NoFunction;
        };
        match self.vm.call(function, receiver, args) {
            Ok(value) => Invocation::Returned(value),
            Err(message) => Invocation::Failed { filename: script.filename().to_string(), message },
        }
    }

    pub(crate) fn retain_script(&mut self, handle: ScriptHandle) -> Result<(), ScriptError> {
        match self.scripts.get_mut(handle.index as usize) {
            Some(entry) if entry.generation == handle.generation && entry.script.is_some() => {
                entry.users += 1;
                Ok(())
            }
            _ => Err(ScriptError::UnknownScript),
        }
    }

    pub(crate) fn release_script(&mut self, handle: ScriptHandle) {
        if let Some(entry) = self.scripts.get_mut(handle.index as usize) {
            if entry.generation == handle.generation {
                entry.users = entry.users.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_are_found_by_filename() {
        let mut ctx = ScriptContext::new(&RuntimeConfig::default());
        let handle = ctx.load_script(b"fn init() { }", "a.rhai").expect("load");
        assert_eq!(ctx.find_script("a.rhai"), Some(handle));
        assert_eq!(
            ctx.load_script(b"fn init() { }", "a.rhai").unwrap_err(),
            ScriptError::AlreadyLoaded("a.rhai".to_string())
        );
    }

    #[test]
    fn deleted_handles_go_stale() {
        let mut ctx = ScriptContext::new(&RuntimeConfig::default());
        let handle = ctx.load_script(b"fn init() { }", "a.rhai").expect("load");
        ctx.delete_script(handle).expect("delete");
        assert!(ctx.script(handle).is_none());
        assert_eq!(ctx.delete_script(handle).unwrap_err(), ScriptError::UnknownScript);

        let reused = ctx.load_script(b"fn update() { }", "b.rhai").expect("load");
        assert_ne!(reused, handle, "slot reuse must bump the generation");
        assert_eq!(ctx.vm().live_references(), 1);
    }

    #[test]
    fn script_in_use_cannot_be_deleted() {
        let mut ctx = ScriptContext::new(&RuntimeConfig::default());
        let handle = ctx.load_script(b"fn init() { }", "used.rhai").expect("load");
        ctx.retain_script(handle).expect("retain");
        assert_eq!(
            ctx.delete_script(handle).unwrap_err(),
            ScriptError::ScriptInUse { filename: "used.rhai".to_string(), users: 1 }
        );
        ctx.release_script(handle);
        ctx.delete_script(handle).expect("delete after release");
    }

    #[test]
    fn reload_cannot_take_another_scripts_filename() {
        let mut ctx = ScriptContext::new(&RuntimeConfig::default());
        let a = ctx.load_script(b"fn init() { }", "a.rhai").expect("load a");
        let b = ctx.load_script(b"fn update() { }", "b.rhai").expect("load b");
        assert_eq!(
            ctx.reload_script(a, b"fn on_message() { }", "b.rhai").unwrap_err(),
            ScriptError::AlreadyLoaded("b.rhai".to_string())
        );
        assert_eq!(ctx.find_script("a.rhai"), Some(a));
        assert_eq!(ctx.find_script("b.rhai"), Some(b));
        assert_eq!(ctx.script(a).map(|s| s.entry_points()), Some(vec![EntryPoint::Init]));

        assert!(ctx.source_changed("b.rhai", b"fn update() { } fn on_input() { }").expect("reload b"));
        assert_eq!(ctx.script(a).map(|s| s.entry_points()), Some(vec![EntryPoint::Init]));
        assert_eq!(ctx.script(b).map(|s| s.entry_points()), Some(vec![EntryPoint::Update, EntryPoint::OnInput]));

        ctx.reload_script(a, b"fn init() { }", "renamed.rhai").expect("rename to a free filename");
        assert_eq!(ctx.find_script("renamed.rhai"), Some(a));
        assert_eq!(ctx.find_script("a.rhai"), None);
    }

    #[test]
    fn change_notification_reloads_by_filename() {
        let mut ctx = ScriptContext::new(&RuntimeConfig::default());
        let handle = ctx.load_script(b"fn init() { }", "hot.rhai").expect("load");
        assert!(ctx.source_changed("hot.rhai", b"fn init() { } fn update() { }").expect("reload"));
        assert_eq!(ctx.script(handle).map(|s| s.entry_points().len()), Some(2));
        assert!(!ctx.source_changed("cold.rhai", b"").expect("unknown file"));
        assert!(ctx.source_changed("hot.rhai", b"fn (").is_err());
        assert_eq!(ctx.shutdown().live(), 0);
    }
}
