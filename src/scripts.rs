use log::{debug, info, warn};

use crate::error::ScriptError;
use crate::vm::{CompiledUnit, RefValue, ScriptVm, VmRef};

/// Lifecycle and event hooks a script may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryPoint {
    Init,
    Update,
    OnMessage,
    OnInput,
}

impl EntryPoint {
    pub const COUNT: usize = 4;
    pub const ALL: [EntryPoint; EntryPoint::COUNT] =
        [EntryPoint::Init, EntryPoint::Update, EntryPoint::OnMessage, EntryPoint::OnInput];

    /// Function name looked up in the compiled unit.
    pub fn name(self) -> &'static str {
        match self {
            EntryPoint::Init => "init",
            EntryPoint::Update => "update",
            EntryPoint::OnMessage => "on_message",
            EntryPoint::OnInput => "on_input",
        }
    }

    /// Arguments supplied on dispatch, game object first:
    /// `init(obj)`, `update(obj, dt)`, `on_message(obj, message_id, message, sender)`,
    /// `on_input(obj, action_id, action)`.
    pub fn max_args(self) -> usize {
        match self {
            EntryPoint::Init => 1,
            EntryPoint::Update => 2,
            EntryPoint::OnMessage => 4,
            EntryPoint::OnInput => 3,
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
struct EntryTable {
    slots: [Option<VmRef>; EntryPoint::COUNT],
}

impl EntryTable {
    fn link(vm: &mut ScriptVm, unit: &CompiledUnit) -> Result<Self, ScriptError> {
        let mut table = EntryTable::default();
        let mut batch = vm.batch();
        for entry in EntryPoint::ALL {
            if let Some(callable) = unit.resolve(entry.name(), entry.max_args())? {
                table.slots[entry.slot()] = Some(batch.acquire(RefValue::Callable(callable))?);
            }
        }
        batch.commit();
        Ok(table)
    }

    fn release(self, vm: &mut ScriptVm) {
        for reference in self.slots.into_iter().flatten() {
            vm.release(reference);
        }
    }
}

/// Compiled behaviour shared by any number of script instances.
#[derive(Debug)]
pub struct Script {
    filename: String,
    entries: EntryTable,
}

impl Script {
    pub fn load(vm: &mut ScriptVm, source: &[u8], filename: &str) -> Result<Self, ScriptError> {
        let unit = vm.compile(source, filename)?;
        let entries = EntryTable::link(vm, &unit)?;
        let script = Self { filename: filename.to_string(), entries };
        debug!("[script] loaded {filename} with entry points {:?}", script.entry_points());
        Ok(script)
    }

    /// Recompiles in place. On failure nothing changes and the previous entry points stay live.
    pub fn reload(&mut self, vm: &mut ScriptVm, source: &[u8], filename: &str) -> Result<(), ScriptError> {
        let linked = vm.compile(source, filename).and_then(|unit| EntryTable::link(vm, &unit));
        let entries = match linked {
            Ok(entries) => entries,
            Err(err) => {
                warn!("[script] reload of {filename} failed, keeping previous version: {err}");
                return Err(err);
            }
        };
        let previous = std::mem::replace(&mut self.entries, entries);
        previous.release(vm);
        self.filename = filename.to_string();
        info!("[script] reloaded {filename}");
        Ok(())
    }

    /// Releases every entry-point reference. Instances created from this script must be gone.
    pub fn delete(self, vm: &mut ScriptVm) {
        debug!("[script] deleting {}", self.filename);
        self.entries.release(vm);
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn entry(&self, entry: EntryPoint) -> Option<&VmRef> {
        self.entries.slots[entry.slot()].as_ref()
    }

    pub fn has_entry(&self, entry: EntryPoint) -> bool {
        self.entry(entry).is_some()
    }

    pub fn entry_points(&self) -> Vec<EntryPoint> {
        EntryPoint::ALL.into_iter().filter(|entry| self.has_entry(*entry)).collect()
    }
}
