use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bevy_ecs::entity::Entity;
use log::info;
use rhai::{Engine, INT};

use crate::Instance;

/// World mutation requested by a script; applied by the dispatcher once the requesting entry point returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldCommand {
    Create { requested_by: Instance, script: String },
    Destroy { requested_by: Instance, target: Instance },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLog {
    pub instance: Instance,
    pub message: String,
}

/// Log lines kept for `take_logs` when the owner never sets a capacity.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct CommandQueue {
    commands: Vec<WorldCommand>,
    logs: VecDeque<ScriptLog>,
    log_capacity: usize,
    dropped_logs: u64,
}

pub type CommandQueueHandle = Rc<RefCell<CommandQueue>>;

impl Default for CommandQueue {
    fn default() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl CommandQueue {
    /// Keeps at most `log_capacity` captured log lines, oldest dropped first. Zero disables capture.
    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self { commands: Vec::new(), logs: VecDeque::new(), log_capacity, dropped_logs: 0 }
    }

    pub fn push(&mut self, command: WorldCommand) {
        self.commands.push(command);
    }

    pub fn drain_commands(&mut self) -> Vec<WorldCommand> {
        self.commands.drain(..).collect()
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    pub fn push_log(&mut self, log: ScriptLog) {
        if self.log_capacity == 0 {
            self.dropped_logs += 1;
            return;
        }
        while self.logs.len() >= self.log_capacity {
            self.logs.pop_front();
            self.dropped_logs += 1;
        }
        self.logs.push_back(log);
    }

    pub fn set_log_capacity(&mut self, log_capacity: usize) {
        self.log_capacity = log_capacity;
        while self.logs.len() > log_capacity {
            self.logs.pop_front();
            self.dropped_logs += 1;
        }
    }

    pub fn log_capacity(&self) -> usize {
        self.log_capacity
    }

    /// Log lines evicted or refused because the capture buffer was full.
    pub fn dropped_logs(&self) -> u64 {
        self.dropped_logs
    }

    pub fn take_logs(&mut self) -> Vec<ScriptLog> {
        self.logs.drain(..).collect()
    }
}

/// Script-side wrapper of an owning instance. Passed as the first argument of every entry point.
#[derive(Clone)]
pub struct GameObject {
    instance: Instance,
    queue: CommandQueueHandle,
}

impl GameObject {
    pub fn new(instance: Instance, queue: CommandQueueHandle) -> Self {
        Self { instance, queue }
    }

    pub fn instance(&self) -> Instance {
        self.instance
    }

    fn id(&mut self) -> INT {
        entity_to_bits(self.instance)
    }

    fn log(&mut self, message: &str) {
        info!("[script] {:?}: {message}", self.instance);
        self.queue.borrow_mut().push_log(ScriptLog { instance: self.instance, message: message.to_string() });
    }

    fn create(&mut self, script: &str) {
        self.queue
            .borrow_mut()
            .push(WorldCommand::Create { requested_by: self.instance, script: script.to_string() });
    }

    fn destroy(&mut self, id: INT) -> bool {
        match entity_from_bits(id) {
            Some(target) => {
                self.queue.borrow_mut().push(WorldCommand::Destroy { requested_by: self.instance, target });
                true
            }
            None => false,
        }
    }

    fn destroy_self(&mut self) {
        let target = self.instance;
        self.queue.borrow_mut().push(WorldCommand::Destroy { requested_by: target, target });
    }
}

pub fn entity_to_bits(entity: Entity) -> INT {
    entity.to_bits() as INT
}

pub fn entity_from_bits(bits: INT) -> Option<Entity> {
    if bits < 0 {
        None
    } else {
        Entity::try_from_bits(bits as u64).ok()
    }
}

pub(crate) fn register_api(engine: &mut Engine) {
    engine.register_type_with_name::<GameObject>("GameObject");
    engine.register_fn("id", GameObject::id);
    engine.register_fn("log", GameObject::log);
    engine.register_fn("create", GameObject::create);
    engine.register_fn("destroy", GameObject::destroy);
    engine.register_fn("destroy_self", GameObject::destroy_self);
}
