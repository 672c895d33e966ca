pub mod api;
pub mod cli;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod input;
pub mod instance;
pub mod script_harness;
pub mod scripts;
pub mod vm;
pub mod world;

/// Identity of the game object that owns a script instance.
pub type Instance = bevy_ecs::entity::Entity;

pub use config::{RuntimeConfig, RuntimeConfigOverrides};
pub use context::{ScriptContext, ScriptHandle};
pub use dispatch::{InstanceHost, NullHost, PassReport, UpdateContext};
pub use error::ScriptError;
pub use events::ScriptMessage;
pub use input::InputAction;
pub use instance::{InstancePhase, ScriptFailure, ScriptInstance, ScriptResult};
pub use scripts::{EntryPoint, Script};
pub use world::{InstanceHandle, ScriptWorld};
