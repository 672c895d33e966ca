use std::fmt;

use rhai::Dynamic;
use serde_json::Value;

use crate::api::entity_to_bits;
use crate::Instance;

/// Message delivered to one instance's `on_message`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMessage {
    pub id: String,
    pub payload: Value,
    pub sender: Option<Instance>,
}

impl ScriptMessage {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self { id: id.into(), payload, sender: None }
    }

    pub fn from_sender(mut self, sender: Instance) -> Self {
        self.sender = Some(sender);
        self
    }

    /// `(message_id, message, sender)` as passed to `on_message`. The sender is `()` when unset.
    pub(crate) fn to_args(&self) -> Result<[Dynamic; 3], String> {
        let message = rhai::serde::to_dynamic(&self.payload).map_err(|err| err.to_string())?;
        let sender = self.sender.map_or(Dynamic::UNIT, |sender| Dynamic::from(entity_to_bits(sender)));
        Ok([Dynamic::from(self.id.clone()), message, sender])
    }
}

impl fmt::Display for ScriptMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sender {
            Some(sender) => write!(f, "{} {} from {:?}", self.id, self.payload, sender),
            None => write!(f, "{} {}", self.id, self.payload),
        }
    }
}
