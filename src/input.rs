use glam::Vec2;
use rhai::{Dynamic, Map};
use serde::{Deserialize, Serialize};

/// Input already mapped to a named action by the platform layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAction {
    pub action: String,
    #[serde(default)]
    pub value: f32,
    #[serde(default)]
    pub pressed: bool,
    #[serde(default)]
    pub released: bool,
    #[serde(default)]
    pub repeated: bool,
    #[serde(default)]
    pub position: Option<Vec2>,
}

impl InputAction {
    pub fn pressed(action: impl Into<String>) -> Self {
        Self { action: action.into(), value: 1.0, pressed: true, released: false, repeated: false, position: None }
    }

    pub fn released(action: impl Into<String>) -> Self {
        Self { action: action.into(), value: 0.0, pressed: false, released: true, repeated: false, position: None }
    }

    pub fn at(mut self, position: Vec2) -> Self {
        self.position = Some(position);
        self
    }

    /// `(action_id, action)` as passed to `on_input`.
    pub(crate) fn to_args(&self) -> [Dynamic; 2] {
        let mut action = Map::new();
        action.insert("value".into(), Dynamic::from_float(self.value as rhai::FLOAT));
        action.insert("pressed".into(), Dynamic::from_bool(self.pressed));
        action.insert("released".into(), Dynamic::from_bool(self.released));
        action.insert("repeated".into(), Dynamic::from_bool(self.repeated));
        if let Some(position) = self.position {
            action.insert("x".into(), Dynamic::from_float(position.x as rhai::FLOAT));
            action.insert("y".into(), Dynamic::from_float(position.y as rhai::FLOAT));
        }
        [Dynamic::from(self.action.clone()), Dynamic::from_map(action)]
    }
}
