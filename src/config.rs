use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::api::DEFAULT_LOG_CAPACITY;

#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    /// Operation budget per entry-point call. Zero disables the budget.
    #[serde(default = "VmConfig::default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "VmConfig::default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "VmConfig::default_max_expr_depth")]
    pub max_expr_depth: usize,
    /// Upper bound on live VM references (entry points, instance anchors and state tables).
    #[serde(default = "VmConfig::default_max_references")]
    pub max_references: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "DispatchConfig::default_log_failures")]
    pub log_failures: bool,
    /// Script `log` lines buffered for `take_logs`; the oldest are dropped past this. Zero disables capture.
    #[serde(default = "DispatchConfig::default_log_capacity")]
    pub log_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigOverrides {
    pub max_operations: Option<u64>,
    pub max_call_levels: Option<usize>,
    pub max_references: Option<usize>,
    pub log_failures: Option<bool>,
}

impl VmConfig {
    const fn default_max_operations() -> u64 {
        1_000_000
    }

    const fn default_max_call_levels() -> usize {
        64
    }

    const fn default_max_expr_depth() -> usize {
        64
    }

    const fn default_max_references() -> usize {
        65_536
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_operations: Self::default_max_operations(),
            max_call_levels: Self::default_max_call_levels(),
            max_expr_depth: Self::default_max_expr_depth(),
            max_references: Self::default_max_references(),
        }
    }
}

impl DispatchConfig {
    const fn default_log_failures() -> bool {
        true
    }

    const fn default_log_capacity() -> usize {
        DEFAULT_LOG_CAPACITY
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { log_failures: Self::default_log_failures(), log_capacity: Self::default_log_capacity() }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("[config] load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &RuntimeConfigOverrides) {
        if let Some(max_operations) = overrides.max_operations {
            self.vm.max_operations = max_operations;
        }
        if let Some(max_call_levels) = overrides.max_call_levels {
            self.vm.max_call_levels = max_call_levels;
        }
        if let Some(max_references) = overrides.max_references {
            self.vm.max_references = max_references;
        }
        if let Some(log_failures) = overrides.log_failures {
            self.dispatch.log_failures = log_failures;
        }
    }
}

impl RuntimeConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.max_operations.is_none()
            && self.max_call_levels.is_none()
            && self.max_references.is_none()
            && self.log_failures.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.max_operations.is_some() {
            fields.push("max_operations");
        }
        if self.max_call_levels.is_some() {
            fields.push("max_call_levels");
        }
        if self.max_references.is_some() {
            fields.push("max_references");
        }
        if self.log_failures.is_some() {
            fields.push("log_failures");
        }
        fields
    }
}
