use crate::config::RuntimeConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

/// Flags shared by the runtime binaries. Tuning flags map onto [`RuntimeConfigOverrides`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config: Option<PathBuf>,
    max_operations: Option<u64>,
    max_call_levels: Option<usize>,
    max_references: Option<usize>,
    log_failures: Option<bool>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Flags take the form --name value.");
            };
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => overrides.config = Some(PathBuf::from(value)),
                "max-operations" => {
                    overrides.max_operations = Some(
                        value.parse::<u64>().with_context(|| format!("Invalid max-operations '{value}'"))?,
                    );
                }
                "max-call-levels" => {
                    overrides.max_call_levels = Some(
                        value.parse::<usize>().with_context(|| format!("Invalid max-call-levels '{value}'"))?,
                    );
                }
                "max-references" => {
                    overrides.max_references = Some(
                        value.parse::<usize>().with_context(|| format!("Invalid max-references '{value}'"))?,
                    );
                }
                "log-failures" => {
                    overrides.log_failures = Some(parse_bool_flag("log-failures", &value)?);
                }
                _ => bail!(
                    "Unknown flag '{flag}'. Supported flags: --config, --max-operations, --max-call-levels, \
                     --max-references, --log-failures."
                ),
            }
        }
        Ok(overrides)
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }

    pub fn into_config_overrides(self) -> RuntimeConfigOverrides {
        RuntimeConfigOverrides {
            max_operations: self.max_operations,
            max_call_levels: self.max_call_levels,
            max_references: self.max_references,
            log_failures: self.log_failures,
        }
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_budget_flags() {
        let args = ["app", "--max-operations", "5000", "--max-references", "128", "--log-failures", "off"];
        let overrides = CliOverrides::parse(args).expect("parse overrides").into_config_overrides();
        assert_eq!(overrides.max_operations, Some(5000));
        assert_eq!(overrides.max_references, Some(128));
        assert_eq!(overrides.log_failures, Some(false));
        assert_eq!(overrides.max_call_levels, None);
    }

    #[test]
    fn latest_flag_wins() {
        let args = ["app", "--max-call-levels", "8", "--max-call-levels", "16", "--config", "runtime.json"];
        let overrides = CliOverrides::parse(args).expect("parse overrides");
        assert_eq!(overrides.config_path(), Some(&PathBuf::from("runtime.json")));
        assert_eq!(overrides.into_config_overrides().max_call_levels, Some(16));
    }

    #[test]
    fn missing_value_errors() {
        let err = CliOverrides::parse(["app", "--max-operations"]).unwrap_err();
        assert!(err.to_string().contains("Expected a value"), "error should mention missing value");
    }

    #[test]
    fn rejects_unknown_flags() {
        let err = CliOverrides::parse(["app", "--width", "800"]).unwrap_err();
        assert!(err.to_string().contains("Unknown flag"), "unknown flags should error");
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = CliOverrides::parse(["app", "--max-references", "lots"]).unwrap_err();
        assert!(format!("{err:#}").contains("Invalid max-references"));
    }
}
