use std::{collections::HashMap, env};

/// Access to environment variables for configuration loading.
///
/// Both services read their configuration once through this
/// capability: production code sources the process environment,
/// tests inject a map-backed implementation so configuration paths
/// can be exercised without mutating global state.
pub trait EnvVars: Send + Sync {
    /// Returns the value of `key`, or `None` when the variable is
    /// unset or not valid unicode.
    fn get(&self, key: &str) -> Option<String>;

    /// Reads a boolean toggle such as `FEATURE_FAST_LANE` or
    /// `COORDINATOR_STANDBY`; `"true"` and `"1"` enable it, anything
    /// else (including an unset variable) leaves it off.
    fn flag(&self, key: &str) -> bool {
        matches!(self.get(key).as_deref(), Some("true") | Some("1"))
    }
}

/// Environment variables sourced from the current process.
pub struct ProcessEnvVars {}

impl ProcessEnvVars {
    pub fn new() -> Self {
        ProcessEnvVars {}
    }
}

impl Default for ProcessEnvVars {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvVars for ProcessEnvVars {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

/// Environment variables sourced from an in-memory map,
/// used to construct configuration in tests without touching
/// the process environment.
#[derive(Clone, Default)]
pub struct MapEnvVars {
    vars: HashMap<String, String>,
}

impl MapEnvVars {
    pub fn new(vars: HashMap<String, String>) -> Self {
        MapEnvVars { vars }
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }
}

impl EnvVars for MapEnvVars {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}
