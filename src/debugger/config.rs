use serde::Deserialize;
use serde_json::Value;

/// Debugger options, read from `launch`/`attach` request arguments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebuggerConfig {
    /// Just-My-Code: ignore breakpoints and steps in non-user code.
    pub just_my_code: bool,
    /// Steppers skip properties and operators.
    pub enable_step_filtering: bool,
    /// Stop at managed entry point.
    pub stop_at_entry: bool,
    /// Use native unwinder for unmanaged parts of a stack.
    pub interop_debugging: bool,
    /// Additional directories for symbol lookup.
    pub symbol_search_paths: Vec<String>,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            just_my_code: true,
            enable_step_filtering: true,
            stop_at_entry: false,
            interop_debugging: false,
            symbol_search_paths: vec![],
        }
    }
}

impl DebuggerConfig {
    /// Build configuration from launch arguments, unknown or malformed options are ignored.
    pub fn from_launch_args(arguments: &Value) -> Self {
        match serde_json::from_value::<DebuggerConfig>(arguments.clone()) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!(target: "debugger", "malformed launch options, use defaults: {e}");
                DebuggerConfig::default()
            }
        }
    }
}
