//! Execution environment and results.
//!
//! An `ExecuteEnvironment` is threaded by value through the steps of a run,
//! accumulating the variables each step emits. Every execution unit (a
//! sandboxed script, a script group, a whole checkpoint) reports back an
//! `ExecuteRecipe`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Variable map shared by environments and results
pub type Variables = BTreeMap<String, String>;

/// Variable injected on failure: the numeric exit code as a string
pub const EXEC_EXIT_CODE: &str = "ExecExitCode";

/// Variable injected on failure: the failure message
pub const EXEC_ERROR: &str = "ExecError";

/// Variable carrying the effective target host into a script
pub const EXEC_TARGET: &str = "ExecTarget";

/// Stable exit codes.
///
/// Zero is success. Negative values are reserved for engine-level failures.
pub mod exit_code {
    pub const SUCCESS: i64 = 0;

    /// Any aborted checkpoint run
    pub const ABORTED: i64 = -1;

    pub const SANDBOX_INIT: i64 = -10;
    pub const SANDBOX_ADMISSION_TIMEOUT: i64 = -11;
    pub const SANDBOX_EXECUTION_TIMEOUT: i64 = -12;
    pub const SANDBOX_MALFORMED_RESULT: i64 = -13;
    pub const SANDBOX_EXCEPTION: i64 = -14;
    pub const SANDBOX_SCRIPT_ERROR: i64 = -15;

    /// Referenced script or group could not be resolved
    pub const RESOLUTION_FAILED: i64 = -20;

    /// Run stopped by the caller's terminate predicate
    pub const TERMINATED: i64 = -21;
}

/// Mutable key/value environment handed to each execution unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteEnvironment {
    /// Variables visible to the script
    #[serde(default)]
    pub payload: Variables,

    /// Target host identifier (opaque, resolved externally)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ExecuteEnvironment {
    /// Create an environment from a payload with no target
    pub fn new(payload: Variables) -> Self {
        Self {
            payload,
            target: None,
        }
    }

    /// Same environment pointed at another target
    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    /// Insert or overwrite a variable
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.payload.insert(key.into(), value.into());
    }

    /// Merge variables in, later values win
    pub fn merge(&mut self, vars: &Variables) {
        for (key, value) in vars {
            self.payload.insert(key.clone(), value.clone());
        }
    }
}

/// Result of one execution unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRecipe {
    /// Exit code (0 = success, negative = engine abort)
    pub code: i64,

    /// Captured output text
    #[serde(default)]
    pub output: String,

    /// Final variable map
    #[serde(default)]
    pub vars: Variables,

    /// Failure description, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteRecipe {
    /// Successful result carrying variables
    pub fn success(vars: Variables) -> Self {
        Self {
            code: exit_code::SUCCESS,
            output: String::new(),
            vars,
            error: None,
        }
    }

    /// Failed result with the `ExecExitCode`/`ExecError` pair injected
    pub fn failure(code: i64, error: impl Into<String>) -> Self {
        let error = error.into();
        let mut vars = Variables::new();
        vars.insert(EXEC_EXIT_CODE.to_string(), code.to_string());
        vars.insert(EXEC_ERROR.to_string(), error.clone());
        Self {
            code,
            output: String::new(),
            vars,
            error: Some(error),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Whether the unit ended with a non-negative code and no error
    pub fn is_success(&self) -> bool {
        self.code >= 0 && self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_last_write_wins() {
        let mut env = ExecuteEnvironment::default();
        env.set("host", "alpha");
        env.set("keep", "1");

        let mut incoming = Variables::new();
        incoming.insert("host".to_string(), "beta".to_string());
        incoming.insert("new".to_string(), "x".to_string());
        env.merge(&incoming);

        assert_eq!(env.payload.get("host"), Some(&"beta".to_string()));
        assert_eq!(env.payload.get("keep"), Some(&"1".to_string()));
        assert_eq!(env.payload.get("new"), Some(&"x".to_string()));
    }

    #[test]
    fn test_failure_injects_exec_vars() {
        let recipe = ExecuteRecipe::failure(exit_code::SANDBOX_EXECUTION_TIMEOUT, "timed out");

        assert!(!recipe.is_success());
        assert_eq!(recipe.vars.get(EXEC_EXIT_CODE), Some(&"-12".to_string()));
        assert_eq!(recipe.vars.get(EXEC_ERROR), Some(&"timed out".to_string()));
        assert_eq!(recipe.error.as_deref(), Some("timed out"));
    }
}
