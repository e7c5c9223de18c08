//! Ambient variables seeded into every run.

use crate::domain::Variables;

/// Source of variables every checkpoint run starts with
pub trait AmbientEnvironment: Send + Sync {
    fn current_ambient_variables(&self) -> Variables;
}

/// Process environment variables, optionally restricted to a prefix.
///
/// With a prefix, the prefix is stripped from the exposed names:
/// `STEPWISE_VAR_REGION=eu` becomes `REGION=eu`.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnvironment {
    prefix: Option<String>,
}

impl ProcessEnvironment {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }
}

impl AmbientEnvironment for ProcessEnvironment {
    fn current_ambient_variables(&self) -> Variables {
        std::env::vars()
            .filter_map(|(key, value)| match &self.prefix {
                Some(prefix) => key
                    .strip_prefix(prefix.as_str())
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_string(), value)),
                None => Some((key, value)),
            })
            .collect()
    }
}

/// Fixed variable map
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment {
    vars: Variables,
}

impl StaticEnvironment {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl AmbientEnvironment for StaticEnvironment {
    fn current_ambient_variables(&self) -> Variables {
        self.vars.clone()
    }
}
