//! Postconditions checked against an execution result.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors in a checkpoint, step or requirement definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("Requirement '{kind}' needs a key")]
    MissingKey { kind: RequirementKind },

    #[error("Requirement '{kind}' expects a number, got '{value}'")]
    NotANumber { kind: RequirementKind, value: String },

    #[error("Invalid regular expression '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Checkpoint name cannot be empty")]
    EmptyName,

    #[error("Checkpoint '{0}' must have at least one step")]
    NoSteps(String),

    #[error("Step {index} references a script with an empty name")]
    EmptyReference { index: usize },

    #[error("Invalid trigger value '{value}': {reason}")]
    InvalidTrigger { value: String, reason: String },
}

/// Closed set of requirement kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequirementKind {
    Contains,
    ReturnValue,
    MatchCaseSensitive,
    MatchCaseInsensitive,
    MatchRegularExpression,
    MatchNumberValue,
}

impl RequirementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::ReturnValue => "returnValue",
            Self::MatchCaseSensitive => "matchCaseSensitive",
            Self::MatchCaseInsensitive => "matchCaseInsensitive",
            Self::MatchRegularExpression => "matchRegularExpression",
            Self::MatchNumberValue => "matchNumberValue",
        }
    }

    /// Whether this kind inspects a variable (everything but `returnValue`)
    pub fn needs_key(&self) -> bool {
        !matches!(self, Self::ReturnValue)
    }
}

impl fmt::Display for RequirementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single postcondition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub kind: RequirementKind,

    /// Variable to inspect (ignored by `returnValue`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Expected string, number or pattern
    #[serde(default)]
    pub represented_value: String,
}

impl Requirement {
    /// Build a requirement, rejecting malformed definitions
    pub fn new(
        kind: RequirementKind,
        key: Option<String>,
        represented_value: impl Into<String>,
    ) -> Result<Self, DefinitionError> {
        let requirement = Self {
            kind,
            key,
            represented_value: represented_value.into(),
        };
        requirement.check_definition()?;
        Ok(requirement)
    }

    /// Static check of the definition; requirements loaded from disk skip `new`
    pub fn check_definition(&self) -> Result<(), DefinitionError> {
        if self.kind.needs_key() && self.key.as_deref().map_or(true, str::is_empty) {
            return Err(DefinitionError::MissingKey { kind: self.kind });
        }

        match self.kind {
            RequirementKind::ReturnValue => {
                if self.represented_value.trim().parse::<i64>().is_err() {
                    return Err(DefinitionError::NotANumber {
                        kind: self.kind,
                        value: self.represented_value.clone(),
                    });
                }
            }
            RequirementKind::MatchNumberValue => {
                if self.represented_value.trim().parse::<f64>().is_err() {
                    return Err(DefinitionError::NotANumber {
                        kind: self.kind,
                        value: self.represented_value.clone(),
                    });
                }
            }
            RequirementKind::MatchRegularExpression => {
                if let Err(e) = Regex::new(&self.represented_value) {
                    return Err(DefinitionError::InvalidPattern {
                        pattern: self.represented_value.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Human-readable descriptor: `[key]: kind -> expected`
    pub fn descriptor(&self) -> String {
        format!(
            "[{}]: {} -> {}",
            self.key.as_deref().unwrap_or_default(),
            self.kind,
            self.represented_value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_camel_case() {
        let json = serde_json::to_string(&RequirementKind::MatchRegularExpression).unwrap();
        assert_eq!(json, "\"matchRegularExpression\"");

        let kind: RequirementKind = serde_json::from_str("\"returnValue\"").unwrap();
        assert_eq!(kind, RequirementKind::ReturnValue);
    }

    #[test]
    fn test_key_required_except_return_value() {
        let missing = Requirement::new(RequirementKind::Contains, None, "ok");
        assert!(matches!(missing, Err(DefinitionError::MissingKey { .. })));

        let ret = Requirement::new(RequirementKind::ReturnValue, None, "0");
        assert!(ret.is_ok());
    }

    #[test]
    fn test_definition_rejects_bad_values() {
        let bad_int = Requirement::new(RequirementKind::ReturnValue, None, "zero");
        assert!(matches!(bad_int, Err(DefinitionError::NotANumber { .. })));

        let bad_regex = Requirement::new(
            RequirementKind::MatchRegularExpression,
            Some("out".to_string()),
            "([a-z",
        );
        assert!(matches!(bad_regex, Err(DefinitionError::InvalidPattern { .. })));
    }

    #[test]
    fn test_descriptor_format() {
        let req = Requirement::new(
            RequirementKind::MatchCaseSensitive,
            Some("result".to_string()),
            "OK",
        )
        .unwrap();
        assert_eq!(req.descriptor(), "[result]: matchCaseSensitive -> OK");

        let ret = Requirement::new(RequirementKind::ReturnValue, None, "0").unwrap();
        assert_eq!(ret.descriptor(), "[]: returnValue -> 0");
    }
}
