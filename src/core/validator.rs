//! Requirement validation.
//!
//! Pure evaluation of postconditions against an `ExecuteRecipe`. Used after
//! every step and as the final gate of a checkpoint.

use regex::Regex;

use crate::domain::{ExecuteRecipe, Requirement, RequirementKind};

/// Outcome of validating a requirement list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub ok: bool,

    /// Descriptor of the first failing requirement
    pub failure: Option<String>,
}

impl Validation {
    fn passed() -> Self {
        Self {
            ok: true,
            failure: None,
        }
    }

    fn failed(requirement: &Requirement) -> Self {
        Self {
            ok: false,
            failure: Some(requirement.descriptor()),
        }
    }
}

/// Check every requirement in order, stopping at the first failure.
///
/// An empty list always passes.
pub fn validate(result: &ExecuteRecipe, requirements: &[Requirement]) -> Validation {
    for requirement in requirements {
        if !check(result, requirement) {
            return Validation::failed(requirement);
        }
    }
    Validation::passed()
}

/// Evaluate a single requirement
pub fn check(result: &ExecuteRecipe, requirement: &Requirement) -> bool {
    let expected = requirement.represented_value.as_str();
    let value = requirement
        .key
        .as_ref()
        .and_then(|key| result.vars.get(key));

    match requirement.kind {
        RequirementKind::ReturnValue => expected
            .trim()
            .parse::<i64>()
            .map_or(false, |code| result.code == code),
        RequirementKind::Contains => value.map_or(false, |v| v.contains(expected)),
        RequirementKind::MatchCaseSensitive => value.map_or(false, |v| v == expected),
        RequirementKind::MatchCaseInsensitive => {
            value.map_or(false, |v| v.to_lowercase() == expected.to_lowercase())
        }
        RequirementKind::MatchRegularExpression => {
            value.map_or(false, |v| full_match(v, expected))
        }
        RequirementKind::MatchNumberValue => value.map_or(false, |v| {
            match (v.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
                (Ok(actual), Ok(wanted)) => actual == wanted,
                _ => false,
            }
        }),
    }
}

/// Whole-value regex match; a partial hit is a failure
fn full_match(value: &str, pattern: &str) -> bool {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => re.is_match(value),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "Invalid requirement pattern");
            false
        }
    }
}
