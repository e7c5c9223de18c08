//! Checkpoint definitions and loading.
//!
//! A checkpoint is an ordered list of steps, each pointing at a reusable
//! script (or script group) by `(name, section)`, plus the requirements that
//! gate every step and the run as a whole. Checkpoints can be authored in
//! YAML and are persisted as JSON by the checkpoint registry.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::requirement::{DefinitionError, Requirement};

/// Replace anything that is unsafe in a file name.
///
/// Path separators, reserved characters and control characters become `_`;
/// empty, `.` and `..` become `_`.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// When a checkpoint should fire on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Every N seconds (`represented_value` = seconds)
    TimeInterval,

    /// At a wall-clock time (`represented_value` = `HH:MM`, local time)
    TimeSchedule,

    /// Only when started explicitly
    Manual,
}

/// Trigger attached to a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,

    #[serde(default)]
    pub represented_value: String,
}

impl Default for Trigger {
    fn default() -> Self {
        Self {
            kind: TriggerKind::Manual,
            represented_value: String::new(),
        }
    }
}

impl Trigger {
    pub fn interval(seconds: u64) -> Self {
        Self {
            kind: TriggerKind::TimeInterval,
            represented_value: seconds.to_string(),
        }
    }

    pub fn schedule(hhmm: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::TimeSchedule,
            represented_value: hhmm.into(),
        }
    }

    /// Interval for `TimeInterval` triggers
    pub fn interval_duration(&self) -> Result<Duration, DefinitionError> {
        let seconds: u64 = self.represented_value.trim().parse().map_err(|_| {
            DefinitionError::InvalidTrigger {
                value: self.represented_value.clone(),
                reason: "expected a number of seconds".to_string(),
            }
        })?;
        if seconds == 0 {
            return Err(DefinitionError::InvalidTrigger {
                value: self.represented_value.clone(),
                reason: "interval must be positive".to_string(),
            });
        }
        Ok(Duration::from_secs(seconds))
    }

    /// Time of day for `TimeSchedule` triggers
    pub fn schedule_time(&self) -> Result<NaiveTime, DefinitionError> {
        NaiveTime::parse_from_str(self.represented_value.trim(), "%H:%M").map_err(|e| {
            DefinitionError::InvalidTrigger {
                value: self.represented_value.clone(),
                reason: e.to_string(),
            }
        })
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        match self.kind {
            TriggerKind::TimeInterval => self.interval_duration().map(|_| ()),
            TriggerKind::TimeSchedule => self.schedule_time().map(|_| ()),
            TriggerKind::Manual => Ok(()),
        }
    }
}

/// What a step points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A single reusable script
    ScriptRef,

    /// A reusable group of scripts run in order
    ScriptGroupRef,
}

/// A single step in a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,

    /// Referenced script or group name
    pub name: String,

    /// Referenced script or group section
    pub section: String,

    /// Host override (falls back to the checkpoint's server)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Checked after this step runs
    #[serde(default)]
    pub requirement: Vec<Requirement>,
}

impl Step {
    pub fn script(name: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            kind: StepKind::ScriptRef,
            name: name.into(),
            section: section.into(),
            target: None,
            requirement: Vec::new(),
        }
    }

    pub fn group(name: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            kind: StepKind::ScriptGroupRef,
            ..Self::script(name, section)
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirement.push(requirement);
        self
    }

    /// Effective host: the step's own target, else the checkpoint's server
    pub fn effective_target(&self, server: Option<&str>) -> Option<String> {
        self.target.clone().or_else(|| server.map(str::to_string))
    }
}

/// A complete checkpoint definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,

    pub section: String,

    /// Default target host for all steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    #[serde(default)]
    pub trigger: Trigger,

    /// Ordered list of steps to execute
    pub steps: Vec<Step>,

    /// Gate applied after the last step
    #[serde(default)]
    pub final_requirement: Vec<Requirement>,
}

impl Checkpoint {
    /// Create a checkpoint; name and section are sanitized
    pub fn new(name: &str, section: &str, steps: Vec<Step>) -> Self {
        Self {
            name: sanitize_component(name),
            section: sanitize_component(section),
            server: None,
            trigger: Trigger::default(),
            steps,
            final_requirement: Vec::new(),
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_final_requirement(mut self, requirement: Requirement) -> Self {
        self.final_requirement.push(requirement);
        self
    }

    /// Load a checkpoint from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a checkpoint from YAML content; name and section are sanitized
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut checkpoint: Self =
            serde_yaml::from_str(content).context("Failed to parse checkpoint YAML")?;
        checkpoint.name = sanitize_component(&checkpoint.name);
        checkpoint.section = sanitize_component(&checkpoint.section);
        Ok(checkpoint)
    }

    /// Validate the checkpoint definition
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() || self.name == "_" {
            return Err(DefinitionError::EmptyName);
        }

        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.name.clone()));
        }

        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(DefinitionError::EmptyReference { index });
            }
            for requirement in &step.requirement {
                requirement.check_definition()?;
            }
        }

        for requirement in &self.final_requirement {
            requirement.check_definition()?;
        }

        self.trigger.validate()
    }

    /// `section/name`, used in logs
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.section, self.name)
    }
}
