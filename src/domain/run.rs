//! Run state for a single checkpoint execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::recipe::exit_code;

/// Why a run stopped early
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum AbortReason {
    #[error("Execution environment must not carry a target host; checkpoints resolve hosts themselves")]
    TargetPreassigned,

    #[error("Run terminated before step {step_index}")]
    Terminated { step_index: usize },

    #[error("Step {step_index}: failed to resolve '{section}/{name}'")]
    ResolutionFailed {
        step_index: usize,
        name: String,
        section: String,
    },

    #[error("Step {step_index}: negative exit code {code}{}", detail_suffix(.detail))]
    NegativeExitCode {
        step_index: usize,
        code: i64,
        detail: Option<String>,
    },

    #[error("Step {step_index}: requirement not met {descriptor}")]
    Requirement {
        step_index: usize,
        descriptor: String,
    },

    #[error("Final requirement not met {descriptor}")]
    FinalRequirement { descriptor: String },
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
}

impl AbortReason {
    /// Code the failing unit reported before the run collapsed it to -1
    pub fn original_code(&self) -> i64 {
        match self {
            Self::NegativeExitCode { code, .. } => *code,
            Self::ResolutionFailed { .. } => exit_code::RESOLUTION_FAILED,
            Self::Terminated { .. } => exit_code::TERMINATED,
            _ => exit_code::ABORTED,
        }
    }
}

/// State of a checkpoint run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Executing the step at `step_index` (0-based)
    Running { step_index: usize },

    /// Every step and the final gate passed
    Completed,

    /// Stopped early
    Aborted { reason: AbortReason },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running { step_index: 0 }
    }
}

/// Bookkeeping for one execution of a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,

    /// `section/name` of the checkpoint
    pub checkpoint: String,

    pub state: RunState,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Steps that finished and passed their requirements
    pub steps_completed: usize,
}

impl Run {
    pub fn new(checkpoint: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            checkpoint,
            state: RunState::default(),
            started_at: Utc::now(),
            completed_at: None,
            steps_completed: 0,
        }
    }

    /// Move to the given step
    pub fn enter_step(&mut self, step_index: usize) {
        self.state = RunState::Running { step_index };
    }

    /// Record that the current step passed
    pub fn step_passed(&mut self) {
        self.steps_completed += 1;
    }

    pub fn complete(&mut self) {
        self.state = RunState::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn abort(&mut self, reason: AbortReason) {
        self.state = RunState::Aborted { reason };
        self.completed_at = Some(Utc::now());
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running { .. })
    }

    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match &self.state {
            RunState::Aborted { reason } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_transitions() {
        let mut run = Run::new("ops/backup".to_string());
        assert!(run.is_running());

        run.enter_step(1);
        assert_eq!(run.state, RunState::Running { step_index: 1 });

        run.step_passed();
        run.complete();
        assert!(run.is_finished());
        assert_eq!(run.steps_completed, 1);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_abort_reason_messages() {
        let reason = AbortReason::NegativeExitCode {
            step_index: 2,
            code: -12,
            detail: Some("timed out".to_string()),
        };
        assert_eq!(reason.to_string(), "Step 2: negative exit code -12: timed out");
        assert_eq!(reason.original_code(), -12);

        let final_gate = AbortReason::FinalRequirement {
            descriptor: "[result]: matchCaseSensitive -> OK".to_string(),
        };
        assert!(final_gate.to_string().contains("Final requirement"));
        assert_eq!(final_gate.original_code(), exit_code::ABORTED);
    }
}
