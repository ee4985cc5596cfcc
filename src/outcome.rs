// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Step ledger — what each backup/restore step actually did
//!
//! Steps never abort a run. Their results are recorded here and written out
//! with the run summary instead.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum StepOutcome {
    Succeeded,
    Skipped(String),
    Failed(String),
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Skipped(reason) => write!(f, "skipped: {}", reason),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLedger {
    pub steps: Vec<StepRecord>,
}

impl RunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: impl Into<String>, outcome: StepOutcome) {
        let step = step.into();
        match &outcome {
            StepOutcome::Failed(reason) => warn!("    {} failed: {}", step, reason),
            StepOutcome::Skipped(reason) => info!("    {} skipped: {}", step, reason),
            StepOutcome::Succeeded => {}
        }
        self.steps.push(StepRecord { step, outcome });
    }

    /// Record a fallible step, mapping any error to `Failed`
    pub fn track<E: std::fmt::Display>(&mut self, step: impl Into<String>, result: Result<(), E>) -> bool {
        let ok = result.is_ok();
        let outcome = match result {
            Ok(()) => StepOutcome::Succeeded,
            Err(e) => StepOutcome::Failed(e.to_string()),
        };
        self.record(step, outcome);
        ok
    }

    pub fn failures(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed(_)))
            .count()
    }
}
