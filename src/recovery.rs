//! Bounded-retry error recovery for units of work.
//!
//! A unit moves `running -> retrying -> (running | error)`. Each failure
//! appends an `error_recovery` step until the retry budget is spent, then a
//! single `error_final` step marks the unit terminal.

use crate::config::RecoveryConfig;
use crate::error::Error;
use crate::store::WorkUnitStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Running,
    Retrying,
    Completed,
    Error,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ErrorRecovery,
    ErrorFinal,
}

/// What went wrong in one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    /// Error and its causes, outermost first
    pub trace: Vec<String>,
    pub context: Option<serde_json::Value>,
}

impl ErrorDetails {
    pub fn capture(error: &Error, context: Option<serde_json::Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            trace: error.trace(),
            context,
        }
    }
}

/// One entry in a unit's append-only history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStep {
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub timestamp: DateTime<Utc>,
    pub retry_count: usize,
    pub error_details: ErrorDetails,
    /// Seconds before the next attempt (retry steps only)
    pub delay: Option<u64>,
}

/// A session or job run tracked through recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub status: UnitStatus,
    pub steps: Vec<SessionStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: UnitStatus::Running,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn retry_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.step_type == StepType::ErrorRecovery)
            .count()
    }

    pub fn last_error(&self) -> Option<&ErrorDetails> {
        self.steps.last().map(|s| &s.error_details)
    }
}

/// Outcome of handing a failure to the recovery manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Re-attempt after `delay`; `attempt` is the 1-based retry number
    Retry { attempt: usize, delay: Duration },
    GiveUp,
}

impl RecoveryDecision {
    pub fn will_retry(&self) -> bool {
        matches!(self, RecoveryDecision::Retry { .. })
    }
}

pub struct ErrorRecoveryManager {
    config: RecoveryConfig,
    units: Arc<dyn WorkUnitStore>,
}

impl ErrorRecoveryManager {
    pub fn new(config: RecoveryConfig, units: Arc<dyn WorkUnitStore>) -> Self {
        Self { config, units }
    }

    pub fn max_retries(&self) -> usize {
        self.config.max_retries
    }

    /// Returns true when the unit will be retried
    pub async fn handle_error(
        &self,
        unit_id: &str,
        error: &Error,
        context: Option<serde_json::Value>,
    ) -> bool {
        self.recover(unit_id, error, context).await.will_retry()
    }

    pub async fn recover(
        &self,
        unit_id: &str,
        error: &Error,
        context: Option<serde_json::Value>,
    ) -> RecoveryDecision {
        let mut unit = match self.units.load(unit_id).await {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                ::log::error!("Unit {} not found during error recovery", unit_id);
                return RecoveryDecision::GiveUp;
            }
            Err(e) => {
                ::log::error!("Error during error recovery of {}: {}", unit_id, e);
                return RecoveryDecision::GiveUp;
            }
        };

        if unit.status.is_terminal() {
            ::log::warn!(
                "Unit {} is already {:?}, not recording further errors",
                unit_id,
                unit.status
            );
            return RecoveryDecision::GiveUp;
        }

        let current_retries = unit.retry_count();
        let details = ErrorDetails::capture(error, context);
        let now = Utc::now();

        let decision = if current_retries < self.config.max_retries {
            let delay = self.config.delay_for(current_retries);
            unit.steps.push(SessionStep {
                step_type: StepType::ErrorRecovery,
                timestamp: now,
                retry_count: current_retries + 1,
                error_details: details,
                delay: Some(delay.as_secs()),
            });
            unit.status = UnitStatus::Retrying;
            RecoveryDecision::Retry {
                attempt: current_retries + 1,
                delay,
            }
        } else {
            unit.steps.push(SessionStep {
                step_type: StepType::ErrorFinal,
                timestamp: now,
                retry_count: current_retries,
                error_details: details,
                delay: None,
            });
            unit.status = UnitStatus::Error;
            RecoveryDecision::GiveUp
        };
        unit.updated_at = now;

        if let Err(e) = self.units.save(&unit).await {
            ::log::error!("Error during error recovery of {}: {}", unit_id, e);
            return RecoveryDecision::GiveUp;
        }

        ::log::error!(
            "{}",
            describe_outcome(unit_id, decision, self.config.max_retries, error)
        );
        decision
    }

    /// Mark the unit terminal without spending retries
    pub async fn record_terminal(
        &self,
        unit_id: &str,
        error: &Error,
        context: Option<serde_json::Value>,
    ) -> bool {
        let mut unit = match self.units.load(unit_id).await {
            Ok(Some(unit)) if !unit.status.is_terminal() => unit,
            Ok(_) => return false,
            Err(e) => {
                ::log::error!("Error recording failure of {}: {}", unit_id, e);
                return false;
            }
        };

        let now = Utc::now();
        unit.steps.push(SessionStep {
            step_type: StepType::ErrorFinal,
            timestamp: now,
            retry_count: unit.retry_count(),
            error_details: ErrorDetails::capture(error, context),
            delay: None,
        });
        unit.status = UnitStatus::Error;
        unit.updated_at = now;

        match self.units.save(&unit).await {
            Ok(()) => {
                ::log::warn!("Unit {} failed without retry: {}", unit_id, error);
                true
            }
            Err(e) => {
                ::log::error!("Error recording failure of {}: {}", unit_id, e);
                false
            }
        }
    }

    pub async fn mark_running(&self, unit_id: &str) -> bool {
        self.set_status(unit_id, UnitStatus::Running).await
    }

    pub async fn mark_completed(&self, unit_id: &str) -> bool {
        self.set_status(unit_id, UnitStatus::Completed).await
    }

    async fn set_status(&self, unit_id: &str, status: UnitStatus) -> bool {
        let mut unit = match self.units.load(unit_id).await {
            Ok(Some(unit)) if !unit.status.is_terminal() => unit,
            Ok(_) => return false,
            Err(e) => {
                ::log::error!("Failed to load unit {}: {}", unit_id, e);
                return false;
            }
        };
        unit.status = status;
        unit.updated_at = Utc::now();
        match self.units.save(&unit).await {
            Ok(()) => true,
            Err(e) => {
                ::log::error!("Failed to update unit {}: {}", unit_id, e);
                false
            }
        }
    }
}

fn describe_outcome(
    unit_id: &str,
    decision: RecoveryDecision,
    max_retries: usize,
    error: &Error,
) -> String {
    match decision {
        RecoveryDecision::Retry { attempt, .. } => format!(
            "Error in unit {} (retry {}/{}): {}",
            unit_id, attempt, max_retries, error
        ),
        RecoveryDecision::GiveUp => format!(
            "Giving up on unit {} after {} retries: {}",
            unit_id, max_retries, error
        ),
    }
}
