//! Attempt report
//!
//! Machine-readable account of one upgrade attempt: every transition with
//! its wall-clock time and the height last observed, plus the outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::coordinator::Phase;
use crate::error::Failure;
use crate::types::{Height, UpgradeAttempt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    pub height: Option<Height>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    InProgress,
    Succeeded,
    Failed {
        phase: Phase,
        kind: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptReport {
    pub chain_id: String,
    pub upgrade_name: String,
    pub upgrade_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<TransitionRecord>,
    pub outcome: Outcome,
    pub attempt: UpgradeAttempt,
}

impl AttemptReport {
    pub fn new(chain_id: &str, upgrade_name: &str, upgrade_version: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            upgrade_name: upgrade_name.to_string(),
            upgrade_version: upgrade_version.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            transitions: Vec::new(),
            outcome: Outcome::InProgress,
            attempt: UpgradeAttempt::default(),
        }
    }

    pub fn record_transition(&mut self, from: Phase, to: Phase, height: Option<Height>) {
        self.transitions.push(TransitionRecord {
            from,
            to,
            at: Utc::now(),
            height,
        });
    }

    pub fn record_success(&mut self, attempt: &UpgradeAttempt) {
        self.attempt = attempt.clone();
        self.outcome = Outcome::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    pub fn record_failure(&mut self, failure: &Failure, attempt: &UpgradeAttempt) {
        self.attempt = attempt.clone();
        self.outcome = Outcome::Failed {
            phase: failure.phase,
            kind: failure.error.kind().to_string(),
            message: failure.error.to_string(),
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    /// Phases reached, in order, starting from `Idle`
    pub fn phases(&self) -> Vec<Phase> {
        let mut phases = vec![Phase::Idle];
        phases.extend(self.transitions.iter().map(|t| t.to));
        phases
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterError;
    use crate::error::UpgradeError;

    #[test]
    fn test_phases_follow_transitions() {
        let mut report = AttemptReport::new("chain-a", "multiverse", "v8.0.0");
        report.record_transition(Phase::Idle, Phase::BaselineConfirmed, None);
        report.record_transition(Phase::BaselineConfirmed, Phase::ProposalSubmitted, Some(100));

        assert_eq!(
            report.phases(),
            vec![Phase::Idle, Phase::BaselineConfirmed, Phase::ProposalSubmitted]
        );
        assert_eq!(report.outcome, Outcome::InProgress);
    }

    #[test]
    fn test_failure_outcome_in_json() {
        let mut report = AttemptReport::new("chain-a", "multiverse", "v8.0.0");
        let failure = Failure {
            phase: Phase::Voted,
            error: UpgradeError::VoteError {
                voter: "validator-3".to_string(),
                source: ClusterError::Rejected("out of gas".to_string()),
            },
        };
        report.record_failure(&failure, &UpgradeAttempt::default());

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["outcome"]["result"], "failed");
        assert_eq!(json["outcome"]["phase"], "Voted");
        assert_eq!(json["outcome"]["kind"], "VoteError");
        assert!(report.finished_at.is_some());
        assert!(!report.succeeded());
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let mut report = AttemptReport::new("chain-a", "multiverse", "v8.0.0");
        report.record_success(&UpgradeAttempt::default());
        report.write_to(&path).unwrap();

        let loaded: AttemptReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, report);
    }
}
