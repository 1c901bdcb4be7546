//! Upgrade failure taxonomy
//!
//! Every failure is fatal to the attempt. Each variant carries the values
//! needed to diagnose it without re-running (heights, statuses, node).

use std::time::Duration;

use crate::cluster::ClusterError;
use crate::coordinator::Phase;
use crate::governance::GovernanceError;
use crate::halt::HaltVerdict;
use crate::poller::PollError;
use crate::types::{Height, ProposalId, ProposalStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpgradeError {
    /// Baseline conformance failed: the environment is broken, not the upgrade
    #[error("Baseline conformance failed, test environment is broken: {source}")]
    EnvironmentBroken {
        #[source]
        source: ClusterError,
    },

    #[error("Funding test accounts failed: {source}")]
    FundingError {
        #[source]
        source: ClusterError,
    },

    #[error("Proposal submission failed: {source}")]
    SubmissionError {
        #[source]
        source: ClusterError,
    },

    #[error("Vote from {voter} failed: {source}")]
    VoteError {
        voter: String,
        #[source]
        source: ClusterError,
    },

    #[error(
        "Proposal {proposal_id} did not reach {expected} by height {deadline_height} \
         (last status {last_status:?} at height {observed_height:?})"
    )]
    StatusTimeout {
        proposal_id: ProposalId,
        expected: ProposalStatus,
        last_status: Option<ProposalStatus>,
        deadline_height: Height,
        observed_height: Option<Height>,
    },

    #[error("Proposal {proposal_id} ended as {status}")]
    ProposalRejected {
        proposal_id: ProposalId,
        status: ProposalStatus,
    },

    #[error("Halt mismatch: {verdict}")]
    HaltMismatch { verdict: HaltVerdict },

    #[error("Stopping node {node} failed: {source}")]
    StopError {
        node: String,
        #[source]
        source: ClusterError,
    },

    #[error("Switching node {node} to {version} failed: {source}")]
    SwapError {
        node: String,
        version: String,
        #[source]
        source: ClusterError,
    },

    #[error("Starting node {node} failed: {source}")]
    StartError {
        node: String,
        #[source]
        source: ClusterError,
    },

    #[error(
        "Chain stalled after upgrade: needed {required_blocks} blocks from height \
         {start_height:?} within {waited:?}, last height {last_height:?}"
    )]
    PostUpgradeStall {
        start_height: Option<Height>,
        required_blocks: u64,
        last_height: Option<Height>,
        waited: Duration,
    },

    #[error("Conformance regression after upgrade: {source}")]
    ConformanceRegression {
        #[source]
        source: ClusterError,
    },

    #[error("Cluster query failed after {attempts} attempts: {source}")]
    QueryError {
        attempts: u32,
        #[source]
        source: ClusterError,
    },

    #[error("Cancelled")]
    Cancelled,
}

impl UpgradeError {
    /// Stable taxonomy name, used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            UpgradeError::EnvironmentBroken { .. } => "EnvironmentBroken",
            UpgradeError::FundingError { .. } => "FundingError",
            UpgradeError::SubmissionError { .. } => "SubmissionError",
            UpgradeError::VoteError { .. } => "VoteError",
            UpgradeError::StatusTimeout { .. } => "StatusTimeout",
            UpgradeError::ProposalRejected { .. } => "ProposalRejected",
            UpgradeError::HaltMismatch { .. } => "HaltMismatch",
            UpgradeError::StopError { .. } => "StopError",
            UpgradeError::SwapError { .. } => "SwapError",
            UpgradeError::StartError { .. } => "StartError",
            UpgradeError::PostUpgradeStall { .. } => "PostUpgradeStall",
            UpgradeError::ConformanceRegression { .. } => "ConformanceRegression",
            UpgradeError::QueryError { .. } => "QueryError",
            UpgradeError::Cancelled => "Cancelled",
        }
    }

    /// Map a poll outcome whose timeout has no phase-specific meaning
    pub fn from_poll(err: PollError) -> Self {
        match err {
            PollError::Query { attempts, source } => UpgradeError::QueryError { attempts, source },
            PollError::Regressed { previous, observed } => UpgradeError::QueryError {
                attempts: 1,
                source: ClusterError::Rpc(format!(
                    "height went backwards: {} -> {}",
                    previous, observed
                )),
            },
            PollError::Cancelled => UpgradeError::Cancelled,
            PollError::Timeout { waited, last_height } => UpgradeError::QueryError {
                attempts: 1,
                source: ClusterError::Unreachable(format!(
                    "no height within {:?} (last {:?})",
                    waited, last_height
                )),
            },
        }
    }
}

impl From<GovernanceError> for UpgradeError {
    fn from(err: GovernanceError) -> Self {
        match err {
            GovernanceError::Submission(source) => UpgradeError::SubmissionError { source },
            GovernanceError::Vote { voter, source } => UpgradeError::VoteError { voter, source },
            GovernanceError::NoValidators => UpgradeError::VoteError {
                voter: "<none>".to_string(),
                source: ClusterError::Rejected("cluster has no validator nodes".to_string()),
            },
            GovernanceError::StatusTimeout {
                proposal_id,
                expected,
                last_status,
                deadline_height,
                observed_height,
            } => UpgradeError::StatusTimeout {
                proposal_id,
                expected,
                last_status,
                deadline_height,
                observed_height,
            },
            GovernanceError::TerminalStatus {
                proposal_id, status, ..
            } => UpgradeError::ProposalRejected { proposal_id, status },
            GovernanceError::Query { attempts, source } => {
                UpgradeError::QueryError { attempts, source }
            }
            GovernanceError::Cancelled => UpgradeError::Cancelled,
        }
    }
}

/// Terminal failure of an attempt: which phase, and why
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{phase} failed: {error}")]
pub struct Failure {
    pub phase: Phase,
    pub error: UpgradeError,
}
