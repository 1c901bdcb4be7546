//! Core types for the upgrade harness
//!
//! These types describe what the harness observes on a cluster (heights,
//! proposal statuses) and what it submits (upgrade proposals, votes).
//! Nothing here is mutated by the cluster itself; the harness only reads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// PRIMITIVE TYPES
// =============================================================================

/// Block height of a cluster
pub type Height = u64;

/// Token amount in base units
pub type Amount = u64;

/// Identifier assigned to a proposal by the cluster at submission time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(String);

impl ProposalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for ProposalId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// A signing identity known to the cluster (key name + address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Keyring name used to sign transactions
    pub key_name: String,

    /// On-chain address
    pub address: String,
}

impl Identity {
    pub fn new(key_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key_name, self.address)
    }
}

// =============================================================================
// GOVERNANCE
// =============================================================================

/// Status of a governance proposal as reported by the cluster
///
/// Transitions are driven by the cluster's own consensus. The harness
/// only observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Unspecified,
    DepositPeriod,
    VotingPeriod,
    Passed,
    Rejected,
    Failed,
}

impl ProposalStatus {
    /// No further transitions happen from a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Passed | ProposalStatus::Rejected | ProposalStatus::Failed
        )
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalStatus::Unspecified => "PROPOSAL_STATUS_UNSPECIFIED",
            ProposalStatus::DepositPeriod => "PROPOSAL_STATUS_DEPOSIT_PERIOD",
            ProposalStatus::VotingPeriod => "PROPOSAL_STATUS_VOTING_PERIOD",
            ProposalStatus::Passed => "PROPOSAL_STATUS_PASSED",
            ProposalStatus::Rejected => "PROPOSAL_STATUS_REJECTED",
            ProposalStatus::Failed => "PROPOSAL_STATUS_FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for ProposalStatus {
    type Err = String;

    /// Accepts both the `PROPOSAL_STATUS_*` wire names and the bare variant
    /// names, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("PROPOSAL_STATUS_").unwrap_or(&upper);

        match name.replace('_', "").as_str() {
            "UNSPECIFIED" => Ok(ProposalStatus::Unspecified),
            "DEPOSITPERIOD" => Ok(ProposalStatus::DepositPeriod),
            "VOTINGPERIOD" => Ok(ProposalStatus::VotingPeriod),
            "PASSED" => Ok(ProposalStatus::Passed),
            "REJECTED" => Ok(ProposalStatus::Rejected),
            "FAILED" => Ok(ProposalStatus::Failed),
            _ => Err(format!("Unknown proposal status: {}", s)),
        }
    }
}

/// Vote choice on a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteOption {
    Yes,
    No,
    Abstain,
    NoWithVeto,
}

impl VoteOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteOption::Yes => "yes",
            VoteOption::No => "no",
            VoteOption::Abstain => "abstain",
            VoteOption::NoWithVeto => "no_with_veto",
        }
    }
}

/// Software upgrade proposal
///
/// Built once per upgrade attempt and never changed after submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareUpgradeProposal {
    /// Deposit with denom suffix, e.g. `500000000ukrat`
    pub deposit: String,

    pub title: String,

    /// Name of the upgrade plan the new binary handles
    pub name: String,

    pub description: String,

    /// Height at which the old binary stops producing blocks
    pub height: Height,
}

// =============================================================================
// CROSS-CHAIN PATH
// =============================================================================

/// Relay path connecting the upgraded chain to its counterparty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPath {
    /// Path name registered with the relayer
    pub name: String,

    /// Relayer instance that ferries packets over this path
    pub relayer: String,
}

impl Default for RelayPath {
    fn default() -> Self {
        Self {
            name: "ibc-upgrade-test-path".to_string(),
            relayer: "relayer".to_string(),
        }
    }
}

// =============================================================================
// UPGRADE ATTEMPT RECORD
// =============================================================================

/// In-memory record of a single upgrade attempt
///
/// Filled in as the coordinator advances; discarded when the run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeAttempt {
    pub proposal: Option<SoftwareUpgradeProposal>,
    pub proposal_id: Option<ProposalId>,

    /// Height observed right before submission
    pub submission_height: Option<Height>,

    pub halt_height: Option<Height>,

    /// Height at which the proposal was seen as passed
    pub passed_height: Option<Height>,

    pub observed_halt_height: Option<Height>,

    pub post_upgrade_height: Option<Height>,

    /// Funded test accounts (first one signs the proposal)
    pub test_accounts: Vec<Identity>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parses_wire_names() {
        assert_eq!(
            "PROPOSAL_STATUS_PASSED".parse::<ProposalStatus>().unwrap(),
            ProposalStatus::Passed
        );
        assert_eq!(
            "PROPOSAL_STATUS_VOTING_PERIOD".parse::<ProposalStatus>().unwrap(),
            ProposalStatus::VotingPeriod
        );
        assert_eq!(
            "depositperiod".parse::<ProposalStatus>().unwrap(),
            ProposalStatus::DepositPeriod
        );
        assert!("PROPOSAL_STATUS_WITHDRAWN".parse::<ProposalStatus>().is_err());
    }

    #[test]
    fn test_status_display_parses_back() {
        for status in [
            ProposalStatus::Unspecified,
            ProposalStatus::Rejected,
            ProposalStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<ProposalStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ProposalStatus::Passed.is_terminal());
        assert!(ProposalStatus::Rejected.is_terminal());
        assert!(!ProposalStatus::VotingPeriod.is_terminal());
        assert!(!ProposalStatus::Unspecified.is_terminal());
    }

    #[test]
    fn test_proposal_id_serializes_as_string() {
        let id = ProposalId::from(1);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"1\"");
        assert_eq!(id.to_string(), "1");
    }
}
