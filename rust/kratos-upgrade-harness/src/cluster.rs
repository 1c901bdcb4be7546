//! Cluster collaborators
//!
//! The harness never talks to a chain directly. Everything it needs goes
//! through these traits so the same coordinator drives a live network
//! (`rpc` + `command` backends), the in-memory `sim` network, or scripted
//! test stubs.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::types::{
    Amount, Height, Identity, ProposalId, ProposalStatus, RelayPath, SoftwareUpgradeProposal,
    VoteOption,
};

/// Failure reported by a collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// The cluster could not be reached or did not answer
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// The cluster answered with an error
    #[error("RPC error: {0}")]
    Rpc(String),

    /// A transaction was rejected (bad deposit, unknown voter, ...)
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    /// A node lifecycle operation failed
    #[error("Node operation failed: {0}")]
    NodeOperation(String),

    /// The conformance suite reported a failure
    #[error("Conformance failure: {0}")]
    Conformance(String),
}

/// Read and transaction access to one chain
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain identifier, used in logs and reports
    fn chain_id(&self) -> &str;

    /// Native denom, appended to deposit amounts
    fn denom(&self) -> &str;

    async fn query_height(&self) -> Result<Height, ClusterError>;

    async fn submit_proposal(
        &self,
        signer: &Identity,
        proposal: &SoftwareUpgradeProposal,
    ) -> Result<ProposalId, ClusterError>;

    async fn submit_vote(
        &self,
        voter: &Identity,
        proposal_id: &ProposalId,
        option: VoteOption,
    ) -> Result<(), ClusterError>;

    async fn query_proposal_status(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<ProposalStatus, ClusterError>;

    /// Create and fund `count` fresh accounts with `amount` each
    async fn fund_test_accounts(
        &self,
        amount: Amount,
        count: usize,
    ) -> Result<Vec<Identity>, ClusterError>;
}

/// One member node of a cluster
#[async_trait]
pub trait ClusterNode: Send + Sync {
    fn name(&self) -> &str;

    /// Validator key of this node, `None` for full nodes
    fn validator(&self) -> Option<&Identity>;

    async fn stop(&self) -> Result<(), ClusterError>;

    async fn start(&self) -> Result<(), ClusterError>;

    /// Replace the node binary with `version` (node must be stopped)
    async fn swap_binary(&self, version: &str) -> Result<(), ClusterError>;
}

/// Cross-chain functional test suite
#[async_trait]
pub trait ConformanceSuite: Send + Sync {
    async fn run(
        &self,
        chain_a: &dyn ChainClient,
        chain_b: &dyn ChainClient,
        path: &RelayPath,
    ) -> Result<(), ClusterError>;
}

/// Handle on a running multi-node network
#[derive(Clone)]
pub struct Cluster {
    pub client: Arc<dyn ChainClient>,
    pub nodes: Vec<Arc<dyn ClusterNode>>,
}

impl Cluster {
    pub fn new(client: Arc<dyn ChainClient>, nodes: Vec<Arc<dyn ClusterNode>>) -> Self {
        Self { client, nodes }
    }

    pub fn chain_id(&self) -> &str {
        self.client.chain_id()
    }

    /// Keys of the nodes that vote; full nodes hold none
    pub fn validators(&self) -> Vec<Identity> {
        self.nodes
            .iter()
            .filter_map(|n| n.validator().cloned())
            .collect()
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("chain_id", &self.client.chain_id())
            .field(
                "nodes",
                &self.nodes.iter().map(|n| n.name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
