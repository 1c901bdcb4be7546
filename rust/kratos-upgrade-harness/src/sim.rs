//! Simulated network
//!
//! In-memory chain with block production on a timer, a governance module
//! and upgrade plans. Used by `simulate` and by the end-to-end tests.
//!
//! Rules:
//! - a block is produced only while more than 2/3 of validators run
//! - a proposal with a sufficient deposit enters voting immediately and is
//!   tallied after `voting_period_blocks`; more than 2/3 Yes votes pass it
//! - a passed upgrade plan freezes the chain at the plan height until every
//!   running node has switched away from the binary that reached it
//! - lifecycle operations out of order (stop a stopped node, swap a running
//!   binary, vote outside the voting period) are refused

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cluster::{ChainClient, Cluster, ClusterError, ClusterNode, ConformanceSuite};
use crate::poller::HeightPoller;
use crate::types::{
    Amount, Height, Identity, ProposalId, ProposalStatus, RelayPath, SoftwareUpgradeProposal,
    VoteOption,
};

/// Deterministic address for a key name
pub fn address_for(key_name: &str) -> String {
    let hash = blake3::hash(key_name.as_bytes());
    format!("kratos{}", hex::encode(&hash.as_bytes()[..20]))
}

/// Misbehaviour injected into the simulated chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SimFault {
    #[default]
    None,
    /// Old binary ignores the upgrade plan and keeps producing blocks
    IgnoreUpgradePlan,
    /// New binary never produces a block
    StallAfterUpgrade,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub chain_id: String,
    pub denom: String,
    pub validators: usize,
    pub full_nodes: usize,
    pub block_time_ms: u64,
    pub start_height: Height,
    pub genesis_version: String,
    pub min_deposit: Amount,
    pub voting_period_blocks: u64,
    pub fault: SimFault,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            chain_id: "kratos-sim-1".to_string(),
            denom: "ukrat".to_string(),
            validators: 4,
            full_nodes: 0,
            block_time_ms: 500,
            start_height: 1,
            genesis_version: "v6.0.0".to_string(),
            min_deposit: 10_000_000,
            voting_period_blocks: 5,
            fault: SimFault::None,
        }
    }
}

impl SimConfig {
    pub fn with_chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = chain_id.into();
        self
    }

    pub fn with_fault(mut self, fault: SimFault) -> Self {
        self.fault = fault;
        self
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }
}

// =============================================================================
// CHAIN STATE
// =============================================================================

#[derive(Debug)]
struct SimNodeState {
    name: String,
    validator: Option<Identity>,
    running: bool,
    version: String,
}

#[derive(Debug)]
struct SimProposal {
    content: SoftwareUpgradeProposal,
    status: ProposalStatus,
    voting_end: Height,
    votes: HashMap<String, VoteOption>,
}

#[derive(Debug, Clone)]
struct UpgradePlan {
    name: String,
    height: Height,
    /// Binary that must be replaced before the chain resumes
    from_version: String,
}

#[derive(Debug)]
struct ChainState {
    config: SimConfig,
    height: Height,
    nodes: Vec<SimNodeState>,
    proposals: BTreeMap<u64, SimProposal>,
    next_proposal_id: u64,
    plan: Option<UpgradePlan>,
    next_account: usize,
}

impl ChainState {
    fn new(config: SimConfig) -> Self {
        let mut nodes = Vec::new();
        for i in 0..config.validators {
            let name = format!("validator-{}", i);
            nodes.push(SimNodeState {
                validator: Some(Identity::new(name.clone(), address_for(&name))),
                name,
                running: true,
                version: config.genesis_version.clone(),
            });
        }
        for i in 0..config.full_nodes {
            nodes.push(SimNodeState {
                name: format!("fullnode-{}", i),
                validator: None,
                running: true,
                version: config.genesis_version.clone(),
            });
        }

        Self {
            height: config.start_height,
            config,
            nodes,
            proposals: BTreeMap::new(),
            next_proposal_id: 1,
            plan: None,
            next_account: 0,
        }
    }

    fn validator_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.validator.is_some()).count()
    }

    fn has_quorum(&self) -> bool {
        let running = self
            .nodes
            .iter()
            .filter(|n| n.validator.is_some() && n.running)
            .count();
        running * 3 > self.validator_count() * 2
    }

    fn ensure_reachable(&self) -> Result<(), ClusterError> {
        if self.nodes.iter().any(|n| n.running) {
            Ok(())
        } else {
            Err(ClusterError::Unreachable(format!(
                "{}: no running node",
                self.config.chain_id
            )))
        }
    }

    fn is_validator(&self, key_name: &str) -> bool {
        self.nodes
            .iter()
            .any(|n| n.validator.as_ref().map(|v| v.key_name.as_str()) == Some(key_name))
    }

    fn produce_block(&mut self) {
        if !self.has_quorum() {
            return;
        }

        if let Some(plan) = &self.plan {
            if self.height >= plan.height && self.config.fault != SimFault::IgnoreUpgradePlan {
                let upgraded = self
                    .nodes
                    .iter()
                    .filter(|n| n.running)
                    .all(|n| n.version != plan.from_version);
                if !upgraded || self.config.fault == SimFault::StallAfterUpgrade {
                    return;
                }
                info!(
                    "🔁 {} applied upgrade '{}' at height {}",
                    self.config.chain_id, plan.name, self.height
                );
                self.plan = None;
            }
        }

        self.height += 1;
        self.tally();
    }

    fn tally(&mut self) {
        let height = self.height;
        let validators = self.validator_count();
        let mut passed_plans = Vec::new();

        for (id, proposal) in self.proposals.iter_mut() {
            if proposal.status != ProposalStatus::VotingPeriod || proposal.voting_end > height {
                continue;
            }

            let yes = proposal
                .votes
                .values()
                .filter(|v| **v == VoteOption::Yes)
                .count();

            proposal.status = if yes * 3 <= validators * 2 {
                ProposalStatus::Rejected
            } else if proposal.content.height <= height {
                ProposalStatus::Failed
            } else {
                passed_plans.push(proposal.content.clone());
                ProposalStatus::Passed
            };
            info!(
                "🗳️  {} proposal {} tallied at {}: {} ({}/{} yes)",
                self.config.chain_id, id, height, proposal.status, yes, validators
            );
        }

        for content in passed_plans {
            let from_version = self
                .nodes
                .first()
                .map(|n| n.version.clone())
                .unwrap_or_else(|| self.config.genesis_version.clone());
            self.plan = Some(UpgradePlan {
                name: content.name,
                height: content.height,
                from_version,
            });
        }
    }

    fn parse_deposit(&self, deposit: &str) -> Result<Amount, ClusterError> {
        deposit
            .strip_suffix(self.config.denom.as_str())
            .and_then(|amount| amount.parse::<Amount>().ok())
            .ok_or_else(|| {
                ClusterError::Rejected(format!(
                    "invalid deposit '{}', expected <amount>{}",
                    deposit, self.config.denom
                ))
            })
    }
}

// =============================================================================
// NETWORK
// =============================================================================

/// A running simulated chain; block production stops when dropped
pub struct SimulatedNetwork {
    client: Arc<SimChainClient>,
    nodes: Vec<Arc<SimNode>>,
    producer: JoinHandle<()>,
}

impl SimulatedNetwork {
    /// Start producing blocks (must be called inside a tokio runtime)
    pub fn start(config: SimConfig) -> Self {
        let block_time = config.block_time();
        let chain_id = config.chain_id.clone();
        let denom = config.denom.clone();
        let state = ChainState::new(config);

        let nodes_meta: Vec<(String, Option<Identity>)> = state
            .nodes
            .iter()
            .map(|n| (n.name.clone(), n.validator.clone()))
            .collect();

        let state = Arc::new(RwLock::new(state));

        let producer = {
            let state = state.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(block_time);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    state.write().await.produce_block();
                }
            })
        };

        let nodes = nodes_meta
            .into_iter()
            .enumerate()
            .map(|(index, (name, validator))| {
                Arc::new(SimNode {
                    name,
                    validator,
                    index,
                    state: state.clone(),
                })
            })
            .collect();

        info!("🧪 Simulated chain {} started", chain_id);

        Self {
            client: Arc::new(SimChainClient {
                chain_id,
                denom,
                state,
            }),
            nodes,
            producer,
        }
    }

    pub fn client(&self) -> Arc<SimChainClient> {
        self.client.clone()
    }

    pub fn cluster(&self) -> Cluster {
        Cluster::new(
            self.client.clone(),
            self.nodes
                .iter()
                .map(|n| n.clone() as Arc<dyn ClusterNode>)
                .collect(),
        )
    }

    /// Binary version of every node, in node order
    pub async fn versions(&self) -> Vec<String> {
        self.client
            .state
            .read()
            .await
            .nodes
            .iter()
            .map(|n| n.version.clone())
            .collect()
    }
}

impl Drop for SimulatedNetwork {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

/// Chain access to a simulated network
pub struct SimChainClient {
    chain_id: String,
    denom: String,
    state: Arc<RwLock<ChainState>>,
}

#[async_trait]
impl ChainClient for SimChainClient {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn denom(&self) -> &str {
        &self.denom
    }

    async fn query_height(&self) -> Result<Height, ClusterError> {
        let state = self.state.read().await;
        state.ensure_reachable()?;
        Ok(state.height)
    }

    async fn submit_proposal(
        &self,
        signer: &Identity,
        proposal: &SoftwareUpgradeProposal,
    ) -> Result<ProposalId, ClusterError> {
        let mut state = self.state.write().await;
        state.ensure_reachable()?;

        let deposit = state.parse_deposit(&proposal.deposit)?;
        if proposal.height <= state.height {
            return Err(ClusterError::Rejected(format!(
                "upgrade height {} is not above current height {}",
                proposal.height, state.height
            )));
        }

        let (status, voting_end) = if deposit >= state.config.min_deposit {
            (
                ProposalStatus::VotingPeriod,
                state.height + state.config.voting_period_blocks,
            )
        } else {
            (ProposalStatus::DepositPeriod, Height::MAX)
        };

        let id = state.next_proposal_id;
        state.next_proposal_id += 1;
        state.proposals.insert(
            id,
            SimProposal {
                content: proposal.clone(),
                status,
                voting_end,
                votes: HashMap::new(),
            },
        );

        debug!(
            "{} proposal {} from {} in {}",
            self.chain_id, id, signer.key_name, status
        );
        Ok(ProposalId::from(id))
    }

    async fn submit_vote(
        &self,
        voter: &Identity,
        proposal_id: &ProposalId,
        option: VoteOption,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        state.ensure_reachable()?;

        if !state.is_validator(&voter.key_name) {
            return Err(ClusterError::Rejected(format!(
                "{} is not a validator",
                voter.key_name
            )));
        }

        let id: u64 = proposal_id
            .as_str()
            .parse()
            .map_err(|_| ClusterError::Rejected(format!("unknown proposal {}", proposal_id)))?;
        let proposal = state
            .proposals
            .get_mut(&id)
            .ok_or_else(|| ClusterError::Rejected(format!("unknown proposal {}", proposal_id)))?;

        if proposal.status != ProposalStatus::VotingPeriod {
            return Err(ClusterError::Rejected(format!(
                "proposal {} is in {}, not voting",
                proposal_id, proposal.status
            )));
        }

        proposal.votes.insert(voter.key_name.clone(), option);
        Ok(())
    }

    async fn query_proposal_status(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<ProposalStatus, ClusterError> {
        let state = self.state.read().await;
        state.ensure_reachable()?;

        proposal_id
            .as_str()
            .parse::<u64>()
            .ok()
            .and_then(|id| state.proposals.get(&id))
            .map(|p| p.status)
            .ok_or_else(|| ClusterError::Rpc(format!("proposal {} not found", proposal_id)))
    }

    async fn fund_test_accounts(
        &self,
        amount: Amount,
        count: usize,
    ) -> Result<Vec<Identity>, ClusterError> {
        let mut state = self.state.write().await;
        state.ensure_reachable()?;

        let start = state.next_account;
        state.next_account += count;

        let accounts: Vec<Identity> = (start..start + count)
            .map(|i| {
                let name = format!("user-{}", i);
                Identity::new(name.clone(), address_for(&name))
            })
            .collect();

        debug!("{} funded {} accounts with {}{}", self.chain_id, count, amount, self.denom);
        Ok(accounts)
    }
}

/// One node of a simulated network
pub struct SimNode {
    name: String,
    validator: Option<Identity>,
    index: usize,
    state: Arc<RwLock<ChainState>>,
}

#[async_trait]
impl ClusterNode for SimNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn validator(&self) -> Option<&Identity> {
        self.validator.as_ref()
    }

    async fn stop(&self) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let node = &mut state.nodes[self.index];
        if !node.running {
            return Err(ClusterError::NodeOperation(format!("{} already stopped", self.name)));
        }
        node.running = false;
        Ok(())
    }

    async fn start(&self) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let node = &mut state.nodes[self.index];
        if node.running {
            return Err(ClusterError::NodeOperation(format!("{} already running", self.name)));
        }
        node.running = true;
        Ok(())
    }

    async fn swap_binary(&self, version: &str) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        let node = &mut state.nodes[self.index];
        if node.running {
            return Err(ClusterError::NodeOperation(format!(
                "{} must be stopped before switching binary",
                self.name
            )));
        }
        node.version = version.to_string();
        Ok(())
    }
}

/// Conformance check for simulated chains: both ends keep producing blocks
pub struct SimConformance {
    blocks: u64,
    timeout: Duration,
    poll_interval: Duration,
}

impl SimConformance {
    pub fn new(blocks: u64, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            blocks,
            timeout,
            poll_interval,
        }
    }
}

#[async_trait]
impl ConformanceSuite for SimConformance {
    async fn run(
        &self,
        chain_a: &dyn ChainClient,
        chain_b: &dyn ChainClient,
        path: &RelayPath,
    ) -> Result<(), ClusterError> {
        if path.name.is_empty() {
            return Err(ClusterError::Conformance("relay path has no name".to_string()));
        }

        for chain in [chain_a, chain_b] {
            HeightPoller::new(chain, self.poll_interval)
                .wait_for_blocks(self.blocks, self.timeout)
                .await
                .map_err(|e| {
                    ClusterError::Conformance(format!(
                        "{} not producing blocks: {}",
                        chain.chain_id(),
                        e
                    ))
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(height: Height) -> SoftwareUpgradeProposal {
        SoftwareUpgradeProposal {
            deposit: "500000000ukrat".to_string(),
            title: "Chain Upgrade 1".to_string(),
            name: "multiverse".to_string(),
            description: "First chain software upgrade".to_string(),
            height,
        }
    }

    async fn vote_all(network: &SimulatedNetwork, id: &ProposalId) {
        for node in network.cluster().nodes {
            if let Some(v) = node.validator() {
                network.client().submit_vote(v, id, VoteOption::Yes).await.unwrap();
            }
        }
    }

    #[test]
    fn test_address_is_deterministic() {
        assert_eq!(address_for("user-0"), address_for("user-0"));
        assert_ne!(address_for("user-0"), address_for("user-1"));
        assert_eq!(address_for("user-0").len(), "kratos".len() + 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_produced_on_timer() {
        let network = SimulatedNetwork::start(SimConfig::default());
        let client = network.client();
        let before = client.query_height().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2_600)).await;
        assert_eq!(client.query_height().await.unwrap(), before + 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_blocks_without_quorum() {
        let network = SimulatedNetwork::start(SimConfig::default());
        let cluster = network.cluster();
        cluster.nodes[0].stop().await.unwrap();
        cluster.nodes[1].stop().await.unwrap();

        let before = network.client().query_height().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(network.client().query_height().await.unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_plan_halts_until_binaries_switch() {
        let network = SimulatedNetwork::start(SimConfig::default());
        let client = network.client();
        let halt = client.query_height().await.unwrap() + 10;

        let id = client
            .submit_proposal(&Identity::new("user-0", ""), &proposal(halt))
            .await
            .unwrap();
        vote_all(&network, &id).await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(client.query_proposal_status(&id).await.unwrap(), ProposalStatus::Passed);
        assert_eq!(client.query_height().await.unwrap(), halt);

        let nodes = network.cluster().nodes;
        assert!(nodes[0].swap_binary("v8.0.0").await.is_err());
        for node in &nodes {
            node.stop().await.unwrap();
            node.swap_binary("v8.0.0").await.unwrap();
            node.start().await.unwrap();
        }
        assert_eq!(network.versions().await, vec!["v8.0.0"; 4]);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(client.query_height().await.unwrap() > halt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_few_yes_votes_rejects() {
        let network = SimulatedNetwork::start(SimConfig::default());
        let client = network.client();
        let halt = client.query_height().await.unwrap() + 10;

        let id = client
            .submit_proposal(&Identity::new("user-0", ""), &proposal(halt))
            .await
            .unwrap();
        let nodes = network.cluster().nodes;
        for node in nodes.iter().take(2) {
            client
                .submit_vote(node.validator().unwrap(), &id, VoteOption::Yes)
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            client.query_proposal_status(&id).await.unwrap(),
            ProposalStatus::Rejected
        );

        // No plan, so no halt
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(client.query_height().await.unwrap() > halt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_operations_refused() {
        let network = SimulatedNetwork::start(SimConfig::default());
        let client = network.client();
        let voter = Identity::new("validator-0", "");

        assert!(client
            .submit_vote(&voter, &ProposalId::from(1), VoteOption::Yes)
            .await
            .is_err());
        assert!(client
            .query_proposal_status(&ProposalId::from(1))
            .await
            .is_err());

        let stale = client.query_height().await.unwrap();
        assert!(matches!(
            client
                .submit_proposal(&Identity::new("user-0", ""), &proposal(stale))
                .await,
            Err(ClusterError::Rejected(_))
        ));

        let cluster = network.cluster();
        let node = &cluster.nodes[0];
        assert!(node.start().await.is_err());
        node.stop().await.unwrap();
        assert!(node.stop().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_deposit_stays_in_deposit_period() {
        let network = SimulatedNetwork::start(SimConfig::default());
        let client = network.client();
        let mut small = proposal(client.query_height().await.unwrap() + 10);
        small.deposit = "5ukrat".to_string();

        let id = client
            .submit_proposal(&Identity::new("user-0", ""), &small)
            .await
            .unwrap();
        assert_eq!(
            client.query_proposal_status(&id).await.unwrap(),
            ProposalStatus::DepositPeriod
        );
        assert!(client
            .submit_vote(&Identity::new("validator-0", ""), &id, VoteOption::Yes)
            .await
            .is_err());

        small.deposit = "500000000uatom".to_string();
        assert!(client
            .submit_proposal(&Identity::new("user-0", ""), &small)
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conformance_needs_both_chains_live() {
        let a = SimulatedNetwork::start(SimConfig::default());
        let b = SimulatedNetwork::start(SimConfig::default().with_chain_id("kratos-sim-2"));
        let suite = SimConformance::new(2, Duration::from_secs(5), Duration::from_millis(100));

        let client_a = a.client();
        let client_b = b.client();
        suite
            .run(client_a.as_ref(), client_b.as_ref(), &RelayPath::default())
            .await
            .unwrap();

        for node in b.cluster().nodes {
            node.stop().await.unwrap();
        }
        assert!(matches!(
            suite
                .run(client_a.as_ref(), client_b.as_ref(), &RelayPath::default())
                .await,
            Err(ClusterError::Conformance(_))
        ));
    }
}
