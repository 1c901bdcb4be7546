// Scripted collaborators for tests
//
// StubChain replays queued heights and statuses; the last queued value
// repeats once the queue is drained. StubNode logs every lifecycle call
// into a shared log so tests can assert ordering and barriers.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::cluster::{ChainClient, Cluster, ClusterError, ClusterNode, ConformanceSuite};
use crate::config::UpgradeConfig;
use crate::types::{
    Amount, Height, Identity, ProposalId, ProposalStatus, RelayPath, SoftwareUpgradeProposal,
    VoteOption,
};

pub type OpLog = Arc<Mutex<Vec<String>>>;

/// Small waits and fast polls, block budgets left at their defaults
pub fn test_config() -> UpgradeConfig {
    UpgradeConfig {
        height_poll_interval_ms: 100,
        status_poll_interval_ms: 100,
        passage_timeout_secs: 60,
        halt_wait_secs: 5,
        liveness_timeout_secs: 10,
        ..UpgradeConfig::default()
    }
}

fn next_or_last<T: Copy>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut queue = queue.lock().unwrap();
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().copied()
    }
}

// =============================================================================
// CHAIN
// =============================================================================

pub struct StubChain {
    chain_id: String,
    heights: Mutex<VecDeque<Height>>,
    restart_heights: Mutex<Option<Vec<Height>>>,
    height_errors: AtomicU32,
    statuses: Mutex<VecDeque<ProposalStatus>>,
    status_hangs: bool,
    submit_error: Option<ClusterError>,
    failing_voters: Vec<String>,
    calls: Mutex<Vec<String>>,
    last_signer: Mutex<Option<String>>,
}

impl StubChain {
    pub fn new(chain_id: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            heights: Mutex::new(VecDeque::from(vec![1])),
            restart_heights: Mutex::new(None),
            height_errors: AtomicU32::new(0),
            statuses: Mutex::new(VecDeque::from(vec![ProposalStatus::Passed])),
            status_hangs: false,
            submit_error: None,
            failing_voters: Vec::new(),
            calls: Mutex::new(Vec::new()),
            last_signer: Mutex::new(None),
        }
    }

    pub fn with_heights(self, heights: Vec<Height>) -> Self {
        self.set_heights(heights);
        self
    }

    /// Heights reported once the first node is started again
    pub fn with_restart_heights(self, heights: Vec<Height>) -> Self {
        *self.restart_heights.lock().unwrap() = Some(heights);
        self
    }

    /// The first `n` height queries fail
    pub fn with_height_errors(self, n: u32) -> Self {
        self.height_errors.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_statuses(self, statuses: Vec<ProposalStatus>) -> Self {
        *self.statuses.lock().unwrap() = VecDeque::from(statuses);
        self
    }

    /// Status queries never answer
    pub fn with_hanging_status(mut self) -> Self {
        self.status_hangs = true;
        self
    }

    pub fn with_submit_error(mut self, err: ClusterError) -> Self {
        self.submit_error = Some(err);
        self
    }

    pub fn with_failing_voter(mut self, key_name: &str) -> Self {
        self.failing_voters.push(key_name.to_string());
        self
    }

    pub fn set_heights(&self, heights: Vec<Height>) {
        *self.heights.lock().unwrap() = VecDeque::from(heights);
    }

    /// Switch to the restart script, first call only
    pub fn restarted(&self) {
        if let Some(heights) = self.restart_heights.lock().unwrap().take() {
            self.set_heights(heights);
        }
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
    }

    pub fn height_queries(&self) -> usize {
        self.calls_named("query_height")
    }

    pub fn last_signer(&self) -> Option<String> {
        self.last_signer.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl ChainClient for StubChain {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn denom(&self) -> &str {
        "ukrat"
    }

    async fn query_height(&self) -> Result<Height, ClusterError> {
        self.record("query_height");

        let remaining = self.height_errors.load(Ordering::SeqCst);
        if remaining > 0 {
            self.height_errors.store(remaining - 1, Ordering::SeqCst);
            return Err(ClusterError::Unreachable("connection refused".to_string()));
        }

        next_or_last(&self.heights).ok_or_else(|| ClusterError::Rpc("no height".to_string()))
    }

    async fn submit_proposal(
        &self,
        signer: &Identity,
        _proposal: &SoftwareUpgradeProposal,
    ) -> Result<ProposalId, ClusterError> {
        self.record("submit_proposal");
        *self.last_signer.lock().unwrap() = Some(signer.key_name.clone());

        match &self.submit_error {
            Some(err) => Err(err.clone()),
            None => Ok(ProposalId::from(1)),
        }
    }

    async fn submit_vote(
        &self,
        voter: &Identity,
        _proposal_id: &ProposalId,
        _option: VoteOption,
    ) -> Result<(), ClusterError> {
        self.record("submit_vote");

        if self.failing_voters.contains(&voter.key_name) {
            return Err(ClusterError::Rejected(format!(
                "account sequence mismatch for {}",
                voter.key_name
            )));
        }
        Ok(())
    }

    async fn query_proposal_status(
        &self,
        _proposal_id: &ProposalId,
    ) -> Result<ProposalStatus, ClusterError> {
        self.record("query_proposal_status");
        if self.status_hangs {
            std::future::pending::<()>().await;
        }
        next_or_last(&self.statuses).ok_or_else(|| ClusterError::Rpc("no status".to_string()))
    }

    async fn fund_test_accounts(
        &self,
        _amount: Amount,
        count: usize,
    ) -> Result<Vec<Identity>, ClusterError> {
        self.record("fund_test_accounts");
        Ok((0..count)
            .map(|i| Identity::new(format!("user-{}", i), format!("addr-{}", i)))
            .collect())
    }
}

// =============================================================================
// NODES
// =============================================================================

pub struct StubNode {
    name: String,
    validator: Option<Identity>,
    chain: Arc<StubChain>,
    log: OpLog,
    fail_on: Option<&'static str>,
}

impl StubNode {
    fn op(&self, op: &str, detail: Option<&str>) -> Result<(), ClusterError> {
        if self.fail_on == Some(op) {
            return Err(ClusterError::NodeOperation(format!(
                "{} {} failed",
                op, self.name
            )));
        }

        let entry = match detail {
            Some(d) => format!("{} {} {}", op, self.name, d),
            None => format!("{} {}", op, self.name),
        };
        self.log.lock().unwrap().push(entry);
        Ok(())
    }
}

#[async_trait]
impl ClusterNode for StubNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn validator(&self) -> Option<&Identity> {
        self.validator.as_ref()
    }

    async fn stop(&self) -> Result<(), ClusterError> {
        self.op("stop", None)
    }

    async fn start(&self) -> Result<(), ClusterError> {
        self.op("start", None)?;
        self.chain.restarted();
        Ok(())
    }

    async fn swap_binary(&self, version: &str) -> Result<(), ClusterError> {
        self.op("swap", Some(version))
    }
}

/// `n` validator nodes named `validator-0..n`
pub fn stub_cluster(chain: &Arc<StubChain>, n: usize) -> (Cluster, OpLog) {
    stub_cluster_failing(chain, n, None)
}

/// Like `stub_cluster`, with `op` failing on the given node
pub fn stub_cluster_failing(
    chain: &Arc<StubChain>,
    n: usize,
    failure: Option<(&str, &'static str)>,
) -> (Cluster, OpLog) {
    build_cluster(chain, n, 0, failure)
}

/// `validators` validator nodes plus `full_nodes` nodes named
/// `fullnode-0..full_nodes` that hold no validator key
pub fn stub_cluster_with_full_nodes(
    chain: &Arc<StubChain>,
    validators: usize,
    full_nodes: usize,
) -> (Cluster, OpLog) {
    build_cluster(chain, validators, full_nodes, None)
}

fn build_cluster(
    chain: &Arc<StubChain>,
    validators: usize,
    full_nodes: usize,
    failure: Option<(&str, &'static str)>,
) -> (Cluster, OpLog) {
    let log: OpLog = Arc::new(Mutex::new(Vec::new()));

    let members = (0..validators)
        .map(|i| {
            let name = format!("validator-{}", i);
            let key = Identity::new(name.clone(), format!("val-addr-{}", i));
            (name, Some(key))
        })
        .chain((0..full_nodes).map(|i| (format!("fullnode-{}", i), None)));

    let nodes = members
        .map(|(name, validator)| {
            let fail_on = failure.and_then(|(node, op)| (node == name).then_some(op));
            Arc::new(StubNode {
                validator,
                name,
                chain: chain.clone(),
                log: log.clone(),
                fail_on,
            }) as Arc<dyn ClusterNode>
        })
        .collect();

    (Cluster::new(chain.clone(), nodes), log)
}

pub fn ops_named(log: &OpLog, op: &str) -> usize {
    let prefix = format!("{} ", op);
    log.lock()
        .unwrap()
        .iter()
        .filter(|e| e.starts_with(&prefix))
        .count()
}

// =============================================================================
// CONFORMANCE
// =============================================================================

#[derive(Default)]
pub struct StubSuite {
    fail_on_run: Option<u32>,
    runs: AtomicU32,
    last_run: Mutex<Option<(String, String, String)>>,
}

impl StubSuite {
    /// Fail the `n`th run (1-based)
    pub fn failing_on(n: u32) -> Self {
        Self {
            fail_on_run: Some(n),
            ..Self::default()
        }
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_run(&self) -> Option<(String, String, String)> {
        self.last_run.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConformanceSuite for StubSuite {
    async fn run(
        &self,
        chain_a: &dyn ChainClient,
        chain_b: &dyn ChainClient,
        path: &RelayPath,
    ) -> Result<(), ClusterError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_run.lock().unwrap() = Some((
            chain_a.chain_id().to_string(),
            chain_b.chain_id().to_string(),
            path.name.clone(),
        ));

        if self.fail_on_run == Some(run) {
            return Err(ClusterError::Conformance(format!(
                "packet acknowledgement missing on run {}",
                run
            )));
        }
        Ok(())
    }
}
