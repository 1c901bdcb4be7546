//! Upgrade Coordinator
//!
//! Drives one coordinated chain upgrade as an explicit state machine:
//!
//! ```text
//! Idle → BaselineConfirmed → ProposalSubmitted → Voted → AwaitingPassage
//!      → Passed → AwaitingHalt → Halted → NodesStopped → BinarySwapped
//!      → NodesRestarted → LivenessConfirmed → Done
//!
//! any state ──failure──▶ Failed(phase, reason)
//! ```
//!
//! Each call to [`UpgradeCoordinator::step`] performs exactly one transition,
//! so every precondition and failure mode can be exercised on its own.
//! Phases run strictly one after another; only the per-member work inside a
//! phase (votes, stop, swap, start) fans out. A failure stops the attempt
//! for good, later phases rely on what earlier ones established.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::cluster::Cluster;
use crate::config::UpgradeConfig;
use crate::conformance::{Checkpoint, ConformanceProbe};
use crate::error::{Failure, UpgradeError};
use crate::fanout::fan_out;
use crate::governance::ProposalTracker;
use crate::halt::{classify, HaltVerdict};
use crate::poller::{HeightPoller, PollError};
use crate::report::AttemptReport;
use crate::types::{
    Height, Identity, ProposalId, ProposalStatus, SoftwareUpgradeProposal, UpgradeAttempt,
    VoteOption,
};

/// Named phase of an upgrade attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    BaselineConfirmed,
    ProposalSubmitted,
    Voted,
    AwaitingPassage,
    Passed,
    AwaitingHalt,
    Halted,
    NodesStopped,
    BinarySwapped,
    NodesRestarted,
    LivenessConfirmed,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What every post-submission state knows about the proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub proposal_id: ProposalId,
    pub submission_height: Height,
    pub halt_height: Height,
}

/// Coordinator state; each variant carries what the next transition needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeState {
    Idle,
    BaselineConfirmed,
    ProposalSubmitted(Ticket),
    Voted(Ticket),
    AwaitingPassage { ticket: Ticket, deadline_height: Height },
    Passed(Ticket),
    AwaitingHalt { ticket: Ticket, wait_from: Height },
    Halted(Ticket),
    NodesStopped(Ticket),
    BinarySwapped(Ticket),
    NodesRestarted(Ticket),
    LivenessConfirmed(Ticket),
    Done,
    /// The phase recorded is the one whose transition failed
    Failed(Box<Failure>),
}

impl UpgradeState {
    /// Phase of a non-failed state
    pub fn phase(&self) -> Option<Phase> {
        let phase = match self {
            UpgradeState::Idle => Phase::Idle,
            UpgradeState::BaselineConfirmed => Phase::BaselineConfirmed,
            UpgradeState::ProposalSubmitted(_) => Phase::ProposalSubmitted,
            UpgradeState::Voted(_) => Phase::Voted,
            UpgradeState::AwaitingPassage { .. } => Phase::AwaitingPassage,
            UpgradeState::Passed(_) => Phase::Passed,
            UpgradeState::AwaitingHalt { .. } => Phase::AwaitingHalt,
            UpgradeState::Halted(_) => Phase::Halted,
            UpgradeState::NodesStopped(_) => Phase::NodesStopped,
            UpgradeState::BinarySwapped(_) => Phase::BinarySwapped,
            UpgradeState::NodesRestarted(_) => Phase::NodesRestarted,
            UpgradeState::LivenessConfirmed(_) => Phase::LivenessConfirmed,
            UpgradeState::Done => Phase::Done,
            UpgradeState::Failed(_) => return None,
        };
        Some(phase)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UpgradeState::Done | UpgradeState::Failed(_))
    }
}

/// Sequences a single upgrade attempt against one cluster
pub struct UpgradeCoordinator {
    config: UpgradeConfig,
    cluster: Cluster,
    probe: ConformanceProbe,
    cancel: CancelToken,
    state: UpgradeState,
    attempt: UpgradeAttempt,
    report: AttemptReport,
    last_height: Option<Height>,
}

impl UpgradeCoordinator {
    pub fn new(config: UpgradeConfig, cluster: Cluster, probe: ConformanceProbe) -> Self {
        let report = AttemptReport::new(
            cluster.chain_id(),
            &config.upgrade_name,
            &config.upgrade_version,
        );

        Self {
            config,
            cluster,
            probe,
            cancel: CancelToken::never(),
            state: UpgradeState::Idle,
            attempt: UpgradeAttempt::default(),
            report,
            last_height: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &UpgradeState {
        &self.state
    }

    pub fn attempt(&self) -> &UpgradeAttempt {
        &self.attempt
    }

    pub fn report(&self) -> &AttemptReport {
        &self.report
    }

    pub fn probe(&self) -> &ConformanceProbe {
        &self.probe
    }

    /// Run until `Done` or the first failure
    pub async fn run(&mut self) -> Result<(), Failure> {
        info!(
            "🚀 Upgrading {} to {} (plan '{}') across {} nodes",
            self.cluster.chain_id(),
            self.config.upgrade_version,
            self.config.upgrade_name,
            self.cluster.nodes.len()
        );

        while !self.state.is_terminal() {
            self.step().await;
        }

        match &self.state {
            UpgradeState::Failed(failure) => Err((**failure).clone()),
            _ => {
                info!("✅ Upgrade of {} complete", self.cluster.chain_id());
                Ok(())
            }
        }
    }

    /// Step until `phase` is reached or the attempt ends
    pub async fn run_until(&mut self, phase: Phase) -> &UpgradeState {
        while !self.state.is_terminal() && self.state.phase() != Some(phase) {
            self.step().await;
        }
        &self.state
    }

    /// Perform one transition
    pub async fn step(&mut self) -> &UpgradeState {
        if self.state.is_terminal() {
            return &self.state;
        }

        let from = self.state.phase().unwrap_or(Phase::Idle);
        let current = std::mem::replace(&mut self.state, UpgradeState::Idle);

        let (target, result) = if self.cancel.is_cancelled() {
            (from, Err(UpgradeError::Cancelled))
        } else {
            match current {
                UpgradeState::Idle => (Phase::BaselineConfirmed, self.confirm_baseline().await),
                UpgradeState::BaselineConfirmed => {
                    (Phase::ProposalSubmitted, self.submit_proposal().await)
                }
                UpgradeState::ProposalSubmitted(ticket) => {
                    (Phase::Voted, self.cast_votes(ticket).await)
                }
                UpgradeState::Voted(ticket) => {
                    (Phase::AwaitingPassage, self.begin_passage_wait(ticket))
                }
                UpgradeState::AwaitingPassage {
                    ticket,
                    deadline_height,
                } => (
                    Phase::Passed,
                    self.await_passage(ticket, deadline_height).await,
                ),
                UpgradeState::Passed(ticket) => {
                    (Phase::AwaitingHalt, self.begin_halt_wait(ticket).await)
                }
                UpgradeState::AwaitingHalt { ticket, wait_from } => {
                    (Phase::Halted, self.confirm_halt(ticket, wait_from).await)
                }
                UpgradeState::Halted(ticket) => {
                    (Phase::NodesStopped, self.stop_nodes(ticket).await)
                }
                UpgradeState::NodesStopped(ticket) => {
                    (Phase::BinarySwapped, self.swap_binaries(ticket).await)
                }
                UpgradeState::BinarySwapped(ticket) => {
                    (Phase::NodesRestarted, self.start_nodes(ticket).await)
                }
                UpgradeState::NodesRestarted(ticket) => (
                    Phase::LivenessConfirmed,
                    self.confirm_liveness(ticket).await,
                ),
                UpgradeState::LivenessConfirmed(_) => {
                    (Phase::Done, self.confirm_conformance().await)
                }
                terminal @ (UpgradeState::Done | UpgradeState::Failed(_)) => {
                    self.state = terminal;
                    return &self.state;
                }
            }
        };

        self.state = match result {
            Ok(next) => {
                self.report.record_transition(from, target, self.last_height);
                next
            }
            Err(err) => {
                error!("❌ {} → {} failed: {}", from, target, err);
                let failure = Failure {
                    phase: target,
                    error: err,
                };
                self.report.record_failure(&failure, &self.attempt);
                UpgradeState::Failed(Box::new(failure))
            }
        };

        if self.state == UpgradeState::Done {
            self.report.record_success(&self.attempt);
        }

        &self.state
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    async fn confirm_baseline(&mut self) -> Result<UpgradeState, UpgradeError> {
        if !self.config.run_baseline_conformance {
            warn!("Baseline conformance disabled, skipping");
            return Ok(UpgradeState::BaselineConfirmed);
        }

        info!("🔗 Running baseline conformance on {}", self.cluster.chain_id());
        self.probe
            .check(self.cluster.client.as_ref(), Checkpoint::Baseline)
            .await
            .map_err(|source| UpgradeError::EnvironmentBroken { source })?;

        Ok(UpgradeState::BaselineConfirmed)
    }

    async fn submit_proposal(&mut self) -> Result<UpgradeState, UpgradeError> {
        if self.config.test_account_count > 0 {
            let accounts = self
                .cluster
                .client
                .fund_test_accounts(self.config.user_funds, self.config.test_account_count)
                .await
                .map_err(|source| UpgradeError::FundingError { source })?;
            info!("💰 Funded {} test accounts", accounts.len());
            self.attempt.test_accounts = accounts;
        }

        let signer = match (&self.config.signer, self.attempt.test_accounts.first()) {
            (Some(key_name), _) => Identity::new(key_name.clone(), String::new()),
            (None, Some(account)) => account.clone(),
            (None, None) => {
                return Err(UpgradeError::FundingError {
                    source: crate::cluster::ClusterError::Rejected(
                        "no signer configured and no test account funded".to_string(),
                    ),
                })
            }
        };

        let height = self.sample_height().await?;
        let halt_height = height + self.config.halt_height_delta;

        let proposal = SoftwareUpgradeProposal {
            deposit: format!("{}{}", self.config.deposit_amount, self.cluster.client.denom()),
            title: self.config.proposal_title.clone(),
            name: self.config.upgrade_name.clone(),
            description: self.config.proposal_description.clone(),
            height: halt_height,
        };

        self.attempt.proposal = Some(proposal.clone());
        self.attempt.submission_height = Some(height);
        self.attempt.halt_height = Some(halt_height);

        let proposal_id = self.tracker().submit(&signer, &proposal).await?;
        self.attempt.proposal_id = Some(proposal_id.clone());

        Ok(UpgradeState::ProposalSubmitted(Ticket {
            proposal_id,
            submission_height: height,
            halt_height,
        }))
    }

    async fn cast_votes(&mut self, ticket: Ticket) -> Result<UpgradeState, UpgradeError> {
        self.tracker()
            .cast_all_validator_votes(&self.cluster, &ticket.proposal_id, VoteOption::Yes)
            .await?;
        Ok(UpgradeState::Voted(ticket))
    }

    fn begin_passage_wait(&mut self, ticket: Ticket) -> Result<UpgradeState, UpgradeError> {
        let deadline_height = ticket.submission_height + self.config.passage_block_budget;
        info!(
            "⏳ Waiting for proposal {} to pass before height {}",
            ticket.proposal_id, deadline_height
        );
        Ok(UpgradeState::AwaitingPassage {
            ticket,
            deadline_height,
        })
    }

    async fn await_passage(
        &mut self,
        ticket: Ticket,
        deadline_height: Height,
    ) -> Result<UpgradeState, UpgradeError> {
        let height = self
            .tracker()
            .poll_status(
                &ticket.proposal_id,
                ticket.submission_height,
                deadline_height,
                ProposalStatus::Passed,
                self.config.passage_timeout(),
            )
            .await?;

        info!("✅ Proposal {} passed at height {}", ticket.proposal_id, height);
        self.last_height = Some(height);
        self.attempt.passed_height = Some(height);
        Ok(UpgradeState::Passed(ticket))
    }

    async fn begin_halt_wait(&mut self, ticket: Ticket) -> Result<UpgradeState, UpgradeError> {
        let wait_from = self.sample_height().await?;
        info!(
            "⏸️  Height {}, expecting halt at {} (waiting up to {:?})",
            wait_from,
            ticket.halt_height,
            self.config.halt_wait()
        );
        Ok(UpgradeState::AwaitingHalt { ticket, wait_from })
    }

    async fn confirm_halt(
        &mut self,
        ticket: Ticket,
        wait_from: Height,
    ) -> Result<UpgradeState, UpgradeError> {
        let halt_height = ticket.halt_height;

        // Timing out here is the expected outcome: the chain should never
        // produce the block after the halt height.
        let waited = self
            .poller()
            .wait_for_height(halt_height + 1, self.config.halt_wait())
            .await;

        let verdict = match waited {
            Ok(height) => classify(halt_height, height, false),
            Err(PollError::Timeout { .. }) => {
                let height = self.sample_height().await?;
                classify(halt_height, height, true)
            }
            Err(e) => return Err(UpgradeError::from_poll(e)),
        };

        let observed = match verdict {
            HaltVerdict::Correct { height } => height,
            HaltVerdict::OverRun { observed, .. }
            | HaltVerdict::StalledEarly { observed, .. }
            | HaltVerdict::Inconclusive { observed, .. } => observed,
        };
        self.last_height = Some(observed);
        self.attempt.observed_halt_height = Some(observed);

        if !verdict.is_correct() {
            return Err(UpgradeError::HaltMismatch { verdict });
        }

        info!(
            "🛑 {} halted at {} (waited from {})",
            self.cluster.chain_id(),
            observed,
            wait_from
        );
        Ok(UpgradeState::Halted(ticket))
    }

    async fn stop_nodes(&mut self, ticket: Ticket) -> Result<UpgradeState, UpgradeError> {
        info!("⏹️  Stopping {} nodes", self.cluster.nodes.len());

        let tasks = self
            .cluster
            .nodes
            .iter()
            .map(|node| {
                let node = node.clone();
                (node.name().to_string(), async move { node.stop().await })
            })
            .collect();

        fan_out(tasks)
            .await
            .map_err(|f| UpgradeError::StopError {
                node: f.member,
                source: f.error,
            })?;

        Ok(UpgradeState::NodesStopped(ticket))
    }

    async fn swap_binaries(&mut self, ticket: Ticket) -> Result<UpgradeState, UpgradeError> {
        let version = self.config.upgrade_version.clone();
        info!("🔁 Switching {} nodes to {}", self.cluster.nodes.len(), version);

        let tasks = self
            .cluster
            .nodes
            .iter()
            .map(|node| {
                let node = node.clone();
                let version = version.clone();
                (node.name().to_string(), async move {
                    node.swap_binary(&version).await
                })
            })
            .collect();

        fan_out(tasks)
            .await
            .map_err(|f| UpgradeError::SwapError {
                node: f.member,
                version,
                source: f.error,
            })?;

        Ok(UpgradeState::BinarySwapped(ticket))
    }

    async fn start_nodes(&mut self, ticket: Ticket) -> Result<UpgradeState, UpgradeError> {
        info!("▶️  Starting {} upgraded nodes", self.cluster.nodes.len());

        let tasks = self
            .cluster
            .nodes
            .iter()
            .map(|node| {
                let node = node.clone();
                (node.name().to_string(), async move { node.start().await })
            })
            .collect();

        fan_out(tasks)
            .await
            .map_err(|f| UpgradeError::StartError {
                node: f.member,
                source: f.error,
            })?;

        Ok(UpgradeState::NodesRestarted(ticket))
    }

    async fn confirm_liveness(&mut self, ticket: Ticket) -> Result<UpgradeState, UpgradeError> {
        let required_blocks = self.config.blocks_after_upgrade;
        let timeout = self.config.liveness_timeout();
        let started = tokio::time::Instant::now();

        // Freshly restarted nodes may refuse queries for a while; only the
        // window decides here.
        let poller = self.poller().with_max_query_failures(u32::MAX);

        let start = match poller.wait_until(|_| true, timeout).await {
            Ok(h) => h,
            Err(PollError::Timeout { waited, last_height }) => {
                return Err(UpgradeError::PostUpgradeStall {
                    start_height: None,
                    required_blocks,
                    last_height,
                    waited,
                })
            }
            Err(e) => return Err(UpgradeError::from_poll(e)),
        };

        let remaining = timeout.saturating_sub(started.elapsed());
        let reached = match poller.wait_for_height(start + required_blocks, remaining).await {
            Ok(h) => h,
            Err(PollError::Timeout { last_height, .. }) => {
                return Err(UpgradeError::PostUpgradeStall {
                    start_height: Some(start),
                    required_blocks,
                    last_height,
                    waited: started.elapsed(),
                })
            }
            Err(e) => return Err(UpgradeError::from_poll(e)),
        };

        info!(
            "💚 {} produced {} blocks after upgrade ({} → {})",
            self.cluster.chain_id(),
            reached - start,
            start,
            reached
        );
        self.last_height = Some(reached);
        self.attempt.post_upgrade_height = Some(reached);
        Ok(UpgradeState::LivenessConfirmed(ticket))
    }

    async fn confirm_conformance(&mut self) -> Result<UpgradeState, UpgradeError> {
        info!("🔗 Running post-upgrade conformance on {}", self.cluster.chain_id());
        self.probe
            .check(self.cluster.client.as_ref(), Checkpoint::PostUpgrade)
            .await
            .map_err(|source| UpgradeError::ConformanceRegression { source })?;
        Ok(UpgradeState::Done)
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn poller(&self) -> HeightPoller<'_> {
        HeightPoller::new(self.cluster.client.as_ref(), self.config.height_poll_interval())
            .with_max_query_failures(self.config.max_consecutive_query_failures)
            .with_cancel(self.cancel.clone())
    }

    fn tracker(&self) -> ProposalTracker {
        ProposalTracker::new(self.cluster.client.clone(), self.config.status_poll_interval())
            .with_max_query_failures(self.config.max_consecutive_query_failures)
            .with_cancel(self.cancel.clone())
    }

    /// One height sample under the query failure budget
    async fn sample_height(&mut self) -> Result<Height, UpgradeError> {
        let height = self
            .poller()
            .wait_until(|_| true, self.config.halt_wait())
            .await
            .map_err(UpgradeError::from_poll)?;
        self.last_height = Some(height);
        Ok(height)
    }
}
