//! Proposal Lifecycle Tracker
//!
//! Submits the upgrade proposal, casts a vote for every validator and
//! polls the proposal until it reaches the wanted status. Governance
//! transactions are never retried here: a rejected submission or vote
//! ends the attempt.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::cluster::{ChainClient, Cluster, ClusterError};
use crate::fanout::{fan_out, MemberFailure};
use crate::types::{
    Height, Identity, ProposalId, ProposalStatus, SoftwareUpgradeProposal, VoteOption,
};

/// Governance failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GovernanceError {
    #[error("Proposal submission rejected: {0}")]
    Submission(#[source] ClusterError),

    #[error("Vote from {voter} rejected: {source}")]
    Vote {
        voter: String,
        #[source]
        source: ClusterError,
    },

    #[error("Cluster has no validators to vote")]
    NoValidators,

    #[error(
        "Proposal {proposal_id} not {expected} by height {deadline_height} \
         (last status {last_status:?}, height {observed_height:?})"
    )]
    StatusTimeout {
        proposal_id: ProposalId,
        expected: ProposalStatus,
        last_status: Option<ProposalStatus>,
        deadline_height: Height,
        observed_height: Option<Height>,
    },

    #[error("Proposal {proposal_id} ended as {status} while waiting for {expected}")]
    TerminalStatus {
        proposal_id: ProposalId,
        expected: ProposalStatus,
        status: ProposalStatus,
    },

    #[error("Governance query failed {attempts} times in a row: {source}")]
    Query {
        attempts: u32,
        #[source]
        source: ClusterError,
    },

    #[error("Governance poll cancelled")]
    Cancelled,
}

/// Drives one proposal through submission, voting and passage
pub struct ProposalTracker {
    client: Arc<dyn ChainClient>,
    poll_interval: Duration,
    max_query_failures: u32,
    cancel: CancelToken,
}

impl ProposalTracker {
    pub fn new(client: Arc<dyn ChainClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
            max_query_failures: 3,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_max_query_failures(mut self, attempts: u32) -> Self {
        self.max_query_failures = attempts.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Broadcast the proposal, returning the id the cluster assigned
    pub async fn submit(
        &self,
        signer: &Identity,
        proposal: &SoftwareUpgradeProposal,
    ) -> Result<ProposalId, GovernanceError> {
        info!(
            "📜 Submitting upgrade proposal '{}' (plan {}, halt height {}) as {}",
            proposal.title, proposal.name, proposal.height, signer.key_name
        );

        let id = self
            .client
            .submit_proposal(signer, proposal)
            .await
            .map_err(GovernanceError::Submission)?;

        info!("📜 Proposal {} accepted by {}", id, self.client.chain_id());
        Ok(id)
    }

    /// Cast `option` for every validator of `cluster`
    ///
    /// Votes go out concurrently. Any rejected vote aborts the whole step:
    /// with partial votes the quorum outcome is no longer predictable.
    pub async fn cast_all_validator_votes(
        &self,
        cluster: &Cluster,
        proposal_id: &ProposalId,
        option: VoteOption,
    ) -> Result<usize, GovernanceError> {
        let voters = cluster.validators();

        if voters.is_empty() {
            return Err(GovernanceError::NoValidators);
        }

        info!(
            "🗳️  Casting {} vote from {} validators on proposal {}",
            option.as_str(),
            voters.len(),
            proposal_id
        );

        let tasks = voters
            .into_iter()
            .map(|voter| {
                let client = self.client.clone();
                let proposal_id = proposal_id.clone();
                let label = voter.key_name.clone();
                (label, async move {
                    client.submit_vote(&voter, &proposal_id, option).await
                })
            })
            .collect();

        let cast = fan_out(tasks).await.map_err(|MemberFailure { member, error, .. }| {
            warn!("Vote from {} rejected: {}", member, error);
            GovernanceError::Vote {
                voter: member,
                source: error,
            }
        })?;

        info!("🗳️  {} votes accepted", cast);
        Ok(cast)
    }

    /// Poll until the proposal reaches `target`
    ///
    /// Checks once per `poll_interval` and gives up once the chain height
    /// exceeds `deadline_height` or `wall_timeout` elapses, including while a
    /// query is still in flight. Samples reported below `start_height` come
    /// from a node lagging behind the submission and are skipped. Returns the
    /// height at which `target` was observed.
    pub async fn poll_status(
        &self,
        proposal_id: &ProposalId,
        start_height: Height,
        deadline_height: Height,
        target: ProposalStatus,
        wall_timeout: Duration,
    ) -> Result<Height, GovernanceError> {
        let deadline = Instant::now() + wall_timeout;
        let mut last_status: Option<ProposalStatus> = None;
        let mut last_height: Option<Height> = None;
        let mut failures = 0u32;

        debug!(
            "Polling proposal {} for {} between heights {} and {}",
            proposal_id, target, start_height, deadline_height
        );

        let timeout_error = |last_status, observed_height| GovernanceError::StatusTimeout {
            proposal_id: proposal_id.clone(),
            expected: target,
            last_status,
            deadline_height,
            observed_height,
        };

        loop {
            let sample = match self.sample(proposal_id, deadline).await? {
                Some(sample) => sample,
                None => {
                    warn!(
                        "Proposal {} query still pending at the wall clock cap",
                        proposal_id
                    );
                    return Err(timeout_error(last_status, last_height));
                }
            };

            match sample {
                Ok((height, _)) if height < start_height => {
                    failures = 0;
                    debug!(
                        "Proposal {} sample at height {} predates start height {}",
                        proposal_id, height, start_height
                    );
                }
                Ok((height, status)) => {
                    failures = 0;
                    last_height = Some(height);
                    last_status = Some(status);
                    debug!("Proposal {} status={} height={}", proposal_id, status, height);

                    if status == target {
                        return Ok(height);
                    }
                    if status.is_terminal() {
                        return Err(GovernanceError::TerminalStatus {
                            proposal_id: proposal_id.clone(),
                            expected: target,
                            status,
                        });
                    }
                    if height > deadline_height {
                        return Err(timeout_error(last_status, last_height));
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Proposal {} query failed ({}/{}): {}",
                        proposal_id, failures, self.max_query_failures, e
                    );
                    if failures >= self.max_query_failures {
                        return Err(GovernanceError::Query {
                            attempts: failures,
                            source: e,
                        });
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(timeout_error(last_status, last_height));
            }

            let wake = (Instant::now() + self.poll_interval).min(deadline);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(GovernanceError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// One (height, status) sample
    ///
    /// The outer error is cancellation only; `None` means `deadline` passed
    /// before the query answered.
    async fn sample(
        &self,
        proposal_id: &ProposalId,
        deadline: Instant,
    ) -> Result<Option<Result<(Height, ProposalStatus), ClusterError>>, GovernanceError> {
        let query = async {
            let height = self.client.query_height().await?;
            let status = self.client.query_proposal_status(proposal_id).await?;
            Ok::<_, ClusterError>((height, status))
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GovernanceError::Cancelled),
            result = query => Ok(Some(result)),
            _ = tokio::time::sleep_until(deadline) => Ok(None),
        }
    }
}
