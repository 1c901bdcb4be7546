//! Height Poller
//!
//! Samples a chain's height until a predicate holds or a wall-clock budget
//! runs out. Every waiting step of the upgrade goes through here.
//!
//! A timeout is an ordinary, expected outcome (the halt check relies on it)
//! and is kept apart from query failures and cancellation.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::cluster::{ChainClient, ClusterError};
use crate::types::Height;

/// Why a poll ended without its predicate holding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// Deadline elapsed first
    #[error("Timed out after {waited:?} (last height: {last_height:?})")]
    Timeout {
        waited: Duration,
        last_height: Option<Height>,
    },

    /// Height query failed too many times in a row
    #[error("Height query failed {attempts} times in a row: {source}")]
    Query {
        attempts: u32,
        #[source]
        source: ClusterError,
    },

    /// Cluster reported a lower height than before
    #[error("Height went backwards: {previous} -> {observed}")]
    Regressed { previous: Height, observed: Height },

    #[error("Poll cancelled")]
    Cancelled,
}

/// Polls chain height at a fixed interval
pub struct HeightPoller<'a> {
    client: &'a dyn ChainClient,
    interval: Duration,
    max_query_failures: u32,
    cancel: CancelToken,
}

impl<'a> HeightPoller<'a> {
    pub fn new(client: &'a dyn ChainClient, interval: Duration) -> Self {
        Self {
            client,
            interval,
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

    /// Single height sample, honouring cancellation
    pub async fn current_height(&self) -> Result<Height, PollError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PollError::Cancelled),
            result = self.client.query_height() => result.map_err(|source| PollError::Query {
                attempts: 1,
                source,
            }),
        }
    }

    /// Wait until `height >= target`
    pub async fn wait_for_height(
        &self,
        target: Height,
        timeout: Duration,
    ) -> Result<Height, PollError> {
        debug!("Waiting for {} to reach height {}", self.client.chain_id(), target);
        self.wait_until(|h| h >= target, timeout).await
    }

    /// Wait until `blocks` more blocks are produced past the first sample
    ///
    /// Returns `(start_height, reached_height)`.
    pub async fn wait_for_blocks(
        &self,
        blocks: u64,
        timeout: Duration,
    ) -> Result<(Height, Height), PollError> {
        let deadline = Instant::now() + timeout;
        let start = self.wait_until(|_| true, timeout).await?;
        let target = start.saturating_add(blocks);
        debug!(
            "Waiting for {} blocks on {} ({} -> {})",
            blocks,
            self.client.chain_id(),
            start,
            target
        );

        let remaining = deadline.saturating_duration_since(Instant::now());
        let reached = self.wait_until(|h| h >= target, remaining).await?;
        Ok((start, reached))
    }

    /// Sample height until `predicate` holds or `timeout` elapses
    pub async fn wait_until<P>(&self, predicate: P, timeout: Duration) -> Result<Height, PollError>
    where
        P: Fn(Height) -> bool,
    {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut last_height: Option<Height> = None;
        let mut consecutive_failures = 0u32;

        loop {
            let sample = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => None,
                result = self.client.query_height() => Some(result),
            };

            match sample {
                // Query itself outlived the deadline
                None => {
                    return Err(PollError::Timeout {
                        waited: started.elapsed(),
                        last_height,
                    });
                }
                Some(Ok(height)) => {
                    consecutive_failures = 0;

                    if let Some(previous) = last_height {
                        if height < previous {
                            return Err(PollError::Regressed {
                                previous,
                                observed: height,
                            });
                        }
                    }
                    last_height = Some(height);
                    debug!("{} height={}", self.client.chain_id(), height);

                    if predicate(height) {
                        return Ok(height);
                    }
                }
                Some(Err(e)) => {
                    consecutive_failures += 1;
                    warn!(
                        "Height query on {} failed ({}/{}): {}",
                        self.client.chain_id(),
                        consecutive_failures,
                        self.max_query_failures,
                        e
                    );
                    if consecutive_failures >= self.max_query_failures {
                        return Err(PollError::Query {
                            attempts: consecutive_failures,
                            source: e,
                        });
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(PollError::Timeout {
                    waited: started.elapsed(),
                    last_height,
                });
            }

            let wake = (Instant::now() + self.interval).min(deadline);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}
