//! Conformance Probe hookup
//!
//! Runs the external cross-chain suite between the upgraded chain and its
//! counterparty. The same suite runs before governance starts (to prove
//! the environment works) and after the new binary is live (to catch
//! regressions). The suite itself is opaque: pass or fail.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::cluster::{ChainClient, ClusterError, ConformanceSuite};
use crate::types::RelayPath;

/// When the suite runs relative to the upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checkpoint {
    Baseline,
    PostUpgrade,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::Baseline => write!(f, "baseline"),
            Checkpoint::PostUpgrade => write!(f, "post-upgrade"),
        }
    }
}

/// Conformance suite bound to a counterparty chain and relay path
pub struct ConformanceProbe {
    suite: Arc<dyn ConformanceSuite>,
    counterparty: Arc<dyn ChainClient>,
    path: RelayPath,
    runs: AtomicU32,
}

impl ConformanceProbe {
    pub fn new(
        suite: Arc<dyn ConformanceSuite>,
        counterparty: Arc<dyn ChainClient>,
        path: RelayPath,
    ) -> Self {
        Self {
            suite,
            counterparty,
            path,
            runs: AtomicU32::new(0),
        }
    }

    /// Number of suite invocations so far
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Run the suite between `chain` and the counterparty
    pub async fn check(
        &self,
        chain: &dyn ChainClient,
        checkpoint: Checkpoint,
    ) -> Result<(), ClusterError> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let result = self
            .suite
            .run(chain, self.counterparty.as_ref(), &self.path)
            .await;

        match &result {
            Ok(()) => info!(
                "🔗 {} conformance {} <-> {} over {} passed in {:?}",
                checkpoint,
                chain.chain_id(),
                self.counterparty.chain_id(),
                self.path.name,
                started.elapsed()
            ),
            Err(e) => warn!(
                "{} conformance {} <-> {} over {} failed: {}",
                checkpoint,
                chain.chain_id(),
                self.counterparty.chain_id(),
                self.path.name,
                e
            ),
        }

        result
    }
}
