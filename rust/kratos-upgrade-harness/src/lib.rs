//! KratOs Upgrade Harness
//!
//! Validates a coordinated chain software upgrade end to end: a governance
//! proposal schedules the upgrade, every validator votes for it, the chain
//! halts at the planned height, every node is switched to the new binary,
//! and the chain must then produce blocks and pass the cross-chain
//! conformance suite again.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   UPGRADE COORDINATOR                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Proposal Tracker  ──  submit, fan-out votes, poll status   │
//! │  Height Poller     ──  wait for heights / blocks            │
//! │  Halt Detector     ──  classify observed vs planned halt    │
//! │  Fan-out           ──  stop / swap / start every node       │
//! │  Conformance Probe ──  baseline and post-upgrade suite runs │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ChainClient / ClusterNode / ConformanceSuite               │
//! │    rpc + command backends │ simulated network │ test stubs  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod cancel;
pub mod cluster;
pub mod command;
pub mod config;
pub mod conformance;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod governance;
pub mod halt;
pub mod poller;
pub mod report;
pub mod rpc;
pub mod sim;
pub mod types;

#[cfg(test)]
mod tests;

pub use cluster::{ChainClient, Cluster, ClusterError, ClusterNode, ConformanceSuite};
pub use config::{HarnessConfig, UpgradeConfig};
pub use coordinator::{Phase, UpgradeCoordinator, UpgradeState};
pub use error::{Failure, UpgradeError};
pub use report::AttemptReport;
