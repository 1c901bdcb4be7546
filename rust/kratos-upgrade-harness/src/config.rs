//! Upgrade Harness Configuration
//!
//! Block budgets and wall-clock waits for one upgrade attempt. Defaults
//! match a local test network with short voting periods; tests shrink the
//! waits instead of sleeping on real block times.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::NodeCommands;
use crate::types::{Amount, Height, RelayPath};

/// Configuration for a single upgrade attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    // === Proposal ===

    /// Plan name the new binary registers a handler for
    pub upgrade_name: String,

    /// Binary version every node is switched to
    pub upgrade_version: String,

    /// Deposit amount (denom is appended at submission)
    pub deposit_amount: Amount,

    pub proposal_title: String,

    pub proposal_description: String,

    /// Key used to sign the proposal; the first funded test account otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,

    // === Block budgets ===

    /// Halt height = height at submission + this delta
    pub halt_height_delta: Height,

    /// Proposal must pass within this many blocks of submission
    pub passage_block_budget: Height,

    /// Blocks required after restart to call the chain live
    pub blocks_after_upgrade: u64,

    // === Wall-clock waits ===

    /// Interval between height samples (milliseconds)
    pub height_poll_interval_ms: u64,

    /// Interval between proposal status samples (milliseconds)
    pub status_poll_interval_ms: u64,

    /// Upper bound on waiting for passage, whatever the height does (seconds)
    pub passage_timeout_secs: u64,

    /// How long the chain must stay frozen at the halt height (seconds)
    pub halt_wait_secs: u64,

    /// Window for post-upgrade block production (seconds)
    pub liveness_timeout_secs: u64,

    /// Consecutive query failures tolerated by a poll
    pub max_consecutive_query_failures: u32,

    // === Test accounts ===

    /// Funds given to each test account
    pub user_funds: Amount,

    pub test_account_count: usize,

    // === Conformance ===

    /// Probe the relay path before touching governance
    pub run_baseline_conformance: bool,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            // Proposal
            upgrade_name: "multiverse".to_string(),
            upgrade_version: "v8.0.0".to_string(),
            deposit_amount: 500_000_000, // above min deposit
            proposal_title: "Chain Upgrade 1".to_string(),
            proposal_description: "First chain software upgrade".to_string(),
            signer: None,

            // Block budgets
            halt_height_delta: 10,
            passage_block_budget: 10,
            blocks_after_upgrade: 10,

            // Wall-clock waits
            height_poll_interval_ms: 1_000,
            status_poll_interval_ms: 1_000,
            passage_timeout_secs: 300,
            halt_wait_secs: 45,
            liveness_timeout_secs: 45,
            max_consecutive_query_failures: 3,

            // Test accounts
            user_funds: 10_000_000_000,
            test_account_count: 1,

            run_baseline_conformance: true,
        }
    }
}

impl UpgradeConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    // Builder-style methods for CLI overrides

    pub fn with_upgrade(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.upgrade_name = name.into();
        self.upgrade_version = version.into();
        self
    }

    pub fn with_signer(mut self, signer: Option<String>) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_halt_height_delta(mut self, delta: Height) -> Self {
        self.halt_height_delta = delta;
        self
    }

    pub fn with_blocks_after_upgrade(mut self, blocks: u64) -> Self {
        self.blocks_after_upgrade = blocks;
        self
    }

    pub fn height_poll_interval(&self) -> Duration {
        Duration::from_millis(self.height_poll_interval_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn passage_timeout(&self) -> Duration {
        Duration::from_secs(self.passage_timeout_secs)
    }

    pub fn halt_wait(&self) -> Duration {
        Duration::from_secs(self.halt_wait_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.upgrade_name.trim().is_empty() {
            anyhow::bail!("upgrade_name must not be empty");
        }

        if self.upgrade_version.trim().is_empty() {
            anyhow::bail!("upgrade_version must not be empty");
        }

        if self.halt_height_delta == 0 {
            anyhow::bail!("halt_height_delta must be at least 1");
        }

        // The proposal has to pass while the old binary still produces blocks
        if self.passage_block_budget > self.halt_height_delta {
            anyhow::bail!(
                "passage_block_budget ({}) must not exceed halt_height_delta ({})",
                self.passage_block_budget,
                self.halt_height_delta
            );
        }

        if self.blocks_after_upgrade == 0 {
            anyhow::bail!("blocks_after_upgrade must be at least 1");
        }

        if self.height_poll_interval_ms == 0 || self.status_poll_interval_ms == 0 {
            anyhow::bail!("poll intervals must be non-zero");
        }

        if self.halt_wait() <= self.height_poll_interval() {
            anyhow::bail!(
                "halt_wait_secs ({}s) must be longer than the height poll interval ({}ms)",
                self.halt_wait_secs,
                self.height_poll_interval_ms
            );
        }

        if self.signer.is_none() && self.test_account_count == 0 {
            anyhow::bail!("either signer or test_account_count > 0 is required");
        }

        Ok(())
    }
}

// =============================================================================
// HARNESS (binary) CONFIGURATION
// =============================================================================

/// JSON-RPC endpoint of one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEndpoint {
    pub chain_id: String,
    pub rpc_url: String,
    pub denom: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    10
}

impl ChainEndpoint {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// One member node of the upgraded chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,

    /// Validator key name; full nodes leave it out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_key: Option<String>,

    #[serde(default)]
    pub validator_address: String,
}

/// Everything the `run` command needs to drive a live network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// `{chain_a}`, `{chain_b}`, `{path}` and `{relayer}` are substituted
    pub conformance_command: String,

    /// Where to write the JSON report, if anywhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,

    #[serde(default)]
    pub upgrade: UpgradeConfig,

    /// Chain being upgraded
    pub chain: ChainEndpoint,

    /// Other end of the relay path
    pub counterparty: ChainEndpoint,

    pub relay_path: RelayPath,

    pub node_commands: NodeCommands,

    pub nodes: Vec<NodeEntry>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            conformance_command: "./scripts/conformance.sh {chain_a} {chain_b} {path}".to_string(),
            report_path: None,
            upgrade: UpgradeConfig::default(),
            chain: ChainEndpoint {
                chain_id: "kratos-1".to_string(),
                rpc_url: "http://127.0.0.1:9933".to_string(),
                denom: "ukrat".to_string(),
                request_timeout_secs: default_request_timeout(),
            },
            counterparty: ChainEndpoint {
                chain_id: "kratos-2".to_string(),
                rpc_url: "http://127.0.0.1:9934".to_string(),
                denom: "ukrat".to_string(),
                request_timeout_secs: default_request_timeout(),
            },
            relay_path: RelayPath::default(),
            node_commands: NodeCommands {
                stop: "docker stop {node}".to_string(),
                start: "docker start {node}".to_string(),
                swap: "./scripts/swap-binary.sh {node} {version}".to_string(),
            },
            nodes: (0..4)
                .map(|i| NodeEntry {
                    name: format!("kratos-1-val-{}", i),
                    validator_key: Some(format!("validator-{}", i)),
                    validator_address: String::new(),
                })
                .collect(),
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.upgrade.validate()?;

        if self.chain.chain_id == self.counterparty.chain_id {
            anyhow::bail!(
                "chain and counterparty must differ (both are {})",
                self.chain.chain_id
            );
        }

        if self.nodes.is_empty() {
            anyhow::bail!("at least one node is required");
        }

        if !self.nodes.iter().any(|n| n.validator_key.is_some()) {
            anyhow::bail!("at least one node must carry a validator key");
        }

        let mut names: Vec<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.nodes.len() {
            anyhow::bail!("node names must be unique");
        }

        if !self.node_commands.swap.contains("{version}") {
            anyhow::bail!("node_commands.swap must use the {{version}} placeholder");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UpgradeConfig::default();
        assert_eq!(config.halt_height_delta, 10);
        assert_eq!(config.halt_wait(), Duration::from_secs(45));
        assert_eq!(config.deposit_amount, 500_000_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_passage_budget_must_fit_before_halt() {
        let mut config = UpgradeConfig::default();
        config.passage_block_budget = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_signer_or_test_account_required() {
        let mut config = UpgradeConfig::default();
        config.test_account_count = 0;
        assert!(config.validate().is_err());

        let config = config.with_signer(Some("validator".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = UpgradeConfig::default()
            .with_upgrade("v9", "v9.0.0")
            .with_halt_height_delta(20)
            .with_blocks_after_upgrade(3);

        assert_eq!(config.upgrade_name, "v9");
        assert_eq!(config.upgrade_version, "v9.0.0");
        assert_eq!(config.halt_height_delta, 20);
        assert_eq!(config.blocks_after_upgrade, 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upgrade.toml");

        let config = UpgradeConfig::default().with_upgrade("neutron", "v2.0.0");
        config.save(&path).unwrap();

        assert_eq!(UpgradeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: UpgradeConfig = toml::from_str("halt_height_delta = 25").unwrap();
        assert_eq!(config.halt_height_delta, 25);
        assert_eq!(config.blocks_after_upgrade, 10);
    }

    #[test]
    fn test_harness_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");

        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        config.save(&path).unwrap();

        assert_eq!(HarnessConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_harness_rejects_duplicate_nodes() {
        let mut config = HarnessConfig::default();
        config.nodes[1].name = config.nodes[0].name.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_harness_needs_a_validator() {
        let mut config = HarnessConfig::default();
        for node in &mut config.nodes {
            node.validator_key = None;
        }
        assert!(config.validate().is_err());
    }
}
