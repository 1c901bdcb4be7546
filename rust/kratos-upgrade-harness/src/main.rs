//! KratOs Upgrade Harness CLI
//!
//! `run` drives a live network described by a harness config file,
//! `simulate` runs the same coordinator against an in-memory chain pair,
//! `init-config` writes a starting config.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kratos_upgrade_harness::cancel::{cancel_pair, CancelHandle};
use kratos_upgrade_harness::cluster::{Cluster, ClusterNode};
use kratos_upgrade_harness::command::{CommandConformance, CommandNode};
use kratos_upgrade_harness::config::{HarnessConfig, UpgradeConfig};
use kratos_upgrade_harness::conformance::ConformanceProbe;
use kratos_upgrade_harness::coordinator::UpgradeCoordinator;
use kratos_upgrade_harness::rpc::RpcChainClient;
use kratos_upgrade_harness::sim::{SimConfig, SimConformance, SimFault, SimulatedNetwork};
use kratos_upgrade_harness::types::{Identity, RelayPath};

/// KratOs Upgrade Harness - coordinated chain upgrade validation
#[derive(Parser, Debug)]
#[command(name = "kratos-upgrade-harness")]
#[command(author = "KratOs Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Validate a governance-driven chain software upgrade end to end")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info", env = "KRATOS_LOG")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade a live network
    Run(RunCmd),

    /// Upgrade a simulated network
    Simulate(SimulateCmd),

    /// Write a default harness config
    InitConfig(InitConfigCmd),
}

#[derive(Parser, Debug)]
struct RunCmd {
    /// Harness configuration file
    #[arg(short, long, default_value = "upgrade-harness.toml")]
    config: PathBuf,

    /// Override the upgrade plan name
    #[arg(long)]
    upgrade_name: Option<String>,

    /// Override the target binary version
    #[arg(long)]
    upgrade_version: Option<String>,

    /// Key that signs the proposal
    #[arg(long)]
    signer: Option<String>,

    /// Write the JSON report here (overrides the config)
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct SimulateCmd {
    /// Upgrade settings (TOML); defaults otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validators on the upgraded chain
    #[arg(long, default_value = "4")]
    validators: usize,

    /// Non-validating full nodes on the upgraded chain
    #[arg(long, default_value = "0")]
    full_nodes: usize,

    /// Block time of both simulated chains
    #[arg(long, default_value = "500")]
    block_time_ms: u64,

    /// Misbehaviour to inject into the upgraded chain
    #[arg(long, value_enum, default_value = "none")]
    fault: SimFault,

    /// Write the JSON report here
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct InitConfigCmd {
    /// Output file
    #[arg(short, long, default_value = "upgrade-harness.toml")]
    output: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.verbose {
        "debug"
    } else {
        &cli.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter)),
        )
        .init();

    info!("⬆️  KratOs Upgrade Harness v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Run(cmd) => run_live(cmd).await,
        Commands::Simulate(cmd) => run_simulated(cmd).await,
        Commands::InitConfig(cmd) => init_config(cmd),
    }
}

/// Cancel the attempt on Ctrl+C
fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Shutdown signal received, cancelling upgrade attempt");
            handle.cancel();
        }
    });
}

async fn run_live(cmd: RunCmd) -> anyhow::Result<()> {
    let mut config = HarnessConfig::load(&cmd.config)
        .map_err(|e| anyhow::anyhow!("Failed to load {:?}: {}", cmd.config, e))?;

    if let Some(name) = cmd.upgrade_name {
        config.upgrade.upgrade_name = name;
    }
    if let Some(version) = cmd.upgrade_version {
        config.upgrade.upgrade_version = version;
    }
    if cmd.signer.is_some() {
        config.upgrade = config.upgrade.with_signer(cmd.signer);
    }
    if cmd.report.is_some() {
        config.report_path = cmd.report;
    }

    config.validate()?;

    info!("⚙️  Configuration:");
    info!("   Chain: {} ({})", config.chain.chain_id, config.chain.rpc_url);
    info!(
        "   Counterparty: {} ({})",
        config.counterparty.chain_id, config.counterparty.rpc_url
    );
    info!("   Nodes: {}", config.nodes.len());
    info!(
        "   Upgrade: {} -> {} (halt delta {} blocks)",
        config.upgrade.upgrade_name,
        config.upgrade.upgrade_version,
        config.upgrade.halt_height_delta
    );

    let client = Arc::new(RpcChainClient::new(
        &config.chain.rpc_url,
        &config.chain.chain_id,
        &config.chain.denom,
        config.chain.request_timeout(),
    )?);
    let counterparty = Arc::new(RpcChainClient::new(
        &config.counterparty.rpc_url,
        &config.counterparty.chain_id,
        &config.counterparty.denom,
        config.counterparty.request_timeout(),
    )?);

    let nodes: Vec<Arc<dyn ClusterNode>> = config
        .nodes
        .iter()
        .map(|entry| {
            let validator = entry
                .validator_key
                .as_ref()
                .map(|key| Identity::new(key.clone(), entry.validator_address.clone()));
            Arc::new(CommandNode::new(
                entry.name.clone(),
                validator,
                config.node_commands.clone(),
            )) as Arc<dyn ClusterNode>
        })
        .collect();

    let probe = ConformanceProbe::new(
        Arc::new(CommandConformance::new(config.conformance_command.clone())),
        counterparty,
        config.relay_path.clone(),
    );

    let coordinator =
        UpgradeCoordinator::new(config.upgrade.clone(), Cluster::new(client, nodes), probe);

    drive(coordinator, config.report_path.as_deref()).await
}

async fn run_simulated(cmd: SimulateCmd) -> anyhow::Result<()> {
    let upgrade = match &cmd.config {
        Some(path) => UpgradeConfig::load(path)?,
        None => UpgradeConfig::default(),
    };
    upgrade.validate()?;

    let sim = SimConfig {
        validators: cmd.validators,
        full_nodes: cmd.full_nodes,
        block_time_ms: cmd.block_time_ms,
        ..SimConfig::default()
    };
    if sim.validators == 0 || sim.block_time_ms == 0 {
        anyhow::bail!("validators and block_time_ms must be non-zero");
    }

    info!(
        "🧪 Simulating upgrade on {} validators + {} full nodes ({}ms blocks, fault: {:?})",
        sim.validators, sim.full_nodes, sim.block_time_ms, cmd.fault
    );

    let chain = SimulatedNetwork::start(sim.clone().with_fault(cmd.fault));
    let counterparty = SimulatedNetwork::start(sim.clone().with_chain_id("kratos-sim-2"));

    let suite = SimConformance::new(
        2,
        sim.block_time() * 10,
        upgrade.height_poll_interval(),
    );
    let probe = ConformanceProbe::new(
        Arc::new(suite),
        counterparty.client(),
        RelayPath::default(),
    );
    let coordinator = UpgradeCoordinator::new(upgrade, chain.cluster(), probe);

    drive(coordinator, cmd.report.as_deref()).await
}

/// Run the coordinator to completion and publish the report
async fn drive(
    coordinator: UpgradeCoordinator,
    report_path: Option<&Path>,
) -> anyhow::Result<()> {
    let (handle, token) = cancel_pair();
    cancel_on_ctrl_c(handle);

    let mut coordinator = coordinator.with_cancel(token);
    let started = std::time::Instant::now();
    let result = coordinator.run().await;
    let elapsed = started.elapsed();

    let report = coordinator.report();
    if let Some(path) = report_path {
        report.write_to(path)?;
        info!("📝 Report written to {:?}", path);
    }

    match result {
        Ok(()) => {
            let attempt = coordinator.attempt();
            info!("✅ Upgrade validated in {}", format_duration(elapsed));
            info!(
                "   Halted at {:?}, live again at {:?}",
                attempt.observed_halt_height, attempt.post_upgrade_height
            );
            Ok(())
        }
        Err(failure) => {
            error!("❌ Upgrade attempt failed in phase {}", failure.phase);
            error!("   {}: {}", failure.error.kind(), failure.error);
            Err(anyhow::anyhow!(failure))
        }
    }
}

fn init_config(cmd: InitConfigCmd) -> anyhow::Result<()> {
    if cmd.output.exists() && !cmd.force {
        anyhow::bail!("{:?} already exists (use --force to overwrite)", cmd.output);
    }

    HarnessConfig::default().save(&cmd.output)?;
    info!("📝 Default config written to {:?}", cmd.output);
    Ok(())
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}.{:01}s", secs, d.subsec_millis() / 100)
    }
}
