// Full upgrade runs against the simulated network
//
// Real block production on a (paused) timer, real governance tallying and
// a real halt at the plan height. Fault injection covers the two ways the
// binaries themselves can misbehave.

use std::sync::Arc;
use std::time::Duration;

use crate::conformance::ConformanceProbe;
use crate::coordinator::{Phase, UpgradeCoordinator};
use crate::error::UpgradeError;
use crate::halt::HaltVerdict;
use crate::sim::{SimConfig, SimConformance, SimFault, SimulatedNetwork};
use crate::tests::stub::test_config;
use crate::types::RelayPath;

fn networks(fault: SimFault) -> (SimulatedNetwork, SimulatedNetwork) {
    let a = SimulatedNetwork::start(SimConfig::default().with_fault(fault));
    let b = SimulatedNetwork::start(SimConfig::default().with_chain_id("kratos-sim-2"));
    (a, b)
}

fn coordinator(a: &SimulatedNetwork, b: &SimulatedNetwork) -> UpgradeCoordinator {
    let suite = Arc::new(SimConformance::new(
        2,
        Duration::from_secs(10),
        Duration::from_millis(100),
    ));
    let probe = ConformanceProbe::new(suite, b.client(), RelayPath::default());
    UpgradeCoordinator::new(test_config(), a.cluster(), probe)
}

#[tokio::test(start_paused = true)]
async fn test_simulated_upgrade_succeeds() {
    let (a, b) = networks(SimFault::None);
    let mut coordinator = coordinator(&a, &b);

    coordinator.run().await.unwrap();

    let attempt = coordinator.attempt();
    let halt = attempt.halt_height.unwrap();
    assert_eq!(attempt.observed_halt_height, Some(halt));
    assert!(attempt.passed_height.unwrap() < halt);
    assert!(attempt.post_upgrade_height.unwrap() >= halt + 10);
    assert_eq!(a.versions().await, vec!["v8.0.0"; 4]);
    assert_eq!(coordinator.probe().runs(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_simulated_chain_ignoring_plan_over_runs() {
    let (a, b) = networks(SimFault::IgnoreUpgradePlan);
    let mut coordinator = coordinator(&a, &b);

    let failure = coordinator.run().await.unwrap_err();
    assert_eq!(failure.phase, Phase::Halted);
    match failure.error {
        UpgradeError::HaltMismatch {
            verdict: HaltVerdict::OverRun { expected, observed },
        } => assert!(observed > expected),
        other => panic!("expected over-run, got {:?}", other),
    }
    assert_eq!(a.versions().await, vec!["v6.0.0"; 4]);
}

#[tokio::test(start_paused = true)]
async fn test_simulated_broken_binary_stalls() {
    let (a, b) = networks(SimFault::StallAfterUpgrade);
    let mut coordinator = coordinator(&a, &b);

    let failure = coordinator.run().await.unwrap_err();
    assert_eq!(failure.phase, Phase::LivenessConfirmed);
    assert_eq!(failure.error.kind(), "PostUpgradeStall");
    assert_eq!(a.versions().await, vec!["v8.0.0"; 4]);
}

#[tokio::test(start_paused = true)]
async fn test_simulated_full_node_is_upgraded() {
    let config = SimConfig {
        full_nodes: 1,
        ..SimConfig::default()
    };
    let a = SimulatedNetwork::start(config);
    let b = SimulatedNetwork::start(SimConfig::default().with_chain_id("kratos-sim-2"));
    let mut coordinator = coordinator(&a, &b);

    coordinator.run().await.unwrap();

    assert_eq!(a.cluster().validators().len(), 4);
    assert_eq!(a.cluster().nodes.len(), 5);
    assert_eq!(a.versions().await, vec!["v8.0.0"; 5]);
}
