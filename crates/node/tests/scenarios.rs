//! End-to-end scenarios through the public controller API, under virtual
//! time: clean auto cycles, weather skips, mid-run stops, crash recovery,
//! partial hardware faults, and double-start rejection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use irrigation_node::conditions::FixedConditions;
use irrigation_node::config::{
    AutomationConfig, CircuitConfig, CorrectionFactors, Dripper, Environment, IrrigationLimits,
    NodeConfig, StandardConditions, WeatherApiConfig,
};
use irrigation_node::controller::Controller;
use irrigation_node::error::{CommandError, WorkerError};
use irrigation_node::relay::ValveState;
use irrigation_node::types::{
    CircuitSnapshot, CircuitState, ControllerState, Outcome, ZonesStateFile,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn circuit_cfg(id: u32) -> CircuitConfig {
    CircuitConfig {
        id,
        name: format!("zone {id}"),
        relay_pin: 10 + id as u8,
        enabled: true,
        even_area_mode: true,
        target_mm: Some(5.0),
        area_m2: Some(2.0),
        liters_per_minimum_dripper: None,
        interval_days: 1,
        drippers: vec![Dripper {
            flow_lph: 10,
            count: 1,
        }],
        correction: CorrectionFactors::default(),
    }
}

fn node_cfg(circuits: Vec<CircuitConfig>, min_percent: f64) -> NodeConfig {
    NodeConfig {
        standard_conditions: StandardConditions {
            solar_total: 5.0,
            temperature_celsius: 20.0,
            rainfall_mm: 0.0,
        },
        correction_factors: CorrectionFactors {
            rain: -0.15,
            ..Default::default()
        },
        limits: IrrigationLimits {
            min_percent,
            max_percent: 300.0,
            main_valve_max_flow: 0.0,
        },
        automation: AutomationConfig {
            auto_enabled: true,
            scheduled_hour: 6,
            scheduled_minute: 0,
            environment: Environment::Development,
            use_weather_simulator: false,
            max_flow_monitoring: false,
        },
        weather_api: WeatherApiConfig::default(),
        circuits,
    }
}

fn standard_weather() -> Arc<FixedConditions> {
    Arc::new(FixedConditions::new(5.0, 20.0, 0.0))
}

fn rainy_weather() -> Arc<FixedConditions> {
    Arc::new(FixedConditions::new(5.0, 20.0, 10.0))
}

struct Node {
    _dir: TempDir,
    controller: Arc<Controller>,
}

async fn start_node(config: NodeConfig, provider: Arc<FixedConditions>) -> Node {
    let dir = TempDir::new().unwrap();
    let controller = Controller::with_provider(
        config,
        dir.path().join("zones_state.json"),
        dir.path().join("irrigation_log.json"),
        provider,
    )
    .await
    .unwrap();
    controller.start().unwrap();
    Node {
        _dir: dir,
        controller,
    }
}

async fn wait_for_state(controller: &Controller, want: ControllerState) {
    // Generous virtual-time budget: a full 10 L run takes 3600 s.
    for _ in 0..200_000 {
        if controller.refresh_state() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("controller never reached {want}");
}

async fn wait_until_idle(controller: &Controller) {
    wait_for_state(controller, ControllerState::Idle).await;
}

async fn wait_for_cycle_end(controller: &Controller) {
    for _ in 0..200_000 {
        if !controller.is_cycle_running() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("cycle worker never finished");
}

fn snapshot_of(status: &irrigation_node::types::ControllerStatus, id: u32) -> CircuitSnapshot {
    status
        .zones
        .iter()
        .find(|z| z.id == id)
        .expect("zone present")
        .snapshot
        .clone()
}

// ---------------------------------------------------------------------------
// S1 — clean auto cycle, one circuit
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn clean_auto_cycle_single_circuit() {
    let node = start_node(node_cfg(vec![circuit_cfg(1)], 20.0), standard_weather()).await;

    node.controller.start_auto_cycle().await.unwrap();
    wait_for_state(&node.controller, ControllerState::Irrigating).await;
    wait_until_idle(&node.controller).await;

    let status = node.controller.status().await.unwrap();
    let snap = snapshot_of(&status, 1);
    assert_eq!(snap.last_outcome, Some(Outcome::Success));
    assert_eq!(snap.last_volume, 10.0);
    assert_eq!(snap.last_duration, 3600);
    assert_eq!(snap.circuit_state, CircuitState::Idle);

    let circuit = node.controller.circuit(1).unwrap();
    assert_eq!(circuit.valve_state().await, ValveState::Closed);
    assert!(!circuit.has_fault());

    node.controller.shutdown().await;
}

// ---------------------------------------------------------------------------
// S2 — weather skip vs floor clamp
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rain_clamps_to_floor_when_configured() {
    // 10 mm of rain over standard at factor −0.15 → adjusted −5 L, but the
    // 20% floor keeps a 2 L irrigation.
    let node = start_node(node_cfg(vec![circuit_cfg(1)], 20.0), rainy_weather()).await;

    node.controller.start_auto_cycle().await.unwrap();
    wait_for_state(&node.controller, ControllerState::Irrigating).await;
    wait_until_idle(&node.controller).await;

    let status = node.controller.status().await.unwrap();
    let snap = snapshot_of(&status, 1);
    assert_eq!(snap.last_outcome, Some(Outcome::Success));
    assert_eq!(snap.last_volume, 2.0);
    assert_eq!(snap.last_duration, 720);

    node.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rain_skips_when_floor_disabled() {
    let node = start_node(node_cfg(vec![circuit_cfg(1)], 0.0), rainy_weather()).await;

    node.controller.start_auto_cycle().await.unwrap();
    // Nothing runs: the plan is empty after the skip decision.
    assert_eq!(node.controller.refresh_state(), ControllerState::Idle);

    let status = node.controller.status().await.unwrap();
    let snap = snapshot_of(&status, 1);
    assert_eq!(snap.last_outcome, Some(Outcome::Skipped));
    // No prior irrigation: the metrics stay untouched.
    assert_eq!(snap.last_irrigation, None);
    assert_eq!(snap.last_volume, 0.0);
    assert!(snap.last_decision.is_some());

    let circuit = node.controller.circuit(1).unwrap();
    assert_eq!(circuit.valve_state().await, ValveState::Closed);

    node.controller.shutdown().await;
}

// ---------------------------------------------------------------------------
// S3 — manual run stopped at 25%
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn manual_run_stopped_midway() {
    let node = start_node(node_cfg(vec![circuit_cfg(1)], 20.0), standard_weather()).await;
    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = Arc::clone(&observed);
        node.controller.on_state_changed(move |state| {
            sink.lock().unwrap().push(state);
        });
    }

    node.controller.manual_irrigate(1, 10.0).await.unwrap();
    wait_for_state(&node.controller, ControllerState::Irrigating).await;
    tokio::time::sleep(Duration::from_secs(900)).await;

    // Two transient relay write failures stretch the close long enough for
    // the STOPPING state to be observable, without failing the run.
    let circuit = node.controller.circuit(1).unwrap();
    circuit.inject_valve_failures(2).await;

    let stopper = {
        let controller = Arc::clone(&node.controller);
        tokio::spawn(async move { controller.stop_all().await })
    };
    wait_until_idle(&node.controller).await;
    stopper.await.unwrap().unwrap();

    let status = node.controller.status().await.unwrap();
    let snap = snapshot_of(&status, 1);
    assert_eq!(snap.last_outcome, Some(Outcome::Stopped));
    assert!(snap.last_duration >= 900 && snap.last_duration <= 901);
    // ±flow×1 s around 2.5 L.
    assert!((snap.last_volume - 2.5).abs() <= 10.0 / 3600.0 + 1e-9);
    assert_eq!(circuit.valve_state().await, ValveState::Closed);
    assert!(!circuit.has_fault());

    let states = observed.lock().unwrap().clone();
    assert!(states.contains(&ControllerState::Irrigating));
    assert!(states.contains(&ControllerState::Stopping));
    assert_eq!(states.last(), Some(&ControllerState::Idle));

    node.controller.shutdown().await;
}

// ---------------------------------------------------------------------------
// S4 — unclean shutdown recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unclean_shutdown_marks_interrupted() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("zones_state.json");
    let log_path = dir.path().join("irrigation_log.json");

    // A state file left behind by a process that died mid-irrigation.
    let stale = ZonesStateFile {
        last_updated: Utc::now(),
        circuits: vec![CircuitSnapshot {
            id: 2,
            circuit_state: CircuitState::Irrigating,
            last_decision: None,
            last_outcome: None,
            last_irrigation: None,
            last_duration: 0,
            last_volume: 0.0,
        }],
    };
    std::fs::write(&state_path, serde_json::to_vec_pretty(&stale).unwrap()).unwrap();

    let controller = Controller::with_provider(
        node_cfg(vec![circuit_cfg(2)], 20.0),
        &state_path,
        &log_path,
        standard_weather(),
    )
    .await
    .unwrap();

    let status = controller.status().await.unwrap();
    let snap = snapshot_of(&status, 2);
    assert_eq!(snap.circuit_state, CircuitState::Idle);
    assert_eq!(snap.last_outcome, Some(Outcome::Interrupted));
    assert_eq!(snap.last_duration, 0);
    assert_eq!(snap.last_volume, 0.0);
    assert!(snap.last_irrigation.is_some());

    let log: Vec<irrigation_node::types::IrrigationResult> =
        serde_json::from_slice(&std::fs::read(&log_path).unwrap()).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, Outcome::Interrupted);
    assert_eq!(log[0].circuit_id, 2);
}

#[tokio::test(start_paused = true)]
async fn clean_restart_leaves_no_interrupted_record() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("zones_state.json");
    let log_path = dir.path().join("irrigation_log.json");

    {
        let controller = Controller::with_provider(
            node_cfg(vec![circuit_cfg(1)], 20.0),
            &state_path,
            &log_path,
            standard_weather(),
        )
        .await
        .unwrap();
        controller.start().unwrap();
        controller.manual_irrigate(1, 10.0).await.unwrap();
        wait_for_state(&controller, ControllerState::Irrigating).await;
        controller.shutdown().await;
    }

    let controller = Controller::with_provider(
        node_cfg(vec![circuit_cfg(1)], 20.0),
        &state_path,
        &log_path,
        standard_weather(),
    )
    .await
    .unwrap();
    let status = controller.status().await.unwrap();
    let snap = snapshot_of(&status, 1);
    assert_eq!(snap.circuit_state, CircuitState::Idle);
    // The mid-run shutdown stopped the irrigation cleanly.
    assert_eq!(snap.last_outcome, Some(Outcome::Stopped));
    let log: Vec<irrigation_node::types::IrrigationResult> =
        serde_json::from_slice(&std::fs::read(&log_path).unwrap()).unwrap();
    assert!(log.iter().all(|r| r.outcome != Outcome::Interrupted));
}

// ---------------------------------------------------------------------------
// S5 — two circuits in parallel, one faults on close
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn single_circuit_fault_does_not_take_down_the_node() {
    let node = start_node(
        node_cfg(vec![circuit_cfg(1), circuit_cfg(3)], 20.0),
        standard_weather(),
    )
    .await;

    node.controller.start_auto_cycle().await.unwrap();
    wait_for_state(&node.controller, ControllerState::Irrigating).await;

    // Poison circuit 3's relay so its final close exhausts its retries.
    tokio::time::sleep(Duration::from_secs(5)).await;
    node.controller
        .circuit(3)
        .unwrap()
        .inject_valve_failures(10)
        .await;

    wait_until_idle(&node.controller).await;

    let status = node.controller.status().await.unwrap();
    assert_eq!(
        snapshot_of(&status, 1).last_outcome,
        Some(Outcome::Success)
    );
    assert_eq!(snapshot_of(&status, 3).last_outcome, Some(Outcome::Failed));

    let faulted = node.controller.circuit(3).unwrap();
    assert!(faulted.has_fault());
    assert!(!node.controller.circuit(1).unwrap().has_fault());

    // A single hardware fault is not a controller-level error.
    assert_eq!(node.controller.controller_state(), ControllerState::Idle);

    node.controller.shutdown().await;
}

// ---------------------------------------------------------------------------
// S6 — double start rejected
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn double_start_rejected_while_irrigating() {
    let node = start_node(node_cfg(vec![circuit_cfg(1)], 20.0), standard_weather()).await;

    node.controller.manual_irrigate(1, 10.0).await.unwrap();
    wait_for_state(&node.controller, ControllerState::Irrigating).await;

    let err = node.controller.manual_irrigate(1, 5.0).await.unwrap_err();
    assert!(matches!(
        err,
        CommandError::Worker(WorkerError::AlreadyExists { .. })
    ));

    // The first run is unaffected and completes on schedule.
    wait_until_idle(&node.controller).await;
    let status = node.controller.status().await.unwrap();
    let snap = snapshot_of(&status, 1);
    assert_eq!(snap.last_outcome, Some(Outcome::Success));
    assert_eq!(snap.last_volume, 10.0);

    node.controller.shutdown().await;
}

// ---------------------------------------------------------------------------
// Interval bookkeeping across cycles
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn second_cycle_same_day_finds_nothing_due() {
    let node = start_node(node_cfg(vec![circuit_cfg(1)], 20.0), standard_weather()).await;

    node.controller.start_auto_cycle().await.unwrap();
    wait_for_state(&node.controller, ControllerState::Irrigating).await;
    wait_until_idle(&node.controller).await;
    wait_for_cycle_end(&node.controller).await;

    // Same calendar day: the interval has not elapsed.
    node.controller.start_auto_cycle().await.unwrap();
    assert_eq!(node.controller.refresh_state(), ControllerState::Idle);

    let status = node.controller.status().await.unwrap();
    // Still exactly one successful run on record.
    assert_eq!(
        snapshot_of(&status, 1).last_outcome,
        Some(Outcome::Success)
    );

    node.controller.shutdown().await;
}
