//! Several controllers sharing one event stream: fatal errors stay local,
//! and the busy lock serializes loop and commands.

use futures::future::join_all;
use hv_control::{ControllerOptions, DeviceController};
use hv_core::events::{event_channel, DeviceEvent};
use hv_core::{DeviceConfig, HvError, TimingConfig};
use hv_driver_mock::SimulatedSupply;
use std::time::Duration;
use tokio::time::Instant;

fn device(id: &str, target: f64) -> DeviceConfig {
    DeviceConfig {
        id: id.into(),
        model: "sim".into(),
        address: String::new(),
        baud_rate: 9600,
        ramp_speed: 50.0,
        target_bias: target,
        min_bias: -500.0,
        max_bias: 500.0,
        max_step: 20.0,
        name: id.to_lowercase(),
        compliance: 100e-6,
        rear_output: false,
        allow_detached: true,
        hot_start: true,
    }
}

#[tokio::test(start_paused = true)]
async fn desync_halts_only_the_affected_device() {
    let (events, mut rx) = event_channel();
    let (supply_a, handle_a) = SimulatedSupply::builder().initial_state(0.0, true).build();
    let (supply_b, handle_b) = SimulatedSupply::builder().initial_state(0.0, true).build();

    let a = DeviceController::new(device("HV1", 0.0), Box::new(supply_a), ControllerOptions::default(), events.clone())
        .await
        .unwrap();
    let b = DeviceController::new(device("HV2", 0.0), Box::new(supply_b), ControllerOptions::default(), events)
        .await
        .unwrap();

    // The readback of HV1 never follows the setpoint.
    handle_a.freeze_measurement(0, Some(0.0));
    a.set_target_bias(0, 100.0).await.unwrap();

    let task_a = a.spawn();
    let task_b = b.spawn();

    let err = task_a.await.unwrap().unwrap_err();
    assert!(matches!(err, HvError::Desync { channel: 0, attempts: 10, .. }), "{err}");
    assert!(err.is_fatal());
    assert!(handle_a.output(), "a halted device keeps its output state");

    b.set_target_bias(0, -100.0).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handle_b.set_voltage_calls(0).last().copied(), Some(-100.0));
    assert!(!task_b.is_finished());

    let mut halted = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let DeviceEvent::Halted { device, .. } = event {
            halted.push(device);
        }
    }
    assert_eq!(halted, vec!["HV1".to_string()]);

    b.kill();
    task_b.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn desync_that_clears_within_retries_lets_the_ramp_continue() {
    let (events, _rx) = event_channel();
    let (supply, handle) = SimulatedSupply::builder().initial_state(0.0, true).build();
    let controller = DeviceController::new(device("HV1", 0.0), Box::new(supply), ControllerOptions::default(), events)
        .await
        .unwrap();

    // The readback lags the first step.
    handle.freeze_measurement(0, Some(0.0));
    controller.set_target_bias(0, 100.0).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    controller.poll_once().await.unwrap();
    assert_eq!(handle.set_voltage_calls(0), vec![20.0]);

    tokio::time::advance(Duration::from_secs(1)).await;
    let started = Instant::now();
    let poll = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.poll_once().await })
    };
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!poll.is_finished());
    assert_eq!(handle.set_voltage_calls(0), vec![20.0]);

    handle.freeze_measurement(0, None);
    poll.await.unwrap().unwrap();

    // Re-polls at 1 s, 2 s and 3 s; the third sees the supply caught up.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4), "{waited:?}");
    assert_eq!(handle.set_voltage_calls(0), vec![20.0, 40.0]);

    for _ in 0..10 {
        tokio::time::advance(Duration::from_secs(1)).await;
        controller.poll_once().await.unwrap();
    }
    assert_eq!(handle.set_voltage_calls(0).last().copied(), Some(100.0));
    assert!(!controller.is_ramping(0).unwrap());
}

#[tokio::test(start_paused = true)]
async fn loop_and_commands_never_overlap() {
    let (events, _rx) = event_channel();
    let (supply, handle) = SimulatedSupply::builder().initial_state(0.0, true).build();
    let controller = DeviceController::new(device("HV1", 0.0), Box::new(supply), ControllerOptions::default(), events)
        .await
        .unwrap();
    handle.set_latency(Duration::from_millis(30));

    let task = controller.spawn();
    let commands = (0..20).map(|i| {
        let controller = controller.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(17 * i)).await;
            controller.set_target_bias(0, f64::from(i as u32) * 10.0).await
        }
    });
    for result in join_all(commands).await {
        result.unwrap();
    }
    controller.set_output(true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    controller.kill();
    task.await.unwrap().unwrap();
    assert_eq!(handle.peak_concurrency(), 1);
    assert_eq!(controller.target_bias(0).unwrap(), 190.0);
}

#[tokio::test(start_paused = true)]
async fn invalid_configuration_never_builds() {
    let (events, _rx) = event_channel();
    let timing = TimingConfig::default();

    let mut inverted = device("HV1", 0.0);
    inverted.min_bias = 100.0;
    inverted.max_bias = -100.0;
    let err = DeviceController::connect(inverted, &timing, events.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, HvError::Config(_)));

    let mut unknown = device("HV2", 0.0);
    unknown.model = "2657".into();
    let err = DeviceController::connect(unknown, &timing, events.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, HvError::UnsupportedModel(ref m) if m == "2657"));

    let mut unreachable = device("HV3", 0.0);
    unreachable.model = "2410".into();
    unreachable.address = "/dev/hv-bias-does-not-exist".into();
    unreachable.allow_detached = false;
    let err = DeviceController::connect(unreachable, &timing, events)
        .await
        .unwrap_err();
    assert!(matches!(err, HvError::Connection { .. }), "{err}");
}

#[tokio::test(start_paused = true)]
async fn simulated_model_builds_from_configuration() {
    let (events, _rx) = event_channel();
    let mut config = device("SIM1", 0.0);
    config.hot_start = false;

    let controller = DeviceController::connect(config, &TimingConfig::default(), events)
        .await
        .unwrap();
    assert_eq!(controller.channel_count(), 1);
    assert_eq!(controller.name(), "sim1");
    controller.set_output(true).await.unwrap();
    controller.poll_once().await.unwrap();
    assert!(controller.status(0).unwrap());
}
