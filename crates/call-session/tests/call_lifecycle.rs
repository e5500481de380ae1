use std::sync::Arc;
use std::time::Duration;

use call_session::config::FALLBACK_CHANNEL_LABEL;
use call_session::session::SETTLE_DELAY;
use call_session::transport::mock::{MockCamera, MockPeerTransport};
use call_session::{
    CallConfig, CallController, CallError, CallEvent, CallPhase, ConnectMode, ConnectionState,
    TransportError,
};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn start(config: CallConfig) -> (Arc<MockPeerTransport>, CallController, broadcast::Receiver<CallEvent>) {
    init_tracing();
    let transport = Arc::new(MockPeerTransport::new());
    let controller = CallController::builder(transport.clone()).config(config).spawn();
    let events = controller.subscribe();
    (transport, controller, events)
}

fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn lifecycle(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    drain(events)
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                CallEvent::CallButtonPressed
                    | CallEvent::CallStarted
                    | CallEvent::CallEnded
                    | CallEvent::CallFailed
            )
        })
        .collect()
}

async fn settle(controller: &CallController) {
    tokio::time::sleep(SETTLE_DELAY + Duration::from_millis(10)).await;
    controller.status().await.expect("status");
}

async fn start_connected_call(
    transport: &MockPeerTransport,
    controller: &CallController,
) {
    controller.toggle_call().await;
    transport.emit_connection_state(ConnectionState::Connected);
    let status = controller.status().await.expect("status");
    assert_eq!(status.phase, CallPhase::Active);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn baseline_channel_exists_before_first_call() {
    let (transport, controller, _events) = start(CallConfig::default());

    let status = controller.status().await.expect("status");
    assert_eq!(status.phase, CallPhase::Idle);
    assert_eq!(status.channels.len(), 1);
    assert_ne!(status.channels[0], FALLBACK_CHANNEL_LABEL);
    assert_eq!(transport.open_requests(), status.channels);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn toggle_while_pending_is_ignored() {
    let (transport, controller, mut events) = start(CallConfig::default());

    controller.toggle_call().await;
    controller.toggle_call().await;
    controller.toggle_call().await;

    let status = controller.status().await.expect("status");
    assert_eq!(status.phase, CallPhase::Connecting);
    assert!(status.ignore_button_presses);
    assert!(!status.on_call);
    assert_eq!(transport.connect_calls(), vec![ConnectMode::IgnoreNonFatal]);
    assert_eq!(lifecycle(&mut events), vec![CallEvent::CallButtonPressed]);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn empty_defaults_fall_back_to_single_channel() {
    let (transport, controller, mut events) = start(CallConfig::default());
    let baseline = controller.status().await.expect("status").channels;

    controller.toggle_call().await;

    let status = controller.status().await.expect("status");
    assert!(status.channels.contains(&FALLBACK_CHANNEL_LABEL.to_string()));
    assert_eq!(status.channels.len(), 2);
    let mut expected = baseline.clone();
    expected.push(FALLBACK_CHANNEL_LABEL.to_string());
    assert_eq!(transport.open_requests(), expected);

    let added: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            CallEvent::DataChannelAdded(handle) => Some(handle.label().to_string()),
            _ => None,
        })
        .collect();
    assert!(added.contains(&FALLBACK_CHANNEL_LABEL.to_string()));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn fallback_creation_failure_never_connects() {
    let (transport, controller, mut events) = start(CallConfig::default());
    transport.fail_open(FALLBACK_CHANNEL_LABEL);

    controller.toggle_call().await;
    settle(&controller).await;

    assert!(transport.connect_calls().is_empty());
    assert_eq!(
        lifecycle(&mut events),
        vec![CallEvent::CallButtonPressed, CallEvent::CallFailed]
    );
    let status = controller.status().await.expect("status");
    assert_eq!(status.phase, CallPhase::Idle);
    assert!(!status.ignore_button_presses);
    assert_eq!(status.pending_messages, 0);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn allocation_stops_at_first_failing_label() {
    let config = CallConfig {
        default_reliable_channel_labels: vec!["clickedVideo".into(), "shapeModifiers".into()],
        default_unreliable_channel_labels: vec!["axisGizmo".into()],
        ..CallConfig::default()
    };
    let (transport, controller, mut events) = start(config);
    let baseline = controller.status().await.expect("status").channels;
    transport.fail_open("shapeModifiers");

    controller.toggle_call().await;
    settle(&controller).await;

    let mut expected = baseline.clone();
    expected.extend(["clickedVideo".to_string(), "shapeModifiers".to_string()]);
    assert_eq!(transport.open_requests(), expected);
    assert!(transport.released().contains(&"clickedVideo".to_string()));
    assert!(transport.connect_calls().is_empty());
    assert_eq!(
        lifecycle(&mut events),
        vec![CallEvent::CallButtonPressed, CallEvent::CallFailed]
    );
    assert!(controller.status().await.expect("status").channels.is_empty());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn repeated_connected_starts_call_once() {
    let (transport, controller, mut events) = start(CallConfig::default());

    start_connected_call(&transport, &controller).await;
    transport.emit_connection_state(ConnectionState::Completed);
    transport.emit_connection_state(ConnectionState::Connected);

    let status = controller.status().await.expect("status");
    assert!(status.on_call);
    assert!(!status.ignore_button_presses);
    assert_eq!(
        lifecycle(&mut events),
        vec![CallEvent::CallButtonPressed, CallEvent::CallStarted]
    );

    // The guard still fires for an active call but only disarms.
    tokio::time::sleep(Duration::from_secs(6)).await;
    let status = controller.status().await.expect("status");
    assert_eq!(status.phase, CallPhase::Active);
    assert!(lifecycle(&mut events).is_empty());
    assert_eq!(transport.reset_count(), 0);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn unanswered_call_times_out_once() {
    let config = CallConfig {
        call_timeout_seconds: 2.0,
        ..CallConfig::default()
    };
    let (transport, controller, mut events) = start(config);
    let started = tokio::time::Instant::now();

    controller.toggle_call().await;
    controller
        .try_send_message(&b"early"[..], FALLBACK_CHANNEL_LABEL)
        .await
        .expect("queued");
    tokio::time::sleep(Duration::from_millis(1_900)).await;
    let status = controller.status().await.expect("status");
    assert_eq!(status.pending_messages, 1);
    assert_eq!(lifecycle(&mut events), vec![CallEvent::CallButtonPressed]);

    loop {
        match events.recv().await.expect("event") {
            CallEvent::CallFailed => break,
            CallEvent::CallStarted => panic!("call should not start"),
            _ => {}
        }
    }
    assert!(started.elapsed() >= Duration::from_secs(2));
    let status = controller.status().await.expect("status");
    assert_eq!(status.pending_messages, 0);
    assert_eq!(status.channels.len(), 1);
    assert_ne!(status.channels[0], FALLBACK_CHANNEL_LABEL);

    tokio::time::sleep(Duration::from_secs(10)).await;
    controller.status().await.expect("status");
    assert!(lifecycle(&mut events).is_empty());
    assert_eq!(transport.reset_count(), 1);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn timeout_below_minimum_is_clamped() {
    let config = CallConfig {
        call_timeout_seconds: 0.1,
        ..CallConfig::default()
    };
    let (_transport, controller, mut events) = start(config);

    controller.toggle_call().await;
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    controller.status().await.expect("status");
    assert_eq!(lifecycle(&mut events), vec![CallEvent::CallButtonPressed]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    settle(&controller).await;
    assert_eq!(lifecycle(&mut events), vec![CallEvent::CallFailed]);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn hang_up_leaves_baseline_only() {
    let (transport, controller, mut events) = start(CallConfig::default());
    start_connected_call(&transport, &controller).await;
    let before = controller.status().await.expect("status").channels;

    controller
        .try_send_message(&b"queued"[..], FALLBACK_CHANNEL_LABEL)
        .await
        .expect("queued");
    assert_eq!(controller.status().await.expect("status").pending_messages, 1);

    controller.toggle_call().await;
    let status = controller.status().await.expect("status");
    assert_eq!(status.phase, CallPhase::Ending);
    assert!(!status.on_call);
    assert!(!status.ignore_button_presses);
    assert_eq!(status.pending_messages, 0);
    assert_eq!(status.channels.len(), 1);
    assert!(!before.contains(&status.channels[0]));
    assert_eq!(transport.reset_count(), 1);

    settle(&controller).await;
    assert_eq!(
        lifecycle(&mut events),
        vec![
            CallEvent::CallButtonPressed,
            CallEvent::CallStarted,
            CallEvent::CallEnded
        ]
    );
    assert_eq!(controller.status().await.expect("status").phase, CallPhase::Idle);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn transport_states_pick_end_notification() {
    let (transport, controller, mut events) = start(CallConfig::default());

    start_connected_call(&transport, &controller).await;
    transport.emit_connection_state(ConnectionState::Disconnected);
    settle(&controller).await;
    assert_eq!(lifecycle(&mut events).last(), Some(&CallEvent::CallEnded));

    start_connected_call(&transport, &controller).await;
    transport.emit_connection_state(ConnectionState::Failed);
    settle(&controller).await;
    assert_eq!(lifecycle(&mut events).last(), Some(&CallEvent::CallFailed));

    start_connected_call(&transport, &controller).await;
    transport.emit_error("dtls handshake failed");
    settle(&controller).await;
    assert_eq!(lifecycle(&mut events).last(), Some(&CallEvent::CallFailed));
    assert_eq!(transport.reset_count(), 3);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn stale_transport_close_while_idle_is_ignored() {
    let (transport, controller, mut events) = start(CallConfig::default());

    transport.emit_connection_state(ConnectionState::Closed);
    transport.emit_connection_state(ConnectionState::Failed);
    settle(&controller).await;

    assert!(lifecycle(&mut events).is_empty());
    assert_eq!(transport.reset_count(), 0);
    assert_eq!(controller.status().await.expect("status").phase, CallPhase::Idle);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn answering_side_failure_recycles_transport() {
    let (transport, controller, mut events) = start(CallConfig::default());
    let baseline = controller.status().await.expect("status").channels;

    transport.emit_connection_state(ConnectionState::Checking);
    controller
        .try_send_message(&b"hello"[..], baseline[0].as_str())
        .await
        .expect("queued");
    let status = controller.status().await.expect("status");
    assert_eq!(status.phase, CallPhase::Connecting);
    assert_eq!(status.pending_messages, 1);

    transport.emit_connection_state(ConnectionState::Failed);
    let status = controller.status().await.expect("status");
    assert_eq!(status.phase, CallPhase::Ending);
    assert_eq!(status.pending_messages, 0);
    assert_eq!(status.channels.len(), 1);
    assert_ne!(status.channels, baseline);
    assert_eq!(transport.reset_count(), 1);

    settle(&controller).await;
    assert_eq!(lifecycle(&mut events), vec![CallEvent::CallFailed]);
    assert_eq!(controller.status().await.expect("status").phase, CallPhase::Idle);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn answering_side_disconnect_ends_call() {
    let (transport, controller, mut events) = start(CallConfig::default());

    transport.emit_connection_state(ConnectionState::Checking);
    transport.emit_connection_state(ConnectionState::Connected);
    transport.emit_connection_state(ConnectionState::Disconnected);
    settle(&controller).await;

    assert_eq!(
        lifecycle(&mut events),
        vec![CallEvent::CallStarted, CallEvent::CallEnded]
    );
    assert_eq!(transport.reset_count(), 1);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn failed_during_connecting_cancels_timeout() {
    let (transport, controller, mut events) = start(CallConfig::default());

    controller.toggle_call().await;
    controller
        .try_send_message(&b"early"[..], FALLBACK_CHANNEL_LABEL)
        .await
        .expect("queued");
    transport.emit_connection_state(ConnectionState::Failed);
    let status = controller.status().await.expect("status");
    assert_eq!(status.pending_messages, 0);
    assert_eq!(status.channels.len(), 1);
    assert_ne!(status.channels[0], FALLBACK_CHANNEL_LABEL);

    settle(&controller).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    controller.status().await.expect("status");

    assert_eq!(
        lifecycle(&mut events),
        vec![CallEvent::CallButtonPressed, CallEvent::CallFailed]
    );
    assert_eq!(transport.reset_count(), 1);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn fatal_connect_error_fails_without_reset() {
    let (transport, controller, mut events) = start(CallConfig::default());
    transport.fail_connect(TransportError::Setup("offer rejected".into()));

    controller.toggle_call().await;

    let status = controller.status().await.expect("status");
    assert_eq!(status.phase, CallPhase::Idle);
    assert!(!status.ignore_button_presses);
    assert!(status.channels.is_empty());
    assert_eq!(transport.reset_count(), 0);
    assert_eq!(
        lifecycle(&mut events),
        vec![CallEvent::CallButtonPressed, CallEvent::CallFailed]
    );
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn non_fatal_connect_error_depends_on_mode() {
    let (transport, controller, mut events) = start(CallConfig::default());
    transport.fail_connect(TransportError::NonFatal("late candidate".into()));
    controller.toggle_call().await;
    assert_eq!(controller.status().await.expect("status").phase, CallPhase::Connecting);
    assert_eq!(lifecycle(&mut events), vec![CallEvent::CallButtonPressed]);

    let strict = CallConfig {
        ignore_non_fatal_connect_errors: false,
        ..CallConfig::default()
    };
    let (transport, controller, mut events) = start(strict);
    transport.fail_connect(TransportError::NonFatal("late candidate".into()));
    controller.toggle_call().await;
    assert_eq!(controller.status().await.expect("status").phase, CallPhase::Idle);
    assert_eq!(transport.connect_calls(), vec![ConnectMode::Strict]);
    assert_eq!(
        lifecycle(&mut events),
        vec![CallEvent::CallButtonPressed, CallEvent::CallFailed]
    );
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn camera_is_paused_around_reset_even_when_it_fails() {
    init_tracing();
    let transport = Arc::new(MockPeerTransport::new());
    let camera = Arc::new(MockCamera::new());
    camera.fail_toggles(true);
    let controller = CallController::builder(transport.clone())
        .camera(camera.clone())
        .spawn();

    start_connected_call(&transport, &controller).await;
    controller.toggle_call().await;
    controller.status().await.expect("status");

    assert_eq!(camera.toggles(), vec![false, true]);
    assert_eq!(transport.local_video_toggles(), vec![false, true]);
    assert_eq!(transport.reset_count(), 1);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn remote_channels_are_registered_and_routed() {
    let (transport, controller, mut events) = start(CallConfig::default());

    let remote = transport.add_remote_channel("peerCursor", false, false);
    controller.status().await.expect("status");
    let added: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            CallEvent::DataChannelAdded(handle) => Some(handle),
            _ => None,
        })
        .collect();
    let handle = added
        .iter()
        .find(|handle| handle.label() == "peerCursor")
        .expect("remote channel announced");
    assert!(!handle.ordered());

    remote.deliver(&b"{\"x\":1}"[..]);
    controller.status().await.expect("status");
    assert_eq!(
        drain(&mut events),
        vec![CallEvent::MessageReceived {
            label: "peerCursor".into(),
            payload: bytes::Bytes::from_static(b"{\"x\":1}"),
        }]
    );
    assert!(
        controller
            .status()
            .await
            .expect("status")
            .channels
            .contains(&"peerCursor".to_string())
    );
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn shutdown_stops_the_session() {
    let (transport, controller, mut events) = start(CallConfig::default());
    start_connected_call(&transport, &controller).await;

    controller.shutdown().await;

    assert!(matches!(controller.status().await, Err(CallError::ControllerStopped)));
    assert!(!controller.send_message(&b"late"[..], FALLBACK_CHANNEL_LABEL).await);
    assert_eq!(lifecycle(&mut events).last(), Some(&CallEvent::CallEnded));
    assert_eq!(transport.reset_count(), 1);
    assert!(transport.channel_labels().is_empty());
}
