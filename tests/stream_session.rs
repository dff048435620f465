use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use edge_gateway::config::GatewayConfig;
use edge_gateway::events::{OutboundEvent, StatusField};
use edge_gateway::{StartOutcome, StreamSession};

fn offline_config() -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    cfg.rtsp.url = "stub://front-door".to_string();
    cfg.rtsp.target_fps = 20;
    cfg.rtsp.reconnect_backoff = Duration::from_millis(100);
    // Nothing listens on port 1; the subscriber keeps retrying.
    cfg.mqtt.broker_addr = "127.0.0.1:1".to_string();
    cfg.mqtt.reconnect_backoff = Duration::from_millis(100);
    cfg
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

#[test]
fn start_is_idempotent_and_stop_resets_state() {
    let session = StreamSession::new(offline_config());
    assert!(!session.is_running());

    assert_eq!(session.start().unwrap(), StartOutcome::Started);
    assert_eq!(session.start().unwrap(), StartOutcome::AlreadyRunning);
    assert!(session.is_running());

    assert!(wait_until(Duration::from_secs(5), || {
        let report = session.report();
        report.rtsp_connected && report.frame_queue_size > 0
    }));
    let report = session.report();
    assert!(report.is_running);
    assert!(!report.mqtt_connected);
    assert_eq!(report.rtsp_url, "stub://front-door");
    assert_eq!(report.mqtt_broker, "127.0.0.1:1");

    session.stop();
    let report = session.report();
    assert!(!report.is_running);
    assert!(!report.rtsp_connected);
    assert!(!report.mqtt_connected);
    assert_eq!(report.active_detections, 0);
    assert_eq!(report.frame_queue_size, 0);

    // A second stop is a no-op.
    session.stop();
    assert!(!session.is_running());
}

#[test]
fn concurrent_starts_launch_one_set_of_services() {
    const CALLERS: usize = 8;
    let session = Arc::new(StreamSession::new(offline_config()));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let callers: Vec<_> = (0..CALLERS)
        .map(|_| {
            let session = session.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                session.start().unwrap()
            })
        })
        .collect();
    let outcomes: Vec<StartOutcome> = callers
        .into_iter()
        .map(|caller| caller.join().unwrap())
        .collect();

    let started = outcomes
        .iter()
        .filter(|outcome| **outcome == StartOutcome::Started)
        .count();
    assert_eq!(started, 1, "{:?}", outcomes);
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == StartOutcome::AlreadyRunning)
            .count(),
        CALLERS - 1
    );
    assert!(session.is_running());

    session.stop();
    assert!(!session.is_running());
    assert_eq!(session.start().unwrap(), StartOutcome::Started);
    session.stop();
}

#[test]
fn session_can_restart_after_stop() {
    let session = StreamSession::new(offline_config());
    assert_eq!(session.start().unwrap(), StartOutcome::Started);
    session.stop();
    assert_eq!(session.start().unwrap(), StartOutcome::Started);
    assert!(session.is_running());
    session.stop();
}

#[test]
fn rtsp_status_changes_reach_viewers() {
    let session = StreamSession::new(offline_config());
    let mut viewer = session.events().subscribe();

    session.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || session
        .status()
        .rtsp_connected()));
    session.stop();

    let mut rtsp_changes = Vec::new();
    while let Ok(event) = viewer.try_recv() {
        if let OutboundEvent::StatusChange {
            status_type: StatusField::RtspConnected,
            status_value,
            ..
        } = event
        {
            rtsp_changes.push(status_value);
        }
    }
    assert_eq!(rtsp_changes.first(), Some(&true));
    assert_eq!(rtsp_changes.last(), Some(&false));
}

#[test]
fn compositor_renders_live_frames() {
    let mut cfg = offline_config();
    cfg.stream.display_width = 320;
    let session = StreamSession::new(cfg);
    session.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || session
        .report()
        .frame_queue_size
        > 0));

    let mut compositor = session.compositor();
    let image = compositor.render(320);
    assert_eq!(image.width(), 320);
    assert!(compositor.has_frame());
    session.stop();
}

#[test]
fn invalid_tls_material_fails_start_and_leaves_session_stopped() {
    let mut cfg = offline_config();
    cfg.mqtt.use_tls = true;
    cfg.mqtt.tls_ca_path = Some("/nonexistent/ca.pem".into());
    let session = StreamSession::new(cfg);

    assert!(session.start().is_err());
    assert!(!session.is_running());
}
