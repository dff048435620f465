use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tungstenite::WebSocket;

use edge_gateway::api::{ApiConfig, ApiHandle, ApiServer, AppState};
use edge_gateway::config::GatewayConfig;
use edge_gateway::events::{OutboundEvent, StatusField};
use edge_gateway::DetectionBatch;

const HUB_USER: &str = "trainer";
const GOOD_TOKEN: &str = "token good-token";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some(GOOD_TOKEN)
}

fn hub_user() -> Value {
    json!({
        "name": HUB_USER,
        "admin": false,
        "server": "/user/trainer/",
        "last_activity": "2024-01-01T00:00:00Z",
    })
}

/// A notebook hub whose single-user server is always up.
fn spawn_mock_hub() -> SocketAddr {
    let app = Router::new()
        .route(
            "/hub/api/users",
            get(|headers: HeaderMap| async move {
                if authorized(&headers) {
                    (StatusCode::OK, Json(json!([hub_user()])))
                } else {
                    (StatusCode::FORBIDDEN, Json(json!({ "message": "bad token" })))
                }
            }),
        )
        .route(
            "/hub/api/users/{user}",
            get(|Path(_user): Path<String>| async { Json(hub_user()) }),
        )
        .route(
            "/hub/api/users/{user}/server",
            post(|| async { (StatusCode::BAD_REQUEST, Json(json!({}))) }),
        )
        .route(
            "/user/{user}/api/contents/{*path}",
            put(|| async { (StatusCode::CREATED, Json(json!({}))) }),
        )
        .route(
            "/user/{user}/api/kernels",
            post(|| async { (StatusCode::CREATED, Json(json!({ "id": "kernel-1" }))) }),
        )
        .route(
            "/user/{user}/api/kernels/{id}/execute",
            post(|| async { Json(json!({ "status": "ok" })) }),
        );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let listener = runtime
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        runtime.block_on(async move {
            axum::serve(listener, app).await.unwrap();
        })
    });
    addr
}

struct Gateway {
    handle: ApiHandle,
    state: AppState,
    base: String,
    _uploads: TempDir,
}

impl Gateway {
    fn start(hub_url: &str) -> Self {
        let uploads = tempfile::tempdir().unwrap();
        let mut cfg = GatewayConfig::default();
        cfg.rtsp.url = "stub://lobby".to_string();
        cfg.rtsp.reconnect_backoff = Duration::from_millis(100);
        cfg.mqtt.broker_addr = "127.0.0.1:1".to_string();
        cfg.mqtt.reconnect_backoff = Duration::from_millis(100);
        cfg.stream.display_width = 320;
        cfg.stream.frame_interval = Duration::from_millis(50);
        cfg.stream.ws_poll_interval = Duration::from_millis(50);
        cfg.stream.ws_status_every = 2;
        cfg.hub.url = hub_url.to_string();
        cfg.hub.user = HUB_USER.to_string();
        cfg.hub.upload_dir = uploads.path().to_path_buf();
        cfg.hub.edge_device_ip = "10.1.2.3".to_string();

        let api = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        };
        let state = AppState::new(cfg);
        let handle = ApiServer::new(api, state.clone()).spawn().unwrap();
        let base = format!("http://{}", handle.addr);
        Self {
            handle,
            state,
            base,
            _uploads: uploads,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn get(&self, path: &str) -> (u16, Value) {
        read(ureq::get(&self.url(path)).call())
    }

    fn post(&self, path: &str, body: Value) -> (u16, Value) {
        read(ureq::post(&self.url(path)).send_json(body))
    }

    fn open_socket(&self) -> WebSocket<TcpStream> {
        let stream = TcpStream::connect(self.handle.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let url = format!("ws://{}/api/stream/detections", self.handle.addr);
        let (socket, _) = tungstenite::client(url, stream)
            .unwrap_or_else(|e| panic!("websocket handshake failed: {}", e));
        socket
    }

    fn active_websockets(&self) -> u64 {
        let (_, body) = self.get("/api/stream/status");
        body["active_websockets"].as_u64().unwrap()
    }

    fn stop(self) {
        self.handle.stop().unwrap();
    }
}

/// Next JSON event of the given `type`, skipping everything else.
fn next_event(socket: &mut WebSocket<TcpStream>, kind: &str) -> Value {
    loop {
        let message = socket.read().unwrap();
        if !message.is_text() {
            continue;
        }
        let event: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
        if event["type"] == kind {
            return event;
        }
    }
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

fn read(result: Result<ureq::Response, ureq::Error>) -> (u16, Value) {
    let response = match result {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(e) => panic!("request failed: {}", e),
    };
    let status = response.status();
    (status, response.into_json().unwrap())
}

fn multipart_body(boundary: &str, object_name: &str, parts: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"object_name\"\r\n\r\n{}\r\n",
            boundary, object_name
        )
        .as_bytes(),
    );
    for (index, (content_type, bytes)) in parts.iter().enumerate() {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"f{}\"\r\nContent-Type: {}\r\n\r\n",
                boundary, index, content_type
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    body
}

#[test]
fn service_routes_report_idle_state() {
    let gateway = Gateway::start("http://127.0.0.1:1");

    let (code, body) = gateway.get("/");
    assert_eq!(code, 200);
    assert_eq!(body["message"], "Edge ML Operations API is running");

    let (code, body) = gateway.get("/health");
    assert_eq!(code, 200);
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());

    let (code, body) = gateway.get("/api/stream/status");
    assert_eq!(code, 200);
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["is_running"], false);
    assert_eq!(body["active_websockets"], 0);
    assert_eq!(body["hub_user"], HUB_USER);
    assert_eq!(body["rtsp_url"], "stub://lobby");

    let (code, body) = gateway.get("/api/stream/detections/current");
    assert_eq!(code, 200);
    assert_eq!(body["count"], 0);
    assert_eq!(body["detections"], json!([]));

    let (code, body) = gateway.post("/api/stream/stop", json!({}));
    assert_eq!(code, 200);
    assert_eq!(body["status"], "stopped");

    gateway.stop();
}

#[test]
fn stream_start_is_idempotent() {
    let gateway = Gateway::start("http://127.0.0.1:1");

    let (code, body) = gateway.post("/api/stream/start", json!({}));
    assert_eq!(code, 200);
    assert_eq!(body["status"], "started");
    assert_eq!(body["is_running"], true);

    let (code, body) = gateway.post("/api/stream/start", json!({}));
    assert_eq!(code, 200);
    assert_eq!(body["status"], "already_running");

    let (_, body) = gateway.get("/api/stream/status");
    assert_eq!(body["status"], "available");

    let (code, _) = gateway.post("/api/stream/stop", json!({}));
    assert_eq!(code, 200);
    let (_, body) = gateway.get("/api/stream/status");
    assert_eq!(body["is_running"], false);
    assert_eq!(body["frame_queue_size"], 0);

    gateway.stop();
}

#[test]
fn video_route_streams_jpeg_parts() {
    let gateway = Gateway::start("http://127.0.0.1:1");

    let response = ureq::get(&gateway.url("/api/stream/video")).call().unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .header("content-type")
        .unwrap()
        .starts_with("multipart/x-mixed-replace; boundary=frame"));

    let mut reader = response.into_reader();
    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(10);
    while received.len() < 256 && Instant::now() < deadline {
        let n = reader.read(&mut chunk).unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&chunk[..n]);
    }
    drop(reader);

    let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    assert!(received.starts_with(header));
    assert_eq!(&received[header.len()..header.len() + 2], &[0xFF, 0xD8]);

    // The first viewer starts the stream services.
    let (_, body) = gateway.get("/api/stream/status");
    assert_eq!(body["is_running"], true);

    gateway.stop();
}

#[test]
fn websocket_viewers_share_events_and_heartbeats() {
    let gateway = Gateway::start("http://127.0.0.1:1");
    let events = gateway.state.session.events().clone();

    let mut first = gateway.open_socket();
    let mut second = gateway.open_socket();
    assert!(wait_until(Duration::from_secs(5), || {
        events.subscriber_count() == 2
    }));
    assert_eq!(gateway.active_websockets(), 2);

    let heartbeat = next_event(&mut first, "status");
    assert_eq!(heartbeat["is_running"], false);
    assert_eq!(heartbeat["mqtt_connected"], false);
    assert_eq!(heartbeat["active_detections"], 0);
    assert!(heartbeat["timestamp"].is_string());

    assert_eq!(
        events.publish(OutboundEvent::status_change(StatusField::MqttConnected, true)),
        2
    );
    for socket in [&mut first, &mut second] {
        let change = next_event(socket, "status_change");
        assert_eq!(change["status_type"], "mqtt_connected");
        assert_eq!(change["status_value"], true);
    }

    let batch = DetectionBatch::from_payload(
        br#"{"timestamp": "t-1", "detected_faces": [
            {"box": [10, 20, 30, 40], "name": "Ada", "confidence": 90, "person_id": 7}
        ]}"#,
    )
    .unwrap();
    assert!(events.publish_detections(&batch));
    for socket in [&mut first, &mut second] {
        let detections = next_event(socket, "detections");
        assert_eq!(detections["timestamp"], "t-1");
        assert_eq!(detections["frame_dimensions"]["width"], 1280);
        assert_eq!(detections["data"][0]["name"], "Ada");
        assert_eq!(detections["data"][0]["person_id"], 7);
        assert_eq!(detections["data"][0]["box"], json!([10.0, 20.0, 30.0, 40.0]));
    }

    // One viewer leaving does not affect the other.
    first.close(None).unwrap();
    while first.read().is_ok() {}
    assert!(wait_until(Duration::from_secs(5), || {
        gateway.active_websockets() == 1
    }));

    let waiting = Instant::now();
    next_event(&mut second, "status");
    assert!(waiting.elapsed() < Duration::from_millis(1500));
    assert_eq!(
        events.publish(OutboundEvent::status_change(StatusField::RtspConnected, false)),
        1
    );
    let change = next_event(&mut second, "status_change");
    assert_eq!(change["status_type"], "rtsp_connected");

    second.close(None).unwrap();
    while second.read().is_ok() {}
    assert!(wait_until(Duration::from_secs(5), || {
        gateway.active_websockets() == 0
    }));

    gateway.stop();
}

#[test]
fn hub_routes_require_a_verified_token() {
    let gateway = Gateway::start("http://127.0.0.1:1");

    let (code, body) = gateway.get("/api/hub/status");
    assert_eq!(code, 200);
    assert_eq!(body["status"], "disconnected");
    assert_eq!(body["message"], "No token configured");

    let (code, body) = gateway.post("/api/hub/start-server", json!({}));
    assert_eq!(code, 401);
    assert!(body["detail"].is_string());

    let (code, _) = gateway.post("/api/deployment/start", json!({ "model_type": "rf" }));
    assert_eq!(code, 401);

    let (code, _) = gateway.post("/api/deployment/start", json!({ "model_type": "rf model" }));
    assert_eq!(code, 400);

    let (code, body) = gateway.get("/api/deployment/status/does-not-exist");
    assert_eq!(code, 404);
    assert_eq!(body["detail"], "Deployment ID not found");

    let (code, body) = gateway.get("/api/system/info");
    assert_eq!(code, 200);
    assert_eq!(body["hub_url"], "http://127.0.0.1:1");
    assert_eq!(body["hub_user"], HUB_USER);
    assert_eq!(body["edge_device_ip"], "10.1.2.3");
    assert_eq!(body["connected"], false);
    assert_eq!(body["active_deployments"], 0);

    let (code, body) = gateway.post("/api/hub/connect", json!({ "token": "good-token" }));
    assert_eq!(code, 500);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .starts_with("Connection failed"));

    gateway.stop();
}

#[test]
fn training_upload_and_deployment_against_hub() {
    let hub = spawn_mock_hub();
    let gateway = Gateway::start(&format!("http://{}", hub));

    let (code, body) = gateway.post("/api/hub/connect", json!({ "token": "wrong" }));
    assert_eq!(code, 401);
    assert_eq!(body["detail"], "Invalid JupyterHub token");

    let (code, body) = gateway.post("/api/hub/connect", json!({ "token": "good-token" }));
    assert_eq!(code, 200);
    assert_eq!(body["status"], "connected");
    assert_eq!(body["user_info"]["name"], HUB_USER);
    assert_eq!(body["user_info"]["server_running"], true);

    let (code, body) = gateway.get("/api/hub/status");
    assert_eq!(code, 200);
    assert_eq!(body["status"], "connected");
    assert_eq!(body["user_info"]["last_activity"], "2024-01-01T00:00:00Z");

    let (code, body) = gateway.post("/api/hub/start-server", json!({}));
    assert_eq!(code, 200);
    assert_eq!(body["status"], "already_running");

    let boundary = "edge-gateway-test";
    let upload = multipart_body(
        boundary,
        "alice",
        &[
            ("image/jpeg", &b"\xFF\xD8\xFF\xD9"[..]),
            ("text/plain", &b"not an image"[..]),
            ("image/png", &b"\x89PNG"[..]),
        ],
    );
    let (code, body) = read(
        ureq::post(&gateway.url("/api/training/upload"))
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .send_bytes(&upload),
    );
    assert_eq!(code, 200, "{}", body);
    assert_eq!(body["object_name"], "alice");
    assert_eq!(body["files_uploaded"], 2);
    assert_eq!(body["training_id"].as_str().unwrap().len(), 32);

    let text_only = multipart_body(boundary, "bob", &[("text/plain", &b"nope"[..])]);
    let (code, body) = read(
        ureq::post(&gateway.url("/api/training/upload"))
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .send_bytes(&text_only),
    );
    assert_eq!(code, 400);
    assert_eq!(body["detail"], "No valid image files found");

    let (code, body) = gateway.post(
        "/api/deployment/start",
        json!({ "model_type": "rf']); import os; os.system('id'); (['" }),
    );
    assert_eq!(code, 400);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .starts_with("invalid model_type"));

    let (code, body) = gateway.post("/api/deployment/start", json!({}));
    assert_eq!(code, 200);
    assert_eq!(body["status"], "started");
    let id = body["deployment_id"].as_str().unwrap().to_string();

    let deadline = Instant::now() + Duration::from_secs(10);
    let job = loop {
        let (code, job) = gateway.get(&format!("/api/deployment/status/{}", id));
        assert_eq!(code, 200);
        let finished = job["status"] == "completed" || job["status"] == "failed";
        if finished || Instant::now() > deadline {
            break job;
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(job["status"], "completed", "{}", job);
    assert_eq!(job["progress"], 100);
    assert!(job["completed_at"].is_string());

    let (_, info) = gateway.get("/api/system/info");
    assert_eq!(info["connected"], true);
    assert_eq!(info["active_deployments"], 0);

    let (code, body) = gateway.post("/api/system/cleanup", json!({}));
    assert_eq!(code, 200);
    assert_eq!(body["message"], "Cleanup completed");
    assert_eq!(body["removed_uploads"], 1);
    assert_eq!(body["removed_jobs"], 1);

    let (code, _) = gateway.get(&format!("/api/deployment/status/{}", id));
    assert_eq!(code, 404);

    gateway.stop();
}
