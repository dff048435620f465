use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::RtspConfig;
use crate::transport::{parse_mqtt_endpoint, MqttSettings, TlsMaterials};

const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_RTSP_URL: &str = "rtsp://192.168.2.100:8554/test";
const DEFAULT_RTSP_FPS: u32 = 10;
const DEFAULT_BACKOFF_MS: u64 = 5_000;
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_TOPIC: &str = "jetson/face_recognition/results";
const DEFAULT_MQTT_CLIENT_ID: &str = "edge_gateway";
const DEFAULT_MQTT_KEEP_ALIVE_SECS: u64 = 60;
const DEFAULT_FRAME_BUFFER_CAPACITY: usize = crate::frame::DEFAULT_FRAME_BUFFER_CAPACITY;
const DEFAULT_DISPLAY_WIDTH: u32 = crate::render::DEFAULT_TARGET_WIDTH;
const DEFAULT_JPEG_QUALITY: u8 = crate::render::DEFAULT_JPEG_QUALITY;
const DEFAULT_FRAME_INTERVAL_MS: u64 = 333;
const DEFAULT_EVENT_QUEUE_CAPACITY: usize = crate::events::DEFAULT_EVENT_QUEUE_CAPACITY;
const DEFAULT_WS_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_WS_STATUS_EVERY: u32 = 10;
const DEFAULT_HUB_URL: &str = "http://10.70.0.64";
const DEFAULT_HUB_USER: &str = "akumar";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_EDGE_DEVICE_IP: &str = "192.168.2.100";
const DEFAULT_HUB_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_HUB_DEPLOY_TIMEOUT_SECS: u64 = 180;
const DEFAULT_HUB_CONTENTS_ROOT: &str = "face_recognition_system/edge_server/images";
const DEFAULT_DEPLOY_COMMAND: &str = "import subprocess, sys\n\
result = subprocess.run([sys.executable, 'simple_file_transfer.py', '--model', '{model}'], \
capture_output=True, text=True, timeout=120)\n\
print(result.stdout)\n\
print(result.stderr)\n\
print('Return code:', result.returncode)\n";

/// Placeholder substituted with the requested model type in `hub.deploy_command`.
pub const MODEL_PLACEHOLDER: &str = "{model}";

#[derive(Debug, Deserialize, Default)]
struct GatewayConfigFile {
    api: Option<ApiConfigFile>,
    rtsp: Option<RtspConfigFile>,
    mqtt: Option<MqttConfigFile>,
    stream: Option<StreamConfigFile>,
    hub: Option<HubConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RtspConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    reconnect_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
    keep_alive_secs: Option<u64>,
    reconnect_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    frame_buffer_capacity: Option<usize>,
    display_width: Option<u32>,
    jpeg_quality: Option<u8>,
    frame_interval_ms: Option<u64>,
    event_queue_capacity: Option<usize>,
    ws_poll_interval_ms: Option<u64>,
    ws_status_every: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct HubConfigFile {
    url: Option<String>,
    user: Option<String>,
    upload_dir: Option<PathBuf>,
    edge_device_ip: Option<String>,
    request_timeout_secs: Option<u64>,
    deploy_timeout_secs: Option<u64>,
    contents_root: Option<String>,
    deploy_command: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_addr: String,
    pub rtsp: RtspSettings,
    pub mqtt: MqttConfig,
    pub stream: StreamSettings,
    pub hub: HubSettings,
}

#[derive(Debug, Clone)]
pub struct RtspSettings {
    pub url: String,
    pub target_fps: u32,
    pub reconnect_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_addr: String,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub keep_alive: Duration,
    pub reconnect_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub frame_buffer_capacity: usize,
    pub display_width: u32,
    pub jpeg_quality: u8,
    pub frame_interval: Duration,
    pub event_queue_capacity: usize,
    pub ws_poll_interval: Duration,
    pub ws_status_every: u32,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub url: String,
    pub user: String,
    pub upload_dir: PathBuf,
    pub edge_device_ip: String,
    pub request_timeout: Duration,
    pub deploy_timeout: Duration,
    pub contents_root: String,
    pub deploy_command: String,
}

impl GatewayConfig {
    /// Defaults, then the JSON file named by `EDGE_GATEWAY_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("EDGE_GATEWAY_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => GatewayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GatewayConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let rtsp = file.rtsp.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let hub = file.hub.unwrap_or_default();

        Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            rtsp: RtspSettings {
                url: rtsp.url.unwrap_or_else(|| DEFAULT_RTSP_URL.to_string()),
                target_fps: rtsp.target_fps.unwrap_or(DEFAULT_RTSP_FPS),
                reconnect_backoff: Duration::from_millis(
                    rtsp.reconnect_backoff_ms.unwrap_or(DEFAULT_BACKOFF_MS),
                ),
            },
            mqtt: MqttConfig {
                broker_addr: mqtt
                    .broker_addr
                    .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
                topic: mqtt.topic.unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                use_tls: mqtt.use_tls.unwrap_or(false),
                tls_ca_path: mqtt.tls_ca_path,
                tls_client_cert_path: mqtt.tls_client_cert_path,
                tls_client_key_path: mqtt.tls_client_key_path,
                keep_alive: Duration::from_secs(
                    mqtt.keep_alive_secs.unwrap_or(DEFAULT_MQTT_KEEP_ALIVE_SECS),
                ),
                reconnect_backoff: Duration::from_millis(
                    mqtt.reconnect_backoff_ms.unwrap_or(DEFAULT_BACKOFF_MS),
                ),
            },
            stream: StreamSettings {
                frame_buffer_capacity: stream
                    .frame_buffer_capacity
                    .unwrap_or(DEFAULT_FRAME_BUFFER_CAPACITY),
                display_width: stream.display_width.unwrap_or(DEFAULT_DISPLAY_WIDTH),
                jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                frame_interval: Duration::from_millis(
                    stream.frame_interval_ms.unwrap_or(DEFAULT_FRAME_INTERVAL_MS),
                ),
                event_queue_capacity: stream
                    .event_queue_capacity
                    .unwrap_or(DEFAULT_EVENT_QUEUE_CAPACITY),
                ws_poll_interval: Duration::from_millis(
                    stream
                        .ws_poll_interval_ms
                        .unwrap_or(DEFAULT_WS_POLL_INTERVAL_MS),
                ),
                ws_status_every: stream.ws_status_every.unwrap_or(DEFAULT_WS_STATUS_EVERY),
            },
            hub: HubSettings {
                url: hub.url.unwrap_or_else(|| DEFAULT_HUB_URL.to_string()),
                user: hub.user.unwrap_or_else(|| DEFAULT_HUB_USER.to_string()),
                upload_dir: hub
                    .upload_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
                edge_device_ip: hub
                    .edge_device_ip
                    .unwrap_or_else(|| DEFAULT_EDGE_DEVICE_IP.to_string()),
                request_timeout: Duration::from_secs(
                    hub.request_timeout_secs
                        .unwrap_or(DEFAULT_HUB_REQUEST_TIMEOUT_SECS),
                ),
                deploy_timeout: Duration::from_secs(
                    hub.deploy_timeout_secs
                        .unwrap_or(DEFAULT_HUB_DEPLOY_TIMEOUT_SECS),
                ),
                contents_root: hub
                    .contents_root
                    .unwrap_or_else(|| DEFAULT_HUB_CONTENTS_ROOT.to_string()),
                deploy_command: hub
                    .deploy_command
                    .unwrap_or_else(|| DEFAULT_DEPLOY_COMMAND.to_string()),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("EDGE_GATEWAY_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = non_empty_env("EDGE_GATEWAY_RTSP_URL") {
            self.rtsp.url = url;
        }
        if let Some(broker) = non_empty_env("EDGE_GATEWAY_MQTT_BROKER") {
            self.mqtt.broker_addr = broker;
        }
        if let Some(topic) = non_empty_env("EDGE_GATEWAY_MQTT_TOPIC") {
            self.mqtt.topic = topic;
        }
        if let Some(user) = non_empty_env("EDGE_GATEWAY_MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(password) = non_empty_env("EDGE_GATEWAY_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(url) = non_empty_env("EDGE_GATEWAY_HUB_URL") {
            self.hub.url = url;
        }
        if let Some(user) = non_empty_env("EDGE_GATEWAY_HUB_USER") {
            self.hub.user = user;
        }
        if let Some(dir) = non_empty_env("EDGE_GATEWAY_UPLOAD_DIR") {
            self.hub.upload_dir = PathBuf::from(dir);
        }
        if let Some(capacity) = non_empty_env("EDGE_GATEWAY_EVENT_QUEUE_CAPACITY") {
            self.stream.event_queue_capacity = capacity.trim().parse().map_err(|_| {
                anyhow!("EDGE_GATEWAY_EVENT_QUEUE_CAPACITY must be a positive integer")
            })?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.stream.frame_buffer_capacity == 0 {
            return Err(anyhow!("stream.frame_buffer_capacity must be greater than zero"));
        }
        if self.stream.display_width == 0 {
            return Err(anyhow!("stream.display_width must be greater than zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("stream.jpeg_quality must be between 1 and 100"));
        }
        if self.stream.frame_interval.is_zero() {
            return Err(anyhow!("stream.frame_interval_ms must be greater than zero"));
        }
        if self.stream.event_queue_capacity == 0 {
            return Err(anyhow!("stream.event_queue_capacity must be greater than zero"));
        }
        if self.stream.ws_poll_interval.is_zero() {
            return Err(anyhow!("stream.ws_poll_interval_ms must be greater than zero"));
        }
        if self.stream.ws_status_every == 0 {
            return Err(anyhow!("stream.ws_status_every must be greater than zero"));
        }
        parse_mqtt_endpoint(&self.mqtt.broker_addr, self.mqtt.use_tls)?;
        if self.mqtt.tls_client_cert_path.is_some() != self.mqtt.tls_client_key_path.is_some() {
            return Err(anyhow!(
                "mqtt.tls_client_cert_path and mqtt.tls_client_key_path must be set together"
            ));
        }
        if self.mqtt.topic.trim().is_empty() {
            return Err(anyhow!("mqtt.topic must not be empty"));
        }
        self.hub.url = self.hub.url.trim_end_matches('/').to_string();
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_file(GatewayConfigFile::default())
    }
}

impl RtspSettings {
    pub fn source_config(&self) -> RtspConfig {
        RtspConfig {
            url: self.url.clone(),
            target_fps: self.target_fps,
            ..RtspConfig::default()
        }
    }
}

impl MqttConfig {
    /// Resolve the endpoint and read TLS material from disk.
    pub fn settings(&self) -> Result<MqttSettings> {
        let endpoint = parse_mqtt_endpoint(&self.broker_addr, self.use_tls)?;
        let tls = TlsMaterials::load(
            self.tls_ca_path.as_deref(),
            self.tls_client_cert_path.as_deref(),
            self.tls_client_key_path.as_deref(),
        )?;
        Ok(MqttSettings {
            endpoint,
            topic: self.topic.clone(),
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: self.keep_alive,
            reconnect_backoff: self.reconnect_backoff,
            tls,
        })
    }
}

/// Longest accepted model type name.
pub const MAX_MODEL_TYPE_LEN: usize = 64;

impl HubSettings {
    /// The deploy snippet with the model type substituted.
    ///
    /// The model type lands inside Python source run on the hub, so only
    /// ASCII letters, digits, `_` and `-` are accepted.
    pub fn deploy_code(&self, model: &str) -> Result<String> {
        let valid = !model.is_empty()
            && model.len() <= MAX_MODEL_TYPE_LEN
            && model
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(anyhow!(
                "invalid model_type {:?}: expected 1-{} of [A-Za-z0-9_-]",
                model,
                MAX_MODEL_TYPE_LEN
            ));
        }
        Ok(self.deploy_command.replace(MODEL_PLACEHOLDER, model))
    }
}

fn read_config_file(path: &Path) -> Result<GatewayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}
