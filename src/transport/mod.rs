//! Broker transport for detection results.
//!
//! - `tls`: endpoint parsing and plain/TLS transport selection
//! - `mqtt`: the subscriber that feeds the detection store

mod mqtt;
mod tls;

pub use mqtt::{MqttHandle, MqttSettings, MqttSubscriber};
pub use tls::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};
