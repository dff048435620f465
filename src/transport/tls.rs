//! Broker addresses and the TLS side of the MQTT connection.
//!
//! An address is `host:port`, optionally with a scheme: `mqtt://`/`tcp://`
//! connect in the clear, `mqtts://`/`ssl://` over TLS. TLS verifies against
//! the configured CA file, or the bundled roots when none is set.

use anyhow::{anyhow, bail, Context, Result};
use rumqttc::Transport;
use std::path::Path;
use url::{Host, Url};

/// Where the subscriber connects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl std::fmt::Display for MqttEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        match self.host.parse::<std::net::Ipv6Addr>() {
            Ok(v6) => write!(f, "{}://[{}]:{}", scheme, v6, self.port),
            Err(_) => write!(f, "{}://{}:{}", scheme, self.host, self.port),
        }
    }
}

/// Parse a broker address; `force_tls` upgrades plain addresses to TLS.
pub fn parse_mqtt_endpoint(addr: &str, force_tls: bool) -> Result<MqttEndpoint> {
    let addr = addr.trim();
    let with_scheme = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("mqtt://{}", addr)
    };
    let url = Url::parse(&with_scheme).with_context(|| format!("invalid MQTT address {}", addr))?;

    let use_tls = match url.scheme() {
        "mqtt" | "tcp" => force_tls,
        "mqtts" | "ssl" => true,
        other => bail!("unsupported MQTT scheme {} in {}", other, addr),
    };
    let host = match url.host() {
        Some(Host::Domain(name)) if !name.is_empty() => name.to_string(),
        Some(Host::Ipv4(v4)) => v4.to_string(),
        Some(Host::Ipv6(v6)) => v6.to_string(),
        _ => bail!("MQTT address {} has no host", addr),
    };
    let port = url
        .port()
        .ok_or_else(|| anyhow!("MQTT address {} has no port", addr))?;

    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

/// PEM files for a TLS broker connection, already read from disk.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// Trusted CA bundle. `None` trusts the bundled roots.
    pub ca: Option<Vec<u8>>,
    /// Certificate and key presented for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    /// Read whichever files are configured. Certificate and key come as a pair.
    pub fn load(
        ca: Option<&Path>,
        client_cert: Option<&Path>,
        client_key: Option<&Path>,
    ) -> Result<Self> {
        let client_auth = match (client_cert, client_key) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some((
                read_pem(cert, "client certificate")?,
                read_pem(key, "client key")?,
            )),
            _ => bail!("MQTT client certificate and key must be configured together"),
        };
        let ca = ca.map(|path| read_pem(path, "CA bundle")).transpose()?;
        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    /// The rumqttc transport for `endpoint`.
    ///
    /// TLS files on a plain endpoint are an error rather than being ignored.
    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                bail!(
                    "TLS files are configured but {} is plain MQTT; use mqtts:// or mqtt.use_tls",
                    endpoint
                );
            }
            return Ok(Transport::tcp());
        }
        match (&self.ca, &self.client_auth) {
            (Some(ca), client_auth) => Ok(Transport::tls(ca.clone(), client_auth.clone(), None)),
            (None, None) => Ok(Transport::tls_with_default_config()),
            (None, Some(_)) => bail!("mutual TLS needs mqtt.tls_ca_path as well"),
        }
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read MQTT {} {}", what, path.display()))
}
