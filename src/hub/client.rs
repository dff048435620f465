//! Blocking client for the JupyterHub REST API and the single-user server's
//! contents and kernels APIs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

use crate::config::HubSettings;

const SERVER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SERVER_POLL_ATTEMPTS: u32 = 30;

#[derive(Debug)]
pub enum HubError {
    /// No token has been verified yet.
    NotConnected,
    /// The hub did not answer within the request timeout.
    Timeout,
    /// The hub answered with a non-success status.
    Status { code: u16, body: String },
    /// Connection refused, DNS failure, TLS failure and similar.
    Transport(String),
    /// The hub answered with something we could not interpret.
    Protocol(String),
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "JupyterHub not connected"),
            Self::Timeout => write!(f, "JupyterHub request timed out"),
            Self::Status { code, body } if body.is_empty() => {
                write!(f, "JupyterHub returned HTTP {}", code)
            }
            Self::Status { code, body } => write!(f, "JupyterHub returned HTTP {}: {}", code, body),
            Self::Transport(msg) => write!(f, "JupyterHub unreachable: {}", msg),
            Self::Protocol(msg) => write!(f, "unexpected JupyterHub response: {}", msg),
        }
    }
}

impl std::error::Error for HubError {}

impl From<ureq::Error> for HubError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, response) => Self::Status {
                code,
                body: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(transport) => {
                let timed_out = std::error::Error::source(&transport)
                    .and_then(|source| source.downcast_ref::<std::io::Error>())
                    .is_some_and(|io| {
                        matches!(
                            io.kind(),
                            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                        )
                    });
                if timed_out {
                    Self::Timeout
                } else {
                    Self::Transport(transport.to_string())
                }
            }
        }
    }
}

/// A hub user record as returned by `/hub/api/users`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HubUser {
    pub name: String,
    #[serde(default)]
    pub admin: bool,
    /// URL of the running single-user server, absent when stopped.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub last_activity: Option<String>,
}

impl HubUser {
    pub fn server_running(&self) -> bool {
        self.server.is_some()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenCheck {
    Valid(HubUser),
    Rejected,
    UserMissing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStart {
    Starting,
    AlreadyRunning,
}

pub struct HubClient {
    agent: ureq::Agent,
    base: Url,
    user: String,
    token: String,
    contents_root: String,
}

impl HubClient {
    pub fn new(settings: &HubSettings, token: &str, timeout: Duration) -> Result<Self, HubError> {
        let base = Url::parse(&settings.url)
            .map_err(|e| HubError::Protocol(format!("invalid hub url {}: {}", settings.url, e)))?;
        if base.cannot_be_a_base() {
            return Err(HubError::Protocol(format!(
                "hub url {} cannot carry a path",
                settings.url
            )));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            base,
            user: settings.user.clone(),
            token: token.to_string(),
            contents_root: settings.contents_root.clone(),
        })
    }

    pub fn user_name(&self) -> &str {
        &self.user
    }

    /// Verify the token by listing users and look for the configured user.
    pub fn check_token(&self) -> Result<TokenCheck, HubError> {
        let url = self.endpoint(&["hub", "api", "users"]);
        let users: Vec<HubUser> = match self.request("GET", &url).call() {
            Ok(response) => read_json(response)?,
            Err(ureq::Error::Status(401 | 403, _)) => return Ok(TokenCheck::Rejected),
            Err(e) => return Err(e.into()),
        };
        Ok(users
            .into_iter()
            .find(|user| user.name == self.user)
            .map(TokenCheck::Valid)
            .unwrap_or(TokenCheck::UserMissing))
    }

    pub fn user(&self) -> Result<HubUser, HubError> {
        let url = self.endpoint(&["hub", "api", "users", &self.user]);
        read_json(self.request("GET", &url).call()?)
    }

    pub fn start_server(&self) -> Result<ServerStart, HubError> {
        let url = self.endpoint(&["hub", "api", "users", &self.user, "server"]);
        match self.request("POST", &url).call() {
            Ok(_) => Ok(ServerStart::Starting),
            Err(ureq::Error::Status(400, _)) => Ok(ServerStart::AlreadyRunning),
            Err(e) => Err(e.into()),
        }
    }

    /// Start the user's server if it is stopped and wait for it to come up.
    pub fn ensure_server_running(&self) -> Result<(), HubError> {
        self.ensure_server_running_with(SERVER_POLL_INTERVAL, SERVER_POLL_ATTEMPTS)
    }

    pub fn ensure_server_running_with(
        &self,
        poll_interval: Duration,
        attempts: u32,
    ) -> Result<(), HubError> {
        if self.user()?.server_running() {
            return Ok(());
        }
        log::info!("hub: starting server for {}", self.user);
        if self.start_server()? == ServerStart::AlreadyRunning {
            return Ok(());
        }
        for _ in 0..attempts {
            std::thread::sleep(poll_interval);
            if self.user()?.server_running() {
                log::info!("hub: server ready for {}", self.user);
                return Ok(());
            }
        }
        Err(HubError::Protocol(format!(
            "server for {} did not start within {} polls",
            self.user, attempts
        )))
    }

    /// Store one image under `<contents_root>/<object_name>/<file_name>`.
    pub fn upload_image(
        &self,
        object_name: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<(), HubError> {
        use base64::Engine as _;

        let mut dir: Vec<&str> = vec!["user", &self.user, "api", "contents"];
        dir.extend(self.contents_root.split('/').filter(|s| !s.is_empty()));
        dir.push(object_name);

        let dir_url = self.endpoint(&dir);
        self.request("PUT", &dir_url)
            .send_json(json!({ "type": "directory" }))?;

        dir.push(file_name);
        let file_url = self.endpoint(&dir);
        self.request("PUT", &file_url).send_json(json!({
            "type": "file",
            "format": "base64",
            "content": base64::engine::general_purpose::STANDARD.encode(bytes),
        }))?;
        Ok(())
    }

    /// Start a python3 kernel on the user's server; returns its id.
    pub fn create_kernel(&self) -> Result<String, HubError> {
        let url = self.endpoint(&["user", &self.user, "api", "kernels"]);
        let response = self
            .request("POST", &url)
            .send_json(json!({ "name": "python3" }))?;
        if response.status() != 201 {
            return Err(HubError::Status {
                code: response.status(),
                body: response.into_string().unwrap_or_default(),
            });
        }
        let body: Value = read_json(response)?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HubError::Protocol("kernel response has no id".to_string()))
    }

    pub fn execute(&self, kernel_id: &str, code: &str) -> Result<(), HubError> {
        let url = self.endpoint(&["user", &self.user, "api", "kernels", kernel_id, "execute"]);
        self.request("POST", &url)
            .send_json(json!({ "code": code }))?;
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        self.agent
            .request_url(method, url)
            .set("Authorization", &format!("token {}", self.token))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(response: ureq::Response) -> Result<T, HubError> {
    response
        .into_json()
        .map_err(|e| HubError::Protocol(e.to_string()))
}
