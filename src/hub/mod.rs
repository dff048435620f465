//! Notebook-hub collaborator: token handling, training image uploads and
//! deployment jobs run through a JupyterHub user server.

use std::sync::{RwLock, RwLockReadGuard};
use std::time::Duration;

use crate::config::HubSettings;

mod client;
mod jobs;
mod upload;

pub use client::{HubClient, HubError, HubUser, ServerStart, TokenCheck};
pub use jobs::{spawn_deployment, JobRegistry, JobState, JobStatus};
pub use upload::{clear_staged, stage_images, StagedUpload, TrainingImage};

/// The verified hub token, shared by all handlers.
pub struct HubSession {
    settings: HubSettings,
    token: RwLock<Option<String>>,
}

impl HubSession {
    pub fn new(settings: HubSettings) -> Self {
        Self {
            settings,
            token: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.read().is_some()
    }

    /// Verify `token` against the hub and keep it if the configured user exists.
    pub fn connect(&self, token: &str) -> Result<TokenCheck, HubError> {
        let client = HubClient::new(&self.settings, token, Duration::from_secs(10))?;
        let check = client.check_token()?;
        if matches!(check, TokenCheck::Valid(_)) {
            *self.token.write().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                Some(token.to_string());
            log::info!("hub: connected as {}", self.settings.user);
        }
        Ok(check)
    }

    /// Client with the default request timeout.
    pub fn client(&self) -> Result<HubClient, HubError> {
        self.client_with_timeout(self.settings.request_timeout)
    }

    pub fn client_with_timeout(&self, timeout: Duration) -> Result<HubClient, HubError> {
        let token = self.read().clone().ok_or(HubError::NotConnected)?;
        HubClient::new(&self.settings, &token, timeout)
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<String>> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    #[test]
    fn client_requires_verified_token() {
        let session = HubSession::new(GatewayConfig::default().hub);
        assert!(!session.is_connected());
        assert!(matches!(session.client(), Err(HubError::NotConnected)));
    }

    #[test]
    fn failed_connect_keeps_session_disconnected() {
        let mut settings = GatewayConfig::default().hub;
        settings.url = "http://127.0.0.1:1".to_string();
        let session = HubSession::new(settings);
        assert!(session.connect("token").is_err());
        assert!(!session.is_connected());
    }
}
