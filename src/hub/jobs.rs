use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{HubClient, HubError, HubSession};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Starting,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobStatus {
    pub status: JobState,
    pub progress: u8,
    pub message: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_at: Option<String>,
}

/// In-memory table of background deployment jobs.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobStatus>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in the `starting` state; returns its id.
    pub fn create(&self, message: &str) -> String {
        let id = new_job_id();
        self.lock().insert(
            id.clone(),
            JobStatus {
                status: JobState::Starting,
                progress: 0,
                message: message.to_string(),
                started_at: crate::timestamp_now(),
                completed_at: None,
                error_at: None,
            },
        );
        id
    }

    pub fn get(&self, id: &str) -> Option<JobStatus> {
        self.lock().get(id).cloned()
    }

    pub fn update(&self, id: &str, apply: impl FnOnce(&mut JobStatus)) {
        if let Some(job) = self.lock().get_mut(id) {
            apply(job);
        }
    }

    fn advance(&self, id: &str, progress: u8, message: &str) {
        self.update(id, |job| {
            job.status = JobState::Running;
            job.progress = progress;
            job.message = message.to_string();
        });
    }

    pub fn count(&self, state: JobState) -> usize {
        self.lock().values().filter(|job| job.status == state).count()
    }

    /// Drop completed and failed jobs; returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| !job.status.is_finished());
        before - jobs.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobStatus>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn new_job_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Run the deploy `code` for `model` on a background thread; returns the job id.
pub fn spawn_deployment(
    registry: Arc<JobRegistry>,
    hub: &HubSession,
    model: &str,
    code: String,
) -> Result<String, HubError> {
    let client = hub.client_with_timeout(hub.settings().deploy_timeout)?;
    let model = model.to_string();
    let id = registry.create("Initializing deployment...");

    let job_id = id.clone();
    let spawned = std::thread::Builder::new()
        .name("deployment".to_string())
        .spawn(move || run_deployment(&registry, &job_id, &client, &model, &code));
    if let Err(e) = spawned {
        return Err(HubError::Transport(format!("cannot spawn deployment thread: {}", e)));
    }
    Ok(id)
}

fn run_deployment(registry: &JobRegistry, id: &str, client: &HubClient, model: &str, code: &str) {
    let result = (|| -> Result<(), HubError> {
        registry.advance(id, 20, "Ensuring server is running...");
        client.ensure_server_running()?;
        registry.advance(id, 40, "Creating kernel for deployment...");
        let kernel = client.create_kernel()?;
        registry.advance(id, 60, "Executing deployment script...");
        client.execute(&kernel, code)
    })();

    match result {
        Ok(()) => {
            log::info!("deployment {} ({}) completed", id, model);
            registry.update(id, |job| {
                job.status = JobState::Completed;
                job.progress = 100;
                job.message = format!("Model deployed successfully ({})", model);
                job.completed_at = Some(crate::timestamp_now());
            });
        }
        Err(e) => {
            log::error!("deployment {} ({}) failed: {}", id, model, e);
            registry.update(id, |job| {
                job.status = JobState::Failed;
                job.message = format!("Deployment failed: {}", e);
                job.error_at = Some(crate::timestamp_now());
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_at_zero() {
        let registry = JobRegistry::new();
        let id = registry.create("queued");
        assert_eq!(id.len(), 32);
        let job = registry.get(&id).expect("job");
        assert_eq!(job.status, JobState::Starting);
        assert_eq!(job.progress, 0);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn unknown_id_is_none() {
        assert!(JobRegistry::new().get("missing").is_none());
    }

    #[test]
    fn prune_removes_only_finished_jobs() {
        let registry = JobRegistry::new();
        let running = registry.create("a");
        let done = registry.create("b");
        let failed = registry.create("c");
        registry.advance(&running, 20, "working");
        registry.update(&done, |job| job.status = JobState::Completed);
        registry.update(&failed, |job| job.status = JobState::Failed);

        assert_eq!(registry.count(JobState::Running), 1);
        assert_eq!(registry.prune_finished(), 2);
        assert!(registry.get(&running).is_some());
        assert!(registry.get(&done).is_none());
    }

    #[test]
    fn status_serializes_without_empty_timestamps() {
        let registry = JobRegistry::new();
        let id = registry.create("queued");
        let json = serde_json::to_value(registry.get(&id).unwrap()).unwrap();
        assert_eq!(json["status"], "starting");
        assert!(json.get("completed_at").is_none());
        assert!(json.get("error_at").is_none());
    }

    #[test]
    fn failed_deployment_records_error() {
        let registry = Arc::new(JobRegistry::new());
        let mut settings = crate::config::GatewayConfig::default().hub;
        settings.url = "http://127.0.0.1:1".to_string();
        let client =
            HubClient::new(&settings, "t", std::time::Duration::from_secs(1)).expect("client");
        let id = registry.create("queued");

        run_deployment(&registry, &id, &client, "rf", "print(1)");

        let job = registry.get(&id).unwrap();
        assert_eq!(job.status, JobState::Failed);
        assert_eq!(job.progress, 20);
        assert!(job.message.starts_with("Deployment failed"));
        assert!(job.error_at.is_some());
    }
}
