//! Bootstrap sequencer
//!
//! Drives the host through `NotInstalled -> Installed -> ServiceReady ->
//! ModelsPulled`. Install and service failures stop the sequence; pull
//! failures are collected per model according to the failure policy.

use crate::client::ServiceApi;
use crate::config::{BootstrapConfig, FailurePolicy};
use crate::error::{BootstrapError, BootstrapResult};
use crate::health::ReadinessProbe;
use crate::installer::Installer;
use crate::models::{ModelPuller, ModelRef};
use crate::service::OllamaService;
use crate::state::{ServiceRecord, StateManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Grace period when stopping a daemon that never became ready
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Forward-only progress of a bootstrap run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    NotInstalled,
    Installed,
    ServiceReady,
    ModelsPulled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyPresent(PathBuf),
    Installed(PathBuf),
}

impl InstallOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::AlreadyPresent(path) | Self::Installed(path) => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Spawned by this run and left running in the background
    Started {
        pid: Option<u32>,
        version: String,
        attempts: u32,
    },
    /// A daemon was already answering; nothing spawned
    AlreadyRunning { version: String },
}

#[derive(Debug)]
pub enum PullOutcome {
    Pulled { elapsed: Duration },
    /// Already present locally and `skip_present` is set
    Skipped,
    Failed { error: BootstrapError },
    /// Not tried because an earlier pull failed under the abort policy
    NotAttempted,
}

impl PullOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pulled { .. } => "pulled",
            Self::Skipped => "skipped",
            Self::Failed { .. } => "failed",
            Self::NotAttempted => "not attempted",
        }
    }
}

#[derive(Debug)]
pub struct ModelReport {
    pub model: ModelRef,
    pub outcome: PullOutcome,
}

/// Result of a bootstrap run that reached the pull phase
#[derive(Debug)]
pub struct BootstrapReport {
    pub install: InstallOutcome,
    pub service: ServiceOutcome,
    pub models: Vec<ModelReport>,
}

impl BootstrapReport {
    pub fn failed_models(&self) -> impl Iterator<Item = &ModelReport> {
        self.models
            .iter()
            .filter(|m| matches!(m.outcome, PullOutcome::Failed { .. } | PullOutcome::NotAttempted))
    }

    pub fn is_success(&self) -> bool {
        self.failed_models().next().is_none()
    }
}

/// Sequencer wiring installer, daemon, readiness probe and puller together
pub struct Bootstrapper {
    config: BootstrapConfig,
    models: Vec<ModelRef>,
    installer: Arc<dyn Installer>,
    service: Arc<OllamaService>,
    api: Arc<dyn ServiceApi>,
    puller: Arc<dyn ModelPuller>,
    state: Option<Arc<StateManager>>,
    probe: ReadinessProbe,
    phase: RwLock<Phase>,
}

impl Bootstrapper {
    pub fn new(
        config: BootstrapConfig,
        installer: Arc<dyn Installer>,
        service: Arc<OllamaService>,
        api: Arc<dyn ServiceApi>,
        puller: Arc<dyn ModelPuller>,
    ) -> anyhow::Result<Self> {
        let models = config.llms.active_models()?.to_vec();
        let probe = ReadinessProbe::from_config(&config.readiness);

        Ok(Self {
            config,
            models,
            installer,
            service,
            api,
            puller,
            state: None,
            probe,
            phase: RwLock::new(Phase::NotInstalled),
        })
    }

    /// Persist the PID of a spawned daemon
    pub fn with_state(mut self, state: Arc<StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn models(&self) -> &[ModelRef] {
        &self.models
    }

    pub async fn phase(&self) -> Phase {
        *self.phase.read().await
    }

    async fn advance(&self, phase: Phase) {
        let mut current = self.phase.write().await;
        if phase > *current {
            tracing::debug!(from = ?*current, to = ?phase, "Phase transition");
            *current = phase;
        }
    }

    /// Run the whole sequence
    pub async fn run(&self) -> BootstrapResult<BootstrapReport> {
        let install = self.ensure_installed().await?;
        let service = self.start_service(install.path()).await?;
        let models = self.pull_all().await;

        Ok(BootstrapReport {
            install,
            service,
            models,
        })
    }

    /// Make sure the daemon binary resolves, installing it if allowed
    pub async fn ensure_installed(&self) -> BootstrapResult<InstallOutcome> {
        if let Some(path) = self.installer.locate() {
            tracing::info!(binary = %self.config.binary, path = ?path, "Daemon binary found");
            crate::metrics::record_install("present");
            self.advance(Phase::Installed).await;
            return Ok(InstallOutcome::AlreadyPresent(path));
        }

        if !self.config.auto_install {
            crate::metrics::record_install("failed");
            return Err(BootstrapError::NotInstalled {
                binary: self.config.binary.clone(),
            });
        }

        tracing::info!(
            binary = %self.config.binary,
            url = %self.config.install_script_url,
            "Daemon binary not found, installing"
        );

        if let Err(e) = self.installer.install().await {
            crate::metrics::record_install("failed");
            return Err(e);
        }

        match self.installer.locate() {
            Some(path) => {
                tracing::info!(path = ?path, "Daemon binary installed");
                crate::metrics::record_install("installed");
                self.advance(Phase::Installed).await;
                Ok(InstallOutcome::Installed(path))
            }
            None => {
                crate::metrics::record_install("failed");
                Err(BootstrapError::InstallIncomplete {
                    binary: self.config.binary.clone(),
                })
            }
        }
    }

    /// Reuse a running daemon or spawn one and wait until it answers
    pub async fn start_service(&self, binary_path: &Path) -> BootstrapResult<ServiceOutcome> {
        if let Some(version) = self.probe.probe_once(self.api.as_ref()).await {
            tracing::info!(
                endpoint = %self.api.endpoint(),
                version = %version,
                "Daemon already running, not spawning another"
            );
            self.service.mark_external().await;
            crate::metrics::record_service("external");
            self.advance(Phase::ServiceReady).await;
            return Ok(ServiceOutcome::AlreadyRunning { version });
        }

        let pid = match self.service.start_at(binary_path).await {
            Ok(pid) => pid,
            Err(e) => {
                crate::metrics::record_service("failed");
                return Err(e);
            }
        };

        let readiness = match self
            .probe
            .wait_for_ready(self.api.as_ref(), Some(&self.service))
            .await
        {
            Ok(readiness) => readiness,
            Err(e) => {
                crate::metrics::record_service("failed");
                if let Err(stop_err) = self.service.stop(STOP_TIMEOUT).await {
                    tracing::warn!(error = %stop_err, "Failed to stop unready daemon");
                }
                return Err(e);
            }
        };

        self.service.mark_running().await;
        self.service.detach().await;
        crate::metrics::record_service("spawned");

        if let (Some(state), Some(pid)) = (&self.state, pid) {
            let record = ServiceRecord {
                pid,
                binary: binary_path.to_string_lossy().to_string(),
                base_url: self.config.base_url.clone(),
                log_file: self.service.log_file().to_path_buf(),
                started_at: chrono::Utc::now(),
            };
            // The daemon is up either way; a missing record only affects `stop`
            if let Err(e) = state.save(&record).await {
                tracing::warn!(error = %e, "Failed to record daemon PID");
            }
        }

        self.advance(Phase::ServiceReady).await;

        Ok(ServiceOutcome::Started {
            pid,
            version: readiness.version,
            attempts: readiness.attempts,
        })
    }

    /// Pull every configured model in order
    pub async fn pull_all(&self) -> Vec<ModelReport> {
        let present = if self.config.pull.skip_present {
            match self.api.list_models().await {
                Ok(listed) => listed,
                Err(e) => {
                    tracing::warn!(error = %e, "Could not list local models, pulling all");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut reports = Vec::with_capacity(self.models.len());
        let mut aborted = false;

        for model in &self.models {
            if aborted {
                reports.push(ModelReport {
                    model: model.clone(),
                    outcome: PullOutcome::NotAttempted,
                });
                continue;
            }

            if present.iter().any(|listed| model.matches_listed(listed)) {
                tracing::info!(model = %model, "Model already present, skipping");
                reports.push(ModelReport {
                    model: model.clone(),
                    outcome: PullOutcome::Skipped,
                });
                continue;
            }

            let outcome = self.pull(model).await;
            if matches!(outcome, PullOutcome::Failed { .. })
                && self.config.pull.on_failure == FailurePolicy::Abort
            {
                tracing::warn!(model = %model, "Aborting remaining pulls");
                aborted = true;
            }

            reports.push(ModelReport {
                model: model.clone(),
                outcome,
            });
        }

        self.advance(Phase::ModelsPulled).await;
        reports
    }

    /// Pull one model, bounded by the configured timeout
    pub async fn pull(&self, model: &ModelRef) -> PullOutcome {
        tracing::info!(model = %model, method = self.puller.method(), "Pulling model");
        let started = Instant::now();

        let result = match self.config.pull.timeout_secs {
            Some(secs) => {
                let limit = Duration::from_secs(secs);
                match tokio::time::timeout(limit, self.puller.pull(model)).await {
                    Ok(result) => result,
                    Err(_) => Err(BootstrapError::PullTimeout {
                        model: model.to_string(),
                        after: limit,
                    }),
                }
            }
            None => self.puller.pull(model).await,
        };

        let elapsed = started.elapsed();
        match result {
            Ok(()) => {
                tracing::info!(model = %model, elapsed_secs = elapsed.as_secs(), "Model pulled");
                crate::metrics::record_pull(&model.to_string(), "pulled", elapsed);
                PullOutcome::Pulled { elapsed }
            }
            Err(error) => {
                tracing::error!(model = %model, error = %error, "Model pull failed");
                crate::metrics::record_pull(&model.to_string(), "failed", elapsed);
                PullOutcome::Failed { error }
            }
        }
    }

    /// Stop a daemon this run spawned but never handed off (e.g. on Ctrl+C)
    pub async fn abandon(&self) {
        if self.service.is_owned().await {
            let pid = self.service.pid().await;
            tracing::warn!(pid = ?pid, "Stopping daemon that did not finish starting");
            if let Err(e) = self.service.stop(STOP_TIMEOUT).await {
                tracing::error!(error = %e, "Failed to stop daemon");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PullConfig, ReadinessConfig};
    use crate::health::mocks::MockServiceApi;
    use crate::installer::mocks::MockInstaller;
    use crate::models::puller::mocks::RecordingPuller;
    use crate::service::mocks::MockProcessManager;
    use crate::service::{ServiceStatus, SpawnConfig};
    use crate::state::mocks::MemoryStorage;

    struct Harness {
        installer: Arc<MockInstaller>,
        manager: Arc<MockProcessManager>,
        service: Arc<OllamaService>,
        api: Arc<MockServiceApi>,
        puller: Arc<RecordingPuller>,
    }

    impl Harness {
        fn new(installer: MockInstaller, api: MockServiceApi, puller: RecordingPuller) -> Self {
            Self::with_manager(installer, api, puller, MockProcessManager::new())
        }

        fn with_manager(
            installer: MockInstaller,
            api: MockServiceApi,
            puller: RecordingPuller,
            manager: MockProcessManager,
        ) -> Self {
            let manager = Arc::new(manager);
            let service = Arc::new(OllamaService::new_with_manager(
                SpawnConfig {
                    binary_path: "ollama".to_string(),
                    host: "localhost:11434".to_string(),
                    log_file: PathBuf::from("/tmp/vt-bootstrap/ollama.log"),
                },
                manager.clone(),
            ));

            Self {
                installer: Arc::new(installer),
                manager,
                service,
                api: Arc::new(api),
                puller: Arc::new(puller),
            }
        }

        fn bootstrapper(&self, config: BootstrapConfig) -> Bootstrapper {
            Bootstrapper::new(
                config,
                self.installer.clone(),
                self.service.clone(),
                self.api.clone(),
                self.puller.clone(),
            )
            .unwrap()
        }
    }

    fn fast_config() -> BootstrapConfig {
        BootstrapConfig {
            readiness: ReadinessConfig {
                max_attempts: 5,
                interval_ms: 1,
                request_timeout_secs: 1,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_present_binary_skips_install() {
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::ready_after(2),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        let report = bootstrapper.run().await.unwrap();

        assert_eq!(h.installer.install_count(), 0);
        assert_eq!(
            report.install,
            InstallOutcome::AlreadyPresent(PathBuf::from("/usr/local/bin/ollama"))
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_installed() {
        let h = Harness::new(
            MockInstaller::missing(Some("/usr/local/bin/ollama")),
            MockServiceApi::ready_after(2),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        let report = bootstrapper.run().await.unwrap();

        assert_eq!(h.installer.install_count(), 1);
        assert!(matches!(report.install, InstallOutcome::Installed(_)));
    }

    #[tokio::test]
    async fn test_install_disabled() {
        let h = Harness::new(
            MockInstaller::missing(None),
            MockServiceApi::ready_after(1),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(BootstrapConfig {
            auto_install: false,
            ..fast_config()
        });

        let err = bootstrapper.run().await.unwrap_err();

        assert!(matches!(err, BootstrapError::NotInstalled { .. }));
        assert_eq!(h.installer.install_count(), 0);
        assert_eq!(bootstrapper.phase().await, Phase::NotInstalled);
    }

    #[tokio::test]
    async fn test_installer_failure_propagates() {
        let h = Harness::new(
            MockInstaller::failing(7),
            MockServiceApi::ready_after(1),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        let err = bootstrapper.run().await.unwrap_err();

        assert!(matches!(err, BootstrapError::InstallerFailed { code: Some(7) }));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(h.manager.spawn_count().await, 0);
        assert!(h.puller.pulled().is_empty());
    }

    #[tokio::test]
    async fn test_install_incomplete() {
        let h = Harness::new(
            MockInstaller::missing(None),
            MockServiceApi::ready_after(1),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        let err = bootstrapper.run().await.unwrap_err();
        assert!(matches!(err, BootstrapError::InstallIncomplete { .. }));
    }

    #[tokio::test]
    async fn test_spawns_exactly_one_daemon_and_detaches() {
        // First probe (already-running check) fails, readiness succeeds on the 3rd call
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::ready_after(3),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        let report = bootstrapper.run().await.unwrap();

        assert_eq!(h.manager.spawn_count().await, 1);
        assert_eq!(h.manager.detached_pids().await, vec![1000]);
        assert_eq!(h.manager.process_count().await, 0);
        assert!(!h.service.is_owned().await);
        assert_eq!(*h.service.status.read().await, ServiceStatus::Running);
        assert_eq!(
            report.service,
            ServiceOutcome::Started {
                pid: Some(1000),
                version: "0.5.7".to_string(),
                attempts: 2,
            }
        );
        assert_eq!(bootstrapper.phase().await, Phase::ModelsPulled);
    }

    #[tokio::test]
    async fn test_spawns_resolved_binary() {
        let h = Harness::new(
            MockInstaller::installed("/opt/ollama/bin/ollama"),
            MockServiceApi::ready_after(2),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        bootstrapper.run().await.unwrap();

        let spawned = h.manager.spawned_configs().await;
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].binary_path, "/opt/ollama/bin/ollama");
        assert_eq!(spawned[0].host, "localhost:11434");
    }

    #[tokio::test]
    async fn test_running_daemon_is_reused() {
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::ready_after(1),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        let report = bootstrapper.run().await.unwrap();

        assert_eq!(h.manager.spawn_count().await, 0);
        assert_eq!(*h.service.status.read().await, ServiceStatus::External);
        assert!(matches!(report.service, ServiceOutcome::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::ready_after(2),
            RecordingPuller::new(),
        );

        h.bootstrapper(fast_config()).run().await.unwrap();
        // The daemon from the first run now answers the initial probe
        let second = h.bootstrapper(fast_config()).run().await.unwrap();

        assert_eq!(h.manager.spawn_count().await, 1);
        assert_eq!(h.installer.install_count(), 0);
        assert!(matches!(second.service, ServiceOutcome::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn test_unready_daemon_is_stopped() {
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::never_ready(),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        let err = bootstrapper.run().await.unwrap_err();

        assert!(matches!(err, BootstrapError::NotReady { attempts: 5, .. }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(h.manager.process_count().await, 0);
        assert!(h.manager.detached_pids().await.is_empty());
        assert!(h.puller.pulled().is_empty());
        assert_eq!(bootstrapper.phase().await, Phase::Installed);
    }

    #[tokio::test]
    async fn test_daemon_exit_during_startup() {
        let h = Harness::with_manager(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::never_ready(),
            RecordingPuller::new(),
            MockProcessManager::exiting("exit status: 1"),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        let err = bootstrapper.run().await.unwrap_err();
        assert!(matches!(err, BootstrapError::ServiceExited { .. }));
        // Only the initial already-running probe hit the API
        assert_eq!(h.api.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_default_models_pulled_in_order() {
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::ready_after(1),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        let report = bootstrapper.run().await.unwrap();

        assert_eq!(h.puller.pulled(), vec!["llama3.1:8b", "qwen2.5:7b-instruct"]);
        assert!(report.is_success());
        assert!(
            report
                .models
                .iter()
                .all(|m| matches!(m.outcome, PullOutcome::Pulled { .. }))
        );
    }

    #[tokio::test]
    async fn test_failed_pull_continues_by_default() {
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::ready_after(1),
            RecordingPuller::new().failing_on("llama3.1:8b"),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        let report = bootstrapper.run().await.unwrap();

        assert_eq!(h.puller.pulled(), vec!["llama3.1:8b", "qwen2.5:7b-instruct"]);
        assert!(!report.is_success());
        assert_eq!(report.models[0].outcome.label(), "failed");
        assert_eq!(report.models[1].outcome.label(), "pulled");
    }

    #[tokio::test]
    async fn test_abort_policy_stops_pulls() {
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::ready_after(1),
            RecordingPuller::new().failing_on("llama3.1:8b"),
        );
        let bootstrapper = h.bootstrapper(BootstrapConfig {
            pull: PullConfig {
                on_failure: FailurePolicy::Abort,
                ..Default::default()
            },
            ..fast_config()
        });

        let report = bootstrapper.run().await.unwrap();

        assert_eq!(h.puller.pulled(), vec!["llama3.1:8b"]);
        assert_eq!(report.models[1].outcome.label(), "not attempted");
        assert_eq!(report.failed_models().count(), 2);
    }

    #[tokio::test]
    async fn test_skip_present_models() {
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::ready_after(1).with_models(&["llama3.1:8b", "nomic-embed-text:latest"]),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(BootstrapConfig {
            pull: PullConfig {
                skip_present: true,
                ..Default::default()
            },
            ..fast_config()
        });

        let report = bootstrapper.run().await.unwrap();

        assert_eq!(h.puller.pulled(), vec!["qwen2.5:7b-instruct"]);
        assert_eq!(report.models[0].outcome.label(), "skipped");
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_pull_timeout() {
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::ready_after(1),
            RecordingPuller::new().stalling_on("llama3.1:8b"),
        );
        let bootstrapper = h.bootstrapper(BootstrapConfig {
            pull: PullConfig {
                timeout_secs: Some(1),
                ..Default::default()
            },
            ..fast_config()
        });

        let report = bootstrapper.run().await.unwrap();

        match &report.models[0].outcome {
            PullOutcome::Failed {
                error: BootstrapError::PullTimeout { model, .. },
            } => assert_eq!(model, "llama3.1:8b"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(report.models[1].outcome.label(), "pulled");
    }

    #[tokio::test]
    async fn test_spawned_pid_is_recorded() {
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::ready_after(2),
            RecordingPuller::new(),
        );
        let storage = Arc::new(MemoryStorage::new());
        let state = Arc::new(StateManager::new_with_storage(
            PathBuf::from("/state/service.toml"),
            storage,
        ));
        let bootstrapper = h.bootstrapper(fast_config()).with_state(state.clone());

        bootstrapper.run().await.unwrap();

        let record = state.load().await.unwrap().unwrap();
        assert_eq!(record.pid, 1000);
        assert_eq!(record.binary, "/usr/local/bin/ollama");
        assert_eq!(record.base_url, "http://localhost:11434");
    }

    #[tokio::test]
    async fn test_abandon_stops_owned_daemon() {
        let h = Harness::new(
            MockInstaller::installed("/usr/local/bin/ollama"),
            MockServiceApi::never_ready(),
            RecordingPuller::new(),
        );
        let bootstrapper = h.bootstrapper(fast_config());

        h.service.start().await.unwrap();
        assert_eq!(h.manager.process_count().await, 1);

        bootstrapper.abandon().await;
        assert_eq!(h.manager.process_count().await, 0);
    }
}
