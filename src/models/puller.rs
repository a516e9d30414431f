//! Model pull strategies
//!
//! `CliPuller` shells out to `<binary> pull` exactly like an operator would;
//! `ApiPuller` streams the daemon's pull endpoint and logs progress itself.

use super::ModelRef;
use crate::client::OllamaClient;
use crate::error::{BootstrapError, BootstrapResult};
use crate::installer::find_executable;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Trait for fetching a model into the daemon's store
#[async_trait]
pub trait ModelPuller: Send + Sync {
    /// Blocking pull of a single model
    async fn pull(&self, model: &ModelRef) -> BootstrapResult<()>;

    /// Short name for logs
    fn method(&self) -> &'static str;
}

/// Pulls through the daemon's own CLI
pub struct CliPuller {
    binary: String,
    host: String,
}

impl CliPuller {
    pub fn new(binary: String, host: String) -> Self {
        Self { binary, host }
    }

    /// Resolve the binary at pull time, so a fresh install is picked up
    fn program(&self) -> PathBuf {
        find_executable(&self.binary, std::env::var_os("PATH"))
            .unwrap_or_else(|| PathBuf::from(&self.binary))
    }
}

#[async_trait]
impl ModelPuller for CliPuller {
    async fn pull(&self, model: &ModelRef) -> BootstrapResult<()> {
        let program = self.program();
        tracing::debug!(program = ?program, model = %model, "Running pull command");

        let status = Command::new(&program)
            .arg("pull")
            .arg(model.to_string())
            .env("OLLAMA_HOST", &self.host)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| BootstrapError::PullFailed {
                model: model.to_string(),
                reason: format!("failed to run `{} pull`: {}", self.binary, e),
            })?;

        if !status.success() {
            return Err(BootstrapError::PullFailed {
                model: model.to_string(),
                reason: format!("`{} pull` {}", self.binary, status),
            });
        }

        Ok(())
    }

    fn method(&self) -> &'static str {
        "cli"
    }
}

/// Pulls through `POST /api/pull`
pub struct ApiPuller {
    client: OllamaClient,
}

impl ApiPuller {
    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ModelPuller for ApiPuller {
    async fn pull(&self, model: &ModelRef) -> BootstrapResult<()> {
        let mut last_status = String::new();
        let mut last_decile: Option<u8> = None;

        self.client
            .pull_with_progress(model, |progress| {
                if progress.status != last_status {
                    tracing::info!(model = %model, status = %progress.status, "Pull progress");
                    last_status = progress.status.clone();
                    last_decile = None;
                }

                // One line per 10% per layer is plenty for multi-GB downloads
                if let Some(percent) = progress.percent() {
                    let decile = percent / 10;
                    if last_decile != Some(decile) {
                        tracing::info!(
                            model = %model,
                            digest = ?progress.digest,
                            percent = percent,
                            completed = ?progress.completed,
                            total = ?progress.total,
                            "Downloading"
                        );
                        last_decile = Some(decile);
                    }
                }
            })
            .await
    }

    fn method(&self) -> &'static str {
        "api"
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records pull order; fails or stalls for chosen models
    #[derive(Default)]
    pub struct RecordingPuller {
        pulled: Mutex<Vec<String>>,
        failing: HashSet<String>,
        stalling: HashSet<String>,
    }

    impl RecordingPuller {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_on(mut self, model: &str) -> Self {
            self.failing.insert(model.to_string());
            self
        }

        pub fn stalling_on(mut self, model: &str) -> Self {
            self.stalling.insert(model.to_string());
            self
        }

        pub fn pulled(&self) -> Vec<String> {
            self.pulled.lock().map(|p| p.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl ModelPuller for RecordingPuller {
        async fn pull(&self, model: &ModelRef) -> BootstrapResult<()> {
            let name = model.to_string();
            if let Ok(mut pulled) = self.pulled.lock() {
                pulled.push(name.clone());
            }

            if self.stalling.contains(&name) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.failing.contains(&name) {
                return Err(BootstrapError::PullFailed {
                    model: name,
                    reason: "manifest unknown".to_string(),
                });
            }
            Ok(())
        }

        fn method(&self) -> &'static str {
            "mock"
        }
    }
}
