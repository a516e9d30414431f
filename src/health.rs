//! Readiness probing for the daemon

use crate::client::ServiceApi;
use crate::config::ReadinessConfig;
use crate::error::{BootstrapError, BootstrapResult};
use crate::service::OllamaService;
use tokio::time::{Duration, Instant, sleep};

/// Outcome of a successful readiness wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub version: String,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Bounded-retry readiness probe
pub struct ReadinessProbe {
    max_attempts: u32,
    interval: Duration,
}

impl ReadinessProbe {
    /// Create a new readiness probe
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    pub fn from_config(config: &ReadinessConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.interval_ms),
        )
    }

    /// Single probe, used to detect an already-running daemon
    pub async fn probe_once(&self, api: &dyn ServiceApi) -> Option<String> {
        match api.version().await {
            Ok(version) => Some(version),
            Err(e) => {
                tracing::debug!(endpoint = %api.endpoint(), error = %e, "Daemon not answering");
                None
            }
        }
    }

    /// Poll until the daemon answers or attempts run out
    ///
    /// When `service` is given, a child that exits while we wait fails the
    /// wait immediately instead of burning the remaining attempts.
    pub async fn wait_for_ready(
        &self,
        api: &dyn ServiceApi,
        service: Option<&OllamaService>,
    ) -> BootstrapResult<Readiness> {
        let started = Instant::now();

        tracing::info!(
            endpoint = %api.endpoint(),
            max_attempts = self.max_attempts,
            interval_ms = self.interval.as_millis() as u64,
            "Waiting for daemon readiness"
        );

        for attempt in 1..=self.max_attempts {
            if let Some(service) = service
                && let Some(status) = service.exit_status().await
            {
                tracing::error!(status = %status, "Daemon exited during startup");
                return Err(BootstrapError::ServiceExited { status });
            }

            match api.version().await {
                Ok(version) => {
                    let elapsed = started.elapsed();
                    tracing::info!(
                        version = %version,
                        attempts = attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Daemon is ready"
                    );
                    crate::metrics::record_readiness(attempt, elapsed, true);
                    return Ok(Readiness {
                        version,
                        attempts: attempt,
                        elapsed,
                    });
                }
                Err(e) => {
                    tracing::debug!(attempt = attempt, error = %e, "Readiness probe failed");
                }
            }

            if attempt < self.max_attempts {
                sleep(self.interval).await;
            }
        }

        crate::metrics::record_readiness(self.max_attempts, started.elapsed(), false);

        Err(BootstrapError::NotReady {
            url: api.endpoint(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Mock daemon API that becomes ready after a number of probes
    pub struct MockServiceApi {
        ready_after: Option<u32>,
        probes: AtomicU32,
        models: Mutex<Vec<String>>,
    }

    impl MockServiceApi {
        /// Answers from the `n`th version call on (1-based)
        pub fn ready_after(n: u32) -> Self {
            Self {
                ready_after: Some(n),
                probes: AtomicU32::new(0),
                models: Mutex::new(Vec::new()),
            }
        }

        pub fn never_ready() -> Self {
            Self {
                ready_after: None,
                ..Self::ready_after(0)
            }
        }

        pub fn with_models(self, models: &[&str]) -> Self {
            if let Ok(mut listed) = self.models.lock() {
                *listed = models.iter().map(ToString::to_string).collect();
            }
            self
        }

        pub fn probe_count(&self) -> u32 {
            self.probes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ServiceApi for MockServiceApi {
        async fn version(&self) -> BootstrapResult<String> {
            let probe = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
            match self.ready_after {
                Some(n) if probe >= n => Ok("0.5.7".to_string()),
                _ => Err(BootstrapError::Api("connection refused".to_string())),
            }
        }

        async fn list_models(&self) -> BootstrapResult<Vec<String>> {
            Ok(self.models.lock().map(|m| m.clone()).unwrap_or_default())
        }

        fn endpoint(&self) -> String {
            "http://mock:11434/".to_string()
        }
    }
}
