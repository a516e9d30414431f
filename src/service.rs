//! Daemon process management and lifecycle

use crate::error::{BootstrapError, BootstrapResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Configuration for spawning the daemon
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub binary_path: String,
    /// Value for `OLLAMA_HOST`
    pub host: String,
    pub log_file: PathBuf,
}

/// Opaque handle to a spawned process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub(crate) id: String,
}

/// Trait for managing process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn `<binary> serve` in the background
    async fn spawn(&self, config: SpawnConfig) -> BootstrapResult<ProcessHandle>;

    /// Stop a process gracefully with timeout
    async fn stop(&self, handle: ProcessHandle, timeout: Duration) -> BootstrapResult<()>;

    /// Exit status description if the process has already exited
    async fn exit_status(&self, handle: &ProcessHandle) -> Option<String>;

    /// Get process ID
    async fn pid(&self, handle: &ProcessHandle) -> Option<u32>;

    /// Give up ownership, leaving the process running
    async fn detach(&self, handle: ProcessHandle);
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production process manager using tokio::process
pub struct SystemProcessManager {
    processes: Arc<RwLock<HashMap<String, Child>>>,
}

impl SystemProcessManager {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for SystemProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn spawn(&self, config: SpawnConfig) -> BootstrapResult<ProcessHandle> {
        let mut cmd = Command::new(&config.binary_path);
        cmd.arg("serve").env("OLLAMA_HOST", &config.host);

        if let Some(log_dir) = config.log_file.parent() {
            std::fs::create_dir_all(log_dir)?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)?;
        let stderr_file = log_file.try_clone()?;

        // Own process group: a Ctrl+C aimed at us must not reach the daemon
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .stdin(std::process::Stdio::null())
            .stdout(log_file)
            .stderr(stderr_file)
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| BootstrapError::Spawn {
                binary: config.binary_path.clone(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| BootstrapError::ServiceExited {
            status: "exited during spawn".to_string(),
        })?;
        let handle_id = format!("process_{}", pid);

        tracing::info!(
            binary = %config.binary_path,
            host = %config.host,
            pid = pid,
            log_file = ?config.log_file,
            "Daemon process spawned"
        );

        let handle = ProcessHandle {
            id: handle_id.clone(),
        };

        self.processes.write().await.insert(handle_id, child);

        Ok(handle)
    }

    async fn stop(&self, handle: ProcessHandle, timeout: Duration) -> BootstrapResult<()> {
        let mut processes = self.processes.write().await;

        if let Some(mut child) = processes.remove(&handle.id) {
            // Try graceful shutdown first (SIGTERM)
            if let Some(pid) = child.id() {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    let pid = Pid::from_raw(pid as i32);
                    let _ = kill(pid, Signal::SIGTERM);

                    tokio::select! {
                        _ = child.wait() => {
                            tracing::info!("Daemon stopped gracefully");
                        }
                        _ = tokio::time::sleep(timeout) => {
                            tracing::warn!("Graceful shutdown timeout, sending SIGKILL");
                            let _ = kill(pid, Signal::SIGKILL);
                            let _ = child.wait().await;
                        }
                    }
                }

                #[cfg(not(unix))]
                {
                    let _ = child.kill().await;
                }
            }
        }

        Ok(())
    }

    async fn exit_status(&self, handle: &ProcessHandle) -> Option<String> {
        let mut processes = self.processes.write().await;
        let child = processes.get_mut(&handle.id)?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
        let processes = self.processes.read().await;
        processes.get(&handle.id).and_then(|p| p.id())
    }

    async fn detach(&self, handle: ProcessHandle) {
        // Dropping a Child without kill_on_drop leaves the process running
        if let Some(child) = self.processes.write().await.remove(&handle.id) {
            tracing::debug!(pid = ?child.id(), "Detached daemon process");
        }
    }
}

/// Stop a daemon we no longer hold a `Child` for (e.g. from the state file)
///
/// Returns `false` when no such process exists.
#[cfg(unix)]
pub async fn terminate_pid(pid: u32, timeout: Duration) -> BootstrapResult<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    // Only a positive pid names a single process
    let raw = i32::try_from(pid).ok().filter(|p| *p > 0).ok_or_else(|| {
        BootstrapError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        ))
    })?;

    let pid = Pid::from_raw(raw);
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(false),
        Err(e) => return Err(std::io::Error::from(e).into()),
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        // Signal 0 only checks for existence
        if kill(pid, None).is_err() {
            tracing::info!(pid = %pid, "Daemon stopped gracefully");
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::warn!(pid = %pid, "Graceful shutdown timeout, sending SIGKILL");
    let _ = kill(pid, Signal::SIGKILL);
    Ok(true)
}

#[cfg(not(unix))]
pub async fn terminate_pid(_pid: u32, _timeout: Duration) -> BootstrapResult<bool> {
    Err(BootstrapError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "stopping a detached daemon is only supported on unix",
    )))
}

// ============================================================================
// Daemon service with Dependency Injection
// ============================================================================

/// Service status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    /// Running but not spawned by us (systemd unit, earlier run)
    External,
    Failed,
}

/// The daemon process, owned until it is detached
pub struct OllamaService {
    spawn_config: SpawnConfig,
    process_manager: Arc<dyn ProcessManager>,
    process_handle: RwLock<Option<ProcessHandle>>,
    pub status: RwLock<ServiceStatus>,
}

impl OllamaService {
    /// Create a service with custom process manager
    pub fn new_with_manager(spawn_config: SpawnConfig, manager: Arc<dyn ProcessManager>) -> Self {
        Self {
            spawn_config,
            process_manager: manager,
            process_handle: RwLock::new(None),
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    /// Create a service with default system process manager
    pub fn new(spawn_config: SpawnConfig) -> Self {
        Self::new_with_manager(spawn_config, Arc::new(SystemProcessManager::new()))
    }

    pub fn log_file(&self) -> &Path {
        &self.spawn_config.log_file
    }

    /// Spawn the daemon; returns its PID
    pub async fn start(&self) -> BootstrapResult<Option<u32>> {
        self.launch(self.spawn_config.clone()).await
    }

    /// Spawn a resolved binary in place of the configured name
    pub async fn start_at(&self, binary: &Path) -> BootstrapResult<Option<u32>> {
        let mut config = self.spawn_config.clone();
        config.binary_path = binary.to_string_lossy().to_string();
        self.launch(config).await
    }

    async fn launch(&self, config: SpawnConfig) -> BootstrapResult<Option<u32>> {
        let binary = config.binary_path.clone();
        let handle = match self.process_manager.spawn(config).await {
            Ok(handle) => handle,
            Err(e) => {
                *self.status.write().await = ServiceStatus::Failed;
                return Err(e);
            }
        };
        let pid = self.process_manager.pid(&handle).await;

        *self.process_handle.write().await = Some(handle);
        *self.status.write().await = ServiceStatus::Starting;

        tracing::info!(binary = %binary, pid = ?pid, "Daemon starting");

        Ok(pid)
    }

    /// Record that the daemon was already running before us
    pub async fn mark_external(&self) {
        *self.status.write().await = ServiceStatus::External;
    }

    pub async fn mark_running(&self) {
        let mut status = self.status.write().await;
        if *status == ServiceStatus::Starting {
            *status = ServiceStatus::Running;
        }
    }

    /// Exit status if the owned process has died
    pub async fn exit_status(&self) -> Option<String> {
        let handle_guard = self.process_handle.read().await;
        let handle = handle_guard.as_ref()?;
        let status = self.process_manager.exit_status(handle).await;
        if status.is_some() {
            drop(handle_guard);
            *self.status.write().await = ServiceStatus::Failed;
        }
        status
    }

    /// Whether we still own a process handle
    pub async fn is_owned(&self) -> bool {
        self.process_handle.read().await.is_some()
    }

    /// Stop the owned process, if any
    pub async fn stop(&self, timeout: Duration) -> BootstrapResult<()> {
        let handle = self.process_handle.write().await.take();

        if let Some(handle) = handle {
            self.process_manager.stop(handle, timeout).await?;
            tracing::info!("Daemon stopped");
            *self.status.write().await = ServiceStatus::Stopped;
        }

        Ok(())
    }

    /// Release the process so it outlives us
    pub async fn detach(&self) {
        if let Some(handle) = self.process_handle.write().await.take() {
            self.process_manager.detach(handle).await;
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        let handle_guard = self.process_handle.read().await;
        match handle_guard.as_ref() {
            Some(handle) => self.process_manager.pid(handle).await,
            None => None,
        }
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
