//! State persistence for the spawned daemon

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically
    async fn save(&self, path: &Path, content: &str) -> Result<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> Result<Option<String>>;

    /// Remove the file if present
    async fn remove(&self, path: &Path) -> Result<()>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileSystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Cannot create state file directory: {:?}", parent))?;
        }

        // Atomic write: write to temp file, then rename
        let temp_file = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .context("Failed to create temp state file")?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write state file")?;
        file.sync_all().await.context("Failed to sync state file")?;

        fs::rename(&temp_file, path)
            .await
            .context("Failed to rename temp state file")?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read state file: {:?}", path))?;

        Ok(Some(content))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove state file: {:?}", path)),
        }
    }
}

// ============================================================================
// State Manager with Dependency Injection
// ============================================================================

/// What we know about a daemon this tool spawned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub pid: u32,
    pub binary: String,
    pub base_url: String,
    pub log_file: PathBuf,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// State manager for the daemon record
pub struct StateManager {
    state_file: PathBuf,
    storage: Arc<dyn StorageBackend>,
}

impl StateManager {
    /// Create a new state manager with custom storage backend
    pub fn new_with_storage(state_file: PathBuf, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            state_file,
            storage,
        }
    }

    /// Create a new state manager with default filesystem storage
    pub fn new(state_file: PathBuf) -> Self {
        Self::new_with_storage(state_file, Arc::new(FileSystemStorage::new()))
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Save the record to disk atomically
    pub async fn save(&self, record: &ServiceRecord) -> Result<()> {
        let toml_content =
            toml::to_string_pretty(record).context("Failed to serialize state to TOML")?;

        self.storage.save(&self.state_file, &toml_content).await?;

        tracing::debug!(path = ?self.state_file, pid = record.pid, "State saved");

        Ok(())
    }

    /// Load the record from disk
    /// FAILS HARD if state file is corrupted - user must fix or delete
    pub async fn load(&self) -> Result<Option<ServiceRecord>> {
        let Some(content) = self.storage.load(&self.state_file).await? else {
            tracing::debug!(path = ?self.state_file, "No state file found");
            return Ok(None);
        };

        let record: ServiceRecord = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse state file: {:?}. File may be corrupted. \
                Please delete or fix the file manually.",
                self.state_file
            )
        })?;

        // 0 and values past i32::MAX would address process groups when signalled
        if record.pid == 0 || i32::try_from(record.pid).is_err() {
            anyhow::bail!(
                "State file {:?} is corrupted: invalid pid {}. \
                Please delete or fix the file manually.",
                self.state_file,
                record.pid
            );
        }

        Ok(Some(record))
    }

    pub async fn clear(&self) -> Result<()> {
        self.storage.remove(&self.state_file).await?;
        tracing::debug!(path = ?self.state_file, "State cleared");
        Ok(())
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
