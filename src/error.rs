//! Error types for the bootstrap sequence

use std::time::Duration;
use thiserror::Error;

/// Errors raised while installing, starting or provisioning the daemon
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("`{binary}` was not found on PATH and automatic install is disabled")]
    NotInstalled { binary: String },

    #[error("failed to fetch installer script from {url}: {reason}")]
    InstallerFetch { url: String, reason: String },

    #[error("failed to run installer with `{shell}`: {source}")]
    InstallerSpawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("installer exited unsuccessfully (code {code:?})")]
    InstallerFailed { code: Option<i32> },

    #[error("`{binary}` is still not resolvable after running the installer")]
    InstallIncomplete { binary: String },

    #[error("failed to spawn `{binary} serve`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service process exited before becoming ready ({status})")]
    ServiceExited { status: String },

    #[error("service at {url} not ready after {attempts} attempts")]
    NotReady { url: String, attempts: u32 },

    #[error("pull of `{model}` failed: {reason}")]
    PullFailed { model: String, reason: String },

    #[error("pull of `{model}` timed out after {}s", .after.as_secs())]
    PullTimeout { model: String, after: Duration },

    #[error("daemon API error: {0}")]
    Api(String),

    #[error("invalid model reference `{input}`: {reason}")]
    InvalidModel { input: String, reason: &'static str },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BootstrapError {
    /// Process exit code for this failure class
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotInstalled { .. }
            | Self::InstallerFetch { .. }
            | Self::InstallerSpawn { .. }
            | Self::InstallerFailed { .. }
            | Self::InstallIncomplete { .. } => 2,
            Self::Spawn { .. } | Self::ServiceExited { .. } | Self::NotReady { .. } => 3,
            Self::PullFailed { .. } | Self::PullTimeout { .. } => 4,
            Self::Api(_) | Self::InvalidModel { .. } | Self::Http(_) | Self::Io(_) => 1,
        }
    }
}

pub type BootstrapResult<T> = Result<T, BootstrapError>;
