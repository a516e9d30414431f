//! Daemon binary discovery and installation

use crate::error::{BootstrapError, BootstrapResult};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Trait for locating and installing the daemon binary
#[async_trait]
pub trait Installer: Send + Sync {
    /// Resolve the binary, without side effects
    fn locate(&self) -> Option<PathBuf>;

    /// Install the binary
    async fn install(&self) -> BootstrapResult<()>;
}

/// Installs by piping the vendor's install script into a shell
pub struct ScriptInstaller {
    binary: String,
    script_url: String,
    shell: String,
    http: reqwest::Client,
}

impl ScriptInstaller {
    pub fn new(binary: String, script_url: String, shell: String) -> Self {
        Self {
            binary,
            script_url,
            shell,
            http: reqwest::Client::new(),
        }
    }

    async fn fetch_script(&self) -> BootstrapResult<String> {
        let fetch_error = |reason: String| BootstrapError::InstallerFetch {
            url: self.script_url.clone(),
            reason,
        };

        let response = self
            .http
            .get(&self.script_url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fetch_error(format!("HTTP {}", response.status())));
        }

        let script = response.text().await.map_err(|e| fetch_error(e.to_string()))?;
        if script.trim().is_empty() {
            return Err(fetch_error("empty script".to_string()));
        }

        Ok(script)
    }
}

#[async_trait]
impl Installer for ScriptInstaller {
    fn locate(&self) -> Option<PathBuf> {
        find_executable(&self.binary, std::env::var_os("PATH"))
    }

    async fn install(&self) -> BootstrapResult<()> {
        let script = self.fetch_script().await?;

        tracing::warn!(
            url = %self.script_url,
            bytes = script.len(),
            "Executing unpinned remote installer script"
        );

        let spawn_error = |source: std::io::Error| BootstrapError::InstallerSpawn {
            shell: self.shell.clone(),
            source,
        };

        let mut child = Command::new(&self.shell)
            .arg("-s")
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(spawn_error)?;
            stdin.shutdown().await.map_err(spawn_error)?;
        }

        let status = child.wait().await.map_err(spawn_error)?;
        if !status.success() {
            tracing::error!(status = %status, "Installer failed");
            return Err(BootstrapError::InstallerFailed {
                code: status.code(),
            });
        }

        tracing::info!(binary = %self.binary, "Installer finished");
        Ok(())
    }
}

/// Resolve `binary` the way a shell would
///
/// Names containing a path separator are checked directly; bare names are
/// searched in each `path_var` entry.
pub fn find_executable(binary: &str, path_var: Option<OsString>) -> Option<PathBuf> {
    if binary.is_empty() {
        return None;
    }

    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path_var = path_var?;
    std::env::split_paths(&path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(binary))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
