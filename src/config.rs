//! Configuration structures and loading logic

use crate::models::ModelRef;
use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main bootstrap configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Daemon executable name or path
    pub binary: String,
    /// Base URL of the daemon HTTP API
    pub base_url: String,
    /// Install the daemon when `binary` cannot be resolved
    pub auto_install: bool,
    pub install_script_url: String,
    pub install_shell: String,
    /// Directory receiving the daemon's stdout/stderr
    pub log_dir: PathBuf,
    pub state_file: PathBuf,
    /// Write a Prometheus text rendering of run metrics here on exit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_textfile: Option<PathBuf>,
    pub readiness: ReadinessConfig,
    pub pull: PullConfig,
    pub llms: LlmTiers,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            base_url: default_base_url(),
            auto_install: true,
            install_script_url: default_install_script_url(),
            install_shell: default_install_shell(),
            log_dir: default_data_dir().join("logs"),
            state_file: default_data_dir().join("service.toml"),
            metrics_textfile: None,
            readiness: ReadinessConfig::default(),
            pull: PullConfig::default(),
            llms: LlmTiers::default(),
        }
    }
}

/// Readiness probing of a freshly started daemon
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReadinessConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval_ms: 500,
            request_timeout_secs: 2,
        }
    }
}

/// How models are pulled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PullMethod {
    /// Run `<binary> pull <model>` with inherited stdio
    #[default]
    Cli,
    /// Stream `POST /api/pull` and log progress
    Api,
}

/// What to do after a failed pull
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Report the failure and move on to the next model
    #[default]
    Continue,
    /// Stop pulling; remaining models are reported as not attempted
    Abort,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PullConfig {
    pub method: PullMethod,
    pub on_failure: FailurePolicy,
    /// Skip models the daemon already lists locally
    pub skip_present: bool,
    /// Upper bound per pull; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Named model tiers, mirroring the application's LLM config
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LlmTiers {
    pub active: String,
    pub tiers: BTreeMap<String, Vec<ModelRef>>,
}

impl Default for LlmTiers {
    fn default() -> Self {
        let parse = |ids: &[&str]| -> Vec<ModelRef> {
            ids.iter().filter_map(|id| ModelRef::parse(id).ok()).collect()
        };

        let mut tiers = BTreeMap::new();
        tiers.insert(
            "start".to_string(),
            parse(&["llama3.1:8b", "qwen2.5:7b-instruct"]),
        );
        tiers.insert(
            "scale".to_string(),
            parse(&[
                "mixtral:8x7b-instruct",
                "llama3.1:70b-instruct",
                "qwen2.5:32b-instruct",
            ]),
        );

        Self {
            active: "start".to_string(),
            tiers,
        }
    }
}

impl LlmTiers {
    /// Models of the active tier, in request order
    pub fn active_models(&self) -> Result<&[ModelRef]> {
        self.tiers
            .get(&self.active)
            .map(Vec::as_slice)
            .with_context(|| format!("Unknown model tier: {}", self.active))
    }
}

impl BootstrapConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        if let Ok(binary) = std::env::var("VT_BOOTSTRAP_BINARY") {
            config.binary = binary;
        }
        if let Ok(state_file) = std::env::var("VT_BOOTSTRAP_STATE_FILE") {
            config.state_file = PathBuf::from(state_file);
        }
        if let Ok(tier) = std::env::var("VT_BOOTSTRAP_TIER") {
            config.llms.active = tier;
        }
        if let Ok(url) = std::env::var("VT_BOOTSTRAP_INSTALL_URL") {
            config.install_script_url = url;
        }
        if let Ok(host) = std::env::var("OLLAMA_HOST")
            && !host.trim().is_empty()
        {
            config.base_url = normalize_base_url(&host);
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.binary.trim().is_empty() {
            anyhow::bail!("Daemon binary cannot be empty");
        }

        let base = self.base_url()?;
        if !matches!(base.scheme(), "http" | "https") {
            anyhow::bail!("Base URL must be http or https (got {})", base.scheme());
        }
        if base.host_str().is_none() {
            anyhow::bail!("Base URL has no host: {}", self.base_url);
        }

        if self.auto_install {
            let installer = Url::parse(&self.install_script_url)
                .with_context(|| format!("Invalid installer URL: {}", self.install_script_url))?;
            if installer.scheme() != "https" {
                anyhow::bail!(
                    "Installer URL must use https (got {})",
                    self.install_script_url
                );
            }
            if self.install_shell.trim().is_empty() {
                anyhow::bail!("Installer shell cannot be empty");
            }
        }

        if self.readiness.max_attempts == 0 {
            anyhow::bail!("readiness.max_attempts must be at least 1");
        }
        if self.readiness.interval_ms == 0 {
            anyhow::bail!("readiness.interval_ms must be at least 1");
        }
        if self.pull.timeout_secs == Some(0) {
            anyhow::bail!("pull.timeout_secs must be at least 1 when set");
        }

        let models = self.llms.active_models()?;
        if models.is_empty() {
            anyhow::bail!("Model tier '{}' has no models", self.llms.active);
        }

        Ok(())
    }

    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.base_url).with_context(|| format!("Invalid base URL: {}", self.base_url))
    }

    /// `host:port` form of the base URL, as `OLLAMA_HOST` expects it
    pub fn daemon_host(&self) -> Result<String> {
        let url = self.base_url()?;
        let host = url.host_str().context("Base URL has no host")?;
        let port = url.port_or_known_default().unwrap_or(DEFAULT_PORT);
        Ok(format!("{}:{}", host, port))
    }

    /// Replace the active tier's list with explicit models
    pub fn override_models(&mut self, models: Vec<ModelRef>) {
        const CLI_TIER: &str = "cli";
        self.llms.tiers.insert(CLI_TIER.to_string(), models);
        self.llms.active = CLI_TIER.to_string();
    }
}

/// Accept `OLLAMA_HOST`-style values (`host`, `host:port`, or a full URL)
pub fn normalize_base_url(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');
    if raw.contains("://") {
        raw.to_string()
    } else if raw.contains(':') {
        format!("http://{}", raw)
    } else {
        format!("http://{}:{}", raw, DEFAULT_PORT)
    }
}

const DEFAULT_PORT: u16 = 11434;

// Default functions
fn default_binary() -> String {
    "ollama".to_string()
}
fn default_base_url() -> String {
    format!("http://localhost:{}", DEFAULT_PORT)
}
fn default_install_script_url() -> String {
    "https://ollama.com/install.sh".to_string()
}
fn default_install_shell() -> String {
    "sh".to_string()
}
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vt-bootstrap")
}
