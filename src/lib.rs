//! VT Bootstrap - local model daemon provisioning
//!
//! Installs the Ollama daemon when missing, starts it in the background,
//! waits until it answers, and pulls the models the Virtual Teacher
//! application expects.

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod installer;
pub mod metrics;
pub mod models;
pub mod service;
pub mod state;

pub use bootstrap::{
    BootstrapReport, Bootstrapper, InstallOutcome, ModelReport, Phase, PullOutcome,
    ServiceOutcome,
};
pub use client::{OllamaClient, PullProgress, ServiceApi};
pub use config::{BootstrapConfig, FailurePolicy, PullMethod};
pub use error::{BootstrapError, BootstrapResult};
pub use health::{Readiness, ReadinessProbe};
pub use installer::{Installer, ScriptInstaller, find_executable};
pub use models::{ApiPuller, CliPuller, ModelPuller, ModelRef};
pub use service::{OllamaService, ProcessManager, ServiceStatus, SpawnConfig, SystemProcessManager};
pub use state::{ServiceRecord, StateManager};
