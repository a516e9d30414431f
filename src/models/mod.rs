//! Model handling
//!
//! Provides functionality for:
//! - Parsing and normalizing model references
//! - Pulling models into the daemon's store via its CLI or HTTP API

pub mod puller;
pub mod reference;

pub use puller::{ApiPuller, CliPuller, ModelPuller};
pub use reference::{DEFAULT_TAG, ModelRef};
