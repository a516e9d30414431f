//! Model references as accepted by the daemon
//!
//! The application's LLM config names models LiteLLM-style
//! (`ollama/llama3.1:8b`) while the daemon itself wants the bare
//! `[namespace/]name[:tag]` form. `ModelRef` accepts both.

use crate::error::{BootstrapError, BootstrapResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Provider prefix used by the application's LLM configuration
const PROVIDER_PREFIX: &str = "ollama/";

/// Tag the daemon assumes when none is given
pub const DEFAULT_TAG: &str = "latest";

/// A parsed model identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    name: String,
    tag: Option<String>,
}

impl ModelRef {
    /// Parse a model identifier, stripping an `ollama/` provider prefix
    pub fn parse(input: &str) -> BootstrapResult<Self> {
        let invalid = |reason| BootstrapError::InvalidModel {
            input: input.to_string(),
            reason,
        };

        let trimmed = input.trim();
        let bare = trimmed.strip_prefix(PROVIDER_PREFIX).unwrap_or(trimmed);

        if bare.is_empty() {
            return Err(invalid("empty model name"));
        }
        if bare.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }
        if let Some(c) = bare
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':')))
        {
            tracing::debug!(input = %input, character = %c, "Rejected model reference");
            return Err(invalid("contains an unsupported character"));
        }

        let (name, tag) = match bare.split_once(':') {
            Some((name, tag)) => {
                if tag.contains(':') {
                    return Err(invalid("more than one ':' separator"));
                }
                if tag.is_empty() {
                    return Err(invalid("empty tag"));
                }
                if tag.contains('/') {
                    return Err(invalid("tag cannot contain '/'"));
                }
                (name, Some(tag.to_string()))
            }
            None => (bare, None),
        };

        if name.is_empty() {
            return Err(invalid("empty model name"));
        }
        if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
            return Err(invalid("malformed namespace"));
        }

        Ok(Self {
            name: name.to_string(),
            tag,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Explicit tag, if one was given
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// `name:tag` with the default tag filled in, as the daemon lists models
    pub fn canonical(&self) -> String {
        format!(
            "{}:{}",
            self.name,
            self.tag.as_deref().unwrap_or(DEFAULT_TAG)
        )
    }

    /// Whether a name from the daemon's local model list refers to this model
    pub fn matches_listed(&self, listed: &str) -> bool {
        match ModelRef::parse(listed) {
            // The daemon treats model names case-insensitively
            Ok(other) => other.canonical().eq_ignore_ascii_case(&self.canonical()),
            Err(_) => false,
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}:{}", self.name, tag),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for ModelRef {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ModelRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModelRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ModelRef::parse(&raw).map_err(serde::de::Error::custom)
    }
}
