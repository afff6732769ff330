//! Coordinator configuration.
//!
//! Loaded from TOML, validated fail-closed before a coordinator is built:
//! a configuration that cannot produce a correct round is rejected up
//! front rather than discovered mid-round.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{MAX_CIPHERTEXT_BYTES, NONCE_LEN};
use crate::eligibility::BackoffConfig;
use crate::privacy::PrivacyBudget;
use crate::proof::{InputMap, InputValue};

/// Top-level federated training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedConfig {
    /// Maximum contributions admitted per round; the rest are excluded.
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,

    /// Step size applied to the aggregated gradient.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// Dimensionality of every agent's gradient vector.
    #[serde(default = "default_gradient_dim")]
    pub gradient_dim: usize,

    /// Maximum eligibility attempts per agent per round.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Public policy constants agents must prove against.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Differential-privacy budget.
    #[serde(default)]
    pub privacy: PrivacyBudget,

    /// Backoff schedule between eligibility retries.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_max_participants() -> usize {
    3
}

const fn default_learning_rate() -> f32 {
    0.01
}

const fn default_gradient_dim() -> usize {
    100
}

const fn default_max_attempts() -> u32 {
    3
}

impl Default for FederatedConfig {
    fn default() -> Self {
        Self {
            max_participants: default_max_participants(),
            learning_rate: default_learning_rate(),
            gradient_dim: default_gradient_dim(),
            max_attempts: default_max_attempts(),
            policy: PolicyConfig::default(),
            privacy: PrivacyBudget::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl FederatedConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate the configuration fail-closed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for a zero participant cap, an
    /// unusable learning rate, a gradient dimension of zero or one whose
    /// envelope cannot fit the ciphertext cap, an invalid privacy budget,
    /// or a zero attempt limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_participants == 0 {
            return Err(ConfigError::Validation(
                "max_participants must be at least 1".to_string(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "learning_rate must be finite and positive, got {}",
                self.learning_rate
            )));
        }
        if self.gradient_dim == 0 {
            return Err(ConfigError::Validation(
                "gradient_dim must be at least 1".to_string(),
            ));
        }
        // Envelope layout: nonce + bincode length prefix + f32 payload + tag.
        let envelope_len = NONCE_LEN + 8 + self.gradient_dim * 4 + 16;
        if envelope_len > MAX_CIPHERTEXT_BYTES {
            return Err(ConfigError::Validation(format!(
                "gradient_dim {} produces a {envelope_len}-byte envelope, limit is {MAX_CIPHERTEXT_BYTES}",
                self.gradient_dim
            )));
        }
        self.privacy
            .validate()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Public policy constants proven against during eligibility checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Minimum age an agent must prove.
    #[serde(default = "default_required_age")]
    pub required_age: i64,

    /// Insurance provider an agent must prove coverage with.
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
}

const fn default_required_age() -> i64 {
    18
}

fn default_provider_id() -> String {
    "INS123".to_string()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            required_age: default_required_age(),
            provider_id: default_provider_id(),
        }
    }
}

impl PolicyConfig {
    /// The public input map for proof generation and ledger submission.
    #[must_use]
    pub fn public_inputs(&self) -> InputMap {
        InputMap::from([
            ("minimumAge".to_string(), InputValue::from(self.required_age)),
            (
                "insuranceProviderID".to_string(),
                InputValue::from(self.provider_id.as_str()),
            ),
        ])
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[source] std::io::Error),

    /// Failed to parse the configuration.
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    /// Failed to serialize the configuration.
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] toml::ser::Error),

    /// The configuration is semantically invalid.
    #[error("invalid config: {0}")]
    Validation(String),
}
