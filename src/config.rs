//! Configuration types for LoRA injection.

use serde::{Deserialize, Serialize};

use crate::error::{LoraError, Result};
use crate::traits::AdapterConfig;

/// Hyperparameters shared by every adapter created during one injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition.
    pub r: usize,

    /// Scaling numerator; the update is multiplied by `alpha / r`.
    pub alpha: f64,

    /// Dropout probability applied to the adapter input branch.
    #[serde(default)]
    pub dropout: f64,

    /// Case-insensitive substrings selecting which dense transforms to wrap.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
}

fn default_target_modules() -> Vec<String> {
    [
        "attn", "to_q", "to_k", "to_v", "q_proj", "k_proj", "v_proj", "out_proj", "proj", "fc1",
        "fc2", "mlp", "ff", "out",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 16,
            alpha: 16.0,
            dropout: 0.0,
            target_modules: default_target_modules(),
        }
    }
}

impl LoraConfig {
    /// Create a configuration with the default target modules.
    #[must_use]
    pub fn new(r: usize, alpha: f64, dropout: f64) -> Self {
        Self {
            r,
            alpha,
            dropout,
            ..Default::default()
        }
    }

    /// Replace the target pattern set.
    #[must_use]
    pub fn with_target_modules<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_modules = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the dropout probability.
    #[must_use]
    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    /// Scaling factor applied to the low-rank update.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }
}

impl AdapterConfig for LoraConfig {
    fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(LoraError::InvalidAdapterConfig("rank must be >= 1".into()));
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(LoraError::InvalidAdapterConfig(format!(
                "alpha must be a positive number, got {}",
                self.alpha
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LoraError::InvalidAdapterConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}
