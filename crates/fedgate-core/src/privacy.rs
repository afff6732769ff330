//! Differential-privacy noise calibration.
//!
//! The noise scale is fixed by configuration, not derived from data: a
//! zero-concentrated-DP budget ρ and a per-round ε yield
//! `σ = sqrt(ρ / ε²)`, computed once at construction. Every gradient
//! dimension then receives an independent zero-mean Gaussian sample of
//! standard deviation σ before encryption.
//!
//! Privacy loss accumulates across rounds: under zCDP, ρ composes
//! additively, so after `n` completed rounds the total budget consumed is
//! `n × ρ`. The coordinator surfaces this on every [`Round`].
//!
//! [`Round`]: crate::coordinator::Round

use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Differential-privacy budget configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    /// Zero-concentrated-DP budget ρ, consumed additively per round.
    #[serde(default = "default_rho")]
    pub rho: f64,

    /// Per-round privacy parameter ε.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

const fn default_rho() -> f64 {
    1.0
}

const fn default_epsilon() -> f64 {
    1.0
}

impl Default for PrivacyBudget {
    fn default() -> Self {
        Self {
            rho: default_rho(),
            epsilon: default_epsilon(),
        }
    }
}

impl PrivacyBudget {
    /// Check the budget is usable for calibration.
    ///
    /// # Errors
    ///
    /// Returns [`PrivacyError::InvalidBudget`] when ρ or ε is non-positive
    /// or non-finite.
    pub fn validate(&self) -> Result<(), PrivacyError> {
        if !self.rho.is_finite() || self.rho <= 0.0 {
            return Err(PrivacyError::InvalidBudget {
                reason: format!("rho must be finite and positive, got {}", self.rho),
            });
        }
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(PrivacyError::InvalidBudget {
                reason: format!("epsilon must be finite and positive, got {}", self.epsilon),
            });
        }
        Ok(())
    }
}

/// Errors from noise calibration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PrivacyError {
    /// The configured budget cannot calibrate a noise scale.
    #[error("invalid privacy budget: {reason}")]
    InvalidBudget {
        /// What was wrong with the budget.
        reason: String,
    },
}

/// Calibrates and draws Gaussian noise for gradient perturbation.
#[derive(Debug, Clone, Copy)]
pub struct NoiseCalibrator {
    budget: PrivacyBudget,
    sigma: f64,
    distribution: Normal<f64>,
}

impl NoiseCalibrator {
    /// Calibrate the noise scale from a privacy budget.
    ///
    /// The scale is `σ = sqrt(ρ / ε²)`, fixed for the calibrator's lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`PrivacyError::InvalidBudget`] for a non-positive or
    /// non-finite budget.
    pub fn new(budget: PrivacyBudget) -> Result<Self, PrivacyError> {
        budget.validate()?;
        let sigma = (budget.rho / (budget.epsilon * budget.epsilon)).sqrt();
        Self::from_sigma(budget, sigma)
    }

    /// Build a calibrator with an explicit noise scale, bypassing the budget
    /// relation. `sigma = 0` is the degenerate noiseless scale used to make
    /// aggregation arithmetic exactly checkable in tests and simulations.
    ///
    /// # Errors
    ///
    /// Returns [`PrivacyError::InvalidBudget`] when `sigma` is negative or
    /// non-finite.
    pub fn with_sigma(sigma: f64) -> Result<Self, PrivacyError> {
        if !sigma.is_finite() || sigma < 0.0 {
            return Err(PrivacyError::InvalidBudget {
                reason: format!("sigma must be finite and non-negative, got {sigma}"),
            });
        }
        Self::from_sigma(PrivacyBudget::default(), sigma)
    }

    fn from_sigma(budget: PrivacyBudget, sigma: f64) -> Result<Self, PrivacyError> {
        let distribution = Normal::new(0.0, sigma).map_err(|err| PrivacyError::InvalidBudget {
            reason: format!("noise scale {sigma} rejected: {err}"),
        })?;
        Ok(Self {
            budget,
            sigma,
            distribution,
        })
    }

    /// The calibrated noise scale. Stable across calls for the same budget.
    #[must_use]
    pub const fn sigma(&self) -> f64 {
        self.sigma
    }

    /// The budget this calibrator was built from.
    #[must_use]
    pub const fn budget(&self) -> &PrivacyBudget {
        &self.budget
    }

    /// Draw one fresh independent Gaussian sample per gradient dimension.
    ///
    /// Every call uses a new random draw. Repeated submissions from the same
    /// agent in the same round therefore receive different noise, so the
    /// noise cannot be cancelled by averaging resubmissions.
    #[must_use]
    pub fn draw_noise(&self, dim: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..dim)
            .map(|_| {
                #[allow(clippy::cast_possible_truncation)] // gradients are f32
                let sample = self.distribution.sample(&mut rng) as f32;
                sample
            })
            .collect()
    }

    /// Total zCDP budget consumed after `rounds` completed rounds.
    ///
    /// ρ composes additively across rounds; there is no per-round reset.
    #[must_use]
    pub fn cumulative_rho(&self, rounds: u64) -> f64 {
        #[allow(clippy::cast_precision_loss)] // round counts stay small
        let rounds = rounds as f64;
        rounds * self.budget.rho
    }
}
