//! Proof-gated eligibility checks with bounded retries.
//!
//! [`EligibilityGate`] wraps proof generation and ledger submission in a
//! retry state machine: `Pending → Attempting(k) → {Succeeded |
//! Attempting(k+1) | Exhausted}`. Only transient capability failures are
//! retried, with a deterministic exponential backoff between attempts; a
//! definitive negative verdict terminates immediately. Exhausting every
//! attempt fails closed — an agent whose eligibility could not be
//! established is not eligible.
//!
//! Retry state is data, not loop state: every decision carries the full
//! [`AttemptRecord`] list, so callers and tests can inspect the exact
//! schedule that was executed.

mod ledger;

pub use ledger::{InMemoryLedger, LedgerClient, LedgerError, ScriptedOutcome, VerificationRecord};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PolicyConfig;
use crate::contribution::AgentContribution;
use crate::proof::{InputMap, InputValue, ProofGate, Prover};

/// Backoff schedule between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between attempts.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Linear backoff.
    Linear {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increment per retry.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    /// Exponential 4s, doubling, capped at 10s: 4s → 8s → 10s → 10s…
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// The delay between attempt `attempt` (1-based) and the next one.
    ///
    /// Deterministic in the attempt number, so retry schedules are exactly
    /// assertable.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
                let delay_secs =
                    initial_delay.as_secs_f64() * multiplier.powi((attempt - 1) as i32);
                // Clamp while still in f64: a high attempt count overflows
                // what Duration::from_secs_f64 accepts.
                Duration::from_secs_f64(delay_secs.min(max_delay.as_secs_f64()))
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => {
                let delay = *initial_delay + *increment * (attempt - 1);
                delay.min(*max_delay)
            },
        }
    }
}

/// One executed attempt in a gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Attempt number, starting at 1.
    pub attempt: u32,

    /// Backoff slept before this attempt. Zero for the first attempt.
    pub delay_before: Duration,
}

/// Terminal state of a gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The proof was generated and the ledger accepted it.
    Accepted,
    /// The proof or submission was definitively rejected. Not retried.
    Rejected,
    /// Every attempt failed transiently. Fails closed.
    Exhausted,
}

/// Outcome of one eligibility check, attempts included.
#[derive(Debug, Clone)]
pub struct EligibilityDecision {
    /// Whether the agent may contribute this round.
    pub eligible: bool,

    /// How the check terminated.
    pub outcome: GateOutcome,

    /// Every attempt executed, in order.
    pub attempts: Vec<AttemptRecord>,

    /// The error that ended the final attempt, if any.
    pub last_error: Option<String>,
}

impl EligibilityDecision {
    fn terminal(outcome: GateOutcome, attempts: Vec<AttemptRecord>, last_error: Option<String>) -> Self {
        Self {
            eligible: matches!(outcome, GateOutcome::Accepted),
            outcome,
            attempts,
            last_error,
        }
    }
}

/// Errors from gate configuration.
///
/// Ordinary verification failure is data ([`EligibilityDecision`]), never an
/// error; this type only covers unusable gate configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GateError {
    /// The gate was configured with an impossible retry policy.
    #[error("invalid gate configuration: {reason}")]
    Configuration {
        /// What was wrong with the configuration.
        reason: String,
    },
}

/// Proof-of-eligibility gate with bounded, backoff-based retries.
#[derive(Debug)]
pub struct EligibilityGate<P, L> {
    proof_gate: ProofGate<P>,
    ledger: L,
    policy: PolicyConfig,
    backoff: BackoffConfig,
    max_attempts: u32,
}

impl<P: Prover, L: LedgerClient> EligibilityGate<P, L> {
    /// Build a gate over a prover and ledger capability.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Configuration`] when `max_attempts` is zero.
    pub fn new(
        prover: P,
        ledger: L,
        policy: PolicyConfig,
        backoff: BackoffConfig,
        max_attempts: u32,
    ) -> Result<Self, GateError> {
        if max_attempts == 0 {
            return Err(GateError::Configuration {
                reason: "max_attempts must be at least 1".to_string(),
            });
        }
        Ok(Self {
            proof_gate: ProofGate::new(prover),
            ledger,
            policy,
            backoff,
            max_attempts,
        })
    }

    /// The ledger capability behind the gate.
    pub const fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Check whether an agent may contribute this round.
    ///
    /// At most `max_attempts` attempts are made. Between attempt `k` and
    /// `k + 1` the gate sleeps `BackoffConfig::delay_for_attempt(k)`; the
    /// sleep suspends only this check's future, so other agents' checks
    /// proceed during the wait.
    ///
    /// # Errors
    ///
    /// Never fails for ordinary rejection or exhaustion — those are carried
    /// in the returned decision. [`GateError`] is reserved for configuration
    /// problems.
    pub async fn check_eligibility(
        &self,
        contribution: &AgentContribution,
    ) -> Result<EligibilityDecision, GateError> {
        let private = private_inputs(contribution);
        let public = self.policy.public_inputs();

        let mut attempts = Vec::with_capacity(self.max_attempts as usize);
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let delay_before = if attempt == 1 {
                Duration::ZERO
            } else {
                self.backoff.delay_for_attempt(attempt - 1)
            };
            if !delay_before.is_zero() {
                debug!(
                    agent_id = %contribution.agent_id,
                    attempt,
                    delay = ?delay_before,
                    "backing off before retry"
                );
                tokio::time::sleep(delay_before).await;
            }
            attempts.push(AttemptRecord { attempt, delay_before });

            let proof = match self.proof_gate.generate(&private, &public).await {
                Ok(proof) => proof,
                Err(err) if err.is_transient() => {
                    debug!(agent_id = %contribution.agent_id, attempt, error = %err, "proof generation failed transiently");
                    last_error = Some(err.to_string());
                    continue;
                },
                Err(err) => {
                    debug!(agent_id = %contribution.agent_id, attempt, error = %err, "proof generation rejected");
                    return Ok(EligibilityDecision::terminal(
                        GateOutcome::Rejected,
                        attempts,
                        Some(err.to_string()),
                    ));
                },
            };

            match self.ledger.submit(&proof, &public, &contribution.storage_ref).await {
                Ok(true) => {
                    debug!(agent_id = %contribution.agent_id, attempt, "eligibility accepted");
                    return Ok(EligibilityDecision::terminal(GateOutcome::Accepted, attempts, None));
                },
                Ok(false) => {
                    debug!(agent_id = %contribution.agent_id, attempt, "eligibility definitively rejected");
                    return Ok(EligibilityDecision::terminal(GateOutcome::Rejected, attempts, None));
                },
                Err(err) if err.is_transient() => {
                    debug!(agent_id = %contribution.agent_id, attempt, error = %err, "ledger submission failed transiently");
                    last_error = Some(err.to_string());
                },
                Err(err) => {
                    debug!(agent_id = %contribution.agent_id, attempt, error = %err, "ledger rejected submission");
                    return Ok(EligibilityDecision::terminal(
                        GateOutcome::Rejected,
                        attempts,
                        Some(err.to_string()),
                    ));
                },
            }
        }

        warn!(
            agent_id = %contribution.agent_id,
            attempts = attempts.len(),
            "eligibility check exhausted all attempts, failing closed"
        );
        Ok(EligibilityDecision::terminal(GateOutcome::Exhausted, attempts, last_error))
    }
}

fn private_inputs(contribution: &AgentContribution) -> InputMap {
    InputMap::from([
        ("patientID".to_string(), InputValue::from(contribution.agent_id.as_str())),
        (
            "medicalHistoryHash".to_string(),
            InputValue::from(contribution.history_hash.as_str()),
        ),
    ])
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
