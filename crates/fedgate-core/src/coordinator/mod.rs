//! Round-based federated training coordination.
//!
//! [`FederatedCoordinator::train_round`] runs one round end to end: admit
//! contributions up to the participant cap, gate each agent behind its
//! eligibility proof, noise and encrypt each admitted gradient, securely
//! aggregate the survivors, apply the decrypted mean to the model, and emit
//! an immutable [`Round`] record carrying the new model fingerprint.
//!
//! Failure isolation follows the round structure: anything that goes wrong
//! for a single agent before aggregation excludes that agent and the round
//! continues; anything that goes wrong from aggregation onward aborts the
//! round with the model, counter, and history untouched.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregate::{AggregationError, EncryptedContribution, EncryptionContext, SecureAggregator};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, FederatedConfig};
use crate::contribution::AgentContribution;
use crate::eligibility::{EligibilityGate, GateError, GateOutcome, LedgerClient};
use crate::model::{Model, ModelError, ModelFingerprint};
use crate::privacy::{NoiseCalibrator, PrivacyError};
use crate::proof::Prover;

/// Errors from the gradient source capability.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GradientError {
    /// The capability could not produce this agent's training signal.
    #[error("gradient unavailable for agent {agent_id}: {reason}")]
    Unavailable {
        /// The agent whose gradient could not be computed.
        agent_id: String,
        /// Capability-reported failure reason.
        reason: String,
    },
}

/// External capability producing an agent's local training signal.
///
/// The returned vector is opaque to the coordinator; the agent's raw data is
/// never inspected here.
#[async_trait]
pub trait GradientSource: Send + Sync {
    /// The gradient vector for one agent's contribution.
    async fn gradient(&self, contribution: &AgentContribution) -> Result<Vec<f32>, GradientError>;
}

/// Simulated gradient source for development and tests.
///
/// Draws a fresh standard-normal vector of the configured dimension per
/// call, standing in for an agent's local training step.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedGradient {
    dim: usize,
}

impl SimulatedGradient {
    /// Source producing vectors of the given dimension.
    #[must_use]
    pub const fn new(dim: usize) -> Self {
        Self { dim }
    }
}

#[async_trait]
impl GradientSource for SimulatedGradient {
    async fn gradient(&self, _contribution: &AgentContribution) -> Result<Vec<f32>, GradientError> {
        let mut rng = rand::thread_rng();
        Ok((0..self.dim).map(|_| StandardNormal.sample(&mut rng)).collect())
    }
}

/// Why an agent was excluded from a round.
#[derive(Debug, Clone)]
pub struct AgentRoundError {
    /// The excluded agent.
    pub agent_id: String,
    /// What excluded it.
    pub reason: String,
}

/// One completed training round. Immutable once returned.
#[derive(Debug, Clone)]
pub struct Round {
    /// Round number; strictly increases by 1 per completed round.
    pub round: u64,
    /// Contributions that survived gating and entered the aggregate.
    pub participants: usize,
    /// Fingerprint of the model state after this round's update.
    pub model_fingerprint: ModelFingerprint,
    /// Completion time, milliseconds since the Unix epoch.
    pub completed_at_ms: u64,
    /// Noise scale applied to every contribution this round.
    pub sigma: f64,
    /// Total zCDP budget consumed through this round.
    pub cumulative_rho: f64,
    /// Agents excluded from this round, with reasons.
    pub agent_errors: Vec<AgentRoundError>,
}

/// Errors fatal to a whole round.
///
/// When one of these is returned, the model, round counter, and round
/// history are unchanged; the round was not recorded.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RoundError {
    /// Aggregation or aggregate decryption failed.
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),

    /// The aggregated update could not be applied to the model.
    #[error("model update failed: {0}")]
    ModelUpdate(#[from] ModelError),
}

/// Errors building a coordinator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The privacy budget cannot calibrate a noise scale.
    #[error(transparent)]
    Privacy(#[from] PrivacyError),

    /// The eligibility gate rejected its configuration.
    #[error(transparent)]
    Gate(#[from] GateError),
}

/// Orchestrates proof-gated federated training rounds.
///
/// The coordinator exclusively owns the shared [`Model`] and the single
/// [`EncryptionContext`] key for its whole lifetime. `train_round` takes
/// `&mut self`, so rounds cannot overlap on one instance; key rotation
/// means constructing a new coordinator.
pub struct FederatedCoordinator<P, L, G> {
    gate: EligibilityGate<P, L>,
    calibrator: NoiseCalibrator,
    aggregator: SecureAggregator,
    gradient_source: G,
    model: Model,
    config: FederatedConfig,
    clock: Arc<dyn Clock>,
    completed_rounds: u64,
    history: Vec<Round>,
}

impl<P: Prover, L: LedgerClient, G: GradientSource> FederatedCoordinator<P, L, G> {
    /// Build a coordinator over the injected capabilities.
    ///
    /// Generates a fresh encryption key and validates the configuration
    /// fail-closed.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError`] for an invalid configuration, privacy
    /// budget, or retry policy.
    pub fn new(
        prover: P,
        ledger: L,
        gradient_source: G,
        model: Model,
        config: FederatedConfig,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let calibrator = NoiseCalibrator::new(config.privacy)?;
        let gate = EligibilityGate::new(
            prover,
            ledger,
            config.policy.clone(),
            config.backoff.clone(),
            config.max_attempts,
        )?;
        Ok(Self {
            gate,
            calibrator,
            aggregator: SecureAggregator::new(EncryptionContext::generate()),
            gradient_source,
            model,
            config,
            clock: Arc::new(SystemClock),
            completed_rounds: 0,
            history: Vec::new(),
        })
    }

    /// Replace the timestamp source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the noise calibrator, e.g. with the σ = 0 degenerate scale
    /// for exactly checkable aggregation arithmetic.
    #[must_use]
    pub fn with_noise_calibrator(mut self, calibrator: NoiseCalibrator) -> Self {
        self.calibrator = calibrator;
        self
    }

    /// Run one training round over the given contributions.
    ///
    /// Contributions beyond the configured participant cap are excluded
    /// from this round by admission control — not retried, not queued.
    /// Per-agent eligibility and gradient work runs concurrently; one
    /// agent's backoff wait never stalls another's check. A round where
    /// every agent was excluded still completes, with participant count 0
    /// and the model untouched.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError`] only for aggregation or model-update
    /// failures; those abort the round with no state change. Per-agent
    /// failures are recorded on the returned [`Round`] instead.
    pub async fn train_round(
        &mut self,
        contributions: &[AgentContribution],
    ) -> Result<Round, RoundError> {
        let next_round = self.completed_rounds + 1;
        let admitted = contributions.len().min(self.config.max_participants);
        if admitted < contributions.len() {
            warn!(
                round = next_round,
                admitted,
                excluded = contributions.len() - admitted,
                "admission control truncated the contribution list"
            );
        }
        let admitted = &contributions[..admitted];
        info!(round = next_round, contributions = admitted.len(), "starting training round");

        let results = join_all(
            admitted
                .iter()
                .map(|contribution| self.collect_contribution(contribution, next_round)),
        )
        .await;

        let mut ciphertexts = Vec::with_capacity(results.len());
        let mut agent_errors = Vec::new();
        for result in results {
            match result {
                Ok(ciphertext) => ciphertexts.push(ciphertext),
                Err(error) => {
                    warn!(agent_id = %error.agent_id, reason = %error.reason, "agent excluded from round");
                    agent_errors.push(error);
                },
            }
        }

        let participants = ciphertexts.len();
        if participants > 0 {
            let aggregate = self.aggregator.secure_aggregate(&ciphertexts, next_round)?;
            // The single point where an aggregate exists in cleartext. From
            // here to the fingerprint there are no await points, so a
            // cancelled round either never touched the model or produced a
            // complete, fingerprint-addressable state.
            let mean = self.aggregator.context().decrypt(&aggregate)?;
            self.model.apply_update(&mean, self.config.learning_rate)?;
        }

        self.completed_rounds = next_round;
        let round = Round {
            round: next_round,
            participants,
            model_fingerprint: self.model.fingerprint(),
            completed_at_ms: self.clock.now_ms(),
            sigma: self.calibrator.sigma(),
            cumulative_rho: self.calibrator.cumulative_rho(next_round),
            agent_errors,
        };
        info!(
            round = round.round,
            participants = round.participants,
            excluded = round.agent_errors.len(),
            fingerprint = %round.model_fingerprint,
            "training round completed"
        );
        self.history.push(round.clone());
        Ok(round)
    }

    /// Check one agent's eligibility without running a round.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] only for gate configuration problems.
    pub async fn check_eligibility(
        &self,
        contribution: &AgentContribution,
    ) -> Result<bool, GateError> {
        Ok(self.gate.check_eligibility(contribution).await?.eligible)
    }

    /// An independent copy of the current model state.
    #[must_use]
    pub fn model_snapshot(&self) -> Model {
        self.model.snapshot()
    }

    /// Number of completed rounds.
    #[must_use]
    pub const fn completed_rounds(&self) -> u64 {
        self.completed_rounds
    }

    /// The most recently completed round, if any.
    #[must_use]
    pub fn last_round(&self) -> Option<&Round> {
        self.history.last()
    }

    /// Every completed round, in order.
    #[must_use]
    pub fn rounds(&self) -> &[Round] {
        &self.history
    }

    /// The ledger capability behind the eligibility gate.
    pub const fn ledger(&self) -> &L {
        self.gate.ledger()
    }

    /// Gate, noise, and encrypt a single agent's contribution.
    async fn collect_contribution(
        &self,
        contribution: &AgentContribution,
        round: u64,
    ) -> Result<EncryptedContribution, AgentRoundError> {
        let excluded = |reason: String| AgentRoundError {
            agent_id: contribution.agent_id.clone(),
            reason,
        };

        let decision = self
            .gate
            .check_eligibility(contribution)
            .await
            .map_err(|err| excluded(err.to_string()))?;
        if !decision.eligible {
            let reason = match (decision.outcome, decision.last_error) {
                (GateOutcome::Exhausted, Some(err)) => {
                    format!("eligibility attempts exhausted: {err}")
                },
                (GateOutcome::Exhausted, None) => "eligibility attempts exhausted".to_string(),
                (_, Some(err)) => format!("eligibility rejected: {err}"),
                (_, None) => "eligibility rejected".to_string(),
            };
            return Err(excluded(reason));
        }

        let gradient = self
            .gradient_source
            .gradient(contribution)
            .await
            .map_err(|err| excluded(err.to_string()))?;

        let noise = self.calibrator.draw_noise(gradient.len());
        let noisy: Vec<f32> = gradient
            .iter()
            .zip(noise.iter())
            .map(|(&g, &n)| g + n)
            .collect();

        self.aggregator
            .context()
            .encrypt(&contribution.agent_id, round, &noisy)
            .map_err(|err| excluded(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::{InMemoryLedger, ScriptedOutcome};
    use crate::proof::DigestProver;

    fn contribution(id: &str) -> AgentContribution {
        AgentContribution::new(id, vec![0xAA; 8], format!("Qm-{id}"), format!("hash-{id}"))
    }

    fn config(dim: usize) -> FederatedConfig {
        FederatedConfig {
            gradient_dim: dim,
            ..FederatedConfig::default()
        }
    }

    fn coordinator(
        ledger: InMemoryLedger,
        dim: usize,
    ) -> FederatedCoordinator<DigestProver, InMemoryLedger, SimulatedGradient> {
        FederatedCoordinator::new(
            DigestProver,
            ledger,
            SimulatedGradient::new(dim),
            Model::diagnosis_demo(dim),
            config(dim),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn round_numbers_increase_by_one() {
        let mut coordinator = coordinator(InMemoryLedger::new(), 16);
        let contributions = vec![contribution("agent-1"), contribution("agent-2")];

        for expected in 1..=4 {
            let round = coordinator.train_round(&contributions).await.unwrap();
            assert_eq!(round.round, expected);
        }
        assert_eq!(coordinator.completed_rounds(), 4);
        assert_eq!(coordinator.rounds().len(), 4);
    }

    #[tokio::test]
    async fn admission_control_truncates_to_max_participants() {
        let mut coordinator = coordinator(InMemoryLedger::new(), 16);
        let contributions: Vec<_> = (0..6).map(|i| contribution(&format!("agent-{i}"))).collect();

        let round = coordinator.train_round(&contributions).await.unwrap();
        assert_eq!(round.participants, 3);
        assert!(round.agent_errors.is_empty());
        // Only the admitted agents reached the ledger.
        assert_eq!(coordinator.ledger().submission_count(), 3);
    }

    #[tokio::test]
    async fn ineligible_agent_is_genuinely_absent() {
        let ledger = InMemoryLedger::with_rejected_refs(["Qm-agent-2"]);
        let mut coordinator = coordinator(ledger, 16);
        let contributions = vec![
            contribution("agent-1"),
            contribution("agent-2"),
            contribution("agent-3"),
        ];

        let round = coordinator.train_round(&contributions).await.unwrap();
        assert_eq!(round.participants, 2);
        assert_eq!(round.agent_errors.len(), 1);
        assert_eq!(round.agent_errors[0].agent_id, "agent-2");
    }

    #[tokio::test]
    async fn zero_participant_round_completes_without_model_change() {
        let ledger = InMemoryLedger::with_rejected_refs(["Qm-agent-1", "Qm-agent-2"]);
        let mut coordinator = coordinator(ledger, 16);
        let before = coordinator.model_snapshot().fingerprint();

        let round = coordinator
            .train_round(&[contribution("agent-1"), contribution("agent-2")])
            .await
            .unwrap();

        assert_eq!(round.round, 1);
        assert_eq!(round.participants, 0);
        assert_eq!(round.agent_errors.len(), 2);
        assert_eq!(round.model_fingerprint, before);
        assert_eq!(coordinator.model_snapshot().fingerprint(), before);
    }

    #[tokio::test]
    async fn participating_round_changes_the_fingerprint() {
        let mut coordinator = coordinator(InMemoryLedger::new(), 16);
        let before = coordinator.model_snapshot().fingerprint();

        let round = coordinator.train_round(&[contribution("agent-1")]).await.unwrap();
        assert_eq!(round.participants, 1);
        assert_ne!(round.model_fingerprint, before);
        assert_eq!(coordinator.model_snapshot().fingerprint(), round.model_fingerprint);
    }

    #[tokio::test]
    async fn rounds_carry_privacy_accounting() {
        let mut coordinator = coordinator(InMemoryLedger::new(), 16);
        let contributions = vec![contribution("agent-1")];

        let first = coordinator.train_round(&contributions).await.unwrap();
        let second = coordinator.train_round(&contributions).await.unwrap();

        assert!((first.sigma - 1.0).abs() < f64::EPSILON);
        assert!((first.cumulative_rho - 1.0).abs() < f64::EPSILON);
        assert!((second.cumulative_rho - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_gate_excludes_the_agent() {
        let ledger = InMemoryLedger::with_outcomes([
            ScriptedOutcome::Transient,
            ScriptedOutcome::Transient,
            ScriptedOutcome::Transient,
        ]);
        let mut coordinator = coordinator(ledger, 16);

        let round = coordinator.train_round(&[contribution("agent-1")]).await.unwrap();
        assert_eq!(round.participants, 0);
        assert_eq!(round.agent_errors.len(), 1);
        assert!(round.agent_errors[0].reason.contains("exhausted"));
    }

    /// Gradient source that fails for selected agents.
    struct FailingGradient {
        failing_agent: String,
        dim: usize,
    }

    #[async_trait]
    impl GradientSource for FailingGradient {
        async fn gradient(
            &self,
            contribution: &AgentContribution,
        ) -> Result<Vec<f32>, GradientError> {
            if contribution.agent_id == self.failing_agent {
                return Err(GradientError::Unavailable {
                    agent_id: contribution.agent_id.clone(),
                    reason: "training node offline".to_string(),
                });
            }
            Ok(vec![1.0; self.dim])
        }
    }

    #[tokio::test]
    async fn gradient_failure_excludes_only_that_agent() {
        let mut coordinator = FederatedCoordinator::new(
            DigestProver,
            InMemoryLedger::new(),
            FailingGradient {
                failing_agent: "agent-2".to_string(),
                dim: 16,
            },
            Model::diagnosis_demo(16),
            config(16),
        )
        .unwrap();

        let round = coordinator
            .train_round(&[contribution("agent-1"), contribution("agent-2")])
            .await
            .unwrap();
        assert_eq!(round.participants, 1);
        assert_eq!(round.agent_errors.len(), 1);
        assert_eq!(round.agent_errors[0].agent_id, "agent-2");
        assert!(round.agent_errors[0].reason.contains("offline"));
    }

    /// Gradient source whose dimensionality disagrees between agents.
    struct MismatchedGradient;

    #[async_trait]
    impl GradientSource for MismatchedGradient {
        async fn gradient(
            &self,
            contribution: &AgentContribution,
        ) -> Result<Vec<f32>, GradientError> {
            if contribution.agent_id == "agent-1" {
                Ok(vec![1.0; 16])
            } else {
                Ok(vec![1.0; 8])
            }
        }
    }

    #[tokio::test]
    async fn dimension_mismatch_aborts_the_round_without_state_change() {
        let mut coordinator = FederatedCoordinator::new(
            DigestProver,
            InMemoryLedger::new(),
            MismatchedGradient,
            Model::diagnosis_demo(16),
            config(16),
        )
        .unwrap();
        let before = coordinator.model_snapshot().fingerprint();

        let err = coordinator
            .train_round(&[contribution("agent-1"), contribution("agent-2")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RoundError::Aggregation(AggregationError::DimensionMismatch { .. })
        ));

        // Nothing advanced, nothing recorded.
        assert_eq!(coordinator.completed_rounds(), 0);
        assert!(coordinator.rounds().is_empty());
        assert_eq!(coordinator.model_snapshot().fingerprint(), before);
    }

    #[tokio::test]
    async fn unmatched_gradient_dim_aborts_the_round() {
        // Model has no 16-dimensional block, so the aggregate cannot land.
        let mut coordinator = FederatedCoordinator::new(
            DigestProver,
            InMemoryLedger::new(),
            SimulatedGradient::new(16),
            Model::diagnosis_demo(32),
            config(16),
        )
        .unwrap();

        let err = coordinator.train_round(&[contribution("agent-1")]).await.unwrap_err();
        assert!(matches!(err, RoundError::ModelUpdate(ModelError::NoMatchingBlock { dim: 16 })));
        assert_eq!(coordinator.completed_rounds(), 0);
    }

    #[tokio::test]
    async fn check_eligibility_exposes_the_gate() {
        let ledger = InMemoryLedger::with_rejected_refs(["Qm-agent-2"]);
        let coordinator = coordinator(ledger, 16);

        assert!(coordinator.check_eligibility(&contribution("agent-1")).await.unwrap());
        assert!(!coordinator.check_eligibility(&contribution("agent-2")).await.unwrap());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_construction() {
        let result = FederatedCoordinator::new(
            DigestProver,
            InMemoryLedger::new(),
            SimulatedGradient::new(16),
            Model::diagnosis_demo(16),
            FederatedConfig {
                max_participants: 0,
                ..FederatedConfig::default()
            },
        );
        assert!(matches!(result, Err(CoordinatorError::Config(_))));
    }
}
