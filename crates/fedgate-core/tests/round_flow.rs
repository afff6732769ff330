//! End-to-end round scenarios against the public API.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;

use fedgate_core::clock::Clock;
use fedgate_core::coordinator::{GradientError, GradientSource};
use fedgate_core::eligibility::ScriptedOutcome;
use fedgate_core::{
    AgentContribution, DigestProver, FederatedConfig, FederatedCoordinator, InMemoryLedger, Model,
    NoiseCalibrator, ParameterBlock,
};

const DIM: usize = 4;
const LEARNING_RATE: f32 = 0.01;

/// Gradient source returning a fixed vector per agent.
struct FixedGradient {
    gradients: HashMap<String, Vec<f32>>,
}

#[async_trait]
impl GradientSource for FixedGradient {
    async fn gradient(&self, contribution: &AgentContribution) -> Result<Vec<f32>, GradientError> {
        self.gradients
            .get(&contribution.agent_id)
            .cloned()
            .ok_or_else(|| GradientError::Unavailable {
                agent_id: contribution.agent_id.clone(),
                reason: "no scripted gradient".to_string(),
            })
    }
}

#[derive(Debug)]
struct FixedClock(u64);

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.0
    }
}

fn contribution(id: &str) -> AgentContribution {
    AgentContribution::new(id, vec![0x42; 8], format!("Qm-{id}"), format!("hash-{id}"))
}

fn config() -> FederatedConfig {
    FederatedConfig {
        gradient_dim: DIM,
        learning_rate: LEARNING_RATE,
        ..FederatedConfig::default()
    }
}

fn noiseless_coordinator<G: GradientSource>(
    ledger: InMemoryLedger,
    gradients: G,
) -> FederatedCoordinator<DigestProver, InMemoryLedger, G> {
    FederatedCoordinator::new(
        DigestProver,
        ledger,
        gradients,
        Model::new(vec![ParameterBlock::zeros("weights", DIM)]),
        config(),
    )
    .unwrap()
    .with_noise_calibrator(NoiseCalibrator::with_sigma(0.0).unwrap())
}

#[tokio::test]
async fn rejected_agent_reduces_participants_and_mean() {
    let g1 = vec![1.0f32, 2.0, 3.0, 4.0];
    let g2 = vec![3.0f32, 0.0, -1.0, 2.0];
    let gradients = FixedGradient {
        gradients: HashMap::from([
            ("agent-1".to_string(), g1.clone()),
            ("agent-2".to_string(), vec![100.0; DIM]),
            ("agent-3".to_string(), g2.clone()),
        ]),
    };

    // agent-2 gets a definitive on-ledger rejection.
    let ledger = InMemoryLedger::with_rejected_refs(["Qm-agent-2"]);
    let mut coordinator =
        noiseless_coordinator(ledger, gradients).with_clock(Arc::new(FixedClock(1_700_000_000_000)));

    let round = coordinator
        .train_round(&[
            contribution("agent-1"),
            contribution("agent-2"),
            contribution("agent-3"),
        ])
        .await
        .unwrap();

    assert_eq!(round.round, 1);
    assert_eq!(round.participants, 2);
    assert_eq!(round.agent_errors.len(), 1);
    assert_eq!(round.agent_errors[0].agent_id, "agent-2");
    assert_eq!(round.completed_at_ms, 1_700_000_000_000);

    // With σ = 0 the update is exactly -lr × (g1 + g2) / 2 from zeros.
    let model = coordinator.model_snapshot();
    let weights = &model.blocks()[0].values;
    for i in 0..DIM {
        let expected = -LEARNING_RATE * (g1[i] + g2[i]) / 2.0;
        assert!(
            (weights[i] - expected).abs() < 1e-6,
            "dim {i}: got {}, want {expected}",
            weights[i]
        );
    }

    // The rejected agent still left an audit trail on the ledger.
    assert_eq!(coordinator.ledger().submission_count(), 3);
    assert_eq!(coordinator.ledger().total_verifications(), 2);
    assert_eq!(coordinator.ledger().pin_count(), 2);
}

#[tokio::test]
async fn round_counter_is_monotonic_across_mixed_outcomes() {
    let gradients = FixedGradient {
        gradients: HashMap::from([
            ("agent-1".to_string(), vec![1.0; DIM]),
            ("agent-2".to_string(), vec![2.0; DIM]),
        ]),
    };
    // Round 1: both accepted. Round 2: agent-1 rejected after one attempt,
    // agent-2 accepted. Round 3: both rejected (zero participants).
    let ledger = InMemoryLedger::with_outcomes([
        ScriptedOutcome::Accept,
        ScriptedOutcome::Accept,
        ScriptedOutcome::Reject,
        ScriptedOutcome::Accept,
        ScriptedOutcome::Reject,
        ScriptedOutcome::Reject,
    ]);
    let mut coordinator = noiseless_coordinator(ledger, gradients);
    let contributions = vec![contribution("agent-1"), contribution("agent-2")];

    let mut previous = 0;
    for _ in 0..3 {
        let round = coordinator.train_round(&contributions).await.unwrap();
        assert_eq!(round.round, previous + 1);
        previous = round.round;
    }
    assert_eq!(coordinator.rounds().len(), 3);
    assert_eq!(coordinator.rounds()[2].participants, 0);

    // The zero-participant round left the model where round 2 put it.
    assert_eq!(
        coordinator.rounds()[1].model_fingerprint,
        coordinator.rounds()[2].model_fingerprint
    );
}

#[tokio::test]
async fn identical_round_sequences_converge_to_identical_fingerprints() {
    let make = || {
        noiseless_coordinator(
            InMemoryLedger::new(),
            FixedGradient {
                gradients: HashMap::from([("agent-1".to_string(), vec![0.5, -0.5, 1.5, 0.0])]),
            },
        )
    };
    let contributions = vec![contribution("agent-1")];

    let mut first = make();
    let mut second = make();
    for _ in 0..3 {
        let a = first.train_round(&contributions).await.unwrap();
        let b = second.train_round(&contributions).await.unwrap();
        // Independent coordinators with independent keys applying the same
        // updates produce the same fingerprints.
        assert_eq!(a.model_fingerprint, b.model_fingerprint);
    }
    assert_ne!(
        first.rounds()[0].model_fingerprint,
        first.rounds()[2].model_fingerprint
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever mix of verdicts the ledger hands out round to round, the
    /// counter advances by exactly 1 per completed round and participant
    /// counts track the accepted agents.
    #[test]
    fn round_counter_is_monotonic_for_arbitrary_admission_outcomes(
        verdicts in prop::collection::vec(prop::collection::vec(any::<bool>(), 1..=3), 1..=4),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let scripted: Vec<ScriptedOutcome> = verdicts
                .iter()
                .flatten()
                .map(|&accepted| {
                    if accepted {
                        ScriptedOutcome::Accept
                    } else {
                        ScriptedOutcome::Reject
                    }
                })
                .collect();
            let gradients = FixedGradient {
                gradients: HashMap::from([
                    ("agent-1".to_string(), vec![1.0; DIM]),
                    ("agent-2".to_string(), vec![2.0; DIM]),
                    ("agent-3".to_string(), vec![3.0; DIM]),
                ]),
            };
            let mut coordinator =
                noiseless_coordinator(InMemoryLedger::with_outcomes(scripted), gradients);

            for (i, round_verdicts) in verdicts.iter().enumerate() {
                let contributions: Vec<_> = (1..=round_verdicts.len())
                    .map(|a| contribution(&format!("agent-{a}")))
                    .collect();
                let round = coordinator.train_round(&contributions).await.unwrap();
                assert_eq!(round.round, i as u64 + 1);
                let accepted = round_verdicts.iter().filter(|&&v| v).count();
                assert_eq!(round.participants, accepted);
                assert_eq!(round.agent_errors.len(), round_verdicts.len() - accepted);
            }
            assert_eq!(coordinator.completed_rounds(), verdicts.len() as u64);
        });
    }
}

#[tokio::test(start_paused = true)]
async fn one_agents_backoff_does_not_block_the_round() {
    let gradients = FixedGradient {
        gradients: HashMap::from([
            ("agent-1".to_string(), vec![1.0; DIM]),
            ("agent-2".to_string(), vec![3.0; DIM]),
        ]),
    };
    // agent-1's first two submissions fail transiently, forcing 4s + 8s of
    // backoff; agent-2 sails through. Paused time only advances when every
    // task is idle, so this also proves the waits overlap instead of
    // serializing the round.
    let ledger = InMemoryLedger::with_outcomes([
        ScriptedOutcome::Transient,
        ScriptedOutcome::Accept,
        ScriptedOutcome::Transient,
        ScriptedOutcome::Accept,
    ]);
    let mut coordinator = noiseless_coordinator(ledger, gradients);

    let started = tokio::time::Instant::now();
    let round = coordinator
        .train_round(&[contribution("agent-1"), contribution("agent-2")])
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(round.participants, 2);
    assert!(round.agent_errors.is_empty());
    // Exactly the retrying agent's backoff, not a serialized sum of both.
    assert_eq!(elapsed, std::time::Duration::from_secs(12));
}
