//! Proof-gated federated aggregation.
//!
//! This crate coordinates iterative training of a shared diagnostic model
//! across independent data holders ("agents") without any agent's raw data
//! leaving its boundary. Every agent action is gated behind a
//! proof-of-eligibility check before that agent's contribution is trusted.
//!
//! # Architecture
//!
//! - [`proof`] — formats proof inputs and delegates to an external
//!   [`proof::Prover`] capability, enforcing the canonical artifact shape.
//! - [`eligibility`] — wraps proof generation and ledger submission in a
//!   bounded-retry, exponential-backoff gate that fails closed.
//! - [`privacy`] — calibrates the differential-privacy noise scale from a
//!   configured budget and draws fresh Gaussian noise per contribution.
//! - [`aggregate`] — encrypts contributions under a per-coordinator
//!   AES-256-GCM key and combines them into an encrypted mean while holding
//!   at most one cleartext gradient at a time.
//! - [`model`] — the coordinator-owned parameter state and its
//!   deterministic blake3 content fingerprint.
//! - [`coordinator`] — orchestrates a round end to end and records
//!   immutable [`coordinator::Round`] results.
//!
//! The hard cryptography stays external: the proof system and ledger are
//! injected capabilities ([`proof::Prover`], [`eligibility::LedgerClient`]),
//! and the symmetric cipher is the vetted `aes-gcm` implementation. This
//! crate owns the orchestration, retry, privacy, and versioning semantics
//! around them.

pub mod aggregate;
pub mod clock;
pub mod config;
pub mod contribution;
pub mod coordinator;
pub mod eligibility;
pub mod model;
pub mod privacy;
pub mod proof;

pub use aggregate::{EncryptedContribution, EncryptionContext, SecureAggregator};
pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, FederatedConfig, PolicyConfig};
pub use contribution::AgentContribution;
pub use coordinator::{
    CoordinatorError, FederatedCoordinator, GradientSource, Round, RoundError, SimulatedGradient,
};
pub use eligibility::{
    BackoffConfig, EligibilityDecision, EligibilityGate, GateOutcome, InMemoryLedger, LedgerClient,
};
pub use model::{Model, ModelFingerprint, ParameterBlock};
pub use privacy::{NoiseCalibrator, PrivacyBudget};
pub use proof::{DigestProver, Proof, ProofGate, Prover};
