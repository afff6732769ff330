//! Eligibility proof generation and verification.
//!
//! [`ProofGate`] formats private/public input maps and delegates to an
//! external [`Prover`] capability. It owns no cryptographic logic; its job is
//! the input/output contract and the canonical artifact shape.
//!
//! # Artifact contract
//!
//! Every proof artifact is exactly [`CANONICAL_PROOF_LEN`] bytes, regardless
//! of input size. The length check is the cheap half of the contract and runs
//! on this side of the capability boundary: [`ProofGate::verify`] rejects a
//! wrong-length artifact without ever invoking the verifier, and
//! [`ProofGate::generate`] refuses to wrap a wrong-length artifact coming
//! back from the prover. The expensive cryptographic half stays behind
//! [`Prover`].
//!
//! # Input canonicalization
//!
//! Input maps are ordered ([`InputMap`] is a `BTreeMap`), so their serialized
//! form is canonical and proof generation is a pure function of the inputs
//! plus the injected capability. No timestamps or other ambient state enter
//! the artifact.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Canonical proof artifact length in bytes.
pub const CANONICAL_PROOF_LEN: usize = 256;

/// Ordered proof input map. Ordering makes the serialized form canonical.
pub type InputMap = BTreeMap<String, InputValue>;

/// A single proof input value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    /// Textual input (identifiers, commitments).
    Text(String),
    /// Integer input (policy thresholds).
    Integer(i64),
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for InputValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for InputValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Errors from proof generation or verification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProofError {
    /// The prover capability failed to produce an artifact.
    #[error("proof generation failed (transient: {transient}): {reason}")]
    GenerationFailed {
        /// Capability-reported failure reason.
        reason: String,
        /// Whether retrying the same inputs could succeed.
        transient: bool,
    },

    /// The verifier capability failed outright (distinct from returning a
    /// negative verdict).
    #[error("proof verification failed: {reason}")]
    VerificationFailed {
        /// Capability-reported failure reason.
        reason: String,
    },

    /// The prover returned an artifact that violates the length contract.
    #[error("proof artifact is {len} bytes, canonical length is {expected}")]
    NonCanonicalLength {
        /// Length of the offending artifact.
        len: usize,
        /// The canonical length.
        expected: usize,
    },

    /// Input maps could not be canonically serialized.
    #[error("proof inputs could not be serialized: {0}")]
    InputEncoding(#[from] serde_json::Error),
}

impl ProofError {
    /// Whether retrying the failed operation could conceivably succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::GenerationFailed { transient: true, .. })
    }
}

/// A generated eligibility proof artifact.
///
/// Construction enforces the canonical length, so holding a `Proof` is
/// holding a well-formed artifact.
#[derive(Clone, PartialEq, Eq)]
pub struct Proof(Vec<u8>);

impl Proof {
    /// Wrap a raw artifact, enforcing the canonical length.
    ///
    /// # Errors
    ///
    /// Returns [`ProofError::NonCanonicalLength`] for any other length.
    pub fn from_artifact(bytes: Vec<u8>) -> Result<Self, ProofError> {
        if bytes.len() != CANONICAL_PROOF_LEN {
            return Err(ProofError::NonCanonicalLength {
                len: bytes.len(),
                expected: CANONICAL_PROOF_LEN,
            });
        }
        Ok(Self(bytes))
    }

    /// The raw artifact bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Proof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proof({}…, {} bytes)", hex::encode(&self.0[..8]), self.0.len())
    }
}

/// External proof system capability.
///
/// Real cryptographic soundness is this capability's responsibility. The
/// workflow only relies on the artifact shape and on failures being reported
/// rather than swallowed.
#[async_trait]
pub trait Prover: Send + Sync {
    /// Produce a proof artifact for the given private and public inputs.
    async fn prove(&self, private: &InputMap, public: &InputMap) -> Result<Vec<u8>, ProofError>;

    /// Verify an artifact against the public inputs.
    async fn verify(&self, artifact: &[u8], public: &InputMap) -> Result<bool, ProofError>;
}

/// Formats proof inputs and delegates to the [`Prover`] capability.
#[derive(Debug, Clone)]
pub struct ProofGate<P> {
    prover: P,
}

impl<P: Prover> ProofGate<P> {
    /// Wrap a prover capability.
    pub const fn new(prover: P) -> Self {
        Self { prover }
    }

    /// Generate a proof for the given private and public inputs.
    ///
    /// Pure in the inputs plus the injected capability; identical inputs
    /// against a deterministic prover yield identical artifacts.
    ///
    /// # Errors
    ///
    /// Propagates capability failures and rejects artifacts that violate the
    /// length contract.
    pub async fn generate(&self, private: &InputMap, public: &InputMap) -> Result<Proof, ProofError> {
        let artifact = self.prover.prove(private, public).await?;
        Proof::from_artifact(artifact)
    }

    /// Verify a proof artifact against public inputs.
    ///
    /// Artifacts whose length deviates from [`CANONICAL_PROOF_LEN`] are
    /// rejected immediately; the verifier capability is never invoked for
    /// them.
    ///
    /// # Errors
    ///
    /// Propagates verifier capability failures. A negative verdict is
    /// `Ok(false)`, not an error.
    pub async fn verify(&self, artifact: &[u8], public: &InputMap) -> Result<bool, ProofError> {
        if artifact.len() != CANONICAL_PROOF_LEN {
            return Ok(false);
        }
        self.prover.verify(artifact, public).await
    }

    /// Access the underlying prover capability.
    pub const fn prover(&self) -> &P {
        &self.prover
    }
}

#[derive(Serialize)]
struct ProofPayload<'a> {
    private: &'a InputMap,
    public: &'a InputMap,
}

/// Deterministic in-memory prover for development and tests.
///
/// The artifact is the SHA-256 digest of the canonical JSON encoding of both
/// input maps, repeated until it fills the canonical artifact length.
/// Identical inputs always produce identical artifacts, and the artifact
/// discloses nothing about the private inputs beyond the digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestProver;

#[async_trait]
impl Prover for DigestProver {
    async fn prove(&self, private: &InputMap, public: &InputMap) -> Result<Vec<u8>, ProofError> {
        let payload = serde_json::to_vec(&ProofPayload { private, public })?;
        let digest = Sha256::digest(&payload);
        let mut artifact = Vec::with_capacity(CANONICAL_PROOF_LEN);
        while artifact.len() < CANONICAL_PROOF_LEN {
            artifact.extend_from_slice(&digest);
        }
        artifact.truncate(CANONICAL_PROOF_LEN);
        Ok(artifact)
    }

    async fn verify(&self, artifact: &[u8], _public: &InputMap) -> Result<bool, ProofError> {
        Ok(artifact.len() == CANONICAL_PROOF_LEN)
    }
}
