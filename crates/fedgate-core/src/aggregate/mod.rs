//! Encrypted gradient contributions and secure aggregation.
//!
//! [`EncryptionContext`] owns the single AES-256-GCM key a coordinator uses
//! for its whole lifetime. Contributions travel as a `nonce ‖ ciphertext`
//! envelope around a bincode-encoded `Vec<f32>`, with a fresh random nonce
//! per encryption.
//!
//! [`SecureAggregator::secure_aggregate`] combines contributions into an
//! encrypted arithmetic mean while holding at most one decrypted gradient in
//! memory at a time. An attacker inspecting the aggregator's memory at any
//! instant sees a single agent's cleartext at most, never the full set.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use thiserror::Error;
use tracing::debug;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Upper bound on a contribution envelope, nonce included.
///
/// Matches the ledger-side limit on recorded gradient blobs; anything larger
/// is refused on both the encrypt and decrypt paths.
pub const MAX_CIPHERTEXT_BYTES: usize = 4096;

/// Errors from encryption, decryption, or aggregation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AggregationError {
    /// `secure_aggregate` was handed an empty contribution list.
    #[error("cannot aggregate zero contributions")]
    EmptyAggregation,

    /// A contribution's dimensionality differs from the rest of the batch.
    #[error(
        "contribution from agent {agent_id} has dimension {actual}, batch dimension is {expected}"
    )]
    DimensionMismatch {
        /// Agent whose contribution does not fit the batch.
        agent_id: String,
        /// Dimensionality established by the first contribution.
        expected: usize,
        /// Dimensionality of the offending contribution.
        actual: usize,
    },

    /// The envelope exceeds [`MAX_CIPHERTEXT_BYTES`].
    #[error("contribution from agent {agent_id} is {len} bytes, limit is {max}")]
    ContributionTooLarge {
        /// Agent whose envelope is oversized.
        agent_id: String,
        /// Envelope length in bytes.
        len: usize,
        /// The configured limit.
        max: usize,
    },

    /// The envelope is too short to even carry a nonce.
    #[error("envelope from agent {agent_id} is {len} bytes, shorter than a nonce")]
    EnvelopeTooShort {
        /// Agent whose envelope is truncated.
        agent_id: String,
        /// Envelope length in bytes.
        len: usize,
    },

    /// The AEAD backend refused to encrypt.
    #[error("contribution from agent {agent_id} could not be encrypted")]
    EncryptionFailed {
        /// Agent whose gradient could not be sealed.
        agent_id: String,
    },

    /// Authenticated decryption failed (wrong key or tampered ciphertext).
    #[error("contribution from agent {agent_id} failed authenticated decryption")]
    DecryptionFailed {
        /// Agent whose envelope did not authenticate.
        agent_id: String,
    },

    /// The decrypted plaintext is not a valid gradient encoding.
    #[error("contribution from agent {agent_id} carries a malformed gradient encoding")]
    PlaintextEncoding {
        /// Agent whose plaintext did not decode.
        agent_id: String,
        /// Underlying codec failure.
        #[source]
        source: bincode::Error,
    },
}

/// A noised, encrypted gradient contribution for one round.
///
/// Opaque to everything except the [`EncryptionContext`] holding the matching
/// key. Consumed once by aggregation, then discarded.
#[derive(Debug, Clone)]
pub struct EncryptedContribution {
    agent_id: String,
    round: u64,
    ciphertext: Vec<u8>,
}

impl EncryptedContribution {
    /// Wrap raw envelope bytes without any validation.
    ///
    /// Decryption performs all envelope checks; this exists so transport
    /// code (and fuzzing) can hand arbitrary bytes to [`EncryptionContext::decrypt`].
    #[must_use]
    pub fn from_raw(agent_id: impl Into<String>, round: u64, ciphertext: Vec<u8>) -> Self {
        Self {
            agent_id: agent_id.into(),
            round,
            ciphertext,
        }
    }

    /// The contributing agent.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The round this contribution was produced for.
    #[must_use]
    pub const fn round(&self) -> u64 {
        self.round
    }

    /// The raw envelope bytes (`nonce ‖ ciphertext`).
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }
}

/// Symmetric encryption context for one coordinator lifetime.
///
/// Exactly one key per coordinator instance: the same key encrypts
/// contributions and later decrypts them for aggregation. The key never
/// leaves this struct and is never persisted. Immutable after construction,
/// so concurrent `encrypt` calls from per-agent tasks are safe.
pub struct EncryptionContext {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionContext(AES-256-GCM)")
    }
}

impl EncryptionContext {
    /// Generate a context with a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let key: Key<Aes256Gcm> = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Encrypt a gradient vector into an envelope for the given round.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::ContributionTooLarge`] when the resulting
    /// envelope would exceed [`MAX_CIPHERTEXT_BYTES`].
    pub fn encrypt(
        &self,
        agent_id: &str,
        round: u64,
        values: &[f32],
    ) -> Result<EncryptedContribution, AggregationError> {
        let plaintext =
            bincode::serialize(values).map_err(|source| AggregationError::PlaintextEncoding {
                agent_id: agent_id.to_string(),
                source,
            })?;

        let nonce = Aes256Gcm::generate_nonce(OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| AggregationError::EncryptionFailed {
                agent_id: agent_id.to_string(),
            })?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(nonce.as_slice());
        envelope.extend_from_slice(&ciphertext);

        if envelope.len() > MAX_CIPHERTEXT_BYTES {
            return Err(AggregationError::ContributionTooLarge {
                agent_id: agent_id.to_string(),
                len: envelope.len(),
                max: MAX_CIPHERTEXT_BYTES,
            });
        }

        Ok(EncryptedContribution {
            agent_id: agent_id.to_string(),
            round,
            ciphertext: envelope,
        })
    }

    /// Open an envelope back into its gradient vector.
    ///
    /// # Errors
    ///
    /// Fails on oversized or truncated envelopes, authentication failure,
    /// and malformed plaintext encodings; each maps to its own
    /// [`AggregationError`] variant.
    pub fn decrypt(
        &self,
        contribution: &EncryptedContribution,
    ) -> Result<Vec<f32>, AggregationError> {
        let envelope = &contribution.ciphertext;
        if envelope.len() > MAX_CIPHERTEXT_BYTES {
            return Err(AggregationError::ContributionTooLarge {
                agent_id: contribution.agent_id.clone(),
                len: envelope.len(),
                max: MAX_CIPHERTEXT_BYTES,
            });
        }
        if envelope.len() < NONCE_LEN {
            return Err(AggregationError::EnvelopeTooShort {
                agent_id: contribution.agent_id.clone(),
                len: envelope.len(),
            });
        }

        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AggregationError::DecryptionFailed {
                agent_id: contribution.agent_id.clone(),
            })?;

        bincode::deserialize(&plaintext).map_err(|source| AggregationError::PlaintextEncoding {
            agent_id: contribution.agent_id.clone(),
            source,
        })
    }
}

/// Combines encrypted contributions into an encrypted arithmetic mean.
#[derive(Debug)]
pub struct SecureAggregator {
    context: EncryptionContext,
}

impl SecureAggregator {
    /// Wrap an encryption context.
    #[must_use]
    pub const fn new(context: EncryptionContext) -> Self {
        Self { context }
    }

    /// The context whose key this aggregator decrypts and re-encrypts with.
    #[must_use]
    pub const fn context(&self) -> &EncryptionContext {
        &self.context
    }

    /// Aggregate contributions into the encrypted mean for `round`.
    ///
    /// Contributions are decrypted strictly one at a time into a running sum
    /// held in an internal accumulator; each plaintext is dropped before the
    /// next is opened, so no two agents' cleartext gradients ever coexist in
    /// memory. The accumulator is an `f64` buffer local to this call and is
    /// never exposed to callers.
    ///
    /// # Errors
    ///
    /// Fails on an empty batch ([`AggregationError::EmptyAggregation`]), on
    /// any dimensionality mismatch (naming the offending agent), and on any
    /// decryption failure.
    pub fn secure_aggregate(
        &self,
        contributions: &[EncryptedContribution],
        round: u64,
    ) -> Result<EncryptedContribution, AggregationError> {
        if contributions.is_empty() {
            return Err(AggregationError::EmptyAggregation);
        }

        // The batch dimension is fixed by the first contribution, zero or
        // not; the accumulator's length cannot stand in for it.
        let mut expected_dim: Option<usize> = None;
        let mut sum: Vec<f64> = Vec::new();
        for contribution in contributions {
            let values = self.context.decrypt(contribution)?;
            match expected_dim {
                None => {
                    expected_dim = Some(values.len());
                    sum = values.iter().map(|&v| f64::from(v)).collect();
                },
                Some(expected) => {
                    if values.len() != expected {
                        return Err(AggregationError::DimensionMismatch {
                            agent_id: contribution.agent_id.clone(),
                            expected,
                            actual: values.len(),
                        });
                    }
                    for (acc, &v) in sum.iter_mut().zip(values.iter()) {
                        *acc += f64::from(v);
                    }
                },
            }
            // `values` drops here; the next plaintext is only opened after.
        }

        #[allow(clippy::cast_precision_loss)] // participant counts stay small
        let count = contributions.len() as f64;
        #[allow(clippy::cast_possible_truncation)] // gradients are f32
        let mean: Vec<f32> = sum.iter().map(|&v| (v / count) as f32).collect();

        debug!(
            round,
            contributions = contributions.len(),
            dim = mean.len(),
            "aggregated contributions into encrypted mean"
        );

        self.context.encrypt("aggregate", round, &mean)
    }
}
