//! Ledger submission capability.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::proof::{CANONICAL_PROOF_LEN, InputMap, Proof};

/// Errors from ledger submission.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// The ledger could not be reached or timed out. Retryable.
    #[error("ledger submission failed transiently: {reason}")]
    Transient {
        /// Capability-reported failure reason.
        reason: String,
    },

    /// The ledger definitively rejected the submission. Not retryable.
    #[error("ledger rejected submission: {reason}")]
    Rejected {
        /// Why the submission was rejected.
        reason: String,
    },
}

impl LedgerError {
    /// Whether retrying the same submission could conceivably succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// External distributed-ledger capability for recording eligibility proofs.
///
/// `Ok(true)` records the proof as verified, `Ok(false)` is a definitive
/// negative verdict, and [`LedgerError`] distinguishes transient outages
/// (retryable) from definitive rejections (not).
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a proof with its public inputs and a content reference.
    async fn submit(
        &self,
        proof: &Proof,
        public: &InputMap,
        storage_ref: &str,
    ) -> Result<bool, LedgerError>;
}

/// One accepted or rejected submission in the in-memory registry.
#[derive(Debug, Clone)]
pub struct VerificationRecord {
    /// Blake3 digest of the proof artifact.
    pub proof_hash: [u8; 32],
    /// Content reference the submission pinned.
    pub storage_ref: String,
    /// Submission time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Whether the ledger accepted the proof.
    pub accepted: bool,
}

/// Scripted outcome for one [`InMemoryLedger`] submission call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Accept the submission.
    Accept,
    /// Return a definitive negative verdict (`Ok(false)`).
    Reject,
    /// Fail with [`LedgerError::Transient`].
    Transient,
}

/// In-memory ledger for development and tests.
///
/// Keeps the registry the production ledger maintains: a record per
/// submission plus monotonic verification and pin counters. Outcomes can be
/// scripted two ways for tests: a per-call queue (exact retry schedules for
/// a single agent) and a rejected-reference set (deterministic per-agent
/// verdicts under concurrent submission).
#[derive(Debug)]
pub struct InMemoryLedger {
    records: Mutex<Vec<VerificationRecord>>,
    outcomes: Mutex<VecDeque<ScriptedOutcome>>,
    rejected_refs: HashSet<String>,
    total_verifications: AtomicU64,
    pin_count: AtomicU64,
    submission_count: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// Ledger that accepts every well-formed submission.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            outcomes: Mutex::new(VecDeque::new()),
            rejected_refs: HashSet::new(),
            total_verifications: AtomicU64::new(0),
            pin_count: AtomicU64::new(0),
            submission_count: AtomicU64::new(0),
            clock: Arc::new(SystemClock),
        }
    }

    /// Script the next submission calls, in order. Once the queue drains,
    /// submissions are accepted again.
    #[must_use]
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        let ledger = Self::new();
        ledger.outcomes.lock().expect("outcome queue poisoned").extend(outcomes);
        ledger
    }

    /// Definitively reject any submission carrying one of these content
    /// references. Order-independent, so it stays deterministic when agents
    /// submit concurrently.
    #[must_use]
    pub fn with_rejected_refs(refs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut ledger = Self::new();
        ledger.rejected_refs = refs.into_iter().map(Into::into).collect();
        ledger
    }

    /// Replace the timestamp source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Total accepted verifications.
    #[must_use]
    pub fn total_verifications(&self) -> u64 {
        self.total_verifications.load(Ordering::SeqCst)
    }

    /// Content references pinned by accepted submissions.
    #[must_use]
    pub fn pin_count(&self) -> u64 {
        self.pin_count.load(Ordering::SeqCst)
    }

    /// Submission calls observed, scripted failures included.
    #[must_use]
    pub fn submission_count(&self) -> u64 {
        self.submission_count.load(Ordering::SeqCst)
    }

    /// Snapshot of the registry.
    #[must_use]
    pub fn records(&self) -> Vec<VerificationRecord> {
        self.records.lock().expect("registry poisoned").clone()
    }

    fn record(&self, proof: &Proof, storage_ref: &str, accepted: bool) {
        let record = VerificationRecord {
            proof_hash: *blake3::hash(proof.as_bytes()).as_bytes(),
            storage_ref: storage_ref.to_string(),
            timestamp_ms: self.clock.now_ms(),
            accepted,
        };
        self.records.lock().expect("registry poisoned").push(record);
        if accepted {
            self.total_verifications.fetch_add(1, Ordering::SeqCst);
            if !storage_ref.is_empty() {
                self.pin_count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn submit(
        &self,
        proof: &Proof,
        _public: &InputMap,
        storage_ref: &str,
    ) -> Result<bool, LedgerError> {
        self.submission_count.fetch_add(1, Ordering::SeqCst);

        // Mirrors the production ledger's on-chain artifact length gate.
        if proof.as_bytes().len() != CANONICAL_PROOF_LEN {
            return Err(LedgerError::Rejected {
                reason: format!(
                    "proof artifact is {} bytes, expected {CANONICAL_PROOF_LEN}",
                    proof.as_bytes().len()
                ),
            });
        }

        let scripted = self.outcomes.lock().expect("outcome queue poisoned").pop_front();
        match scripted {
            Some(ScriptedOutcome::Transient) => {
                return Err(LedgerError::Transient {
                    reason: "scripted outage".to_string(),
                });
            },
            Some(ScriptedOutcome::Reject) => {
                self.record(proof, storage_ref, false);
                return Ok(false);
            },
            Some(ScriptedOutcome::Accept) | None => {},
        }

        if self.rejected_refs.contains(storage_ref) {
            self.record(proof, storage_ref, false);
            return Ok(false);
        }

        self.record(proof, storage_ref, true);
        Ok(true)
    }
}
