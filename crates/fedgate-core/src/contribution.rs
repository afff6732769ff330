//! Agent contribution references.

use serde::{Deserialize, Serialize};

/// One agent's data reference for a training round.
///
/// A contribution carries only references and commitments. The encrypted
/// record stays opaque (the workflow never decrypts an agent's raw history),
/// and the storage pointer is never dereferenced here; both exist so proofs
/// and ledger submissions can bind to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContribution {
    /// Stable identifier for the contributing agent.
    pub agent_id: String,

    /// The agent's encrypted record. Opaque to this crate.
    pub encrypted_data: Vec<u8>,

    /// Content-addressed pointer to the agent's records (e.g. an IPFS CID).
    pub storage_ref: String,

    /// Integrity hash of the agent's medical history. Immutable once issued.
    pub history_hash: String,
}

impl AgentContribution {
    /// Create a contribution reference.
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        encrypted_data: Vec<u8>,
        storage_ref: impl Into<String>,
        history_hash: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            encrypted_data,
            storage_ref: storage_ref.into(),
            history_hash: history_hash.into(),
        }
    }
}
