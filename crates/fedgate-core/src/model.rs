//! The shared diagnostic model's parameter state.
//!
//! The model is an ordered collection of named parameter blocks owned
//! exclusively by the coordinator. Aggregated gradients are applied to the
//! first block whose dimensionality matches; a gradient that matches no
//! block is an explicit error, never a silent no-op.
//!
//! [`Model::fingerprint`] is a pure function of the parameter state: a
//! blake3 hash over a canonical length-prefixed byte feed of every block's
//! name and little-endian parameter bytes. Identical parameters always yield
//! identical fingerprints, so a fingerprint addresses exactly one model
//! version.

use std::fmt;

use thiserror::Error;

/// Size of a model fingerprint in bytes.
pub const FINGERPRINT_SIZE: usize = 32;

/// Errors from model updates.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// No parameter block matches the aggregate gradient's dimensionality.
    #[error("no parameter block matches gradient dimension {dim}")]
    NoMatchingBlock {
        /// Dimensionality of the unmatched gradient.
        dim: usize,
    },
}

/// One named, ordered block of model parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBlock {
    /// Block name (e.g. `fc1.weight`). Informational; updates address blocks
    /// by dimensionality, not name.
    pub name: String,

    /// Flattened parameter values.
    pub values: Vec<f32>,
}

impl ParameterBlock {
    /// Create a named block.
    #[must_use]
    pub fn new(name: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Zero-initialized block of the given dimension.
    #[must_use]
    pub fn zeros(name: impl Into<String>, dim: usize) -> Self {
        Self::new(name, vec![0.0; dim])
    }

    /// Number of parameters in the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the block is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Content hash of one exact model parameter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelFingerprint([u8; FINGERPRINT_SIZE]);

impl ModelFingerprint {
    /// The raw hash bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }
}

impl fmt::Display for ModelFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// The shared trainable parameter state.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    blocks: Vec<ParameterBlock>,
}

impl Model {
    /// Build a model from ordered parameter blocks.
    #[must_use]
    pub fn new(blocks: Vec<ParameterBlock>) -> Self {
        Self { blocks }
    }

    /// Zero-initialized two-layer diagnosis network shape plus an input
    /// block of the configured gradient dimension. The input block comes
    /// first so it is the update target under the first-match rule.
    #[must_use]
    pub fn diagnosis_demo(gradient_dim: usize) -> Self {
        Self::new(vec![
            ParameterBlock::zeros("input", gradient_dim),
            ParameterBlock::zeros("fc1.weight", 6400),
            ParameterBlock::zeros("fc1.bias", 64),
            ParameterBlock::zeros("fc2.weight", 640),
            ParameterBlock::zeros("fc2.bias", 10),
        ])
    }

    /// The ordered parameter blocks.
    #[must_use]
    pub fn blocks(&self) -> &[ParameterBlock] {
        &self.blocks
    }

    /// Total parameter count across all blocks.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.blocks.iter().map(ParameterBlock::len).sum()
    }

    /// An independent copy for external readers.
    ///
    /// External access never gets a live reference to the coordinator-owned
    /// state, so a reader can never observe a half-applied update.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Subtract `learning_rate × gradient` from the first block whose
    /// dimensionality matches the gradient's.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::NoMatchingBlock`] when no block matches.
    pub fn apply_update(
        &mut self,
        gradient: &[f32],
        learning_rate: f32,
    ) -> Result<(), ModelError> {
        let block = self
            .blocks
            .iter_mut()
            .find(|block| block.len() == gradient.len())
            .ok_or(ModelError::NoMatchingBlock {
                dim: gradient.len(),
            })?;

        for (param, &grad) in block.values.iter_mut().zip(gradient.iter()) {
            *param -= learning_rate * grad;
        }
        Ok(())
    }

    /// Blake3 content hash of the current parameter state.
    ///
    /// The feed is canonical: for each block in order, the name's length and
    /// bytes, then the value count and each value's little-endian bits.
    /// Hashing raw bits (not a textual rendering) keeps the fingerprint
    /// bit-exact across platforms.
    #[must_use]
    pub fn fingerprint(&self) -> ModelFingerprint {
        let mut hasher = blake3::Hasher::new();
        for block in &self.blocks {
            hasher.update(&(block.name.len() as u64).to_le_bytes());
            hasher.update(block.name.as_bytes());
            hasher.update(&(block.values.len() as u64).to_le_bytes());
            for value in &block.values {
                hasher.update(&value.to_le_bytes());
            }
        }
        ModelFingerprint(*hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_model() -> Model {
        Model::new(vec![
            ParameterBlock::new("a", vec![1.0, 2.0, 3.0]),
            ParameterBlock::new("b", vec![4.0, 5.0]),
        ])
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let first = small_model().fingerprint();
        let second = small_model().fingerprint();
        assert_eq!(first, second);
        assert_eq!(first.to_string().len(), FINGERPRINT_SIZE * 2);
    }

    #[test]
    fn fingerprint_changes_with_any_parameter() {
        let base = small_model().fingerprint();

        let mut changed = small_model();
        changed.apply_update(&[0.0, 0.0, 1.0], 0.01).unwrap();
        assert_ne!(base, changed.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_block_names() {
        let renamed = Model::new(vec![
            ParameterBlock::new("x", vec![1.0, 2.0, 3.0]),
            ParameterBlock::new("b", vec![4.0, 5.0]),
        ]);
        assert_ne!(small_model().fingerprint(), renamed.fingerprint());
    }

    #[test]
    fn same_update_converges_to_same_fingerprint() {
        let gradient = [0.5, -0.5, 1.0];
        let mut first = small_model();
        let mut second = small_model();
        first.apply_update(&gradient, 0.01).unwrap();
        second.apply_update(&gradient, 0.01).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn update_targets_first_matching_block() {
        let mut model = small_model();
        model.apply_update(&[1.0, 1.0], 0.1).unwrap();

        // Block "a" (dim 3) is untouched; block "b" (dim 2) is updated.
        assert_eq!(model.blocks()[0].values, vec![1.0, 2.0, 3.0]);
        assert_eq!(model.blocks()[1].values, vec![4.0 - 0.1, 5.0 - 0.1]);
    }

    #[test]
    fn unmatched_dimension_is_an_explicit_error() {
        let mut model = small_model();
        let err = model.apply_update(&[1.0; 7], 0.1).unwrap_err();
        assert!(matches!(err, ModelError::NoMatchingBlock { dim: 7 }));
        // The failed update left nothing behind.
        assert_eq!(model, small_model());
    }

    #[test]
    fn snapshot_is_isolated_from_later_updates() {
        let mut model = small_model();
        let snapshot = model.snapshot();
        model.apply_update(&[1.0, 1.0], 0.1).unwrap();
        assert_eq!(snapshot, small_model());
        assert_ne!(snapshot.fingerprint(), model.fingerprint());
    }

    #[test]
    fn demo_model_update_target_matches_gradient_dim() {
        let model = Model::diagnosis_demo(100);
        assert_eq!(model.blocks()[0].len(), 100);
        assert_eq!(model.parameter_count(), 100 + 6400 + 64 + 640 + 10);

        let mut model = model;
        model.apply_update(&vec![1.0; 100], 0.01).unwrap();
        assert!(model.blocks()[0].values.iter().all(|&v| (v + 0.01).abs() < 1e-7));
    }
}
