//! Fuzz harness for the encrypted contribution envelope.
//!
//! Feeds arbitrary byte sequences to `EncryptionContext::decrypt`, ensuring
//! the envelope decoder never panics on truncated nonces, corrupted
//! authentication tags, oversized payloads, or malformed plaintext encodings.

#![no_main]
use std::sync::OnceLock;

use fedgate_core::aggregate::{EncryptedContribution, EncryptionContext};
use libfuzzer_sys::fuzz_target;

static CONTEXT: OnceLock<EncryptionContext> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    let context = CONTEXT.get_or_init(EncryptionContext::generate);

    // Arbitrary bytes must decode to an error, never a panic.
    let raw = EncryptedContribution::from_raw("fuzz", 0, data.to_vec());
    let _ = context.decrypt(&raw);

    // A genuine envelope with one byte flipped must fail authentication,
    // not panic. Derive the plaintext vector from the fuzz input so the
    // envelope length varies.
    let values: Vec<f32> = data
        .chunks_exact(4)
        .take(256)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if values.is_empty() {
        return;
    }
    if let Ok(envelope) = context.encrypt("fuzz", 0, &values) {
        let mut tampered = envelope.ciphertext().to_vec();
        let idx = data.len() % tampered.len();
        tampered[idx] ^= 0x01;
        let _ = context.decrypt(&EncryptedContribution::from_raw("fuzz", 0, tampered));
    }
});
