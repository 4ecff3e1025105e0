//! Integrity: per-segment SHA-256 digest, checked by consumers on receive.

use sha2::{Digest, Sha256};

/// Hash a segment payload. Returns 32-byte digest.
pub fn digest(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Verify segment payload against expected digest.
pub fn verify(payload: &[u8], expected: &[u8; 32]) -> bool {
    digest(payload) == *expected
}
