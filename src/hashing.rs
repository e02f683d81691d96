//! Content hashing and storage path derivation.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of the raw image bytes. This is the dedup key for
/// the whole catalog, so it must be computed over the fetched bytes exactly
/// as received.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Sharded object key for a derivative: `derivatives/<aa>/<sha>/<variant>.webp`
/// where `aa` is the first two hex chars of the hash.
pub fn derivative_path(sha256: &str, variant: &str) -> String {
    format!("derivatives/{}/{}/{}.webp", &sha256[..2], sha256, variant)
}
