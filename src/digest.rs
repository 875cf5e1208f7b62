//! Canonical serialisation and content-addressed digests
//!
//! Every attestation anchored on-ledger is hashed over its **canonical**
//! JSON form: keys sorted, optional `None` fields omitted, numbers as
//! decimal integers at their canonical scale. Rehashing a reconstructed
//! bundle must yield the same 32-byte digest.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::{CorridorError, Result};

/// Hex digest of all-zero bytes, used as the "absent" sentinel on-ledger
pub const ZERO_DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Serialise a value to its canonical JSON string.
///
/// Round-tripping through `serde_json::Value` sorts object keys (the map is
/// BTree-backed); `skip_serializing_if` attributes on the bundle types keep
/// absent optionals out of the output.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let v = serde_json::to_value(value).map_err(CorridorError::Serialization)?;
    Ok(v.to_string())
}

/// SHA-256 over raw bytes, hex-encoded
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonical 32-byte digest of a serialisable bundle, hex-encoded
pub fn digest_canonical<T: Serialize>(value: &T) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

pub fn is_zero_digest(hash: &str) -> bool {
    hash == ZERO_DIGEST || hash.chars().all(|c| c == '0')
}
