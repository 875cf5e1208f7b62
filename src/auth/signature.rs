//! Login signature verification
//!
//! A login proves control of an address by signing the supplied message
//! with the address's ed25519 key. Addresses are hex-encoded 32-byte
//! verifying keys; signatures arrive hex- or base64-encoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Verify a login signature over `message` for `address`
pub fn verify_login_signature(address: &str, message: &str, signature: &str) -> bool {
    let Some(key) = decode_verifying_key(address) else {
        return false;
    };
    let Some(sig) = decode_signature(signature) else {
        return false;
    };
    key.verify(message.as_bytes(), &sig).is_ok()
}

fn decode_verifying_key(address: &str) -> Option<VerifyingKey> {
    let bytes = hex::decode(address).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn decode_signature(signature: &str) -> Option<Signature> {
    let bytes = hex::decode(signature)
        .ok()
        .or_else(|| BASE64.decode(signature).ok())?;
    let bytes: [u8; 64] = bytes.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}
