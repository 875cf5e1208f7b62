//! Authentication for the Corridor surface
//!
//! Provides:
//! - Signed bearer session tokens for the submission and delivery routes
//! - Login signature verification (address = hex-encoded verifying key)
//!
//! The token's `verified` flag is a hint only; the ledger registry is the
//! authority and is consulted for every write-gating action.

pub mod jwt;
pub mod signature;

pub use jwt::{extract_token_from_header, Claims, TokenService};
pub use signature::verify_login_signature;
