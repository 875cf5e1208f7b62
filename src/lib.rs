//! Corridor - off-chain orchestrator for the AidChain humanitarian-aid protocol
//!
//! Corridor drives each aid request through a fixed multi-stage pipeline:
//! GNSS location authentication, disaster-event attestation, LLM-panel
//! consensus, on-ledger escrow binding, fulfiller dispatch, delivery proof
//! verification and final settlement. Every stage transition is anchored
//! on-ledger where the protocol requires it and streamed to subscribers in
//! real time.
//!
//! ## Services
//!
//! - **Surface**: HTTP request-submission API + `/ws` subscription channel
//! - **Pipeline**: per-request state machine (stages 1-8)
//! - **Ledger**: typed adapter to the escrow/registry contracts + event poller
//! - **Gnss**: authenticated-position verification client
//! - **Attestation**: multi-provider disaster event cross-referencing
//! - **Consensus**: heterogeneous LLM panel with supermajority aggregation
//! - **Fulfiller**: dispatch + delivery proof verification

pub mod attestation;
pub mod auth;
pub mod bus;
pub mod config;
pub mod consensus;
pub mod digest;
pub mod fulfiller;
pub mod geo;
pub mod gnss;
pub mod ledger;
pub mod pipeline;
pub mod routes;
pub mod server;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{CorridorError, Result};
