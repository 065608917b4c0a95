//! Shared domain types for Runloom.
//!
//! This crate contains the core domain types used across the Runloom engine:
//! workflow definitions, run/step-run records, queue job payloads, persistence
//! envelopes, worker configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror,
//! secrecy.

pub mod config;
pub mod envelope;
pub mod error;
pub mod job;
pub mod run;
pub mod secret;
pub mod workflow;
