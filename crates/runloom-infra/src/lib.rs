//! Infrastructure layer for Runloom.
//!
//! Contains implementations of the port traits defined in `runloom-core`:
//! in-memory store and queue backends, the outbound HTTP step executor,
//! AES-256-GCM secret encryption, and worker config loading.

pub mod config;
pub mod crypto;
pub mod executor;
pub mod queue;
pub mod store;
