//! Cryptographic operations for Runloom.
//!
//! - `cipher`: AES-256-GCM encryption for secret values at rest

pub mod cipher;
