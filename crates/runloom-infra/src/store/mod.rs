//! Store implementations for the runloom-core ports.
//!
//! - `memory`: mutex-guarded in-memory store with staged transactions

pub mod memory;
