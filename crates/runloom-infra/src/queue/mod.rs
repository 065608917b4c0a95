//! Queue implementations for the runloom-core `StepQueue` port.
//!
//! - `memory`: in-process queue with job-id de-duplication, dependency
//!   gating, and retry bookkeeping

pub mod memory;
