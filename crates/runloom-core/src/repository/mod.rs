//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (runloom-infra) implements. The core crate never depends on any specific
//! storage technology.

pub mod secret;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
