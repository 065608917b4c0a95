//! Orchestration engine and port trait definitions for Runloom.
//!
//! This crate holds the engine's business logic -- dependency graphs,
//! template resolution, step execution, run orchestration -- and the "ports"
//! (store, queue, cipher traits) the infrastructure layer implements. It
//! depends only on `runloom-types` and IO-free crates; never on
//! `runloom-infra`, a database client, or an HTTP client.

pub mod queue;
pub mod repository;
pub mod service;
pub mod workflow;
