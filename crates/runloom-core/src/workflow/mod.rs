//! Workflow engine core: dependency graphs, templates, and step execution.
//!
//! This module contains the "brain" of the engine:
//! - `dag` -- dependency inference, cycle detection, execution batches
//! - `template` -- `{{...}}` reference resolution against run context
//! - `validator` -- per-version definition checks (issues, not panics)
//! - `executor` -- step executor trait, registry, and the pure executors
//! - `persist` -- byte-bounded JSON wrapping for stored payloads
//! - `redact` -- secret scrubbing for logged/persisted failure detail
//! - `rate_limit` -- fixed-window limiter honoring step `rateLimit`
//! - `cache` -- bounded TTL caches for versions, runs, and secrets
//! - `orchestrator` -- run creation and batch-ordered enqueueing
//! - `processor` -- the worker-side step state machine

pub mod cache;
pub mod dag;
pub mod executor;
pub mod orchestrator;
pub mod persist;
pub mod processor;
pub mod rate_limit;
pub mod redact;
pub mod template;
pub mod validator;
