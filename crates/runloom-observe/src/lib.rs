//! Observability: tracing subscriber setup.
//!
//! Span vocabulary: the engine emits `run.start` and `run.execute_step`
//! spans carrying `run.operation.name`, `run.workflow.id`,
//! `run.workflow.version_id`, `run.id`, `run.step.run_id`, `run.step.key`,
//! and `run.step.attempt` fields.

pub mod tracing_setup;
