//! Step executors that need infrastructure.
//!
//! - `http`: outbound HTTP calls with byte-bounded body reads

pub mod http;
