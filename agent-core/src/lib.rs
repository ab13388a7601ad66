//! # agent-core
//!
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use async_trait::async_trait;
pub use metadata;
pub use pnet;
pub use tokio;
pub use tokio_util;
pub use tracing;

pub use crate::engine::Engine;

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod metrics;
pub mod os;
pub mod prelude;
pub mod resolve;
pub mod sched;

/// Register a backend with the engine
pub trait Register {
    /// add the backend to the engine's ordered detection list in the
    /// implementation of this method
    fn register(self, engine: &mut Engine);
}
