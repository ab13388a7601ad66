//! # metadata
//!
//! Client for the instance metadata HTTP service, the descriptor model the
//! engine consumes, and the long-poll watcher that turns metadata changes
//! into a stream of descriptor events.
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

use thiserror::Error;

mod client;
mod descriptor;
mod watcher;

pub use client::{Client, BASE_URL};
pub use descriptor::{EthernetSpec, NetworkDescriptor, VlanSpec};
pub use watcher::{spawn, Events};

/// Failures the watcher surfaces to its consumer. Transport errors never
/// appear here; the client absorbs those with endless capped backoff.
#[derive(Debug, Error)]
pub enum Error {
    /// the response body could not be understood as a descriptor
    #[error("metadata descriptor unavailable: {0}")]
    Unavailable(String),
    /// the owning context was cancelled while a request was in flight
    #[error("metadata request cancelled")]
    Cancelled,
}
