//! Error kinds surfaced by the reconciliation engine and backends.
//!
//! Transport-level metadata failures never show up here, the client retries
//! those forever. Everything else is scoped to a single reconciliation tick:
//! the engine logs the error, leaves the applied state untouched where the
//! taxonomy requires it, and waits for the next descriptor event.
use thiserror::Error;

/// Result alias used throughout the engine and backends
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure kinds for a reconciliation tick
#[derive(Debug, Error)]
pub enum Error {
    /// The descriptor is internally inconsistent, e.g. a VLAN referencing a
    /// parent index past the end of the ethernet list. Fatal for the tick,
    /// nothing is written.
    #[error("malformed network descriptor: {0}")]
    MalformedDescriptor(String),
    /// No registered backend claimed the primary interface
    #[error("no network backend is managing {0:?}")]
    NoBackendDetected(String),
    /// A backend probe failed hard (e.g. unparseable version output).
    /// Distinct from a probe that simply answers "not managing".
    #[error("backend probe failed: {0}")]
    BackendProbe(#[source] anyhow::Error),
    /// A backend setup operation failed
    #[error("backend {backend} failed during {op}")]
    BackendOp {
        /// backend name
        backend: &'static str,
        /// operation that failed
        op: &'static str,
        /// underlying cause
        #[source]
        source: anyhow::Error,
    },
    /// Rollback is always best-effort; callers log this at warn and move on
    #[error("rollback failed: {0}")]
    Rollback(#[source] anyhow::Error),
    /// Failure reading local NIC state
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// build a [`Error::BackendOp`]
    pub fn op(backend: &'static str, op: &'static str, source: anyhow::Error) -> Self {
        Error::BackendOp {
            backend,
            op,
            source,
        }
    }
}
