//! Library-specific error types.
//!
//! Every fallible operation in this crate returns [`Error`], whose variants
//! are the taxonomy a host application needs in order to react differently
//! to configuration mistakes, guest-originated failures, and resource or
//! transport problems. `Error` deliberately carries enough context (e.g. both
//! hashes on a mismatch) to build a useful diagnostic without the caller
//! having to re-derive it.

use thiserror::Error as ThisError;

/// A result type for errors that occur within this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    /// The manifest or plug-in options were malformed (e.g. a hash was
    /// supplied alongside a pre-compiled module reference).
    #[error("configuration error: {0}")]
    Config(String),

    /// `call` was issued against a function or module name that does not
    /// exist in the instantiated plug-in.
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// A manifest item named a module that was never resolved.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// The guest set an error block via `error_set` before returning.
    #[error("{0}")]
    PluginOriginated(String),

    /// The guest function trapped (e.g. out-of-bounds memory access, unreachable).
    #[error("plugin trap: {0}")]
    PluginTrap(String),

    /// A second `call` was attempted while one was already in flight on the
    /// same handle.
    #[error("plugin is not reentrant")]
    Reentrancy,

    /// A configured resource budget (pages, variable bytes, HTTP response
    /// bytes) was exceeded.
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    /// `http_request` targeted a host not present in `allowed_hosts`.
    #[error("host rejected: {0}")]
    HostRejected(String),

    /// A per-call timeout expired.
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The worker shared-buffer transport failed (timeout waiting on the
    /// flag, malformed framing, or a dead worker thread).
    #[error("transport error: {0}")]
    Transport(String),

    /// An underlying I/O failure (HTTP fetch, filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A `wasmtime` failure that doesn't map to a more specific kind above
    /// (compilation failure, linker failure, memory export missing, ...).
    #[error("wasm error: {0}")]
    Wasm(#[from] anyhow::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn resource_limit(msg: impl Into<String>) -> Self {
        Error::ResourceLimitExceeded(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// `true` for errors that spec.md classifies as fatal to the current
    /// call but not to the plug-in as a whole (the plug-in handle remains
    /// usable for a subsequent `call`).
    pub fn fatal_to_call_only(&self) -> bool {
        matches!(
            self,
            Error::PluginOriginated(_)
                | Error::PluginTrap(_)
                | Error::ResourceLimitExceeded(_)
                | Error::HostRejected(_)
                | Error::Timeout(_)
                | Error::Transport(_)
        )
    }
}
