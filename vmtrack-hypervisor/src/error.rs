//! Error types for the hypervisor probe.

use thiserror::Error;

/// Errors that can occur while probing a hypervisor for VM state.
///
/// `Transport`, `Timeout` and `Decode` are transient — the agent state
/// engine retries on these. `Auth` is treated as fatal: the agent logs
/// and backs off rather than retrying a bad credential forever.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("connection to hypervisor API failed: {0}")]
    Transport(String),

    #[error("hypervisor API request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("hypervisor API rejected credentials (401/403)")]
    Auth,

    #[error("failed to decode hypervisor API reply: {0}")]
    Decode(String),
}

/// Result type alias for probe operations.
pub type Result<T> = std::result::Result<T, ProbeError>;
