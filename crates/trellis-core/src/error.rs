//! Error taxonomy for the plugin host.
//!
//! Everything here is contained by [`crate::manager::PluginManager`]: callers of the
//! lifecycle API only ever see `bool`/`Option` results plus events on the bus.

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxErrorCode {
    InvalidConfig,
    SpawnFailed,
    Staging,
    TransportIo,
    HandshakeRejected,
    ProtocolMismatch,
    ProtocolViolation,
    Timeout,
}

impl SandboxErrorCode {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid_config",
            Self::SpawnFailed => "spawn_failed",
            Self::Staging => "staging",
            Self::TransportIo => "transport_io",
            Self::HandshakeRejected => "handshake_rejected",
            Self::ProtocolMismatch => "protocol_mismatch",
            Self::ProtocolViolation => "protocol_violation",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{}: {detail}", .code.as_tag())]
pub struct SandboxError {
    pub code: SandboxErrorCode,
    pub detail: String,
}

impl SandboxError {
    pub fn new(code: SandboxErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// Failures of a single RPC exchange with a sandbox.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("`{method}` timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("`{method}` failed in sandbox: {message}")]
    Remote { method: String, message: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("sandbox channel is closed")]
    Closed,
}

/// Reasons a manifest is not usable. Always recovered inside the loaders.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("manifest for {plugin_id} is missing required field `{field}`")]
    MissingField {
        plugin_id: String,
        field: &'static str,
    },

    #[error("manifest for {plugin_id} declares `{section}` without an entry point")]
    EmptyEntryPoint {
        plugin_id: String,
        section: &'static str,
    },

    #[error("manifest for {plugin_id} has an invalid entry point `{path}`: {message}")]
    InvalidEntryPoint {
        plugin_id: String,
        path: String,
        message: String,
    },

    #[error("bundle for {plugin_id} is missing files: {}", .missing.join(", "))]
    MissingFiles {
        plugin_id: String,
        missing: Vec<String>,
    },

    #[error("manifest id `{declared}` does not match requested id `{requested}`")]
    AuthenticityMismatch { requested: String, declared: String },

    #[error("catalog error: {0}")]
    Source(String),
}

/// Failures of background or view execution, surfaced as `PluginWorkerError` events.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("plugin {0} is not registered")]
    NotRegistered(String),

    #[error("plugin {0} is not approved")]
    NotApproved(String),

    #[error("plugin {plugin_id} declares no {surface} entry point")]
    NoEntryPoint {
        plugin_id: String,
        surface: &'static str,
    },

    #[error("sandbox for {plugin_id} failed: {source}")]
    Sandbox {
        plugin_id: String,
        #[source]
        source: SandboxError,
    },

    #[error("sandbox for {plugin_id} does not implement the expected contract (missing: {})", .missing.join(", "))]
    ContractValidation {
        plugin_id: String,
        missing: Vec<String>,
    },

    #[error("rpc with {plugin_id} failed: {source}")]
    Rpc {
        plugin_id: String,
        #[source]
        source: RpcError,
    },

    #[error("registry refused handle for {0}")]
    Rejected(String),
}
