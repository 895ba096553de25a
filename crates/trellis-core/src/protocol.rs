use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SANDBOX_PROTOCOL_VERSION: u32 = 1;

/// Messages exchanged with a sandbox over its stdio channel, one JSON object per line.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxWireMessage {
    Handshake {
        protocol_version: u32,
        #[serde(default)]
        supported_protocol_versions: Vec<u32>,
        plugin_id: String,
        plugin_version: String,
        surface: String,
        entry_point: String,
        #[serde(default)]
        policy: Option<SurfacePolicy>,
    },
    HandshakeAck {
        protocol_version: u32,
        accepted: bool,
        reason: Option<String>,
        #[serde(default)]
        exports: Vec<String>,
    },
    Call {
        request_id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    CallResult {
        request_id: String,
        #[serde(default)]
        result: Value,
        error: Option<String>,
    },
    HostCall {
        request_id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    HostCallResult {
        request_id: String,
        #[serde(default)]
        result: Value,
        error: Option<String>,
    },
    Ping {
        request_id: String,
    },
    Pong {
        request_id: String,
    },
    Terminate {
        reason: String,
    },
}

impl SandboxWireMessage {
    /// The `kind` tag this message carries on the wire.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::HandshakeAck { .. } => "handshake_ack",
            Self::Call { .. } => "call",
            Self::CallResult { .. } => "call_result",
            Self::HostCall { .. } => "host_call",
            Self::HostCallResult { .. } => "host_call_result",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Terminate { .. } => "terminate",
        }
    }
}

/// Privileges granted to a rendering surface. Anything not listed here is denied.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SurfacePolicy {
    pub allow_scripts: bool,
    pub allow_same_origin: bool,
    pub allow_forms: bool,
    pub allow_popups: bool,
}

impl SurfacePolicy {
    pub const fn view_default() -> Self {
        Self {
            allow_scripts: true,
            allow_same_origin: true,
            allow_forms: true,
            allow_popups: true,
        }
    }

    pub fn as_tokens(&self) -> Vec<&'static str> {
        let mut tokens = Vec::new();
        if self.allow_scripts {
            tokens.push("allow-scripts");
        }
        if self.allow_same_origin {
            tokens.push("allow-same-origin");
        }
        if self.allow_forms {
            tokens.push("allow-forms");
        }
        if self.allow_popups {
            tokens.push("allow-popups");
        }
        tokens
    }
}
