use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;
use trellis_core::protocol::SandboxWireMessage;
use tracing_subscriber::EnvFilter;

struct SandboxOptions {
    delay_ms: u64,
    initialize_ok: bool,
    host_log: bool,
    protocol_override: Option<u32>,
    exports_override: Option<Vec<String>>,
}

impl SandboxOptions {
    fn from_env() -> Self {
        Self {
            delay_ms: std::env::var("TRELLIS_SANDBOX_DELAY_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0),
            initialize_ok: env_flag("TRELLIS_SANDBOX_INIT_OK", true),
            host_log: env_flag("TRELLIS_SANDBOX_HOST_LOG", true),
            protocol_override: std::env::var("TRELLIS_SANDBOX_PROTOCOL_VERSION")
                .ok()
                .and_then(|v| v.parse::<u32>().ok()),
            exports_override: std::env::var("TRELLIS_SANDBOX_EXPORTS").ok().map(|raw| {
                raw.split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect()
            }),
        }
    }

    fn exports_for(&self, surface: &str) -> Vec<String> {
        if let Some(exports) = &self.exports_override {
            return exports.clone();
        }
        let mut exports = vec!["initialize".to_string(), "terminate".to_string()];
        if surface != "background" {
            exports.push("render".to_string());
        }
        exports
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

/// What the host bound this sandbox to during the handshake.
struct Session {
    plugin_id: String,
    surface: String,
    entry_point: String,
    entry_bytes: u64,
    host_calls: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("TRELLIS_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let options = SandboxOptions::from_env();
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut session: Option<Session> = None;

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<SandboxWireMessage>(trimmed) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(error = %err, "undecodable host message");
                break;
            }
        };

        let replies = match message {
            SandboxWireMessage::Handshake {
                protocol_version,
                supported_protocol_versions,
                plugin_id,
                surface,
                entry_point,
                policy,
                ..
            } => {
                let selected_protocol_version = if supported_protocol_versions.is_empty()
                    || supported_protocol_versions.contains(&protocol_version)
                {
                    protocol_version
                } else {
                    supported_protocol_versions
                        .iter()
                        .copied()
                        .max()
                        .unwrap_or(protocol_version)
                };

                let entry_bytes = std::fs::metadata(Path::new(&entry_point))
                    .ok()
                    .filter(|meta| meta.is_file())
                    .map(|meta| meta.len());
                let Some(entry_bytes) = entry_bytes else {
                    tracing::warn!(plugin_id = %plugin_id, entry_point = %entry_point, "entry point not found");
                    let _ = write_message(
                        &mut stdout,
                        &SandboxWireMessage::HandshakeAck {
                            protocol_version: selected_protocol_version,
                            accepted: false,
                            reason: Some(format!("entry point not found: {entry_point}")),
                            exports: Vec::new(),
                        },
                    );
                    break;
                };

                tracing::debug!(plugin_id = %plugin_id, surface = %surface, policy = ?policy, "handshake accepted");
                let exports = options.exports_for(&surface);
                session = Some(Session {
                    plugin_id,
                    surface,
                    entry_point,
                    entry_bytes,
                    host_calls: 0,
                });
                vec![SandboxWireMessage::HandshakeAck {
                    protocol_version: options
                        .protocol_override
                        .unwrap_or(selected_protocol_version),
                    accepted: true,
                    reason: None,
                    exports,
                }]
            }
            SandboxWireMessage::Call {
                request_id,
                method,
                params,
            } => {
                let Some(session) = session.as_mut() else {
                    break;
                };
                handle_call(&options, session, request_id, &method, params)
            }
            SandboxWireMessage::Ping { request_id } => {
                if session.is_none() {
                    break;
                }
                vec![SandboxWireMessage::Pong { request_id }]
            }
            SandboxWireMessage::HostCallResult {
                request_id, error, ..
            } => {
                if let Some(error) = error {
                    tracing::warn!(request_id = %request_id, error = %error, "host call failed");
                }
                Vec::new()
            }
            SandboxWireMessage::Terminate { reason } => {
                tracing::debug!(reason = %reason, "terminate requested by host");
                break;
            }
            SandboxWireMessage::HandshakeAck { .. }
            | SandboxWireMessage::CallResult { .. }
            | SandboxWireMessage::HostCall { .. }
            | SandboxWireMessage::Pong { .. } => Vec::new(),
        };

        if replies
            .iter()
            .any(|reply| write_message(&mut stdout, reply).is_err())
        {
            break;
        }
    }
}

fn handle_call(
    options: &SandboxOptions,
    session: &mut Session,
    request_id: String,
    method: &str,
    params: Value,
) -> Vec<SandboxWireMessage> {
    let exported = options.exports_for(&session.surface);
    if !exported.iter().any(|m| m == method) {
        return vec![call_error(request_id, format!("no export `{method}`"))];
    }

    match method {
        "initialize" => {
            if options.delay_ms > 0 {
                thread::sleep(Duration::from_millis(options.delay_ms));
            }

            let mut replies = Vec::new();
            if options.host_log {
                session.host_calls += 1;
                replies.push(SandboxWireMessage::HostCall {
                    request_id: format!("host:{}:{}", session.plugin_id, session.host_calls),
                    method: "log".to_string(),
                    params: json!({
                        "level": "info",
                        "message": format!(
                            "{} initialized in environment {}",
                            session.surface,
                            params.get("environment_id").cloned().unwrap_or(Value::Null)
                        ),
                    }),
                });
            }

            replies.push(if options.initialize_ok {
                SandboxWireMessage::CallResult {
                    request_id,
                    result: json!({
                        "ok": true,
                        "source": params.get("source").cloned().unwrap_or(Value::Null),
                        "entry_bytes": session.entry_bytes,
                    }),
                    error: None,
                }
            } else {
                call_error(request_id, "sandbox initialize failed".to_string())
            });
            replies
        }
        "render" => vec![SandboxWireMessage::CallResult {
            request_id,
            result: json!({
                "surface": session.surface,
                "entry_point": session.entry_point,
            }),
            error: None,
        }],
        _ => vec![SandboxWireMessage::CallResult {
            request_id,
            result: json!({ "ok": true }),
            error: None,
        }],
    }
}

fn call_error(request_id: String, error: String) -> SandboxWireMessage {
    SandboxWireMessage::CallResult {
        request_id,
        result: Value::Null,
        error: Some(error),
    }
}

fn write_message(stdout: &mut impl Write, message: &SandboxWireMessage) -> io::Result<()> {
    let payload = serde_json::to_string(message).map_err(io::Error::other)?;
    stdout.write_all(payload.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()
}
