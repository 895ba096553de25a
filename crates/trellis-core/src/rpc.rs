use crate::api::HostApi;
use crate::error::RpcError;
use crate::events::StopReason;
use crate::manifest::SurfaceKind;
use crate::protocol::SandboxWireMessage;
use crate::transport::SandboxTransport;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Host-side stand-in for a sandbox's exported interface.
///
/// Every outbound call carries a correlation id; while waiting for the matching result
/// the proxy services any `host_call` the sandbox issues against its scoped API.
pub struct RpcProxy {
    plugin_id: String,
    surface: SurfaceKind,
    transport: Box<dyn SandboxTransport>,
    api: Box<dyn HostApi>,
    exports: Vec<String>,
    request_sequence: u64,
    watchdog_tick: Duration,
    closed: bool,
}

impl RpcProxy {
    pub fn new(
        plugin_id: impl Into<String>,
        surface: SurfaceKind,
        transport: Box<dyn SandboxTransport>,
        api: Box<dyn HostApi>,
        watchdog_tick: Duration,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            surface,
            transport,
            api,
            exports: Vec::new(),
            request_sequence: 0,
            watchdog_tick: watchdog_tick.max(Duration::from_millis(1)),
            closed: false,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn surface(&self) -> SurfaceKind {
        self.surface
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn exports_method(&self, method: &str) -> bool {
        self.exports.iter().any(|m| m == method)
    }

    pub(crate) fn set_exports(&mut self, exports: Vec<String>) {
        self.exports = exports;
    }

    pub fn process_id(&self) -> Option<u32> {
        self.transport.process_id()
    }

    pub fn is_alive(&mut self) -> bool {
        !self.closed && self.transport.is_running()
    }

    fn next_request_id(&mut self, prefix: &str) -> String {
        self.request_sequence = self.request_sequence.saturating_add(1);
        format!("{prefix}:{}:{}", self.plugin_id, self.request_sequence)
    }

    fn send(&mut self, message: &SandboxWireMessage) -> Result<(), RpcError> {
        if self.closed {
            return Err(RpcError::Closed);
        }
        self.transport.send(message).map_err(|err| {
            self.closed = true;
            RpcError::Transport(err)
        })
    }

    /// Receives until `accept` takes a message or `deadline` passes (`Ok(None)`).
    fn wait_for<T>(
        &mut self,
        deadline: Instant,
        mut accept: impl FnMut(SandboxWireMessage) -> Option<T>,
    ) -> Result<Option<T>, RpcError> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait_for = deadline.saturating_duration_since(now).min(self.watchdog_tick);
            match self.transport.receive(wait_for) {
                Ok(Some(SandboxWireMessage::HostCall {
                    request_id,
                    method,
                    params,
                })) => self.service_host_call(request_id, &method, params)?,
                Ok(Some(message)) => {
                    if let Some(out) = accept(message) {
                        return Ok(Some(out));
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    self.closed = true;
                    return Err(RpcError::Transport(err));
                }
            }
        }
    }

    fn service_host_call(
        &mut self,
        request_id: String,
        method: &str,
        params: Value,
    ) -> Result<(), RpcError> {
        tracing::debug!(plugin_id = %self.plugin_id, source = self.surface.as_tag(), method, "host call from sandbox");
        let reply = match self.api.call(method, params) {
            Ok(result) => SandboxWireMessage::HostCallResult {
                request_id,
                result,
                error: None,
            },
            Err(error) => {
                tracing::debug!(plugin_id = %self.plugin_id, method, error = %error, "host call rejected");
                SandboxWireMessage::HostCallResult {
                    request_id,
                    result: Value::Null,
                    error: Some(error),
                }
            }
        };
        self.send(&reply)
    }

    /// Sends the handshake and waits for the acknowledgement.
    pub(crate) fn handshake(
        &mut self,
        handshake: SandboxWireMessage,
        timeout: Duration,
    ) -> Result<SandboxWireMessage, RpcError> {
        let deadline = Instant::now() + timeout;
        self.send(&handshake)?;
        let ack = self.wait_for(deadline, |message| match message {
            ack @ SandboxWireMessage::HandshakeAck { .. } => Some(Ok(ack)),
            other => Some(Err(RpcError::Protocol(format!(
                "unexpected sandbox message before handshake ack: {other:?}"
            )))),
        })?;
        match ack {
            Some(result) => result,
            None => Err(RpcError::Timeout {
                method: "handshake".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn call(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let request_id = self.next_request_id("call");
        let deadline = Instant::now() + timeout;
        self.send(&SandboxWireMessage::Call {
            request_id: request_id.clone(),
            method: method.to_string(),
            params,
        })?;

        let outcome = self.wait_for(deadline, |message| match message {
            SandboxWireMessage::CallResult {
                request_id: rid,
                result,
                error,
            } if rid == request_id => Some(match error {
                Some(message) => Err(RpcError::Remote {
                    method: method.to_string(),
                    message,
                }),
                None => Ok(result),
            }),
            _ => None,
        })?;

        outcome.unwrap_or_else(|| {
            Err(RpcError::Timeout {
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        })
    }

    pub fn ping(&mut self, timeout: Duration) -> Result<(), RpcError> {
        let request_id = self.next_request_id("ping");
        let deadline = Instant::now() + timeout;
        self.send(&SandboxWireMessage::Ping {
            request_id: request_id.clone(),
        })?;
        let pong = self.wait_for(deadline, |message| match message {
            SandboxWireMessage::Pong { request_id: rid } if rid == request_id => Some(()),
            _ => None,
        })?;
        pong.ok_or_else(|| RpcError::Timeout {
            method: "ping".to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    /// Services host calls already queued by the sandbox, for at most `budget`.
    pub fn pump(&mut self, budget: Duration) -> Result<usize, RpcError> {
        if self.closed {
            return Err(RpcError::Closed);
        }
        let deadline = Instant::now() + budget;
        let mut serviced = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(serviced);
            }
            match self.transport.receive(remaining.min(self.watchdog_tick)) {
                Ok(Some(SandboxWireMessage::HostCall {
                    request_id,
                    method,
                    params,
                })) => {
                    self.service_host_call(request_id, &method, params)?;
                    serviced += 1;
                }
                Ok(Some(other)) => {
                    tracing::trace!(plugin_id = %self.plugin_id, message = ?other, "dropping unsolicited sandbox message");
                }
                Ok(None) => return Ok(serviced),
                Err(err) => {
                    self.closed = true;
                    return Err(RpcError::Transport(err));
                }
            }
        }
    }

    /// Asks the sandbox to run its exported `terminate`.
    pub fn terminate(&mut self, timeout: Duration) -> Result<(), RpcError> {
        self.call("terminate", Value::Null, timeout).map(|_| ())
    }

    /// Cooperative notice followed by a hard kill of the isolated context.
    pub fn kill(&mut self, reason: StopReason) {
        if !self.closed {
            let _ = self.transport.send(&SandboxWireMessage::Terminate {
                reason: reason.as_tag().to_string(),
            });
        }
        self.transport.terminate();
        self.closed = true;
    }
}

impl std::fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxy")
            .field("plugin_id", &self.plugin_id)
            .field("surface", &self.surface.as_tag())
            .field("exports", &self.exports)
            .field("closed", &self.closed)
            .finish()
    }
}
