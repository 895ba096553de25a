//! In-memory collaborators for unit tests: a config source, a scripted sandbox and a
//! launcher that hands out scripted sandboxes.

use crate::error::{LoadError, SandboxError};
use crate::manifest::{ManifestDocument, PluginManifest, SurfaceKind};
use crate::protocol::{SandboxWireMessage, SANDBOX_PROTOCOL_VERSION};
use crate::sandbox::{SandboxLauncher, SandboxSpec};
use crate::source::{ConfigSource, FileValidation, PluginOrigin};
use crate::transport::SandboxTransport;
use crate::EnvironmentId;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

struct MemoryEntry {
    document: ManifestDocument,
    files: HashSet<String>,
}

#[derive(Default)]
pub(crate) struct MemorySource {
    entries: Mutex<BTreeMap<(&'static str, String), MemoryEntry>>,
    asset_base: Mutex<Option<String>>,
}

impl MemorySource {
    /// Resolves assets to `{base}/{id}/{path}` instead of `memory://` URLs.
    pub(crate) fn serve_assets_from(&self, base: &str) {
        *self.asset_base.lock().expect("memory source lock") = Some(base.to_string());
    }

    pub(crate) fn insert_internal(&self, manifest: Value, files: &[&str]) {
        let id = declared_id(&manifest);
        self.insert(PluginOrigin::Internal, &id, manifest, files);
    }

    pub(crate) fn insert_external(&self, manifest: Value, files: &[&str]) {
        let id = declared_id(&manifest);
        self.insert(PluginOrigin::External, &id, manifest, files);
    }

    /// Stores `manifest` under a lookup id that may differ from the id it declares.
    pub(crate) fn insert_internal_as(&self, lookup_id: &str, manifest: Value, files: &[&str]) {
        self.insert(PluginOrigin::Internal, lookup_id, manifest, files);
    }

    fn insert(&self, origin: PluginOrigin, id: &str, manifest: Value, files: &[&str]) {
        let document: ManifestDocument =
            serde_json::from_value(manifest).expect("test manifest parses");
        let entry = MemoryEntry {
            document,
            files: files.iter().map(|f| f.to_string()).collect(),
        };
        self.entries
            .lock()
            .expect("memory source lock")
            .insert((origin.as_tag(), id.to_string()), entry);
    }
}

fn declared_id(manifest: &Value) -> String {
    manifest
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl ConfigSource for MemorySource {
    fn manifest_list(&self, origin: PluginOrigin) -> Result<Vec<ManifestDocument>, LoadError> {
        let entries = self.entries.lock().expect("memory source lock");
        Ok(entries
            .iter()
            .filter(|((tag, _), _)| *tag == origin.as_tag())
            .map(|(_, entry)| entry.document.clone())
            .collect())
    }

    fn manifest(
        &self,
        id: &str,
        origin: PluginOrigin,
    ) -> Result<Option<ManifestDocument>, LoadError> {
        let entries = self.entries.lock().expect("memory source lock");
        Ok(entries
            .get(&(origin.as_tag(), id.to_string()))
            .map(|entry| entry.document.clone()))
    }

    fn validate_files(
        &self,
        id: &str,
        manifest: &PluginManifest,
        origin: PluginOrigin,
    ) -> Result<FileValidation, LoadError> {
        let entries = self.entries.lock().expect("memory source lock");
        let Some(entry) = entries.get(&(origin.as_tag(), id.to_string())) else {
            return Err(LoadError::NotFound(id.to_string()));
        };
        let missing = manifest
            .entry_points()
            .into_iter()
            .filter(|path| !entry.files.contains(*path))
            .map(str::to_string)
            .collect();
        Ok(FileValidation::from_missing(missing))
    }

    fn resolve_asset_url(
        &self,
        id: &str,
        relative_path: &str,
        origin: PluginOrigin,
    ) -> Result<String, LoadError> {
        if let Some(base) = self.asset_base.lock().expect("memory source lock").as_deref() {
            return Ok(format!("{base}/{id}/{relative_path}"));
        }
        Ok(format!("memory://{}/{}/{}", origin.as_tag(), id, relative_path))
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SandboxScript {
    pub exports: Vec<String>,
    pub accept: bool,
    pub protocol_version: u32,
    pub initialize_ok: bool,
    pub host_call_on_initialize: bool,
    /// Never answers anything.
    pub silent: bool,
    /// Answers the handshake and ping but never the `initialize` call.
    pub hang_on_initialize: bool,
}

impl Default for SandboxScript {
    fn default() -> Self {
        Self {
            exports: vec![
                "initialize".to_string(),
                "terminate".to_string(),
                "render".to_string(),
            ],
            accept: true,
            protocol_version: SANDBOX_PROTOCOL_VERSION,
            initialize_ok: true,
            host_call_on_initialize: false,
            silent: false,
            hang_on_initialize: false,
        }
    }
}

impl SandboxScript {
    pub(crate) fn with_exports(exports: &[&str]) -> Self {
        Self {
            exports: exports.iter().map(|m| m.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct SandboxLog {
    pub sent: Vec<SandboxWireMessage>,
    pub terminated: bool,
}

impl SandboxLog {
    pub(crate) fn called(&self, method: &str) -> bool {
        self.sent
            .iter()
            .any(|m| matches!(m, SandboxWireMessage::Call { method: called, .. } if called == method))
    }

    /// Reasons carried by every `terminate` notice the host sent.
    pub(crate) fn terminate_reasons(&self) -> Vec<&str> {
        self.sent
            .iter()
            .filter_map(|m| match m {
                SandboxWireMessage::Terminate { reason } => Some(reason.as_str()),
                _ => None,
            })
            .collect()
    }
}

struct ScriptedState {
    script: SandboxScript,
    log: SandboxLog,
    inbox: VecDeque<SandboxWireMessage>,
    crashed: bool,
}

/// Transport double that answers the wire protocol according to a [`SandboxScript`].
/// Clones share state so tests can inspect traffic after handing the transport away.
#[derive(Clone)]
pub(crate) struct ScriptedSandbox {
    state: Rc<RefCell<ScriptedState>>,
}

impl ScriptedSandbox {
    pub(crate) fn new(script: SandboxScript) -> Self {
        Self {
            state: Rc::new(RefCell::new(ScriptedState {
                script,
                log: SandboxLog::default(),
                inbox: VecDeque::new(),
                crashed: false,
            })),
        }
    }

    pub(crate) fn log(&self) -> SandboxLog {
        self.state.borrow().log.clone()
    }

    /// Simulates the sandbox process dying on its own.
    pub(crate) fn crash(&self) {
        self.state.borrow_mut().crashed = true;
    }

    pub(crate) fn queue_host_call(&self, request_id: &str, method: &str, params: Value) {
        self.state
            .borrow_mut()
            .inbox
            .push_back(SandboxWireMessage::HostCall {
                request_id: request_id.to_string(),
                method: method.to_string(),
                params,
            });
    }
}

impl SandboxTransport for ScriptedSandbox {
    fn send(&mut self, message: &SandboxWireMessage) -> Result<(), String> {
        let mut state = self.state.borrow_mut();
        if state.crashed || state.log.terminated {
            return Err("sandbox pipe closed".to_string());
        }
        state.log.sent.push(message.clone());
        if state.script.silent {
            return Ok(());
        }

        let script = state.script.clone();
        match message {
            SandboxWireMessage::Handshake { .. } => {
                state.inbox.push_back(SandboxWireMessage::HandshakeAck {
                    protocol_version: script.protocol_version,
                    accepted: script.accept,
                    reason: (!script.accept).then(|| "scripted rejection".to_string()),
                    exports: script.exports,
                });
            }
            SandboxWireMessage::Ping { request_id } => {
                state.inbox.push_back(SandboxWireMessage::Pong {
                    request_id: request_id.clone(),
                });
            }
            SandboxWireMessage::Call {
                request_id, method, ..
            } => {
                let reply = |result: Value, error: Option<String>| SandboxWireMessage::CallResult {
                    request_id: request_id.clone(),
                    result,
                    error,
                };
                match method.as_str() {
                    "initialize" if script.hang_on_initialize => {}
                    "initialize" => {
                        if script.host_call_on_initialize {
                            state.inbox.push_back(SandboxWireMessage::HostCall {
                                request_id: format!("host:{request_id}"),
                                method: "log".to_string(),
                                params: json!({ "level": "info", "message": "initializing" }),
                            });
                        }
                        let result = if script.initialize_ok {
                            reply(json!({ "ok": true }), None)
                        } else {
                            reply(Value::Null, Some("initialize failed".to_string()))
                        };
                        state.inbox.push_back(result);
                    }
                    other if script.exports.iter().any(|m| m == other) => {
                        state.inbox.push_back(reply(json!({ "ok": true }), None));
                    }
                    other => {
                        state
                            .inbox
                            .push_back(reply(Value::Null, Some(format!("no export `{other}`"))));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<Option<SandboxWireMessage>, String> {
        let mut state = self.state.borrow_mut();
        if let Some(message) = state.inbox.pop_front() {
            return Ok(Some(message));
        }
        if state.crashed {
            return Err("sandbox stdout channel disconnected".to_string());
        }
        Ok(None)
    }

    fn is_running(&mut self) -> bool {
        let state = self.state.borrow();
        !state.crashed && !state.log.terminated
    }

    fn process_id(&self) -> Option<u32> {
        None
    }

    fn terminate(&mut self) {
        self.state.borrow_mut().log.terminated = true;
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LaunchRecord {
    pub plugin_id: String,
    pub surface: SurfaceKind,
    pub view_id: Option<String>,
    pub environment_id: EnvironmentId,
    pub entry_path: String,
    pub sandbox: ScriptedSandboxRef,
}

/// Debug-printable handle on a launched [`ScriptedSandbox`].
#[derive(Clone)]
pub(crate) struct ScriptedSandboxRef(pub ScriptedSandbox);

impl std::fmt::Debug for ScriptedSandboxRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScriptedSandbox")
    }
}

#[derive(Default)]
struct LauncherState {
    default_script: SandboxScript,
    scripts: HashMap<String, SandboxScript>,
    failure: Option<SandboxError>,
    launches: Vec<LaunchRecord>,
}

/// Launcher double. Scripts can be set per plugin id; clones share state.
#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    state: Rc<RefCell<LauncherState>>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script_for(&self, plugin_id: &str, script: SandboxScript) {
        self.state
            .borrow_mut()
            .scripts
            .insert(plugin_id.to_string(), script);
    }

    pub(crate) fn fail_with(&self, error: SandboxError) {
        self.state.borrow_mut().failure = Some(error);
    }

    pub(crate) fn launches(&self) -> Vec<LaunchRecord> {
        self.state.borrow().launches.clone()
    }

    pub(crate) fn launch_count(&self) -> usize {
        self.state.borrow().launches.len()
    }

    pub(crate) fn last_sandbox(&self) -> Option<ScriptedSandbox> {
        self.state
            .borrow()
            .launches
            .last()
            .map(|record| record.sandbox.0.clone())
    }
}

impl SandboxLauncher for FakeLauncher {
    fn launch(&self, spec: &SandboxSpec<'_>) -> Result<Box<dyn SandboxTransport>, SandboxError> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.failure.clone() {
            return Err(error);
        }
        let script = state
            .scripts
            .get(spec.plugin_id)
            .cloned()
            .unwrap_or_else(|| state.default_script.clone());
        let sandbox = ScriptedSandbox::new(script);
        state.launches.push(LaunchRecord {
            plugin_id: spec.plugin_id.to_string(),
            surface: spec.surface,
            view_id: spec.view_id.map(str::to_string),
            environment_id: spec.environment_id,
            entry_path: spec.entry_path.to_string(),
            sandbox: ScriptedSandboxRef(sandbox.clone()),
        });
        Ok(Box::new(sandbox))
    }
}

/// Serves `body` as a `200 OK` to each of the next `connections` requests on a loopback
/// port. Returns the base URL.
pub(crate) fn serve_http(body: Vec<u8>, connections: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");
    thread::spawn(move || {
        for stream in listener.incoming().take(connections) {
            let Ok(mut stream) = stream else {
                continue;
            };
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
            let mut line = String::new();
            while reader.read_line(&mut line).map(|n| n > 0).unwrap_or(false) {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
            let _ = stream.flush();
        }
    });
    format!("http://{addr}")
}

/// Accepts one connection and never answers it.
pub(crate) fn silent_http(hold: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");
    thread::spawn(move || {
        let accepted = listener.accept();
        thread::sleep(hold);
        drop(accepted);
    });
    format!("http://{addr}")
}
