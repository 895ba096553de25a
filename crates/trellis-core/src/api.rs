//! Capability-scoped API exposed to sandboxed plugin code.
//!
//! The host builds one [`HostApi`] per sandbox from an [`ApiContext`]. The context is
//! also serialized as the `initialize` parameters so the sandbox sees exactly what the
//! host bound it to. Capability semantics belong to the [`ApiFactory`]; the default
//! [`ScopedApiFactory`] only answers introspection and logging calls.

use crate::capability::Capabilities;
use crate::manifest::{PluginManifest, SurfaceKind};
use crate::EnvironmentId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Maximum message size accepted from a sandbox `log` call.
pub const MAX_LOG_MESSAGE_SIZE: usize = 4 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiContext {
    pub plugin_id: String,
    pub plugin_name: String,
    pub plugin_version: String,
    pub environment_id: EnvironmentId,
    pub granted_capabilities: Capabilities,
    #[serde(default)]
    pub initial_state: Value,
    /// Which surface is calling: `background`, `summary` or `expand`.
    pub source: String,
}

impl ApiContext {
    pub fn new(
        manifest: &PluginManifest,
        environment_id: EnvironmentId,
        granted_capabilities: Capabilities,
        initial_state: Value,
        surface: SurfaceKind,
    ) -> Self {
        Self {
            plugin_id: manifest.id.clone(),
            plugin_name: manifest.name.clone(),
            plugin_version: manifest.version.clone(),
            environment_id,
            granted_capabilities,
            initial_state,
            source: surface.as_tag().to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Host-side handler for calls a sandbox makes back into the host.
pub trait HostApi {
    fn call(&mut self, method: &str, params: Value) -> Result<Value, String>;
}

pub trait ApiFactory {
    fn initial_state(&self, _manifest: &PluginManifest, _surface: SurfaceKind) -> Value {
        Value::Null
    }

    fn build(&self, context: &ApiContext) -> Box<dyn HostApi>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ScopedApiFactory;

impl ApiFactory for ScopedApiFactory {
    fn build(&self, context: &ApiContext) -> Box<dyn HostApi> {
        Box::new(ScopedApi {
            context: context.clone(),
        })
    }
}

pub struct ScopedApi {
    context: ApiContext,
}

impl ScopedApi {
    pub fn new(context: ApiContext) -> Self {
        Self { context }
    }
}

impl HostApi for ScopedApi {
    fn call(&mut self, method: &str, params: Value) -> Result<Value, String> {
        match method {
            "context.get" => Ok(self.context.to_value()),
            "permissions.get" => Ok(self.context.granted_capabilities.to_value()),
            "permissions.has" => {
                let key = params
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "missing required argument `key`".to_string())?;
                Ok(json!(self.context.granted_capabilities.get(key).is_some()))
            }
            "log" => {
                let level = params.get("level").and_then(Value::as_str).unwrap_or("info");
                let message = params.get("message").and_then(Value::as_str).unwrap_or("");
                emit_log_message(level, &self.context, safe_truncate(message, MAX_LOG_MESSAGE_SIZE));
                Ok(Value::Null)
            }
            other => Err(format!("unknown host method `{other}`")),
        }
    }
}

fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut boundary = max_bytes;
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    &s[..boundary]
}

fn emit_log_message(level: &str, context: &ApiContext, message: &str) {
    let plugin_id = context.plugin_id.as_str();
    let source = context.source.as_str();
    match level {
        "error" => tracing::error!(plugin_id = %plugin_id, source = %source, "{}", message),
        "warn" => tracing::warn!(plugin_id = %plugin_id, source = %source, "{}", message),
        "debug" => tracing::debug!(plugin_id = %plugin_id, source = %source, "{}", message),
        "trace" => tracing::trace!(plugin_id = %plugin_id, source = %source, "{}", message),
        _ => tracing::info!(plugin_id = %plugin_id, source = %source, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManifestDocument, ViewKind};

    fn context() -> ApiContext {
        let manifest: ManifestDocument = serde_json::from_value(json!({
            "id": "notes", "name": "Notes", "version": "1.0.0",
            "requested_capabilities": { "contacts": { "read": true } }
        }))
        .expect("parse manifest");
        let manifest = manifest.into_manifest(true).expect("valid manifest");
        ApiContext::new(
            &manifest,
            7,
            manifest.requested_capabilities.clone(),
            json!({ "theme": "dark" }),
            SurfaceKind::View(ViewKind::Summary),
        )
    }

    #[test]
    fn context_serializes_source_tag_and_state() {
        let value = context().to_value();
        assert_eq!(value["source"], "summary");
        assert_eq!(value["environment_id"], 7);
        assert_eq!(value["initial_state"]["theme"], "dark");
    }

    #[test]
    fn scoped_api_answers_permission_queries() {
        let mut api = ScopedApiFactory.build(&context());
        assert_eq!(
            api.call("permissions.has", json!({ "key": "contacts" })),
            Ok(json!(true))
        );
        assert_eq!(
            api.call("permissions.has", json!({ "key": "meetings" })),
            Ok(json!(false))
        );
        assert!(api.call("permissions.has", json!({})).is_err());
        assert_eq!(
            api.call("permissions.get", Value::Null),
            Ok(json!({ "contacts": { "read": true } }))
        );
    }

    #[test]
    fn scoped_api_rejects_unknown_methods() {
        let mut api = ScopedApiFactory.build(&context());
        let err = api
            .call("contacts.delete_all", Value::Null)
            .expect_err("unknown method");
        assert!(err.contains("unknown host method"));
        assert_eq!(
            api.call("log", json!({ "level": "warn", "message": "hi" })),
            Ok(Value::Null)
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "aé";
        assert_eq!(safe_truncate(s, 2), "a");
        assert_eq!(safe_truncate(s, 3), "aé");
    }
}
