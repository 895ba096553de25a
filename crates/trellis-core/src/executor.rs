//! Background and view executors.
//!
//! Both share one setup path: resolve the entry point, stage it if remote, launch an
//! isolated sandbox, bind a capability-scoped API to it, handshake, validate the exported
//! contract, call `initialize`, and finally hand the live proxy to the registry. Any
//! failure before registration kills the sandbox and releases the staged file.

use crate::api::{ApiContext, ApiFactory};
use crate::capability::Capabilities;
use crate::error::{ExecutionError, RpcError, SandboxError, SandboxErrorCode};
use crate::events::StopReason;
use crate::manifest::{PluginManifest, SurfaceKind, ViewKind};
use crate::protocol::{SandboxWireMessage, SurfacePolicy};
use crate::registry::{PluginRegistry, ProcessRef, SurfaceRef};
use crate::rpc::RpcProxy;
use crate::sandbox::{stage_entry_point, CleanupToken, SandboxConfig, SandboxLauncher, SandboxSpec};
use crate::source::{ConfigSource, PluginOrigin};
use crate::EnvironmentId;
use std::sync::Arc;

/// Methods a sandbox must export before the host trusts its proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExportedContract {
    pub required: &'static [&'static str],
}

impl ExportedContract {
    pub const BACKGROUND: Self = Self {
        required: &["initialize", "terminate"],
    };
    pub const VIEW: Self = Self {
        required: &["initialize", "terminate", "render"],
    };

    pub const fn for_surface(surface: SurfaceKind) -> Self {
        match surface {
            SurfaceKind::Background => Self::BACKGROUND,
            SurfaceKind::View(_) => Self::VIEW,
        }
    }

    pub fn missing(&self, exports: &[String]) -> Vec<String> {
        self.required
            .iter()
            .filter(|method| !exports.iter().any(|e| e == *method))
            .map(|method| method.to_string())
            .collect()
    }
}

/// Collaborators shared by both executors.
pub struct ExecutionHost {
    source: Arc<dyn ConfigSource>,
    launcher: Box<dyn SandboxLauncher>,
    api_factory: Box<dyn ApiFactory>,
    config: SandboxConfig,
}

struct LaunchedSandbox {
    proxy: RpcProxy,
    process: ProcessRef,
    cleanup: CleanupToken,
    entry_url: String,
}

impl ExecutionHost {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        launcher: Box<dyn SandboxLauncher>,
        api_factory: Box<dyn ApiFactory>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            source,
            launcher,
            api_factory,
            config,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn background(&self) -> BackgroundExecutor<'_> {
        BackgroundExecutor { host: self }
    }

    pub fn views(&self) -> ViewExecutor<'_> {
        ViewExecutor { host: self }
    }

    fn launch(
        &self,
        manifest: &PluginManifest,
        granted: &Capabilities,
        surface: SurfaceKind,
        view_id: Option<&str>,
        environment_id: EnvironmentId,
        policy: Option<SurfacePolicy>,
    ) -> Result<LaunchedSandbox, ExecutionError> {
        let plugin_id = manifest.id.as_str();
        let sandbox_err = |source: SandboxError| ExecutionError::Sandbox {
            plugin_id: plugin_id.to_string(),
            source,
        };

        let entry = manifest
            .entry_for(surface)
            .ok_or_else(|| ExecutionError::NoEntryPoint {
                plugin_id: plugin_id.to_string(),
                surface: surface.as_tag(),
            })?;

        let origin = PluginOrigin::from_internal(manifest.is_internal);
        let entry_url = self
            .source
            .resolve_entry_point_url(plugin_id, entry, origin)
            .map_err(|err| {
                sandbox_err(SandboxError::new(
                    SandboxErrorCode::Staging,
                    format!("resolve entry point `{entry}`: {err}"),
                ))
            })?;

        let (entry_path, cleanup) =
            stage_entry_point(&entry_url, &self.config, plugin_id, surface)
                .map_err(sandbox_err)?;

        let transport = self
            .launcher
            .launch(&SandboxSpec {
                plugin_id,
                plugin_version: &manifest.version,
                surface,
                view_id,
                entry_path: &entry_path,
                environment_id,
                policy,
            })
            .map_err(sandbox_err)?;
        let process = ProcessRef::new(transport.process_id());

        let context = ApiContext::new(
            manifest,
            environment_id,
            granted.clone(),
            self.api_factory.initial_state(manifest, surface),
            surface,
        );
        let api = self.api_factory.build(&context);
        let mut proxy = RpcProxy::new(
            plugin_id,
            surface,
            transport,
            api,
            self.config.watchdog_tick(),
        );

        let handshake = SandboxWireMessage::Handshake {
            protocol_version: self.config.protocol_version,
            supported_protocol_versions: self.config.normalized_supported_protocol_versions(),
            plugin_id: plugin_id.to_string(),
            plugin_version: manifest.version.clone(),
            surface: surface.as_tag().to_string(),
            entry_point: entry_path,
            policy,
        };

        if let Err(err) = self.establish(&mut proxy, handshake, &context) {
            tracing::warn!(plugin_id = %plugin_id, surface = surface.as_tag(), error = %err, "sandbox setup failed");
            proxy.kill(StopReason::Error);
            return Err(err);
        }

        Ok(LaunchedSandbox {
            proxy,
            process,
            cleanup,
            entry_url,
        })
    }

    /// Handshake, contract validation, liveness ping and `initialize`.
    fn establish(
        &self,
        proxy: &mut RpcProxy,
        handshake: SandboxWireMessage,
        context: &ApiContext,
    ) -> Result<(), ExecutionError> {
        let plugin_id = context.plugin_id.as_str();
        let sandbox_err = |code: SandboxErrorCode, detail: String| ExecutionError::Sandbox {
            plugin_id: plugin_id.to_string(),
            source: SandboxError::new(code, detail),
        };
        let rpc_err = |source: RpcError| ExecutionError::Rpc {
            plugin_id: plugin_id.to_string(),
            source,
        };

        let ack = proxy
            .handshake(handshake, self.config.setup_timeout())
            .map_err(|err| match err {
                RpcError::Timeout { .. } => sandbox_err(
                    SandboxErrorCode::Timeout,
                    format!("handshake timed out after {}ms", self.config.setup_timeout_ms),
                ),
                RpcError::Protocol(detail) => {
                    sandbox_err(SandboxErrorCode::ProtocolViolation, detail)
                }
                RpcError::Transport(detail) => sandbox_err(SandboxErrorCode::TransportIo, detail),
                other => rpc_err(other),
            })?;

        let SandboxWireMessage::HandshakeAck {
            protocol_version,
            accepted,
            reason,
            exports,
        } = ack
        else {
            return Err(sandbox_err(
                SandboxErrorCode::ProtocolViolation,
                "handshake answered with a non-ack message".to_string(),
            ));
        };

        if !accepted {
            return Err(sandbox_err(
                SandboxErrorCode::HandshakeRejected,
                reason.unwrap_or_else(|| "sandbox rejected handshake".to_string()),
            ));
        }
        if self.config.negotiate_protocol(protocol_version).is_none() {
            return Err(sandbox_err(
                SandboxErrorCode::ProtocolMismatch,
                format!(
                    "sandbox protocol version {protocol_version} not in supported set {:?}",
                    self.config.normalized_supported_protocol_versions()
                ),
            ));
        }

        let missing = ExportedContract::for_surface(proxy.surface()).missing(&exports);
        if !missing.is_empty() {
            return Err(ExecutionError::ContractValidation {
                plugin_id: plugin_id.to_string(),
                missing,
            });
        }
        proxy.set_exports(exports);
        proxy.ping(self.config.ping_timeout()).map_err(rpc_err)?;

        proxy
            .call("initialize", context.to_value(), self.config.setup_timeout())
            .map_err(rpc_err)?;
        tracing::debug!(plugin_id = %plugin_id, source = %context.source, "sandbox initialized");
        Ok(())
    }

    /// Best-effort cooperative shutdown; errors are only logged.
    fn request_terminate(&self, proxy: &mut RpcProxy) {
        if let Err(err) = proxy.terminate(self.config.call_timeout()) {
            tracing::debug!(plugin_id = %proxy.plugin_id(), surface = proxy.surface().as_tag(), error = %err, "terminate call failed");
        }
    }
}

fn approved_manifest(
    registry: &PluginRegistry,
    id: &str,
) -> Result<(PluginManifest, Capabilities), ExecutionError> {
    let manifest = registry
        .config(id)
        .cloned()
        .ok_or_else(|| ExecutionError::NotRegistered(id.to_string()))?;
    let granted = registry
        .permissions(id)
        .cloned()
        .ok_or_else(|| ExecutionError::NotApproved(id.to_string()))?;
    Ok((manifest, granted))
}

pub struct BackgroundExecutor<'a> {
    host: &'a ExecutionHost,
}

impl BackgroundExecutor<'_> {
    pub fn execute(
        &self,
        registry: &mut PluginRegistry,
        id: &str,
        environment_id: EnvironmentId,
    ) -> Result<(), ExecutionError> {
        let (manifest, granted) = approved_manifest(registry, id)?;
        let launched = self.host.launch(
            &manifest,
            &granted,
            SurfaceKind::Background,
            None,
            environment_id,
            None,
        )?;

        if registry.register_worker(
            id,
            launched.process,
            launched.proxy,
            launched.cleanup,
            environment_id,
        ) {
            Ok(())
        } else {
            Err(ExecutionError::Rejected(id.to_string()))
        }
    }

    pub fn terminate(&self, registry: &mut PluginRegistry, id: &str, reason: StopReason) -> bool {
        if let Some(proxy) = registry.worker_proxy_mut(id) {
            self.host.request_terminate(proxy);
        }
        registry.unregister_worker(id, reason)
    }
}

pub struct ViewExecutor<'a> {
    host: &'a ExecutionHost,
}

impl ViewExecutor<'_> {
    pub fn show(
        &self,
        registry: &mut PluginRegistry,
        id: &str,
        view_id: &str,
        kind: ViewKind,
        environment_id: EnvironmentId,
    ) -> Result<(), ExecutionError> {
        let (manifest, granted) = approved_manifest(registry, id)?;
        let launched = self.host.launch(
            &manifest,
            &granted,
            SurfaceKind::View(kind),
            Some(view_id),
            environment_id,
            Some(SurfacePolicy::view_default()),
        )?;

        if registry.register_view(
            id,
            view_id,
            kind,
            launched.proxy,
            SurfaceRef {
                path: launched.entry_url,
            },
            launched.cleanup,
        ) {
            Ok(())
        } else {
            Err(ExecutionError::Rejected(id.to_string()))
        }
    }

    pub fn hide(
        &self,
        registry: &mut PluginRegistry,
        id: &str,
        view_id: &str,
        reason: StopReason,
    ) -> bool {
        if let Some(proxy) = registry.view_proxy_mut(id, view_id) {
            self.host.request_terminate(proxy);
        }
        registry.unregister_view(id, view_id, reason)
    }
}
