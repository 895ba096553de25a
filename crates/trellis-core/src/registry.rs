use crate::capability::Capabilities;
use crate::events::{EventBus, PluginEvent, StopReason};
use crate::manifest::{PluginManifest, ViewKind};
use crate::rpc::RpcProxy;
use crate::sandbox::CleanupToken;
use crate::EnvironmentId;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Identity of the OS process behind a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessRef {
    pub pid: Option<u32>,
    pub started_at: Instant,
}

impl ProcessRef {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Debug)]
pub struct WorkerHandle {
    pub process: ProcessRef,
    pub proxy: RpcProxy,
    pub cleanup: CleanupToken,
    pub environment_id: EnvironmentId,
}

/// Where a view surface is mounted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SurfaceRef {
    pub path: String,
}

#[derive(Debug)]
pub struct ViewHandle {
    pub view_id: String,
    pub kind: ViewKind,
    pub proxy: RpcProxy,
    pub surface: SurfaceRef,
    pub cleanup: CleanupToken,
}

#[derive(Debug)]
pub struct RegisteredPlugin {
    pub id: String,
    pub manifest: PluginManifest,
    granted_capabilities: Capabilities,
    approved: bool,
    active_background: Option<WorkerHandle>,
    active_views: Vec<ViewHandle>,
}

impl RegisteredPlugin {
    fn new(manifest: PluginManifest) -> Self {
        Self {
            id: manifest.id.clone(),
            manifest,
            granted_capabilities: Capabilities::empty(),
            approved: false,
            active_background: None,
            active_views: Vec::new(),
        }
    }

    pub fn approved(&self) -> bool {
        self.approved
    }

    pub fn granted_capabilities(&self) -> &Capabilities {
        &self.granted_capabilities
    }

    pub fn active_background(&self) -> Option<&WorkerHandle> {
        self.active_background.as_ref()
    }

    pub fn active_views(&self) -> &[ViewHandle] {
        &self.active_views
    }
}

/// Read-only summary of one view handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveView {
    pub view_id: String,
    pub kind: ViewKind,
    pub path: String,
}

/// Single source of truth for plugin state. Pure bookkeeping: the only I/O it performs
/// is terminating handles it is told to drop.
pub struct PluginRegistry {
    plugins: BTreeMap<String, RegisteredPlugin>,
    events: EventBus,
}

impl PluginRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            plugins: BTreeMap::new(),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn register_plugin(&mut self, manifest: PluginManifest) -> bool {
        if self.plugins.contains_key(&manifest.id) {
            return false;
        }
        let plugin_id = manifest.id.clone();
        self.plugins
            .insert(plugin_id.clone(), RegisteredPlugin::new(manifest));
        tracing::info!(plugin_id = %plugin_id, "plugin registered");
        self.events.publish(PluginEvent::PluginRegistered { plugin_id });
        true
    }

    pub fn approve_plugin(&mut self, id: &str) -> bool {
        let Some(plugin) = self.plugins.get_mut(id) else {
            return false;
        };
        if plugin.approved {
            return false;
        }
        plugin.granted_capabilities = plugin.manifest.requested_capabilities.clone();
        plugin.approved = true;
        tracing::info!(plugin_id = %id, capabilities = ?plugin.granted_capabilities.keys().collect::<Vec<_>>(), "plugin approved");
        self.events.publish(PluginEvent::PluginApproved {
            plugin_id: id.to_string(),
        });
        true
    }

    /// Adopts a live background handle. On `false` the handle is dropped, which kills
    /// its process and releases its cleanup token.
    pub fn register_worker(
        &mut self,
        id: &str,
        process: ProcessRef,
        proxy: RpcProxy,
        cleanup: CleanupToken,
        environment_id: EnvironmentId,
    ) -> bool {
        let mut handle = WorkerHandle {
            process,
            proxy,
            cleanup,
            environment_id,
        };
        let Some(plugin) = self.plugins.get_mut(id) else {
            discard_worker(&mut handle, StopReason::System);
            return false;
        };
        if !plugin.approved || plugin.active_background.is_some() {
            discard_worker(&mut handle, StopReason::System);
            return false;
        }

        plugin.active_background = Some(handle);
        tracing::info!(plugin_id = %id, environment_id, pid = ?process.pid, "plugin worker started");
        self.events.publish(PluginEvent::PluginWorkerStarted {
            plugin_id: id.to_string(),
            environment_id,
        });
        true
    }

    pub fn unregister_worker(&mut self, id: &str, reason: StopReason) -> bool {
        let Some(mut handle) = self
            .plugins
            .get_mut(id)
            .and_then(|plugin| plugin.active_background.take())
        else {
            return false;
        };

        discard_worker(&mut handle, reason);
        tracing::info!(plugin_id = %id, reason = %reason, uptime_ms = handle.process.uptime().as_millis() as u64, "plugin worker stopped");
        self.events.publish(PluginEvent::PluginWorkerStopped {
            plugin_id: id.to_string(),
            reason,
        });
        true
    }

    /// Upserts a view; a replaced surface with the same id is terminated first.
    pub fn register_view(
        &mut self,
        id: &str,
        view_id: &str,
        kind: ViewKind,
        proxy: RpcProxy,
        surface: SurfaceRef,
        cleanup: CleanupToken,
    ) -> bool {
        let mut handle = ViewHandle {
            view_id: view_id.to_string(),
            kind,
            proxy,
            surface,
            cleanup,
        };
        let Some(plugin) = self.plugins.get_mut(id) else {
            discard_view(&mut handle, StopReason::System);
            return false;
        };
        if !plugin.approved {
            discard_view(&mut handle, StopReason::System);
            return false;
        }

        let path = handle.surface.path.clone();
        match plugin.active_views.iter_mut().find(|v| v.view_id == view_id) {
            Some(existing) => {
                let mut replaced = std::mem::replace(existing, handle);
                discard_view(&mut replaced, StopReason::System);
                tracing::debug!(plugin_id = %id, view_id, "view surface replaced");
            }
            None => plugin.active_views.push(handle),
        }

        self.events.publish(PluginEvent::PluginUiDisplay {
            plugin_id: id.to_string(),
            view_id: view_id.to_string(),
            view_kind: kind,
            path,
        });
        true
    }

    pub fn unregister_view(&mut self, id: &str, view_id: &str, reason: StopReason) -> bool {
        let Some(plugin) = self.plugins.get_mut(id) else {
            return false;
        };
        let Some(index) = plugin.active_views.iter().position(|v| v.view_id == view_id) else {
            return false;
        };

        let mut handle = plugin.active_views.remove(index);
        discard_view(&mut handle, reason);
        tracing::debug!(plugin_id = %id, view_id, reason = %reason, "view surface hidden");
        self.events.publish(PluginEvent::PluginUiHide {
            plugin_id: id.to_string(),
            view_id: view_id.to_string(),
        });
        true
    }

    /// Tears down the worker and every view before deleting the entry.
    pub fn unregister_plugin(&mut self, id: &str, reason: StopReason) -> bool {
        if !self.plugins.contains_key(id) {
            return false;
        }

        self.unregister_worker(id, reason);
        let view_ids = self
            .plugins
            .get(id)
            .map(|plugin| {
                plugin
                    .active_views
                    .iter()
                    .map(|v| v.view_id.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for view_id in view_ids {
            self.unregister_view(id, &view_id, reason);
        }

        self.plugins.remove(id);
        tracing::info!(plugin_id = %id, reason = %reason, "plugin unregistered");
        self.events.publish(PluginEvent::PluginUnregistered {
            plugin_id: id.to_string(),
            reason,
        });
        true
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    pub fn is_approved(&self, id: &str) -> bool {
        self.plugins.get(id).is_some_and(|p| p.approved)
    }

    pub fn has_active_worker(&self, id: &str) -> bool {
        self.plugins
            .get(id)
            .is_some_and(|p| p.active_background.is_some())
    }

    pub fn worker_environment(&self, id: &str) -> Option<EnvironmentId> {
        self.plugins
            .get(id)
            .and_then(|p| p.active_background.as_ref())
            .map(|handle| handle.environment_id)
    }

    pub fn worker_proxy(&self, id: &str) -> Option<&RpcProxy> {
        self.plugins
            .get(id)
            .and_then(|p| p.active_background.as_ref())
            .map(|handle| &handle.proxy)
    }

    pub fn worker_proxy_mut(&mut self, id: &str) -> Option<&mut RpcProxy> {
        self.plugins
            .get_mut(id)
            .and_then(|p| p.active_background.as_mut())
            .map(|handle| &mut handle.proxy)
    }

    pub fn view_proxy_mut(&mut self, id: &str, view_id: &str) -> Option<&mut RpcProxy> {
        self.plugins
            .get_mut(id)?
            .active_views
            .iter_mut()
            .find(|v| v.view_id == view_id)
            .map(|v| &mut v.proxy)
    }

    /// Granted capabilities, only once approved.
    pub fn permissions(&self, id: &str) -> Option<&Capabilities> {
        self.plugins
            .get(id)
            .filter(|p| p.approved)
            .map(|p| &p.granted_capabilities)
    }

    pub fn config(&self, id: &str) -> Option<&PluginManifest> {
        self.plugins.get(id).map(|p| &p.manifest)
    }

    pub fn plugin(&self, id: &str) -> Option<&RegisteredPlugin> {
        self.plugins.get(id)
    }

    pub fn all_plugins(&self) -> Vec<&RegisteredPlugin> {
        self.plugins.values().collect()
    }

    pub fn active_plugin_ids(&self) -> Vec<String> {
        self.plugins
            .values()
            .filter(|p| p.active_background.is_some())
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn has_active_views(&self, id: &str) -> bool {
        self.plugins
            .get(id)
            .is_some_and(|p| !p.active_views.is_empty())
    }

    pub fn active_views(&self, id: &str) -> Vec<ActiveView> {
        self.plugins
            .get(id)
            .map(|p| {
                p.active_views
                    .iter()
                    .map(|v| ActiveView {
                        view_id: v.view_id.clone(),
                        kind: v.kind,
                        path: v.surface.path.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn plugins_with_active_views(&self) -> Vec<String> {
        self.plugins
            .values()
            .filter(|p| !p.active_views.is_empty())
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn active_view_count(&self) -> usize {
        self.plugins.values().map(|p| p.active_views.len()).sum()
    }

    pub(crate) fn view_keys(&self) -> Vec<(String, String)> {
        self.plugins
            .values()
            .flat_map(|p| {
                p.active_views
                    .iter()
                    .map(|v| (p.id.clone(), v.view_id.clone()))
            })
            .collect()
    }
}

fn discard_worker(handle: &mut WorkerHandle, reason: StopReason) {
    handle.proxy.kill(reason);
    handle.cleanup.release();
}

fn discard_view(handle: &mut ViewHandle, reason: StopReason) {
    handle.proxy.kill(reason);
    handle.cleanup.release();
}
