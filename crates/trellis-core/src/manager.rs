//! Orchestration surface for the plugin host.
//!
//! One [`PluginManager`] per host session owns the registry, the event bus, both loaders
//! and the executors. It is the error containment boundary: every lifecycle call returns
//! `bool`/`Option`/counts and reports failures as events on the bus.

use crate::api::{ApiFactory, ScopedApiFactory};
use crate::error::RpcError;
use crate::events::{EventBus, PluginEvent, StopReason};
use crate::executor::ExecutionHost;
use crate::loader::{AuthenticityPolicy, CatalogLoader, PluginLoader};
use crate::manifest::{PluginManifest, ViewKind};
use crate::registry::{ActiveView, PluginRegistry};
use crate::sandbox::{ProcessSandboxLauncher, SandboxConfig, SandboxLauncher};
use crate::settings::HostSettings;
use crate::source::{CatalogSource, ConfigSource, DirectoryCatalog, HttpCatalog, PluginOrigin};
use crate::EnvironmentId;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginLifecycleState {
    Unloaded,
    Loaded,
    Registered,
    Approved,
    Executing,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub environment_id: EnvironmentId,
    pub pid: Option<u32>,
    pub alive: bool,
    pub uptime_ms: u64,
}

/// Point-in-time snapshot for host-side inspection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PluginStatus {
    pub id: String,
    pub state: PluginLifecycleState,
    pub registered: bool,
    pub approved: bool,
    pub active: bool,
    pub worker: Option<WorkerStatus>,
    pub views: Vec<ActiveViewStatus>,
    pub config: Option<PluginManifest>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveViewStatus {
    pub view_id: String,
    pub kind: ViewKind,
    pub path: String,
}

impl From<ActiveView> for ActiveViewStatus {
    fn from(view: ActiveView) -> Self {
        Self {
            view_id: view.view_id,
            kind: view.kind,
            path: view.path,
        }
    }
}

pub struct PluginManager {
    registry: PluginRegistry,
    events: EventBus,
    internal_loader: CatalogLoader,
    external_loader: CatalogLoader,
    execution: ExecutionHost,
    loaded: BTreeMap<String, PluginManifest>,
    stopped: HashSet<String>,
    initialized: bool,
    environment_id: Option<EnvironmentId>,
}

impl PluginManager {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        launcher: Box<dyn SandboxLauncher>,
        api_factory: Box<dyn ApiFactory>,
        config: SandboxConfig,
    ) -> Self {
        let events = EventBus::new();
        Self {
            registry: PluginRegistry::new(events.clone()),
            events,
            internal_loader: CatalogLoader::internal(source.clone()),
            external_loader: CatalogLoader::external(source.clone()),
            execution: ExecutionHost::new(source, launcher, api_factory, config),
            loaded: BTreeMap::new(),
            stopped: HashSet::new(),
            initialized: false,
            environment_id: None,
        }
    }

    /// Builds a host from settings: directory/HTTP catalogs, process sandboxes and the
    /// scoped API factory.
    pub fn from_settings(settings: &HostSettings) -> Self {
        let internal = settings
            .catalog
            .bundled_dir
            .as_ref()
            .map(DirectoryCatalog::new);
        let external = settings
            .catalog
            .remote_base_url
            .as_ref()
            .filter(|url| !url.trim().is_empty())
            .map(|url| HttpCatalog::new(url.as_str(), settings.remote_timeout()));
        let source: Arc<dyn ConfigSource> = Arc::new(CatalogSource::new(internal, external));
        let config = settings.to_sandbox_config();

        Self::new(
            source,
            Box::new(ProcessSandboxLauncher::new(config.clone())),
            Box::new(ScopedApiFactory),
            config,
        )
        .with_authenticity(settings.authenticity)
    }

    pub fn with_authenticity(mut self, policy: AuthenticityPolicy) -> Self {
        self.internal_loader = self.internal_loader.clone().with_authenticity(policy);
        self.external_loader = self.external_loader.clone().with_authenticity(policy);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> Receiver<PluginEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn environment_id(&self) -> Option<EnvironmentId> {
        self.environment_id
    }

    fn loader(&self, origin: PluginOrigin) -> &CatalogLoader {
        match origin {
            PluginOrigin::Internal => &self.internal_loader,
            PluginOrigin::External => &self.external_loader,
        }
    }

    fn register_manifest(&mut self, manifest: PluginManifest) -> bool {
        let id = manifest.id.clone();
        let is_internal = manifest.is_internal;
        if !self.registry.is_registered(&id) && !self.registry.register_plugin(manifest) {
            return false;
        }
        if is_internal && !self.registry.is_approved(&id) {
            self.registry.approve_plugin(&id);
        }
        true
    }

    /// Registers and auto-approves every bundled plugin. No-op once it has succeeded.
    pub fn initialize(&mut self) -> usize {
        if self.initialized {
            return 0;
        }

        let manifests = self.internal_loader.load_all_plugins();
        let mut registered = 0;
        for manifest in manifests {
            let id = manifest.id.clone();
            self.loaded.insert(id.clone(), manifest.clone());
            self.events.publish(PluginEvent::PluginLoaded {
                plugin_id: id.clone(),
                is_internal: true,
            });
            if self.register_manifest(manifest) {
                registered += 1;
            }
        }

        self.initialized = true;
        tracing::info!(registered, "plugin host initialized");
        registered
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn load_plugin(&mut self, id: &str, is_internal: bool) -> Option<PluginManifest> {
        if let Some(manifest) = self.registry.config(id) {
            return Some(manifest.clone());
        }

        let origin = PluginOrigin::from_internal(is_internal);
        match self.loader(origin).try_load_plugin_by_id(id) {
            Ok(manifest) => {
                self.loaded.insert(id.to_string(), manifest.clone());
                self.events.publish(PluginEvent::PluginLoaded {
                    plugin_id: id.to_string(),
                    is_internal,
                });
                if is_internal {
                    self.register_manifest(manifest.clone());
                }
                Some(manifest)
            }
            Err(err) => {
                tracing::warn!(plugin_id = %id, origin = origin.as_tag(), error = %err, "plugin load failed");
                self.events.publish(PluginEvent::PluginLoadError {
                    plugin_id: id.to_string(),
                    error: err.to_string(),
                    is_internal,
                });
                None
            }
        }
    }

    pub fn load_plugins(&mut self, ids: &[&str], is_internal: bool) -> Vec<PluginManifest> {
        ids.iter()
            .filter_map(|id| self.load_plugin(id, is_internal))
            .collect()
    }

    /// Resolves a manifest from the cache, then the internal catalog, then the external
    /// one. Only internal plugins are approved automatically.
    pub fn register_plugin(&mut self, id: &str) -> bool {
        if self.registry.is_registered(id) {
            return true;
        }

        let manifest = match self.loaded.get(id) {
            Some(manifest) => Some(manifest.clone()),
            None => self
                .internal_loader
                .load_plugin_by_id(id)
                .or_else(|| self.external_loader.load_plugin_by_id(id)),
        };
        let Some(manifest) = manifest else {
            self.events.publish(PluginEvent::PluginLoadError {
                plugin_id: id.to_string(),
                error: format!("plugin {id} not found in any catalog"),
                is_internal: false,
            });
            return false;
        };

        self.loaded.insert(id.to_string(), manifest.clone());
        self.register_manifest(manifest)
    }

    pub fn approve_plugin(&mut self, id: &str) -> bool {
        if !self.registry.is_registered(id) {
            tracing::debug!(plugin_id = %id, "approve ignored for unregistered plugin");
            return false;
        }
        self.registry.approve_plugin(id)
    }

    /// Starts the background worker. Re-executing in the same environment keeps the
    /// live worker; a different environment replaces it.
    pub fn execute_plugin(&mut self, id: &str, environment_id: EnvironmentId) -> bool {
        let Some(manifest) = self.registry.config(id) else {
            tracing::debug!(plugin_id = %id, "execute refused: not registered");
            return false;
        };
        if manifest.background_entry().is_none() {
            tracing::debug!(plugin_id = %id, "execute skipped: no background entry point");
            return false;
        }
        if !self.registry.is_approved(id) {
            tracing::debug!(plugin_id = %id, "execute refused: not approved");
            return false;
        }

        if let Some(current) = self.registry.worker_environment(id) {
            if current == environment_id {
                return true;
            }
            tracing::info!(plugin_id = %id, from = current, to = environment_id, "environment changed, restarting worker");
            self.execution
                .background()
                .terminate(&mut self.registry, id, StopReason::System);
        }

        match self
            .execution
            .background()
            .execute(&mut self.registry, id, environment_id)
        {
            Ok(()) => {
                self.stopped.remove(id);
                true
            }
            Err(err) => {
                tracing::warn!(plugin_id = %id, environment_id, error = %err, "plugin execution failed");
                self.events.publish(PluginEvent::PluginWorkerError {
                    plugin_id: id.to_string(),
                    error: err.to_string(),
                    fatal: false,
                });
                false
            }
        }
    }

    pub fn execute_all_internal_plugins(&mut self, environment_id: EnvironmentId) -> usize {
        let ids = self
            .registry
            .all_plugins()
            .into_iter()
            .filter(|p| p.manifest.is_internal && p.manifest.background_entry().is_some())
            .map(|p| p.id.clone())
            .collect::<Vec<_>>();

        let started = ids
            .iter()
            .filter(|id| self.execute_plugin(id, environment_id))
            .count();
        tracing::info!(environment_id, started, total = ids.len(), "internal plugins executed");
        started
    }

    /// Records the active environment and re-runs internal plugins when it changes.
    pub fn set_environment(&mut self, environment_id: EnvironmentId) -> usize {
        if self.environment_id == Some(environment_id) {
            return 0;
        }
        self.environment_id = Some(environment_id);
        self.execute_all_internal_plugins(environment_id)
    }

    pub fn stop_plugin(&mut self, id: &str, reason: StopReason) -> bool {
        let stopped = self
            .execution
            .background()
            .terminate(&mut self.registry, id, reason);
        if stopped {
            self.stopped.insert(id.to_string());
        } else {
            tracing::debug!(plugin_id = %id, reason = %reason, "stop ignored: no active worker");
        }
        stopped
    }

    pub fn unregister_plugin(&mut self, id: &str, reason: StopReason) -> bool {
        if !self.registry.is_registered(id) {
            return false;
        }

        self.execution
            .background()
            .terminate(&mut self.registry, id, reason);
        for view in self.registry.active_views(id) {
            self.execution
                .views()
                .hide(&mut self.registry, id, &view.view_id, reason);
        }

        self.loaded.remove(id);
        self.stopped.remove(id);
        self.registry.unregister_plugin(id, reason)
    }

    /// Load, register, approve if needed, then execute when a background entry exists.
    pub fn setup_plugin(
        &mut self,
        id: &str,
        is_internal: bool,
        environment_id: EnvironmentId,
    ) -> bool {
        let Some(manifest) = self.load_plugin(id, is_internal) else {
            return false;
        };
        if !self.registry.is_registered(id) && !self.register_manifest(manifest.clone()) {
            return false;
        }
        if !self.registry.is_approved(id) {
            self.registry.approve_plugin(id);
        }
        if manifest.background_entry().is_some() {
            return self.execute_plugin(id, environment_id);
        }
        true
    }

    pub fn show_view(
        &mut self,
        id: &str,
        view_id: &str,
        kind: ViewKind,
        environment_id: EnvironmentId,
    ) -> bool {
        if !self.registry.is_approved(id) {
            tracing::debug!(plugin_id = %id, view_id, "show refused: not approved");
            return false;
        }
        match self
            .execution
            .views()
            .show(&mut self.registry, id, view_id, kind, environment_id)
        {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(plugin_id = %id, view_id, error = %err, "view setup failed");
                self.events.publish(PluginEvent::PluginWorkerError {
                    plugin_id: id.to_string(),
                    error: err.to_string(),
                    fatal: false,
                });
                false
            }
        }
    }

    pub fn hide_view(&mut self, id: &str, view_id: &str) -> bool {
        self.execution
            .views()
            .hide(&mut self.registry, id, view_id, StopReason::User)
    }

    /// Services queued sandbox-to-host calls on every live handle and reaps sandboxes that
    /// died on their own. Returns the number of host calls serviced.
    pub fn pump_host_calls(&mut self) -> usize {
        let budget = self.execution.config().watchdog_tick();
        let mut serviced = 0;

        for id in self.registry.active_plugin_ids() {
            let Some(proxy) = self.registry.worker_proxy_mut(&id) else {
                continue;
            };
            let outcome = if proxy.is_alive() {
                proxy.pump(budget)
            } else {
                Err(RpcError::Closed)
            };
            match outcome {
                Ok(count) => serviced += count,
                Err(err) => {
                    tracing::warn!(plugin_id = %id, error = %err, "background sandbox died");
                    self.events.publish(PluginEvent::PluginWorkerError {
                        plugin_id: id.clone(),
                        error: err.to_string(),
                        fatal: true,
                    });
                    self.registry.unregister_worker(&id, StopReason::Error);
                    self.stopped.insert(id);
                }
            }
        }

        for (id, view_id) in self.registry.view_keys() {
            let Some(proxy) = self.registry.view_proxy_mut(&id, &view_id) else {
                continue;
            };
            let outcome = if proxy.is_alive() {
                proxy.pump(budget)
            } else {
                Err(RpcError::Closed)
            };
            match outcome {
                Ok(count) => serviced += count,
                Err(err) => {
                    tracing::warn!(plugin_id = %id, view_id = %view_id, error = %err, "view sandbox died");
                    self.events.publish(PluginEvent::PluginWorkerError {
                        plugin_id: id.clone(),
                        error: format!("view {view_id}: {err}"),
                        fatal: true,
                    });
                    self.registry.unregister_view(&id, &view_id, StopReason::Error);
                }
            }
        }

        serviced
    }

    pub fn plugin_status(&mut self, id: &str) -> PluginStatus {
        let registered = self.registry.is_registered(id);
        let approved = self.registry.is_approved(id);
        let environment_id = self.registry.worker_environment(id);
        let process = self
            .registry
            .plugin(id)
            .and_then(|p| p.active_background())
            .map(|handle| handle.process);
        let alive = self
            .registry
            .worker_proxy_mut(id)
            .is_some_and(|proxy| proxy.is_alive());

        let worker = environment_id.zip(process).map(|(environment_id, process)| WorkerStatus {
            environment_id,
            pid: process.pid,
            alive,
            uptime_ms: process.uptime().as_millis() as u64,
        });

        let state = if worker.is_some() {
            PluginLifecycleState::Executing
        } else if approved && self.stopped.contains(id) {
            PluginLifecycleState::Stopped
        } else if approved {
            PluginLifecycleState::Approved
        } else if registered {
            PluginLifecycleState::Registered
        } else if self.loaded.contains_key(id) {
            PluginLifecycleState::Loaded
        } else {
            PluginLifecycleState::Unloaded
        };

        PluginStatus {
            id: id.to_string(),
            state,
            registered,
            approved,
            active: worker.is_some(),
            worker,
            views: self
                .registry
                .active_views(id)
                .into_iter()
                .map(ActiveViewStatus::from)
                .collect(),
            config: self
                .registry
                .config(id)
                .or_else(|| self.loaded.get(id))
                .cloned(),
        }
    }

    /// Manifests of every registered plugin.
    pub fn loaded_plugins(&self) -> Vec<PluginManifest> {
        self.registry
            .all_plugins()
            .into_iter()
            .map(|p| p.manifest.clone())
            .collect()
    }

    pub fn active_plugin_ids(&self) -> Vec<String> {
        self.registry.active_plugin_ids()
    }

    pub fn is_plugin_active(&self, id: &str) -> bool {
        self.registry.has_active_worker(id)
    }

    pub fn active_view_count(&self) -> usize {
        self.registry.active_view_count()
    }

    pub fn plugins_with_active_views(&self) -> Vec<String> {
        self.registry.plugins_with_active_views()
    }

    /// Stops every sandbox and unregisters every plugin; the manager can be initialized
    /// again afterwards.
    pub fn shutdown(&mut self) {
        let ids = self
            .registry
            .all_plugins()
            .into_iter()
            .map(|p| p.id.clone())
            .collect::<Vec<_>>();
        for id in &ids {
            self.unregister_plugin(id, StopReason::System);
        }
        self.loaded.clear();
        self.stopped.clear();
        self.initialized = false;
        self.environment_id = None;
        tracing::info!(plugins = ids.len(), "plugin host shut down");
    }
}
