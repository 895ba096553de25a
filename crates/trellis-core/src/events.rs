use crate::manifest::ViewKind;
use crate::EnvironmentId;
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    User,
    System,
    Error,
}

impl StopReason {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginEvent {
    PluginRegistered {
        plugin_id: String,
    },
    PluginApproved {
        plugin_id: String,
    },
    PluginUnregistered {
        plugin_id: String,
        reason: StopReason,
    },
    PluginWorkerStarted {
        plugin_id: String,
        environment_id: EnvironmentId,
    },
    PluginWorkerStopped {
        plugin_id: String,
        reason: StopReason,
    },
    PluginUiDisplay {
        plugin_id: String,
        view_id: String,
        view_kind: ViewKind,
        path: String,
    },
    PluginUiHide {
        plugin_id: String,
        view_id: String,
    },
    PluginLoaded {
        plugin_id: String,
        is_internal: bool,
    },
    PluginLoadError {
        plugin_id: String,
        error: String,
        is_internal: bool,
    },
    PluginWorkerError {
        plugin_id: String,
        error: String,
        fatal: bool,
    },
}

impl PluginEvent {
    pub fn plugin_id(&self) -> &str {
        match self {
            Self::PluginRegistered { plugin_id }
            | Self::PluginApproved { plugin_id }
            | Self::PluginUnregistered { plugin_id, .. }
            | Self::PluginWorkerStarted { plugin_id, .. }
            | Self::PluginWorkerStopped { plugin_id, .. }
            | Self::PluginUiDisplay { plugin_id, .. }
            | Self::PluginUiHide { plugin_id, .. }
            | Self::PluginLoaded { plugin_id, .. }
            | Self::PluginLoadError { plugin_id, .. }
            | Self::PluginWorkerError { plugin_id, .. } => plugin_id,
        }
    }

    pub const fn as_tag(&self) -> &'static str {
        match self {
            Self::PluginRegistered { .. } => "plugin_registered",
            Self::PluginApproved { .. } => "plugin_approved",
            Self::PluginUnregistered { .. } => "plugin_unregistered",
            Self::PluginWorkerStarted { .. } => "plugin_worker_started",
            Self::PluginWorkerStopped { .. } => "plugin_worker_stopped",
            Self::PluginUiDisplay { .. } => "plugin_ui_display",
            Self::PluginUiHide { .. } => "plugin_ui_hide",
            Self::PluginLoaded { .. } => "plugin_loaded",
            Self::PluginLoadError { .. } => "plugin_load_error",
            Self::PluginWorkerError { .. } => "plugin_worker_error",
        }
    }
}

/// Publish/subscribe bus owned by one host session. Cloning shares the subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Rc<RefCell<Vec<Sender<PluginEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<PluginEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.borrow_mut().push(tx);
        rx
    }

    /// Delivers to every live subscriber; dropped receivers are pruned.
    pub fn publish(&self, event: PluginEvent) {
        tracing::trace!(event = event.as_tag(), plugin_id = %event.plugin_id(), "plugin event");
        self.subscribers
            .borrow_mut()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }
}
