//! Capability-gated plugin host runtime.
//!
//! Bundles are discovered by loaders, registered unapproved, approved (automatically for
//! internal plugins), and executed inside sandbox processes that talk to the host over a
//! line-delimited JSON RPC channel. [`manager::PluginManager`] is the entry point.

pub mod api;
pub mod capability;
pub mod error;
pub mod events;
pub mod executor;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod paths;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod sandbox;
pub mod settings;
pub mod source;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

/// Opaque identifier of the active host environment (for example a signed-in account).
pub type EnvironmentId = i64;

pub use capability::Capabilities;
pub use events::{EventBus, PluginEvent, StopReason};
pub use manager::{PluginLifecycleState, PluginManager, PluginStatus};
pub use manifest::{PluginManifest, SurfaceKind, ViewKind};
