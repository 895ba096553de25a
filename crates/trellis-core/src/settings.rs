use crate::loader::AuthenticityPolicy;
use crate::protocol::SANDBOX_PROTOCOL_VERSION;
use crate::sandbox::SandboxConfig;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSettings {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub catalog: CatalogSettings,
    #[serde(default)]
    pub authenticity: AuthenticityPolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxSettings {
    /// Sandbox runtime binary. Empty means the `TRELLIS_SANDBOX_BIN` or built-in default.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub extra_env: HashMap<String, String>,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default = "default_supported_protocol_versions")]
    pub supported_protocol_versions: Vec<u32>,
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default)]
    pub inherit_stderr: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogSettings {
    #[serde(default)]
    pub bundled_dir: Option<PathBuf>,
    #[serde(default)]
    pub remote_base_url: Option<String>,
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            extra_env: HashMap::new(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            protocol_version: default_protocol_version(),
            supported_protocol_versions: default_supported_protocol_versions(),
            setup_timeout_ms: default_setup_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            inherit_stderr: false,
        }
    }
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            bundled_dir: None,
            remote_base_url: None,
            remote_timeout_ms: default_remote_timeout_ms(),
            staging_dir: None,
        }
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            sandbox: SandboxSettings::default(),
            catalog: CatalogSettings::default(),
            authenticity: AuthenticityPolicy::default(),
        }
    }
}

impl HostSettings {
    pub fn to_sandbox_config(&self) -> SandboxConfig {
        let mut config = SandboxConfig::default();
        if !self.sandbox.command.trim().is_empty() {
            config.command = self.sandbox.command.trim().to_string();
        }
        config.args = self.sandbox.args.clone();
        config.extra_env = self.sandbox.extra_env.clone();
        config.inherit_stderr = self.sandbox.inherit_stderr;
        config.watchdog_interval_ms = self.sandbox.watchdog_interval_ms.max(1);
        config.protocol_version = self.sandbox.protocol_version.max(1);
        config.supported_protocol_versions = self.sandbox.supported_protocol_versions.clone();
        config.setup_timeout_ms = self.sandbox.setup_timeout_ms.max(10);
        config.call_timeout_ms = self.sandbox.call_timeout_ms.max(10);
        config.ping_timeout_ms = self.sandbox.ping_timeout_ms.max(10);
        if let Some(dir) = &self.catalog.staging_dir {
            config.staging_dir = dir.clone();
        }
        config
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog.remote_timeout_ms.max(100))
    }

    /// Applies a project overlay. Only fields the overlay actually sets replace user
    /// values; `extra_env` entries are merged key by key.
    pub fn merge_overlay(&self, overlay: &SettingsOverlay) -> HostSettings {
        let mut merged = self.clone();
        if let Some(v) = overlay.schema_version {
            merged.schema_version = self.schema_version.max(v);
        }
        merged.sandbox.merge_overlay(&overlay.sandbox);
        merged.catalog.merge_overlay(&overlay.catalog);
        if let Some(v) = overlay.authenticity {
            merged.authenticity = v;
        }
        merged
    }
}

impl SandboxSettings {
    fn merge_overlay(&mut self, overlay: &SandboxOverlay) {
        if let Some(command) = overlay.command.as_deref().filter(|c| !c.trim().is_empty()) {
            self.command = command.to_string();
            self.args = overlay.args.clone().unwrap_or_default();
        } else if let Some(args) = &overlay.args {
            self.args = args.clone();
        }
        for (key, value) in &overlay.extra_env {
            self.extra_env.insert(key.clone(), value.clone());
        }
        if let Some(v) = overlay.watchdog_interval_ms {
            self.watchdog_interval_ms = v;
        }
        if let Some(v) = overlay.protocol_version {
            self.protocol_version = v;
        }
        if let Some(v) = &overlay.supported_protocol_versions {
            self.supported_protocol_versions = v.clone();
        }
        if let Some(v) = overlay.setup_timeout_ms {
            self.setup_timeout_ms = v;
        }
        if let Some(v) = overlay.call_timeout_ms {
            self.call_timeout_ms = v;
        }
        if let Some(v) = overlay.ping_timeout_ms {
            self.ping_timeout_ms = v;
        }
        if let Some(v) = overlay.inherit_stderr {
            self.inherit_stderr = v;
        }
    }
}

impl CatalogSettings {
    fn merge_overlay(&mut self, overlay: &CatalogOverlay) {
        if let Some(v) = &overlay.bundled_dir {
            self.bundled_dir = Some(v.clone());
        }
        if let Some(url) = overlay.remote_base_url.as_deref().filter(|u| !u.trim().is_empty()) {
            self.remote_base_url = Some(url.to_string());
        }
        if let Some(v) = overlay.remote_timeout_ms {
            self.remote_timeout_ms = v;
        }
        if let Some(v) = &overlay.staging_dir {
            self.staging_dir = Some(v.clone());
        }
    }
}

/// Project-level settings. Every field is optional; absent fields leave the user's
/// settings untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub sandbox: SandboxOverlay,
    #[serde(default)]
    pub catalog: CatalogOverlay,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticity: Option<AuthenticityPolicy>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra_env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_protocol_versions: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit_stderr: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundled_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join("settings.json")
}

pub fn project_settings_path(project_root: &Path) -> PathBuf {
    project_root.join(".trellis").join("settings.json")
}

pub fn load_settings(config_dir: &Path) -> Result<HostSettings> {
    load_settings_from_path(&settings_path(config_dir))
}

pub fn load_project_settings(project_root: &Path) -> Result<Option<SettingsOverlay>> {
    let path = project_settings_path(project_root);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read project settings file: {}", path.display()))?;
    let overlay: SettingsOverlay = serde_json::from_str(&raw)
        .with_context(|| format!("parse project settings file: {}", path.display()))?;
    Ok(Some(overlay))
}

pub fn load_effective_settings(
    config_dir: &Path,
    project_root: Option<&Path>,
) -> Result<HostSettings> {
    let user = load_settings(config_dir).unwrap_or_default();
    if let Some(project_root) = project_root {
        if let Some(project) = load_project_settings(project_root)? {
            return Ok(user.merge_overlay(&project));
        }
    }
    Ok(user)
}

pub fn save_settings(config_dir: &Path, settings: &HostSettings) -> Result<()> {
    save_json(&settings_path(config_dir), settings)
}

pub fn save_project_settings(project_root: &Path, overlay: &SettingsOverlay) -> Result<()> {
    save_json(&project_settings_path(project_root), overlay)
}

fn load_settings_from_path(path: &Path) -> Result<HostSettings> {
    if !path.exists() {
        return Ok(HostSettings::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("read settings file: {}", path.display()))?;
    let settings: HostSettings = serde_json::from_str(&raw)
        .with_context(|| format!("parse settings file: {}", path.display()))?;
    Ok(settings)
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create config dir: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("write settings file: {}", path.display()))?;
    Ok(())
}

const fn default_schema_version() -> u32 {
    1
}

const fn default_watchdog_interval_ms() -> u64 {
    10
}

const fn default_protocol_version() -> u32 {
    SANDBOX_PROTOCOL_VERSION
}

fn default_supported_protocol_versions() -> Vec<u32> {
    vec![SANDBOX_PROTOCOL_VERSION]
}

const fn default_setup_timeout_ms() -> u64 {
    20_000
}

const fn default_call_timeout_ms() -> u64 {
    5_000
}

const fn default_ping_timeout_ms() -> u64 {
    500
}

const fn default_remote_timeout_ms() -> u64 {
    10_000
}
