use crate::error::{SandboxError, SandboxErrorCode};
use crate::manifest::SurfaceKind;
use crate::protocol::{SurfacePolicy, SANDBOX_PROTOCOL_VERSION};
use crate::transport::{ProcessTransport, SandboxTransport};
use crate::EnvironmentId;
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_MAX_STAGED_ENTRY_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxConfig {
    pub command: String,
    pub args: Vec<String>,
    pub extra_env: HashMap<String, String>,
    pub inherit_stderr: bool,
    pub watchdog_interval_ms: u64,
    pub protocol_version: u32,
    pub supported_protocol_versions: Vec<u32>,
    pub setup_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub staging_dir: PathBuf,
    /// Upper bound on a downloaded entry point.
    pub max_staged_entry_bytes: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        #[cfg(target_os = "windows")]
        let sandbox_binary = "trellis-sandbox.exe";
        #[cfg(not(target_os = "windows"))]
        let sandbox_binary = "trellis-sandbox";

        let sandbox_path = std::env::var("TRELLIS_SANDBOX_BIN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| sandbox_binary.to_string());

        Self {
            command: sandbox_path,
            args: Vec::new(),
            extra_env: HashMap::new(),
            inherit_stderr: false,
            watchdog_interval_ms: 10,
            protocol_version: SANDBOX_PROTOCOL_VERSION,
            supported_protocol_versions: vec![SANDBOX_PROTOCOL_VERSION],
            setup_timeout_ms: 20_000,
            call_timeout_ms: 5_000,
            ping_timeout_ms: 500,
            staging_dir: std::env::temp_dir().join("trellis-staging"),
            max_staged_entry_bytes: DEFAULT_MAX_STAGED_ENTRY_BYTES,
        }
    }
}

impl SandboxConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }

    pub fn watchdog_tick(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms.max(10))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.max(10))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms.max(10))
    }

    pub fn normalized_supported_protocol_versions(&self) -> Vec<u32> {
        let mut versions = self
            .supported_protocol_versions
            .iter()
            .copied()
            .filter(|v| *v > 0)
            .collect::<Vec<_>>();
        if !versions.contains(&self.protocol_version) {
            versions.push(self.protocol_version);
        }
        versions.sort_unstable();
        versions.dedup();
        versions.reverse();
        versions
    }

    pub fn negotiate_protocol(&self, sandbox_version: u32) -> Option<u32> {
        if sandbox_version == 0 {
            return None;
        }
        self.normalized_supported_protocol_versions()
            .contains(&sandbox_version)
            .then_some(sandbox_version)
    }
}

/// Everything a launcher needs to create one isolated context.
#[derive(Clone, Debug)]
pub struct SandboxSpec<'a> {
    pub plugin_id: &'a str,
    pub plugin_version: &'a str,
    pub surface: SurfaceKind,
    pub view_id: Option<&'a str>,
    /// Local path of the entry point (staged when the bundle is remote).
    pub entry_path: &'a str,
    pub environment_id: EnvironmentId,
    pub policy: Option<SurfacePolicy>,
}

pub trait SandboxLauncher {
    fn launch(&self, spec: &SandboxSpec<'_>) -> Result<Box<dyn SandboxTransport>, SandboxError>;
}

/// Runs each sandbox as a child process speaking the wire protocol over stdio.
pub struct ProcessSandboxLauncher {
    config: SandboxConfig,
}

impl ProcessSandboxLauncher {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

impl SandboxLauncher for ProcessSandboxLauncher {
    fn launch(&self, spec: &SandboxSpec<'_>) -> Result<Box<dyn SandboxTransport>, SandboxError> {
        if self.config.command.trim().is_empty() {
            return Err(SandboxError::new(
                SandboxErrorCode::InvalidConfig,
                "sandbox command is empty",
            ));
        }

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if self.config.inherit_stderr {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .env("TRELLIS_PLUGIN_ID", spec.plugin_id)
            .env("TRELLIS_PLUGIN_VERSION", spec.plugin_version)
            .env("TRELLIS_SURFACE", spec.surface.as_tag())
            .env("TRELLIS_ENTRY_POINT", spec.entry_path)
            .env("TRELLIS_ENVIRONMENT_ID", spec.environment_id.to_string());

        if let Some(view_id) = spec.view_id {
            command.env("TRELLIS_VIEW_ID", view_id);
        }
        if let Some(policy) = spec.policy {
            command.env("TRELLIS_SURFACE_POLICY", policy.as_tokens().join(" "));
        }
        for (key, value) in &self.config.extra_env {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|err| {
            SandboxError::new(
                SandboxErrorCode::SpawnFailed,
                format!("spawn sandbox `{}` failed: {err}", self.config.command),
            )
        })?;

        let transport = ProcessTransport::attach(child)
            .map_err(|err| SandboxError::new(SandboxErrorCode::TransportIo, err))?;
        tracing::debug!(
            plugin_id = %spec.plugin_id,
            surface = spec.surface.as_tag(),
            pid = transport.process_id(),
            "sandbox process launched"
        );
        Ok(Box::new(transport))
    }
}

/// Resource to release once a sandbox is gone. Dropping the token releases it too.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupToken {
    staged: Option<PathBuf>,
}

impl CleanupToken {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn staged_file(path: PathBuf) -> Self {
        Self { staged: Some(path) }
    }

    pub fn release(&mut self) {
        if let Some(path) = self.staged.take() {
            if let Err(err) = fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %err, "staged entry point already gone");
            }
        }
    }

    pub fn staged_path(&self) -> Option<&Path> {
        self.staged.as_deref()
    }
}

impl Drop for CleanupToken {
    fn drop(&mut self) {
        self.release();
    }
}

fn is_remote_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Makes a resolved entry point available as a local file. Remote entry points are
/// downloaded into `config.staging_dir` within the setup deadline; the returned token
/// removes the copy.
pub fn stage_entry_point(
    entry_url: &str,
    config: &SandboxConfig,
    plugin_id: &str,
    surface: SurfaceKind,
) -> Result<(String, CleanupToken), SandboxError> {
    if !is_remote_url(entry_url) {
        return Ok((entry_url.to_string(), CleanupToken::none()));
    }

    let staging = |detail: String| SandboxError::new(SandboxErrorCode::Staging, detail);
    let limit = config.max_staged_entry_bytes;
    let staging_dir = config.staging_dir.as_path();

    let agent = ureq::AgentBuilder::new()
        .timeout(config.setup_timeout())
        .build();
    let response = agent.get(entry_url).call().map_err(|err| match err {
        ureq::Error::Status(status, _) => staging(format!("GET {entry_url} returned {status}")),
        ureq::Error::Transport(err) => staging(format!("GET {entry_url} failed: {err}")),
    })?;

    let mut body = Vec::new();
    response
        .into_reader()
        .take(limit + 1)
        .read_to_end(&mut body)
        .map_err(|err| staging(format!("read {entry_url} failed: {err}")))?;
    if body.len() as u64 > limit {
        return Err(staging(format!("entry point {entry_url} exceeds {limit} bytes")));
    }

    fs::create_dir_all(staging_dir)
        .map_err(|err| staging(format!("create {}: {err}", staging_dir.display())))?;

    let file_name = entry_url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("entry");
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let path = staging_dir.join(format!(
        "{}-{}-{}-{}",
        plugin_id.replace(['/', '\\'], "_"),
        surface.as_tag(),
        nanos,
        file_name.replace(['/', '\\', '?', '&'], "_")
    ));

    fs::write(&path, &body).map_err(|err| staging(format!("write {}: {err}", path.display())))?;
    Ok((
        path.to_string_lossy().into_owned(),
        CleanupToken::staged_file(path),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve_http, silent_http};
    use std::time::Instant;

    #[test]
    fn negotiates_protocol_from_supported_set() {
        let mut config = SandboxConfig::new("sandbox", Vec::new());
        config.protocol_version = 2;
        config.supported_protocol_versions = vec![3, 2, 1];

        assert_eq!(config.negotiate_protocol(3), Some(3));
        assert_eq!(config.negotiate_protocol(1), Some(1));
        assert_eq!(config.negotiate_protocol(4), None);
        assert_eq!(config.negotiate_protocol(0), None);
    }

    #[test]
    fn timeouts_are_clamped() {
        let mut config = SandboxConfig::new("sandbox", Vec::new());
        config.setup_timeout_ms = 0;
        config.watchdog_interval_ms = 0;
        assert_eq!(config.setup_timeout(), Duration::from_millis(10));
        assert_eq!(config.watchdog_tick(), Duration::from_millis(1));
    }

    #[test]
    fn local_entry_points_are_not_staged() {
        let (path, token) = stage_entry_point(
            "/bundles/notes/bg.js",
            &SandboxConfig::new("sandbox", Vec::new()),
            "notes",
            SurfaceKind::Background,
        )
        .expect("local entry");
        assert_eq!(path, "/bundles/notes/bg.js");
        assert_eq!(token, CleanupToken::none());
    }

    fn staging_config(name: &str) -> SandboxConfig {
        let mut config = SandboxConfig::new("sandbox", Vec::new());
        config.staging_dir = std::env::temp_dir().join(format!(
            "trellis_core_staging_{}_{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&config.staging_dir);
        config
    }

    #[test]
    fn remote_entry_is_downloaded_then_released() {
        let config = staging_config("download");
        let base = serve_http(b"export function initialize() {}".to_vec(), 1);

        let (path, mut token) = stage_entry_point(
            &format!("{base}/notes/bg.js"),
            &config,
            "notes",
            SurfaceKind::Background,
        )
        .expect("stage remote entry");
        let staged = PathBuf::from(&path);
        assert!(staged.starts_with(&config.staging_dir));
        assert!(path.ends_with("bg.js"));
        assert_eq!(
            fs::read(&staged).expect("read staged entry"),
            b"export function initialize() {}"
        );
        assert_eq!(token.staged_path(), Some(staged.as_path()));

        token.release();
        assert!(!staged.exists());
        let _ = fs::remove_dir_all(&config.staging_dir);
    }

    #[test]
    fn oversized_remote_entry_is_rejected() {
        let mut config = staging_config("oversized");
        config.max_staged_entry_bytes = 8;
        let base = serve_http(vec![b'x'; 64], 1);

        let err = stage_entry_point(
            &format!("{base}/notes/bg.js"),
            &config,
            "notes",
            SurfaceKind::Background,
        )
        .expect_err("body over the cap");
        assert_eq!(err.code, SandboxErrorCode::Staging);
        assert!(err.detail.contains("exceeds 8 bytes"), "{}", err.detail);
        assert!(!config.staging_dir.exists());
    }

    #[test]
    fn silent_remote_host_hits_setup_deadline() {
        let mut config = staging_config("silent");
        config.setup_timeout_ms = 200;
        let base = silent_http(Duration::from_secs(10));

        let started = Instant::now();
        let err = stage_entry_point(
            &format!("{base}/notes/bg.js"),
            &config,
            "notes",
            SurfaceKind::Background,
        )
        .expect_err("no response");
        assert_eq!(err.code, SandboxErrorCode::Staging);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cleanup_token_removes_staged_file() {
        let path = std::env::temp_dir().join(format!(
            "trellis_core_cleanup_test_{}",
            std::process::id()
        ));
        fs::write(&path, "x").expect("write staged file");

        let mut token = CleanupToken::staged_file(path.clone());
        assert_eq!(token.staged_path(), Some(path.as_path()));
        token.release();
        assert!(!path.exists());
        assert_eq!(token, CleanupToken::none());
        token.release();
    }

    #[test]
    fn empty_command_is_invalid_config() {
        let launcher = ProcessSandboxLauncher::new(SandboxConfig::new(" ", Vec::new()));
        let spec = SandboxSpec {
            plugin_id: "notes",
            plugin_version: "1.0.0",
            surface: SurfaceKind::Background,
            view_id: None,
            entry_path: "bg.js",
            environment_id: 1,
            policy: None,
        };
        let err = launcher.launch(&spec).err().expect("launch fails");
        assert_eq!(err.code, SandboxErrorCode::InvalidConfig);
    }

    #[test]
    fn missing_binary_is_spawn_failure() {
        let launcher = ProcessSandboxLauncher::new(SandboxConfig::new(
            "trellis-non-existent-sandbox-command",
            Vec::new(),
        ));
        let spec = SandboxSpec {
            plugin_id: "notes",
            plugin_version: "1.0.0",
            surface: SurfaceKind::Background,
            view_id: None,
            entry_path: "bg.js",
            environment_id: 1,
            policy: None,
        };
        let err = launcher.launch(&spec).err().expect("launch fails");
        assert_eq!(err.code, SandboxErrorCode::SpawnFailed);
    }
}
