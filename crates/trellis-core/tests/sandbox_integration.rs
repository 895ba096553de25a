use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use trellis_core::api::ScopedApiFactory;
use trellis_core::manager::PluginManager;
use trellis_core::sandbox::{ProcessSandboxLauncher, SandboxConfig};
use trellis_core::source::{CatalogSource, DirectoryCatalog};
use trellis_core::{PluginEvent, StopReason, ViewKind};

fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "trellis_core_sandbox_it_{}_{}",
        name,
        std::process::id()
    ))
}

fn write_bundle(root: &Path, id: &str, manifest: serde_json::Value, files: &[&str]) {
    let dir = root.join(id);
    fs::create_dir_all(&dir).expect("create bundle dir");
    fs::write(dir.join("manifest.json"), manifest.to_string()).expect("write manifest");
    for file in files {
        fs::write(dir.join(file), "export function initialize() {}").expect("write entry");
    }
}

fn catalog(name: &str) -> PathBuf {
    let root = temp_dir(name);
    let _ = fs::remove_dir_all(&root);
    write_bundle(
        &root,
        "notes",
        json!({
            "id": "notes", "name": "Notes", "version": "1.0.0",
            "requested_capabilities": { "contacts": { "read": true } },
            "background": { "entry_point": "bg.js" },
            "view": { "summary": { "entry_point": "summary.html" } }
        }),
        &["bg.js", "summary.html"],
    );
    root
}

fn sandbox_config(extra_env: &[(&str, &str)]) -> SandboxConfig {
    let mut config = SandboxConfig::new(
        "cargo",
        vec![
            "run".to_string(),
            "-q".to_string(),
            "-p".to_string(),
            "trellis-sandbox".to_string(),
            "--".to_string(),
        ],
    );
    config.watchdog_interval_ms = 5;
    config.setup_timeout_ms = 120_000;
    config.call_timeout_ms = 5_000;
    config.ping_timeout_ms = 5_000;
    for (key, value) in extra_env {
        config.extra_env.insert(key.to_string(), value.to_string());
    }
    config
}

fn manager(root: &Path, extra_env: &[(&str, &str)]) -> PluginManager {
    let config = sandbox_config(extra_env);
    PluginManager::new(
        Arc::new(CatalogSource::new(Some(DirectoryCatalog::new(root)), None)),
        Box::new(ProcessSandboxLauncher::new(config.clone())),
        Box::new(ScopedApiFactory),
        config,
    )
}

fn worker_error(events: &std::sync::mpsc::Receiver<PluginEvent>) -> Option<String> {
    events.try_iter().find_map(|event| match event {
        PluginEvent::PluginWorkerError { error, .. } => Some(error),
        _ => None,
    })
}

#[test]
fn sandbox_process_runs_internal_plugin_and_stops() {
    let root = catalog("run");
    let mut manager = manager(&root, &[]);
    let events = manager.subscribe();

    assert_eq!(manager.initialize(), 1);
    assert_eq!(manager.execute_all_internal_plugins(7), 1);
    assert!(manager.is_plugin_active("notes"));

    let status = manager.plugin_status("notes");
    let worker = status.worker.expect("worker status");
    assert_eq!(worker.environment_id, 7);
    assert!(worker.alive);
    assert!(worker.pid.is_some());

    assert!(manager.stop_plugin("notes", StopReason::User));
    assert!(!manager.is_plugin_active("notes"));

    let events = events.try_iter().collect::<Vec<_>>();
    assert!(events.contains(&PluginEvent::PluginWorkerStarted {
        plugin_id: "notes".to_string(),
        environment_id: 7,
    }));
    assert!(events.contains(&PluginEvent::PluginWorkerStopped {
        plugin_id: "notes".to_string(),
        reason: StopReason::User,
    }));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn sandbox_process_rejects_missing_entry_point() {
    let root = catalog("missing_entry");
    let mut manager = manager(&root, &[]);
    manager.initialize();
    let events = manager.subscribe();

    fs::remove_file(root.join("notes").join("bg.js")).expect("remove entry point");
    assert!(!manager.execute_plugin("notes", 1));
    let error = worker_error(&events).expect("worker error event");
    assert!(error.contains("handshake_rejected"), "{error}");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn sandbox_process_initialize_failure_is_contained() {
    let root = catalog("init_fail");
    let mut manager = manager(&root, &[("TRELLIS_SANDBOX_INIT_OK", "false")]);
    manager.initialize();
    let events = manager.subscribe();

    assert!(!manager.execute_plugin("notes", 1));
    assert!(!manager.is_plugin_active("notes"));
    let error = worker_error(&events).expect("worker error event");
    assert!(error.contains("initialize"), "{error}");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn sandbox_process_missing_exports_fail_contract() {
    let root = catalog("contract");
    let mut manager = manager(&root, &[("TRELLIS_SANDBOX_EXPORTS", "initialize")]);
    manager.initialize();
    let events = manager.subscribe();

    assert!(!manager.execute_plugin("notes", 1));
    let error = worker_error(&events).expect("worker error event");
    assert!(error.contains("terminate"), "{error}");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn sandbox_process_protocol_mismatch_is_rejected() {
    let root = catalog("protocol");
    let mut manager = manager(&root, &[("TRELLIS_SANDBOX_PROTOCOL_VERSION", "99")]);
    manager.initialize();
    let events = manager.subscribe();

    assert!(!manager.execute_plugin("notes", 1));
    let error = worker_error(&events).expect("worker error event");
    assert!(error.contains("protocol_mismatch"), "{error}");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn sandbox_process_view_surface_shows_and_hides() {
    let root = catalog("view");
    let mut manager = manager(&root, &[]);
    manager.initialize();
    let events = manager.subscribe();

    assert!(manager.show_view("notes", "card", ViewKind::Summary, 2));
    assert_eq!(manager.active_view_count(), 1);
    assert!(manager.hide_view("notes", "card"));
    assert_eq!(manager.active_view_count(), 0);

    let events = events.try_iter().collect::<Vec<_>>();
    assert!(events.iter().any(|e| matches!(
        e,
        PluginEvent::PluginUiDisplay { view_kind: ViewKind::Summary, path, .. } if path.ends_with("summary.html")
    )));
    assert!(events.contains(&PluginEvent::PluginUiHide {
        plugin_id: "notes".to_string(),
        view_id: "card".to_string(),
    }));

    manager.shutdown();
    let _ = fs::remove_dir_all(&root);
}
