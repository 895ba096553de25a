//! Configuration-fetch collaborators: where manifests come from and how bundle
//! completeness is checked.
//!
//! Internal plugins live in a bundled directory catalog (`<root>/<id>/manifest.json`,
//! entry points relative to `<root>/<id>/`). External plugins come from a remote HTTP
//! catalog:
//!
//! - `GET  {base}/plugins` -> array of manifest documents
//! - `GET  {base}/plugins/{id}/manifest.json` -> manifest document (404 = unknown)
//! - `POST {base}/plugins/{id}/validate` with `{"paths": [...]}` -> [`FileValidation`]
//! - assets are served from `{base}/plugins/{id}/assets/{path}`

use crate::error::LoadError;
use crate::manifest::{ManifestDocument, PluginManifest};
use crate::paths::{join_inside, validate_plugin_dir_name};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginOrigin {
    Internal,
    External,
}

impl PluginOrigin {
    pub const fn from_internal(is_internal: bool) -> Self {
        if is_internal {
            Self::Internal
        } else {
            Self::External
        }
    }

    pub const fn is_internal(self) -> bool {
        matches!(self, Self::Internal)
    }

    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileValidation {
    pub valid: bool,
    #[serde(default)]
    pub missing_paths: Vec<String>,
}

impl FileValidation {
    pub fn from_missing(missing_paths: Vec<String>) -> Self {
        Self {
            valid: missing_paths.is_empty(),
            missing_paths,
        }
    }
}

pub trait ConfigSource {
    fn manifest_list(&self, origin: PluginOrigin) -> Result<Vec<ManifestDocument>, LoadError>;

    fn manifest(
        &self,
        id: &str,
        origin: PluginOrigin,
    ) -> Result<Option<ManifestDocument>, LoadError>;

    fn validate_files(
        &self,
        id: &str,
        manifest: &PluginManifest,
        origin: PluginOrigin,
    ) -> Result<FileValidation, LoadError>;

    fn resolve_asset_url(
        &self,
        id: &str,
        relative_path: &str,
        origin: PluginOrigin,
    ) -> Result<String, LoadError>;

    fn resolve_entry_point_url(
        &self,
        id: &str,
        entry_point: &str,
        origin: PluginOrigin,
    ) -> Result<String, LoadError> {
        self.resolve_asset_url(id, entry_point, origin)
    }

    fn manifest_exists(&self, id: &str, origin: PluginOrigin) -> bool {
        matches!(self.manifest(id, origin), Ok(Some(_)))
    }
}

/// Bundled plugins on the local filesystem.
#[derive(Clone, Debug)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn plugin_dir(&self, id: &str) -> Result<PathBuf, LoadError> {
        validate_plugin_dir_name(id).map_err(|err| LoadError::Source(err.to_string()))?;
        Ok(self.root.join(id.trim()))
    }

    fn read_document(path: &Path) -> Result<ManifestDocument, LoadError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| LoadError::Source(format!("read {}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| LoadError::Source(format!("parse {}: {err}", path.display())))
    }

    fn list(&self) -> Result<Vec<ManifestDocument>, LoadError> {
        let entries = fs::read_dir(&self.root).map_err(|err| {
            LoadError::Source(format!("read catalog {}: {err}", self.root.display()))
        })?;

        let mut dirs = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.join(MANIFEST_FILE).is_file())
            .collect::<Vec<_>>();
        dirs.sort();

        let mut out = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match Self::read_document(&dir.join(MANIFEST_FILE)) {
                Ok(doc) => out.push(doc),
                Err(err) => {
                    tracing::warn!(path = %dir.display(), error = %err, "skipping unreadable bundled manifest");
                }
            }
        }
        Ok(out)
    }

    fn get(&self, id: &str) -> Result<Option<ManifestDocument>, LoadError> {
        let path = self.plugin_dir(id)?.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Self::read_document(&path).map(Some)
    }

    fn missing_files(&self, id: &str, manifest: &PluginManifest) -> Result<Vec<String>, LoadError> {
        let dir = self.plugin_dir(id)?;
        let mut missing = Vec::new();
        for entry in manifest.entry_points() {
            let exists = join_inside(&dir, entry)
                .map(|path| path.is_file())
                .unwrap_or(false);
            if !exists {
                missing.push(entry.to_string());
            }
        }
        Ok(missing)
    }

    fn asset_path(&self, id: &str, relative_path: &str) -> Result<PathBuf, LoadError> {
        let dir = self.plugin_dir(id)?;
        join_inside(&dir, relative_path).map_err(|err| LoadError::InvalidEntryPoint {
            plugin_id: id.to_string(),
            path: relative_path.to_string(),
            message: err.to_string(),
        })
    }
}

/// Remote plugin listing served over HTTP.
#[derive(Clone)]
pub struct HttpCatalog {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        Self {
            base_url,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn plugin_url(&self, id: &str, tail: &str) -> Result<String, LoadError> {
        validate_plugin_dir_name(id).map_err(|err| LoadError::Source(err.to_string()))?;
        Ok(format!("{}/plugins/{}/{}", self.base_url, id.trim(), tail))
    }

    fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Option<T>, LoadError> {
        match self.agent.get(url).call() {
            Ok(response) => response
                .into_json::<T>()
                .map(Some)
                .map_err(|err| LoadError::Source(format!("decode {url}: {err}"))),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(LoadError::Source(format!(
                    "GET {url} failed with status {status}: {body}"
                )))
            }
            Err(ureq::Error::Transport(err)) => {
                Err(LoadError::Source(format!("GET {url} transport error: {err}")))
            }
        }
    }
}

/// Routes internal lookups to a [`DirectoryCatalog`] and external ones to an
/// [`HttpCatalog`]. A missing side behaves like an empty catalog.
#[derive(Clone, Default)]
pub struct CatalogSource {
    internal: Option<DirectoryCatalog>,
    external: Option<HttpCatalog>,
}

impl CatalogSource {
    pub fn new(internal: Option<DirectoryCatalog>, external: Option<HttpCatalog>) -> Self {
        Self { internal, external }
    }
}

impl ConfigSource for CatalogSource {
    fn manifest_list(&self, origin: PluginOrigin) -> Result<Vec<ManifestDocument>, LoadError> {
        match (origin, &self.internal, &self.external) {
            (PluginOrigin::Internal, Some(catalog), _) => catalog.list(),
            (PluginOrigin::External, _, Some(catalog)) => {
                let url = format!("{}/plugins", catalog.base_url);
                Ok(catalog
                    .fetch_json::<Vec<ManifestDocument>>(&url)?
                    .unwrap_or_default())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn manifest(
        &self,
        id: &str,
        origin: PluginOrigin,
    ) -> Result<Option<ManifestDocument>, LoadError> {
        match (origin, &self.internal, &self.external) {
            (PluginOrigin::Internal, Some(catalog), _) => catalog.get(id),
            (PluginOrigin::External, _, Some(catalog)) => {
                let url = catalog.plugin_url(id, MANIFEST_FILE)?;
                catalog.fetch_json(&url)
            }
            _ => Ok(None),
        }
    }

    fn validate_files(
        &self,
        id: &str,
        manifest: &PluginManifest,
        origin: PluginOrigin,
    ) -> Result<FileValidation, LoadError> {
        match (origin, &self.internal, &self.external) {
            (PluginOrigin::Internal, Some(catalog), _) => {
                catalog.missing_files(id, manifest).map(FileValidation::from_missing)
            }
            (PluginOrigin::External, _, Some(catalog)) => {
                let url = catalog.plugin_url(id, "validate")?;
                let payload = json!({ "paths": manifest.entry_points() });
                match catalog.agent.post(&url).send_json(payload) {
                    Ok(response) => response
                        .into_json::<FileValidation>()
                        .map_err(|err| LoadError::Source(format!("decode {url}: {err}"))),
                    Err(ureq::Error::Status(status, _)) => Err(LoadError::Source(format!(
                        "POST {url} failed with status {status}"
                    ))),
                    Err(ureq::Error::Transport(err)) => {
                        Err(LoadError::Source(format!("POST {url} transport error: {err}")))
                    }
                }
            }
            _ => Err(LoadError::NotFound(id.to_string())),
        }
    }

    fn resolve_asset_url(
        &self,
        id: &str,
        relative_path: &str,
        origin: PluginOrigin,
    ) -> Result<String, LoadError> {
        match (origin, &self.internal, &self.external) {
            (PluginOrigin::Internal, Some(catalog), _) => catalog
                .asset_path(id, relative_path)
                .map(|path| path.to_string_lossy().into_owned()),
            (PluginOrigin::External, _, Some(catalog)) => {
                catalog.plugin_url(id, &format!("assets/{relative_path}"))
            }
            _ => Err(LoadError::NotFound(id.to_string())),
        }
    }
}
