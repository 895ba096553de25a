use crate::error::LoadError;
use crate::manifest::{ManifestDocument, PluginManifest};
use crate::source::{ConfigSource, PluginOrigin};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What to do when a fetched manifest declares a different id than the one requested.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticityPolicy {
    #[default]
    LogOnly,
    Enforce,
}

pub trait PluginLoader {
    fn origin(&self) -> PluginOrigin;

    /// Every usable manifest from the catalog. Bad entries are skipped, never fatal.
    fn load_all_plugins(&self) -> Vec<PluginManifest>;

    fn try_load_plugin_by_id(&self, id: &str) -> Result<PluginManifest, LoadError>;

    fn load_plugin_by_id(&self, id: &str) -> Option<PluginManifest> {
        match self.try_load_plugin_by_id(id) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                tracing::warn!(plugin_id = %id, origin = self.origin().as_tag(), error = %err, "plugin manifest rejected");
                None
            }
        }
    }
}

/// Stateless loader over one side of a [`ConfigSource`]. The origin decides
/// `is_internal` on every manifest it produces.
#[derive(Clone)]
pub struct CatalogLoader {
    source: Arc<dyn ConfigSource>,
    origin: PluginOrigin,
    authenticity: AuthenticityPolicy,
}

impl CatalogLoader {
    pub fn internal(source: Arc<dyn ConfigSource>) -> Self {
        Self::new(source, PluginOrigin::Internal)
    }

    pub fn external(source: Arc<dyn ConfigSource>) -> Self {
        Self::new(source, PluginOrigin::External)
    }

    pub fn new(source: Arc<dyn ConfigSource>, origin: PluginOrigin) -> Self {
        Self {
            source,
            origin,
            authenticity: AuthenticityPolicy::default(),
        }
    }

    pub fn with_authenticity(mut self, policy: AuthenticityPolicy) -> Self {
        self.authenticity = policy;
        self
    }

    fn validate_document(&self, document: ManifestDocument) -> Result<PluginManifest, LoadError> {
        let manifest = document.into_manifest(self.origin.is_internal())?;
        self.check_files(manifest)
    }

    fn check_files(&self, manifest: PluginManifest) -> Result<PluginManifest, LoadError> {
        if !manifest.is_inert() {
            let validation = self
                .source
                .validate_files(&manifest.id, &manifest, self.origin)?;
            if !validation.valid {
                return Err(LoadError::MissingFiles {
                    plugin_id: manifest.id,
                    missing: validation.missing_paths,
                });
            }
        }

        Ok(manifest)
    }

    fn check_authenticity(&self, requested: &str, declared: &str) -> Result<(), LoadError> {
        if requested == declared {
            return Ok(());
        }
        let err = LoadError::AuthenticityMismatch {
            requested: requested.to_string(),
            declared: declared.to_string(),
        };
        match self.authenticity {
            AuthenticityPolicy::LogOnly => {
                tracing::warn!(plugin_id = %requested, error = %err, "manifest authenticity not verified");
                Ok(())
            }
            AuthenticityPolicy::Enforce => Err(err),
        }
    }
}

impl PluginLoader for CatalogLoader {
    fn origin(&self) -> PluginOrigin {
        self.origin
    }

    fn load_all_plugins(&self) -> Vec<PluginManifest> {
        let documents = match self.source.manifest_list(self.origin) {
            Ok(documents) => documents,
            Err(err) => {
                tracing::warn!(origin = self.origin.as_tag(), error = %err, "plugin catalog unavailable");
                return Vec::new();
            }
        };

        let mut out: Vec<PluginManifest> = Vec::with_capacity(documents.len());
        for document in documents {
            let label = document.declared_id().unwrap_or("<unknown>").to_string();
            match self.validate_document(document) {
                Ok(manifest) => {
                    if out.iter().any(|existing| existing.id == manifest.id) {
                        tracing::warn!(plugin_id = %manifest.id, "duplicate plugin id in catalog, keeping first");
                        continue;
                    }
                    out.push(manifest);
                }
                Err(err) => {
                    tracing::warn!(plugin_id = %label, origin = self.origin.as_tag(), error = %err, "skipping plugin manifest");
                }
            }
        }
        out
    }

    fn try_load_plugin_by_id(&self, id: &str) -> Result<PluginManifest, LoadError> {
        let document = self
            .source
            .manifest(id, self.origin)?
            .ok_or_else(|| LoadError::NotFound(id.to_string()))?;

        if let Some(declared) = document.declared_id() {
            self.check_authenticity(id, declared)?;
        }

        let mut manifest = document.into_manifest(self.origin.is_internal())?;
        // Under LogOnly the registry keys by the requested id.
        manifest.id = id.to_string();
        self.check_files(manifest)
    }
}
