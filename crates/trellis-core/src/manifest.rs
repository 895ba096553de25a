use crate::capability::Capabilities;
use crate::error::LoadError;
use crate::paths::normalize_bundle_rel_path;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Summary,
    Expand,
}

impl ViewKind {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Expand => "expand",
        }
    }
}

impl std::fmt::Display for ViewKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Which kind of isolated context a sandbox hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    Background,
    View(ViewKind),
}

impl SurfaceKind {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::View(kind) => kind.as_tag(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub entry_point: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEntries {
    pub summary: Option<EntryPoint>,
    pub expand: Option<EntryPoint>,
}

/// Validated plugin manifest. Only produced by [`ManifestDocument::into_manifest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub is_internal: bool,
    #[serde(default)]
    pub requested_capabilities: Capabilities,
    #[serde(default)]
    pub background: Option<EntryPoint>,
    #[serde(default)]
    pub view: ViewEntries,
}

impl PluginManifest {
    pub fn background_entry(&self) -> Option<&str> {
        self.background.as_ref().map(|b| b.entry_point.as_str())
    }

    pub fn view_entry(&self, kind: ViewKind) -> Option<&str> {
        let entry = match kind {
            ViewKind::Summary => self.view.summary.as_ref(),
            ViewKind::Expand => self.view.expand.as_ref(),
        };
        entry.map(|e| e.entry_point.as_str())
    }

    pub fn entry_for(&self, surface: SurfaceKind) -> Option<&str> {
        match surface {
            SurfaceKind::Background => self.background_entry(),
            SurfaceKind::View(kind) => self.view_entry(kind),
        }
    }

    /// All declared entry points, background first.
    pub fn entry_points(&self) -> Vec<&str> {
        [
            self.background_entry(),
            self.view_entry(ViewKind::Summary),
            self.view_entry(ViewKind::Expand),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn is_inert(&self) -> bool {
        self.entry_points().is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDocument {
    #[serde(default)]
    pub entry_point: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDocument {
    #[serde(default)]
    pub summary: Option<SectionDocument>,
    #[serde(default)]
    pub expand: Option<SectionDocument>,
}

/// Manifest as fetched from a catalog, before any validation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub requested_capabilities: Capabilities,
    #[serde(default)]
    pub background: Option<SectionDocument>,
    #[serde(default)]
    pub view: Option<ViewDocument>,
}

impl ManifestDocument {
    pub fn declared_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    /// Checks required fields and entry point sections. `is_internal` comes from the
    /// catalog the document was read from, never from the document itself.
    pub fn into_manifest(self, is_internal: bool) -> Result<PluginManifest, LoadError> {
        let id = required(self.id, "<unknown>", "id")?;
        let name = required(self.name, &id, "name")?;
        let version = required(self.version, &id, "version")?;

        let background = section_entry(&id, self.background, "background")?;
        let view = self.view.unwrap_or_default();
        let summary = section_entry(&id, view.summary, "view.summary")?;
        let expand = section_entry(&id, view.expand, "view.expand")?;

        Ok(PluginManifest {
            id,
            name,
            version,
            is_internal,
            requested_capabilities: self.requested_capabilities,
            background,
            view: ViewEntries { summary, expand },
        })
    }
}

fn required(
    value: Option<String>,
    plugin_id: &str,
    field: &'static str,
) -> Result<String, LoadError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LoadError::MissingField {
            plugin_id: plugin_id.to_string(),
            field,
        })
}

fn section_entry(
    plugin_id: &str,
    section: Option<SectionDocument>,
    name: &'static str,
) -> Result<Option<EntryPoint>, LoadError> {
    let Some(section) = section else {
        return Ok(None);
    };

    let raw = section
        .entry_point
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| LoadError::EmptyEntryPoint {
            plugin_id: plugin_id.to_string(),
            section: name,
        })?;

    let entry_point =
        normalize_bundle_rel_path(&raw).map_err(|err| LoadError::InvalidEntryPoint {
            plugin_id: plugin_id.to_string(),
            path: raw.clone(),
            message: err.to_string(),
        })?;

    Ok(Some(EntryPoint { entry_point }))
}
