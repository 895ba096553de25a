use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

fn strip_leading_dot_slash(mut s: String) -> String {
  while let Some(rest) = s.strip_prefix("./") {
    s = rest.to_string();
  }
  s
}

/// Normalizes a bundle-relative path, e.g. `./views\summary.html` -> `views/summary.html`.
pub fn normalize_bundle_rel_path(input: &str) -> Result<String> {
  let mut trimmed = input.trim().replace('\\', "/");
  trimmed = trimmed.trim_start_matches('/').to_string();
  trimmed = strip_leading_dot_slash(trimmed);
  if trimmed.is_empty() {
    bail!("path is required");
  }
  validate_rel_path(&trimmed)?;
  Ok(trimmed)
}

/// Plugin ids double as catalog directory names.
pub fn validate_plugin_dir_name(id: &str) -> Result<()> {
  let id = id.trim();
  if id.is_empty() {
    bail!("plugin id is required");
  }
  if id.contains('/') || id.contains('\\') || id == "." || id == ".." {
    bail!("plugin id is not a valid directory name");
  }
  Ok(())
}

fn validate_rel_path(posix: &str) -> Result<()> {
  if posix.split('/').any(|p| p.is_empty() || p == "." || p == "..") {
    bail!("invalid path");
  }
  Ok(())
}

pub fn join_inside(root: &Path, rel_posix: &str) -> Result<PathBuf> {
  // Reject traversal early.
  validate_rel_path(rel_posix)?;

  let mut out = PathBuf::from(root);
  for part in rel_posix.split('/') {
    out.push(part);
  }

  for c in out.strip_prefix(root).unwrap_or(&out).components() {
    if matches!(c, Component::ParentDir) {
      bail!("invalid path");
    }
  }

  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normalize_rejects_empty() {
    assert!(normalize_bundle_rel_path("  ").is_err());
  }

  #[test]
  fn normalize_rejects_traversal() {
    assert!(normalize_bundle_rel_path("../bg.js").is_err());
    assert!(normalize_bundle_rel_path("views/../../bg.js").is_err());
  }

  #[test]
  fn normalize_accepts_leading_dot_slash_and_backslashes() {
    assert_eq!(normalize_bundle_rel_path("./bg.js").unwrap(), "bg.js");
    assert_eq!(normalize_bundle_rel_path("/views/a.html").unwrap(), "views/a.html");
    assert_eq!(normalize_bundle_rel_path(r#"views\a.html"#).unwrap(), "views/a.html");
  }

  #[test]
  fn plugin_dir_names_reject_separators() {
    assert!(validate_plugin_dir_name("notes").is_ok());
    assert!(validate_plugin_dir_name("a/b").is_err());
    assert!(validate_plugin_dir_name("..").is_err());
    assert!(validate_plugin_dir_name("").is_err());
  }

  #[test]
  fn join_inside_builds_nested_path() {
    let root = Path::new("catalog");
    let joined = join_inside(root, "notes/bg.js").unwrap();
    assert_eq!(joined, root.join("notes").join("bg.js"));
    assert!(join_inside(root, "../x").is_err());
  }
}
