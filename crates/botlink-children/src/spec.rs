//! Child declarations (`subbot.json`) and discovery.
//!
//! Each child lives in its own directory under the children root. A
//! declaration is accepted only when `name`, `version` and `description`
//! are present and non-empty and `name` matches the directory name.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{ChildError, Result};

/// Declaration file name inside each child directory.
pub const DECLARATION_FILE: &str = "subbot.json";

/// Entry point used when the declaration does not name one.
pub const DEFAULT_ENTRY_POINT: &str = "main.py";

/// A validated child declaration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChildSpec {
    /// Unique name; equals the directory name.
    pub name: String,
    /// Child version string.
    pub version: String,
    /// Human-readable description.
    pub description: String,
    /// Author, if declared.
    pub author: String,
    /// Launch target relative to `dir`.
    pub entry_point: String,
    /// Launch automatically at boot.
    pub startup: bool,
    /// Comparator ranges the manager version must satisfy.
    pub compatible_versions: Vec<String>,
    /// Directory the declaration was read from.
    pub dir: PathBuf,
}

impl ChildSpec {
    /// Absolute (or root-relative) path of the entry point.
    pub fn entry_path(&self) -> PathBuf {
        self.dir.join(&self.entry_point)
    }
}

/// Raw file shape; every field optional so validation can name what's missing.
#[derive(Debug, Deserialize)]
struct Declaration {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    entry_point: Option<String>,
    #[serde(default)]
    startup: Option<bool>,
    #[serde(default)]
    compatible_versions: Option<Vec<String>>,
}

/// Read and validate the declaration in `dir`.
pub fn load_spec(dir: &Path) -> Result<ChildSpec> {
    let path = dir.join(DECLARATION_FILE);
    let invalid = |message: String| ChildError::InvalidDeclaration {
        path: path.clone(),
        message,
    };

    let content = std::fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
    let decl: Declaration = serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;

    let required = |value: Option<String>, field: &str| {
        value
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| invalid(format!("missing required field `{field}`")))
    };
    let name = required(decl.name, "name")?;
    let version = required(decl.version, "version")?;
    let description = required(decl.description, "description")?;

    let dir_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if name != dir_name {
        return Err(invalid(format!(
            "name `{name}` does not match directory `{dir_name}`"
        )));
    }

    Ok(ChildSpec {
        name,
        version,
        description,
        author: decl.author.unwrap_or_default(),
        entry_point: decl
            .entry_point
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string()),
        startup: decl.startup.unwrap_or(false),
        compatible_versions: decl.compatible_versions.unwrap_or_default(),
        dir: dir.to_path_buf(),
    })
}

/// Scan `root` for child directories, sorted by directory name.
///
/// Directories without a declaration are skipped quietly; invalid
/// declarations are skipped with a warning. A missing root yields nothing.
pub fn discover_specs(root: &Path) -> Vec<ChildSpec> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %root.display(), error = %e, "children directory unreadable");
            return Vec::new();
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    dirs.into_iter()
        .filter(|dir| {
            let has_decl = dir.join(DECLARATION_FILE).is_file();
            if !has_decl {
                debug!(dir = %dir.display(), "no declaration, skipping");
            }
            has_decl
        })
        .filter_map(|dir| match load_spec(&dir) {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!(error = %e, "skipping child");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn write_child(root: &Path, dir: &str, json: &str) -> PathBuf {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(DECLARATION_FILE), json).unwrap();
        path
    }

    #[test]
    fn loads_full_declaration() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_child(
            root.path(),
            "echo",
            r#"{
                "name": "echo", "version": "1.0.0", "description": "echoes",
                "author": "someone", "entry_point": "run.sh", "startup": true,
                "compatible_versions": [">=1.0.0"]
            }"#,
        );
        let spec = load_spec(&dir).unwrap();
        assert_eq!(spec.name, "echo");
        assert_eq!(spec.author, "someone");
        assert!(spec.startup);
        assert_eq!(spec.compatible_versions, vec![">=1.0.0".to_string()]);
        assert_eq!(spec.entry_path(), dir.join("run.sh"));
    }

    #[test]
    fn optional_fields_default() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_child(
            root.path(),
            "min",
            r#"{"name": "min", "version": "0.1", "description": "minimal"}"#,
        );
        let spec = load_spec(&dir).unwrap();
        assert_eq!(spec.entry_point, DEFAULT_ENTRY_POINT);
        assert!(!spec.startup);
        assert!(spec.compatible_versions.is_empty());
        assert!(spec.author.is_empty());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_child(root.path(), "bad", r#"{"name": "bad", "version": "1"}"#);
        assert_matches!(
            load_spec(&dir),
            Err(ChildError::InvalidDeclaration { message, .. }) if message.contains("description")
        );
    }

    #[test]
    fn blank_required_field_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_child(
            root.path(),
            "blank",
            r#"{"name": "blank", "version": " ", "description": "x"}"#,
        );
        assert!(load_spec(&dir).is_err());
    }

    #[test]
    fn name_must_match_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_child(
            root.path(),
            "actual",
            r#"{"name": "other", "version": "1", "description": "x"}"#,
        );
        assert_matches!(
            load_spec(&dir),
            Err(ChildError::InvalidDeclaration { message, .. }) if message.contains("does not match")
        );
    }

    #[test]
    fn discovery_is_sorted_and_skips_bad_children() {
        let root = tempfile::tempdir().unwrap();
        let _ = write_child(root.path(), "zeta", r#"{"name": "zeta", "version": "1", "description": "z"}"#);
        let _ = write_child(root.path(), "alpha", r#"{"name": "alpha", "version": "1", "description": "a"}"#);
        let _ = write_child(root.path(), "broken", "{ nope");
        std::fs::create_dir_all(root.path().join("empty")).unwrap();
        std::fs::write(root.path().join("stray.txt"), "x").unwrap();

        let names: Vec<_> = discover_specs(root.path()).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn missing_root_discovers_nothing() {
        let root = tempfile::tempdir().unwrap();
        assert!(discover_specs(&root.path().join("nope")).is_empty());
    }
}
