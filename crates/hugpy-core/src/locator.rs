//! Resolve logical model names to artifact sources.
//!
//! A configured local directory wins when it holds at least `config.json`;
//! otherwise the remote repository id is used. Exactly one of the two is
//! ever returned.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{HandleError, Result};
use crate::settings::ModelEntry;

/// File every usable model directory must contain
pub const CONFIG_FILE: &str = "config.json";

/// Concrete place to load a model from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "location", rename_all = "lowercase")]
pub enum SourceDescriptor {
    Local(PathBuf),
    Remote(String),
}

impl SourceDescriptor {
    pub fn is_local(&self) -> bool {
        matches!(self, SourceDescriptor::Local(_))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            SourceDescriptor::Local(path) => Some(path),
            SourceDescriptor::Remote(_) => None,
        }
    }

    pub fn remote_id(&self) -> Option<&str> {
        match self {
            SourceDescriptor::Local(_) => None,
            SourceDescriptor::Remote(id) => Some(id),
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Local(path) => write!(f, "{}", path.display()),
            SourceDescriptor::Remote(id) => write!(f, "{}", id),
        }
    }
}

/// Check that a directory holds the minimum artifact set
pub fn is_model_dir(path: &Path) -> bool {
    path.is_dir() && path.join(CONFIG_FILE).is_file()
}

/// Check the `namespace/repo` shape of a remote id
pub fn is_valid_repo_id(id: &str) -> bool {
    let mut parts = id.split('/');
    let (Some(namespace), Some(repo), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let valid = |part: &str| {
        !part.is_empty()
            && !part.starts_with('.')
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    valid(namespace) && valid(repo)
}

/// Resolve a configured model name.
///
/// Fails with a configuration error when the name is unknown or nothing
/// configured for it is usable.
pub fn resolve(
    name: &str,
    models: &BTreeMap<String, ModelEntry>,
    prefer_local: bool,
) -> Result<SourceDescriptor> {
    let entry = models
        .get(name)
        .ok_or_else(|| HandleError::configuration(name, "no such model in configuration"))?;
    resolve_entry(name, entry, prefer_local)
}

/// Resolve a single configuration row
pub fn resolve_entry(name: &str, entry: &ModelEntry, prefer_local: bool) -> Result<SourceDescriptor> {
    if entry.is_unresolvable() {
        return Err(HandleError::configuration(
            name,
            "neither a local path nor a remote repo id is configured",
        ));
    }

    let local = entry.path.as_deref().filter(|path| is_model_dir(path));

    if prefer_local && let Some(path) = local {
        crate::verbose!("Resolved '{}' to local directory {}", name, path.display());
        return Ok(SourceDescriptor::Local(path.to_path_buf()));
    }

    if let Some(repo_id) = entry.repo_id.as_deref().filter(|id| !id.is_empty()) {
        if !is_valid_repo_id(repo_id) {
            return Err(HandleError::configuration(
                name,
                format!("'{}' is not a namespace/repo id", repo_id),
            ));
        }
        crate::verbose!("Resolved '{}' to remote repo {}", name, repo_id);
        return Ok(SourceDescriptor::Remote(repo_id.to_string()));
    }

    // Only reachable when local is not preferred and no repo id exists
    if let Some(path) = local {
        return Ok(SourceDescriptor::Local(path.to_path_buf()));
    }

    let path = entry.path.as_deref().map(Path::display);
    Err(HandleError::configuration(
        name,
        format!(
            "local path {} does not contain {} and no remote repo id is configured",
            path.map(|p| p.to_string()).unwrap_or_default(),
            CONFIG_FILE
        ),
    ))
}

/// Resolve an explicit source string, bypassing the configuration table.
///
/// An existing directory is a local source, `namespace/repo` is remote.
pub fn resolve_explicit(source: &str) -> Result<SourceDescriptor> {
    let path = Path::new(source);
    if path.is_dir() {
        if !is_model_dir(path) {
            return Err(HandleError::configuration(
                source,
                format!("directory does not contain {}", CONFIG_FILE),
            ));
        }
        return Ok(SourceDescriptor::Local(path.to_path_buf()));
    }
    if is_valid_repo_id(source) {
        return Ok(SourceDescriptor::Remote(source.to_string()));
    }
    Err(HandleError::configuration(
        source,
        "not an existing directory or a namespace/repo id",
    ))
}
