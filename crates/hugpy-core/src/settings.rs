//! Configuration table mapping logical model names to artifact sources.
//!
//! Loaded once at process start from `<config_dir>/hugpy/settings.json`
//! (or `$HUGPY_SETTINGS`). A missing or unreadable file yields the built-in
//! defaults; `save()` is the only fallible operation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{Device, Precision};
use crate::error::{HandleError, Result};
use crate::generation::GenerationConfig;

pub const SETTINGS_ENV_VAR: &str = "HUGPY_SETTINGS";
pub const CACHE_DIR_ENV_VAR: &str = "HUGPY_CACHE_DIR";
pub const DEVICE_ENV_VAR: &str = "HUGPY_DEVICE";

/// Built-in table: (name, local directory name, remote repo id)
///
/// ZeroSearch is only published as a dataset, so it has no model repo and
/// resolves only once a local checkout exists.
const DEFAULT_MODELS: &[(&str, &str, Option<&str>)] = &[
    ("whisper", "whisper_base", Some("openai/whisper-base")),
    ("keybert", "all_minilm_l6_v2", Some("sentence-transformers/all-MiniLM-L6-v2")),
    ("summarizer", "text_summarization", Some("Falconsai/text_summarization")),
    ("flan", "flan_t5_xl", Some("google/flan-t5-xl")),
    ("bigbird", "led_large_16384", Some("allenai/led-large-16384")),
    ("deepcoder", "DeepCoder-14B", Some("agentica-org/DeepCoder-14B-Preview")),
    ("zerosearch", "ZeroSearch", None),
];

/// One row of the configuration table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    /// Local directory holding `config.json` and weights
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Remote repository id (`namespace/repo`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,

    /// Device override for this model only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,

    /// Precision override for this model only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<Precision>,

    /// Generation defaults layered over the ones shipped with the model
    #[serde(default, skip_serializing_if = "GenerationConfig::is_empty")]
    pub generation: GenerationConfig,
}

impl ModelEntry {
    pub fn remote(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: Some(repo_id.into()),
            ..Default::default()
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_repo_id(mut self, repo_id: impl Into<String>) -> Self {
        self.repo_id = Some(repo_id.into());
        self
    }

    /// True when neither a path nor a repo id is configured
    pub fn is_unresolvable(&self) -> bool {
        self.path.is_none() && self.repo_id.as_deref().is_none_or(str::is_empty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Logical model name -> source
    #[serde(default = "default_models")]
    pub models: BTreeMap<String, ModelEntry>,

    /// Where remote repositories are downloaded to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Prefer a valid local directory over the remote repo id
    #[serde(default = "default_prefer_local")]
    pub prefer_local: bool,

    /// Process-wide device override (auto-detect when None)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,

    /// Process-wide precision override (auto-select when None)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<Precision>,

    /// Request 4-bit weights on the accelerator when the library supports it
    #[serde(default)]
    pub use_quantization: bool,
}

fn default_prefer_local() -> bool {
    true
}

/// Default directory holding local model checkouts
pub fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hugpy")
        .join("models")
}

/// Default directory for downloaded repositories
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hugpy")
        .join("hub")
}

fn default_models() -> BTreeMap<String, ModelEntry> {
    let models_dir = default_models_dir();
    DEFAULT_MODELS
        .iter()
        .map(|(name, dir, repo)| {
            let mut entry = ModelEntry::local(models_dir.join(dir));
            entry.repo_id = repo.map(str::to_string);
            (name.to_string(), entry)
        })
        .collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            models: default_models(),
            cache_dir: None,
            prefer_local: true,
            device: None,
            precision: None,
            use_quantization: false,
        }
    }
}

impl Settings {
    /// Settings with an explicit table and otherwise default options
    pub fn with_models(models: BTreeMap<String, ModelEntry>) -> Self {
        Self {
            models,
            ..Default::default()
        }
    }

    /// Path of the settings file
    pub fn path() -> PathBuf {
        if let Ok(path) = std::env::var(SETTINGS_ENV_VAR)
            && !path.is_empty()
        {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hugpy")
            .join("settings.json")
    }

    /// Load settings from the default location, falling back to defaults
    pub fn load() -> Self {
        let mut settings = Self::load_from(&Self::path()).unwrap_or_else(|e| {
            crate::verbose!("Using default settings ({})", e);
            Self::default()
        });
        settings.apply_env();
        settings
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| HandleError::Settings(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| HandleError::Settings(format!("{}: {}", path.display(), e)))
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| HandleError::Settings(format!("{}: {}", parent.display(), e)))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| HandleError::Settings(e.to_string()))?;
        fs::write(path, content)
            .map_err(|e| HandleError::Settings(format!("{}: {}", path.display(), e)))
    }

    /// Environment variables win over the file
    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV_VAR)
            && !dir.is_empty()
        {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Ok(device) = std::env::var(DEVICE_ENV_VAR) {
            match device.parse::<Device>() {
                Ok(device) => self.device = Some(device),
                Err(e) => crate::warning!("Ignoring {}: {}", DEVICE_ENV_VAR, e),
            }
        }
    }

    /// Effective cache directory for downloaded repositories
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn model(&self, name: &str) -> Option<&ModelEntry> {
        self.models.get(name)
    }

    /// Insert or update the local path for a model
    pub fn set_model_path(&mut self, name: &str, path: impl Into<PathBuf>) {
        self.models.entry(name.to_string()).or_default().path = Some(path.into());
    }

    /// Insert or update the remote repo id for a model
    pub fn set_model_repo(&mut self, name: &str, repo_id: impl Into<String>) {
        self.models.entry(name.to_string()).or_default().repo_id = Some(repo_id.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_known_models() {
        let settings = Settings::default();
        let deepcoder = settings.model("deepcoder").unwrap();
        assert_eq!(
            deepcoder.repo_id.as_deref(),
            Some("agentica-org/DeepCoder-14B-Preview")
        );
        assert!(deepcoder.path.as_ref().unwrap().ends_with("DeepCoder-14B"));
        assert!(settings.prefer_local);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::with_models(BTreeMap::new());
        settings.set_model_repo("demo", "acme/demo-1b");
        settings.device = Some(Device::Cpu);
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"models": {"demo": {"repo_id": "acme/demo"}}}"#).unwrap();
        assert!(settings.prefer_local);
        assert!(!settings.use_quantization);
        assert_eq!(settings.models.len(), 1);
    }

    #[test]
    fn test_unresolvable_entry() {
        assert!(ModelEntry::default().is_unresolvable());
        assert!(ModelEntry::remote("").is_unresolvable());
        assert!(!ModelEntry::remote("acme/demo").is_unresolvable());
    }
}
