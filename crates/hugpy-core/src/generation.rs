//! Generation options and requests.
//!
//! Callers pass overrides as a loose JSON object (that is what an HTTP layer
//! hands over). Only the recognized option names below are merged onto a
//! handle's defaults; everything else is dropped without error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HandleError, Result};

/// Option names accepted by [`GenerationConfig::merge_overrides`].
pub const RECOGNIZED_KEYS: &[&str] = &[
    "max_new_tokens",
    "min_new_tokens",
    "temperature",
    "top_p",
    "top_k",
    "num_beams",
    "length_penalty",
    "repetition_penalty",
    "no_repeat_ngram_size",
    "do_sample",
    "early_stopping",
    "eos_token_id",
    "pad_token_id",
    "bos_token_id",
    "num_return_sequences",
    "return_dict_in_generate",
    "output_scores",
    "use_cache",
    "seed",
];

/// Generation options. Unset fields defer to the model library's behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_new_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_beams: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_repeat_ngram_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_sample: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stopping: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pad_token_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bos_token_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_return_sequences: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_dict_in_generate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_scores: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_cache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GenerationConfig {
    /// Defaults used when a checkpoint ships no `generation_config.json`
    pub fn fallback() -> Self {
        Self {
            max_new_tokens: Some(512),
            temperature: Some(0.7),
            top_p: Some(0.9),
            do_sample: Some(true),
            repetition_penalty: Some(1.1),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Layer every set field of `other` over `self`
    pub fn layered(mut self, other: &GenerationConfig) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            max_new_tokens,
            min_new_tokens,
            temperature,
            top_p,
            top_k,
            num_beams,
            length_penalty,
            repetition_penalty,
            no_repeat_ngram_size,
            do_sample,
            early_stopping,
            eos_token_id,
            pad_token_id,
            bos_token_id,
            num_return_sequences,
            return_dict_in_generate,
            output_scores,
            use_cache,
            seed
        );
        self
    }

    /// Merge caller overrides onto these defaults.
    ///
    /// Unrecognized keys are dropped. A recognized key whose value cannot be
    /// converted to the option's type is rejected; `null` leaves the default
    /// untouched.
    pub fn merge_overrides(&self, overrides: &Map<String, Value>) -> Result<Self> {
        let mut recognized = Map::new();
        for (key, value) in overrides {
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                crate::verbose!("Dropping unrecognized generation option '{}'", key);
                continue;
            }
            if value.is_null() {
                continue;
            }
            let parsed: GenerationConfig =
                serde_json::from_value(Value::Object(Map::from_iter([(
                    key.clone(),
                    value.clone(),
                )])))
                .map_err(|e| HandleError::InvalidOverride {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            validate(key, &parsed)?;
            recognized.insert(key.clone(), value.clone());
        }

        let overrides: GenerationConfig = serde_json::from_value(Value::Object(recognized))
            .map_err(|e| HandleError::InvalidOverride {
                key: "<overrides>".to_string(),
                reason: e.to_string(),
            })?;
        Ok(self.clone().layered(&overrides))
    }

    /// Configuration actually handed to the model.
    ///
    /// Deterministic decoding ignores temperature and top-p, so they are
    /// removed when sampling is off.
    pub fn effective(&self) -> Self {
        let mut config = self.clone();
        if !config.sampling_enabled() {
            config.temperature = None;
            config.top_p = None;
        }
        config
    }

    pub fn sampling_enabled(&self) -> bool {
        self.do_sample.unwrap_or(false)
    }

    /// JSON view, with unset options omitted
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

fn validate(key: &str, parsed: &GenerationConfig) -> Result<()> {
    let invalid = |reason: &str| HandleError::InvalidOverride {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if let Some(t) = parsed.temperature
        && (!t.is_finite() || t < 0.0)
    {
        return Err(invalid("temperature must be a non-negative number"));
    }
    if let Some(p) = parsed.top_p
        && !(p > 0.0 && p <= 1.0)
    {
        return Err(invalid("top_p must be in (0, 1]"));
    }
    if let Some(r) = parsed.repetition_penalty
        && (!r.is_finite() || r <= 0.0)
    {
        return Err(invalid("repetition_penalty must be positive"));
    }
    Ok(())
}

/// One turn of a chat conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

fn default_role() -> String {
    "user".to_string()
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }
}

/// Input of a generation call
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationRequest {
    Prompt(String),
    Messages(Vec<ChatMessage>),
}

impl From<&str> for GenerationRequest {
    fn from(prompt: &str) -> Self {
        GenerationRequest::Prompt(prompt.to_string())
    }
}

impl From<String> for GenerationRequest {
    fn from(prompt: String) -> Self {
        GenerationRequest::Prompt(prompt)
    }
}

impl From<Vec<ChatMessage>> for GenerationRequest {
    fn from(messages: Vec<ChatMessage>) -> Self {
        GenerationRequest::Messages(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn overrides(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_deterministic_drops_sampling_knobs() {
        let defaults = GenerationConfig::fallback();
        let merged = defaults
            .merge_overrides(&overrides(json!({"do_sample": false, "temperature": 0.9})))
            .unwrap();
        assert_eq!(merged.temperature, Some(0.9));

        let effective = merged.effective().to_map();
        assert!(!effective.contains_key("temperature"));
        assert!(!effective.contains_key("top_p"));
        assert_eq!(effective.get("do_sample"), Some(&json!(false)));
        assert_eq!(effective.get("max_new_tokens"), Some(&json!(512)));
    }

    #[test]
    fn test_sampling_keeps_knobs() {
        let merged = GenerationConfig::default()
            .merge_overrides(&overrides(json!({"do_sample": true, "top_p": 0.5})))
            .unwrap();
        let effective = merged.effective();
        assert_eq!(effective.top_p, Some(0.5));
    }

    #[test]
    fn test_unrecognized_keys_dropped() {
        let merged = GenerationConfig::fallback()
            .merge_overrides(&overrides(json!({
                "max_new_tokens": 16,
                "cache_dir": "/tmp",
                "trust_remote_code": true,
            })))
            .unwrap();
        assert_eq!(merged.max_new_tokens, Some(16));
        assert_eq!(merged.to_map().len(), GenerationConfig::fallback().to_map().len());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let err = GenerationConfig::default()
            .merge_overrides(&overrides(json!({"max_new_tokens": "lots"})))
            .unwrap_err();
        assert!(matches!(err, HandleError::InvalidOverride { ref key, .. } if key == "max_new_tokens"));

        let err = GenerationConfig::default()
            .merge_overrides(&overrides(json!({"top_p": 1.5})))
            .unwrap_err();
        assert!(matches!(err, HandleError::InvalidOverride { .. }));
    }

    #[test]
    fn test_null_keeps_default() {
        let merged = GenerationConfig::fallback()
            .merge_overrides(&overrides(json!({"temperature": null})))
            .unwrap();
        assert_eq!(merged.temperature, Some(0.7));
    }

    #[test]
    fn test_layered_prefers_other() {
        let base = GenerationConfig::fallback();
        let top = GenerationConfig {
            max_new_tokens: Some(1000),
            ..Default::default()
        };
        let layered = base.layered(&top);
        assert_eq!(layered.max_new_tokens, Some(1000));
        assert_eq!(layered.top_p, Some(0.9));
    }
}
