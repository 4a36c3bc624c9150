//! Local inference with candle.
//!
//! Loads Llama- and Qwen2-family causal LMs from safetensors checkpoints.
//! Remote sources are downloaded into the cache directory first.

use candle_core::{DType, Device as CandleDevice, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::{llama, qwen2};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use super::{BackendError, LoadOptions, Model, ModelLibrary, Tokenizer};
use crate::config::{Device, Precision};
use crate::download;
use crate::generation::GenerationConfig;
use crate::locator::{CONFIG_FILE, SourceDescriptor};
use crate::settings;

const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";

const DEFAULT_MAX_NEW_TOKENS: usize = 512;
const DEFAULT_SEED: u64 = 299792458;
/// Tokens considered by the repetition penalty
const REPEAT_LAST_N: usize = 64;

/// Common end-of-sequence spellings, tried when the tokenizer config has none
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|eot_id|>", "<|end|>", "<|im_end|>"];

fn candle_error(e: candle_core::Error) -> BackendError {
    BackendError::from_message(e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accelerator {
    Cuda,
    Metal,
}

pub struct CandleLibrary {
    accelerator: Option<Accelerator>,
}

impl Default for CandleLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl CandleLibrary {
    /// Detect the accelerator this build can use
    pub fn new() -> Self {
        let accelerator = if candle_core::utils::cuda_is_available() {
            Some(Accelerator::Cuda)
        } else if candle_core::utils::metal_is_available() {
            Some(Accelerator::Metal)
        } else {
            None
        };
        crate::verbose!("candle accelerator: {:?}", accelerator);
        Self { accelerator }
    }

    fn candle_device(&self, device: Device) -> Result<CandleDevice, BackendError> {
        match (device, self.accelerator) {
            (Device::Cpu, _) => Ok(CandleDevice::Cpu),
            (Device::Accelerator, Some(Accelerator::Cuda)) => {
                CandleDevice::new_cuda(0).map_err(candle_error)
            }
            (Device::Accelerator, Some(Accelerator::Metal)) => {
                CandleDevice::new_metal(0).map_err(candle_error)
            }
            (Device::Accelerator, None) => Err(BackendError::Incompatible(
                "no accelerator available in this build".to_string(),
            )),
        }
    }
}

/// Local directory holding the artifacts of a source
fn artifact_dir(source: &SourceDescriptor, options: &LoadOptions) -> Result<PathBuf, BackendError> {
    match source {
        SourceDescriptor::Local(path) => Ok(path.clone()),
        SourceDescriptor::Remote(repo_id) => {
            let cache_dir = options
                .cache_dir
                .clone()
                .unwrap_or_else(settings::default_cache_dir);
            download::ensure_snapshot(repo_id, &cache_dir)
                .map_err(|e| BackendError::MissingArtifact(format!("{:#}", e)))
        }
    }
}

fn read_artifact(path: &Path) -> Result<Vec<u8>, BackendError> {
    fs::read(path).map_err(|e| BackendError::MissingArtifact(format!("{}: {}", path.display(), e)))
}

fn dtype(precision: Precision) -> DType {
    match precision {
        Precision::Bf16 => DType::BF16,
        Precision::F16 => DType::F16,
        Precision::F32 => DType::F32,
    }
}

impl ModelLibrary for CandleLibrary {
    fn name(&self) -> &'static str {
        "candle"
    }

    fn accelerator_available(&self) -> bool {
        self.accelerator.is_some()
    }

    fn supports_precision(&self, device: Device, precision: Precision) -> bool {
        match (device, self.accelerator) {
            (Device::Cpu, _) => precision == Precision::F32,
            (Device::Accelerator, Some(Accelerator::Cuda)) => true,
            (Device::Accelerator, Some(Accelerator::Metal)) => precision != Precision::Bf16,
            (Device::Accelerator, None) => false,
        }
    }

    fn load_tokenizer(
        &self,
        source: &SourceDescriptor,
        options: &LoadOptions,
    ) -> Result<Box<dyn Tokenizer>, BackendError> {
        let dir = artifact_dir(source, options)?;
        Ok(Box::new(CandleTokenizer::from_dir(&dir)?))
    }

    fn load_model(
        &self,
        source: &SourceDescriptor,
        device: Device,
        precision: Precision,
        options: &LoadOptions,
    ) -> Result<Box<dyn Model>, BackendError> {
        if options.quantize {
            crate::verbose!("candle safetensors loading has no 4-bit path; using {}", precision);
        }
        let dir = artifact_dir(source, options)?;
        let files = download::weight_files(&dir)
            .map_err(|e| BackendError::MissingArtifact(format!("{:#}", e)))?;
        let architecture = Architecture::from_config(&read_artifact(&dir.join(CONFIG_FILE))?)?;

        let candle_device = self.candle_device(device)?;
        let weights = Weights::load(&architecture, &files, dtype(precision), &candle_device)?;

        Ok(Box::new(CandleModel {
            accelerator: self.accelerator,
            files,
            architecture,
            weights,
            candle_device,
            device,
            precision,
        }))
    }

    fn load_generation_defaults(
        &self,
        source: &SourceDescriptor,
        options: &LoadOptions,
    ) -> Option<GenerationConfig> {
        let dir = artifact_dir(source, options).ok()?;
        let content = fs::read_to_string(dir.join(GENERATION_CONFIG_FILE)).ok()?;
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&content) else {
            crate::warning!("Ignoring malformed {} in {}", GENERATION_CONFIG_FILE, dir.display());
            return None;
        };
        Some(generation_defaults(&map))
    }

    fn release_accelerator_memory(&self) {
        if let Some(accelerator) = self.accelerator
            && let Ok(device) = self.candle_device(Device::Accelerator)
            && let Err(e) = device.synchronize()
        {
            crate::verbose!("{:?} synchronize failed: {}", accelerator, e);
        }
    }
}

/// Read a `generation_config.json`, keeping every option that parses.
///
/// Checkpoints often list several eos ids; the first one is used.
fn generation_defaults(map: &Map<String, Value>) -> GenerationConfig {
    let mut defaults = GenerationConfig::default();
    for (key, value) in map {
        let value = match (key.as_str(), value) {
            ("eos_token_id", Value::Array(ids)) => ids.first().cloned().unwrap_or(Value::Null),
            _ => value.clone(),
        };
        let single = Map::from_iter([(key.clone(), value)]);
        match defaults.merge_overrides(&single) {
            Ok(merged) => defaults = merged,
            Err(e) => crate::verbose!("Skipping checkpoint generation option: {}", e),
        }
    }
    defaults
}

pub struct CandleTokenizer {
    inner: tokenizers::Tokenizer,
    eos: Option<u32>,
    pad: Option<u32>,
    unk: Option<u32>,
}

/// Token text from a tokenizer config entry (`"</s>"` or `{"content": "</s>"}`)
fn special_token(value: Option<&Value>) -> Option<&str> {
    match value? {
        Value::String(token) => Some(token),
        Value::Object(map) => map.get("content")?.as_str(),
        _ => None,
    }
}

impl CandleTokenizer {
    pub fn from_dir(dir: &Path) -> Result<Self, BackendError> {
        let path = dir.join(TOKENIZER_FILE);
        if !path.is_file() {
            return Err(BackendError::MissingArtifact(path.display().to_string()));
        }
        let inner = tokenizers::Tokenizer::from_file(&path)
            .map_err(|e| BackendError::Incompatible(format!("{}: {}", path.display(), e)))?;

        let config: Map<String, Value> = fs::read_to_string(dir.join(TOKENIZER_CONFIG_FILE))
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        let lookup = |key: &str| special_token(config.get(key)).and_then(|t| inner.token_to_id(t));

        let eos = lookup("eos_token").or_else(|| {
            EOS_CANDIDATES
                .iter()
                .find_map(|candidate| inner.token_to_id(candidate))
        });
        let pad = lookup("pad_token");
        let unk = lookup("unk_token");

        Ok(Self { inner, eos, pad, unk })
    }
}

impl Tokenizer for CandleTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, BackendError> {
        self.inner
            .encode(text, true)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|e| BackendError::Other(format!("tokenization failed: {}", e)))
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, BackendError> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| BackendError::Other(format!("decoding failed: {}", e)))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad
    }

    fn unk_token_id(&self) -> Option<u32> {
        self.unk
    }
}

enum Architecture {
    Llama(llama::Config),
    Qwen2(qwen2::Config),
}

impl Architecture {
    fn from_config(bytes: &[u8]) -> Result<Self, BackendError> {
        let incompatible = |e: serde_json::Error| BackendError::Incompatible(format!("{}: {}", CONFIG_FILE, e));
        let value: Value = serde_json::from_slice(bytes).map_err(incompatible)?;
        match value.get("model_type").and_then(Value::as_str) {
            Some("llama") | Some("mistral") => {
                let config: llama::LlamaConfig = serde_json::from_value(value).map_err(incompatible)?;
                Ok(Architecture::Llama(config.into_config(false)))
            }
            Some("qwen2") => Ok(Architecture::Qwen2(
                serde_json::from_value(value).map_err(incompatible)?,
            )),
            other => Err(BackendError::Incompatible(format!(
                "unsupported model_type {:?}; expected llama or qwen2",
                other
            ))),
        }
    }

    fn eos_tokens(&self) -> Vec<u32> {
        match self {
            Architecture::Llama(config) => match &config.eos_token_id {
                Some(llama::LlamaEosToks::Single(id)) => vec![*id],
                Some(llama::LlamaEosToks::Multiple(ids)) => ids.clone(),
                None => Vec::new(),
            },
            Architecture::Qwen2(_) => Vec::new(),
        }
    }
}

enum Weights {
    Llama {
        model: llama::Llama,
        cache: llama::Cache,
    },
    Qwen2(qwen2::ModelForCausalLM),
}

impl Weights {
    fn load(
        architecture: &Architecture,
        files: &[PathBuf],
        dtype: DType,
        device: &CandleDevice,
    ) -> Result<Self, BackendError> {
        // SAFETY: the snapshot files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(files, dtype, device) }
            .map_err(candle_error)?;
        match architecture {
            Architecture::Llama(config) => Ok(Weights::Llama {
                model: llama::Llama::load(vb, config).map_err(candle_error)?,
                cache: llama::Cache::new(true, dtype, config, device).map_err(candle_error)?,
            }),
            Architecture::Qwen2(config) => Ok(Weights::Qwen2(
                qwen2::ModelForCausalLM::new(config, vb).map_err(candle_error)?,
            )),
        }
    }

    /// Drop the kv cache left over from the previous generation
    fn reset(
        &mut self,
        architecture: &Architecture,
        dtype: DType,
        device: &CandleDevice,
    ) -> candle_core::Result<()> {
        match (self, architecture) {
            (Weights::Llama { cache, .. }, Architecture::Llama(config)) => {
                *cache = llama::Cache::new(true, dtype, config, device)?;
            }
            (Weights::Qwen2(model), _) => model.clear_kv_cache(),
            (Weights::Llama { .. }, _) => {}
        }
        Ok(())
    }

    /// Logits for the last position, as a 1-D f32 tensor
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        let logits = match self {
            Weights::Llama { model, cache } => model.forward(input, index_pos, cache)?.squeeze(0)?,
            Weights::Qwen2(model) => model.forward(input, index_pos)?.squeeze(0)?.squeeze(0)?,
        };
        logits.to_dtype(DType::F32)
    }
}

pub struct CandleModel {
    accelerator: Option<Accelerator>,
    files: Vec<PathBuf>,
    architecture: Architecture,
    weights: Weights,
    candle_device: CandleDevice,
    device: Device,
    precision: Precision,
}

/// Logits with `ids` made unselectable
fn suppress_tokens(logits: &Tensor, ids: &[u32]) -> candle_core::Result<Tensor> {
    let mut values = logits.to_vec1::<f32>()?;
    for &id in ids {
        if let Some(value) = values.get_mut(id as usize) {
            *value = f32::NEG_INFINITY;
        }
    }
    Tensor::new(values.as_slice(), logits.device())
}

/// Sampling strategy for a generation config
fn sampling(config: &GenerationConfig) -> Sampling {
    let temperature = config.temperature.unwrap_or(1.0);
    if !config.sampling_enabled() || temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    match (config.top_k, config.top_p) {
        (None, None) => Sampling::All { temperature },
        (Some(k), None) => Sampling::TopK { k, temperature },
        (None, Some(p)) => Sampling::TopP { p, temperature },
        (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
    }
}

impl Model for CandleModel {
    fn device(&self) -> Device {
        self.device
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn generate(
        &mut self,
        input_ids: &[u32],
        config: &GenerationConfig,
    ) -> Result<Vec<u32>, BackendError> {
        if input_ids.is_empty() {
            return Err(BackendError::Other("empty prompt".to_string()));
        }

        let max_new_tokens = config.max_new_tokens.unwrap_or(DEFAULT_MAX_NEW_TOKENS);
        let min_new_tokens = config.min_new_tokens.unwrap_or(0);
        let penalty = config.repetition_penalty.unwrap_or(1.0);
        let mut eos = self.architecture.eos_tokens();
        eos.extend(config.eos_token_id);

        let mut sampler = LogitsProcessor::from_sampling(config.seed.unwrap_or(DEFAULT_SEED), sampling(config));
        self.weights
            .reset(&self.architecture, dtype(self.precision), &self.candle_device)
            .map_err(candle_error)?;

        let mut tokens = input_ids.to_vec();
        let mut generated = Vec::new();

        for step in 0..max_new_tokens {
            // Whole prompt first, then one token at a time against the kv cache
            let index_pos = if step == 0 { 0 } else { tokens.len() - 1 };
            let input = Tensor::new(&tokens[index_pos..], &self.candle_device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(candle_error)?;
            let mut logits = self.weights.forward(&input, index_pos).map_err(candle_error)?;

            if penalty != 1.0 {
                let start = tokens.len().saturating_sub(REPEAT_LAST_N);
                logits = candle_transformers::utils::apply_repeat_penalty(&logits, penalty, &tokens[start..])
                    .map_err(candle_error)?;
            }
            if generated.len() < min_new_tokens {
                logits = suppress_tokens(&logits, &eos).map_err(candle_error)?;
            }

            let next = sampler.sample(&logits).map_err(candle_error)?;
            if eos.contains(&next) {
                break;
            }
            tokens.push(next);
            generated.push(next);
        }

        Ok(generated)
    }

    fn move_to(&mut self, device: Device, precision: Precision) -> Result<(), BackendError> {
        let library = CandleLibrary {
            accelerator: self.accelerator,
        };
        let candle_device = library.candle_device(device)?;
        let dtype = dtype(precision);

        // Candle tensors cannot be re-homed in place; remap the weights
        let weights = Weights::load(&self.architecture, &self.files, dtype, &candle_device)?;
        self.weights = weights;
        self.candle_device = candle_device;
        self.device = device;
        self.precision = precision;
        Ok(())
    }
}
