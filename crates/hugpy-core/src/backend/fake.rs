//! In-memory model library for tests.
//!
//! Token ids are bytes shifted by [`BYTE_OFFSET`]; ids below the offset are
//! special tokens. The model echoes its input between BOS and EOS, so a
//! successful generation decodes back to the prompt.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{BackendError, LoadOptions, Model, ModelLibrary, Tokenizer};
use crate::config::{Device, Precision};
use crate::generation::GenerationConfig;
use crate::locator::SourceDescriptor;

pub const BOS: u32 = 1;
pub const EOS: u32 = 2;
pub const UNK: u32 = 3;
pub const BYTE_OFFSET: u32 = 10;

/// Counters and knobs shared between a library and everything it loads
#[derive(Debug, Default)]
pub struct FakeState {
    pub tokenizer_loads: AtomicUsize,
    pub model_loads: AtomicUsize,
    pub generations: AtomicUsize,
    pub moves: AtomicUsize,
    pub releases: AtomicUsize,
    /// Value of `moves` when memory was last released
    pub moves_at_release: AtomicUsize,
    pub quantization_queries: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Remaining accelerator generations that fail with OOM
    pub oom_on_accelerator: AtomicUsize,
    pub oom_on_cpu: AtomicBool,
    pub fail_load: AtomicBool,
    pub last_config: Mutex<Option<GenerationConfig>>,
    pub last_input: Mutex<Vec<u32>>,
}

impl FakeState {
    pub fn load_count(&self) -> usize {
        self.model_loads.load(Ordering::SeqCst)
    }
}

pub struct FakeLibrary {
    pub state: Arc<FakeState>,
    accelerator: bool,
    bf16: bool,
    quantization: bool,
    eos: Option<u32>,
    unk: Option<u32>,
    load_delay: Duration,
    generate_delay: Duration,
    defaults: Option<GenerationConfig>,
}

impl FakeLibrary {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FakeState::default()),
            accelerator: true,
            bf16: true,
            quantization: false,
            eos: Some(EOS),
            unk: None,
            load_delay: Duration::ZERO,
            generate_delay: Duration::ZERO,
            defaults: None,
        }
    }

    pub fn without_accelerator(mut self) -> Self {
        self.accelerator = false;
        self
    }

    pub fn without_bf16(mut self) -> Self {
        self.bf16 = false;
        self
    }

    pub fn with_quantization(mut self) -> Self {
        self.quantization = true;
        self
    }

    /// Tokenizer special tokens; no pad token is ever defined
    pub fn with_special_tokens(mut self, eos: Option<u32>, unk: Option<u32>) -> Self {
        self.eos = eos;
        self.unk = unk;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_generate_delay(mut self, delay: Duration) -> Self {
        self.generate_delay = delay;
        self
    }

    pub fn with_defaults(mut self, defaults: GenerationConfig) -> Self {
        self.defaults = Some(defaults);
        self
    }

    pub fn state(&self) -> Arc<FakeState> {
        self.state.clone()
    }
}

impl ModelLibrary for FakeLibrary {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn accelerator_available(&self) -> bool {
        self.accelerator
    }

    fn supports_precision(&self, device: Device, precision: Precision) -> bool {
        match (device, precision) {
            (Device::Accelerator, Precision::Bf16) => self.bf16,
            (Device::Accelerator, _) => true,
            (Device::Cpu, Precision::F32) => true,
            (Device::Cpu, _) => false,
        }
    }

    fn supports_quantization(&self) -> bool {
        self.state.quantization_queries.fetch_add(1, Ordering::SeqCst);
        self.quantization
    }

    fn load_tokenizer(
        &self,
        _source: &SourceDescriptor,
        _options: &LoadOptions,
    ) -> Result<Box<dyn Tokenizer>, BackendError> {
        self.state.tokenizer_loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTokenizer {
            eos: self.eos,
            unk: self.unk,
        }))
    }

    fn load_model(
        &self,
        source: &SourceDescriptor,
        device: Device,
        precision: Precision,
        _options: &LoadOptions,
    ) -> Result<Box<dyn Model>, BackendError> {
        thread::sleep(self.load_delay);
        if self.state.fail_load.load(Ordering::SeqCst) {
            return Err(BackendError::MissingArtifact(format!(
                "{}/model.safetensors",
                source
            )));
        }
        self.state.model_loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeModel {
            state: self.state.clone(),
            device,
            precision,
            delay: self.generate_delay,
        }))
    }

    fn load_generation_defaults(
        &self,
        _source: &SourceDescriptor,
        _options: &LoadOptions,
    ) -> Option<GenerationConfig> {
        self.defaults.clone()
    }

    fn release_accelerator_memory(&self) {
        let moves = self.state.moves.load(Ordering::SeqCst);
        self.state.moves_at_release.store(moves, Ordering::SeqCst);
        self.state.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeTokenizer {
    eos: Option<u32>,
    unk: Option<u32>,
}

impl Tokenizer for FakeTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, BackendError> {
        Ok(text.bytes().map(|b| b as u32 + BYTE_OFFSET).collect())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, BackendError> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            if id < BYTE_OFFSET {
                if !skip_special_tokens {
                    bytes.extend_from_slice(format!("<{}>", id).as_bytes());
                }
                continue;
            }
            bytes.push((id - BYTE_OFFSET) as u8);
        }
        String::from_utf8(bytes).map_err(|e| BackendError::Other(e.to_string()))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos
    }

    fn unk_token_id(&self) -> Option<u32> {
        self.unk
    }
}

pub struct FakeModel {
    state: Arc<FakeState>,
    device: Device,
    precision: Precision,
    delay: Duration,
}

impl Model for FakeModel {
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
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        *self.state.last_config.lock().unwrap() = Some(config.clone());
        *self.state.last_input.lock().unwrap() = input_ids.to_vec();

        let exhausted = match self.device {
            Device::Accelerator => self
                .state
                .oom_on_accelerator
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
            Device::Cpu => self.state.oom_on_cpu.load(Ordering::SeqCst),
        };
        if exhausted {
            return Err(BackendError::from_message(format!(
                "{} out of memory. Tried to allocate 2.00 GiB",
                self.device
            )));
        }

        self.state.generations.fetch_add(1, Ordering::SeqCst);
        let mut output = vec![BOS];
        output.extend_from_slice(input_ids);
        output.push(EOS);
        Ok(output)
    }

    fn move_to(&mut self, device: Device, precision: Precision) -> Result<(), BackendError> {
        self.state.moves.fetch_add(1, Ordering::SeqCst);
        self.device = device;
        self.precision = precision;
        Ok(())
    }
}
