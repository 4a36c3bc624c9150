//! A single lazily loaded model.
//!
//! ```text
//!   Unloaded ──load()──▶ Loading ──ok──▶ Ready ──unload()──▶ Unloaded
//!                           │              │
//!                           └──err──▶ Unloaded
//!                                          │ accelerator OOM
//!                                          ▼
//!                                    Degraded(cpu) ──unload()──▶ Unloaded
//! ```
//!
//! All mutation happens under the handle's slot lock, which is also held for
//! the whole of a generation: one inference at a time per handle, and
//! concurrent `load()` callers wait for the first caller's outcome. A
//! separate status snapshot serves `info()` without waiting on inference.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::backend::{BackendError, LoadOptions, Model, ModelLibrary, Tokenizer};
use crate::config::{Device, Precision};
use crate::environment::EnvironmentDescriptor;
use crate::error::{HandleError, Result};
use crate::generation::{GenerationConfig, GenerationRequest};
use crate::locator::SourceDescriptor;
use crate::recovery::{self, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    Unloaded,
    Loading,
    Ready,
    /// Demoted to the fallback device after memory exhaustion
    Degraded,
}

impl HandleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleState::Unloaded => "unloaded",
            HandleState::Loading => "loading",
            HandleState::Ready => "ready",
            HandleState::Degraded => "degraded",
        }
    }

    /// Whether generation can run
    pub fn is_servable(&self) -> bool {
        matches!(self, HandleState::Ready | HandleState::Degraded)
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Diagnostics snapshot of a handle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandleInfo {
    pub name: String,
    pub source: SourceDescriptor,
    pub device: Device,
    pub precision: Precision,
    pub state: HandleState,
    pub ready: bool,
    /// Weights requested in 4-bit form
    pub quantized: bool,
}

struct Loaded {
    tokenizer: Box<dyn Tokenizer>,
    model: Box<dyn Model>,
    defaults: GenerationConfig,
}

#[derive(Default)]
struct Slot {
    loaded: Option<Loaded>,
    last_failure: Option<BackendError>,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: HandleState,
    environment: EnvironmentDescriptor,
}

pub struct ModelHandle {
    name: String,
    source: SourceDescriptor,
    environment: EnvironmentDescriptor,
    configured_defaults: GenerationConfig,
    options: LoadOptions,
    library: Arc<dyn ModelLibrary>,
    slot: Mutex<Slot>,
    status: RwLock<Status>,
    /// Completed load attempts, bumped under the slot lock
    attempts: AtomicU64,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("library", &self.library.name())
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ModelHandle {
    pub fn new(
        name: impl Into<String>,
        source: SourceDescriptor,
        environment: EnvironmentDescriptor,
        library: Arc<dyn ModelLibrary>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            environment,
            configured_defaults: GenerationConfig::default(),
            options: LoadOptions::default(),
            library,
            slot: Mutex::new(Slot::default()),
            status: RwLock::new(Status {
                state: HandleState::Unloaded,
                environment,
            }),
            attempts: AtomicU64::new(0),
        }
    }

    /// Generation defaults layered over whatever the checkpoint ships
    pub fn with_defaults(mut self, defaults: GenerationConfig) -> Self {
        self.configured_defaults = defaults;
        self
    }

    pub fn with_load_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    /// Device and precision the handle loads onto
    pub fn environment(&self) -> EnvironmentDescriptor {
        self.environment
    }

    pub fn state(&self) -> HandleState {
        self.status().state
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_servable()
    }

    pub fn info(&self) -> HandleInfo {
        let status = self.status();
        HandleInfo {
            name: self.name.clone(),
            source: self.source.clone(),
            device: status.environment.device,
            precision: status.environment.precision,
            state: status.state,
            ready: status.state.is_servable(),
            quantized: self.options.quantize,
        }
    }

    fn status(&self) -> Status {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: HandleState, environment: EnvironmentDescriptor) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = Status { state, environment };
    }

    /// Load tokenizer, model and generation defaults.
    ///
    /// No-op when already loaded. A caller that waited behind another
    /// caller's failed attempt gets that failure instead of loading again.
    pub fn load(&self) -> Result<()> {
        let seen = self.attempts.load(Ordering::SeqCst);
        let mut slot = lock(&self.slot);

        if slot.loaded.is_some() {
            return Ok(());
        }
        if self.attempts.load(Ordering::SeqCst) != seen
            && let Some(failure) = slot.last_failure.clone()
        {
            return Err(HandleError::Load {
                name: self.name.clone(),
                source: failure,
            });
        }

        self.set_status(HandleState::Loading, self.environment);
        crate::verbose!(
            "Loading '{}' from {} on {} ({})",
            self.name,
            self.source,
            self.environment.device,
            self.environment.precision
        );

        let result = self.materialize();
        self.attempts.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(loaded) => {
                slot.loaded = Some(loaded);
                slot.last_failure = None;
                self.set_status(HandleState::Ready, self.environment);
                crate::verbose!("'{}' loaded", self.name);
                Ok(())
            }
            Err(failure) => {
                slot.last_failure = Some(failure.clone());
                self.set_status(HandleState::Unloaded, self.environment);
                Err(HandleError::Load {
                    name: self.name.clone(),
                    source: failure,
                })
            }
        }
    }

    fn materialize(&self) -> Result<Loaded, BackendError> {
        let tokenizer = self.library.load_tokenizer(&self.source, &self.options)?;
        let model = self.library.load_model(
            &self.source,
            self.environment.device,
            self.environment.precision,
            &self.options,
        )?;

        let mut defaults = self
            .library
            .load_generation_defaults(&self.source, &self.options)
            .unwrap_or_else(|| {
                crate::verbose!("'{}' ships no generation config; using fallback", self.name);
                GenerationConfig::fallback()
            })
            .layered(&self.configured_defaults);
        if defaults.pad_token_id.is_none() {
            defaults.pad_token_id = tokenizer.effective_pad_token_id();
        }
        if defaults.eos_token_id.is_none() {
            defaults.eos_token_id = tokenizer.eos_token_id();
        }

        Ok(Loaded {
            tokenizer,
            model,
            defaults,
        })
    }

    /// Generation defaults of the loaded model
    pub fn defaults(&self) -> Option<GenerationConfig> {
        lock(&self.slot).loaded.as_ref().map(|l| l.defaults.clone())
    }

    /// Run one generation.
    ///
    /// Fails with `NotReady` unless the handle is ready or degraded. Holds
    /// the handle lock for the whole inference, including a recovery retry.
    pub fn generate(
        &self,
        request: &GenerationRequest,
        overrides: &Map<String, Value>,
    ) -> Result<String> {
        let state = self.state();
        if !state.is_servable() {
            return Err(self.not_ready(state));
        }

        let mut slot = lock(&self.slot);
        let Some(loaded) = slot.loaded.as_mut() else {
            return Err(self.not_ready(self.state()));
        };

        let config = loaded.defaults.merge_overrides(overrides)?.effective();
        let input_ids = match request {
            GenerationRequest::Prompt(prompt) => loaded.tokenizer.encode(prompt),
            GenerationRequest::Messages(messages) => loaded.tokenizer.apply_chat_template(messages),
        }
        .map_err(|source| self.generation_error(source))?;

        let outcome = recovery::generate_with_recovery(
            &self.name,
            self.library.as_ref(),
            loaded.model.as_mut(),
            &input_ids,
            &config,
        );

        let ids = match outcome {
            Ok(Outcome::Completed(ids)) => ids,
            Ok(Outcome::Recovered { ids, environment }) => {
                self.set_status(HandleState::Degraded, environment);
                ids
            }
            Err(failure) => {
                if let Some(environment) = failure.demoted_to {
                    self.set_status(HandleState::Degraded, environment);
                }
                return Err(self.generation_error(failure.error));
            }
        };

        let text = loaded
            .tokenizer
            .decode(&ids, true)
            .map_err(|source| self.generation_error(source))?;
        Ok(text.trim().to_string())
    }

    /// Release the model and tokenizer. Safe to call repeatedly.
    pub fn unload(&self) {
        let mut slot = lock(&self.slot);
        let Some(loaded) = slot.loaded.take() else {
            return;
        };
        let on_accelerator = loaded.model.device().is_accelerator();
        drop(loaded);
        if on_accelerator {
            self.library.release_accelerator_memory();
        }
        self.set_status(HandleState::Unloaded, self.environment);
        crate::verbose!("Unloaded '{}'", self.name);
    }

    fn not_ready(&self, state: HandleState) -> HandleError {
        HandleError::NotReady {
            name: self.name.clone(),
            state: state.to_string(),
        }
    }

    fn generation_error(&self, source: BackendError) -> HandleError {
        HandleError::Generation {
            name: self.name.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeLibrary, FakeState};
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn accelerator() -> EnvironmentDescriptor {
        EnvironmentDescriptor {
            device: Device::Accelerator,
            precision: Precision::Bf16,
        }
    }

    fn handle_with(library: FakeLibrary) -> (Arc<ModelHandle>, Arc<FakeState>) {
        let state = library.state();
        let handle = ModelHandle::new(
            "demo",
            SourceDescriptor::Remote("acme/demo".into()),
            accelerator(),
            Arc::new(library),
        );
        (Arc::new(handle), state)
    }

    fn no_overrides() -> Map<String, Value> {
        Map::new()
    }

    #[test]
    fn test_generate_requires_ready() {
        let (handle, state) = handle_with(FakeLibrary::new());
        let err = handle.generate(&"hi".into(), &no_overrides()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotReady);
        assert_eq!(state.load_count(), 0);
    }

    #[test]
    fn test_load_then_generate() {
        let (handle, _) = handle_with(FakeLibrary::new());
        handle.load().unwrap();
        assert_eq!(handle.state(), HandleState::Ready);
        let text = handle.generate(&"hi".into(), &no_overrides()).unwrap();
        assert_eq!(text, "hi");
    }

    #[test]
    fn test_load_is_idempotent() {
        let (handle, state) = handle_with(FakeLibrary::new());
        handle.load().unwrap();
        handle.load().unwrap();
        assert_eq!(state.load_count(), 1);
    }

    #[test]
    fn test_load_failure_stays_unloaded() {
        let (handle, state) = handle_with(FakeLibrary::new());
        state.fail_load.store(true, Ordering::SeqCst);
        let err = handle.load().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Load);
        assert_eq!(handle.state(), HandleState::Unloaded);

        // Artifacts fixed: a later attempt succeeds
        state.fail_load.store(false, Ordering::SeqCst);
        handle.load().unwrap();
        assert!(handle.is_ready());
    }

    #[test]
    fn test_concurrent_loads_load_once() {
        let (handle, state) =
            handle_with(FakeLibrary::new().with_load_delay(Duration::from_millis(50)));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || handle.load())
            })
            .collect();
        for t in threads {
            t.join().unwrap().unwrap();
        }
        assert_eq!(state.load_count(), 1);
        assert_eq!(state.tokenizer_loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_not_ready_while_loading() {
        let (handle, _) = handle_with(FakeLibrary::new().with_load_delay(Duration::from_millis(200)));
        let loader = {
            let handle = handle.clone();
            thread::spawn(move || handle.load())
        };
        while handle.state() != HandleState::Loading {
            thread::sleep(Duration::from_millis(1));
        }
        let err = handle.generate(&"hi".into(), &no_overrides()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotReady);
        loader.join().unwrap().unwrap();
    }

    #[test]
    fn test_generations_are_serialized() {
        let (handle, state) =
            handle_with(FakeLibrary::new().with_generate_delay(Duration::from_millis(10)));
        handle.load().unwrap();

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let handle = handle.clone();
                thread::spawn(move || handle.generate(&format!("req {}", i).into(), &Map::new()))
            })
            .collect();
        for t in threads {
            t.join().unwrap().unwrap();
        }
        assert_eq!(state.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(state.generations.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_oom_recovers_to_degraded() {
        let (handle, state) = handle_with(FakeLibrary::new());
        handle.load().unwrap();
        state.oom_on_accelerator.store(1, Ordering::SeqCst);

        let text = handle.generate(&"hi".into(), &no_overrides()).unwrap();
        assert_eq!(text, "hi");
        let info = handle.info();
        assert_eq!(info.state, HandleState::Degraded);
        assert_eq!(info.device, Device::Cpu);
        assert!(info.ready);

        // Stays on cpu for later requests
        state.oom_on_accelerator.store(1, Ordering::SeqCst);
        handle.generate(&"again".into(), &no_overrides()).unwrap();
        assert_eq!(state.moves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oom_twice_is_fatal() {
        let (handle, state) = handle_with(FakeLibrary::new());
        handle.load().unwrap();
        state.oom_on_accelerator.store(1, Ordering::SeqCst);
        state.oom_on_cpu.store(true, Ordering::SeqCst);

        let err = handle.generate(&"hi".into(), &no_overrides()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Generation);
        assert_eq!(handle.state(), HandleState::Degraded);
    }

    #[test]
    fn test_deterministic_config_reaches_model() {
        let (handle, state) = handle_with(FakeLibrary::new());
        handle.load().unwrap();
        let overrides = json!({"do_sample": false, "temperature": 0.9, "bogus": 1});
        let Value::Object(overrides) = overrides else { unreachable!() };

        handle.generate(&"hi".into(), &overrides).unwrap();
        let config = state.last_config.lock().unwrap().clone().unwrap();
        assert!(!config.to_map().contains_key("temperature"));
        assert!(config.top_p.is_none());
        assert_eq!(config.do_sample, Some(false));
    }

    #[test]
    fn test_defaults_fill_special_tokens() {
        let (handle, _) = handle_with(FakeLibrary::new());
        handle.load().unwrap();
        let defaults = handle.defaults().unwrap();
        assert_eq!(defaults.eos_token_id, Some(crate::backend::fake::EOS));
        // No pad token: falls back to eos
        assert_eq!(defaults.pad_token_id, Some(crate::backend::fake::EOS));
        assert_eq!(defaults.max_new_tokens, Some(512));
    }

    #[test]
    fn test_pad_falls_back_to_unk_without_eos() {
        let (handle, _) = handle_with(
            FakeLibrary::new().with_special_tokens(None, Some(crate::backend::fake::UNK)),
        );
        handle.load().unwrap();
        let defaults = handle.defaults().unwrap();
        assert_eq!(defaults.eos_token_id, None);
        assert_eq!(defaults.pad_token_id, Some(crate::backend::fake::UNK));
    }

    #[test]
    fn test_info_reports_quantization() {
        let (handle, _) = handle_with(FakeLibrary::new());
        assert!(!handle.info().quantized);

        let handle = ModelHandle::new(
            "demo",
            SourceDescriptor::Remote("acme/demo".into()),
            accelerator(),
            Arc::new(FakeLibrary::new()),
        )
        .with_load_options(LoadOptions {
            quantize: true,
            cache_dir: None,
        });
        assert!(handle.info().quantized);
    }

    #[test]
    fn test_configured_defaults_layer_over_checkpoint() {
        let checkpoint = GenerationConfig {
            max_new_tokens: Some(64),
            temperature: Some(0.6),
            pad_token_id: Some(0),
            ..Default::default()
        };
        let library = FakeLibrary::new().with_defaults(checkpoint);
        let state = library.state();
        let handle = ModelHandle::new(
            "demo",
            SourceDescriptor::Remote("acme/demo".into()),
            accelerator(),
            Arc::new(library),
        )
        .with_defaults(GenerationConfig {
            max_new_tokens: Some(16),
            ..Default::default()
        });
        handle.load().unwrap();

        let defaults = handle.defaults().unwrap();
        assert_eq!(defaults.max_new_tokens, Some(16));
        assert_eq!(defaults.temperature, Some(0.6));
        assert_eq!(defaults.pad_token_id, Some(0));

        handle.generate(&"ab".into(), &no_overrides()).unwrap();
        let offset = crate::backend::fake::BYTE_OFFSET;
        assert_eq!(
            *state.last_input.lock().unwrap(),
            vec![b'a' as u32 + offset, b'b' as u32 + offset]
        );
    }

    #[test]
    fn test_chat_messages_use_template() {
        let (handle, _) = handle_with(FakeLibrary::new());
        handle.load().unwrap();
        let request = GenerationRequest::Messages(vec![crate::generation::ChatMessage::user("hi")]);
        let text = handle.generate(&request, &no_overrides()).unwrap();
        assert_eq!(text, "user: hi\nassistant:");
    }

    #[test]
    fn test_unload_twice_and_reload() {
        let (handle, state) = handle_with(FakeLibrary::new());
        handle.load().unwrap();
        state.oom_on_accelerator.store(1, Ordering::SeqCst);
        handle.generate(&"hi".into(), &no_overrides()).unwrap();
        assert_eq!(handle.state(), HandleState::Degraded);

        handle.unload();
        handle.unload();
        assert_eq!(handle.state(), HandleState::Unloaded);

        handle.load().unwrap();
        let info = handle.info();
        assert_eq!(info.state, HandleState::Ready);
        assert_eq!(info.device, Device::Accelerator);
        assert_eq!(state.load_count(), 2);
    }
}
