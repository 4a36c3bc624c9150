//! Caller-facing entry point.
//!
//! # Usage
//!
//! ```rust,ignore
//! use hugpy_core::{ModelHub, Settings};
//!
//! let hub = ModelHub::new(library, Settings::load());
//! let text = hub.generate("deepcoder", "fn main() {", &Default::default())?;
//! ```
//!
//! The first request for a name constructs its handle and loads it; later
//! requests reuse the loaded model until it is unloaded.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{BackendError, ModelLibrary};
use crate::error::{HandleError, Result};
use crate::generation::GenerationRequest;
use crate::handle::{HandleInfo, ModelHandle};
use crate::registry::HandleRegistry;
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct ModelHub {
    settings: Arc<Settings>,
    registry: Arc<HandleRegistry>,
}

impl ModelHub {
    pub fn new(library: Arc<dyn ModelLibrary>, settings: Settings) -> Self {
        let registry = HandleRegistry::from_settings(library, &settings);
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    fn handle(&self, name: &str) -> Result<Arc<ModelHandle>> {
        self.registry.get_or_create(name, self.settings.model(name))
    }

    /// Generate a continuation of `prompt`, loading the model if needed
    pub fn generate(&self, name: &str, prompt: &str, overrides: &Map<String, Value>) -> Result<String> {
        self.generate_request(name, &GenerationRequest::from(prompt), overrides)
    }

    pub fn generate_request(
        &self,
        name: &str,
        request: &GenerationRequest,
        overrides: &Map<String, Value>,
    ) -> Result<String> {
        let handle = self.handle(name)?;
        handle.load()?;
        handle.generate(request, overrides)
    }

    /// Generate on a blocking worker, giving up after `timeout`.
    ///
    /// The inference itself keeps running to completion after a timeout;
    /// only the caller stops waiting. The handle stays locked until then.
    pub async fn generate_with_timeout(
        &self,
        name: &str,
        request: GenerationRequest,
        overrides: Map<String, Value>,
        timeout: Duration,
    ) -> Result<String> {
        let hub = self.clone();
        let owned_name = name.to_string();
        let task = tokio::task::spawn_blocking(move || {
            hub.generate_request(&owned_name, &request, &overrides)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(HandleError::Generation {
                name: name.to_string(),
                source: BackendError::Other(join_error.to_string()),
            }),
            Err(_) => {
                crate::verbose!("Stopped waiting for '{}' after {:?}", name, timeout);
                Err(HandleError::Timeout {
                    name: name.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Source, device, precision and readiness. Does not load the model.
    pub fn get_info(&self, name: &str) -> Result<HandleInfo> {
        Ok(self.handle(name)?.info())
    }

    pub fn unload(&self, name: &str) {
        self.registry.unload(name);
    }

    pub fn unload_all(&self) {
        self.registry.unload_all();
    }

    pub fn list_loaded(&self) -> BTreeSet<String> {
        self.registry.list_loaded()
    }

    /// Start loading `name` in the background
    pub fn preload(&self, name: &str) -> Result<JoinHandle<()>> {
        self.registry.preload(name, self.settings.model(name))
    }
}
