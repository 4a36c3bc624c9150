//! Model library capability interface.
//!
//! The core never touches tensors. Everything it needs from an ML library
//! is expressed by three traits:
//!
//! ```text
//! ModelLibrary            (one per process, shared)
//!   ├── load_tokenizer()  -> Box<dyn Tokenizer>
//!   ├── load_model()      -> Box<dyn Model>
//!   └── load_generation_defaults()
//!
//! Tokenizer               encode / decode / chat template / special ids
//! Model                   generate / move_to
//! ```
//!
//! Adapters:
//! - `candle` (feature `candle`) - Llama-family safetensors checkpoints

#[cfg(feature = "candle")]
pub mod candle;

#[cfg(test)]
pub(crate) mod fake;

use thiserror::Error;

use crate::config::{Device, Precision};
use crate::generation::{ChatMessage, GenerationConfig};
use crate::locator::SourceDescriptor;

/// Failure reported by a model library adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The device ran out of memory
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    /// Artifacts exist but cannot be used (wrong architecture, bad json, ...)
    #[error("incompatible artifact: {0}")]
    Incompatible(String),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Classify a raw library error message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_out_of_memory(&message) {
            BackendError::ResourceExhausted(message)
        } else {
            BackendError::Other(message)
        }
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, BackendError::ResourceExhausted(_))
    }
}

/// Whether a library error message signals device memory exhaustion
pub fn is_out_of_memory(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("out of memory")
        || lower.contains("out_of_memory")
        || lower.contains("outofmemory")
        || lower.contains("failed to allocate")
}

/// Knobs that only matter while materializing weights
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Load 4-bit weights (only honored on the accelerator)
    pub quantize: bool,
    /// Where remote repositories are downloaded to
    pub cache_dir: Option<std::path::PathBuf>,
}

pub trait Tokenizer: Send {
    fn encode(&self, text: &str) -> Result<Vec<u32>, BackendError>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, BackendError>;

    fn eos_token_id(&self) -> Option<u32>;

    fn pad_token_id(&self) -> Option<u32> {
        None
    }

    fn unk_token_id(&self) -> Option<u32> {
        None
    }

    /// Render and encode a chat conversation.
    ///
    /// The default stitches `role: content` lines and opens an assistant
    /// turn; adapters with a native template override it.
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<Vec<u32>, BackendError> {
        self.encode(&stitch_messages(messages))
    }

    /// Pad id with the usual fallbacks (eos, then unk)
    fn effective_pad_token_id(&self) -> Option<u32> {
        self.pad_token_id()
            .or_else(|| self.eos_token_id())
            .or_else(|| self.unk_token_id())
    }
}

/// Plain-text rendering of a conversation used when no template exists
pub fn stitch_messages(messages: &[ChatMessage]) -> String {
    let mut stitched = String::new();
    for message in messages {
        stitched.push_str(&message.role);
        stitched.push_str(": ");
        stitched.push_str(&message.content);
        stitched.push('\n');
    }
    stitched.push_str("assistant: ");
    stitched
}

pub trait Model: Send {
    fn device(&self) -> Device;

    fn precision(&self) -> Precision;

    /// Run inference and return only the newly generated token ids
    fn generate(
        &mut self,
        input_ids: &[u32],
        config: &GenerationConfig,
    ) -> Result<Vec<u32>, BackendError>;

    /// Re-home the weights on another device
    fn move_to(&mut self, device: Device, precision: Precision) -> Result<(), BackendError>;
}

pub trait ModelLibrary: Send + Sync {
    fn name(&self) -> &'static str;

    fn accelerator_available(&self) -> bool;

    fn supports_precision(&self, device: Device, precision: Precision) -> bool;

    /// Whether 4-bit weight loading is possible in this build
    fn supports_quantization(&self) -> bool {
        false
    }

    fn load_tokenizer(
        &self,
        source: &SourceDescriptor,
        options: &LoadOptions,
    ) -> Result<Box<dyn Tokenizer>, BackendError>;

    fn load_model(
        &self,
        source: &SourceDescriptor,
        device: Device,
        precision: Precision,
        options: &LoadOptions,
    ) -> Result<Box<dyn Model>, BackendError>;

    /// Generation defaults shipped with the checkpoint, if any
    fn load_generation_defaults(
        &self,
        _source: &SourceDescriptor,
        _options: &LoadOptions,
    ) -> Option<GenerationConfig> {
        None
    }

    /// Drop cached accelerator allocations
    fn release_accelerator_memory(&self) {}
}
