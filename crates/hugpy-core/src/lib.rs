pub mod backend;
pub mod config;
pub mod download;
pub mod environment;
pub mod error;
pub mod generation;
pub mod handle;
pub mod hub;
pub mod locator;
pub mod recovery;
pub mod registry;
pub mod settings;
pub mod verbose;

#[cfg(feature = "candle")]
pub use backend::candle::CandleLibrary;
pub use backend::{BackendError, LoadOptions, Model, ModelLibrary, Tokenizer};
pub use config::{Device, Precision};
pub use environment::{EnvironmentDescriptor, EnvironmentOverrides, EnvironmentProbe};
pub use error::{ErrorKind, HandleError, Result};
pub use generation::{ChatMessage, GenerationConfig, GenerationRequest};
pub use handle::{HandleInfo, HandleState, ModelHandle};
pub use hub::ModelHub;
pub use locator::SourceDescriptor;
pub use registry::HandleRegistry;
pub use settings::{ModelEntry, Settings};
pub use verbose::set_verbose;

/// Model library compiled into this build, if any
pub fn default_library() -> Option<std::sync::Arc<dyn ModelLibrary>> {
    #[cfg(feature = "candle")]
    {
        Some(std::sync::Arc::new(CandleLibrary::new()))
    }
    #[cfg(not(feature = "candle"))]
    {
        None
    }
}
