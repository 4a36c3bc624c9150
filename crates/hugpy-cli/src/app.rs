use anyhow::{Result, anyhow};
use hugpy_core::{ModelHub, Settings};

/// Hub over the model library compiled into this build
pub fn load_hub() -> Result<ModelHub> {
    let library = hugpy_core::default_library().ok_or_else(|| {
        anyhow!(
            "hugpy was built without a model library.\n\
             Rebuild with: cargo install hugpy --features candle"
        )
    })?;
    Ok(ModelHub::new(library, Settings::load()))
}
