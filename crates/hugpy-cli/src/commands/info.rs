use anyhow::{Context, Result};

use crate::app;

pub fn run(name: &str, json: bool) -> Result<()> {
    let hub = app::load_hub()?;
    let info = hub
        .get_info(name)
        .with_context(|| format!("No usable configuration for '{}'", name))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Model:     {}", info.name);
    println!("Source:    {}", info.source);
    println!("Device:    {}", info.device);
    println!("Precision: {}", info.precision);
    println!("State:     {}", info.state);
    println!("Ready:     {}", info.ready);
    println!("Quantized: {}", info.quantized);
    Ok(())
}
