use anyhow::{Context, Result};
use hugpy_core::{Device, Precision, Settings};
use std::path::PathBuf;

pub struct ConfigArgs {
    pub cache_dir: Option<PathBuf>,
    pub device: Option<Device>,
    pub precision: Option<Precision>,
    pub prefer_local: Option<bool>,
    pub quantize: Option<bool>,
    pub set_path: Option<Vec<String>>,
    pub set_repo: Option<Vec<String>>,
    pub show: bool,
}

pub fn run(args: ConfigArgs) -> Result<()> {
    let mut settings = Settings::load();
    let mut changed = false;

    if let Some(dir) = args.cache_dir {
        settings.cache_dir = Some(dir);
        println!("Cache directory saved");
        changed = true;
    }

    if let Some(device) = args.device {
        settings.device = Some(device);
        println!("Device set to: {}", device);
        changed = true;
    }

    if let Some(precision) = args.precision {
        settings.precision = Some(precision);
        println!("Precision set to: {}", precision);
        changed = true;
    }

    if let Some(prefer_local) = args.prefer_local {
        settings.prefer_local = prefer_local;
        println!("Prefer local directories: {}", prefer_local);
        changed = true;
    }

    if let Some(quantize) = args.quantize {
        settings.use_quantization = quantize;
        println!("4-bit quantization requested: {}", quantize);
        changed = true;
    }

    if let Some([name, path]) = args.set_path.as_deref() {
        settings.set_model_path(name, path);
        println!("'{}' local directory set to {}", name, path);
        changed = true;
    }

    if let Some([name, repo]) = args.set_repo.as_deref() {
        settings.set_model_repo(name, repo.as_str());
        println!("'{}' remote repo set to {}", name, repo);
        changed = true;
    }

    if changed {
        settings.save().context("Failed to save settings")?;
        println!("Config saved to {}", Settings::path().display());
    }

    if args.show || !changed {
        println!("Config file: {}", Settings::path().display());
        println!("{}", serde_json::to_string_pretty(&settings)?);
    }

    Ok(())
}
