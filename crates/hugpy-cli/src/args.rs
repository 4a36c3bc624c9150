use clap::{Parser, Subcommand};
use hugpy_core::{Device, Precision};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hugpy")]
#[command(version)]
#[command(about = "Lazily loaded local language models behind logical names")]
pub struct Cli {
    /// Log model lifecycle events to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate text with a configured model
    Generate {
        /// Logical model name
        name: String,

        /// Prompt text (omit when using --messages)
        #[arg(required_unless_present = "messages")]
        prompt: Option<String>,

        /// Generation option, repeatable (e.g. --set max_new_tokens=64)
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_override)]
        overrides: Vec<(String, Value)>,

        /// JSON file with a list of {role, content} chat messages
        #[arg(long, conflicts_with = "prompt")]
        messages: Option<PathBuf>,

        /// Stop waiting after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Show source, device and readiness of a model without loading it
    Info {
        name: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show where a model name resolves to
    Resolve {
        name: String,

        /// Ignore a configured local directory
        #[arg(long)]
        remote: bool,
    },

    /// List configured models
    Models,

    /// Download a model's remote repository into the cache
    Download {
        /// Logical model name or namespace/repo id
        name: String,
    },

    /// Configure settings
    Config {
        /// Directory for downloaded repositories
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Device override (accelerator or cpu)
        #[arg(long)]
        device: Option<Device>,

        /// Precision override (bf16, f16 or f32)
        #[arg(long)]
        precision: Option<Precision>,

        /// Prefer local directories over remote ids
        #[arg(long)]
        prefer_local: Option<bool>,

        /// Request 4-bit weights when available
        #[arg(long)]
        quantize: Option<bool>,

        /// Set a model's local directory
        #[arg(long, num_args = 2, value_names = ["NAME", "PATH"])]
        set_path: Option<Vec<String>>,

        /// Set a model's remote repo id
        #[arg(long, num_args = 2, value_names = ["NAME", "REPO"])]
        set_repo: Option<Vec<String>>,

        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

/// Parse `key=value`; the value is JSON when it parses, a string otherwise
pub fn parse_override(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{}'", s));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
