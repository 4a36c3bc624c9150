mod app;
mod args;
mod commands;

use anyhow::Result;
use args::{Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    let cli = Cli::parse();
    hugpy_core::set_verbose(cli.verbose);

    match cli.command {
        Commands::Generate {
            name,
            prompt,
            overrides,
            messages,
            timeout,
        } => commands::generate::run(&name, prompt, overrides, messages, timeout),
        Commands::Info { name, json } => commands::info::run(&name, json),
        Commands::Resolve { name, remote } => commands::resolve::run(&name, remote),
        Commands::Models => commands::models::run(),
        Commands::Download { name } => commands::download::run(&name),
        Commands::Config {
            cache_dir,
            device,
            precision,
            prefer_local,
            quantize,
            set_path,
            set_repo,
            show,
        } => commands::config::run(commands::config::ConfigArgs {
            cache_dir,
            device,
            precision,
            prefer_local,
            quantize,
            set_path,
            set_repo,
            show,
        }),
    }
}
