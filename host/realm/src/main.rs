use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tether_host::{
    config::RuntimeConfig,
    json,
    realm::promise::{self, PromiseState},
    runtime::GuestInstance,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether-host", about = "Runs a guest module against a headless host realm")]
struct Cli {
    /// The guest module to run (`.wasm` or `.wat`).
    module: PathBuf,

    /// TOML runtime configuration; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the document body once the guest has settled.
    #[arg(long)]
    render: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    let engine = wasmtime::Engine::default();
    let module = wasmtime::Module::from_file(&engine, &cli.module)
        .with_context(|| format!("failed to load guest module {}", cli.module.display()))?;

    let mut guest = GuestInstance::instantiate(&engine, &module, &config)?;
    let value = guest.run()?;

    // A returned promise stands for whatever it settled to.
    let value = match promise::state(&value) {
        Some(PromiseState::Fulfilled(result)) => result,
        Some(PromiseState::Rejected(reason)) => {
            anyhow::bail!("guest promise rejected: {}", reason.to_display_string());
        }
        Some(PromiseState::Pending) => {
            tracing::warn!("guest promise never settled");
            value
        }
        None => value,
    };

    println!("{}", json::stringify(&value)?);

    if cli.render {
        println!("{}", guest.realm().render_body());
    }

    Ok(())
}
