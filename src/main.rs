use anyhow::Context;
use chat_mux::{cli, models::ModelCapabilities, providers::ProviderRegistry, server};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chatmux")]
#[command(about = "Chat Mux - multi-provider AI chat back-end built in Rust", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ~/.chat-mux/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat server
    Start {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List configured providers and models
    Providers,
    /// Print the effective configuration with secrets redacted
    PrintConfig,
}

fn capability_labels(capabilities: &ModelCapabilities) -> Vec<&'static str> {
    [
        (capabilities.function_call, "tools"),
        (capabilities.vision, "vision"),
        (capabilities.file, "file"),
        (capabilities.reasoning, "reasoning"),
        (capabilities.image_output, "image"),
        (capabilities.search, "search"),
        (capabilities.tts, "tts"),
        (capabilities.asr, "asr"),
        (capabilities.stt, "stt"),
    ]
    .into_iter()
    .filter_map(|(enabled, label)| enabled.then_some(label))
    .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => cli::AppConfig::default_path().unwrap_or_else(|_| PathBuf::from("config/default.toml")),
    };

    let mut config = cli::AppConfig::from_file(&config_path)?;

    match cli.command {
        Commands::Start { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            tracing::info!("Starting Chat Mux with config {}", config_path.display());
            println!("🚀 Chat Mux v{}", env!("CARGO_PKG_VERSION"));
            println!("📡 Starting server on {}:{}", config.server.host, config.server.port);
            println!();
            println!("Press Ctrl+C to stop");

            server::start_server(config).await?;
        }
        Commands::Providers => {
            let registry =
                ProviderRegistry::from_configs(&config.providers).context("Invalid provider configuration")?;
            let providers = registry.list_providers();
            if providers.is_empty() {
                println!("No providers configured in {}", config_path.display());
            }
            for provider in providers {
                println!("• {} ({})", provider.display_name(), provider.provider_type());
                for model in &provider.models {
                    let labels = capability_labels(&model.capabilities);
                    if labels.is_empty() {
                        println!("    - {}", model.id);
                    } else {
                        println!("    - {} [{}]", model.id, labels.join(", "));
                    }
                }
            }
        }
        Commands::PrintConfig => {
            print!("{}", config.to_redacted_toml()?);
        }
    }

    Ok(())
}
