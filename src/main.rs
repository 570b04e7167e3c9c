//! genlink - Command-line front end for the image-generation service
//!
//! Each subcommand opens one authenticated connection, runs a single
//! operation and closes the connection.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use genlink_client::{Client, ClientConfig, ConfigError};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "genlink")]
#[command(about = "Command-line client for the image-generation service")]
#[command(version)]
struct Cli {
    /// Service endpoint (ws:// or wss://)
    #[arg(short, long, env = "GENLINK_ENDPOINT")]
    endpoint: Option<String>,

    /// API key
    #[arg(short = 'k', long, env = "GENLINK_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Path to CA certificate for server verification
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long)]
    insecure: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an image from a prompt
    Generate {
        /// Text prompt
        prompt: String,

        /// Reference image (UUID, URL or data URI)
        #[arg(short, long)]
        reference: Option<String>,

        /// Model identifier (defaults to the configured model)
        #[arg(short, long)]
        model: Option<String>,

        /// Image width in pixels
        #[arg(long, default_value = "1024")]
        width: u32,

        /// Image height in pixels
        #[arg(long, default_value = "1024")]
        height: u32,

        /// Things the image should not contain
        #[arg(short, long)]
        negative: Option<String>,

        /// Sampling steps
        #[arg(long)]
        steps: Option<u32>,

        /// Seed for reproducible output
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Upload an image for use as a reference
    Upload {
        /// Image file
        path: PathBuf,
    },

    /// Look up the result of a job
    Fetch {
        /// Job ID
        job_id: String,
    },

    /// Check that the service is reachable and the API key is accepted
    Check,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(2);
        }
    };
    tracing::debug!(?config, "Configuration loaded");

    let client = Client::new(config);
    let result = commands::execute(&client, cli.command, cli.json).await;
    client.disconnect().await?;

    match result {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            eprintln!("{}", e.advisory().yellow());
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Layers command-line flags over the file and environment configuration.
fn build_config(cli: &Cli) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::load()?;

    if let Some(ref endpoint) = cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(ref key) = cli.api_key {
        config = config.with_api_key(key);
    }
    if cli.ca_cert.is_some() || cli.insecure {
        let mut tls = config.tls.clone();
        if let Some(ref path) = cli.ca_cert {
            tls = tls.with_ca_cert(path);
        }
        if cli.insecure {
            tls = tls.with_insecure();
        }
        config = config.with_tls(tls);
    }

    config.validate()?;
    if config.api_key.is_none() {
        return Err(ConfigError::ValidationError(
            "no API key: pass --api-key or set GENLINK_API_KEY".to_string(),
        ));
    }
    Ok(config)
}
