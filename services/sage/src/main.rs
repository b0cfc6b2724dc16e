//! Main Entrypoint for the Sage Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Building the collaborators (credential store, device identity, speech).
//! 4. Constructing the gateway session client.
//! 5. Running either a one-shot message or the interactive loop, with
//!    graceful shutdown.

mod config;
mod repl;

use anyhow::Context;
use clap::Parser;
use config::Config;
use sage_core::credentials::{BEARER_TOKEN_KEY, CredentialStore, FileCredentialStore};
use sage_core::identity::DeviceIdentity;
use sage_core::speech::SpeechClient;
use sage_gateway::{SessionClient, SessionConfig};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sage", version, about = "Headless client for the sage gateway")]
struct Args {
    /// Send one message, print the reply, and exit.
    #[arg(short, long)]
    message: Option<String>,
    /// Start without dialing the gateway; use /connect from the prompt.
    #[arg(long)]
    no_connect: bool,
}

/// Listens for the `Ctrl+C` signal to gracefully shut down the client.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing collaborators...");

    // --- 3. Collaborators ---
    let credentials: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::new(
        config.data_dir.join("credentials.json"),
    ));
    if let Some(token) = &config.gateway_token {
        // Seed the bearer credential on first run; an issued device token
        // takes precedence over it afterwards.
        if credentials.get(BEARER_TOKEN_KEY).await?.is_none() {
            credentials.set(BEARER_TOKEN_KEY, token).await?;
            info!("Seeded bearer credential from the environment.");
        }
    }
    let identity = DeviceIdentity::load_or_create(&config.data_dir.join("device.json"))?;
    info!(device_id = %identity.device_id, "Device identity ready.");

    let speech = match &config.speech_url {
        Some(url) => Some(SpeechClient::new(url.clone())?),
        None => None,
    };

    // --- 4. Session Client ---
    let mut session_config = SessionConfig::new(config.gateway_url.clone());
    session_config.locale = config.locale.clone();
    let client = SessionClient::new(session_config, credentials, identity);

    // --- 5. Run ---
    if let Some(message) = args.message {
        client.connect().await?;
        let reply = client.send_message(message).await?;
        println!("{reply}");
        client.disconnect().await;
        return Ok(());
    }

    if !args.no_connect {
        if let Err(err) = client.connect().await {
            warn!(error = %err, "Initial connection failed; use /connect to retry.");
        }
    }

    let audio_dir = config.data_dir.join("speech");
    tokio::select! {
        result = repl::run(client.clone(), speech, config.voice.clone(), audio_dir) => result?,
        _ = shutdown_signal() => {
            client.disconnect().await;
        }
    }
    info!("Session closed.");
    Ok(())
}
