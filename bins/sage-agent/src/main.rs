#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sage_common::SageConfig;
use sage_core::{
    Client, ClientOptions, ControlHeader, InMemoryResolver, LoopbackTransport, MessageValidator,
    Server, ServerOptions, ValidatorConfig,
};
use sage_crypto::{KeyAlgorithm, KeyPair, SessionConfig, SessionManager};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sage-agent", about = "Establish a SAGE session between two local agents")]
struct Args {
    /// TOML config file; SAGE_* environment variables override it.
    #[arg(long, env = "SAGE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    /// Messages to exchange once the session is up.
    #[arg(long, default_value_t = 3)]
    messages: u64,

    #[arg(long, default_value = "did:sage:ethereum:0xagent-a")]
    client_did: String,

    #[arg(long, default_value = "did:sage:ethereum:0xagent-b")]
    server_did: String,
}

fn load_config(args: &Args) -> Result<SageConfig> {
    let mut config = match &args.config {
        Some(path) => SageConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let mut config = SageConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            config
        }
    };
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    sage_common::init_tracing_with_default(&config.log.level);

    let resolver = Arc::new(InMemoryResolver::new());
    let client_key = KeyPair::generate(KeyAlgorithm::Ed25519)?;
    let server_key = KeyPair::generate(KeyAlgorithm::Ed25519)?;
    resolver.register(args.client_did.as_str(), client_key.public_key(), None);
    let server_signing = server_key.public_key();

    let server_sessions = Arc::new(SessionManager::new(SessionConfig::from(&config.session)));
    let server = Arc::new(Server::new(
        args.server_did.as_str(),
        server_key,
        KeyPair::generate(KeyAlgorithm::X25519)?,
        resolver.clone(),
        server_sessions.clone(),
        ServerOptions::from(&config),
    )?);
    resolver.register(
        args.server_did.as_str(),
        server_signing,
        Some(server.kem_public_key()?),
    );
    let _handshake_sweeper = server.spawn_cleanup();
    let _session_sweeper = server_sessions.spawn_cleanup(config.session.cleanup_interval());

    let client_sessions = Arc::new(SessionManager::new(SessionConfig::from(&config.session)));
    let client = Arc::new(Client::new(
        client_key,
        resolver.clone(),
        Arc::new(LoopbackTransport::new(server.clone())),
        client_sessions.clone(),
        ClientOptions::from(&config),
    )?);
    let _client_sweeper = client.spawn_cleanup();

    let context_id = format!("ctx-{}", uuid::Uuid::new_v4());
    let session_id = client
        .initiate(&context_id, &args.client_did, &args.server_did)
        .await?;
    info!(%session_id, context_id = %context_id, "session established");

    let outbound = client_sessions
        .get_session(&session_id)
        .context("client session missing")?;
    let inbound = server_sessions
        .get_session(&session_id)
        .context("server session missing")?;
    let validator = MessageValidator::new(ValidatorConfig::from(&config.replay));

    let mut last_header = None;
    for sequence in 1..=args.messages {
        let header = ControlHeader::new(sequence);
        let aad = serde_json::to_vec(&header)?;
        let plaintext = format!("message {sequence} from {}", args.client_did);
        let ciphertext = outbound.encrypt_with_aad(plaintext.as_bytes(), &aad)?;

        validator
            .validate_message(&header, session_id.as_str())
            .into_result()?;
        let opened = inbound.decrypt_with_aad(&ciphertext, &aad)?;
        info!(
            sequence,
            plaintext = opened.len(),
            ciphertext = ciphertext.len(),
            "message delivered"
        );
        last_header = Some(header);
    }

    if let Some(header) = last_header {
        let outcome = validator.validate_message(&header, session_id.as_str());
        if let Some(failure) = outcome.failure {
            warn!(kind = %failure.kind(), "replayed message rejected: {failure}");
        }
    }

    let stats = server_sessions.stats();
    info!(active = stats.active, total = stats.total, "server sessions");
    println!("{session_id}");

    client_sessions.close();
    server_sessions.close();
    Ok(())
}
