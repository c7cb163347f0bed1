//! ferry-ingress: webhook ingress for the ferry deployment dispatcher.
//!
//! Receives upstream deployment events over HTTP, publishes signed
//! deployment requests to the bus, and relays agent statuses back to the
//! upstream provider's deployment records.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use serde::Deserialize;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ferry_core::bus::DualClient;
use ferry_core::config::{BusConfig, SaslConfig, TlsConfig};
use ferry_core::storage::{
    ApiKeyStorage, HttpApiKeyStorage, InMemoryRegistry, RepositoryEntry, StaticApiKeyStorage,
};
use ferry_core::upstream::{HttpStatusPoster, LogStatusPoster, StatusPoster};
use ferry_ingress::dispatch::{self, DispatchState};
use ferry_ingress::relay;

/// Selectable API-key storage backends.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ApiKeyBackend {
    /// One fixed key handed to every team (development rigs).
    Static,
    /// HTTP key/value store (Vault-style layout).
    Vault,
}

/// ferry ingress - webhook dispatcher
#[derive(Parser, Debug)]
#[command(name = "ferry-ingress")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind the webhook endpoint to
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen_address: String,

    /// Externally visible base URL of the webhook endpoint
    #[arg(long, default_value = "http://localhost:8080")]
    base_url: String,

    /// Path to the repository registry file (webhook secrets and team
    /// allowlists)
    #[arg(long, default_value = "registry.toml")]
    registry_file: PathBuf,

    /// API-key storage backend
    #[arg(long, value_enum, default_value = "static")]
    api_key_storage: ApiKeyBackend,

    /// Hex-encoded team API key for the static backend
    #[arg(long, default_value = "")]
    api_key: String,

    /// Base address of the Vault-style key store
    #[arg(long)]
    vault_address: Option<String>,

    /// Path under which team keys are stored
    #[arg(long, default_value = "apikeys")]
    vault_path: String,

    /// Field name holding the key inside each stored entry
    #[arg(long, default_value = "key")]
    vault_key_name: String,

    /// Bearer token for the Vault-style key store
    #[arg(long)]
    vault_token: Option<String>,

    /// Bus broker addresses
    #[arg(long = "kafka-brokers", value_delimiter = ',', default_value = "localhost:9092")]
    brokers: Vec<String>,

    /// Bus consumer group ID for the status relay
    #[arg(long = "kafka-group-id", default_value = "ferry-ingress")]
    group_id: String,

    /// Bus client ID prefix
    #[arg(long = "kafka-client-id", default_value = "ferry-ingress")]
    client_id: String,

    /// Topic carrying deployment requests
    #[arg(long = "kafka-request-topic", default_value = "ferry-requests")]
    request_topic: String,

    /// Topic carrying deployment statuses
    #[arg(long = "kafka-status-topic", default_value = "ferry-statuses")]
    status_topic: String,

    /// Shared signature key for bus envelopes
    #[arg(long = "kafka-signature-key")]
    signature_key: String,

    /// Enable SASL authentication towards the brokers
    #[arg(long = "kafka-sasl-enabled")]
    sasl_enabled: bool,

    /// SASL username
    #[arg(long = "kafka-sasl-username", default_value = "")]
    sasl_username: String,

    /// SASL password
    #[arg(long = "kafka-sasl-password")]
    sasl_password: Option<String>,

    /// Perform the SASL handshake
    #[arg(long = "kafka-sasl-handshake", default_value_t = true, action = clap::ArgAction::Set)]
    sasl_handshake: bool,

    /// Enable TLS towards the brokers
    #[arg(long = "kafka-tls-enabled")]
    tls_enabled: bool,

    /// Skip TLS certificate verification (test rigs only)
    #[arg(long = "kafka-tls-insecure-skip-verify")]
    tls_insecure_skip_verify: bool,

    /// Base URL of the upstream provider's REST API
    #[arg(long)]
    upstream_base_url: Option<String>,

    /// Bearer token for the upstream provider's REST API
    #[arg(long)]
    upstream_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// On-disk registry format.
#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default)]
    repositories: HashMap<String, RepositoryEntry>,
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn bus_config(args: &Args) -> BusConfig {
    BusConfig {
        brokers: args.brokers.clone(),
        group_id: args.group_id.clone(),
        client_id: args.client_id.clone(),
        request_topic: args.request_topic.clone(),
        status_topic: args.status_topic.clone(),
        signature_key: SecretString::from(args.signature_key.clone()),
        sasl: SaslConfig {
            enabled: args.sasl_enabled,
            username: args.sasl_username.clone(),
            password: args.sasl_password.clone().map(SecretString::from),
            handshake: args.sasl_handshake,
        },
        tls: TlsConfig {
            enabled: args.tls_enabled,
            insecure_skip_verify: args.tls_insecure_skip_verify,
        },
    }
}

fn api_key_storage(args: &Args) -> Result<Arc<dyn ApiKeyStorage>> {
    match args.api_key_storage {
        ApiKeyBackend::Static => {
            let key = hex::decode(&args.api_key).context("decoding --api-key as hex")?;
            Ok(Arc::new(StaticApiKeyStorage::new(key)))
        }
        ApiKeyBackend::Vault => {
            let address = args
                .vault_address
                .clone()
                .context("--vault-address is required with the vault backend")?;
            let token = args
                .vault_token
                .clone()
                .context("--vault-token is required with the vault backend")?;
            Ok(Arc::new(HttpApiKeyStorage::new(
                address,
                args.vault_path.clone(),
                args.vault_key_name.clone(),
                SecretString::from(token),
            )))
        }
    }
}

fn load_registry(path: &PathBuf) -> Result<InMemoryRegistry> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading registry file {}", path.display()))?;
    let parsed: RegistryFile = toml::from_str(&raw).context("parsing registry file")?;
    info!(
        repositories = parsed.repositories.len(),
        "repository registry loaded"
    );
    Ok(InMemoryRegistry::new(parsed.repositories))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    info!(base_url = %args.base_url, "starting ferry ingress");

    let registry = Arc::new(load_registry(&args.registry_file)?);

    let poster: Arc<dyn StatusPoster> = match (&args.upstream_base_url, &args.upstream_token) {
        (Some(base_url), Some(token)) => Arc::new(HttpStatusPoster::new(
            base_url.clone(),
            SecretString::from(token.clone()),
        )),
        _ => {
            warn!("no upstream API configured; deployment statuses will only be logged");
            Arc::new(LogStatusPoster)
        }
    };

    let cfg = bus_config(&args);
    // The ingress consumes statuses and produces requests.
    let bus = Arc::new(
        DualClient::new(&cfg, &cfg.status_topic, &cfg.request_topic)
            .context("setting up bus client")?,
    );

    let (delivery_tx, delivery_rx) = DualClient::delivery_channel();
    let consumer_bus = bus.clone();
    let consumer = tokio::spawn(async move { consumer_bus.consumer_loop(delivery_tx).await });
    let relay = tokio::spawn(relay::relay_loop(bus.clone(), delivery_rx, poster.clone()));

    let state = Arc::new(DispatchState {
        secrets: registry.clone(),
        teams: registry,
        api_keys: api_key_storage(&args)?,
        publisher: bus.clone(),
        poster,
    });
    let app = dispatch::router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen_address)
        .await
        .with_context(|| format!("binding {}", args.listen_address))?;
    info!(address = %args.listen_address, "webhook endpoint listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    server.await.context("webhook server")?;

    info!("shutting down");
    consumer.abort();
    relay.abort();
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
