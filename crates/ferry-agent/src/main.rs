//! ferry-agent: per-cluster deployment agent.
//!
//! Consumes signed deployment requests from the bus, applies the ones
//! addressed to this cluster against the local orchestrator, and
//! publishes status transitions back to the bus.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ferry_agent::config::AgentConfig;
use ferry_agent::kube::KubeTeamClientProvider;
use ferry_agent::{dispatcher, publisher};
use ferry_core::bus::DualClient;
use ferry_core::config::{BusConfig, SaslConfig, TlsConfig};

/// ferry agent - per-cluster deployment executor
#[derive(Parser, Debug)]
#[command(name = "ferry-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// This agent's cluster identity
    #[arg(long)]
    cluster: String,

    /// Deploy into a namespace named after the team
    #[arg(long)]
    team_namespaces: bool,

    /// Create team service accounts on first use
    #[arg(long)]
    auto_create_service_account: bool,

    /// Bus broker addresses
    #[arg(long = "kafka-brokers", value_delimiter = ',', default_value = "localhost:9092")]
    brokers: Vec<String>,

    /// Bus consumer group ID; defaults to a group keyed by cluster
    #[arg(long = "kafka-group-id")]
    group_id: Option<String>,

    /// Bus client ID prefix
    #[arg(long = "kafka-client-id", default_value = "ferry-agent")]
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

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
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
        group_id: args
            .group_id
            .clone()
            .unwrap_or_else(|| format!("ferry-agent-{}", args.cluster)),
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

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    info!(cluster = %args.cluster, "starting ferry agent");

    let agent_cfg = Arc::new(AgentConfig {
        cluster: args.cluster.clone(),
        team_namespaces: args.team_namespaces,
        auto_create_service_account: args.auto_create_service_account,
    });

    let kube_client = kube::Client::try_default()
        .await
        .context("connecting to the orchestrator")?;
    let provider = Arc::new(KubeTeamClientProvider::new(kube_client));

    let cfg = bus_config(&args);
    // The agent consumes requests and produces statuses.
    let bus = Arc::new(
        DualClient::new(&cfg, &cfg.request_topic, &cfg.status_topic)
            .context("setting up bus client")?,
    );

    let (delivery_tx, delivery_rx) = DualClient::delivery_channel();
    let (status_tx, status_rx) = publisher::status_channel();

    let consumer_bus = bus.clone();
    let consumer = tokio::spawn(async move { consumer_bus.consumer_loop(delivery_tx).await });
    let dispatch = tokio::spawn(dispatcher::dispatch_loop(
        bus.clone(),
        delivery_rx,
        agent_cfg,
        provider,
        status_tx,
    ));
    let publish = tokio::spawn(publisher::publish_loop(bus.clone(), status_rx));

    shutdown_signal().await;
    info!("shutting down");

    consumer.abort();
    dispatch.abort();
    publish.abort();
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
