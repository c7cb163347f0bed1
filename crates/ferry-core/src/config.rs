//! Bus configuration shared by the ingress and the agent.

use secrecy::SecretString;
use serde::Deserialize;

/// Message bus connection and topic configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Broker addresses (`host:port`).
    pub brokers: Vec<String>,

    /// Consumer group ID. Each agent uses a group keyed by its cluster so
    /// a newly provisioned agent replays the backlog addressed to it.
    pub group_id: String,

    /// Client ID prefix; `-consumer` and `-producer` are appended per
    /// connection role.
    pub client_id: String,

    /// Topic carrying [`crate::protocol::DeploymentRequest`] frames.
    pub request_topic: String,

    /// Topic carrying [`crate::protocol::DeploymentStatus`] frames.
    pub status_topic: String,

    /// Shared key for the envelope MAC.
    pub signature_key: SecretString,

    /// SASL authentication settings.
    #[serde(default)]
    pub sasl: SaslConfig,

    /// TLS transport settings.
    #[serde(default)]
    pub tls: TlsConfig,
}

/// SASL/PLAIN authentication towards the brokers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaslConfig {
    /// Whether SASL authentication is enabled.
    #[serde(default)]
    pub enabled: bool,

    /// SASL username.
    #[serde(default)]
    pub username: String,

    /// SASL password.
    #[serde(default)]
    pub password: Option<SecretString>,

    /// Whether to perform the SASL handshake. Accepted for configuration
    /// compatibility; the underlying client always performs the handshake
    /// against brokers speaking protocol 0.10 or newer.
    #[serde(default = "default_true")]
    pub handshake: bool,
}

/// TLS transport towards the brokers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// Whether TLS is enabled.
    #[serde(default)]
    pub enabled: bool,

    /// Disable certificate verification. Only for test rigs.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_true() -> bool {
    true
}

impl BusConfig {
    /// The `security.protocol` value implied by the SASL and TLS settings.
    #[must_use]
    pub fn security_protocol(&self) -> &'static str {
        match (self.sasl.enabled, self.tls.enabled) {
            (true, true) => "sasl_ssl",
            (true, false) => "sasl_plaintext",
            (false, true) => "ssl",
            (false, false) => "plaintext",
        }
    }
}
