//! Credential and registry storage interfaces.
//!
//! The dispatcher consumes three narrow read interfaces: team API keys,
//! per-installation webhook secrets, and the per-repository team
//! allowlist. Backends are pluggable; this module ships an in-memory
//! registry (file-seeded, used by the ingress and by tests) and an HTTP
//! key/value reader for API keys.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

/// Errors from the storage interfaces.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested entry does not exist.
    #[error("not found")]
    NotFound,

    /// The backend returned an unexpected HTTP status.
    #[error("storage backend returned HTTP {status}")]
    BackendStatus {
        /// The offending status code.
        status: u16,
    },

    /// Transport-level failure talking to the backend.
    #[error("storage backend request")]
    Transport(#[from] reqwest::Error),

    /// The stored value could not be decoded.
    #[error("decoding stored value")]
    Decode(#[source] hex::FromHexError),
}

/// Read access to per-team API keys.
#[async_trait]
pub trait ApiKeyStorage: Send + Sync {
    /// Returns the API key for `team`.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] when no key is stored for the team.
    async fn read(&self, team: &str) -> Result<Vec<u8>, StorageError>;
}

/// A single static key handed to every team. Development and test rigs
/// only.
pub struct StaticApiKeyStorage {
    key: Vec<u8>,
}

impl StaticApiKeyStorage {
    /// Wraps a fixed key.
    #[must_use]
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }
}

#[async_trait]
impl ApiKeyStorage for StaticApiKeyStorage {
    async fn read(&self, _team: &str) -> Result<Vec<u8>, StorageError> {
        Ok(self.key.clone())
    }
}

/// API keys read from an HTTP key/value store (Vault-style layout): a GET
/// of `{address}/{path}/{team}` returns `{"data": {"<key_name>": "<hex>"}}`.
pub struct HttpApiKeyStorage {
    address: String,
    path: String,
    key_name: String,
    token: SecretString,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct KeyValueResponse {
    #[serde(default)]
    data: HashMap<String, String>,
}

impl HttpApiKeyStorage {
    /// Creates a reader against `address`, reading keys under `path` and
    /// extracting the `key_name` field, authenticated with a bearer token.
    #[must_use]
    pub fn new(address: String, path: String, key_name: String, token: SecretString) -> Self {
        Self {
            address,
            path,
            key_name,
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ApiKeyStorage for HttpApiKeyStorage {
    async fn read(&self, team: &str) -> Result<Vec<u8>, StorageError> {
        let url = format!(
            "{}/{}/{}",
            self.address.trim_end_matches('/'),
            self.path.trim_matches('/'),
            team
        );
        let response = self
            .client
            .get(url)
            .bearer_auth(self.token.expose_secret())
            .send()
            .await?;

        match response.status().as_u16() {
            200 => {
                let body: KeyValueResponse = response.json().await?;
                let encoded = body
                    .data
                    .get(&self.key_name)
                    .ok_or(StorageError::NotFound)?;
                hex::decode(encoded).map_err(StorageError::Decode)
            }
            404 => Err(StorageError::NotFound),
            status => Err(StorageError::BackendStatus { status }),
        }
    }
}

/// A per-installation webhook secret.
#[derive(Clone)]
pub struct InstallationSecret {
    /// Shared secret used to authenticate webhook deliveries.
    pub webhook_secret: SecretString,
}

/// Read access to per-installation webhook secrets, keyed by the
/// repository full name (`owner/name`).
#[async_trait]
pub trait InstallationSecretSource: Send + Sync {
    /// Returns the installation secret for `repo_full_name`.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] when the repository has no installation.
    async fn installation_secret(
        &self,
        repo_full_name: &str,
    ) -> Result<InstallationSecret, StorageError>;
}

/// Read access to the team allowlist per repository.
#[async_trait]
pub trait TeamRepositories: Send + Sync {
    /// Returns the teams allowed to deploy `repo_full_name`.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] when the repository is unknown.
    async fn teams(&self, repo_full_name: &str) -> Result<Vec<String>, StorageError>;
}

/// One registry entry: the installation's webhook secret plus the teams
/// allowed to deploy from the repository.
#[derive(Clone, Deserialize)]
pub struct RepositoryEntry {
    /// Webhook shared secret for the installation.
    pub webhook_secret: SecretString,

    /// Teams allowed to deploy this repository.
    #[serde(default)]
    pub teams: Vec<String>,
}

/// File-seeded in-memory registry backing both the secret source and the
/// team allowlist.
#[derive(Default)]
pub struct InMemoryRegistry {
    repositories: HashMap<String, RepositoryEntry>,
}

impl InMemoryRegistry {
    /// Builds a registry from pre-parsed entries.
    #[must_use]
    pub fn new(repositories: HashMap<String, RepositoryEntry>) -> Self {
        Self { repositories }
    }
}

#[async_trait]
impl InstallationSecretSource for InMemoryRegistry {
    async fn installation_secret(
        &self,
        repo_full_name: &str,
    ) -> Result<InstallationSecret, StorageError> {
        self.repositories
            .get(repo_full_name)
            .map(|entry| InstallationSecret {
                webhook_secret: entry.webhook_secret.clone(),
            })
            .ok_or(StorageError::NotFound)
    }
}

#[async_trait]
impl TeamRepositories for InMemoryRegistry {
    async fn teams(&self, repo_full_name: &str) -> Result<Vec<String>, StorageError> {
        self.repositories
            .get(repo_full_name)
            .map(|entry| entry.teams.clone())
            .ok_or(StorageError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> InMemoryRegistry {
        let mut repositories = HashMap::new();
        repositories.insert(
            "acme/widgets".to_owned(),
            RepositoryEntry {
                webhook_secret: SecretString::from("s3cret"),
                teams: vec!["platform".to_owned()],
            },
        );
        InMemoryRegistry::new(repositories)
    }

    #[tokio::test]
    async fn static_storage_returns_fixed_key() {
        let storage = StaticApiKeyStorage::new(b"k".to_vec());
        assert_eq!(storage.read("any-team").await.unwrap(), b"k");
    }

    #[tokio::test]
    async fn registry_secret_lookup() {
        let reg = registry();
        let secret = reg.installation_secret("acme/widgets").await.unwrap();
        assert_eq!(secret.webhook_secret.expose_secret(), "s3cret");

        let missing = reg.installation_secret("acme/unknown").await;
        assert!(matches!(missing, Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn registry_team_lookup() {
        let reg = registry();
        assert_eq!(reg.teams("acme/widgets").await.unwrap(), vec!["platform"]);
        assert!(matches!(
            reg.teams("other/repo").await,
            Err(StorageError::NotFound)
        ));
    }
}
