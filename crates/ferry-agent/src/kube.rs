//! Kube-backed orchestrator client.
//!
//! Resources arrive as untyped JSON, so everything goes through
//! [`DynamicObject`] APIs resolved at runtime via discovery. Application
//! uses server-side apply, which makes redelivered requests idempotent.
//! Rollout waiting polls the live object until it converges or the
//! monitor deadline passes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::{ClientError, TeamClient, TeamClientProvider};
use crate::resource::Resource;

/// Field manager name used for server-side apply.
const FIELD_MANAGER: &str = "ferry-agent";

/// How often a rollout wait polls the live object.
const ROLLOUT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Resolves and caches kube-backed team clients.
pub struct KubeTeamClientProvider {
    client: Client,
    cache: Mutex<HashMap<(String, String), Arc<KubeTeamClient>>>,
}

impl KubeTeamClientProvider {
    /// Wraps an established cluster connection.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn ensure_service_account(&self, team: &str, namespace: &str) -> Result<(), ClientError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let account = ServiceAccount {
            metadata: kube::core::ObjectMeta {
                name: Some(team.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &account).await {
            Ok(_) => {
                info!(team, namespace, "service account created");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(team, namespace, "service account already exists");
                Ok(())
            }
            Err(err) => Err(ClientError::TeamClient(format!(
                "creating service account for team '{team}': {err}"
            ))),
        }
    }
}

#[async_trait]
impl TeamClientProvider for KubeTeamClientProvider {
    async fn team_client(
        &self,
        team: &str,
        namespace: &str,
        auto_create_service_account: bool,
    ) -> Result<Arc<dyn TeamClient>, ClientError> {
        let key = (team.to_owned(), namespace.to_owned());
        let mut cache = self.cache.lock().await;
        if let Some(client) = cache.get(&key) {
            return Ok(client.clone());
        }

        if auto_create_service_account {
            self.ensure_service_account(team, namespace).await?;
        }

        let client = Arc::new(KubeTeamClient {
            client: self.client.clone(),
            namespace: namespace.to_owned(),
        });
        cache.insert(key, client.clone());
        Ok(client)
    }
}

/// A team-scoped handle applying resources into one namespace.
pub struct KubeTeamClient {
    client: Client,
    namespace: String,
}

impl KubeTeamClient {
    async fn dynamic_api(&self, resource: &Resource) -> Result<Api<DynamicObject>, ClientError> {
        let gvk = GroupVersionKind {
            group: resource.group().to_owned(),
            version: resource.version().to_owned(),
            kind: resource.kind().to_owned(),
        };

        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|err| ClientError::Apply(format!("discovering API resources: {err}")))?;

        for group in discovery.groups() {
            for (api_resource, capabilities) in group.recommended_resources() {
                if api_resource.group == gvk.group
                    && api_resource.version == gvk.version
                    && api_resource.kind == gvk.kind
                {
                    let api = if matches!(capabilities.scope, Scope::Namespaced) {
                        let namespace = if resource.namespace().is_empty() {
                            self.namespace.as_str()
                        } else {
                            resource.namespace()
                        };
                        Api::namespaced_with(self.client.clone(), namespace, &api_resource)
                    } else {
                        Api::all_with(self.client.clone(), &api_resource)
                    };
                    return Ok(api);
                }
            }
        }

        Err(ClientError::Apply(format!(
            "no API resource for {}/{} {}",
            gvk.group, gvk.version, gvk.kind
        )))
    }
}

#[async_trait]
impl TeamClient for KubeTeamClient {
    async fn apply(&self, resource: &Resource) -> Result<Resource, ClientError> {
        if resource.name().is_empty() {
            return Err(ClientError::Apply("resource carries no name".to_owned()));
        }

        let api = self.dynamic_api(resource).await?;
        let params = PatchParams::apply(FIELD_MANAGER);
        let applied = api
            .patch(resource.name(), &params, &Patch::Apply(resource.value()))
            .await
            .map_err(|err| ClientError::Apply(err.to_string()))?;

        let value = serde_json::to_value(&applied)
            .map_err(|err| ClientError::Apply(format!("reading applied object: {err}")))?;
        Resource::new(value).map_err(|_| ClientError::Apply("applied object is not an object".to_owned()))
    }

    async fn wait_for_rollout(
        &self,
        resource: &Resource,
        deadline: Instant,
    ) -> Result<(), ClientError> {
        let api = self
            .dynamic_api(resource)
            .await
            .map_err(|err| ClientError::Rollout(err.to_string()))?;

        loop {
            let live = api
                .get_opt(resource.name())
                .await
                .map_err(|err| ClientError::Rollout(err.to_string()))?;

            if let Some(live) = live {
                let value = serde_json::to_value(&live)
                    .map_err(|err| ClientError::Rollout(err.to_string()))?;
                if converged(resource, &value) {
                    return Ok(());
                }
            }

            if Instant::now() + ROLLOUT_POLL_INTERVAL > deadline {
                return Err(ClientError::RolloutDeadline {
                    kind: resource.kind().to_owned(),
                    name: resource.name().to_owned(),
                });
            }
            tokio::time::sleep(ROLLOUT_POLL_INTERVAL).await;
        }
    }
}

/// Whether the live object has reached its desired rollout state.
fn converged(resource: &Resource, live: &Value) -> bool {
    match resource.kind() {
        "Deployment" => deployment_converged(live),
        "Application" => application_rolled_out(live),
        _ => true,
    }
}

/// Rollout check for `apps`/`extensions` Deployments: the controller has
/// observed the latest generation and every desired replica is updated
/// and available.
fn deployment_converged(live: &Value) -> bool {
    let generation = live.pointer("/metadata/generation").and_then(Value::as_i64);
    let observed = live
        .pointer("/status/observedGeneration")
        .and_then(Value::as_i64);
    if observed < generation {
        return false;
    }

    let desired = live
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let updated = live
        .pointer("/status/updatedReplicas")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let available = live
        .pointer("/status/availableReplicas")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let unavailable = live
        .pointer("/status/unavailableReplicas")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    updated >= desired && available >= desired && unavailable == 0
}

/// Rollout check for `nais.io` Applications: the operator reports the
/// synchronization as rolled out.
fn application_rolled_out(live: &Value) -> bool {
    live.pointer("/status/synchronizationState")
        .and_then(Value::as_str)
        == Some("RolloutComplete")
}
