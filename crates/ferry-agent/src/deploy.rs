//! The agent execution loop: decide, apply, report.
//!
//! [`prepare`] gates every incoming request on cluster identity and
//! deadline. [`run`] carries one accepted request through namespace
//! resolution, team-client lookup, resource decoding, and sequential
//! application, spawning a rollout monitor for every monitorable resource
//! *before* applying it so that rapidly converging rollouts are still
//! observed.
//!
//! Every path through [`run`] emits exactly one primary status on the
//! status channel: nothing for foreign-cluster messages, `failure` or
//! `error` on the early exits, and `in_progress` or `success` after all
//! resources applied. Monitor tasks emit their own terminal statuses
//! independently.

use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ferry_core::protocol::{DeploymentRequest, DeploymentStatus};

use crate::client::TeamClientProvider;
use crate::config::AgentConfig;
use crate::monitor;
use crate::resource::Resource;

/// Reasons a request is not processed by this agent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrepareError {
    /// The request is addressed to a different cluster.
    #[error("message belongs to cluster '{addressed}'")]
    NotMyCluster {
        /// The cluster the request names.
        addressed: String,
    },

    /// The request's deadline has passed.
    #[error("deadline exceeded by {late_by} seconds")]
    DeadlineExceeded {
        /// Seconds past the deadline at evaluation time.
        late_by: i64,
    },
}

/// Decides whether this agent should process `req` at time `now`.
///
/// # Errors
///
/// [`PrepareError::NotMyCluster`] when the request is addressed
/// elsewhere (a silent drop), [`PrepareError::DeadlineExceeded`] when the
/// request is ours but too old to serve.
pub fn prepare(req: &DeploymentRequest, cluster: &str, now: i64) -> Result<(), PrepareError> {
    if req.cluster != cluster {
        return Err(PrepareError::NotMyCluster {
            addressed: req.cluster.clone(),
        });
    }
    if now > req.deadline {
        return Err(PrepareError::DeadlineExceeded {
            late_by: now - req.deadline,
        });
    }
    Ok(())
}

#[allow(clippy::cast_possible_wrap)]
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

async fn emit(status_tx: &mpsc::Sender<DeploymentStatus>, status: DeploymentStatus) {
    if status_tx.send(status).await.is_err() {
        warn!("status channel closed; dropping status");
    }
}

/// Processes one deployment request end to end.
///
/// Invoked in its own task per message; never panics the dispatcher and
/// never emits more than one primary status.
pub async fn run(
    req: DeploymentRequest,
    cfg: Arc<AgentConfig>,
    provider: Arc<dyn TeamClientProvider>,
    status_tx: mpsc::Sender<DeploymentStatus>,
) {
    if let Err(err) = prepare(&req, &cfg.cluster, now_unix()) {
        match err {
            PrepareError::NotMyCluster { ref addressed } => {
                debug!(
                    delivery_id = %req.delivery_id,
                    cluster = %cfg.cluster,
                    addressed = %addressed,
                    "dropping message addressed to another cluster"
                );
            }
            PrepareError::DeadlineExceeded { .. } => {
                info!(delivery_id = %req.delivery_id, error = %err, "dropping expired message");
                counter!("ferry_agent_expired_total").increment(1);
                emit(&status_tx, DeploymentStatus::failure(&req, &err)).await;
            }
        }
        return;
    }

    let payload = match req.payload_spec() {
        Ok(payload) => payload,
        Err(err) => {
            emit(&status_tx, DeploymentStatus::error(&req, &err)).await;
            return;
        }
    };

    let namespace = cfg.namespace(&payload.team);
    let team_client = match provider
        .team_client(&payload.team, namespace, cfg.auto_create_service_account)
        .await
    {
        Ok(client) => client,
        Err(err) => {
            emit(&status_tx, DeploymentStatus::error(&req, &err)).await;
            return;
        }
    };

    if payload.resources.is_empty() {
        emit(
            &status_tx,
            DeploymentStatus::error(&req, &"no resources to deploy"),
        )
        .await;
        return;
    }

    let mut resources = match Resource::from_raw(&payload.resources) {
        Ok(resources) => resources,
        Err(err) => {
            emit(&status_tx, DeploymentStatus::error(&req, &err)).await;
            return;
        }
    };

    info!(
        delivery_id = %req.delivery_id,
        team = %payload.team,
        namespace = %namespace,
        resources = resources.len(),
        "accepting incoming deployment request"
    );

    let mut monitorable = 0;

    for (index, resource) in resources.iter_mut().enumerate() {
        resource.set_correlation_id(&req.delivery_id);

        if resource.monitorable() {
            monitorable += 1;
            info!(
                delivery_id = %req.delivery_id,
                kind = %resource.kind(),
                name = %resource.name(),
                namespace = %resource.namespace(),
                "monitoring rollout"
            );
            let _ = monitor::spawn(
                team_client.clone(),
                req.clone(),
                resource.clone(),
                status_tx.clone(),
            );
        }

        match team_client.apply(resource).await {
            Ok(applied) => {
                counter!("ferry_agent_resources_applied_total").increment(1);
                info!(
                    delivery_id = %req.delivery_id,
                    kind = %applied.kind(),
                    name = %applied.name(),
                    "resource {} successfully applied", index + 1
                );
            }
            Err(err) => {
                emit(
                    &status_tx,
                    DeploymentStatus::failure(&req, &format!("resource {}: {err}", index + 1)),
                )
                .await;
                return;
            }
        }
    }

    if monitorable > 0 {
        emit(&status_tx, DeploymentStatus::in_progress(&req)).await;
    } else {
        emit(&status_tx, DeploymentStatus::success(&req)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Instant;

    use ferry_core::protocol::DeploymentState;

    use crate::client::{ClientError, TeamClient, TeamClientProvider};

    use super::*;

    fn request(cluster: &str, deadline_offset: i64, payload: serde_json::Value) -> DeploymentRequest {
        let now = now_unix();
        DeploymentRequest {
            deployment: None,
            delivery_id: "d-1".to_owned(),
            cluster: cluster.to_owned(),
            timestamp: now,
            deadline: now + deadline_offset,
            payload: serde_json::to_vec(&payload).unwrap(),
        }
    }

    fn payload(resources: serde_json::Value) -> serde_json::Value {
        json!({"team": "platform", "resources": resources})
    }

    /// Recording orchestrator double: applies succeed until `fail_at`
    /// (1-based), rollouts follow `rollout_ok`.
    struct MockClient {
        applied: Mutex<Vec<Resource>>,
        fail_at: Option<usize>,
        rollout_ok: bool,
    }

    impl MockClient {
        fn new(fail_at: Option<usize>, rollout_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                applied: Mutex::new(Vec::new()),
                fail_at,
                rollout_ok,
            })
        }

        fn applied(&self) -> Vec<Resource> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TeamClient for MockClient {
        async fn apply(&self, resource: &Resource) -> Result<Resource, ClientError> {
            let mut applied = self.applied.lock().unwrap();
            if self.fail_at == Some(applied.len() + 1) {
                return Err(ClientError::Apply("admission webhook denied".to_owned()));
            }
            applied.push(resource.clone());
            Ok(resource.clone())
        }

        async fn wait_for_rollout(
            &self,
            resource: &Resource,
            _deadline: Instant,
        ) -> Result<(), ClientError> {
            if self.rollout_ok {
                Ok(())
            } else {
                Err(ClientError::RolloutDeadline {
                    kind: resource.kind().to_owned(),
                    name: resource.name().to_owned(),
                })
            }
        }
    }

    struct MockProvider {
        client: Arc<MockClient>,
        fail: bool,
        requested: Mutex<Vec<(String, String, bool)>>,
    }

    impl MockProvider {
        fn new(client: Arc<MockClient>) -> Arc<Self> {
            Arc::new(Self {
                client,
                fail: false,
                requested: Mutex::new(Vec::new()),
            })
        }

        fn failing(client: Arc<MockClient>) -> Arc<Self> {
            Arc::new(Self {
                client,
                fail: true,
                requested: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TeamClientProvider for MockProvider {
        async fn team_client(
            &self,
            team: &str,
            namespace: &str,
            auto_create_service_account: bool,
        ) -> Result<Arc<dyn TeamClient>, ClientError> {
            self.requested.lock().unwrap().push((
                team.to_owned(),
                namespace.to_owned(),
                auto_create_service_account,
            ));
            if self.fail {
                return Err(ClientError::TeamClient("credentials unavailable".to_owned()));
            }
            Ok(self.client.clone())
        }
    }

    fn config(cluster: &str) -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            cluster: cluster.to_owned(),
            team_namespaces: false,
            auto_create_service_account: false,
        })
    }

    fn configmap(name: &str) -> serde_json::Value {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}})
    }

    fn deployment(name: &str) -> serde_json::Value {
        json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": name}})
    }

    async fn drain(
        rx: &mut mpsc::Receiver<DeploymentStatus>,
        expected: usize,
    ) -> Vec<DeploymentStatus> {
        let mut statuses = Vec::new();
        for _ in 0..expected {
            let status = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for status")
                .expect("status channel closed early");
            statuses.push(status);
        }
        statuses
    }

    #[test]
    fn prepare_rejects_foreign_cluster() {
        let req = request("other", 60, payload(json!([])));
        let err = prepare(&req, "mine", now_unix()).unwrap_err();
        assert!(matches!(err, PrepareError::NotMyCluster { .. }));
    }

    #[test]
    fn prepare_rejects_expired() {
        let req = request("mine", -10, payload(json!([])));
        let err = prepare(&req, "mine", now_unix()).unwrap_err();
        assert!(matches!(err, PrepareError::DeadlineExceeded { .. }));
    }

    #[test]
    fn prepare_accepts_own_cluster_in_deadline() {
        let req = request("mine", 60, payload(json!([])));
        assert!(prepare(&req, "mine", now_unix()).is_ok());
    }

    #[tokio::test]
    async fn foreign_cluster_is_a_silent_drop() {
        let client = MockClient::new(None, true);
        let provider = MockProvider::new(client.clone());
        let (tx, mut rx) = mpsc::channel(16);

        let req = request("cluster-b", 60, payload(json!([configmap("cfg")])));
        run(req, config("cluster-a"), provider.clone(), tx).await;

        assert!(rx.try_recv().is_err(), "no status expected");
        assert!(client.applied().is_empty());
        assert!(provider.requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_request_fails_without_orchestrator_calls() {
        let client = MockClient::new(None, true);
        let provider = MockProvider::new(client.clone());
        let (tx, mut rx) = mpsc::channel(16);

        let req = request("cluster-a", -1, payload(json!([configmap("cfg")])));
        run(req, config("cluster-a"), provider, tx).await;

        let statuses = drain(&mut rx, 1).await;
        assert_eq!(statuses[0].state(), DeploymentState::Failure);
        assert!(statuses[0].description.contains("deadline"));
        assert!(rx.try_recv().is_err(), "exactly one status expected");
        assert!(client.applied().is_empty());
    }

    #[tokio::test]
    async fn team_client_failure_emits_error() {
        let client = MockClient::new(None, true);
        let provider = MockProvider::failing(client);
        let (tx, mut rx) = mpsc::channel(16);

        let req = request("c", 60, payload(json!([configmap("cfg")])));
        run(req, config("c"), provider, tx).await;

        let statuses = drain(&mut rx, 1).await;
        assert_eq!(statuses[0].state(), DeploymentState::Error);
    }

    #[tokio::test]
    async fn undecodable_payload_emits_error() {
        let client = MockClient::new(None, true);
        let provider = MockProvider::new(client);
        let (tx, mut rx) = mpsc::channel(16);

        let now = now_unix();
        let req = DeploymentRequest {
            deployment: None,
            delivery_id: "d-1".to_owned(),
            cluster: "c".to_owned(),
            timestamp: now,
            deadline: now + 60,
            payload: b"not json".to_vec(),
        };
        run(req, config("c"), provider, tx).await;

        let statuses = drain(&mut rx, 1).await;
        assert_eq!(statuses[0].state(), DeploymentState::Error);
    }

    #[tokio::test]
    async fn empty_resource_list_emits_error() {
        let client = MockClient::new(None, true);
        let provider = MockProvider::new(client.clone());
        let (tx, mut rx) = mpsc::channel(16);

        let req = request("c", 60, payload(json!([])));
        run(req, config("c"), provider, tx).await;

        let statuses = drain(&mut rx, 1).await;
        assert_eq!(statuses[0].state(), DeploymentState::Error);
        assert!(statuses[0].description.contains("no resources"));
        assert!(client.applied().is_empty());
    }

    #[tokio::test]
    async fn undecodable_resource_emits_error_with_index() {
        let client = MockClient::new(None, true);
        let provider = MockProvider::new(client);
        let (tx, mut rx) = mpsc::channel(16);

        let req = request("c", 60, payload(json!([configmap("a"), [1, 2]])));
        run(req, config("c"), provider, tx).await;

        let statuses = drain(&mut rx, 1).await;
        assert_eq!(statuses[0].state(), DeploymentState::Error);
        assert!(statuses[0].description.contains("resource 2"));
    }

    #[tokio::test]
    async fn non_monitorable_resource_succeeds_without_monitor() {
        let client = MockClient::new(None, true);
        let provider = MockProvider::new(client.clone());
        let (tx, mut rx) = mpsc::channel(16);

        let req = request("c", 60, payload(json!([configmap("cfg")])));
        run(req, config("c"), provider, tx).await;

        let statuses = drain(&mut rx, 1).await;
        assert_eq!(statuses[0].state(), DeploymentState::Success);
        assert!(rx.try_recv().is_err(), "no monitor status expected");
        assert_eq!(client.applied().len(), 1);
    }

    #[tokio::test]
    async fn monitorable_resource_reports_in_progress_then_monitor_success() {
        let client = MockClient::new(None, true);
        let provider = MockProvider::new(client.clone());
        let (tx, mut rx) = mpsc::channel(16);

        let req = request("c", 60, payload(json!([deployment("web")])));
        run(req, config("c"), provider, tx).await;

        let statuses = drain(&mut rx, 2).await;
        let states: Vec<_> = statuses.iter().map(DeploymentStatus::state).collect();
        assert!(states.contains(&DeploymentState::InProgress));
        assert!(states.contains(&DeploymentState::Success));
        assert_eq!(client.applied().len(), 1);
    }

    #[tokio::test]
    async fn failed_rollout_reports_failure_from_monitor() {
        let client = MockClient::new(None, false);
        let provider = MockProvider::new(client);
        let (tx, mut rx) = mpsc::channel(16);

        let req = request("c", 60, payload(json!([deployment("web")])));
        run(req, config("c"), provider, tx).await;

        let statuses = drain(&mut rx, 2).await;
        let states: Vec<_> = statuses.iter().map(DeploymentStatus::state).collect();
        assert!(states.contains(&DeploymentState::InProgress));
        assert!(states.contains(&DeploymentState::Failure));
    }

    #[tokio::test]
    async fn apply_failure_names_resource_and_halts() {
        let client = MockClient::new(Some(2), true);
        let provider = MockProvider::new(client.clone());
        let (tx, mut rx) = mpsc::channel(16);

        let req = request(
            "c",
            60,
            payload(json!([configmap("one"), configmap("two"), configmap("three")])),
        );
        run(req, config("c"), provider, tx).await;

        let statuses = drain(&mut rx, 1).await;
        assert_eq!(statuses[0].state(), DeploymentState::Failure);
        assert!(statuses[0].description.contains("resource 2"));
        assert!(rx.try_recv().is_err(), "exactly one status expected");

        // Resource one applied in order; three never attempted.
        let applied = client.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].name(), "one");
    }

    #[tokio::test]
    async fn applied_resources_carry_correlation_id() {
        let client = MockClient::new(None, true);
        let provider = MockProvider::new(client.clone());
        let (tx, mut rx) = mpsc::channel(16);

        let req = request("c", 60, payload(json!([configmap("a"), configmap("b")])));
        run(req, config("c"), provider, tx).await;

        drain(&mut rx, 1).await;
        let applied = client.applied();
        assert_eq!(applied.len(), 2);
        for resource in &applied {
            assert_eq!(
                resource.annotation(crate::resource::CORRELATION_ID_ANNOTATION),
                Some("d-1")
            );
        }
    }

    #[tokio::test]
    async fn namespace_follows_team_when_enabled() {
        let client = MockClient::new(None, true);
        let provider = MockProvider::new(client);
        let (tx, mut rx) = mpsc::channel(16);

        let cfg = Arc::new(AgentConfig {
            cluster: "c".to_owned(),
            team_namespaces: true,
            auto_create_service_account: true,
        });
        let req = request("c", 60, payload(json!([configmap("cfg")])));
        run(req, cfg, provider.clone(), tx).await;

        drain(&mut rx, 1).await;
        let requested = provider.requested.lock().unwrap();
        assert_eq!(
            requested.as_slice(),
            &[("platform".to_owned(), "platform".to_owned(), true)]
        );
    }

    #[tokio::test]
    async fn mixed_resources_monitor_only_the_monitorable() {
        let client = MockClient::new(None, true);
        let provider = MockProvider::new(client.clone());
        let (tx, mut rx) = mpsc::channel(16);

        let req = request(
            "c",
            60,
            payload(json!([configmap("cfg"), deployment("web")])),
        );
        run(req, config("c"), provider, tx).await;

        // Primary in_progress plus exactly one monitor terminal.
        let statuses = drain(&mut rx, 2).await;
        let states: Vec<_> = statuses.iter().map(DeploymentStatus::state).collect();
        assert!(states.contains(&DeploymentState::InProgress));
        assert!(states.contains(&DeploymentState::Success));
        assert!(rx.try_recv().is_err());
        assert_eq!(client.applied().len(), 2);
    }
}
