//! Upstream deployment-event payload.
//!
//! Only the fields the dispatcher reads are modeled; everything else in
//! the provider's event JSON is ignored.

use serde::Deserialize;

/// A `deployment` event delivery.
#[derive(Debug, Deserialize)]
pub struct DeploymentEvent {
    /// The deployment record created upstream.
    pub deployment: Option<EventDeployment>,

    /// The repository the event originates from.
    pub repository: Option<EventRepository>,
}

/// The deployment record embedded in the event.
#[derive(Debug, Deserialize)]
pub struct EventDeployment {
    /// Provider-assigned deployment record ID.
    pub id: i64,

    /// Target environment; ferry routes on this as the cluster identity.
    #[serde(default)]
    pub environment: String,

    /// Free-form application payload (team plus resources).
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The repository embedded in the event.
#[derive(Debug, Deserialize)]
pub struct EventRepository {
    /// `owner/name` form.
    pub full_name: String,
}

impl EventRepository {
    /// Splits the full name into `(owner, name)`.
    ///
    /// # Errors
    ///
    /// Returns the offending string when it does not contain exactly one
    /// separator with non-empty halves.
    pub fn split(&self) -> Result<(&str, &str), &str> {
        match self.full_name.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok((owner, name))
            }
            _ => Err(self.full_name.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_event() {
        let event: DeploymentEvent = serde_json::from_str(
            r#"{
                "deployment": {
                    "id": 7,
                    "environment": "prod",
                    "payload": {"team": "platform", "resources": []}
                },
                "repository": {"full_name": "acme/widgets"}
            }"#,
        )
        .unwrap();

        let deployment = event.deployment.unwrap();
        assert_eq!(deployment.id, 7);
        assert_eq!(deployment.environment, "prod");
        let repo = event.repository.unwrap();
        assert_eq!(repo.split().unwrap(), ("acme", "widgets"));
    }

    #[test]
    fn split_rejects_malformed_names() {
        for name in ["acme", "acme/", "/widgets", "a/b/c"] {
            let repo = EventRepository {
                full_name: name.to_owned(),
            };
            assert!(repo.split().is_err(), "{name} should be rejected");
        }
    }
}
