//! Agent configuration.

/// Namespace used for team clients when team namespaces are disabled.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Runtime configuration for the agent's execution loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// This agent's cluster identity. Only requests addressed to this
    /// cluster are processed.
    pub cluster: String,

    /// Deploy into a namespace named after the team instead of
    /// [`DEFAULT_NAMESPACE`].
    pub team_namespaces: bool,

    /// Create the team's service account on first client construction.
    pub auto_create_service_account: bool,
}

impl AgentConfig {
    /// The namespace resources for `team` are applied into.
    #[must_use]
    pub fn namespace<'a>(&self, team: &'a str) -> &'a str {
        if self.team_namespaces {
            team
        } else {
            DEFAULT_NAMESPACE
        }
    }
}
