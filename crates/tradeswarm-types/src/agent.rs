//! Agent identity, decisions and actions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::{ActionId, AgentId, DecisionId};

/// Static identity of an agent: who it is and what class it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: AgentId,
    /// Agent class (e.g. `product`), used for class-wide routing
    pub agent_type: String,
    pub name: String,
}

impl AgentIdentity {
    pub fn new(id: AgentId, agent_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            agent_type: agent_type.into(),
            name: name.into(),
        }
    }
}

/// Lifecycle status of an action. Actions are the unit of bounded
/// concurrency per agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Executing => write!(f, "executing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A single side-effecting action produced by a decision.
///
/// Lifecycle: `Pending` on creation, `Executing` once dispatched (and
/// inserted into the agent's active set), then `Completed` or `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAction {
    pub id: ActionId,
    /// Behavior-defined kind (e.g. `propose_transfer`, `send_alert`)
    pub kind: String,
    pub parameters: serde_json::Value,
    pub expected_outcome: String,
    pub status: ActionStatus,
}

impl AgentAction {
    pub fn new(
        kind: impl Into<String>,
        parameters: serde_json::Value,
        expected_outcome: impl Into<String>,
    ) -> Self {
        Self {
            id: ActionId::new(),
            kind: kind.into(),
            parameters,
            expected_outcome: expected_outcome.into(),
            status: ActionStatus::Pending,
        }
    }
}

/// One decision produced by an agent's decision cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecision {
    pub id: DecisionId,
    pub agent_id: AgentId,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    pub actions: Vec<AgentAction>,
    pub timestamp: DateTime<Utc>,
}

impl AgentDecision {
    pub fn new(
        agent_id: AgentId,
        confidence: f64,
        reasoning: impl Into<String>,
        actions: Vec<AgentAction>,
    ) -> Self {
        Self {
            id: DecisionId::new(),
            agent_id,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            actions,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_starts_pending() {
        let action = AgentAction::new("send_alert", serde_json::json!({}), "alert delivered");
        assert_eq!(action.status, ActionStatus::Pending);
    }

    #[test]
    fn test_decision_confidence_clamped() {
        let decision = AgentDecision::new(AgentId::new("a"), 1.7, "test", Vec::new());
        assert_eq!(decision.confidence, 1.0);
    }
}
