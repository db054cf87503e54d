//! Inter-agent messages
//!
//! Messages are immutable once created. Routing is by the `to` target:
//! a specific agent id, the `"all"` broadcast, or a topic name resolved by
//! the manager's router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::identity::{AgentId, MessageId};

/// Priority of an inter-agent message.
///
/// Ordered `Low < Medium < High < Critical`. `High` and `Critical` messages
/// bypass the receiving agent's polling interval and are handled immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Medium,
    High,
    Critical,
}

impl MessagePriority {
    /// Whether this priority bypasses the decision-cycle polling interval
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Routing target of a message.
///
/// On the wire this is the plain string the source protocol used: the
/// literal `"all"`, an agent id, or a topic name. The router decides whether
/// a named target is an agent, a class-wide pseudo-topic, or a subscription
/// topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageTarget {
    /// Broadcast to every live agent
    All,
    /// A specific agent id or a topic name, resolved by the router
    Named(String),
}

impl MessageTarget {
    pub fn agent(id: &AgentId) -> Self {
        Self::Named(id.0.clone())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::All)
    }

    /// The wire form of the target
    pub fn as_str(&self) -> &str {
        match self {
            Self::All => "all",
            Self::Named(name) => name,
        }
    }
}

impl fmt::Display for MessageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for MessageTarget {
    fn from(s: &str) -> Self {
        if s == "all" {
            Self::All
        } else {
            Self::Named(s.to_string())
        }
    }
}

impl Serialize for MessageTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// An inter-agent message. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: MessageId,
    /// Application-level message type (e.g. `inventory_update`, `trade_proposed`)
    pub message_type: String,
    pub from: AgentId,
    pub to: MessageTarget,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub priority: MessagePriority,
}

impl AgentMessage {
    /// Create a message with a fresh id and the current timestamp
    pub fn new(
        message_type: impl Into<String>,
        from: AgentId,
        to: MessageTarget,
        payload: serde_json::Value,
        priority: MessagePriority,
    ) -> Self {
        Self {
            id: MessageId::new(),
            message_type: message_type.into(),
            from,
            to,
            payload,
            timestamp: Utc::now(),
            priority,
        }
    }
}
