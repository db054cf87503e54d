//! Identity types for TradeSwarm
//!
//! Generated identifiers (messages, bids, matches, ...) are strongly typed
//! wrappers around UUIDs to prevent accidental mixing of different ID types.
//! Agent, product and store identifiers are string newtypes because they are
//! derived from external documents rather than generated here.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate UUID-backed ID types with common implementations
macro_rules! define_id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from a string (with or without prefix)
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                let s = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the inner UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

/// Macro to generate string-backed ID types for externally-derived identities
macro_rules! define_name_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

// Generated identity types
define_id_type!(MessageId, "msg", "Unique identifier for an inter-agent message");
define_id_type!(DecisionId, "dec", "Unique identifier for an agent decision");
define_id_type!(ActionId, "act", "Unique identifier for an agent action");
define_id_type!(BidId, "bid", "Unique identifier for a marketplace bid");
define_id_type!(MatchId, "match", "Unique identifier for a marketplace match");
define_id_type!(NegotiationId, "neg", "Unique identifier for a negotiation");
define_id_type!(TradeId, "trade", "Unique identifier for a proposed trade record");

// External identity types
define_name_type!(AgentId, "Identifier for an agent, derived from its type and subject");
define_name_type!(ProductId, "Identifier for a product in the external document store");
define_name_type!(StoreId, "Identifier for a store location in the external document store");

impl AgentId {
    /// Derive the conventional id for an agent of `agent_type` bound to a subject
    /// (e.g. `product-agent-P1`).
    pub fn derived(agent_type: &str, subject: &str) -> Self {
        Self(format!("{agent_type}-agent-{subject}"))
    }
}
