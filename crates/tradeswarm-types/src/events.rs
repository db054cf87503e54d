//! Core events emitted for observers (dashboards, relays, logs)
//!
//! Events are broadcast to all subscribers; a lagging or absent subscriber
//! never blocks the emitter.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::identity::{ActionId, AgentId, BidId, NegotiationId, ProductId};
use crate::market::{MarketBid, MarketMatch, Negotiation};

/// System-wide events emitted by the agent core and the marketplace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoreEvent {
    /// An agent was created and registered with the manager
    AgentCreated {
        agent_id: AgentId,
        agent_type: String,
        name: String,
        timestamp: DateTime<Utc>,
    },

    /// An agent's lifecycle started
    AgentStarted {
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// An agent's lifecycle stopped after cleanup
    AgentStopped {
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// An agent was deregistered from the manager
    AgentRemoved {
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// A background loop caught an error (the loop itself keeps running)
    AgentError {
        agent_id: AgentId,
        stage: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// An action ran to completion
    ActionCompleted {
        agent_id: AgentId,
        action_id: ActionId,
        kind: String,
        timestamp: DateTime<Utc>,
    },

    /// An action failed; sibling actions keep executing
    ActionFailed {
        agent_id: AgentId,
        action_id: ActionId,
        kind: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Health-check summary, emitted every sweep regardless of outcome
    HealthCheck {
        total: usize,
        active: usize,
        inactive: usize,
        timestamp: DateTime<Utc>,
    },

    /// A bid passed validation and entered the book
    BidSubmitted {
        bid: MarketBid,
        timestamp: DateTime<Utc>,
    },

    /// A bid's validity window elapsed before it matched
    BidExpired {
        bid_id: BidId,
        product_id: ProductId,
        timestamp: DateTime<Utc>,
    },

    /// Two opposite-side bids were paired and removed from the book
    MatchCreated {
        market_match: MarketMatch,
        timestamp: DateTime<Utc>,
    },

    /// A negotiation was opened with the initiator's offer
    NegotiationStarted {
        negotiation: Negotiation,
        timestamp: DateTime<Utc>,
    },

    /// A counter-offer was appended without reaching convergence
    CounterOfferReceived {
        negotiation_id: NegotiationId,
        agent_id: AgentId,
        price_offer: Decimal,
        timestamp: DateTime<Utc>,
    },

    /// A negotiation converged and its transfer executed
    NegotiationCompleted {
        negotiation: Negotiation,
        timestamp: DateTime<Utc>,
    },

    /// A negotiation passed its deadline while still open
    NegotiationExpired {
        negotiation_id: NegotiationId,
        timestamp: DateTime<Utc>,
    },

    /// Aggregate transfer bookkeeping for a completed negotiation
    TransferExecuted {
        negotiation_id: NegotiationId,
        product_id: ProductId,
        quantity: u64,
        final_price: Decimal,
        timestamp: DateTime<Utc>,
    },
}

impl CoreEvent {
    /// The event's own timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::AgentCreated { timestamp, .. }
            | Self::AgentStarted { timestamp, .. }
            | Self::AgentStopped { timestamp, .. }
            | Self::AgentRemoved { timestamp, .. }
            | Self::AgentError { timestamp, .. }
            | Self::ActionCompleted { timestamp, .. }
            | Self::ActionFailed { timestamp, .. }
            | Self::HealthCheck { timestamp, .. }
            | Self::BidSubmitted { timestamp, .. }
            | Self::BidExpired { timestamp, .. }
            | Self::MatchCreated { timestamp, .. }
            | Self::NegotiationStarted { timestamp, .. }
            | Self::CounterOfferReceived { timestamp, .. }
            | Self::NegotiationCompleted { timestamp, .. }
            | Self::NegotiationExpired { timestamp, .. }
            | Self::TransferExecuted { timestamp, .. } => *timestamp,
        }
    }
}
