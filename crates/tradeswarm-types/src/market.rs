//! Marketplace types: bids, matches and negotiations

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::{AgentId, BidId, MatchId, NegotiationId, ProductId, StoreId};

/// Side of a marketplace bid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidSide {
    Buy,
    Sell,
}

impl BidSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for BidSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Urgency attached to bids and opportunities
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

/// Optional constraints a bid carries into matching
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BidConditions {
    /// Minimum acceptable matched quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quantity: Option<u64>,
    /// Maximum acceptable transport cost for the transfer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_transport_cost: Option<Decimal>,
}

/// A standing offer to buy or sell a quantity of a product at a unit price.
///
/// Lives in the order book from submission until matched or expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketBid {
    pub id: BidId,
    pub agent_id: AgentId,
    pub product_id: ProductId,
    pub side: BidSide,
    pub quantity: u64,
    pub price_per_unit: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_store: Option<StoreId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_store: Option<StoreId>,
    pub urgency: Urgency,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub conditions: BidConditions,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

/// Draft of a bid before the marketplace assigns identity and timestamps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidDraft {
    pub agent_id: AgentId,
    pub product_id: ProductId,
    pub side: BidSide,
    pub quantity: u64,
    pub price_per_unit: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_store: Option<StoreId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_store: Option<StoreId>,
    pub urgency: Urgency,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub conditions: BidConditions,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Status of a match through its settlement lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Pending,
    Confirmed,
    Executing,
    Completed,
    Cancelled,
}

/// A pairing of one buy and one sell bid whose prices crossed.
///
/// Created atomically with the removal of both constituent bids from the
/// book; a bid never appears in a second match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMatch {
    pub id: MatchId,
    pub buy_bid: MarketBid,
    pub sell_bid: MarketBid,
    pub agreed_quantity: u64,
    pub agreed_price: Decimal,
    pub estimated_profit: Decimal,
    pub transport_cost: Decimal,
    pub status: MatchStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl MarketMatch {
    pub fn product_id(&self) -> &ProductId {
        &self.buy_bid.product_id
    }
}

/// Status of a negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationStatus {
    Negotiating,
    Agreed,
    Rejected,
    Expired,
}

impl NegotiationStatus {
    /// Terminal negotiations accept no further offers
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Negotiating)
    }
}

/// What a negotiation is about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSubject {
    pub product_id: ProductId,
    pub quantity: u64,
    pub from_store: StoreId,
    pub to_store: StoreId,
}

/// One offer inside a negotiation; offers are strictly append-ordered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationOffer {
    pub agent_id: AgentId,
    pub price_offer: Decimal,
    #[serde(default)]
    pub conditions: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Terms both sides settled on when a negotiation converges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgreedTerms {
    pub final_price: Decimal,
    pub quantity: u64,
    #[serde(default)]
    pub conditions: serde_json::Value,
}

/// A bounded back-and-forth offer exchange between two agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Negotiation {
    pub id: NegotiationId,
    pub participants: [AgentId; 2],
    pub subject: NegotiationSubject,
    pub offers: Vec<NegotiationOffer>,
    pub status: NegotiationStatus,
    pub deadline: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreed_terms: Option<AgreedTerms>,
    pub started_at: DateTime<Utc>,
}

impl Negotiation {
    pub fn initiator(&self) -> &AgentId {
        &self.participants[0]
    }

    pub fn target(&self) -> &AgentId {
        &self.participants[1]
    }

    pub fn is_participant(&self, agent_id: &AgentId) -> bool {
        self.participants.iter().any(|p| p == agent_id)
    }

    /// The most recent offer, if any
    pub fn last_offer(&self) -> Option<&NegotiationOffer> {
        self.offers.last()
    }
}
