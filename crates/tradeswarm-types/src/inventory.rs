//! Per-store inventory snapshots and the opportunities computed from them

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::identity::{ProductId, StoreId, TradeId};
use crate::market::Urgency;

/// Snapshot of one store's position in a product.
///
/// Refreshed from the external inventory collaborator and from live
/// `inventory_update` messages; never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreInventory {
    pub quantity: u64,
    pub reserved_quantity: u64,
    /// Unit acquisition cost at this store
    pub cost: Decimal,
    /// Unit retail price at this store
    pub retail_price: Decimal,
    /// Forecast demand in units over the planning window
    pub demand_forecast: u64,
}

impl StoreInventory {
    /// Units actually available for transfer
    pub fn available(&self) -> u64 {
        self.quantity.saturating_sub(self.reserved_quantity)
    }
}

/// A candidate transfer between two stores whose projected profit margin
/// exceeds the configured threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub from_store: StoreId,
    pub to_store: StoreId,
    pub quantity: u64,
    /// Unit cost at the source store
    pub buy_cost: Decimal,
    /// Unit retail price at the target store
    pub sell_price: Decimal,
    pub transport_cost: Decimal,
    /// Percentage margin over the total outlay
    pub profit_margin: Decimal,
    pub urgency: Urgency,
}

/// A proposed transfer written to the external store's trade collection.
/// Fire-and-forget: the write path is best-effort and never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub id: TradeId,
    pub product_id: ProductId,
    pub from_store: StoreId,
    pub to_store: StoreId,
    pub quantity: u64,
    pub price_per_unit: Decimal,
    pub transport_cost: Decimal,
    pub proposed_at: DateTime<Utc>,
}
