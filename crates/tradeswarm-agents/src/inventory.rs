//! The external inventory/trade-record collaborator
//!
//! Reads are snapshot fetches, writes are fire-and-forget trade proposals;
//! both are treated as eventually consistent. A fetch failure never stops a
//! running agent, it just keeps working from its last snapshot.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use tradeswarm_types::{ProductId, StoreId, StoreInventory, TradeProposal};

/// Errors from the inventory collaborator
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory store unavailable: {0}")]
    Unavailable(String),

    #[error("unknown product: {0}")]
    UnknownProduct(ProductId),
}

pub type InventoryResult<T> = Result<T, InventoryError>;

/// Read-only snapshot fetches plus the trade write path
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    /// Fetch the per-store snapshot for one product
    async fn fetch_snapshots(
        &self,
        product_id: &ProductId,
    ) -> InventoryResult<HashMap<StoreId, StoreInventory>>;

    /// Record a proposed transfer. Best-effort: callers log failures and
    /// move on.
    async fn record_trade(&self, proposal: &TradeProposal) -> InventoryResult<()>;
}

/// In-memory inventory used by the demo and tests
#[derive(Default)]
pub struct InMemoryInventory {
    products: RwLock<HashMap<ProductId, HashMap<StoreId, StoreInventory>>>,
    trades: RwLock<Vec<TradeProposal>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace one store's snapshot
    pub fn set_store(&self, product_id: ProductId, store_id: StoreId, inventory: StoreInventory) {
        self.products
            .write()
            .entry(product_id)
            .or_default()
            .insert(store_id, inventory);
    }

    /// Trades recorded so far
    pub fn trades(&self) -> Vec<TradeProposal> {
        self.trades.read().clone()
    }
}

#[async_trait]
impl InventoryProvider for InMemoryInventory {
    async fn fetch_snapshots(
        &self,
        product_id: &ProductId,
    ) -> InventoryResult<HashMap<StoreId, StoreInventory>> {
        self.products
            .read()
            .get(product_id)
            .cloned()
            .ok_or_else(|| InventoryError::UnknownProduct(product_id.clone()))
    }

    async fn record_trade(&self, proposal: &TradeProposal) -> InventoryResult<()> {
        self.trades.write().push(proposal.clone());
        Ok(())
    }
}
