//! The per-product agent
//!
//! One `ProductAgent` owns the inventory view of a single product across
//! all stores. Each decision cycle it refreshes snapshots, asks its oracle
//! for opportunities (bounded by a timeout), and turns the best candidates
//! into marketplace bids. Urgent marketplace events (negotiations) are
//! answered on arrival.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tradeswarm_agent_kernel::{AgentBehavior, AgentContext, AgentError, AgentResult};
use tradeswarm_marketplace::{CounterOutcome, Marketplace, OfferDraft};
use tradeswarm_types::{
    AgentAction, AgentDecision, AgentId, AgentIdentity, AgentMessage, ArbitrageOpportunity,
    BidConditions, BidDraft, BidSide, MessagePriority, MessageTarget, Negotiation, ProductId,
    StoreId, StoreInventory, TradeId, TradeProposal,
};

use crate::inventory::InventoryProvider;
use crate::oracle::{ArbitrageConfig, DecisionContext, DecisionOracle, OracleDecision};

/// Configuration of one product agent
#[derive(Debug, Clone)]
pub struct ProductAgentConfig {
    /// Arbitrage thresholds handed to the oracle
    pub arbitrage: ArbitrageConfig,
    /// Minimum time between full analyses during stable periods
    pub forecast_update_interval: Duration,
    /// Upper bound on one oracle call
    pub oracle_timeout: Duration,
    /// Opportunities turned into transfer proposals per decision
    pub max_proposals: usize,
    /// Validity window of submitted bids
    pub bid_validity: Duration,
    /// Topic low-stock alerts are addressed to
    pub operations_topic: String,
}

impl Default for ProductAgentConfig {
    fn default() -> Self {
        Self {
            arbitrage: ArbitrageConfig::default(),
            forecast_update_interval: Duration::from_secs(5 * 60),
            oracle_timeout: Duration::from_secs(10),
            max_proposals: 3,
            bid_validity: Duration::from_secs(15 * 60),
            operations_topic: "operations".to_string(),
        }
    }
}

/// Payload of an `inventory_update` message
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InventoryUpdate {
    store_id: StoreId,
    #[serde(flatten)]
    inventory: StoreInventory,
}

/// Agent responsible for one inventory-bearing product
pub struct ProductAgent {
    product_id: ProductId,
    config: ProductAgentConfig,
    oracle: Arc<dyn DecisionOracle>,
    inventory: Arc<dyn InventoryProvider>,
    marketplace: Arc<Marketplace>,
    stores: HashMap<StoreId, StoreInventory>,
    last_analysis: Option<Instant>,
    force_next_analysis: bool,
}

impl ProductAgent {
    pub fn new(
        product_id: ProductId,
        config: ProductAgentConfig,
        oracle: Arc<dyn DecisionOracle>,
        inventory: Arc<dyn InventoryProvider>,
        marketplace: Arc<Marketplace>,
    ) -> Self {
        Self {
            product_id,
            config,
            oracle,
            inventory,
            marketplace,
            stores: HashMap::new(),
            last_analysis: None,
            force_next_analysis: false,
        }
    }

    /// The conventional identity for a product agent
    pub fn identity_for(product_id: &ProductId) -> AgentIdentity {
        AgentIdentity::new(
            AgentId::derived("product", product_id.as_str()),
            "product",
            format!("Product Agent {product_id}"),
        )
    }

    /// Any store at/below the low threshold or at/above the high threshold
    fn critical_condition(&self) -> bool {
        self.stores.values().any(|inv| {
            inv.quantity <= self.config.arbitrage.low_stock_threshold
                || inv.quantity >= self.config.arbitrage.high_stock_threshold
        })
    }

    fn low_stock_stores(&self) -> Vec<&StoreId> {
        self.stores
            .iter()
            .filter(|(_, inv)| inv.quantity <= self.config.arbitrage.low_stock_threshold)
            .map(|(id, _)| id)
            .collect()
    }

    async fn refresh_snapshots(&mut self) {
        match self.inventory.fetch_snapshots(&self.product_id).await {
            Ok(snapshots) => self.stores = snapshots,
            // Eventually-consistent collaborator: keep the stale view
            Err(e) => warn!(
                product_id = %self.product_id,
                error = %e,
                "inventory refresh failed, keeping stale snapshots"
            ),
        }
    }

    /// Call the oracle, bounded; degrade to the conservative default on
    /// failure or timeout.
    async fn consult_oracle(&self) -> OracleDecision {
        let context = DecisionContext {
            product_id: self.product_id.clone(),
            stores: self.stores.clone(),
            config: self.config.arbitrage.clone(),
        };

        match tokio::time::timeout(self.config.oracle_timeout, self.oracle.decide(&context)).await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!(product_id = %self.product_id, error = %e, "oracle call failed");
                OracleDecision::conservative("oracle call failed")
            }
            Err(_) => {
                warn!(product_id = %self.product_id, "oracle call timed out");
                OracleDecision::conservative("oracle call timed out")
            }
        }
    }

    /// The agent's own total-price valuation of a negotiated transfer:
    /// source cost plus the minimum acceptable margin.
    fn valuation(&self, negotiation: &Negotiation) -> Option<Decimal> {
        let inventory = self.stores.get(&negotiation.subject.from_store)?;
        let margin = Decimal::ONE + self.config.arbitrage.min_profit_margin / Decimal::ONE_HUNDRED;
        Some(inventory.cost * Decimal::from(negotiation.subject.quantity) * margin)
    }

    async fn answer_negotiation(&mut self, ctx: &AgentContext, negotiation: &Negotiation) {
        if negotiation.status.is_terminal() || !negotiation.is_participant(ctx.agent_id()) {
            return;
        }
        let Some(last) = negotiation.last_offer() else { return };
        if &last.agent_id == ctx.agent_id() {
            // The ball is in the counterparty's court
            return;
        }

        let counter = match self.valuation(negotiation) {
            Some(valuation) => (last.price_offer + valuation) / Decimal::TWO,
            // No view of the source store: meet in the middle of the offer
            // and 90% of it
            None => last.price_offer * Decimal::new(95, 2),
        };

        match self
            .marketplace
            .submit_counter_offer(
                negotiation.id,
                ctx.agent_id().clone(),
                OfferDraft {
                    price_offer: counter,
                    conditions: serde_json::Value::Null,
                },
            )
            .await
        {
            Ok(CounterOutcome::Agreed(terms)) => info!(
                agent_id = %ctx.agent_id(),
                negotiation_id = %negotiation.id,
                final_price = %terms.final_price,
                "negotiation settled"
            ),
            Ok(CounterOutcome::Countered { offers }) => debug!(
                agent_id = %ctx.agent_id(),
                negotiation_id = %negotiation.id,
                offers,
                counter = %counter,
                "counter-offer submitted"
            ),
            Err(e) => warn!(
                agent_id = %ctx.agent_id(),
                negotiation_id = %negotiation.id,
                error = %e,
                "counter-offer rejected"
            ),
        }
    }

    async fn propose_transfer(
        &mut self,
        ctx: &AgentContext,
        action: &AgentAction,
    ) -> AgentResult<serde_json::Value> {
        let opportunity: ArbitrageOpportunity = serde_json::from_value(action.parameters.clone())
            .map_err(|e| AgentError::Action {
                kind: action.kind.clone(),
                reason: format!("malformed opportunity parameters: {e}"),
            })?;

        let draft = BidDraft {
            agent_id: ctx.agent_id().clone(),
            product_id: self.product_id.clone(),
            side: BidSide::Sell,
            quantity: opportunity.quantity,
            price_per_unit: opportunity.sell_price,
            from_store: Some(opportunity.from_store.clone()),
            to_store: Some(opportunity.to_store.clone()),
            urgency: opportunity.urgency,
            valid_until: Utc::now()
                + chrono::Duration::from_std(self.config.bid_validity)
                    .unwrap_or_else(|_| chrono::Duration::minutes(15)),
            conditions: BidConditions::default(),
            metadata: action.parameters.clone(),
        };

        let submission = self
            .marketplace
            .submit_bid(draft)
            .await
            .map_err(|e| AgentError::External(e.to_string()))?;

        // Fire-and-forget trade record for the external store
        let proposal = TradeProposal {
            id: TradeId::new(),
            product_id: self.product_id.clone(),
            from_store: opportunity.from_store.clone(),
            to_store: opportunity.to_store.clone(),
            quantity: opportunity.quantity,
            price_per_unit: opportunity.sell_price,
            transport_cost: opportunity.transport_cost,
            proposed_at: Utc::now(),
        };
        if let Err(e) = self.inventory.record_trade(&proposal).await {
            warn!(product_id = %self.product_id, error = %e, "trade record write failed");
        }

        ctx.send_to(
            "trade_proposed",
            MessageTarget::All,
            serde_json::json!({
                "productId": self.product_id,
                "bidId": submission.bid.id,
                "fromStore": opportunity.from_store,
                "toStore": opportunity.to_store,
                "quantity": opportunity.quantity,
                "matches": submission.matches.len(),
            }),
            MessagePriority::Medium,
        )?;

        Ok(serde_json::json!({
            "bidId": submission.bid.id,
            "matches": submission.matches.len(),
        }))
    }
}

#[async_trait]
impl AgentBehavior for ProductAgent {
    async fn initialize(&mut self, ctx: &AgentContext) -> AgentResult<()> {
        let snapshots = self
            .inventory
            .fetch_snapshots(&self.product_id)
            .await
            .map_err(|e| AgentError::Initialize(e.to_string()))?;
        self.stores = snapshots;
        info!(
            agent_id = %ctx.agent_id(),
            product_id = %self.product_id,
            stores = self.stores.len(),
            "product agent initialized"
        );
        Ok(())
    }

    async fn decide(&mut self, ctx: &AgentContext) -> AgentResult<Option<AgentDecision>> {
        self.refresh_snapshots().await;

        // Rate limit: analyze only when the interval elapsed, under stress,
        // or explicitly requested.
        let interval_elapsed = self
            .last_analysis
            .map(|at| at.elapsed() >= self.config.forecast_update_interval)
            .unwrap_or(true);
        if !interval_elapsed && !self.critical_condition() && !self.force_next_analysis {
            return Ok(None);
        }
        self.last_analysis = Some(Instant::now());
        self.force_next_analysis = false;

        let oracle_decision = self.consult_oracle().await;

        let mut actions = Vec::new();
        for opportunity in oracle_decision
            .opportunities
            .iter()
            .take(self.config.max_proposals)
        {
            let params = serde_json::to_value(opportunity)
                .map_err(|e| AgentError::Decide(e.to_string()))?;
            actions.push(AgentAction::new(
                "propose_transfer",
                params,
                format!(
                    "transfer {} units {} -> {}",
                    opportunity.quantity, opportunity.from_store, opportunity.to_store
                ),
            ));
        }

        let low_stock: Vec<String> = self
            .low_stock_stores()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        if !low_stock.is_empty() {
            actions.push(AgentAction::new(
                "send_alert",
                serde_json::json!({
                    "productId": self.product_id,
                    "lowStockStores": low_stock,
                    "threshold": self.config.arbitrage.low_stock_threshold,
                }),
                "operations notified of low stock",
            ));
        }

        if actions.is_empty() {
            return Ok(None);
        }

        Ok(Some(AgentDecision::new(
            ctx.agent_id().clone(),
            oracle_decision.confidence,
            oracle_decision.reasoning,
            actions,
        )))
    }

    async fn handle_message(
        &mut self,
        ctx: &AgentContext,
        message: &AgentMessage,
    ) -> AgentResult<()> {
        match message.message_type.as_str() {
            "inventory_update" => {
                let update: InventoryUpdate = serde_json::from_value(message.payload.clone())
                    .map_err(|e| AgentError::Message(format!("bad inventory_update: {e}")))?;
                debug!(
                    agent_id = %ctx.agent_id(),
                    store_id = %update.store_id,
                    quantity = update.inventory.quantity,
                    "inventory snapshot updated"
                );
                self.stores.insert(update.store_id, update.inventory);
            }
            "analysis_request" => {
                self.force_next_analysis = true;
            }
            "negotiation_started" | "counter_offer" => {
                let negotiation: Negotiation = serde_json::from_value(message.payload.clone())
                    .map_err(|e| AgentError::Message(format!("bad negotiation payload: {e}")))?;
                self.answer_negotiation(ctx, &negotiation).await;
            }
            other => {
                debug!(
                    agent_id = %ctx.agent_id(),
                    message_type = other,
                    from = %message.from,
                    "message observed"
                );
            }
        }
        Ok(())
    }

    async fn execute_action(
        &mut self,
        ctx: &AgentContext,
        action: &AgentAction,
    ) -> AgentResult<serde_json::Value> {
        match action.kind.as_str() {
            "propose_transfer" => self.propose_transfer(ctx, action).await,
            "send_alert" => {
                ctx.send_to(
                    "low_stock_alert",
                    MessageTarget::topic(self.config.operations_topic.clone()),
                    action.parameters.clone(),
                    MessagePriority::High,
                )?;
                Ok(serde_json::json!({"alerted": true}))
            }
            other => Err(AgentError::UnknownAction(other.to_string())),
        }
    }

    async fn cleanup(&mut self, ctx: &AgentContext) -> AgentResult<()> {
        debug!(agent_id = %ctx.agent_id(), product_id = %self.product_id, "product agent cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::InMemoryInventory;
    use crate::oracle::{ArbitrageOracle, OracleError, OracleResult};
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;
    use tradeswarm_bus::InMemoryCache;
    use tradeswarm_marketplace::{FixedCostEstimator, MarketplaceConfig};

    fn store(quantity: u64) -> StoreInventory {
        StoreInventory {
            quantity,
            reserved_quantity: 0,
            cost: dec!(10),
            retail_price: dec!(25),
            demand_forecast: 100,
        }
    }

    fn marketplace() -> Arc<Marketplace> {
        Arc::new(Marketplace::new(
            MarketplaceConfig::default(),
            Arc::new(FixedCostEstimator::new(dec!(25))),
            Arc::new(InMemoryCache::new()),
        ))
    }

    fn seeded_inventory(x: u64, y: u64) -> Arc<InMemoryInventory> {
        let inventory = Arc::new(InMemoryInventory::new());
        inventory.set_store(ProductId::new("P1"), StoreId::new("X"), store(x));
        inventory.set_store(ProductId::new("P1"), StoreId::new("Y"), store(y));
        inventory
    }

    fn agent_with(inventory: Arc<InMemoryInventory>, market: Arc<Marketplace>) -> ProductAgent {
        let oracle = Arc::new(ArbitrageOracle::new(Arc::new(FixedCostEstimator::new(
            dec!(25),
        ))));
        ProductAgent::new(
            ProductId::new("P1"),
            ProductAgentConfig::default(),
            oracle,
            inventory,
            market,
        )
    }

    fn context() -> (AgentContext, mpsc::UnboundedReceiver<AgentMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let identity = ProductAgent::identity_for(&ProductId::new("P1"));
        (AgentContext::new(identity, tx), rx)
    }

    struct FailingOracle;

    #[async_trait]
    impl DecisionOracle for FailingOracle {
        async fn decide(&self, _context: &DecisionContext) -> OracleResult<OracleDecision> {
            Err(OracleError::Unavailable("scripted outage".into()))
        }
    }

    #[tokio::test]
    async fn test_imbalance_produces_transfer_and_alert_actions() {
        let (ctx, _rx) = context();
        let mut agent = agent_with(seeded_inventory(600, 20), marketplace());

        agent.initialize(&ctx).await.unwrap();
        let decision = agent.decide(&ctx).await.unwrap().expect("decision expected");

        let kinds: Vec<&str> = decision.actions.iter().map(|a| a.kind.as_str()).collect();
        assert!(kinds.contains(&"propose_transfer"));
        assert!(kinds.contains(&"send_alert"));
        assert!((decision.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stable_inventory_is_rate_limited() {
        let (ctx, _rx) = context();
        let mut agent = agent_with(seeded_inventory(200, 180), marketplace());

        agent.initialize(&ctx).await.unwrap();

        // First cycle analyzes (nothing to do), second is rate-limited
        assert!(agent.decide(&ctx).await.unwrap().is_none());
        assert!(agent.decide(&ctx).await.unwrap().is_none());

        // A forced analysis goes through the oracle again
        let request = AgentMessage::new(
            "analysis_request",
            AgentId::new("api"),
            MessageTarget::agent(ctx.agent_id()),
            serde_json::Value::Null,
            MessagePriority::Medium,
        );
        agent.handle_message(&ctx, &request).await.unwrap();
        assert!(agent.force_next_analysis);
    }

    #[tokio::test]
    async fn test_failing_oracle_degrades_to_conservative_default() {
        let (ctx, _rx) = context();
        let market = marketplace();
        let mut agent = ProductAgent::new(
            ProductId::new("P1"),
            ProductAgentConfig::default(),
            Arc::new(FailingOracle),
            seeded_inventory(600, 20),
            market,
        );

        agent.initialize(&ctx).await.unwrap();
        let decision = agent.decide(&ctx).await.unwrap().expect("alert still expected");

        // No transfers from the broken oracle, but the low-stock alert
        // still goes out at conservative confidence.
        assert!(decision.actions.iter().all(|a| a.kind != "propose_transfer"));
        assert!(decision.actions.iter().any(|a| a.kind == "send_alert"));
        assert!((decision.confidence - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_propose_transfer_submits_sell_bid_and_records_trade() {
        let (ctx, mut rx) = context();
        let inventory = seeded_inventory(600, 20);
        let market = marketplace();
        let mut agent = agent_with(inventory.clone(), market.clone());

        agent.initialize(&ctx).await.unwrap();
        let decision = agent.decide(&ctx).await.unwrap().unwrap();
        let transfer = decision
            .actions
            .iter()
            .find(|a| a.kind == "propose_transfer")
            .unwrap();

        agent.execute_action(&ctx, transfer).await.unwrap();

        assert_eq!(market.active_bid_count(), 1);
        let bid = &market.active_bids()[0];
        assert_eq!(bid.side, BidSide::Sell);
        assert_eq!(bid.quantity, 480);
        assert_eq!(bid.price_per_unit, dec!(25));

        assert_eq!(inventory.trades().len(), 1);

        let broadcast = rx.try_recv().unwrap();
        assert_eq!(broadcast.message_type, "trade_proposed");
        assert!(broadcast.to.is_broadcast());
    }

    #[tokio::test]
    async fn test_unknown_action_is_a_hard_error() {
        let (ctx, _rx) = context();
        let mut agent = agent_with(seeded_inventory(200, 200), marketplace());
        agent.initialize(&ctx).await.unwrap();

        let action = AgentAction::new("reticulate_splines", serde_json::json!({}), "n/a");
        let result = agent.execute_action(&ctx, &action).await;
        assert!(matches!(result, Err(AgentError::UnknownAction(_))));
    }

    #[tokio::test]
    async fn test_inventory_update_message_merges_snapshot() {
        let (ctx, _rx) = context();
        let mut agent = agent_with(seeded_inventory(200, 200), marketplace());
        agent.initialize(&ctx).await.unwrap();

        let update = AgentMessage::new(
            "inventory_update",
            AgentId::new("backend"),
            MessageTarget::agent(ctx.agent_id()),
            serde_json::json!({
                "store_id": "Z",
                "quantity": 5,
                "reserved_quantity": 0,
                "cost": "10",
                "retail_price": "25",
                "demand_forecast": 50,
            }),
            MessagePriority::Medium,
        );
        agent.handle_message(&ctx, &update).await.unwrap();

        assert_eq!(agent.stores[&StoreId::new("Z")].quantity, 5);
    }

    #[tokio::test]
    async fn test_negotiation_message_draws_a_counter_offer() {
        let (ctx, _rx) = context();
        let market = marketplace();
        let mut agent = agent_with(seeded_inventory(600, 20), market.clone());
        agent.initialize(&ctx).await.unwrap();

        let negotiation = market
            .start_negotiation(
                AgentId::new("product-agent-P2"),
                ctx.agent_id().clone(),
                tradeswarm_types::NegotiationSubject {
                    product_id: ProductId::new("P1"),
                    quantity: 40,
                    from_store: StoreId::new("X"),
                    to_store: StoreId::new("Y"),
                },
                OfferDraft {
                    price_offer: dec!(500),
                    conditions: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();

        let message = AgentMessage::new(
            "negotiation_started",
            AgentId::new("product-agent-P2"),
            MessageTarget::agent(ctx.agent_id()),
            serde_json::to_value(&negotiation).unwrap(),
            MessagePriority::Critical,
        );
        agent.handle_message(&ctx, &message).await.unwrap();

        let after = market.negotiation(&negotiation.id).unwrap();
        assert_eq!(after.offers.len(), 2);
        assert_eq!(after.offers[1].agent_id, *ctx.agent_id());
    }
}
