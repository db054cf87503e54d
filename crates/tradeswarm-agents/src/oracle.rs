//! The decision oracle seam and the rule-based arbitrage oracle
//!
//! The oracle is the pluggable `decide()` capability: given the agent's
//! inventory context it returns confidence, reasoning and candidate
//! opportunities. The agent treats every oracle as long-latency and
//! unreliable; on failure or timeout it degrades to a conservative default
//! rather than erroring the decision cycle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use tradeswarm_marketplace::TransportCostEstimator;
use tradeswarm_types::{ArbitrageOpportunity, ProductId, StoreId, StoreInventory, Urgency};

/// Errors from oracle calls
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle returned an unusable answer: {0}")]
    InvalidAnswer(String),
}

pub type OracleResult<T> = Result<T, OracleError>;

/// Thresholds the arbitrage search runs against
#[derive(Debug, Clone)]
pub struct ArbitrageConfig {
    /// Stores at/below this quantity count as starved
    pub low_stock_threshold: u64,
    /// Stores at/above this quantity count as overstocked
    pub high_stock_threshold: u64,
    /// Minimum percentage margin an opportunity must clear
    pub min_profit_margin: Decimal,
    /// Transport cost cap as a fraction of the buy-side outlay
    pub max_transport_cost_ratio: Decimal,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            low_stock_threshold: 50,
            high_stock_threshold: 500,
            min_profit_margin: Decimal::TEN,
            max_transport_cost_ratio: Decimal::new(1, 1), // 0.1
        }
    }
}

/// Everything an oracle gets to see for one decision
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub product_id: ProductId,
    pub stores: HashMap<StoreId, StoreInventory>,
    pub config: ArbitrageConfig,
}

/// What an oracle proposes back
#[derive(Debug, Clone)]
pub struct OracleDecision {
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    /// Opportunities ranked by descending profit margin
    pub opportunities: Vec<ArbitrageOpportunity>,
}

impl OracleDecision {
    /// The low-risk default used when an oracle fails or times out
    pub fn conservative(reason: &str) -> Self {
        Self {
            confidence: 0.3,
            reasoning: format!("conservative default: {reason}"),
            opportunities: Vec::new(),
        }
    }
}

/// The pluggable `decide()` capability
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, context: &DecisionContext) -> OracleResult<OracleDecision>;
}

/// Rule-based oracle: exhaustive ordered-pair arbitrage search.
///
/// For every (source, target) pair of distinct stores where the source is
/// overstocked and the target starved, it computes the transferable
/// quantity, gates on transport cost, and keeps candidates whose projected
/// margin clears the configured minimum.
pub struct ArbitrageOracle {
    estimator: Arc<dyn TransportCostEstimator>,
}

impl ArbitrageOracle {
    pub fn new(estimator: Arc<dyn TransportCostEstimator>) -> Self {
        Self { estimator }
    }

    fn evaluate_pair(
        &self,
        config: &ArbitrageConfig,
        source_id: &StoreId,
        source: &StoreInventory,
        target_id: &StoreId,
        target: &StoreInventory,
    ) -> Option<ArbitrageOpportunity> {
        if source.quantity <= config.high_stock_threshold
            || target.quantity >= config.low_stock_threshold
        {
            return None;
        }

        let quantity = (source.quantity - config.low_stock_threshold)
            .min(config.high_stock_threshold - target.quantity);
        if quantity == 0 {
            return None;
        }

        let transport_cost = self
            .estimator
            .estimate(Some(source_id), Some(target_id), quantity);
        let buy_outlay = source.cost * Decimal::from(quantity);
        if transport_cost > buy_outlay * config.max_transport_cost_ratio {
            return None;
        }

        let outlay = buy_outlay + transport_cost;
        if outlay <= Decimal::ZERO {
            return None;
        }
        let revenue = target.retail_price * Decimal::from(quantity);
        let profit_margin = (revenue - outlay) / outlay * Decimal::ONE_HUNDRED;
        if profit_margin < config.min_profit_margin {
            return None;
        }

        let critically_starved = target.quantity <= config.low_stock_threshold / 2;
        let urgency = if critically_starved
            || profit_margin >= config.min_profit_margin * Decimal::from(3u64)
        {
            Urgency::High
        } else {
            Urgency::Medium
        };

        Some(ArbitrageOpportunity {
            from_store: source_id.clone(),
            to_store: target_id.clone(),
            quantity,
            buy_cost: source.cost,
            sell_price: target.retail_price,
            transport_cost,
            profit_margin,
            urgency,
        })
    }
}

#[async_trait]
impl DecisionOracle for ArbitrageOracle {
    async fn decide(&self, context: &DecisionContext) -> OracleResult<OracleDecision> {
        let mut opportunities = Vec::new();

        for (source_id, source) in &context.stores {
            for (target_id, target) in &context.stores {
                if source_id == target_id {
                    continue;
                }
                if let Some(opportunity) =
                    self.evaluate_pair(&context.config, source_id, source, target_id, target)
                {
                    opportunities.push(opportunity);
                }
            }
        }

        opportunities.sort_by(|a, b| b.profit_margin.cmp(&a.profit_margin));

        let count = opportunities.len();
        let confidence = (0.7 + 0.1 * count.min(3) as f64).min(1.0);
        let reasoning = if count == 0 {
            format!(
                "no arbitrage candidates across {} stores of {}",
                context.stores.len(),
                context.product_id
            )
        } else {
            format!(
                "{} arbitrage candidate(s) across {} stores of {}; best margin {:.1}%",
                count,
                context.stores.len(),
                context.product_id,
                opportunities[0].profit_margin
            )
        };

        Ok(OracleDecision {
            confidence,
            reasoning,
            opportunities,
        })
    }
}
