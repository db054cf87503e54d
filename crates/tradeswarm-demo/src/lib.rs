//! TradeSwarm Demo - the composition root
//!
//! Everything the core needs is constructed and injected here: the bus, the
//! persistence cache, the marketplace with its clearing task, the manager
//! with health checks and the marketplace relay, and a small fleet of
//! product agents over a seeded in-memory inventory. There are no global
//! singletons; single-instance-per-process behavior falls out of this
//! module owning the instances.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

use tradeswarm_agent_kernel::AgentConfig;
use tradeswarm_agents::{
    ArbitrageOracle, InMemoryInventory, ProductAgent, ProductAgentConfig,
};
use tradeswarm_bus::{InMemoryBus, InMemoryCache};
use tradeswarm_manager::{AgentManager, ManagerConfig, ManagerError, ManagerStatus};
use tradeswarm_marketplace::{
    FlatRateEstimator, MarketActivity, Marketplace, MarketplaceConfig, MarketStats,
};
use tradeswarm_types::{ProductId, StoreId, StoreInventory};

/// Errors from the demo engine
#[derive(Debug, Error)]
pub enum DemoError {
    #[error("manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("demo is already running")]
    AlreadyRunning,
}

/// Demo scenario parameters
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub seed: u64,
    pub products: usize,
    pub stores_per_product: usize,
    pub decision_interval: Duration,
    pub clearing_interval: Duration,
    pub health_check_interval: Duration,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            seed: 7,
            products: 3,
            stores_per_product: 4,
            decision_interval: Duration::from_secs(2),
            clearing_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(10),
        }
    }
}

/// Install a fmt subscriber honoring `RUST_LOG`
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// The wired-up swarm
pub struct DemoEngine {
    config: DemoConfig,
    bus: Arc<InMemoryBus>,
    inventory: Arc<InMemoryInventory>,
    marketplace: Arc<Marketplace>,
    manager: Arc<AgentManager>,
    started: std::sync::atomic::AtomicBool,
}

impl DemoEngine {
    pub fn new(config: DemoConfig) -> Self {
        let bus = Arc::new(InMemoryBus::new());
        let cache = Arc::new(InMemoryCache::new());
        let estimator = Arc::new(FlatRateEstimator::new(Decimal::new(5, 2))); // 0.05/unit

        let marketplace = Arc::new(Marketplace::new(
            MarketplaceConfig {
                clearing_interval: config.clearing_interval,
                ..MarketplaceConfig::default()
            },
            estimator,
            cache,
        ));

        let manager = AgentManager::new(
            ManagerConfig {
                health_check_interval: config.health_check_interval,
                ..ManagerConfig::default()
            },
            bus.clone(),
        );

        let inventory = Arc::new(InMemoryInventory::new());
        Self::seed_inventory(&inventory, &config);

        Self {
            config,
            bus,
            inventory,
            marketplace,
            manager,
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Seed every product with one overstocked store, one starved store and
    /// a stable middle.
    fn seed_inventory(inventory: &InMemoryInventory, config: &DemoConfig) {
        let mut rng = StdRng::seed_from_u64(config.seed);

        for p in 1..=config.products {
            let product_id = ProductId::new(format!("P{p}"));
            let cost = Decimal::from(rng.gen_range(8..=12u64));
            let retail = cost * Decimal::new(25, 1); // 2.5x markup

            for s in 1..=config.stores_per_product {
                let quantity = match s {
                    1 => rng.gen_range(600..=900),
                    2 => rng.gen_range(5..=40),
                    _ => rng.gen_range(100..=300),
                };
                inventory.set_store(
                    product_id.clone(),
                    StoreId::new(format!("S{s}")),
                    StoreInventory {
                        quantity,
                        reserved_quantity: 0,
                        cost,
                        retail_price: retail,
                        demand_forecast: rng.gen_range(50..=200),
                    },
                );
            }
        }
    }

    /// Bring the swarm up: clearing, health checks, marketplace relay, one
    /// product agent per seeded product.
    pub async fn start(&self) -> Result<(), DemoError> {
        if self.started.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(DemoError::AlreadyRunning);
        }

        self.marketplace.start_clearing().await;
        self.manager.start_health_checks().await;
        self.manager.attach_marketplace(&self.marketplace).await;

        for p in 1..=self.config.products {
            let product_id = ProductId::new(format!("P{p}"));
            let oracle = Arc::new(ArbitrageOracle::new(Arc::new(FlatRateEstimator::new(
                Decimal::new(5, 2),
            ))));
            let behavior = ProductAgent::new(
                product_id.clone(),
                ProductAgentConfig::default(),
                oracle,
                self.inventory.clone(),
                self.marketplace.clone(),
            );

            self.manager
                .create_agent(
                    ProductAgent::identity_for(&product_id),
                    AgentConfig {
                        decision_interval: self.config.decision_interval,
                        ..AgentConfig::default()
                    },
                    Box::new(behavior),
                )
                .await?;
        }

        info!(products = self.config.products, "demo swarm started");
        Ok(())
    }

    /// Wind everything down in reverse order
    pub async fn stop(&self) {
        self.manager.shutdown().await;
        self.marketplace.shutdown().await;
        self.started
            .store(false, std::sync::atomic::Ordering::SeqCst);
        info!("demo swarm stopped");
    }

    pub fn bus(&self) -> &Arc<InMemoryBus> {
        &self.bus
    }

    pub fn inventory(&self) -> &Arc<InMemoryInventory> {
        &self.inventory
    }

    pub fn marketplace(&self) -> &Arc<Marketplace> {
        &self.marketplace
    }

    pub fn manager(&self) -> &Arc<AgentManager> {
        &self.manager
    }

    pub async fn status(&self) -> ManagerStatus {
        self.manager.status().await
    }

    pub fn activity(&self) -> MarketActivity {
        self.marketplace.activity()
    }

    pub fn stats(&self) -> MarketStats {
        self.marketplace.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_swarm_trades_the_seeded_imbalance() {
        let engine = DemoEngine::new(DemoConfig {
            products: 2,
            decision_interval: Duration::from_millis(50),
            clearing_interval: Duration::from_millis(200),
            health_check_interval: Duration::from_millis(200),
            ..DemoConfig::default()
        });

        engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(DemoError::AlreadyRunning)));

        // Give the agents a few decision cycles
        tokio::time::sleep(Duration::from_millis(400)).await;

        let status = engine.status().await;
        assert_eq!(status.total_agents, 2);
        assert_eq!(status.active_agents, 2);
        assert_eq!(status.system_health, "healthy");
        assert!(status.recent_decisions >= 1, "no agent decided anything");

        // The seeded imbalance produced sell bids and trade records
        assert!(engine.activity().active_bids >= 1);
        assert!(!engine.inventory().trades().is_empty());

        engine.stop().await;
        let status = engine.status().await;
        assert_eq!(status.total_agents, 0);
    }
}
