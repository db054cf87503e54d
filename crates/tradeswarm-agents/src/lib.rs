//! TradeSwarm Agents - concrete agent behaviors
//!
//! This crate provides the per-product agent that watches inventory across
//! stores and trades imbalances through the marketplace:
//!
//! - **ProductAgent**: one agent per product; refreshes store snapshots,
//!   proposes arbitrage transfers, raises low-stock alerts, and answers
//!   negotiations
//! - **DecisionOracle**: the pluggable `decide()` capability; the shipped
//!   [`ArbitrageOracle`] is rule-based, and callers degrade to a
//!   conservative default when an oracle fails or times out
//! - **InventoryProvider**: the external inventory/trade-record collaborator
//!
//! # Key Principle
//!
//! Oracles may PROPOSE opportunities, the agent decides what to submit.
//! A misbehaving oracle can never error an agent's decision cycle.

pub mod inventory;
pub mod oracle;
pub mod product;

pub use inventory::{InMemoryInventory, InventoryError, InventoryProvider, InventoryResult};
pub use oracle::{
    ArbitrageConfig, ArbitrageOracle, DecisionContext, DecisionOracle, OracleDecision,
    OracleError, OracleResult,
};
pub use product::{ProductAgent, ProductAgentConfig};
