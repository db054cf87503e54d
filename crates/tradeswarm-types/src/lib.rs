//! TradeSwarm Types - Canonical domain types for the agent trading core
//!
//! This crate contains all foundational types for TradeSwarm with zero
//! dependencies on other tradeswarm crates. It defines the complete type
//! system for:
//!
//! - Identity types (AgentId, BidId, NegotiationId, etc.)
//! - Inter-agent messages with priorities and routing targets
//! - Agent decisions and their bounded-concurrency actions
//! - Marketplace bids, matches and negotiations
//! - Per-store inventory snapshots and arbitrage opportunities
//! - The `CoreEvent` stream observed by dashboards and relays
//!
//! # Architectural Invariants
//!
//! These types support the core TradeSwarm invariants:
//!
//! 1. A bid's `valid_until` always exceeds its submission time
//! 2. Matched bids leave the order book exactly once
//! 3. A negotiation has exactly two participants and accepts offers only
//!    from those two
//! 4. An agent's active-action count never exceeds its configured cap

pub mod agent;
pub mod events;
pub mod identity;
pub mod inventory;
pub mod market;
pub mod message;

pub use agent::*;
pub use events::*;
pub use identity::*;
pub use inventory::*;
pub use market::*;
pub use message::*;

/// Version of the TradeSwarm types schema
pub const TYPES_VERSION: &str = "0.1.0";
