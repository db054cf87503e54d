//! TradeSwarm Agent Kernel - the abstract actor runtime
//!
//! Every agent in the swarm is an [`Agent`] runtime driving a concrete
//! [`AgentBehavior`] strategy. The runtime owns the actor's queue and state;
//! the behavior owns the domain logic:
//!
//! - **Lifecycle**: `start()` / `stop()` with cooperative, bounded shutdown
//! - **Decision cycle**: an independently cancellable periodic task that
//!   drains prioritized messages, asks the behavior to decide, and executes
//!   the resulting actions under a concurrency cap
//! - **Urgent delivery**: `High`/`Critical` messages bypass the polling
//!   interval and are handled on arrival
//!
//! Behaviors are strategy objects, not subclasses: the runtime never knows
//! what a `propose_transfer` means, only how to schedule and account for it.

pub mod behavior;
pub mod runtime;

pub use behavior::{AgentBehavior, AgentContext, AgentError, AgentResult};
pub use runtime::{Agent, AgentConfig, DECISION_HISTORY_LIMIT};
