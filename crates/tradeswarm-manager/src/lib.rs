//! TradeSwarm Manager - registry and supervisor of all agents
//!
//! The manager owns the set of live agents: it enforces the global
//! concurrency cap, wires each agent's outbound messages onto the message
//! bus and into local routing, restarts agents that go unhealthy, and
//! relays marketplace events back to the agents they concern.
//!
//! # Routing
//!
//! A message target resolves in this order:
//!
//! 1. the literal `all` fans out to every live agent;
//! 2. a registered agent id resolves to itself;
//! 3. the class-wide pseudo-topic `<type>-agents` resolves to every agent
//!    of that class;
//! 4. the operations topic resolves to nobody in-process (it is an
//!    external human channel);
//! 5. anything else consults the topic subscription table.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tradeswarm_agent_kernel::{Agent, AgentBehavior, AgentConfig, AgentError};
use tradeswarm_bus::MessageBus;
use tradeswarm_marketplace::Marketplace;
use tradeswarm_types::{
    AgentId, AgentIdentity, AgentMessage, CoreEvent, MessagePriority, MessageTarget,
};

/// Buffered events before a lagging observer starts dropping
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors from manager operations
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("agent already exists: {0}")]
    DuplicateAgent(AgentId),

    #[error("agent capacity reached ({max} agents)")]
    AtCapacity { max: usize },

    #[error("agent {id} failed to start: {source}")]
    AgentStart { id: AgentId, source: AgentError },

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Cap on live agents
    pub max_concurrent_agents: usize,
    /// Period of the health-check sweep
    pub health_check_interval: Duration,
    /// Topic treated as the external operations channel
    pub operations_topic: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 50,
            health_check_interval: Duration::from_secs(30),
            operations_topic: "operations".to_string(),
        }
    }
}

/// Status summary for dashboards and status probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub total_agents: usize,
    pub active_agents: usize,
    /// Decisions currently held across the agents' bounded histories
    pub recent_decisions: usize,
    pub system_health: String,
}

/// Outcome of one health-check sweep
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub restarted: usize,
}

/// One registered agent and its wiring tasks
struct Registered {
    agent: Arc<Agent>,
    relay_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
}

/// Registry and supervisor of all agents
pub struct AgentManager {
    config: ManagerConfig,
    bus: Arc<dyn MessageBus>,
    agents: RwLock<HashMap<AgentId, Registered>>,
    topics: RwLock<HashMap<String, HashSet<AgentId>>>,
    events: broadcast::Sender<CoreEvent>,
    health_stop: AsyncMutex<Option<oneshot::Sender<()>>>,
    health_task: AsyncMutex<Option<JoinHandle<()>>>,
    market_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl AgentManager {
    pub fn new(config: ManagerConfig, bus: Arc<dyn MessageBus>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            bus,
            agents: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            events,
            health_stop: AsyncMutex::new(None),
            health_task: AsyncMutex::new(None),
            market_task: AsyncMutex::new(None),
        })
    }

    /// Subscribe to the manager's event surface (its own events plus those
    /// forwarded from agents and the marketplace)
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Create, register and start an agent.
    ///
    /// Rejects duplicates and over-capacity synchronously with no state
    /// mutated; a `start()` failure deregisters the agent and propagates.
    pub async fn create_agent(
        self: &Arc<Self>,
        identity: AgentIdentity,
        agent_config: AgentConfig,
        behavior: Box<dyn AgentBehavior>,
    ) -> ManagerResult<AgentId> {
        let id = identity.id.clone();
        let agent = Arc::new(Agent::new(identity.clone(), agent_config, behavior));

        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&id) {
                return Err(ManagerError::DuplicateAgent(id));
            }
            if agents.len() >= self.config.max_concurrent_agents {
                return Err(ManagerError::AtCapacity {
                    max: self.config.max_concurrent_agents,
                });
            }

            let relay_task = self.spawn_outbound_relay(&agent);
            let event_task = self.spawn_event_forwarder(&agent);
            agents.insert(
                id.clone(),
                Registered {
                    agent: agent.clone(),
                    relay_task,
                    event_task,
                },
            );
        }

        if let Err(e) = agent.start().await {
            // Roll back the registration so a half-started agent never
            // lingers in the registry.
            if let Some(registered) = self.agents.write().await.remove(&id) {
                registered.relay_task.abort();
                registered.event_task.abort();
            }
            return Err(ManagerError::AgentStart { id, source: e });
        }

        info!(
            agent_id = %id,
            agent_type = %identity.agent_type,
            name = %identity.name,
            "agent created"
        );
        self.emit(CoreEvent::AgentCreated {
            agent_id: id.clone(),
            agent_type: identity.agent_type,
            name: identity.name,
            timestamp: Utc::now(),
        });

        Ok(id)
    }

    /// Stop and deregister an agent. Absent ids are a warned no-op.
    pub async fn remove_agent(&self, id: &AgentId) {
        let Some(registered) = self.agents.write().await.remove(id) else {
            warn!(agent_id = %id, "remove requested for unknown agent");
            return;
        };

        if let Err(e) = registered.agent.stop().await {
            warn!(agent_id = %id, error = %e, "agent stop failed during removal");
        }
        registered.relay_task.abort();
        registered.event_task.abort();

        self.topics.write().await.values_mut().for_each(|members| {
            members.remove(id);
        });

        info!(agent_id = %id, "agent removed");
        self.emit(CoreEvent::AgentRemoved {
            agent_id: id.clone(),
            timestamp: Utc::now(),
        });
    }

    /// Handle to a registered agent
    pub async fn agent(&self, id: &AgentId) -> Option<Arc<Agent>> {
        self.agents.read().await.get(id).map(|r| r.agent.clone())
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Status summary in the shape the dashboard's status probe expects
    pub async fn status(&self) -> ManagerStatus {
        let agents = self.agents.read().await;
        let total_agents = agents.len();
        let active_agents = agents.values().filter(|r| r.agent.is_active()).count();
        let recent_decisions = agents
            .values()
            .map(|r| r.agent.decision_history().len())
            .sum();
        let system_health = if active_agents == total_agents {
            "healthy"
        } else {
            "degraded"
        };
        ManagerStatus {
            total_agents,
            active_agents,
            recent_decisions,
            system_health: system_health.to_string(),
        }
    }

    // ========================================================================
    // Wiring
    // ========================================================================

    /// Drain the agent's outbound mailbox onto the bus and into routing
    fn spawn_outbound_relay(self: &Arc<Self>, agent: &Arc<Agent>) -> JoinHandle<()> {
        let Some(mut outbound) = agent.take_outbound() else {
            // take_outbound is only called here, once per agent
            unreachable!("outbound mailbox already taken");
        };
        let manager: Weak<Self> = Arc::downgrade(self);
        let agent_id = agent.identity().id.clone();

        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let Some(manager) = manager.upgrade() else { break };
                if let Err(e) = manager.bus.publish(message.to.as_str(), &message).await {
                    warn!(
                        agent_id = %agent_id,
                        topic = %message.to,
                        error = %e,
                        "bus publish failed"
                    );
                }
                manager.deliver(&message).await;
            }
        })
    }

    /// Forward an agent's lifecycle/action events onto the manager surface
    fn spawn_event_forwarder(&self, agent: &Arc<Agent>) -> JoinHandle<()> {
        let mut source = agent.subscribe_events();
        let sink = self.events.clone();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        let _ = sink.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Route a message to its resolved recipients. `all` fans out to every
    /// live agent concurrently; per-agent failures never abort the rest.
    pub async fn broadcast_message(&self, message: AgentMessage) {
        if let Err(e) = self.bus.publish(message.to.as_str(), &message).await {
            warn!(topic = %message.to, error = %e, "bus publish failed");
        }
        self.deliver(&message).await;
    }

    async fn deliver(&self, message: &AgentMessage) {
        let recipients: Vec<Arc<Agent>> = match &message.to {
            MessageTarget::All => {
                let agents = self.agents.read().await;
                agents.values().map(|r| r.agent.clone()).collect()
            }
            MessageTarget::Named(name) => {
                let ids = self.resolve_targets(name).await;
                let agents = self.agents.read().await;
                ids.iter()
                    .filter_map(|id| agents.get(id).map(|r| r.agent.clone()))
                    .collect()
            }
        };

        if recipients.is_empty() {
            debug!(
                target = %message.to,
                message_type = %message.message_type,
                "message resolved to no in-process recipients"
            );
            return;
        }

        let deliveries = recipients.iter().map(|agent| {
            let message = message.clone();
            async move {
                agent.receive_message(message).await;
            }
        });
        join_all(deliveries).await;
    }

    /// Resolve a named target to zero or more agent ids
    pub async fn resolve_targets(&self, name: &str) -> Vec<AgentId> {
        let candidate = AgentId::new(name);
        {
            let agents = self.agents.read().await;
            if agents.contains_key(&candidate) {
                return vec![candidate];
            }
        }

        // Class-wide pseudo-topic, e.g. `product-agents`
        if let Some(class) = name.strip_suffix("-agents") {
            let agents = self.agents.read().await;
            let ids: Vec<AgentId> = agents
                .values()
                .filter(|r| r.agent.identity().agent_type == class)
                .map(|r| r.agent.identity().id.clone())
                .collect();
            if !ids.is_empty() {
                return ids;
            }
        }

        if name == self.config.operations_topic {
            info!(topic = name, "operations message routed to external channel");
            return Vec::new();
        }

        self.topics
            .read()
            .await
            .get(name)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribe an agent to a routing topic
    pub async fn subscribe_topic(&self, topic: impl Into<String>, agent_id: AgentId) {
        self.topics
            .write()
            .await
            .entry(topic.into())
            .or_default()
            .insert(agent_id);
    }

    pub async fn unsubscribe_topic(&self, topic: &str, agent_id: &AgentId) {
        if let Some(members) = self.topics.write().await.get_mut(topic) {
            members.remove(agent_id);
        }
    }

    // ========================================================================
    // Health checks
    // ========================================================================

    /// One supervision sweep: count, then try to recover every inactive
    /// agent with a fresh `start()`. The summary event is emitted whatever
    /// the restart outcomes.
    pub async fn health_check_now(&self) -> HealthSummary {
        let snapshot: Vec<(AgentId, Arc<Agent>)> = {
            let agents = self.agents.read().await;
            agents
                .iter()
                .map(|(id, r)| (id.clone(), r.agent.clone()))
                .collect()
        };

        let total = snapshot.len();
        let inactive: Vec<(AgentId, Arc<Agent>)> = snapshot
            .into_iter()
            .filter(|(_, agent)| !agent.is_active())
            .collect();
        let active = total - inactive.len();
        let inactive_count = inactive.len();

        let mut restarted = 0;
        for (id, agent) in inactive {
            match agent.start().await {
                Ok(()) => {
                    info!(agent_id = %id, "inactive agent restarted");
                    restarted += 1;
                }
                Err(e) => warn!(agent_id = %id, error = %e, "agent restart failed"),
            }
        }

        self.emit(CoreEvent::HealthCheck {
            total,
            active,
            inactive: inactive_count,
            timestamp: Utc::now(),
        });

        HealthSummary {
            total,
            active,
            inactive: inactive_count,
            restarted,
        }
    }

    /// Start the periodic health-check task. Idempotent.
    pub async fn start_health_checks(self: &Arc<Self>) {
        let mut stop_slot = self.health_stop.lock().await;
        if stop_slot.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        *stop_slot = Some(stop_tx);
        drop(stop_slot);

        let manager: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(interval) => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.health_check_now().await;
                    }
                }
            }
        });
        *self.health_task.lock().await = Some(task);
        info!(interval = ?self.config.health_check_interval, "health checks started");
    }

    // ========================================================================
    // Marketplace relay
    // ========================================================================

    /// Relay marketplace events back to the agents they concern and onto
    /// the manager event surface. Negotiation openings arrive as `Critical`
    /// messages so the target bypasses its polling interval.
    pub async fn attach_marketplace(self: &Arc<Self>, marketplace: &Arc<Marketplace>) {
        let mut source = marketplace.subscribe_events();
        let manager: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                let event = match source.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "marketplace relay lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(manager) = manager.upgrade() else { break };

                let _ = manager.events.send(event.clone());
                manager.relay_market_event(event).await;
            }
        });
        *self.market_task.lock().await = Some(task);
    }

    async fn relay_market_event(&self, event: CoreEvent) {
        let market_id = AgentId::new("marketplace");
        match event {
            CoreEvent::NegotiationStarted { negotiation, .. } => {
                let Ok(payload) = serde_json::to_value(&negotiation) else { return };
                let message = AgentMessage::new(
                    "negotiation_started",
                    market_id,
                    MessageTarget::agent(negotiation.target()),
                    payload,
                    MessagePriority::Critical,
                );
                self.deliver(&message).await;
            }
            CoreEvent::CounterOfferReceived { negotiation_id, agent_id, price_offer, .. } => {
                debug!(
                    negotiation_id = %negotiation_id,
                    agent_id = %agent_id,
                    price_offer = %price_offer,
                    "counter-offer observed"
                );
            }
            CoreEvent::NegotiationCompleted { negotiation, .. } => {
                let Ok(payload) = serde_json::to_value(&negotiation) else { return };
                for participant in &negotiation.participants {
                    let message = AgentMessage::new(
                        "negotiation_completed",
                        market_id.clone(),
                        MessageTarget::agent(participant),
                        payload.clone(),
                        MessagePriority::High,
                    );
                    self.deliver(&message).await;
                }
            }
            CoreEvent::MatchCreated { market_match, .. } => {
                let Ok(payload) = serde_json::to_value(&market_match) else { return };
                for owner in [
                    &market_match.buy_bid.agent_id,
                    &market_match.sell_bid.agent_id,
                ] {
                    let message = AgentMessage::new(
                        "match_created",
                        market_id.clone(),
                        MessageTarget::agent(owner),
                        payload.clone(),
                        MessagePriority::High,
                    );
                    self.deliver(&message).await;
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop supervision, then every agent concurrently, then clear the
    /// registry. Per-agent stop failures are collected, never aborting the
    /// rest.
    pub async fn shutdown(&self) {
        if let Some(stop_tx) = self.health_stop.lock().await.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.health_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(task) = self.market_task.lock().await.take() {
            task.abort();
        }

        let drained: Vec<(AgentId, Registered)> =
            self.agents.write().await.drain().collect();

        let stops = drained.iter().map(|(id, registered)| {
            let agent = registered.agent.clone();
            let id = id.clone();
            async move {
                if let Err(e) = agent.stop().await {
                    warn!(agent_id = %id, error = %e, "agent stop failed during shutdown");
                }
            }
        });
        join_all(stops).await;

        for (_, registered) in drained {
            registered.relay_task.abort();
            registered.event_task.abort();
        }
        self.topics.write().await.clear();

        info!("agent manager shut down");
    }
}
