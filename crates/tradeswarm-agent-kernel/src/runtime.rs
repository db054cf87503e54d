//! The actor runtime: queue, scheduler, bounded actions, lifecycle

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tradeswarm_types::{
    ActionId, ActionStatus, AgentAction, AgentDecision, AgentIdentity, AgentMessage, CoreEvent,
};

use crate::behavior::{AgentBehavior, AgentContext, AgentError, AgentResult};

/// Decisions kept per agent, oldest evicted first
pub const DECISION_HISTORY_LIMIT: usize = 10;

/// Buffered events before a lagging observer starts dropping
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Grace period for the decision-cycle task to observe the stop signal
const TASK_JOIN_GRACE: Duration = Duration::from_secs(1);

/// Runtime configuration for one agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Disabled agents keep their timer but skip every cycle
    pub enabled: bool,
    /// Period of the decision cycle
    pub decision_interval: Duration,
    /// Cap on concurrently active actions
    pub max_concurrent_actions: usize,
    /// Messages drained per cycle
    pub message_batch_size: usize,
    /// Ceiling on waiting for in-flight actions during `stop()`
    pub stop_drain_timeout: Duration,
    /// Poll period while draining during `stop()`
    pub stop_poll_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            decision_interval: Duration::from_secs(5),
            max_concurrent_actions: 3,
            message_batch_size: 10,
            stop_drain_timeout: Duration::from_secs(30),
            stop_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Priority queue with stable arrival order within a priority level
struct MessageQueue {
    entries: VecDeque<(u64, AgentMessage)>,
    next_seq: u64,
}

impl MessageQueue {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
        }
    }

    fn push(&mut self, message: AgentMessage) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back((seq, message));
        seq
    }

    fn remove(&mut self, seq: u64) -> Option<AgentMessage> {
        let idx = self.entries.iter().position(|(s, _)| *s == seq)?;
        self.entries.remove(idx).map(|(_, m)| m)
    }

    /// Take up to `max` messages: highest priority first, arrival order
    /// within a priority.
    fn drain(&mut self, max: usize) -> Vec<AgentMessage> {
        let mut all: Vec<(u64, AgentMessage)> = self.entries.drain(..).collect();
        // Stable sort keyed on priority alone keeps arrival order intact
        // within each level.
        all.sort_by(|(_, a), (_, b)| b.priority.cmp(&a.priority));

        let rest = all.split_off(max.min(all.len()));
        self.entries.extend(rest);
        all.into_iter().map(|(_, m)| m).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// State shared between the agent handle and its decision-cycle task
struct AgentShared {
    identity: AgentIdentity,
    config: AgentConfig,
    ctx: AgentContext,
    behavior: AsyncMutex<Box<dyn AgentBehavior>>,
    queue: Mutex<MessageQueue>,
    active_actions: Mutex<HashMap<ActionId, AgentAction>>,
    history: Mutex<VecDeque<AgentDecision>>,
    running: AtomicBool,
    ticks: AtomicU64,
    events: broadcast::Sender<CoreEvent>,
}

impl AgentShared {
    fn emit(&self, event: CoreEvent) {
        // No observers is fine
        let _ = self.events.send(event);
    }

    fn emit_error(&self, stage: &str, error: &AgentError) {
        self.emit(CoreEvent::AgentError {
            agent_id: self.identity.id.clone(),
            stage: stage.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn push_history(&self, decision: AgentDecision) {
        let mut history = self.history.lock();
        if history.len() == DECISION_HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(decision);
    }

    fn active_count(&self) -> usize {
        self.active_actions.lock().len()
    }

    /// One decision-cycle tick: drain messages, maybe decide, execute
    async fn run_tick(self: &Arc<Self>) -> AgentResult<()> {
        // (1) Drain queued messages in priority order; failures are
        // isolated per message.
        let batch = {
            let mut queue = self.queue.lock();
            queue.drain(self.config.message_batch_size)
        };
        for message in &batch {
            let mut behavior = self.behavior.lock().await;
            if let Err(e) = behavior.handle_message(&self.ctx, message).await {
                warn!(
                    agent_id = %self.identity.id,
                    message_id = %message.id,
                    message_type = %message.message_type,
                    error = %e,
                    "message handling failed"
                );
                self.emit_error("handle_message", &e);
            }
        }

        // (2) Skip decision-making entirely while at the action cap
        if self.active_count() >= self.config.max_concurrent_actions {
            debug!(
                agent_id = %self.identity.id,
                active = self.active_count(),
                "action cap reached, skipping decision"
            );
            return Ok(());
        }

        // (3) Decide and execute
        let decision = {
            let mut behavior = self.behavior.lock().await;
            behavior.decide(&self.ctx).await?
        };

        if let Some(decision) = decision {
            debug!(
                agent_id = %self.identity.id,
                decision_id = %decision.id,
                actions = decision.actions.len(),
                confidence = decision.confidence,
                "decision produced"
            );
            self.push_history(decision.clone());

            for action in decision.actions {
                if self.active_count() >= self.config.max_concurrent_actions {
                    debug!(
                        agent_id = %self.identity.id,
                        "action cap would be exceeded, deferring remaining actions"
                    );
                    break;
                }
                self.execute_action(action).await;
            }
        }

        Ok(())
    }

    /// Run one action through its lifecycle. Failures terminate only this
    /// action.
    async fn execute_action(self: &Arc<Self>, mut action: AgentAction) {
        action.status = ActionStatus::Executing;
        self.active_actions.lock().insert(action.id, action.clone());

        let result = {
            let mut behavior = self.behavior.lock().await;
            behavior.execute_action(&self.ctx, &action).await
        };

        self.active_actions.lock().remove(&action.id);

        match result {
            Ok(_) => {
                info!(
                    agent_id = %self.identity.id,
                    action_id = %action.id,
                    kind = %action.kind,
                    "action completed"
                );
                self.emit(CoreEvent::ActionCompleted {
                    agent_id: self.identity.id.clone(),
                    action_id: action.id,
                    kind: action.kind.clone(),
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                warn!(
                    agent_id = %self.identity.id,
                    action_id = %action.id,
                    kind = %action.kind,
                    error = %e,
                    "action failed"
                );
                self.emit(CoreEvent::ActionFailed {
                    agent_id: self.identity.id.clone(),
                    action_id: action.id,
                    kind: action.kind.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }
}

/// An agent: one actor advancing on its own timer.
///
/// Created around a boxed [`AgentBehavior`]; the manager owns the handle
/// for lifecycle purposes, the agent owns its own queue and state.
pub struct Agent {
    shared: Arc<AgentShared>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentMessage>>>,
    stop_tx: AsyncMutex<Option<oneshot::Sender<()>>>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(identity: AgentIdentity, config: AgentConfig, behavior: Box<dyn AgentBehavior>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ctx = AgentContext::new(identity.clone(), outbound_tx);

        Self {
            shared: Arc::new(AgentShared {
                identity,
                config,
                ctx,
                behavior: AsyncMutex::new(behavior),
                queue: Mutex::new(MessageQueue::new()),
                active_actions: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
                events,
            }),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            stop_tx: AsyncMutex::new(None),
            task: AsyncMutex::new(None),
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.shared.identity
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    /// Whether the decision cycle is scheduled
    pub fn is_active(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Completed decision-cycle ticks since start
    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }

    pub fn active_action_count(&self) -> usize {
        self.shared.active_count()
    }

    pub fn queued_message_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Snapshot of the bounded decision history, oldest first
    pub fn decision_history(&self) -> Vec<AgentDecision> {
        self.shared.history.lock().iter().cloned().collect()
    }

    /// Subscribe to this agent's lifecycle/action events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.shared.events.subscribe()
    }

    /// Take the outbound mailbox. The manager calls this exactly once when
    /// wiring the agent onto the bus.
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<AgentMessage>> {
        self.outbound_rx.lock().take()
    }

    /// Send a message on behalf of this agent
    pub fn send_message(&self, message: AgentMessage) -> AgentResult<()> {
        self.shared.ctx.send(message)
    }

    /// Start the agent: initialize the behavior, then schedule the decision
    /// cycle. Fails if already running; an `initialize` failure leaves the
    /// agent stopped.
    pub async fn start(&self) -> AgentResult<()> {
        if self.is_active() {
            return Err(AgentError::AlreadyRunning);
        }

        {
            let mut behavior = self.shared.behavior.lock().await;
            behavior.initialize(&self.shared.ctx).await?;
        }

        self.shared.running.store(true, Ordering::SeqCst);

        let (stop_tx, mut stop_rx) = oneshot::channel();
        *self.stop_tx.lock().await = Some(stop_tx);

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(shared.config.decision_interval) => {
                        if !shared.running.load(Ordering::SeqCst) {
                            break;
                        }
                        if !shared.config.enabled {
                            continue;
                        }
                        // A failed tick never stops the schedule
                        if let Err(e) = shared.run_tick().await {
                            warn!(
                                agent_id = %shared.identity.id,
                                error = %e,
                                "decision cycle failed"
                            );
                            shared.emit_error("decision_cycle", &e);
                        }
                        shared.ticks.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
        *self.task.lock().await = Some(task);

        info!(agent_id = %self.shared.identity.id, "agent started");
        self.shared.emit(CoreEvent::AgentStarted {
            agent_id: self.shared.identity.id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Receive an inbound message.
    ///
    /// Always enqueues; `High`/`Critical` messages are then pulled straight
    /// back out and handled immediately so urgent marketplace events do not
    /// wait for the next scheduled cycle.
    pub async fn receive_message(&self, message: AgentMessage) {
        let urgent = message.priority.is_urgent();
        let seq = self.shared.queue.lock().push(message);

        if !urgent {
            return;
        }

        let Some(message) = self.shared.queue.lock().remove(seq) else {
            // A concurrent drain got there first; the message was handled.
            return;
        };

        let mut behavior = self.shared.behavior.lock().await;
        if let Err(e) = behavior.handle_message(&self.shared.ctx, &message).await {
            warn!(
                agent_id = %self.shared.identity.id,
                message_id = %message.id,
                message_type = %message.message_type,
                error = %e,
                "urgent message handling failed"
            );
            self.shared.emit_error("handle_message", &e);
        }
    }

    /// Stop the agent: cancel future cycles, wait (bounded) for in-flight
    /// actions, then clean up. Never blocks forever.
    pub async fn stop(&self) -> AgentResult<()> {
        if !self.is_active() {
            debug!(agent_id = %self.shared.identity.id, "stop on inactive agent, nothing to do");
            return Ok(());
        }

        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(stop_tx) = self.stop_tx.lock().await.take() {
            let _ = stop_tx.send(());
        }

        // Bounded wait for in-flight actions to drain
        let deadline = tokio::time::Instant::now() + self.shared.config.stop_drain_timeout;
        while self.shared.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    agent_id = %self.shared.identity.id,
                    remaining = self.shared.active_count(),
                    "in-flight actions did not drain before the stop ceiling, proceeding"
                );
                break;
            }
            tokio::time::sleep(self.shared.config.stop_poll_interval).await;
        }

        if let Some(mut task) = self.task.lock().await.take() {
            // The loop observes the stop signal between ticks; give it a
            // short grace, then cancel outright.
            if tokio::time::timeout(TASK_JOIN_GRACE, &mut task).await.is_err() {
                task.abort();
                warn!(agent_id = %self.shared.identity.id, "decision-cycle task outlived stop, aborted");
            }
        }

        {
            let mut behavior = self.shared.behavior.lock().await;
            if let Err(e) = behavior.cleanup(&self.shared.ctx).await {
                warn!(agent_id = %self.shared.identity.id, error = %e, "cleanup failed");
            }
        }

        info!(agent_id = %self.shared.identity.id, "agent stopped");
        self.shared.emit(CoreEvent::AgentStopped {
            agent_id: self.shared.identity.id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}
