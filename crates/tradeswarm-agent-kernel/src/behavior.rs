//! The behavior seam between the actor runtime and domain logic

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use tradeswarm_types::{
    AgentAction, AgentDecision, AgentId, AgentIdentity, AgentMessage, MessagePriority,
    MessageTarget,
};

/// Errors from agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is already running")]
    AlreadyRunning,

    #[error("agent initialization failed: {0}")]
    Initialize(String),

    #[error("decision failed: {0}")]
    Decide(String),

    #[error("message handling failed: {0}")]
    Message(String),

    #[error("action '{kind}' failed: {reason}")]
    Action { kind: String, reason: String },

    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("external collaborator failed: {0}")]
    External(String),

    #[error("outbound mailbox closed")]
    MailboxClosed,
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Handle a behavior uses to reach the outside world.
///
/// The only capabilities exposed are the agent's own identity and the
/// outbound mailbox; everything else (marketplace, inventory, oracle) is
/// injected into the concrete behavior at construction.
#[derive(Clone)]
pub struct AgentContext {
    identity: AgentIdentity,
    outbound: mpsc::UnboundedSender<AgentMessage>,
}

impl AgentContext {
    /// Normally created by the runtime; public so behavior crates can drive
    /// their implementations directly in tests.
    pub fn new(identity: AgentIdentity, outbound: mpsc::UnboundedSender<AgentMessage>) -> Self {
        Self { identity, outbound }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.identity.id
    }

    /// Queue a message for routing. Delivery is handled by whoever drains
    /// the agent's outbound mailbox (normally the manager).
    pub fn send(&self, message: AgentMessage) -> AgentResult<()> {
        self.outbound.send(message).map_err(|_| {
            warn!(agent_id = %self.identity.id, "outbound mailbox closed, message dropped");
            AgentError::MailboxClosed
        })
    }

    /// Build and send a message originating from this agent
    pub fn send_to(
        &self,
        message_type: impl Into<String>,
        to: MessageTarget,
        payload: serde_json::Value,
        priority: MessagePriority,
    ) -> AgentResult<()> {
        self.send(AgentMessage::new(
            message_type,
            self.identity.id.clone(),
            to,
            payload,
            priority,
        ))
    }
}

/// The capability set a concrete agent variant must supply.
///
/// All methods run serialized for a given agent: the runtime never calls two
/// of them concurrently, so implementations may hold plain mutable state.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Called once inside `start()`. A failure aborts the start and leaves
    /// the agent stopped.
    async fn initialize(&mut self, ctx: &AgentContext) -> AgentResult<()>;

    /// Produce at most one decision for this cycle. `None` means there is
    /// nothing to do right now.
    async fn decide(&mut self, ctx: &AgentContext) -> AgentResult<Option<AgentDecision>>;

    /// Handle one inbound message. Errors are isolated to the message.
    async fn handle_message(&mut self, ctx: &AgentContext, message: &AgentMessage)
        -> AgentResult<()>;

    /// Execute one action from a decision. Errors mark the action failed
    /// without cancelling its siblings.
    async fn execute_action(
        &mut self,
        ctx: &AgentContext,
        action: &AgentAction,
    ) -> AgentResult<serde_json::Value>;

    /// Called once at the end of `stop()`, after in-flight work drained.
    async fn cleanup(&mut self, ctx: &AgentContext) -> AgentResult<()>;
}
