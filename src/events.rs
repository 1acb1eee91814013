//! Observability event stream
//!
//! Every shared component emits fire-and-forget events over an unbounded
//! channel; a dropped receiver never blocks the pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{AgentId, ConversationId, QueryId, SessionId};

/// Events emitted by the workflow, dispatcher, and directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchboardEvent {
    QueryStarted {
        query_id: QueryId,
        session_id: SessionId,
    },
    NodeCompleted {
        query_id: QueryId,
        node: String,
        elapsed: Duration,
    },
    QueryEscalated {
        query_id: QueryId,
        reason: String,
    },
    QueryQueued {
        query_id: QueryId,
        attempts: u32,
    },
    QueryCompleted {
        query_id: QueryId,
        success: bool,
    },
    AgentAssigned {
        agent_id: AgentId,
        conversation_id: ConversationId,
    },
    AgentReleased {
        agent_id: AgentId,
        conversation_id: ConversationId,
    },
    AgentOnBreak {
        agent_id: AgentId,
        duration: Duration,
    },
    ConversationReassigned {
        conversation_id: ConversationId,
        from: AgentId,
        to: AgentId,
    },
}

pub type EventSender = mpsc::UnboundedSender<SwitchboardEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SwitchboardEvent>;

/// Create a sender/receiver pair for switchboard events
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// A sender whose receiver is already dropped, for callers that do not
/// observe events
pub fn null_sender() -> EventSender {
    let (tx, _rx) = mpsc::unbounded_channel();
    tx
}
