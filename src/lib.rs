//! # Switchboard
//!
//! Customer query escalation pipeline with multi-criteria human dispatch.
//!
//! Queries flow through an automated-then-human pipeline; when automation
//! and the AI answer fall short, the query is escalated and assigned to
//! the best-fit human worker from a live roster.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     WORKFLOW ORCHESTRATOR                        │
//! │  INIT → AUTOMATION → AI ANSWER → EVALUATION → {RESPOND|ESCALATE} │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ escalate
//!                                 ▼
//!                    ┌────────────────────────┐
//!                    │       DISPATCHER       │
//!                    │ score → commit → retry │
//!                    └─────┬────────────┬─────┘
//!                 snapshot │            │ assign / complete
//!                          ▼            ▼
//!                ┌───────────────┐  ┌──────────────────┐
//!                │ SCORING ENGINE│  │ WORKER DIRECTORY │
//!                │  (pure ranks) │  │ (per-agent locks)│
//!                └───────────────┘  └──────────────────┘
//!
//!         SESSION TRACKER observes every node transition and
//!         every query completion.
//! ```
//!
//! ## Key concepts
//!
//! - **Escalation**: handing a query from automation/AI to a human worker
//! - **Dispatch/commit split**: scoring is a pure ranking over a roster
//!   snapshot; reserving the worker happens separately under the agent's
//!   lock, with a bounded re-score retry when the commit loses a race
//! - **Fallback strategy**: a recorded relaxation of the candidate filters
//!   when nobody qualifies outright; an unassignable query is queued,
//!   never dropped

pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod scoring;
pub mod state;
pub mod store;
pub mod tracker;
pub mod types;
pub mod workflow;

pub use config::SwitchboardConfig;
pub use directory::{AgentHandle, AgentProfile, AgentSnapshot, HumanAgent, WorkerDirectory};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::SwitchboardError;
pub use events::{event_channel, EventReceiver, EventSender, SwitchboardEvent};
pub use scoring::{
    AgentScore, FallbackStrategy, ScoringContext, ScoringEngine, ScoringResult, ScoringWeights,
};
pub use state::{QueryState, WorkflowResult, WorkflowStage};
pub use store::{AgentStore, MemoryStore, SessionStore};
pub use tracker::{QueryCompletion, SessionMetrics, SessionTracker, SystemMetrics};
pub use types::{
    AgentId, AgentStatus, ConversationId, CustomerTier, Priority, QueryId, SessionId,
    Specialization, Usage,
};
pub use workflow::{next_stage, CancelHandle, PipelineNodes, QueryNode, WorkflowOrchestrator};
