//! Workflow orchestrator - drives one query through the pipeline
//!
//! One orchestrator instance processes one query at a time and shares no
//! per-query state with other in-flight queries; the only shared resources
//! are the dispatcher's directory and the session tracker. Nodes run
//! strictly sequentially.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SwitchboardConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::SwitchboardError;
use crate::events::{EventSender, SwitchboardEvent};
use crate::scoring::ScoringContext;
use crate::state::{Assignment, EscalationData, QueryState, WorkflowResult, WorkflowStage};
use crate::tracker::{QueryCompletion, SessionTracker};
use crate::types::ConversationId;

/// An external pipeline stage
///
/// Takes ownership of the query record and returns the updated record.
/// Retry policy is the node's own concern; the orchestrator halts on the
/// first failure.
#[async_trait]
pub trait QueryNode: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, state: QueryState) -> Result<QueryState, SwitchboardError>;
}

/// The external collaborators of the pipeline, injected at construction
#[derive(Clone)]
pub struct PipelineNodes {
    pub automation: Arc<dyn QueryNode>,
    pub ai_response: Arc<dyn QueryNode>,
    pub evaluation: Arc<dyn QueryNode>,
    pub human_response: Arc<dyn QueryNode>,
    pub feedback: Arc<dyn QueryNode>,
    pub quality: Arc<dyn QueryNode>,
}

/// Cooperative cancellation flag, checked between node invocations
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Pure routing table: which stage follows the one just executed
///
/// Escalation wins when the evaluation signal reaches the threshold or
/// the automation layer forced it.
pub fn next_stage(state: &QueryState, escalation_threshold: f64) -> WorkflowStage {
    let forced = state
        .assessment
        .as_ref()
        .is_some_and(|a| a.force_escalation);

    match state.stage {
        WorkflowStage::Init => WorkflowStage::AutomationCheck,
        WorkflowStage::AutomationCheck => {
            if forced {
                WorkflowStage::Escalate
            } else if state.assessment.as_ref().is_some_and(|a| a.handled) {
                WorkflowStage::Respond
            } else {
                WorkflowStage::AiResponse
            }
        }
        WorkflowStage::AiResponse => WorkflowStage::Evaluation,
        WorkflowStage::Evaluation => {
            let signal = state
                .evaluation
                .as_ref()
                .map_or(0.0, |e| e.escalation_signal());
            if forced || signal >= escalation_threshold {
                WorkflowStage::Escalate
            } else {
                WorkflowStage::Respond
            }
        }
        WorkflowStage::Respond => WorkflowStage::Feedback,
        WorkflowStage::Escalate => WorkflowStage::HumanAssignment,
        WorkflowStage::HumanAssignment => {
            if state.assignment.is_some() {
                WorkflowStage::HumanResponse
            } else {
                // Queued unassigned; the query waits out of band
                WorkflowStage::Complete
            }
        }
        WorkflowStage::HumanResponse => WorkflowStage::Feedback,
        WorkflowStage::Feedback => WorkflowStage::QualityMetrics,
        WorkflowStage::QualityMetrics => WorkflowStage::Complete,
        WorkflowStage::Complete | WorkflowStage::Failed => WorkflowStage::Complete,
    }
}

/// Drives one query's working record through the escalation pipeline
pub struct WorkflowOrchestrator {
    nodes: PipelineNodes,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<SessionTracker>,
    config: SwitchboardConfig,
    event_tx: EventSender,
    cancel: CancelHandle,
}

impl WorkflowOrchestrator {
    pub fn new(
        nodes: PipelineNodes,
        dispatcher: Arc<Dispatcher>,
        tracker: Arc<SessionTracker>,
        config: SwitchboardConfig,
        event_tx: EventSender,
    ) -> Self {
        Self {
            nodes,
            dispatcher,
            tracker,
            config,
            event_tx,
            cancel: CancelHandle::new(),
        }
    }

    /// Handle used to cancel this orchestrator's execution
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Share an externally created cancellation handle
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Pre-execution check; true when the record can enter the pipeline
    pub fn validate_initial_state(state: &QueryState) -> bool {
        state.stage == WorkflowStage::Init
            && !state.workflow_complete
            && !state.query_text.trim().is_empty()
            && !state.user_id.trim().is_empty()
    }

    /// Run the pipeline to completion, failure, or cancellation
    ///
    /// An invalid initial record is rejected with a `Validation` error
    /// before any side effect; node failures and cancellation come back as
    /// an `Ok` result with `success == false` and the partial record.
    #[instrument(skip(self, state), fields(query_id = %state.query_id))]
    pub async fn execute(&self, mut state: QueryState) -> Result<WorkflowResult, SwitchboardError> {
        if !Self::validate_initial_state(&state) {
            return Err(SwitchboardError::Validation(
                "query record missing required fields or already started".into(),
            ));
        }

        let started = Instant::now();
        info!(session_id = %state.session_id, "Starting workflow");
        let _ = self.event_tx.send(SwitchboardEvent::QueryStarted {
            query_id: state.query_id,
            session_id: state.session_id,
        });

        let mut run_error: Option<String> = None;
        let mut queued = false;

        loop {
            if self.cancel.is_cancelled() {
                warn!("Workflow cancelled");
                run_error = Some(SwitchboardError::Cancelled.to_string());
                state.stage = WorkflowStage::Failed;
                break;
            }

            let stage = next_stage(&state, self.config.escalation_threshold);
            state.stage = stage;

            if stage == WorkflowStage::Complete {
                state.workflow_complete = true;
                break;
            }

            let node_started = Instant::now();
            let step = match stage {
                WorkflowStage::AutomationCheck => self.run_node(&self.nodes.automation, &state).await,
                WorkflowStage::AiResponse => self.run_node(&self.nodes.ai_response, &state).await,
                WorkflowStage::Evaluation => self.run_node(&self.nodes.evaluation, &state).await,
                WorkflowStage::HumanResponse => self.run_node(&self.nodes.human_response, &state).await,
                WorkflowStage::Feedback => self.run_node(&self.nodes.feedback, &state).await,
                WorkflowStage::QualityMetrics => self.run_node(&self.nodes.quality, &state).await,
                WorkflowStage::Respond => Ok(self.respond(state.clone())),
                WorkflowStage::Escalate => Ok(self.escalate(state.clone())),
                WorkflowStage::HumanAssignment => {
                    let (next, was_queued) = self.assign_human(state.clone());
                    queued = queued || was_queued;
                    Ok(next)
                }
                WorkflowStage::Init | WorkflowStage::Complete | WorkflowStage::Failed => {
                    unreachable!("terminal stages never dispatch a node")
                }
            };

            match step {
                Ok(next) => {
                    state = next;
                    let elapsed = node_started.elapsed();
                    let node = stage.node_name();
                    state.record_node(node, elapsed);
                    self.tracker
                        .record_node_execution(state.session_id, node, elapsed);
                    let _ = self.event_tx.send(SwitchboardEvent::NodeCompleted {
                        query_id: state.query_id,
                        node: node.to_string(),
                        elapsed,
                    });
                    debug!(node, ?elapsed, "Node completed");
                }
                Err(e) => {
                    // Halt immediately; the pre-node record is preserved
                    // for diagnostics and the failing node is not part of
                    // the execution path
                    error!(node = stage.node_name(), error = %e, "Node failed, halting workflow");
                    run_error = Some(e.to_string());
                    state.error = Some(e.to_string());
                    state.stage = WorkflowStage::Failed;
                    break;
                }
            }
        }

        Ok(self.finish(state, started, run_error, queued))
    }

    /// Run one external node on a copy of the record, keeping the original
    /// for diagnostics if the node fails
    async fn run_node(
        &self,
        node: &Arc<dyn QueryNode>,
        state: &QueryState,
    ) -> Result<QueryState, SwitchboardError> {
        let mut next = node.run(state.clone()).await?;
        // Token/cost counters accumulate additively as stages produce them
        if next.stage == WorkflowStage::AiResponse {
            if let Some(answer) = &next.ai_answer {
                next.usage.add(answer.usage);
            }
        }
        Ok(next)
    }

    /// Internal stage: answer with the automated or AI answer
    fn respond(&self, mut state: QueryState) -> QueryState {
        state.next_action = Some("respond".to_string());
        state
    }

    /// Internal stage: build the escalation record
    fn escalate(&self, mut state: QueryState) -> QueryState {
        let (reason, category) = match (&state.assessment, &state.evaluation) {
            (Some(a), _) if a.force_escalation => {
                ("automation_forced".to_string(), a.category.clone())
            }
            (assessment, Some(e)) => (
                format!("evaluation_signal {:.2}", e.escalation_signal()),
                assessment.as_ref().and_then(|a| a.category.clone()),
            ),
            (assessment, None) => (
                "escalation_requested".to_string(),
                assessment.as_ref().and_then(|a| a.category.clone()),
            ),
        };

        let escalation = EscalationData {
            reason: reason.clone(),
            required_specialization: category,
            urgency_multiplier: 1.0 + 0.2 * state.customer.priority.rank(),
        };
        info!(reason, "Escalating query to human");
        let _ = self.event_tx.send(SwitchboardEvent::QueryEscalated {
            query_id: state.query_id,
            reason,
        });
        state.escalation = Some(escalation);
        state.next_action = Some("escalate".to_string());
        state
    }

    /// Internal stage: score the roster and commit the best worker
    ///
    /// Returns the updated record and whether the query ended up queued.
    fn assign_human(&self, mut state: QueryState) -> (QueryState, bool) {
        let escalation = state.escalation.clone().unwrap_or(EscalationData {
            reason: "unspecified".to_string(),
            required_specialization: None,
            urgency_multiplier: 1.0,
        });

        let context = ScoringContext {
            required_specialization: escalation.required_specialization,
            priority: state.customer.priority,
            complexity: state
                .evaluation
                .as_ref()
                .map_or(0.5, |e| e.complexity),
            tier: state.customer.tier,
            language: state.customer.language.clone(),
            previous_agent: state.customer.previous_agent,
            urgency_multiplier: escalation.urgency_multiplier,
            ..ScoringContext::new()
        };

        let conversation_id = ConversationId::new();
        match self
            .dispatcher
            .dispatch(context, state.query_id, conversation_id)
        {
            DispatchOutcome::Assigned {
                agent_id, attempts, ..
            } => {
                state.assignment = Some(Assignment {
                    agent_id,
                    conversation_id,
                    attempts,
                });
                state.next_action = Some("human_response".to_string());
                (state, false)
            }
            DispatchOutcome::Queued { .. } => {
                state.assignment = None;
                state.next_action = Some("queued".to_string());
                (state, true)
            }
        }
    }

    /// Terminal bookkeeping; runs exactly once per query
    fn finish(
        &self,
        mut state: QueryState,
        started: Instant,
        run_error: Option<String>,
        queued: bool,
    ) -> WorkflowResult {
        let success = run_error.is_none();
        let total_duration = started.elapsed();

        // Release the worker and feed their performance history once the
        // conversation is over
        if let Some(assignment) = &state.assignment {
            let directory = self.dispatcher.directory();
            if let Err(e) = directory.complete(assignment.agent_id, assignment.conversation_id) {
                warn!(agent_id = %assignment.agent_id, error = %e, "Failed to release worker");
            }
            if let Some(feedback) = &state.feedback {
                let _ = directory.record_feedback(
                    assignment.agent_id,
                    feedback.satisfaction,
                    total_duration,
                );
            }
        }

        self.tracker.record_query(QueryCompletion {
            session_id: state.session_id,
            escalated: state.escalation.is_some(),
            response_time: total_duration,
            satisfaction: state.feedback.as_ref().map(|f| f.satisfaction),
            usage: state.usage,
        });

        let _ = self.event_tx.send(SwitchboardEvent::QueryCompleted {
            query_id: state.query_id,
            success,
        });
        info!(
            success,
            path = ?state.execution_path,
            ?total_duration,
            "Workflow finished"
        );

        if success {
            state.workflow_complete = true;
        }
        WorkflowResult {
            success,
            execution_path: state.execution_path.clone(),
            total_duration,
            error: run_error,
            metadata: json!({ "queued": queued }),
            final_state: state,
        }
    }
}
