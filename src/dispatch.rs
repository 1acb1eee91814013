//! Dispatch path: scoring plus directory commit
//!
//! Scoring reads a roster snapshot and the commit re-validates under the
//! agent's lock, so a candidate can be lost between the two. That race is
//! deliberate; the dispatcher resolves it by re-scoring with the lost
//! agent excluded, bounded by the configured retry count.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::directory::WorkerDirectory;
use crate::error::SwitchboardError;
use crate::events::{EventSender, SwitchboardEvent};
use crate::scoring::{FallbackStrategy, ScoringContext, ScoringEngine, ScoringWeights};
use crate::types::{AgentId, ConversationId, QueryId};

/// Seniority floor applied by [`Dispatcher::escalate_to_senior`]
const SENIOR_ESCALATION_FLOOR: u8 = 4;

/// Outcome of one dispatch call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DispatchOutcome {
    /// A worker was reserved for the conversation
    Assigned {
        agent_id: AgentId,
        conversation_id: ConversationId,
        composite_score: f64,
        attempts: u32,
        fallbacks_applied: Vec<FallbackStrategy>,
    },
    /// No worker could be reserved; the query must wait, never be dropped
    Queued { reason: String, attempts: u32 },
}

impl DispatchOutcome {
    pub fn assigned_agent(&self) -> Option<AgentId> {
        match self {
            DispatchOutcome::Assigned { agent_id, .. } => Some(*agent_id),
            DispatchOutcome::Queued { .. } => None,
        }
    }
}

/// Picks and reserves the best-fit worker for an escalated query
pub struct Dispatcher {
    directory: Arc<WorkerDirectory>,
    weights: RwLock<ScoringWeights>,
    max_retries: u32,
    event_tx: EventSender,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<WorkerDirectory>,
        weights: ScoringWeights,
        max_retries: u32,
        event_tx: EventSender,
    ) -> Self {
        Self {
            directory,
            weights: RwLock::new(weights),
            max_retries,
            event_tx,
        }
    }

    pub fn directory(&self) -> &Arc<WorkerDirectory> {
        &self.directory
    }

    pub fn weights(&self) -> ScoringWeights {
        *self.weights.read()
    }

    /// Replace the scoring weights
    ///
    /// The new set is validated first; on rejection the previous weights
    /// remain active.
    pub fn set_weights(&self, weights: ScoringWeights) -> Result<(), SwitchboardError> {
        weights.validate()?;
        *self.weights.write() = weights;
        info!("Scoring weights updated");
        Ok(())
    }

    /// Score the roster and commit the winner, retrying lost races
    pub fn dispatch(
        &self,
        mut context: ScoringContext,
        query_id: QueryId,
        conversation_id: ConversationId,
    ) -> DispatchOutcome {
        let engine = ScoringEngine::new(self.weights());
        let mut attempts = 0;

        while attempts <= self.max_retries {
            attempts += 1;
            let snapshot = self.directory.snapshot(Instant::now());
            let result = engine.score(&context, &snapshot);

            let Some(best) = result.best else {
                debug!(query_id = %query_id, attempts, "No candidate after fallback ladder");
                return self.queued(query_id, "no qualifying worker", attempts);
            };

            match self.directory.assign(best, conversation_id) {
                Ok(()) => {
                    let composite_score = result
                        .scores
                        .first()
                        .map(|s| s.composite)
                        .unwrap_or_default();
                    info!(
                        query_id = %query_id,
                        agent_id = %best,
                        attempts,
                        score = composite_score,
                        "Dispatched query"
                    );
                    return DispatchOutcome::Assigned {
                        agent_id: best,
                        conversation_id,
                        composite_score,
                        attempts,
                        fallbacks_applied: result.fallbacks_applied,
                    };
                }
                Err(SwitchboardError::AgentUnavailable(lost)) => {
                    // Lost the commit race; re-score without this agent
                    debug!(query_id = %query_id, agent_id = %lost, "Lost commit race, re-scoring");
                    context.excluded.insert(lost);
                }
                Err(SwitchboardError::NotFound(_)) => {
                    // Agent removed between snapshot and commit
                    context.excluded.insert(best);
                }
                Err(e) => {
                    warn!(query_id = %query_id, error = %e, "Dispatch commit failed");
                    return self.queued(query_id, "commit failure", attempts);
                }
            }
        }

        self.queued(query_id, "retry budget exhausted", attempts)
    }

    /// Hand a conversation from its current worker to a senior one
    ///
    /// Re-invokes the dispatch path with a seniority floor and the current
    /// worker excluded; on success the conversation is released from the
    /// original worker.
    pub fn escalate_to_senior(
        &self,
        base_context: ScoringContext,
        query_id: QueryId,
        conversation_id: ConversationId,
        current_agent_id: AgentId,
    ) -> Result<DispatchOutcome, SwitchboardError> {
        let mut context = base_context;
        context.excluded.insert(current_agent_id);
        context.min_seniority = Some(
            context
                .min_seniority
                .map_or(SENIOR_ESCALATION_FLOOR, |m| m.max(SENIOR_ESCALATION_FLOOR)),
        );

        let outcome = self.dispatch(context, query_id, conversation_id);
        if outcome.assigned_agent().is_some() {
            // Handoff: release the original worker only once the senior
            // one holds the conversation
            self.directory.complete(current_agent_id, conversation_id)?;
        }
        Ok(outcome)
    }

    fn queued(&self, query_id: QueryId, reason: &str, attempts: u32) -> DispatchOutcome {
        warn!(query_id = %query_id, attempts, reason, "Query queued unassigned");
        let _ = self
            .event_tx
            .send(SwitchboardEvent::QueryQueued { query_id, attempts });
        DispatchOutcome::Queued {
            reason: reason.to_string(),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::AgentProfile;
    use crate::events::event_channel;

    fn test_dispatcher() -> (Arc<Dispatcher>, Arc<WorkerDirectory>) {
        let (tx, _rx) = event_channel();
        let directory = Arc::new(WorkerDirectory::new(tx.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&directory),
            ScoringWeights::default(),
            3,
            tx,
        ));
        (dispatcher, directory)
    }

    fn billing_profile(seniority: u8, capacity: u32) -> AgentProfile {
        AgentProfile {
            name: format!("worker-s{seniority}"),
            specializations: vec!["billing".into()],
            seniority,
            capacity,
            ..Default::default()
        }
    }

    fn billing_context() -> ScoringContext {
        ScoringContext {
            required_specialization: Some("billing".into()),
            language: "en".to_string(),
            ..ScoringContext::new()
        }
    }

    #[test]
    fn test_dispatch_assigns_and_commits() {
        let (dispatcher, directory) = test_dispatcher();
        let worker = directory.register(billing_profile(3, 2));

        let outcome = dispatcher.dispatch(billing_context(), QueryId::new(), ConversationId::new());
        assert_eq!(outcome.assigned_agent(), Some(worker.id()));
        assert_eq!(worker.current_load(), 1);
    }

    #[test]
    fn test_dispatch_empty_roster_queues() {
        let (dispatcher, _directory) = test_dispatcher();

        let outcome = dispatcher.dispatch(billing_context(), QueryId::new(), ConversationId::new());
        assert!(matches!(outcome, DispatchOutcome::Queued { .. }));
    }

    #[test]
    fn test_dispatch_skips_busy_workers() {
        let (dispatcher, directory) = test_dispatcher();
        let full = directory.register(billing_profile(5, 1));
        directory.assign(full.id(), ConversationId::new()).unwrap();
        let open = directory.register(billing_profile(2, 2));

        let outcome = dispatcher.dispatch(billing_context(), QueryId::new(), ConversationId::new());
        assert_eq!(outcome.assigned_agent(), Some(open.id()));
        assert_eq!(full.current_load(), 1);
    }

    #[test]
    fn test_dispatch_never_drops_a_query() {
        let (dispatcher, directory) = test_dispatcher();
        let worker = directory.register(billing_profile(3, 1));
        directory.assign(worker.id(), ConversationId::new()).unwrap();

        // Roster exists but nobody can take the conversation
        let outcome = dispatcher.dispatch(billing_context(), QueryId::new(), ConversationId::new());
        match outcome {
            DispatchOutcome::Queued { attempts, .. } => assert!(attempts >= 1),
            DispatchOutcome::Assigned { .. } => panic!("expected queued outcome"),
        }
    }

    #[test]
    fn test_set_weights_keeps_previous_on_invalid() {
        let (dispatcher, _directory) = test_dispatcher();
        let before = dispatcher.weights();

        let invalid = ScoringWeights {
            skill: 0.9,
            availability: 0.9,
            performance: 0.0,
            wellbeing: 0.0,
            customer: 0.0,
            balance: 0.0,
        };
        assert!(dispatcher.set_weights(invalid).is_err());
        assert_eq!(dispatcher.weights(), before);

        let valid = ScoringWeights::new(0.3, 0.2, 0.2, 0.1, 0.1, 0.1).unwrap();
        dispatcher.set_weights(valid).unwrap();
        assert_eq!(dispatcher.weights(), valid);
    }

    #[test]
    fn test_escalate_to_senior_hands_off() {
        let (dispatcher, directory) = test_dispatcher();
        let junior = directory.register(billing_profile(1, 2));
        let senior = directory.register(billing_profile(5, 2));
        let conversation = ConversationId::new();
        directory.assign(junior.id(), conversation).unwrap();

        let outcome = dispatcher
            .escalate_to_senior(billing_context(), QueryId::new(), conversation, junior.id())
            .unwrap();

        assert_eq!(outcome.assigned_agent(), Some(senior.id()));
        assert_eq!(senior.current_load(), 1);
        // Original worker released after the handoff
        assert_eq!(junior.current_load(), 0);
    }

    #[test]
    fn test_escalate_to_senior_excludes_current_agent() {
        let (dispatcher, directory) = test_dispatcher();
        // Only one worker and it already holds the conversation; even the
        // any-available fallback must not hand the query back to it
        let only = directory.register(billing_profile(5, 3));
        let conversation = ConversationId::new();
        directory.assign(only.id(), conversation).unwrap();

        let outcome = dispatcher
            .escalate_to_senior(billing_context(), QueryId::new(), conversation, only.id())
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Queued { .. }));
        // Still holds the original conversation; nothing was dropped
        assert_eq!(only.current_load(), 1);
    }
}
