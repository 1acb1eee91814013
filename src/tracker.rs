//! Session and system metrics
//!
//! Each session's metrics sit behind their own lock; system-wide reads
//! clone the handle list and then visit sessions one at a time, so they
//! never hold a global lock and may lag in-flight sessions slightly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{SessionId, Usage};

/// Metrics for one user session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: SessionId,
    pub user_id: String,
    pub query_count: u64,
    /// Always <= `query_count`
    pub escalation_count: u64,
    pub total_response_time: Duration,
    /// Running mean over queries that carried a satisfaction sample
    pub mean_satisfaction: f64,
    pub satisfaction_samples: u64,
    pub usage: Usage,
    /// Cumulative time spent per pipeline node
    pub node_times: HashMap<String, Duration>,
    pub ended: bool,
    // Derived aggregates, computed when the session ends
    pub avg_response_time: Option<Duration>,
    pub escalation_rate: Option<f64>,
}

impl SessionMetrics {
    fn new(session_id: SessionId, user_id: String) -> Self {
        Self {
            session_id,
            user_id,
            query_count: 0,
            escalation_count: 0,
            total_response_time: Duration::ZERO,
            mean_satisfaction: 0.0,
            satisfaction_samples: 0,
            usage: Usage::default(),
            node_times: HashMap::new(),
            ended: false,
            avg_response_time: None,
            escalation_rate: None,
        }
    }
}

/// One finished query, reported by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCompletion {
    pub session_id: SessionId,
    pub escalated: bool,
    pub response_time: Duration,
    pub satisfaction: Option<f64>,
    pub usage: Usage,
}

/// Aggregate view over all known sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_queries: u64,
    pub total_escalations: u64,
    pub escalation_rate: f64,
    pub mean_satisfaction: f64,
    pub usage: Usage,
    pub total_response_time: Duration,
    pub node_times: HashMap<String, Duration>,
}

/// Tracks per-session and system-wide performance signals
pub struct SessionTracker {
    sessions: RwLock<HashMap<SessionId, Arc<RwLock<SessionMetrics>>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session's mutable window
    pub fn start_session(&self, session_id: SessionId, user_id: impl Into<String>) {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session_id) {
            warn!(session_id = %session_id, "Session already started");
            return;
        }
        sessions.insert(
            session_id,
            Arc::new(RwLock::new(SessionMetrics::new(session_id, user_id.into()))),
        );
        info!(session_id = %session_id, "Session started");
    }

    /// Freeze a session and compute its derived aggregates
    ///
    /// Returns `None` for an unknown session id.
    pub fn end_session(&self, session_id: SessionId) -> Option<SessionMetrics> {
        let handle = self.sessions.read().get(&session_id).cloned()?;
        let mut metrics = handle.write();
        if !metrics.ended {
            metrics.ended = true;
            if metrics.query_count > 0 {
                metrics.avg_response_time =
                    Some(metrics.total_response_time / metrics.query_count as u32);
                metrics.escalation_rate =
                    Some(metrics.escalation_count as f64 / metrics.query_count as f64);
            }
            info!(
                session_id = %session_id,
                queries = metrics.query_count,
                escalations = metrics.escalation_count,
                "Session ended"
            );
        }
        Some(metrics.clone())
    }

    /// Fold a finished query into its session
    ///
    /// Ignored with a warning when the session is unknown or already
    /// frozen.
    pub fn record_query(&self, completion: QueryCompletion) {
        let Some(handle) = self.sessions.read().get(&completion.session_id).cloned() else {
            warn!(session_id = %completion.session_id, "Query for unknown session");
            return;
        };

        let mut metrics = handle.write();
        if metrics.ended {
            warn!(session_id = %completion.session_id, "Query for ended session ignored");
            return;
        }

        metrics.query_count += 1;
        if completion.escalated {
            metrics.escalation_count += 1;
        }
        metrics.total_response_time += completion.response_time;
        metrics.usage.add(completion.usage);
        if let Some(satisfaction) = completion.satisfaction {
            metrics.satisfaction_samples += 1;
            let n = metrics.satisfaction_samples as f64;
            metrics.mean_satisfaction += (satisfaction - metrics.mean_satisfaction) / n;
        }

        debug!(
            session_id = %completion.session_id,
            queries = metrics.query_count,
            "Recorded query completion"
        );
    }

    /// Accumulate time spent in one pipeline node
    pub fn record_node_execution(&self, session_id: SessionId, node: &str, elapsed: Duration) {
        let Some(handle) = self.sessions.read().get(&session_id).cloned() else {
            return;
        };
        let mut metrics = handle.write();
        if metrics.ended {
            return;
        }
        *metrics
            .node_times
            .entry(node.to_string())
            .or_insert(Duration::ZERO) += elapsed;
    }

    /// Point-in-time copy of one session's metrics
    pub fn get_session(&self, session_id: SessionId) -> Option<SessionMetrics> {
        let handle = self.sessions.read().get(&session_id).cloned()?;
        let metrics = handle.read().clone();
        Some(metrics)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Write every ended session to a persistence backend
    pub async fn flush_ended(
        &self,
        store: &dyn crate::store::SessionStore,
    ) -> Result<usize, crate::error::SwitchboardError> {
        let handles: Vec<Arc<RwLock<SessionMetrics>>> =
            self.sessions.read().values().cloned().collect();

        let mut flushed = 0;
        for handle in handles {
            let metrics = handle.read().clone();
            if metrics.ended {
                store.put(metrics).await?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Aggregate over all known sessions
    ///
    /// Iterates a snapshot of the session list, so the result may lag
    /// sessions mutated mid-aggregation.
    pub fn get_system_metrics(&self) -> SystemMetrics {
        let handles: Vec<Arc<RwLock<SessionMetrics>>> =
            self.sessions.read().values().cloned().collect();

        let mut system = SystemMetrics::default();
        let mut satisfaction_weight = 0u64;
        let mut satisfaction_sum = 0.0;

        for handle in handles {
            let metrics = handle.read();
            system.total_sessions += 1;
            if !metrics.ended {
                system.active_sessions += 1;
            }
            system.total_queries += metrics.query_count;
            system.total_escalations += metrics.escalation_count;
            system.total_response_time += metrics.total_response_time;
            system.usage.add(metrics.usage);
            satisfaction_weight += metrics.satisfaction_samples;
            satisfaction_sum += metrics.mean_satisfaction * metrics.satisfaction_samples as f64;
            for (node, elapsed) in &metrics.node_times {
                *system
                    .node_times
                    .entry(node.clone())
                    .or_insert(Duration::ZERO) += *elapsed;
            }
        }

        if system.total_queries > 0 {
            system.escalation_rate = system.total_escalations as f64 / system.total_queries as f64;
        }
        if satisfaction_weight > 0 {
            system.mean_satisfaction = satisfaction_sum / satisfaction_weight as f64;
        }
        system
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(session_id: SessionId, escalated: bool, satisfaction: Option<f64>) -> QueryCompletion {
        QueryCompletion {
            session_id,
            escalated,
            response_time: Duration::from_secs(10),
            satisfaction,
            usage: Usage {
                tokens: 100,
                cost_usd: 0.01,
            },
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let tracker = SessionTracker::new();
        let session_id = SessionId::new();
        tracker.start_session(session_id, "user-1");

        tracker.record_query(completion(session_id, false, Some(0.9)));
        tracker.record_query(completion(session_id, true, Some(0.5)));

        let frozen = tracker.end_session(session_id).unwrap();
        assert!(frozen.ended);
        assert_eq!(frozen.query_count, 2);
        assert_eq!(frozen.escalation_count, 1);
        assert_eq!(frozen.avg_response_time, Some(Duration::from_secs(10)));
        assert_eq!(frozen.escalation_rate, Some(0.5));
    }

    #[test]
    fn test_incremental_mean_satisfaction() {
        let tracker = SessionTracker::new();
        let session_id = SessionId::new();
        tracker.start_session(session_id, "user-1");

        for s in [0.2, 0.4, 0.9] {
            tracker.record_query(completion(session_id, false, Some(s)));
        }

        let metrics = tracker.get_session(session_id).unwrap();
        assert!((metrics.mean_satisfaction - 0.5).abs() < 1e-9);
        assert_eq!(metrics.satisfaction_samples, 3);
    }

    #[test]
    fn test_escalations_never_exceed_queries() {
        let tracker = SessionTracker::new();
        let session_id = SessionId::new();
        tracker.start_session(session_id, "user-1");

        for i in 0..10 {
            tracker.record_query(completion(session_id, i % 2 == 0, None));
            let metrics = tracker.get_session(session_id).unwrap();
            assert!(metrics.escalation_count <= metrics.query_count);
        }
    }

    #[test]
    fn test_ended_session_is_frozen() {
        let tracker = SessionTracker::new();
        let session_id = SessionId::new();
        tracker.start_session(session_id, "user-1");
        tracker.record_query(completion(session_id, false, None));
        tracker.end_session(session_id);

        // Further writes are ignored; reads still work
        tracker.record_query(completion(session_id, true, Some(1.0)));
        tracker.record_node_execution(session_id, "evaluation", Duration::from_secs(1));

        let metrics = tracker.get_session(session_id).unwrap();
        assert_eq!(metrics.query_count, 1);
        assert_eq!(metrics.escalation_count, 0);
        assert!(metrics.node_times.is_empty());
    }

    #[test]
    fn test_node_time_accumulates() {
        let tracker = SessionTracker::new();
        let session_id = SessionId::new();
        tracker.start_session(session_id, "user-1");

        tracker.record_node_execution(session_id, "ai_response", Duration::from_millis(100));
        tracker.record_node_execution(session_id, "ai_response", Duration::from_millis(50));

        let metrics = tracker.get_session(session_id).unwrap();
        assert_eq!(
            metrics.node_times.get("ai_response"),
            Some(&Duration::from_millis(150))
        );
    }

    #[test]
    fn test_unknown_session_reads_are_absent() {
        let tracker = SessionTracker::new();
        assert!(tracker.get_session(SessionId::new()).is_none());
        assert!(tracker.end_session(SessionId::new()).is_none());
        // Writes against unknown sessions are dropped, not panics
        tracker.record_query(completion(SessionId::new(), false, None));
    }

    #[tokio::test]
    async fn test_flush_ended_sessions() {
        use crate::store::{MemoryStore, SessionStore};

        let tracker = SessionTracker::new();
        let ended = SessionId::new();
        let open = SessionId::new();
        tracker.start_session(ended, "user-a");
        tracker.start_session(open, "user-b");
        tracker.record_query(completion(ended, false, None));
        tracker.end_session(ended);

        let store = MemoryStore::new();
        let flushed = tracker.flush_ended(&store).await.unwrap();
        assert_eq!(flushed, 1);
        assert!(SessionStore::get(&store, ended).await.unwrap().is_some());
        assert!(SessionStore::get(&store, open).await.unwrap().is_none());
    }

    #[test]
    fn test_system_metrics_aggregate() {
        let tracker = SessionTracker::new();
        let a = SessionId::new();
        let b = SessionId::new();
        tracker.start_session(a, "user-a");
        tracker.start_session(b, "user-b");

        tracker.record_query(completion(a, true, Some(1.0)));
        tracker.record_query(completion(b, false, Some(0.0)));
        tracker.record_query(completion(b, false, Some(0.0)));
        tracker.record_node_execution(a, "evaluation", Duration::from_secs(1));
        tracker.record_node_execution(b, "evaluation", Duration::from_secs(2));
        tracker.end_session(a);

        let system = tracker.get_system_metrics();
        assert_eq!(system.total_sessions, 2);
        assert_eq!(system.active_sessions, 1);
        assert_eq!(system.total_queries, 3);
        assert_eq!(system.total_escalations, 1);
        assert!((system.escalation_rate - 1.0 / 3.0).abs() < 1e-9);
        // Weighted mean: (1.0 * 1 + 0.0 * 2) / 3
        assert!((system.mean_satisfaction - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(system.usage.tokens, 300);
        assert_eq!(
            system.node_times.get("evaluation"),
            Some(&Duration::from_secs(3))
        );
    }
}
