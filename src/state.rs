//! Per-query working record threaded through the pipeline
//!
//! The record is an owned value: each node takes ownership and returns the
//! updated record, so no two stages ever alias the same query state.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{AgentId, ConversationId, CustomerTier, Priority, QueryId, SessionId, Specialization, Usage};

/// Pipeline stages of the escalation workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Init,
    AutomationCheck,
    AiResponse,
    Evaluation,
    Respond,
    Escalate,
    HumanAssignment,
    HumanResponse,
    Feedback,
    QualityMetrics,
    Complete,
    Failed,
}

impl WorkflowStage {
    /// Node name as it appears in execution paths and timing maps
    pub fn node_name(&self) -> &'static str {
        match self {
            WorkflowStage::Init => "init",
            WorkflowStage::AutomationCheck => "automation_check",
            WorkflowStage::AiResponse => "ai_response",
            WorkflowStage::Evaluation => "evaluation",
            WorkflowStage::Respond => "respond",
            WorkflowStage::Escalate => "escalate",
            WorkflowStage::HumanAssignment => "human_assignment",
            WorkflowStage::HumanResponse => "human_response",
            WorkflowStage::Feedback => "feedback",
            WorkflowStage::QualityMetrics => "quality_metrics",
            WorkflowStage::Complete => "complete",
            WorkflowStage::Failed => "failed",
        }
    }
}

/// Customer context carried with the query, consumed by scoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub tier: CustomerTier,
    pub priority: Priority,
    pub language: String,
    /// Worker who handled this customer before, for continuity bonuses
    pub previous_agent: Option<AgentId>,
}

/// Output of the automation check node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentResult {
    /// Automation fully handled the query; no AI or human needed
    pub handled: bool,
    /// Canned answer when handled
    pub answer: Option<String>,
    /// Automation layer demands immediate escalation, overriding routing
    pub force_escalation: bool,
    /// Detected topic, used as the required specialization on escalation
    pub category: Option<Specialization>,
    pub confidence: f64,
}

/// Output of the AI response node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiAnswer {
    pub text: String,
    pub usage: Usage,
}

/// Output of the evaluation node; read-only once produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Answer quality in [0, 1]; low quality pushes toward escalation
    pub quality_score: f64,
    /// Query complexity in [0, 1]
    pub complexity: f64,
    pub reasons: Vec<String>,
}

impl EvaluationResult {
    /// Signal compared against the configured escalation threshold
    pub fn escalation_signal(&self) -> f64 {
        (1.0 - self.quality_score).max(self.complexity)
    }
}

/// Escalation decision data; read-only once produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationData {
    pub reason: String,
    pub required_specialization: Option<Specialization>,
    pub urgency_multiplier: f64,
}

/// A committed worker assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub agent_id: AgentId,
    pub conversation_id: ConversationId,
    /// Commit attempts spent, including re-scores after lost races
    pub attempts: u32,
}

/// Output of the human response node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanResponse {
    pub agent_id: AgentId,
    pub text: String,
}

/// Output of the feedback node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    /// Customer satisfaction in [0, 1]
    pub satisfaction: f64,
    pub comment: Option<String>,
}

/// Output of the quality metrics node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub overall: f64,
    pub details: HashMap<String, f64>,
}

/// The per-query working record
///
/// Owned exclusively by the orchestrator instance processing it; never
/// shared across queries. Stage results start empty and are filled exactly
/// once as the corresponding node completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryState {
    pub query_id: QueryId,
    pub user_id: String,
    pub session_id: SessionId,
    pub query_text: String,
    pub customer: CustomerProfile,

    // Stage result slots, filled as the pipeline advances
    pub assessment: Option<AssessmentResult>,
    pub ai_answer: Option<AiAnswer>,
    pub evaluation: Option<EvaluationResult>,
    pub escalation: Option<EscalationData>,
    pub assignment: Option<Assignment>,
    pub human_response: Option<HumanResponse>,
    pub feedback: Option<Feedback>,
    pub quality: Option<QualityMetrics>,

    // Routing fields
    pub stage: WorkflowStage,
    pub next_action: Option<String>,
    pub workflow_complete: bool,

    // Accumulating counters; monotonically non-decreasing
    pub node_execution_times: Vec<NodeTiming>,
    pub execution_path: Vec<String>,
    pub usage: Usage,

    pub error: Option<String>,
}

/// Time spent in one node invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTiming {
    pub node: String,
    pub elapsed: Duration,
}

impl QueryState {
    pub fn new(
        user_id: impl Into<String>,
        session_id: SessionId,
        query_text: impl Into<String>,
        customer: CustomerProfile,
    ) -> Self {
        Self {
            query_id: QueryId::new(),
            user_id: user_id.into(),
            session_id,
            query_text: query_text.into(),
            customer,
            assessment: None,
            ai_answer: None,
            evaluation: None,
            escalation: None,
            assignment: None,
            human_response: None,
            feedback: None,
            quality: None,
            stage: WorkflowStage::Init,
            next_action: None,
            workflow_complete: false,
            node_execution_times: Vec::new(),
            execution_path: Vec::new(),
            usage: Usage::default(),
            error: None,
        }
    }

    /// Append a node timing entry and extend the execution path
    pub fn record_node(&mut self, node: &str, elapsed: Duration) {
        self.node_execution_times.push(NodeTiming {
            node: node.to_string(),
            elapsed,
        });
        self.execution_path.push(node.to_string());
    }

    /// Total time spent across all recorded nodes
    pub fn total_node_time(&self) -> Duration {
        self.node_execution_times
            .iter()
            .map(|t| t.elapsed)
            .sum()
    }
}

/// Final outcome of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub success: bool,
    pub final_state: QueryState,
    pub execution_path: Vec<String>,
    pub total_duration: Duration,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> QueryState {
        QueryState::new(
            "user-1",
            SessionId::new(),
            "my invoice is wrong",
            CustomerProfile {
                language: "en".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_new_state_is_empty() {
        let state = test_state();
        assert_eq!(state.stage, WorkflowStage::Init);
        assert!(!state.workflow_complete);
        assert!(state.assessment.is_none());
        assert!(state.execution_path.is_empty());
    }

    #[test]
    fn test_record_node_appends() {
        let mut state = test_state();
        state.record_node("automation_check", Duration::from_millis(5));
        state.record_node("ai_response", Duration::from_millis(120));

        assert_eq!(state.execution_path, vec!["automation_check", "ai_response"]);
        assert_eq!(state.node_execution_times.len(), 2);
        assert_eq!(state.total_node_time(), Duration::from_millis(125));
    }

    #[test]
    fn test_escalation_signal() {
        let eval = EvaluationResult {
            quality_score: 0.3,
            complexity: 0.5,
            reasons: vec![],
        };
        // 1 - 0.3 = 0.7 dominates complexity 0.5
        assert!((eval.escalation_signal() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_state_serializes() {
        let mut state = test_state();
        state.record_node("automation_check", Duration::from_millis(5));
        let json = serde_json::to_string(&state).unwrap();
        let back: QueryState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.query_id, state.query_id);
        assert_eq!(back.execution_path, state.execution_path);
    }
}
