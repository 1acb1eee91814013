//! Multi-criteria worker scoring
//!
//! The engine is a pure computation: it ranks a roster snapshot against a
//! dispatch context and never mutates worker state. Reserving the chosen
//! worker is the directory's job, see [`crate::dispatch`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::directory::AgentSnapshot;
use crate::error::SwitchboardError;
use crate::types::{AgentId, AgentStatus, CustomerTier, Priority, Specialization};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

/// History samples at which confidence stops growing
const FULL_CONFIDENCE_SAMPLES: f64 = 20.0;

/// Category weights for the composite score
///
/// Construction validates that the weights sum to 1.0 within 1e-3; an
/// invalid set is a configuration error and is never silently normalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub skill: f64,
    pub availability: f64,
    pub performance: f64,
    pub wellbeing: f64,
    pub customer: f64,
    pub balance: f64,
}

impl ScoringWeights {
    pub fn new(
        skill: f64,
        availability: f64,
        performance: f64,
        wellbeing: f64,
        customer: f64,
        balance: f64,
    ) -> Result<Self, SwitchboardError> {
        let weights = Self {
            skill,
            availability,
            performance,
            wellbeing,
            customer,
            balance,
        };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<(), SwitchboardError> {
        let sum = self.skill
            + self.availability
            + self.performance
            + self.wellbeing
            + self.customer
            + self.balance;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(SwitchboardError::Configuration(format!(
                "scoring weights sum to {sum:.4}, expected 1.0"
            )));
        }
        Ok(())
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            skill: 0.25,
            availability: 0.20,
            performance: 0.20,
            wellbeing: 0.15,
            customer: 0.10,
            balance: 0.10,
        }
    }
}

/// Context of one dispatch call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoringContext {
    pub required_specialization: Option<Specialization>,
    pub priority: Priority,
    /// Query complexity in [0, 1]
    pub complexity: f64,
    pub tier: CustomerTier,
    pub language: String,
    /// Worker who handled this customer before, for continuity bonuses
    pub previous_agent: Option<AgentId>,
    /// Workers that must not be considered, e.g. after a lost commit race
    pub excluded: HashSet<AgentId>,
    /// Seniority floor, used by senior escalation
    pub min_seniority: Option<u8>,
    /// Scales the composite score; 1.0 for normal dispatch
    pub urgency_multiplier: f64,
}

impl ScoringContext {
    pub fn new() -> Self {
        Self {
            urgency_multiplier: 1.0,
            ..Default::default()
        }
    }
}

/// The six category scores, each in [0, 1]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CategoryScores {
    pub skill_match: f64,
    pub availability: f64,
    pub performance_history: f64,
    pub wellbeing_factor: f64,
    pub customer_factor: f64,
    pub workload_balance: f64,
}

/// Score card for one candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentScore {
    pub agent_id: AgentId,
    pub categories: CategoryScores,
    /// Per-category weight * score contributions
    pub weighted: CategoryScores,
    pub composite: f64,
    /// Shrinks when the candidate's performance history is sparse
    pub confidence: f64,
    /// This candidate's composite minus the top composite; 0 for the winner
    pub relative_score: f64,
    pub rank: u32,
    pub blocking_factors: Vec<String>,
}

/// Filter relaxations applied when no candidate qualifies outright
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    RelaxedSpecialization,
    AnyAvailable,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::RelaxedSpecialization => "relaxed_specialization",
            FallbackStrategy::AnyAvailable => "any_available",
        }
    }
}

/// Ranked output of one scoring call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringResult {
    /// All surviving candidates, best first
    pub scores: Vec<AgentScore>,
    /// Top-ranked worker, `None` when the fallback ladder is exhausted and
    /// the caller must queue the request
    pub best: Option<AgentId>,
    pub fallbacks_applied: Vec<FallbackStrategy>,
}

/// Pure scoring engine over roster snapshots
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    weights: ScoringWeights,
}

impl ScoringEngine {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> ScoringWeights {
        self.weights
    }

    /// Rank candidates for a dispatch context
    ///
    /// Hard filters run first; when they leave nothing, the fallback
    /// ladder relaxes the specialization requirement, then falls back to
    /// any available worker ranked by spare capacity alone. Each
    /// relaxation is recorded in the result.
    pub fn score(&self, context: &ScoringContext, candidates: &[AgentSnapshot]) -> ScoringResult {
        let mut fallbacks = Vec::new();

        let mut pool = self.hard_filter(context, candidates, true);
        if pool.is_empty() && context.required_specialization.is_some() {
            fallbacks.push(FallbackStrategy::RelaxedSpecialization);
            pool = self.hard_filter(context, candidates, false);
        }

        if pool.is_empty() {
            // Last resort before queueing: any available worker, ranked by
            // spare load alone, soft scores reported but ignored
            fallbacks.push(FallbackStrategy::AnyAvailable);
            let mut pool: Vec<&AgentSnapshot> = candidates
                .iter()
                .filter(|c| c.status == AgentStatus::Available)
                .collect();
            pool.sort_by(|a, b| {
                a.current_load
                    .cmp(&b.current_load)
                    .then(a.agent_id.cmp(&b.agent_id))
            });
            let scores = self.score_pool(context, &pool, candidates);
            finalize(scores, fallbacks)
        } else {
            let mut scores = self.score_pool(context, &pool, candidates);
            scores.sort_by(|a, b| {
                b.composite
                    .total_cmp(&a.composite)
                    .then_with(|| {
                        let load_a = load_of(&pool, a.agent_id);
                        let load_b = load_of(&pool, b.agent_id);
                        load_a.cmp(&load_b)
                    })
                    .then(a.agent_id.cmp(&b.agent_id))
            });
            finalize(scores, fallbacks)
        }
    }

    fn hard_filter<'a>(
        &self,
        context: &ScoringContext,
        candidates: &'a [AgentSnapshot],
        require_specialization: bool,
    ) -> Vec<&'a AgentSnapshot> {
        candidates
            .iter()
            .filter(|c| {
                if context.excluded.contains(&c.agent_id) {
                    return false;
                }
                if c.status != AgentStatus::Available {
                    return false;
                }
                if let Some(min) = context.min_seniority {
                    if c.seniority < min {
                        return false;
                    }
                }
                if require_specialization {
                    if let Some(spec) = &context.required_specialization {
                        if !c.has_specialization(spec) {
                            return false;
                        }
                    }
                }
                true
            })
            .collect()
    }

    fn score_pool(
        &self,
        context: &ScoringContext,
        pool: &[&AgentSnapshot],
        roster: &[AgentSnapshot],
    ) -> Vec<AgentScore> {
        let team_avg_idle = if roster.is_empty() {
            0.0
        } else {
            roster.iter().map(|c| c.idle_capacity() as f64).sum::<f64>() / roster.len() as f64
        };

        // Response-time percentile is computed within the candidate pool
        let mut response_times: Vec<f64> = pool
            .iter()
            .filter(|c| c.history_samples > 0)
            .map(|c| c.avg_response_secs)
            .collect();
        response_times.sort_by(|a, b| a.total_cmp(b));

        pool.iter()
            .map(|candidate| self.score_candidate(context, candidate, team_avg_idle, &response_times))
            .collect()
    }

    fn score_candidate(
        &self,
        context: &ScoringContext,
        candidate: &AgentSnapshot,
        team_avg_idle: f64,
        response_times: &[f64],
    ) -> AgentScore {
        let categories = CategoryScores {
            skill_match: skill_match(context, candidate),
            availability: availability(candidate),
            performance_history: performance_history(candidate, response_times),
            wellbeing_factor: (1.0 - candidate.stress_level).clamp(0.0, 1.0),
            customer_factor: customer_factor(context, candidate),
            workload_balance: workload_balance(candidate, team_avg_idle),
        };

        let weighted = CategoryScores {
            skill_match: self.weights.skill * categories.skill_match,
            availability: self.weights.availability * categories.availability,
            performance_history: self.weights.performance * categories.performance_history,
            wellbeing_factor: self.weights.wellbeing * categories.wellbeing_factor,
            customer_factor: self.weights.customer * categories.customer_factor,
            workload_balance: self.weights.balance * categories.workload_balance,
        };

        let urgency = if context.urgency_multiplier > 0.0 {
            context.urgency_multiplier
        } else {
            1.0
        };
        let composite = ((weighted.skill_match
            + weighted.availability
            + weighted.performance_history
            + weighted.wellbeing_factor
            + weighted.customer_factor
            + weighted.workload_balance)
            * urgency)
            .clamp(0.0, 1.0);

        let history_ratio = (candidate.history_samples as f64 / FULL_CONFIDENCE_SAMPLES).min(1.0);
        let confidence = 0.4 + 0.6 * history_ratio;

        let mut blocking_factors = Vec::new();
        if candidate.idle_capacity() == 0 {
            blocking_factors.push("at_capacity".to_string());
        }
        if candidate.stress_level >= 0.8 {
            blocking_factors.push("high_stress".to_string());
        }
        if candidate.history_samples == 0 {
            blocking_factors.push("no_history".to_string());
        }

        debug!(
            agent_id = %candidate.agent_id,
            composite = composite,
            confidence = confidence,
            "Scored candidate"
        );

        AgentScore {
            agent_id: candidate.agent_id,
            categories,
            weighted,
            composite,
            confidence,
            relative_score: 0.0,
            rank: 0,
            blocking_factors,
        }
    }
}

fn load_of(pool: &[&AgentSnapshot], id: AgentId) -> u32 {
    pool.iter()
        .find(|c| c.agent_id == id)
        .map(|c| c.current_load)
        .unwrap_or(0)
}

fn finalize(mut scores: Vec<AgentScore>, fallbacks: Vec<FallbackStrategy>) -> ScoringResult {
    let top = scores.first().map(|s| s.composite).unwrap_or(0.0);
    for (i, score) in scores.iter_mut().enumerate() {
        score.rank = i as u32 + 1;
        score.relative_score = score.composite - top;
    }
    ScoringResult {
        best: scores.first().map(|s| s.agent_id),
        scores,
        fallbacks_applied: fallbacks,
    }
}

/// Specialization and complexity fit
fn skill_match(context: &ScoringContext, candidate: &AgentSnapshot) -> f64 {
    let seniority = candidate.seniority.min(5) as f64 / 5.0;
    // How well seniority covers the query's complexity
    let depth = 1.0 - (context.complexity - seniority).clamp(0.0, 1.0);

    let score = match &context.required_specialization {
        Some(spec) if candidate.has_specialization(spec) => 0.6 + 0.4 * depth,
        // Only reachable when the specialization filter was relaxed
        Some(_) => 0.2 * depth,
        None => 0.4 + 0.6 * depth,
    };
    score.clamp(0.0, 1.0)
}

/// Spare capacity as a fraction; zero at capacity
fn availability(candidate: &AgentSnapshot) -> f64 {
    if candidate.capacity == 0 || candidate.current_load >= candidate.capacity {
        return 0.0;
    }
    1.0 - candidate.current_load as f64 / candidate.capacity as f64
}

/// Historical satisfaction blended with the response-time percentile
/// within the candidate pool; neutral 0.5 without history
fn performance_history(candidate: &AgentSnapshot, response_times: &[f64]) -> f64 {
    let Some(satisfaction) = candidate.satisfaction else {
        return 0.5;
    };

    let percentile = if response_times.len() <= 1 {
        0.5
    } else {
        // Fraction of the pool that is slower than this candidate
        let slower = response_times
            .iter()
            .filter(|rt| **rt > candidate.avg_response_secs)
            .count();
        slower as f64 / (response_times.len() - 1) as f64
    };

    (0.7 * satisfaction.clamp(0.0, 1.0) + 0.3 * percentile).clamp(0.0, 1.0)
}

/// Tier, language, and continuity bonuses minus the priority/complexity
/// mismatch penalty
fn customer_factor(context: &ScoringContext, candidate: &AgentSnapshot) -> f64 {
    let mut score = 0.5;

    if candidate.supported_tiers.contains(&context.tier) {
        score += 0.2;
    }
    if !context.language.is_empty()
        && candidate
            .languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(&context.language))
    {
        score += 0.15;
    }
    if context.previous_agent == Some(candidate.agent_id) {
        score += 0.15;
    }

    let seniority = candidate.seniority.min(5) as f64 / 5.0;
    let demand = context.priority.rank().max(context.complexity);
    score -= 0.3 * (demand - seniority).clamp(0.0, 1.0);

    score.clamp(0.0, 1.0)
}

/// Idle capacity relative to the team average; 0.5 at average, pulling
/// assignments toward under-utilized workers
fn workload_balance(candidate: &AgentSnapshot, team_avg_idle: f64) -> f64 {
    if team_avg_idle <= 0.0 {
        return 0.0;
    }
    (candidate.idle_capacity() as f64 / (2.0 * team_avg_idle)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentStatus;

    fn snapshot(load: u32, capacity: u32, specs: &[&str]) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: AgentId::new(),
            specializations: specs.iter().map(|s| Specialization::new(*s)).collect(),
            seniority: 3,
            capacity,
            languages: vec!["en".to_string()],
            supported_tiers: vec![CustomerTier::Standard],
            status: AgentStatus::Available,
            current_load: load,
            stress_level: 0.2,
            satisfaction: Some(0.8),
            history_samples: 10,
            avg_response_secs: 200.0,
        }
    }

    fn billing_context() -> ScoringContext {
        ScoringContext {
            required_specialization: Some("billing".into()),
            language: "en".to_string(),
            complexity: 0.4,
            ..ScoringContext::new()
        }
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        assert!(ScoringWeights::new(0.25, 0.20, 0.20, 0.15, 0.10, 0.10).is_ok());
        let invalid = ScoringWeights::new(0.5, 0.2, 0.2, 0.15, 0.1, 0.1);
        assert!(matches!(invalid, Err(SwitchboardError::Configuration(_))));
    }

    #[test]
    fn test_weights_tolerance() {
        // Off by less than 1e-3 is accepted
        assert!(ScoringWeights::new(0.2505, 0.20, 0.20, 0.15, 0.10, 0.10).is_ok());
        assert!(ScoringWeights::new(0.253, 0.20, 0.20, 0.15, 0.10, 0.10).is_err());
    }

    #[test]
    fn test_all_scores_in_unit_interval() {
        let engine = ScoringEngine::default();
        let mut stressed = snapshot(2, 3, &["billing"]);
        stressed.stress_level = 1.0;
        stressed.satisfaction = Some(1.0);
        let candidates = vec![snapshot(0, 5, &["billing"]), stressed, snapshot(4, 5, &[])];

        let result = engine.score(&billing_context(), &candidates);
        for score in &result.scores {
            let c = &score.categories;
            for value in [
                c.skill_match,
                c.availability,
                c.performance_history,
                c.wellbeing_factor,
                c.customer_factor,
                c.workload_balance,
                score.composite,
                score.confidence,
            ] {
                assert!((0.0..=1.0).contains(&value), "score {value} out of range");
            }
        }
    }

    #[test]
    fn test_idle_worker_outranks_loaded_worker() {
        // Reference scenario: equal factors except load 0/5 vs 4/5
        let engine = ScoringEngine::new(
            ScoringWeights::new(0.25, 0.20, 0.20, 0.15, 0.10, 0.10).unwrap(),
        );
        let idle = snapshot(0, 5, &["billing"]);
        let loaded = snapshot(4, 5, &["billing"]);
        let candidates = vec![loaded.clone(), idle.clone()];

        let result = engine.score(&billing_context(), &candidates);
        assert_eq!(result.best, Some(idle.agent_id));
        assert_eq!(result.scores[0].agent_id, idle.agent_id);
        assert_eq!(result.scores[1].agent_id, loaded.agent_id);
        assert!(result.scores[0].composite > result.scores[1].composite);
        assert!(result.fallbacks_applied.is_empty());
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let engine = ScoringEngine::default();
        let candidates = vec![
            snapshot(1, 5, &["billing"]),
            snapshot(1, 5, &["billing"]),
            snapshot(2, 4, &["billing"]),
            snapshot(0, 3, &["billing"]),
        ];

        let first = engine.score(&billing_context(), &candidates);
        let second = engine.score(&billing_context(), &candidates);
        let order_a: Vec<AgentId> = first.scores.iter().map(|s| s.agent_id).collect();
        let order_b: Vec<AgentId> = second.scores.iter().map(|s| s.agent_id).collect();
        assert_eq!(order_a, order_b);
    }

    #[test]
    fn test_tie_broken_by_load_then_id() {
        let engine = ScoringEngine::default();
        // Identical profiles except load; equal composite is impossible
        // here because availability differs, so build two exact twins
        let mut a = snapshot(1, 5, &["billing"]);
        let mut b = snapshot(1, 5, &["billing"]);
        if b.agent_id < a.agent_id {
            std::mem::swap(&mut a, &mut b);
        }

        let result = engine.score(&billing_context(), &[b.clone(), a.clone()]);
        // Equal scores and loads: lower id wins
        assert_eq!(result.scores[0].agent_id, a.agent_id);
    }

    #[test]
    fn test_relaxed_specialization_fallback() {
        let engine = ScoringEngine::default();
        let generalist = snapshot(1, 5, &["shipping"]);
        let candidates = vec![generalist.clone()];

        let result = engine.score(&billing_context(), &candidates);
        assert_eq!(
            result.fallbacks_applied,
            vec![FallbackStrategy::RelaxedSpecialization]
        );
        assert_eq!(result.best, Some(generalist.agent_id));
    }

    #[test]
    fn test_any_available_fallback_ranks_by_load() {
        let engine = ScoringEngine::default();
        let busy_low = snapshot(1, 5, &["shipping"]);
        let busy_high = snapshot(3, 5, &["shipping"]);
        let mut context = billing_context();
        // Exclude nobody, but demand an impossible seniority so both the
        // strict and relaxed passes come up empty
        context.min_seniority = Some(5);

        let result = engine.score(&context, &[busy_high.clone(), busy_low.clone()]);
        assert_eq!(
            result.fallbacks_applied,
            vec![
                FallbackStrategy::RelaxedSpecialization,
                FallbackStrategy::AnyAvailable
            ]
        );
        assert_eq!(result.best, Some(busy_low.agent_id));
    }

    #[test]
    fn test_no_candidates_returns_no_best() {
        let engine = ScoringEngine::default();
        let mut offline = snapshot(0, 5, &["billing"]);
        offline.status = AgentStatus::Offline;

        let result = engine.score(&billing_context(), &[offline]);
        assert!(result.best.is_none());
        assert!(result.scores.is_empty());
        assert_eq!(
            result.fallbacks_applied,
            vec![
                FallbackStrategy::RelaxedSpecialization,
                FallbackStrategy::AnyAvailable
            ]
        );
    }

    #[test]
    fn test_excluded_agents_are_filtered() {
        let engine = ScoringEngine::default();
        let a = snapshot(0, 5, &["billing"]);
        let b = snapshot(2, 5, &["billing"]);
        let mut context = billing_context();
        context.excluded.insert(a.agent_id);

        let result = engine.score(&context, &[a.clone(), b.clone()]);
        assert_eq!(result.best, Some(b.agent_id));
        assert!(result.scores.iter().all(|s| s.agent_id != a.agent_id));
    }

    #[test]
    fn test_continuity_bonus() {
        let engine = ScoringEngine::default();
        let returning = snapshot(1, 5, &["billing"]);
        let other = snapshot(1, 5, &["billing"]);
        let mut context = billing_context();
        context.previous_agent = Some(returning.agent_id);

        let result = engine.score(&context, &[other, returning.clone()]);
        assert_eq!(result.best, Some(returning.agent_id));
    }

    #[test]
    fn test_confidence_shrinks_with_sparse_history() {
        let engine = ScoringEngine::default();
        let mut green = snapshot(0, 5, &["billing"]);
        green.satisfaction = None;
        green.history_samples = 0;
        let veteran = snapshot(0, 5, &["billing"]);

        let result = engine.score(&billing_context(), &[green.clone(), veteran.clone()]);
        let green_score = result.scores.iter().find(|s| s.agent_id == green.agent_id).unwrap();
        let veteran_score = result
            .scores
            .iter()
            .find(|s| s.agent_id == veteran.agent_id)
            .unwrap();
        assert!(green_score.confidence < veteran_score.confidence);
        assert!(green_score.blocking_factors.contains(&"no_history".to_string()));
    }

    #[test]
    fn test_relative_score_and_rank() {
        let engine = ScoringEngine::default();
        let candidates = vec![snapshot(0, 5, &["billing"]), snapshot(3, 5, &["billing"])];

        let result = engine.score(&billing_context(), &candidates);
        assert_eq!(result.scores[0].rank, 1);
        assert_eq!(result.scores[0].relative_score, 0.0);
        assert_eq!(result.scores[1].rank, 2);
        assert!(result.scores[1].relative_score < 0.0);
    }

    #[test]
    fn test_scoring_does_not_mutate_candidates() {
        let engine = ScoringEngine::default();
        let candidates = vec![snapshot(1, 5, &["billing"])];
        let loads_before: Vec<u32> = candidates.iter().map(|c| c.current_load).collect();

        let _ = engine.score(&billing_context(), &candidates);
        let loads_after: Vec<u32> = candidates.iter().map(|c| c.current_load).collect();
        assert_eq!(loads_before, loads_after);
    }
}
