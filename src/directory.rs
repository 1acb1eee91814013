//! Worker directory - canonical registry of human workers
//!
//! The registry map is behind a `RwLock`, but every mutable field of a
//! worker lives behind that worker's own mutex. Assignment, completion,
//! and break transitions are read-modify-write under the per-agent lock,
//! so they are linearizable per agent without a roster-wide lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SwitchboardError;
use crate::events::{EventSender, SwitchboardEvent};
use crate::types::{AgentId, AgentStatus, ConversationId, CustomerTier, Specialization};

/// Long-lived identity of a human worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    pub specializations: Vec<Specialization>,
    /// Seniority level, 1 (junior) through 5 (principal)
    pub seniority: u8,
    /// Maximum simultaneous conversations
    pub capacity: u32,
    pub languages: Vec<String>,
    pub supported_tiers: Vec<CustomerTier>,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            id: AgentId::new(),
            name: String::new(),
            specializations: Vec::new(),
            seniority: 1,
            capacity: 3,
            languages: vec!["en".to_string()],
            supported_tiers: vec![CustomerTier::Standard],
        }
    }
}

/// Mutable per-worker state, guarded by the agent's own mutex
#[derive(Debug)]
struct AgentRuntime {
    status: AgentStatus,
    current_load: u32,
    break_until: Option<Instant>,
    /// Wellbeing indicator in [0, 1]; rises with assignments
    stress_level: f64,
    satisfaction_mean: f64,
    satisfaction_samples: u64,
    avg_response_secs: f64,
    active_conversations: HashSet<ConversationId>,
}

impl AgentRuntime {
    fn new() -> Self {
        Self {
            status: AgentStatus::Available,
            current_load: 0,
            break_until: None,
            stress_level: 0.0,
            satisfaction_mean: 0.0,
            satisfaction_samples: 0,
            avg_response_secs: 0.0,
            active_conversations: HashSet::new(),
        }
    }

    /// Lazily revert an expired break. Called on every read that cares
    /// about availability, so no background sweep is needed.
    fn reconcile_break(&mut self, now: Instant) {
        if self.status == AgentStatus::OnBreak {
            if let Some(until) = self.break_until {
                if now >= until {
                    self.break_until = None;
                    self.status = if self.current_load > 0 {
                        AgentStatus::Busy
                    } else {
                        AgentStatus::Available
                    };
                }
            }
        }
    }
}

/// A single human worker: immutable profile plus locked runtime state
pub struct HumanAgent {
    pub profile: AgentProfile,
    runtime: Mutex<AgentRuntime>,
}

impl HumanAgent {
    pub fn new(profile: AgentProfile) -> Self {
        Self {
            profile,
            runtime: Mutex::new(AgentRuntime::new()),
        }
    }

    pub fn id(&self) -> AgentId {
        self.profile.id
    }

    /// Current status as of `now`, with expired breaks reconciled
    pub fn status_at(&self, now: Instant) -> AgentStatus {
        let mut runtime = self.runtime.lock();
        runtime.reconcile_break(now);
        runtime.status
    }

    pub fn current_load(&self) -> u32 {
        self.runtime.lock().current_load
    }

    /// Atomic capacity re-check and load increment
    ///
    /// Scoring and commit are decoupled, so the roster may have changed
    /// since the candidate was ranked; this re-validation is what resolves
    /// that race.
    fn try_assign(&self, conversation_id: ConversationId, now: Instant) -> Result<(), SwitchboardError> {
        let mut runtime = self.runtime.lock();
        runtime.reconcile_break(now);

        let qualifies = matches!(runtime.status, AgentStatus::Available | AgentStatus::Busy);
        if !qualifies || runtime.current_load >= self.profile.capacity {
            return Err(SwitchboardError::AgentUnavailable(self.profile.id));
        }

        runtime.active_conversations.insert(conversation_id);
        runtime.current_load += 1;
        runtime.status = AgentStatus::Busy;
        runtime.stress_level = (runtime.stress_level + 0.1).min(1.0);
        Ok(())
    }

    fn complete(&self, conversation_id: ConversationId, now: Instant) -> Result<(), SwitchboardError> {
        let mut runtime = self.runtime.lock();
        runtime.reconcile_break(now);

        if !runtime.active_conversations.remove(&conversation_id) {
            return Err(SwitchboardError::NotFound(format!(
                "conversation {conversation_id} not held by agent {}",
                self.profile.id
            )));
        }

        runtime.current_load = runtime.current_load.saturating_sub(1);
        runtime.stress_level = (runtime.stress_level - 0.05).max(0.0);
        if runtime.current_load == 0 && runtime.status == AgentStatus::Busy {
            runtime.status = AgentStatus::Available;
        }
        Ok(())
    }

    fn set_break(&self, duration: Duration, now: Instant) -> Result<(), SwitchboardError> {
        let mut runtime = self.runtime.lock();
        runtime.reconcile_break(now);

        if runtime.status != AgentStatus::Available {
            return Err(SwitchboardError::Validation(format!(
                "agent {} is {} and cannot start a break",
                self.profile.id, runtime.status
            )));
        }
        runtime.status = AgentStatus::OnBreak;
        runtime.break_until = Some(now + duration);
        Ok(())
    }

    fn set_status(&self, status: AgentStatus) {
        let mut runtime = self.runtime.lock();
        runtime.break_until = None;
        // Keep the BUSY <=> load > 0 invariant when reactivating
        runtime.status = match status {
            AgentStatus::Available if runtime.current_load > 0 => AgentStatus::Busy,
            other => other,
        };
    }

    fn record_feedback(&self, satisfaction: f64, response_time: Duration) {
        let mut runtime = self.runtime.lock();
        runtime.satisfaction_samples += 1;
        let n = runtime.satisfaction_samples as f64;
        runtime.satisfaction_mean += (satisfaction - runtime.satisfaction_mean) / n;
        runtime.avg_response_secs += (response_time.as_secs_f64() - runtime.avg_response_secs) / n;
    }

    /// Point-in-time value copy for scoring; never holds any lock after
    /// returning
    pub fn snapshot(&self, now: Instant) -> AgentSnapshot {
        let mut runtime = self.runtime.lock();
        runtime.reconcile_break(now);

        AgentSnapshot {
            agent_id: self.profile.id,
            specializations: self.profile.specializations.clone(),
            seniority: self.profile.seniority,
            capacity: self.profile.capacity,
            languages: self.profile.languages.clone(),
            supported_tiers: self.profile.supported_tiers.clone(),
            status: runtime.status,
            current_load: runtime.current_load,
            stress_level: runtime.stress_level,
            satisfaction: (runtime.satisfaction_samples > 0).then_some(runtime.satisfaction_mean),
            history_samples: runtime.satisfaction_samples,
            avg_response_secs: runtime.avg_response_secs,
        }
    }

    #[cfg(test)]
    fn set_stress(&self, stress: f64) {
        self.runtime.lock().stress_level = stress.clamp(0.0, 1.0);
    }
}

/// Value snapshot of one worker, consumed by the scoring engine
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub specializations: Vec<Specialization>,
    pub seniority: u8,
    pub capacity: u32,
    pub languages: Vec<String>,
    pub supported_tiers: Vec<CustomerTier>,
    pub status: AgentStatus,
    pub current_load: u32,
    pub stress_level: f64,
    pub satisfaction: Option<f64>,
    pub history_samples: u64,
    pub avg_response_secs: f64,
}

impl AgentSnapshot {
    pub fn has_specialization(&self, spec: &Specialization) -> bool {
        self.specializations.contains(spec)
    }

    pub fn idle_capacity(&self) -> u32 {
        self.capacity.saturating_sub(self.current_load)
    }
}

/// Handle to a worker for external interaction
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<HumanAgent>,
}

impl AgentHandle {
    pub fn new(agent: HumanAgent) -> Self {
        Self {
            inner: Arc::new(agent),
        }
    }
}

impl std::ops::Deref for AgentHandle {
    type Target = HumanAgent;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// A reassignment executed by [`WorkerDirectory::rebalance`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reassignment {
    pub conversation_id: ConversationId,
    pub from: AgentId,
    pub to: AgentId,
}

/// Registry of human workers and the commit layer of dispatch
pub struct WorkerDirectory {
    agents: RwLock<HashMap<AgentId, AgentHandle>>,
    event_tx: EventSender,
}

impl WorkerDirectory {
    pub fn new(event_tx: EventSender) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Add a worker to the roster
    pub fn register(&self, profile: AgentProfile) -> AgentHandle {
        let agent_id = profile.id;
        let handle = AgentHandle::new(HumanAgent::new(profile));
        self.agents.write().insert(agent_id, handle.clone());
        info!(agent_id = %agent_id, "Registered worker");
        handle
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentHandle> {
        self.agents.read().get(id).cloned()
    }

    pub fn remove(&self, id: &AgentId) -> bool {
        let removed = self.agents.write().remove(id).is_some();
        if removed {
            info!(agent_id = %id, "Removed worker");
        }
        removed
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Status of one worker as of `now`; `None` for unknown ids
    pub fn status_of(&self, id: &AgentId, now: Instant) -> Option<AgentStatus> {
        self.get(id).map(|agent| agent.status_at(now))
    }

    /// Value snapshot of the whole roster for scoring
    ///
    /// Handles are cloned under the registry read lock, then each agent is
    /// locked individually, so the roster lock is never held across
    /// per-agent work.
    pub fn snapshot(&self, now: Instant) -> Vec<AgentSnapshot> {
        let handles: Vec<AgentHandle> = self.agents.read().values().cloned().collect();
        handles.iter().map(|agent| agent.snapshot(now)).collect()
    }

    /// Reserve a worker for a conversation
    ///
    /// Re-validates capacity and status at commit time and fails with
    /// [`SwitchboardError::AgentUnavailable`] when the worker no longer
    /// qualifies.
    pub fn assign(&self, agent_id: AgentId, conversation_id: ConversationId) -> Result<(), SwitchboardError> {
        let agent = self
            .get(&agent_id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("agent {agent_id}")))?;

        match agent.try_assign(conversation_id, Instant::now()) {
            Ok(()) => {
                debug!(agent_id = %agent_id, conversation_id = %conversation_id, "Assigned conversation");
                let _ = self.event_tx.send(SwitchboardEvent::AgentAssigned {
                    agent_id,
                    conversation_id,
                });
                Ok(())
            }
            Err(e) => {
                debug!(agent_id = %agent_id, error = %e, "Assignment rejected at commit");
                Err(e)
            }
        }
    }

    /// Release a conversation from a worker
    pub fn complete(&self, agent_id: AgentId, conversation_id: ConversationId) -> Result<(), SwitchboardError> {
        let agent = self
            .get(&agent_id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("agent {agent_id}")))?;

        agent.complete(conversation_id, Instant::now())?;
        let _ = self.event_tx.send(SwitchboardEvent::AgentReleased {
            agent_id,
            conversation_id,
        });
        Ok(())
    }

    /// Put an available worker on a break that expires after `duration`
    pub fn set_break(&self, agent_id: AgentId, duration: Duration) -> Result<(), SwitchboardError> {
        let agent = self
            .get(&agent_id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("agent {agent_id}")))?;

        agent.set_break(duration, Instant::now())?;
        info!(agent_id = %agent_id, seconds = duration.as_secs(), "Worker on break");
        let _ = self.event_tx.send(SwitchboardEvent::AgentOnBreak { agent_id, duration });
        Ok(())
    }

    /// Force a worker's status, e.g. OFFLINE at end of shift
    pub fn set_status(&self, agent_id: AgentId, status: AgentStatus) -> Result<(), SwitchboardError> {
        let agent = self
            .get(&agent_id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("agent {agent_id}")))?;
        agent.set_status(status);
        Ok(())
    }

    /// Fold customer feedback into a worker's performance history
    pub fn record_feedback(
        &self,
        agent_id: AgentId,
        satisfaction: f64,
        response_time: Duration,
    ) -> Result<(), SwitchboardError> {
        let agent = self
            .get(&agent_id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("agent {agent_id}")))?;
        agent.record_feedback(satisfaction, response_time);
        Ok(())
    }

    /// Move conversations from overloaded workers to idle ones
    ///
    /// A worker donates while its load ratio exceeds `load_threshold` and
    /// an idle receiver with spare capacity exists. Every move removes the
    /// conversation from the donor and adds it to the receiver, so the
    /// total active-conversation count is preserved.
    pub fn rebalance(&self, load_threshold: f64) -> Vec<Reassignment> {
        let now = Instant::now();
        let mut moves = Vec::new();
        let max_moves = self.total_active_conversations();

        for _ in 0..max_moves {
            let snapshots = self.snapshot(now);

            let donor = snapshots
                .iter()
                .filter(|s| {
                    s.capacity > 0
                        && s.current_load > 1
                        && (s.current_load as f64 / s.capacity as f64) > load_threshold
                })
                .max_by(|a, b| {
                    let ra = a.current_load as f64 / a.capacity as f64;
                    let rb = b.current_load as f64 / b.capacity as f64;
                    ra.total_cmp(&rb).then(a.agent_id.cmp(&b.agent_id))
                });

            let receiver = snapshots
                .iter()
                .filter(|s| {
                    matches!(s.status, AgentStatus::Available | AgentStatus::Busy)
                        && s.idle_capacity() > 0
                        && s.capacity > 0
                        && (s.current_load as f64 / s.capacity as f64) < load_threshold
                })
                .min_by(|a, b| {
                    let ra = a.current_load as f64 / a.capacity as f64;
                    let rb = b.current_load as f64 / b.capacity as f64;
                    ra.total_cmp(&rb)
                        .then(b.idle_capacity().cmp(&a.idle_capacity()))
                        .then(a.agent_id.cmp(&b.agent_id))
                });

            let (Some(donor), Some(receiver)) = (donor, receiver) else {
                break;
            };
            if donor.agent_id == receiver.agent_id {
                break;
            }

            match self.move_conversation(donor.agent_id, receiver.agent_id, now) {
                Some(reassignment) => {
                    info!(
                        conversation_id = %reassignment.conversation_id,
                        from = %reassignment.from,
                        to = %reassignment.to,
                        "Rebalanced conversation"
                    );
                    moves.push(reassignment);
                }
                None => break,
            }
        }

        moves
    }

    /// Move one conversation between two workers under both agent locks,
    /// acquired in id order to avoid deadlock
    fn move_conversation(&self, from: AgentId, to: AgentId, now: Instant) -> Option<Reassignment> {
        let donor = self.get(&from)?;
        let receiver = self.get(&to)?;

        let (_first, _second, mut donor_rt, mut receiver_rt) = if from < to {
            let d = donor.runtime.lock();
            let r = receiver.runtime.lock();
            (from, to, d, r)
        } else {
            let r = receiver.runtime.lock();
            let d = donor.runtime.lock();
            (to, from, d, r)
        };

        receiver_rt.reconcile_break(now);
        let receiver_open = matches!(
            receiver_rt.status,
            AgentStatus::Available | AgentStatus::Busy
        );
        if !receiver_open
            || receiver_rt.current_load >= receiver.profile.capacity
            || donor_rt.current_load == 0
        {
            return None;
        }

        let conversation_id = *donor_rt.active_conversations.iter().next()?;
        donor_rt.active_conversations.remove(&conversation_id);
        donor_rt.current_load -= 1;
        if donor_rt.current_load == 0 && donor_rt.status == AgentStatus::Busy {
            donor_rt.status = AgentStatus::Available;
        }

        receiver_rt.active_conversations.insert(conversation_id);
        receiver_rt.current_load += 1;
        receiver_rt.status = AgentStatus::Busy;

        drop(donor_rt);
        drop(receiver_rt);

        let _ = self.event_tx.send(SwitchboardEvent::ConversationReassigned {
            conversation_id,
            from,
            to,
        });
        Some(Reassignment {
            conversation_id,
            from,
            to,
        })
    }

    /// Register every profile held by a persistence backend
    pub async fn hydrate(&self, store: &dyn crate::store::AgentStore) -> Result<usize, SwitchboardError> {
        let profiles = store.list().await?;
        let count = profiles.len();
        for profile in profiles {
            self.register(profile);
        }
        info!(count, "Hydrated roster from store");
        Ok(count)
    }

    /// Total conversations currently held across the roster
    pub fn total_active_conversations(&self) -> u64 {
        let handles: Vec<AgentHandle> = self.agents.read().values().cloned().collect();
        handles
            .iter()
            .map(|agent| agent.runtime.lock().active_conversations.len() as u64)
            .sum()
    }
}
