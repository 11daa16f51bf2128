//! Candidate pairs and the check list.
//!
//! The check list is the agent-wide, priority-ordered set of pairs across
//! all components, plus the triggered-check FIFO and the valid list.
//! Pairs are addressed by stable [`PairId`]s; positions shift as pairs are
//! pruned and re-sorted.

use std::collections::VecDeque;

use tracing::debug;

use crate::candidate::CandidateInfo;

/// Pair check state per RFC 8445 Section 6.1.2.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairState::Frozen => write!(f, "frozen"),
            PairState::Waiting => write!(f, "waiting"),
            PairState::InProgress => write!(f, "in-progress"),
            PairState::Succeeded => write!(f, "succeeded"),
            PairState::Failed => write!(f, "failed"),
        }
    }
}

/// Stable pair identifier.
pub type PairId = u64;

/// Pair priority per RFC 8445 Section 6.1.2.3:
/// `2^32 * MIN(G,D) + 2 * MAX(G,D) + (G>D ? 1 : 0)` where G is the
/// controlling agent's candidate priority.
pub fn pair_priority(g: u32, d: u32) -> u64 {
    let (g, d) = (g as u64, d as u64);
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

/// One (local, remote) pairing under consideration.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub id: PairId,
    pub local: CandidateInfo,
    pub remote: CandidateInfo,
    pub state: PairState,
    pub priority: u64,
    /// Concatenated local+remote foundations (RFC 8445 Section 6.1.2.6)
    pub foundation: String,
    pub nominated: bool,
    /// Member of the valid list
    pub valid: bool,
    /// The last scheduled check was a triggered check
    pub triggered: bool,
    /// Triggered by a request that carried USE-CANDIDATE
    pub triggered_for_nomination: bool,
    /// This check is the controlling agent's final nomination
    pub final_nomination: bool,
    /// Monotonic counter distinguishing concurrent check attempts
    pub check_seq: u32,
}

impl CandidatePair {
    fn new(id: PairId, local: CandidateInfo, remote: CandidateInfo, priority: u64) -> Self {
        let foundation = format!("{}{}", local.foundation, remote.foundation);
        Self {
            id,
            local,
            remote,
            state: PairState::Frozen,
            priority,
            foundation,
            nominated: false,
            valid: false,
            triggered: false,
            triggered_for_nomination: false,
            final_nomination: false,
            check_seq: 0,
        }
    }

    /// Still awaiting or undergoing a check.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            PairState::Frozen | PairState::Waiting | PairState::InProgress
        )
    }
}

impl std::fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "L:{} {} - R:{} {} (prio {}, {})",
            self.local.kind, self.local.addr, self.remote.kind, self.remote.addr, self.priority,
            self.state
        )
    }
}

/// Maximum retained pairs per component (RFC 8445 Section 6.1.2.5 suggests
/// a limit of 100).
const MAX_PAIRS_PER_COMPONENT: usize = 100;

/// All formed pairs plus the triggered queue and valid list.
#[derive(Debug, Default)]
pub struct CheckList {
    pairs: Vec<CandidatePair>,
    triggered: VecDeque<PairId>,
    valid: Vec<PairId>,
    next_id: PairId,
}

impl CheckList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    pub fn pair(&self, id: PairId) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.id == id)
    }

    pub fn pair_mut(&mut self, id: PairId) -> Option<&mut CandidatePair> {
        self.pairs.iter_mut().find(|p| p.id == id)
    }

    /// Insert new pairs: sort by priority (component id breaks ties), prune
    /// redundant `(component, local base, remote address)` duplicates keeping
    /// the highest-priority one, cap the list size, and make sure every
    /// foundation group has one non-frozen member.
    ///
    /// Returns the ids actually retained.
    pub fn add_pairs(
        &mut self,
        new: Vec<(CandidateInfo, CandidateInfo, u64)>,
        component_count: usize,
    ) -> Vec<PairId> {
        if new.is_empty() {
            return Vec::new();
        }
        let mut added = Vec::new();
        for (local, remote, priority) in new {
            let id = self.next_id;
            self.next_id += 1;
            debug!(pair = %format!("{} -> {}", local.addr, remote.addr), priority, "formed pair");
            self.pairs.push(CandidatePair::new(id, local, remote, priority));
            added.push(id);
        }

        self.sort();

        // prune: earlier (higher-priority) entries win
        let mut seen: Vec<(u16, crate::addr::TransportAddress, crate::addr::TransportAddress)> =
            Vec::new();
        let valid_ids = &self.valid;
        self.pairs.retain(|p| {
            // never prune pairs that already produced results
            let keep_always = p.valid
                || valid_ids.contains(&p.id)
                || matches!(p.state, PairState::Succeeded | PairState::InProgress);
            let key = (p.local.component_id, p.local.base, p.remote.addr);
            if seen.contains(&key) && !keep_always {
                debug!(pair = %p, "pruned redundant pair");
                return false;
            }
            seen.push(key);
            true
        });

        // cap, dropping the lowest-priority tail
        let cap = MAX_PAIRS_PER_COMPONENT * component_count.max(1);
        while self.pairs.len() > cap {
            let dropped = self.pairs.pop();
            if let Some(p) = dropped {
                debug!(pair = %p, "checklist full, dropped pair");
            }
        }

        self.unfreeze_first_per_foundation();

        let retained: Vec<PairId> = added
            .into_iter()
            .filter(|id| self.pairs.iter().any(|p| p.id == *id))
            .collect();
        retained
    }

    fn sort(&mut self) {
        self.pairs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.local.component_id.cmp(&b.local.component_id))
        });
    }

    /// Re-sort after pair priorities changed (role flip).
    pub fn resort(&mut self) {
        self.sort();
        let mut valid = std::mem::take(&mut self.valid);
        valid.sort_by_key(|id| {
            std::cmp::Reverse(self.pair(*id).map(|p| p.priority).unwrap_or(0))
        });
        self.valid = valid;
    }

    /// One pair per foundation group leaves Frozen (highest priority first);
    /// groups that already have an active or finished member stay as they
    /// are.
    fn unfreeze_first_per_foundation(&mut self) {
        let mut active_foundations: Vec<String> = self
            .pairs
            .iter()
            .filter(|p| p.state != PairState::Frozen)
            .map(|p| p.foundation.clone())
            .collect();
        for pair in &mut self.pairs {
            if pair.state == PairState::Frozen && !active_foundations.contains(&pair.foundation) {
                pair.state = PairState::Waiting;
                active_foundations.push(pair.foundation.clone());
            }
        }
    }

    /// Move every frozen pair sharing `foundation` to Waiting (a sibling
    /// succeeded, RFC 8445 Section 7.2.5.3.3).
    pub fn unfreeze_foundation(&mut self, foundation: &str) {
        for pair in &mut self.pairs {
            if pair.state == PairState::Frozen && pair.foundation == foundation {
                pair.state = PairState::Waiting;
            }
        }
    }

    /// Next pair to check: the triggered queue preempts priority order, then
    /// the highest-priority Waiting pair, then the highest-priority Frozen
    /// pair is thawed.
    pub fn select_next(&mut self) -> Option<PairId> {
        while let Some(id) = self.triggered.pop_front() {
            if let Some(pair) = self.pair_mut(id) {
                if pair.state == PairState::Failed {
                    continue;
                }
                pair.triggered = true;
                return Some(id);
            }
        }

        let mut waiting = None;
        let mut frozen = None;
        for pair in &self.pairs {
            if pair.state == PairState::Waiting {
                waiting = Some(pair.id);
                break;
            }
            if pair.state == PairState::Frozen && frozen.is_none() {
                frozen = Some(pair.id);
            }
        }
        let next = waiting.or(frozen);
        if let Some(id) = next {
            if let Some(pair) = self.pair_mut(id) {
                pair.triggered = false;
            }
        }
        next
    }

    pub fn enqueue_triggered(&mut self, id: PairId) {
        if !self.triggered.contains(&id) {
            self.triggered.push_back(id);
        }
    }

    /// Nominations jump the whole queue.
    pub fn prepend_triggered(&mut self, id: PairId) {
        self.triggered.retain(|x| *x != id);
        self.triggered.push_front(id);
    }

    pub fn drop_triggered_for_component(&mut self, component_id: u16) {
        let pairs = &self.pairs;
        self.triggered.retain(|id| {
            pairs
                .iter()
                .find(|p| p.id == *id)
                .map(|p| p.local.component_id != component_id)
                .unwrap_or(false)
        });
    }

    /// Insert into the valid list, keeping it sorted by priority.
    pub fn insert_valid(&mut self, id: PairId) {
        if self.valid.contains(&id) {
            return;
        }
        let priority = match self.pair(id) {
            Some(p) => p.priority,
            None => return,
        };
        let at = self
            .valid
            .iter()
            .position(|v| self.pair(*v).map(|p| p.priority < priority).unwrap_or(true))
            .unwrap_or(self.valid.len());
        self.valid.insert(at, id);
    }

    pub fn remove_valid(&mut self, id: PairId) {
        self.valid.retain(|v| *v != id);
    }

    pub fn valid_ids(&self) -> &[PairId] {
        &self.valid
    }

    /// Highest-priority valid pair of a component.
    pub fn highest_valid(&self, component_id: u16) -> Option<PairId> {
        self.valid
            .iter()
            .copied()
            .filter(|id| {
                self.pair(*id)
                    .map(|p| p.local.component_id == component_id)
                    .unwrap_or(false)
            })
            .max_by_key(|id| self.pair(*id).map(|p| p.priority).unwrap_or(0))
    }

    /// No pair of the component is frozen, waiting, or in progress, and the
    /// triggered queue holds nothing for it.
    pub fn component_done(&self, component_id: u16) -> bool {
        let pending = self.pairs.iter().any(|p| {
            p.local.component_id == component_id && p.is_pending()
        });
        let queued = self.triggered.iter().any(|id| {
            self.pair(*id)
                .map(|p| p.local.component_id == component_id)
                .unwrap_or(false)
        });
        !pending && !queued
    }

    /// Every formed pair failed and nothing succeeded: the checklist is
    /// exhausted.
    pub fn exhausted(&self) -> bool {
        !self.pairs.is_empty()
            && self.valid.is_empty()
            && self.pairs.iter().all(|p| p.state == PairState::Failed)
    }

    /// Remove pairs whose local candidate id is in `ids` (their transport
    /// went away).
    pub fn remove_pairs_with_local(&mut self, ids: &[String]) {
        let removed: Vec<PairId> = self
            .pairs
            .iter()
            .filter(|p| ids.contains(&p.local.id))
            .map(|p| p.id)
            .collect();
        self.pairs.retain(|p| !ids.contains(&p.local.id));
        self.triggered.retain(|id| !removed.contains(id));
        self.valid.retain(|id| !removed.contains(id));
    }
}
