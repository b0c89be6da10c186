//! Candidate Ranker
//!
//! Bounded top-K selection shared by concurrently running candidate
//! evaluations.
//!
//! # Ordering
//! Entries are ordered by `CandidateMatch`'s total order: score descending,
//! then `object_id` ascending. Boundary ties are decided by `object_id`, never
//! by arrival order, so the shortlist is independent of evaluation scheduling.
//!
//! # Concurrency
//! One `Mutex` guards the whole structure. `offer` takes `&self` and holds
//! the lock only for the set update; it is never held across an `.await`.
//! `drain` consumes the ranker, so a ranker yields its shortlist exactly once.

use crate::types::CandidateMatch;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

/// Default shortlist length
pub const DEFAULT_TOP_K: usize = 10;

/// Ranked entry: a match plus caller-defined detail carried alongside
///
/// Ordered by `candidate` only.
#[derive(Debug, Clone)]
pub struct Ranked<T> {
    pub candidate: CandidateMatch,
    pub detail: T,
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.candidate == other.candidate
    }
}

impl<T> Eq for Ranked<T> {}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.candidate.cmp(&other.candidate)
    }
}

struct TopK<T> {
    /// First element ranks best, last element is the eviction candidate
    entries: BTreeSet<Ranked<T>>,
    /// object_id → score of the entry currently held
    held: HashMap<String, f64>,
}

/// Bounded top-K structure
pub struct CandidateRanker<T = ()> {
    capacity: usize,
    inner: Mutex<TopK<T>>,
}

impl<T> CandidateRanker<T> {
    /// Create a ranker holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(TopK {
                entries: BTreeSet::new(),
                held: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer a candidate; returns whether it is now held
    ///
    /// - Fewer than K entries held: inserted
    /// - Full: replaces the current minimum only if it ranks strictly ahead
    /// - Same `object_id` already held: the better-ranked of the two is kept
    pub fn offer(&self, candidate: CandidateMatch, detail: T) -> bool {
        if self.capacity == 0 {
            return false;
        }

        let entry = Ranked { candidate, detail };
        let mut top = self.lock();

        if let Some(&held_score) = top.held.get(&entry.candidate.object_id) {
            let held = CandidateMatch {
                object_id: entry.candidate.object_id.clone(),
                score: held_score,
            };
            if entry.candidate >= held {
                return false;
            }
            // Drop the weaker duplicate; `held` compares equal to the stored entry
            top.entries.retain(|r| r.candidate != held);
            top.held.remove(&held.object_id);
        }

        if top.entries.len() >= self.capacity {
            let admits = top
                .entries
                .last()
                .map(|worst| entry.candidate < worst.candidate)
                .unwrap_or(true);
            if !admits {
                trace!(object_id = %entry.candidate.object_id, "Candidate below shortlist floor");
                return false;
            }
            if let Some(evicted) = top.entries.pop_last() {
                trace!(
                    evicted = %evicted.candidate.object_id,
                    admitted = %entry.candidate.object_id,
                    "Shortlist eviction"
                );
                top.held.remove(&evicted.candidate.object_id);
            }
        }

        top.held
            .insert(entry.candidate.object_id.clone(), entry.candidate.score);
        top.entries.insert(entry);
        true
    }

    /// Consume the ranker, returning entries best-first
    pub fn drain(self) -> Vec<Ranked<T>> {
        let top = match self.inner.into_inner() {
            Ok(top) => top,
            Err(poisoned) => poisoned.into_inner(),
        };
        top.entries.into_iter().collect()
    }

    fn lock(&self) -> MutexGuard<'_, TopK<T>> {
        // A panic while holding the lock cannot leave the set half-updated
        // in a way that breaks ordering, so recover the guard.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Default for CandidateRanker<T> {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_K)
    }
}

// ============================================================================
// Tests
// ============================================================================
