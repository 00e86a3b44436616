//! Remote ICE candidate reconciliation
//!
//! Candidates can arrive before the remote description they belong to has
//! been applied. Those are queued in arrival order and flushed once, right
//! after the description is set; later candidates are applied directly.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::connection::PeerConnection;
use crate::error::{CallError, Result};
use crate::types::{IceCandidate, UserId};

/// What to do with a candidate handed to the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    ApplyNow(IceCandidate),
    Buffered,
}

#[derive(Debug, Default)]
pub struct CandidateReconciler {
    pending: Vec<IceCandidate>,
    remote_ready: bool,
    flushed: bool,
}

impl CandidateReconciler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciler for a connection whose remote description was applied
    /// before the call was recorded; every candidate applies immediately.
    #[must_use]
    pub fn remote_ready() -> Self {
        Self {
            pending: Vec::new(),
            remote_ready: true,
            flushed: true,
        }
    }

    pub fn offer(&mut self, candidate: IceCandidate) -> Disposition {
        if self.remote_ready {
            Disposition::ApplyNow(candidate)
        } else {
            self.pending.push(candidate);
            Disposition::Buffered
        }
    }

    /// Drain the queue once the remote description is set
    ///
    /// Every candidate offered afterwards is handed back for immediate
    /// application.
    pub fn flush(&mut self) -> Result<Vec<IceCandidate>> {
        if self.flushed {
            return Err(CallError::Internal(
                "pending candidates flushed twice".to_string(),
            ));
        }
        self.flushed = true;
        self.remote_ready = true;
        Ok(std::mem::take(&mut self.pending))
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub const fn is_remote_ready(&self) -> bool {
        self.remote_ready
    }
}

/// Apply flushed candidates in order
///
/// A failing candidate is logged and skipped. Fails only when the remote
/// description is missing.
pub async fn apply_candidates(
    connection: &dyn PeerConnection,
    candidates: Vec<IceCandidate>,
) -> Result<usize> {
    if candidates.is_empty() {
        return Ok(0);
    }
    if !connection.has_remote_description().await {
        return Err(CallError::Internal(
            "candidates flushed before the remote description was set".to_string(),
        ));
    }

    let total = candidates.len();
    let mut applied = 0;
    for candidate in candidates {
        if apply_one(connection, candidate).await {
            applied += 1;
        }
    }
    debug!(applied, total, "Flushed pending candidates");
    Ok(applied)
}

/// Apply one candidate; failures are recoverable and only logged
pub async fn apply_one(connection: &dyn PeerConnection, candidate: IceCandidate) -> bool {
    match connection.add_ice_candidate(candidate.clone()).await {
        Ok(()) => true,
        Err(e) => {
            warn!(candidate = %candidate.candidate, error = %e, "Failed to apply remote candidate");
            false
        }
    }
}

/// Candidates received while idle, held per sender until their offer lands
///
/// Bounded both per sender and in the number of senders; the sender seen
/// longest ago is evicted to make room for a new one.
#[derive(Debug)]
pub struct EarlyCandidates {
    by_sender: HashMap<UserId, Vec<IceCandidate>>,
    arrival: VecDeque<UserId>,
    per_sender: usize,
    max_senders: usize,
}

impl EarlyCandidates {
    #[must_use]
    pub fn new(per_sender: usize, max_senders: usize) -> Self {
        Self {
            by_sender: HashMap::new(),
            arrival: VecDeque::new(),
            per_sender,
            max_senders: max_senders.max(1),
        }
    }

    /// Returns false when the candidate was not kept
    pub fn stash(&mut self, sender: &UserId, candidate: IceCandidate) -> bool {
        if self.per_sender == 0 {
            return false;
        }
        if !self.by_sender.contains_key(sender) {
            while self.by_sender.len() >= self.max_senders {
                let Some(oldest) = self.arrival.pop_front() else {
                    break;
                };
                self.by_sender.remove(&oldest);
                debug!(sender_id = %oldest, "Evicted early candidates of a silent sender");
            }
            self.arrival.push_back(sender.clone());
        }

        let entry = self.by_sender.entry(sender.clone()).or_default();
        if entry.len() >= self.per_sender {
            return false;
        }
        entry.push(candidate);
        true
    }

    pub fn take(&mut self, sender: &UserId) -> Vec<IceCandidate> {
        self.arrival.retain(|id| id != sender);
        self.by_sender.remove(sender).unwrap_or_default()
    }

    pub fn discard(&mut self, sender: &UserId) {
        self.take(sender);
    }

    pub fn clear(&mut self) {
        self.by_sender.clear();
        self.arrival.clear();
    }

    #[must_use]
    pub fn senders(&self) -> usize {
        self.by_sender.len()
    }

    #[must_use]
    pub fn len(&self, sender: &UserId) -> usize {
        self.by_sender.get(sender).map_or(0, Vec::len)
    }
}
