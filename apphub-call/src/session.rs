//! Per-participant call session state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::connection::ConnectionHandle;
use crate::reconciler::CandidateReconciler;
use crate::types::{PeerIdentity, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Idle,
    Outgoing,
    Incoming,
    Connected,
    Disconnected,
}

impl CallStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }

    /// A call attempt or an established call
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Outgoing | Self::Incoming | Self::Connected)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable session state, written only by the call controller
#[derive(Debug)]
pub(crate) struct CallSession {
    pub status: CallStatus,
    pub peer: Option<PeerIdentity>,
    pub connection: Option<ConnectionHandle>,
    pub reconciler: CandidateReconciler,
    pub duration_secs: u64,
    /// Answer exchanged, waiting for the transport to confirm
    pub answered: bool,
    /// Bumped on every new call attempt
    pub epoch: u64,
    pub trace_id: Option<String>,
}

impl CallSession {
    pub fn new() -> Self {
        Self {
            status: CallStatus::Idle,
            peer: None,
            connection: None,
            reconciler: CandidateReconciler::new(),
            duration_secs: 0,
            answered: false,
            epoch: 0,
            trace_id: None,
        }
    }

    /// Start a call attempt from Idle and return its epoch
    pub fn begin(&mut self, status: CallStatus, peer: PeerIdentity, trace_id: String) -> u64 {
        self.epoch += 1;
        self.status = status;
        self.peer = Some(peer);
        self.connection = None;
        self.reconciler = CandidateReconciler::new();
        self.duration_secs = 0;
        self.answered = false;
        self.trace_id = Some(trace_id);
        self.epoch
    }

    /// Whether `epoch` is the attempt still in progress
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.status.is_active()
    }

    pub fn is_peer(&self, user_id: &UserId) -> bool {
        self.peer.as_ref().is_some_and(|peer| &peer.id == user_id)
    }

    pub fn reset_to_idle(&mut self) {
        self.status = CallStatus::Idle;
        self.peer = None;
        self.connection = None;
        self.reconciler = CandidateReconciler::new();
        self.duration_secs = 0;
        self.answered = false;
        self.trace_id = None;
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            status: self.status,
            peer: self.peer.clone(),
            has_connection: self.connection.is_some(),
            pending_candidates: self.reconciler.pending_len(),
            duration_secs: self.duration_secs,
            answered: self.answered,
        }
    }
}

/// Read-only view of the session for the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub peer: Option<PeerIdentity>,
    pub has_connection: bool,
    pub pending_candidates: usize,
    pub duration_secs: u64,
    pub answered: bool,
}

impl CallSnapshot {
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            status: CallStatus::Idle,
            peer: None,
            has_connection: false,
            pending_candidates: 0,
            duration_secs: 0,
            answered: false,
        }
    }

    /// Nothing left over from a previous call
    #[must_use]
    pub fn is_clean_idle(&self) -> bool {
        self.status == CallStatus::Idle
            && self.peer.is_none()
            && !self.has_connection
            && self.pending_candidates == 0
            && self.duration_secs == 0
    }
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// "Call-action in flight" flag
///
/// Held for the whole async chain of placing, answering or accepting a
/// call so a second attempt cannot start a second connection.
#[derive(Debug, Default)]
pub(crate) struct ActionFlag {
    busy: AtomicBool,
}

impl ActionFlag {
    pub fn try_acquire(&self) -> Option<ActionGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ActionGuard { flag: self })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the action flag on drop
#[derive(Debug)]
pub(crate) struct ActionGuard<'a> {
    flag: &'a ActionFlag,
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        self.flag.busy.store(false, Ordering::Release);
    }
}
