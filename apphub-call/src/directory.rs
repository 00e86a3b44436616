//! Identity resolution boundary
//!
//! An inbound offer only carries the caller's user id. Before the call is
//! surfaced the state machine resolves it into a displayable identity.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::types::{PeerIdentity, UserId};

/// Profile directory lookup
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// `Ok(None)` when the user does not exist
    async fn lookup(&self, user_id: &UserId) -> Result<Option<PeerIdentity>>;
}

/// Directory backed by an in-process map
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: DashMap<UserId, PeerIdentity>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(identities: impl IntoIterator<Item = PeerIdentity>) -> Self {
        let directory = Self::new();
        for identity in identities {
            directory.insert(identity);
        }
        directory
    }

    pub fn insert(&self, identity: PeerIdentity) {
        self.entries.insert(identity.id.clone(), identity);
    }

    pub fn remove(&self, user_id: &UserId) -> Option<PeerIdentity> {
        self.entries.remove(user_id).map(|(_, identity)| identity)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn lookup(&self, user_id: &UserId) -> Result<Option<PeerIdentity>> {
        Ok(self.entries.get(user_id).map(|entry| entry.value().clone()))
    }
}
