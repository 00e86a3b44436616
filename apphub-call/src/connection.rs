//! Media/connection manager
//!
//! Owns at most one live peer connection together with the local capture
//! handle attached to it. Every connection is identified by a
//! [`ConnectionHandle`]; continuations that resume after an `.await` check
//! their handle is still live before touching anything.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CallError, Result};
use crate::media::{CaptureTrack, LocalMedia, RemoteTrack};
use crate::signal::{OutboundSignal, Signal};
use crate::transport::SignalTransport;
use crate::types::{ConnectionState, IceCandidate, SessionDescription, SignalingState, UserId};

/// Events raised by a connection object
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Locally gathered candidate to trickle to the peer
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(ConnectionState),
}

/// Offer/answer negotiation object
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    fn signaling_state(&self) -> SignalingState;

    async fn add_track(&self, track: Arc<dyn CaptureTrack>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates connection objects wired to an event channel
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// Identity of one connection object over its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct ManagedConnection {
    handle: ConnectionHandle,
    peer_id: UserId,
    connection: Arc<dyn PeerConnection>,
    media: Option<LocalMedia>,
    remote_tracks: Vec<RemoteTrack>,
    pump: JoinHandle<()>,
}

/// Connection removed from the manager, still to be closed
pub struct DetachedConnection {
    handle: ConnectionHandle,
    connection: Arc<dyn PeerConnection>,
}

impl DetachedConnection {
    #[must_use]
    pub const fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub async fn close(self) {
        if let Err(e) = self.connection.close().await {
            warn!(handle = %self.handle, error = %e, "Failed to close peer connection");
        } else {
            debug!(handle = %self.handle, "Peer connection closed");
        }
    }
}

pub struct ConnectionManager {
    local_id: UserId,
    factory: Arc<dyn ConnectionFactory>,
    transport: Arc<dyn SignalTransport>,
    current: Arc<Mutex<Option<ManagedConnection>>>,
    next_handle: AtomicU64,
    forward_tx: mpsc::UnboundedSender<(ConnectionHandle, ConnectionEvent)>,
}

impl ConnectionManager {
    /// Returns the manager and the stream of state-change and remote-track
    /// events of every connection it creates, tagged with their handle.
    pub fn new(
        local_id: UserId,
        factory: Arc<dyn ConnectionFactory>,
        transport: Arc<dyn SignalTransport>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<(ConnectionHandle, ConnectionEvent)>,
    ) {
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id,
            factory,
            transport,
            current: Arc::new(Mutex::new(None)),
            next_handle: AtomicU64::new(1),
            forward_tx,
        };
        (manager, forward_rx)
    }

    /// Allocate a connection whose local candidates are sent to `peer_id`
    pub async fn create_connection(&self, peer_id: &UserId) -> Result<ConnectionHandle> {
        if let Some(existing) = self.current_handle() {
            return Err(CallError::Internal(format!(
                "connection {existing} is still alive"
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = self.factory.create(events_tx).await?;
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        let raced = {
            let mut current = self.current.lock();
            if current.is_some() {
                true
            } else {
                let pump = self.spawn_pump(handle, peer_id.clone(), events_rx);
                *current = Some(ManagedConnection {
                    handle,
                    peer_id: peer_id.clone(),
                    connection: connection.clone(),
                    media: None,
                    remote_tracks: Vec::new(),
                    pump,
                });
                false
            }
        };

        if raced {
            let _ = connection.close().await;
            return Err(CallError::Internal(
                "another connection was created concurrently".to_string(),
            ));
        }

        info!(handle = %handle, peer_id = %peer_id, "Peer connection created");
        Ok(handle)
    }

    fn spawn_pump(
        &self,
        handle: ConnectionHandle,
        peer_id: UserId,
        mut events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        let local_id = self.local_id.clone();
        let transport = Arc::clone(&self.transport);
        let current = Arc::clone(&self.current);
        let forward_tx = self.forward_tx.clone();

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ConnectionEvent::LocalCandidate(candidate) => {
                        let signal = OutboundSignal::new(
                            local_id.clone(),
                            peer_id.clone(),
                            Signal::IceCandidate(candidate),
                        );
                        if let Err(e) = transport.send(signal).await {
                            warn!(handle = %handle, peer_id = %peer_id, error = %e, "Failed to send local candidate");
                        }
                    }
                    ConnectionEvent::RemoteTrack(track) => {
                        if let Some(managed) = current
                            .lock()
                            .as_mut()
                            .filter(|managed| managed.handle == handle)
                        {
                            managed.remote_tracks.push(track.clone());
                        }
                        if forward_tx
                            .send((handle, ConnectionEvent::RemoteTrack(track)))
                            .is_err()
                        {
                            break;
                        }
                    }
                    ConnectionEvent::StateChanged(state) => {
                        if forward_tx
                            .send((handle, ConnectionEvent::StateChanged(state)))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Add every local track to the connection; allowed once per connection
    pub async fn attach_local_media(&self, handle: ConnectionHandle, media: LocalMedia) -> Result<()> {
        let (connection, tracks) = {
            let mut current = self.current.lock();
            let managed = current
                .as_mut()
                .filter(|managed| managed.handle == handle)
                .ok_or_else(|| CallError::Stale(format!("{handle} was torn down")))?;
            if managed.media.is_some() {
                return Err(CallError::Internal(format!(
                    "local media already attached to {handle}"
                )));
            }
            let tracks = media.tracks().to_vec();
            managed.media = Some(media);
            (Arc::clone(&managed.connection), tracks)
        };

        for track in tracks {
            connection.add_track(track).await?;
            self.ensure_live(handle)?;
        }

        debug!(handle = %handle, "Local media attached");
        Ok(())
    }

    /// The connection object behind a live handle
    pub fn connection(&self, handle: ConnectionHandle) -> Result<Arc<dyn PeerConnection>> {
        self.current
            .lock()
            .as_ref()
            .filter(|managed| managed.handle == handle)
            .map(|managed| Arc::clone(&managed.connection))
            .ok_or_else(|| CallError::Stale(format!("{handle} was torn down")))
    }

    #[must_use]
    pub fn is_live(&self, handle: ConnectionHandle) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|managed| managed.handle == handle)
    }

    /// Stale-continuation check
    pub fn ensure_live(&self, handle: ConnectionHandle) -> Result<()> {
        if self.is_live(handle) {
            Ok(())
        } else {
            Err(CallError::Stale(format!("{handle} was torn down")))
        }
    }

    #[must_use]
    pub fn current_handle(&self) -> Option<ConnectionHandle> {
        self.current.lock().as_ref().map(|managed| managed.handle)
    }

    #[cfg(test)]
    pub fn current_peer(&self) -> Option<UserId> {
        self.current
            .lock()
            .as_ref()
            .map(|managed| managed.peer_id.clone())
    }

    #[cfg(test)]
    pub fn has_local_media(&self, handle: ConnectionHandle) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|managed| managed.handle == handle && managed.media.is_some())
    }

    /// Remote tracks received on the live connection
    #[must_use]
    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.current
            .lock()
            .as_ref()
            .map(|managed| managed.remote_tracks.clone())
            .unwrap_or_default()
    }

    /// Synchronous half of teardown
    ///
    /// Unwires events, stops local tracks and drops the remote tracks. The
    /// returned connection still has to be closed. `None` when the handle is
    /// not the live connection.
    pub fn detach(&self, handle: ConnectionHandle) -> Option<DetachedConnection> {
        let managed = {
            let mut current = self.current.lock();
            if current.as_ref().is_some_and(|managed| managed.handle == handle) {
                current.take()
            } else {
                None
            }
        }?;

        managed.pump.abort();
        if let Some(media) = &managed.media {
            media.stop();
        }
        debug!(
            handle = %handle,
            peer_id = %managed.peer_id,
            remote_tracks = managed.remote_tracks.len(),
            "Peer connection detached"
        );

        Some(DetachedConnection {
            handle,
            connection: managed.connection,
        })
    }

    /// Tear a connection down; a no-op for handles already torn down
    ///
    /// Returns whether anything was torn down.
    pub async fn teardown(&self, handle: ConnectionHandle) -> bool {
        match self.detach(handle) {
            Some(detached) => {
                detached.close().await;
                true
            }
            None => {
                debug!(handle = %handle, "Teardown of inactive connection ignored");
                false
            }
        }
    }

    /// Tear down whatever connection is live
    pub async fn teardown_current(&self) -> bool {
        match self.current_handle() {
            Some(handle) => self.teardown(handle).await,
            None => false,
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(managed) = self.current.lock().take() {
            managed.pump.abort();
            debug!(handle = %managed.handle, "Connection manager dropped with a live connection");
        }
    }
}
