//! Negotiation state machine
//!
//! [`CallController`] is the single writer of the call status and peer. It
//! arbitrates local actions (`initiate_call`, `answer_call`, `hang_up`)
//! against inbound signals and connection state reports, and drives the
//! connection manager accordingly.
//!
//! Three kinds of task interleave at every `.await`: the caller's task for
//! local actions, the inbound signal loop, and the connection event loop.
//! The session lock is never held across an `.await`; continuations re-check
//! their epoch or connection handle after resuming and give up with
//! [`CallError::Stale`] when the call they belonged to is gone.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::CallConfig;
use crate::connection::{ConnectionEvent, ConnectionFactory, ConnectionHandle, ConnectionManager};
use crate::directory::IdentityDirectory;
use crate::error::{CallError, Result};
use crate::logging::{call_span, generate_trace_id};
use crate::media::{LocalMedia, MediaDevices, RemoteTrack};
use crate::presenter::{AudioCue, CallEvent, EndReason};
use crate::reconciler::{apply_candidates, apply_one, CandidateReconciler, Disposition, EarlyCandidates};
use crate::session::{ActionFlag, CallSession, CallSnapshot, CallStatus};
use crate::signal::{InboundSignal, OutboundSignal, Signal};
use crate::transport::{SignalSubscription, SignalTransport};
use crate::types::{ConnectionState, IceCandidate, PeerIdentity, SessionDescription, SignalingState, UserId};

const EVENT_CAPACITY: usize = 64;

/// Collaborators of the state machine
pub struct CallDependencies {
    pub transport: Arc<dyn SignalTransport>,
    pub directory: Arc<dyn IdentityDirectory>,
    pub devices: Arc<dyn MediaDevices>,
    pub connections: Arc<dyn ConnectionFactory>,
}

/// Call controller of one local participant
#[derive(Clone)]
pub struct CallController {
    inner: Arc<Inner>,
}

struct Inner {
    local_id: UserId,
    config: CallConfig,
    transport: Arc<dyn SignalTransport>,
    directory: Arc<dyn IdentityDirectory>,
    devices: Arc<dyn MediaDevices>,
    connections: ConnectionManager,
    session: Mutex<CallSession>,
    early: Mutex<EarlyCandidates>,
    action: ActionFlag,
    snapshot_tx: watch::Sender<CallSnapshot>,
    events_tx: broadcast::Sender<CallEvent>,
    connection_events: Mutex<Option<mpsc::UnboundedReceiver<(ConnectionHandle, ConnectionEvent)>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Where an inbound candidate goes
enum CandidateRoute {
    Stash(IceCandidate),
    Ignore(CallStatus),
    Reconcile(Disposition, Option<ConnectionHandle>),
}

/// Whether ending a call tells the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerNotice {
    Always,
    Never,
    /// Only if the peer may be holding our offer or waiting on our answer
    IfNegotiating,
}

impl CallController {
    pub fn new(local_id: UserId, config: CallConfig, deps: CallDependencies) -> Self {
        let (connections, connection_events) =
            ConnectionManager::new(local_id.clone(), deps.connections, Arc::clone(&deps.transport));
        let (snapshot_tx, _) = watch::channel(CallSnapshot::idle());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let early = EarlyCandidates::new(config.max_early_candidates, config.max_early_senders);

        Self {
            inner: Arc::new(Inner {
                local_id,
                config,
                transport: deps.transport,
                directory: deps.directory,
                devices: deps.devices,
                connections,
                session: Mutex::new(CallSession::new()),
                early: Mutex::new(early),
                action: ActionFlag::default(),
                snapshot_tx,
                events_tx,
                connection_events: Mutex::new(Some(connection_events)),
                tasks: Mutex::new(Vec::new()),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to the signal log and start the background loops
    pub async fn start(&self) -> Result<()> {
        let connection_events = self
            .inner
            .connection_events
            .lock()
            .take()
            .ok_or_else(|| CallError::Internal("call controller already started".to_string()))?;

        let subscription = match self.inner.transport.subscribe(&self.inner.local_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                *self.inner.connection_events.lock() = Some(connection_events);
                return Err(e);
            }
        };

        let inbound = tokio::spawn(Arc::clone(&self.inner).run_inbound(subscription));
        let events = tokio::spawn(Arc::clone(&self.inner).run_connection_events(connection_events));
        self.inner.tasks.lock().extend([inbound, events]);

        info!(user_id = %self.inner.local_id, "Call controller started");
        Ok(())
    }

    #[must_use]
    pub fn local_id(&self) -> &UserId {
        &self.inner.local_id
    }

    /// Place a call; `Idle -> Outgoing`
    ///
    /// Fails with [`CallError::ActionInFlight`] while another call action is
    /// still resolving, leaving the session untouched.
    pub async fn initiate_call(&self, peer: PeerIdentity) -> Result<()> {
        let inner = &self.inner;
        if peer.id == inner.local_id {
            return Err(CallError::Protocol("cannot call yourself".to_string()));
        }
        let _guard = inner.action.try_acquire().ok_or(CallError::ActionInFlight)?;

        let trace_id = generate_trace_id();
        let epoch = inner.update(|s| {
            if s.status == CallStatus::Idle {
                Ok(s.begin(CallStatus::Outgoing, peer.clone(), trace_id.clone()))
            } else {
                Err(CallError::InvalidState {
                    action: "call",
                    status: s.status,
                })
            }
        })?;
        inner.early.lock().clear();

        let span = call_span(&trace_id, &peer.id, "outgoing");
        async {
            info!("Placing call");
            inner.emit(CallEvent::PlayCue(AudioCue::Ringback));
            match inner.place_call(epoch, &peer.id).await {
                Err(e) if e.is_stale() => {
                    debug!(error = %e, "Call attempt superseded");
                    Ok(())
                }
                other => other,
            }
        }
        .instrument(span)
        .await
    }

    /// Accept the incoming call
    ///
    /// Status stays `Incoming` until the transport reports the connection
    /// as established.
    pub async fn answer_call(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.action.try_acquire().ok_or(CallError::ActionInFlight)?;

        let (status, answered, epoch, handle, peer) = inner.read(|s| {
            (s.status, s.answered, s.epoch, s.connection, s.peer.clone())
        });
        if status != CallStatus::Incoming || answered {
            return Err(CallError::InvalidState {
                action: "answer",
                status,
            });
        }
        let (Some(handle), Some(peer)) = (handle, peer) else {
            return Err(CallError::Protocol(
                "incoming call has no connection".to_string(),
            ));
        };

        let connection = inner.connections.connection(handle)?;
        let signaling = connection.signaling_state();
        if signaling != SignalingState::HaveRemoteOffer {
            return Err(CallError::Protocol(format!(
                "no remote offer to answer (signaling state {signaling:?})"
            )));
        }

        async {
            info!("Answering call");
            match inner.accept(epoch, handle, &peer.id).await {
                Err(e) if e.is_stale() => {
                    debug!(error = %e, "Answer superseded");
                    Ok(())
                }
                other => other,
            }
        }
        .instrument(inner.session_span())
        .await
    }

    /// Hang up, decline or cancel; a no-op when no call is active
    pub async fn hang_up(&self) -> Result<()> {
        let inner = &self.inner;
        let (status, epoch) = inner.read(|s| (s.status, s.epoch));
        if !status.is_active() {
            debug!(status = %status, "Nothing to hang up");
            return Ok(());
        }

        inner
            .disconnect(epoch, EndReason::LocalHangUp, PeerNotice::IfNegotiating)
            .instrument(inner.session_span())
            .await;
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.read(CallSession::snapshot)
    }

    /// Snapshot stream, updated on every session change
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Output actions for the presentation adapter
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events_tx.subscribe()
    }

    #[must_use]
    pub fn duration_secs(&self) -> u64 {
        self.inner.read(|s| s.duration_secs)
    }

    /// Remote tracks of the live connection
    #[must_use]
    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.inner.connections.remote_tracks()
    }

    /// Hang up any active call and stop the background loops
    pub async fn shutdown(&self) {
        let _ = self.hang_up().await;

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(ticker) = self.inner.ticker.lock().take() {
            ticker.abort();
        }
        self.inner.connections.teardown_current().await;
        info!(user_id = %self.inner.local_id, "Call controller stopped");
    }
}

impl Inner {
    /// Mutate the session and publish the new snapshot
    fn update<R>(&self, f: impl FnOnce(&mut CallSession) -> R) -> R {
        let mut session = self.session.lock();
        let result = f(&mut *session);
        self.snapshot_tx.send_replace(session.snapshot());
        result
    }

    fn read<R>(&self, f: impl FnOnce(&CallSession) -> R) -> R {
        f(&*self.session.lock())
    }

    fn emit(&self, event: CallEvent) {
        // No subscriber is fine
        let _ = self.events_tx.send(event);
    }

    fn session_span(&self) -> Span {
        let (trace_id, peer_id) = self.read(|s| {
            (
                s.trace_id.clone().unwrap_or_default(),
                s.peer.as_ref().map(|peer| peer.id.to_string()).unwrap_or_default(),
            )
        });
        info_span!("call", trace_id = %trace_id, peer_id = %peer_id)
    }

    fn ensure_epoch(&self, epoch: u64) -> Result<()> {
        if self.read(|s| s.is_current(epoch)) {
            Ok(())
        } else {
            Err(CallError::Stale(format!("call attempt {epoch} has ended")))
        }
    }

    /// Record the connection on the session unless the attempt has ended
    fn attach_handle(&self, epoch: u64, handle: ConnectionHandle) -> bool {
        self.update(|s| {
            if s.is_current(epoch) {
                s.connection = Some(handle);
                true
            } else {
                false
            }
        })
    }

    async fn send_signal(&self, receiver_id: &UserId, signal: Signal) {
        let kind = signal.kind();
        let outbound = OutboundSignal::new(self.local_id.clone(), receiver_id.clone(), signal);
        match self.transport.send(outbound).await {
            Ok(()) => debug!(receiver_id = %receiver_id, signal_type = %kind, "Signal sent"),
            Err(e) => {
                warn!(receiver_id = %receiver_id, signal_type = %kind, error = %e, "Failed to send signal");
            }
        }
    }

    /// End a failed attempt and decide what the caller sees
    ///
    /// Errors from an attempt whose connection or epoch is already gone are
    /// downgraded to [`CallError::Stale`].
    async fn fail(
        self: &Arc<Self>,
        epoch: u64,
        handle: Option<ConnectionHandle>,
        reason: EndReason,
        notice: PeerNotice,
        err: CallError,
    ) -> CallError {
        if err.is_stale() {
            return err;
        }
        if handle.is_some_and(|handle| !self.connections.is_live(handle)) {
            return CallError::Stale(err.to_string());
        }

        warn!(error = %err, reason = ?reason, "Call attempt failed");
        if self.disconnect(epoch, reason, notice).await {
            err
        } else {
            CallError::Stale(err.to_string())
        }
    }

    async fn place_call(self: &Arc<Self>, epoch: u64, peer_id: &UserId) -> Result<()> {
        let media = match self.devices.acquire_audio().await {
            Ok(media) => media,
            Err(e) => {
                // No connection yet, the peer never heard of this call
                return Err(self.fail(epoch, None, EndReason::DeviceUnavailable, PeerNotice::Never, e).await);
            }
        };
        self.ensure_epoch(epoch)?;

        let handle = match self.connections.create_connection(peer_id).await {
            Ok(handle) => handle,
            Err(e) => {
                return Err(self.fail(epoch, None, EndReason::NegotiationFailed, PeerNotice::Never, e).await);
            }
        };
        if !self.attach_handle(epoch, handle) {
            self.connections.teardown(handle).await;
            return Err(CallError::Stale(format!("call attempt {epoch} has ended")));
        }

        match self.send_offer(handle, peer_id, media).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self
                .fail(epoch, Some(handle), EndReason::NegotiationFailed, PeerNotice::Always, e)
                .await),
        }
    }

    async fn send_offer(&self, handle: ConnectionHandle, peer_id: &UserId, media: LocalMedia) -> Result<()> {
        self.connections.attach_local_media(handle, media).await?;
        let connection = self.connections.connection(handle)?;

        let offer = connection.create_offer().await?;
        self.connections.ensure_live(handle)?;
        connection.set_local_description(offer.clone()).await?;
        self.connections.ensure_live(handle)?;

        self.send_signal(peer_id, Signal::Offer(offer)).await;
        info!(handle = %handle, "Offer sent");
        Ok(())
    }

    async fn accept(self: &Arc<Self>, epoch: u64, handle: ConnectionHandle, peer_id: &UserId) -> Result<()> {
        self.emit(CallEvent::StopCue(AudioCue::Ringtone));

        let media = match self.devices.acquire_audio().await {
            Ok(media) => media,
            Err(e) => {
                return Err(self
                    .fail(epoch, Some(handle), EndReason::DeviceUnavailable, PeerNotice::Always, e)
                    .await);
            }
        };

        match self.send_answer(epoch, handle, peer_id, media).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self
                .fail(epoch, Some(handle), EndReason::NegotiationFailed, PeerNotice::Always, e)
                .await),
        }
    }

    async fn send_answer(
        &self,
        epoch: u64,
        handle: ConnectionHandle,
        peer_id: &UserId,
        media: LocalMedia,
    ) -> Result<()> {
        self.connections.attach_local_media(handle, media).await?;
        let connection = self.connections.connection(handle)?;

        let answer = connection.create_answer().await?;
        self.connections.ensure_live(handle)?;
        connection.set_local_description(answer.clone()).await?;
        self.connections.ensure_live(handle)?;

        let current = self.update(|s| {
            if s.is_current(epoch) {
                s.answered = true;
                true
            } else {
                false
            }
        });
        if !current {
            return Err(CallError::Stale(format!("call attempt {epoch} has ended")));
        }

        self.send_signal(peer_id, Signal::Answer(answer)).await;
        info!(handle = %handle, "Answer sent, waiting for transport");
        Ok(())
    }

    /// Transition to `Disconnected` and tear everything down
    ///
    /// Returns false when `epoch` is no longer the active attempt.
    async fn disconnect(self: &Arc<Self>, epoch: u64, reason: EndReason, notice: PeerNotice) -> bool {
        let ended = self.update(|s| {
            if !s.is_current(epoch) {
                return None;
            }
            let previous = s.status;
            let notify = match notice {
                PeerNotice::Always => true,
                PeerNotice::Never => false,
                // A ringing callee always owes the caller an answer
                PeerNotice::IfNegotiating => {
                    previous == CallStatus::Incoming || s.connection.is_some()
                }
            };
            s.status = CallStatus::Disconnected;
            s.duration_secs = 0;
            s.answered = false;
            s.reconciler = Default::default();
            Some((previous, notify, s.connection.take(), s.peer.clone()))
        });
        let Some((previous, notify, handle, peer)) = ended else {
            return false;
        };

        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
        let detached = handle.and_then(|handle| self.connections.detach(handle));
        if let Some(peer) = &peer {
            self.early.lock().discard(&peer.id);
        }

        match previous {
            CallStatus::Outgoing => self.emit(CallEvent::StopCue(AudioCue::Ringback)),
            CallStatus::Incoming => self.emit(CallEvent::StopCue(AudioCue::Ringtone)),
            _ => {}
        }
        if detached.is_some() {
            self.emit(CallEvent::RemoteAudioEnded);
        }
        self.emit(CallEvent::Ended { reason });
        info!(previous = %previous, reason = ?reason, "Call ended");

        self.schedule_decay(epoch);

        if notify {
            if let Some(peer) = &peer {
                self.send_signal(&peer.id, Signal::HangUp).await;
            }
        }
        if let Some(detached) = detached {
            detached.close().await;
        }
        true
    }

    /// `Disconnected -> Idle` after the grace period
    fn schedule_decay(self: &Arc<Self>, epoch: u64) {
        let inner = Arc::clone(self);
        let grace = self.config.disconnect_grace();

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let decayed = inner.update(|s| {
                if s.epoch == epoch && s.status == CallStatus::Disconnected {
                    s.reset_to_idle();
                    true
                } else {
                    false
                }
            });
            if decayed {
                debug!(user_id = %inner.local_id, "Call session back to idle");
            }
        });
    }

    fn start_ticker(self: &Arc<Self>, epoch: u64) {
        let inner = Arc::clone(self);
        let tick = self.config.duration_tick().max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let running = inner.update(|s| {
                    if s.epoch == epoch && s.status == CallStatus::Connected {
                        s.duration_secs += 1;
                        true
                    } else {
                        false
                    }
                });
                if !running {
                    break;
                }
            }
        });

        if let Some(previous) = self.ticker.lock().replace(task) {
            previous.abort();
        }
    }

    async fn run_inbound(self: Arc<Self>, mut subscription: SignalSubscription) {
        while let Some(record) = subscription.recv().await {
            let inbound = match record.decode() {
                Ok(inbound) => inbound,
                Err(e) => {
                    warn!(
                        record_id = %record.id,
                        sender_id = %record.sender_id,
                        signal_type = %record.signal_type,
                        error = %e,
                        "Dropping malformed signal"
                    );
                    continue;
                }
            };
            if inbound.sender_id == self.local_id {
                continue;
            }

            let sender_id = inbound.sender_id.clone();
            let kind = inbound.signal.kind();
            if let Err(e) = self.handle_signal(inbound).await {
                if e.is_stale() {
                    debug!(sender_id = %sender_id, signal_type = %kind, error = %e, "Signal outlived its call");
                } else {
                    warn!(sender_id = %sender_id, signal_type = %kind, error = %e, "Failed to handle signal");
                }
            }
        }
        warn!(user_id = %self.local_id, "Signal subscription closed");
    }

    async fn handle_signal(self: &Arc<Self>, inbound: InboundSignal) -> Result<()> {
        let InboundSignal {
            record_id,
            sender_id,
            signal,
        } = inbound;
        debug!(record_id = %record_id, sender_id = %sender_id, signal_type = %signal.kind(), "Signal received");

        match signal {
            Signal::Offer(offer) => self.on_offer(sender_id, offer).await,
            Signal::Answer(answer) => self.on_answer(&sender_id, answer).await,
            Signal::IceCandidate(candidate) => self.on_candidate(&sender_id, candidate).await,
            Signal::HangUp => {
                self.on_remote_hang_up(&sender_id).await;
                Ok(())
            }
        }
    }

    async fn reject_busy(&self, sender_id: &UserId) {
        self.early.lock().discard(sender_id);
        if self.config.reject_when_busy {
            info!(sender_id = %sender_id, "Rejecting offer while busy");
            self.send_signal(sender_id, Signal::HangUp).await;
        } else {
            info!(sender_id = %sender_id, "Ignoring offer while busy");
        }
    }

    /// `Idle -> Incoming`
    ///
    /// The call is surfaced only once the offer is in place on a fresh
    /// connection. Until then the session stays `Idle`, so a local action
    /// cannot observe a half-built incoming call.
    async fn on_offer(self: &Arc<Self>, sender_id: UserId, offer: SessionDescription) -> Result<()> {
        let (status, from_peer) = self.read(|s| (s.status, s.is_peer(&sender_id)));
        if status != CallStatus::Idle {
            if from_peer && status.is_active() {
                debug!(sender_id = %sender_id, "Duplicate offer from current peer ignored");
            } else {
                self.reject_busy(&sender_id).await;
            }
            return Ok(());
        }

        let Some(guard) = self.action.try_acquire() else {
            self.reject_busy(&sender_id).await;
            return Ok(());
        };

        let identity = match self.directory.lookup(&sender_id).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                info!(sender_id = %sender_id, "Dropping offer from unknown caller");
                self.early.lock().discard(&sender_id);
                return Ok(());
            }
            Err(e) => {
                warn!(sender_id = %sender_id, error = %e, "Identity lookup failed, dropping offer");
                self.early.lock().discard(&sender_id);
                return Ok(());
            }
        };

        let early = {
            let mut stash = self.early.lock();
            let mine = stash.take(&sender_id);
            stash.clear();
            mine
        };

        let trace_id = generate_trace_id();
        let span = call_span(&trace_id, &sender_id, "incoming");
        async {
            let early_candidates = early.len();
            let handle = match self.prepare_incoming(&sender_id, offer, early).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(error = %e, "Unusable offer, refusing call");
                    self.send_signal(&sender_id, Signal::HangUp).await;
                    return Err(e);
                }
            };

            let surfaced = self.update(|s| {
                (s.status == CallStatus::Idle).then(|| {
                    let epoch = s.begin(CallStatus::Incoming, identity.clone(), trace_id.clone());
                    s.connection = Some(handle);
                    s.reconciler = CandidateReconciler::remote_ready();
                    epoch
                })
            });
            drop(guard);

            if surfaced.is_none() {
                self.connections.teardown(handle).await;
                self.reject_busy(&sender_id).await;
                return Ok(());
            }

            info!(handle = %handle, early_candidates, "Incoming call");
            self.emit(CallEvent::IncomingCall(identity));
            self.emit(CallEvent::PlayCue(AudioCue::Ringtone));
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Create a connection for `sender_id` holding `offer` as its remote
    /// description, with `early` candidates applied
    ///
    /// The connection is torn down again on failure.
    async fn prepare_incoming(
        &self,
        sender_id: &UserId,
        offer: SessionDescription,
        early: Vec<IceCandidate>,
    ) -> Result<ConnectionHandle> {
        let handle = self.connections.create_connection(sender_id).await?;

        let ingested = async {
            let connection = self.connections.connection(handle)?;
            connection.set_remote_description(offer).await?;
            self.connections.ensure_live(handle)?;
            apply_candidates(&*connection, early).await?;
            Ok::<(), CallError>(())
        }
        .await;

        match ingested {
            Ok(()) => Ok(handle),
            Err(e) => {
                self.connections.teardown(handle).await;
                Err(e)
            }
        }
    }

    /// Answer to our offer; status stays `Outgoing` until the transport connects
    async fn on_answer(self: &Arc<Self>, sender_id: &UserId, answer: SessionDescription) -> Result<()> {
        let (status, from_peer, answered, epoch, handle) =
            self.read(|s| (s.status, s.is_peer(sender_id), s.answered, s.epoch, s.connection));
        if !from_peer || status != CallStatus::Outgoing || answered {
            debug!(sender_id = %sender_id, status = %status, "Ignoring answer outside an outgoing call");
            return Ok(());
        }
        let Some(handle) = handle else {
            debug!(sender_id = %sender_id, "Ignoring answer before the connection exists");
            return Ok(());
        };

        let connection = self.connections.connection(handle)?;
        let signaling = connection.signaling_state();
        if signaling != SignalingState::HaveLocalOffer {
            debug!(signaling = ?signaling, "Ignoring answer without a pending local offer");
            return Ok(());
        }

        let applied = async {
            connection.set_remote_description(answer).await?;
            self.connections.ensure_live(handle)?;

            let pending = self.update(|s| {
                if !s.is_current(epoch) || s.connection != Some(handle) {
                    return Err(CallError::Stale(format!("{handle} was torn down")));
                }
                s.answered = true;
                s.reconciler.flush()
            })?;
            apply_candidates(&*connection, pending).await?;
            Ok::<(), CallError>(())
        }
        .instrument(self.session_span())
        .await;

        match applied {
            Ok(()) => {
                info!(handle = %handle, "Answer applied, waiting for transport");
                Ok(())
            }
            Err(e) => Err(self
                .fail(epoch, Some(handle), EndReason::NegotiationFailed, PeerNotice::Always, e)
                .await),
        }
    }

    async fn on_candidate(&self, sender_id: &UserId, candidate: IceCandidate) -> Result<()> {
        let route = self.update(|s| {
            if s.status == CallStatus::Idle {
                CandidateRoute::Stash(candidate)
            } else if !s.status.is_active() || !s.is_peer(sender_id) {
                CandidateRoute::Ignore(s.status)
            } else {
                CandidateRoute::Reconcile(s.reconciler.offer(candidate), s.connection)
            }
        });

        match route {
            CandidateRoute::Stash(candidate) => {
                if !self.early.lock().stash(sender_id, candidate) {
                    debug!(sender_id = %sender_id, "Early candidate stash full, dropping candidate");
                }
                Ok(())
            }
            CandidateRoute::Ignore(status) => {
                debug!(sender_id = %sender_id, status = %status, "Ignoring candidate");
                Ok(())
            }
            CandidateRoute::Reconcile(Disposition::Buffered, _) => {
                debug!(sender_id = %sender_id, "Remote candidate buffered");
                Ok(())
            }
            CandidateRoute::Reconcile(Disposition::ApplyNow(candidate), Some(handle)) => {
                let connection = self.connections.connection(handle)?;
                apply_one(&*connection, candidate).await;
                Ok(())
            }
            CandidateRoute::Reconcile(Disposition::ApplyNow(_), None) => Err(CallError::Internal(
                "remote description applied without a connection".to_string(),
            )),
        }
    }

    async fn on_remote_hang_up(self: &Arc<Self>, sender_id: &UserId) {
        let (status, from_peer, epoch) = self.read(|s| (s.status, s.is_peer(sender_id), s.epoch));
        if !from_peer || !status.is_active() {
            self.early.lock().discard(sender_id);
            debug!(sender_id = %sender_id, status = %status, "Ignoring stale hang-up");
            return;
        }

        self.disconnect(epoch, EndReason::RemoteHangUp, PeerNotice::Never)
            .instrument(self.session_span())
            .await;
    }

    async fn run_connection_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<(ConnectionHandle, ConnectionEvent)>,
    ) {
        while let Some((handle, event)) = events.recv().await {
            if !self.connections.is_live(handle) {
                debug!(handle = %handle, "Event from a torn down connection ignored");
                continue;
            }
            match event {
                ConnectionEvent::StateChanged(state) => self.on_connection_state(handle, state).await,
                ConnectionEvent::RemoteTrack(track) => {
                    info!(handle = %handle, track_id = %track.id, kind = ?track.kind, "Remote track received");
                    self.emit(CallEvent::RemoteTrack(track));
                }
                // Sent to the peer by the connection pump
                ConnectionEvent::LocalCandidate(_) => {}
            }
        }
    }

    /// Transport confirmation is the only way into `Connected`
    async fn on_connection_state(self: &Arc<Self>, handle: ConnectionHandle, state: ConnectionState) {
        debug!(handle = %handle, state = ?state, "Connection state changed");

        if state == ConnectionState::Connected {
            let promoted = self.update(|s| {
                if s.connection == Some(handle)
                    && matches!(s.status, CallStatus::Outgoing | CallStatus::Incoming)
                {
                    let previous = s.status;
                    s.status = CallStatus::Connected;
                    s.duration_secs = 0;
                    Some((previous, s.epoch))
                } else {
                    None
                }
            });
            if let Some((previous, epoch)) = promoted {
                let cue = if previous == CallStatus::Outgoing {
                    AudioCue::Ringback
                } else {
                    AudioCue::Ringtone
                };
                self.emit(CallEvent::StopCue(cue));
                self.emit(CallEvent::Connected);
                self.start_ticker(epoch);
                info!(handle = %handle, "Call connected");
            }
        } else if state.is_terminal() {
            let epoch = self.read(|s| (s.connection == Some(handle)).then_some(s.epoch));
            if let Some(epoch) = epoch {
                self.disconnect(epoch, EndReason::ConnectionLost(state), PeerNotice::Never)
                    .instrument(self.session_span())
                    .await;
            }
        }
    }
}
