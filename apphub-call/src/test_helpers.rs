//! Fakes shared by the unit and scenario tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

use crate::config::CallConfig;
use crate::connection::{ConnectionEvent, ConnectionFactory, PeerConnection};
use crate::controller::{CallController, CallDependencies};
use crate::directory::StaticDirectory;
use crate::error::{CallError, Result};
use crate::media::{CaptureTrack, LocalMedia, MediaDevices, RemoteTrack};
use crate::session::{CallSnapshot, CallStatus};
use crate::transport::InMemorySignalLog;
use crate::types::{
    ConnectionState, IceCandidate, PeerIdentity, SdpType, SessionDescription, SignalingState,
    TrackKind, UserId,
};

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    live: AtomicBool,
}

impl FakeTrack {
    pub fn audio(id: &str) -> Self {
        Self {
            id: id.to_string(),
            live: AtomicBool::new(true),
        }
    }
}

impl CaptureTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct FakeState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    tracks: Vec<String>,
}

/// In-memory connection following the offer/answer state rules
pub struct FakeConnection {
    id: usize,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Mutex<FakeState>,
    closes: AtomicUsize,
}

impl FakeConnection {
    pub fn new(id: usize, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            id,
            events,
            state: Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                applied: Vec::new(),
                tracks: Vec::new(),
            }),
            closes: AtomicUsize::new(0),
        }
    }

    /// Connection whose events go nowhere
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(0, tx)
    }

    pub fn emit_state(&self, state: ConnectionState) {
        let _ = self.events.send(ConnectionEvent::StateChanged(state));
    }

    pub fn emit_candidate(&self, candidate: &str) {
        let _ = self
            .events
            .send(ConnectionEvent::LocalCandidate(IceCandidate::new(candidate)));
    }

    pub fn emit_remote_track(&self, id: &str) {
        let track = RemoteTrack::new(id, TrackKind::Audio, format!("stream-{}", self.id));
        let _ = self.events.send(ConnectionEvent::RemoteTrack(track));
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.state.lock().tracks.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.state.lock().signaling == SignalingState::Closed {
            Err(CallError::Connection("connection closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        Ok(SessionDescription::offer(format!("v=0 fake-offer-{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        if self.state.lock().signaling != SignalingState::HaveRemoteOffer {
            return Err(CallError::Connection("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(format!("v=0 fake-answer-{}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        state.signaling = match (desc.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (sdp_type, signaling) => {
                return Err(CallError::Connection(format!(
                    "cannot set local {} in {signaling:?}",
                    sdp_type.as_str()
                )))
            }
        };
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if desc.sdp.contains("reject") {
            return Err(CallError::Connection("unsupported description".to_string()));
        }
        let mut state = self.state.lock();
        state.signaling = match (desc.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (sdp_type, signaling) => {
                return Err(CallError::Connection(format!(
                    "cannot set remote {} in {signaling:?}",
                    sdp_type.as_str()
                )))
            }
        };
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(CallError::Connection("remote description not set".to_string()));
        }
        if candidate.candidate.contains("bad") {
            return Err(CallError::Connection("malformed candidate".to_string()));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn add_track(&self, track: Arc<dyn CaptureTrack>) -> Result<()> {
        self.check_open()?;
        self.state.lock().tracks.push(track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.state.lock().signaling = SignalingState::Closed;
        Ok(())
    }
}

/// Factory recording every connection it creates, optionally waiting for
/// a permit before each one
#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<Arc<FakeConnection>>>,
    gate: Option<Arc<Notify>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Option<Arc<FakeConnection>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let mut created = self.created.lock();
        let connection = Arc::new(FakeConnection::new(created.len() + 1, events));
        created.push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// Microphone that works, fails, or waits for a permit
pub struct FakeDevices {
    fail: bool,
    gate: Option<Arc<Notify>>,
    acquisitions: AtomicUsize,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeDevices {
    pub fn working() -> Self {
        Self {
            fail: false,
            gate: None,
            acquisitions: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::working()
        }
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::working()
        }
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire_audio(&self) -> Result<LocalMedia> {
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(CallError::Device("permission denied".to_string()));
        }
        let track = Arc::new(FakeTrack::audio(&format!("mic-{n}")));
        self.tracks.lock().push(Arc::clone(&track));
        Ok(LocalMedia::new(vec![track]))
    }
}

pub fn test_config() -> CallConfig {
    CallConfig::default()
}

/// One participant wired to fakes
pub struct Party {
    pub id: UserId,
    pub controller: CallController,
    pub factory: Arc<FakeFactory>,
    pub devices: Arc<FakeDevices>,
}

impl Party {
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.id.clone(), self.id.as_str())
    }

    pub fn connection(&self) -> Arc<FakeConnection> {
        self.factory.last().expect("no connection created")
    }

    pub fn status(&self) -> CallStatus {
        self.controller.snapshot().status
    }
}

pub async fn party(
    log: &Arc<InMemorySignalLog>,
    directory: &Arc<StaticDirectory>,
    id: &str,
    devices: FakeDevices,
) -> Party {
    party_with(log, directory, id, devices, FakeFactory::new()).await
}

pub async fn party_with(
    log: &Arc<InMemorySignalLog>,
    directory: &Arc<StaticDirectory>,
    id: &str,
    devices: FakeDevices,
    factory: FakeFactory,
) -> Party {
    let factory = Arc::new(factory);
    let devices = Arc::new(devices);
    let controller = CallController::new(
        UserId::from(id),
        test_config(),
        CallDependencies {
            transport: log.clone(),
            directory: directory.clone(),
            devices: devices.clone(),
            connections: factory.clone(),
        },
    );
    controller.start().await.expect("controller start");

    Party {
        id: UserId::from(id),
        controller,
        factory,
        devices,
    }
}

/// Shared log and a directory knowing alice, bob and carol
pub fn backend() -> (Arc<InMemorySignalLog>, Arc<StaticDirectory>) {
    let directory = StaticDirectory::with_identities([
        PeerIdentity::new("alice", "alice").with_full_name("Alice Liddell"),
        PeerIdentity::new("bob", "bob"),
        PeerIdentity::new("carol", "carol"),
    ]);
    (Arc::new(InMemorySignalLog::default()), Arc::new(directory))
}

pub async fn wait_for(
    rx: &mut watch::Receiver<CallSnapshot>,
    pred: impl FnMut(&CallSnapshot) -> bool,
) -> CallSnapshot {
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(pred))
        .await
        .expect("timed out waiting for call snapshot")
        .expect("controller dropped")
        .clone()
}

pub async fn wait_for_status(party: &Party, status: CallStatus) -> CallSnapshot {
    let mut rx = party.controller.watch();
    wait_for(&mut rx, |snapshot| snapshot.status == status).await
}

/// Let spawned tasks run until they block
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
