//! WebRTC backend
//!
//! [`WebRtcConnectionFactory`] builds `RTCPeerConnection`s with Opus audio
//! and the configured STUN/TURN servers. [`WebRtcAudioDevices`] stands in for
//! the microphone with an Opus sample track fed with silence frames.

use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::WebRtcConfig;
use crate::connection::{ConnectionEvent, ConnectionFactory, PeerConnection};
use crate::error::{CallError, Result};
use crate::media::{CaptureTrack, LocalMedia, MediaDevices, RemoteTrack};
use crate::types::{ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState, TrackKind};

/// 20ms Opus frame duration
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Opus DTX silence frame
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

impl From<RTCSignalingState> for SignalingState {
    fn from(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::Unspecified | RTCSignalingState::Stable => Self::Stable,
            RTCSignalingState::HaveLocalOffer => Self::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => Self::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => Self::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => Self::HaveRemotePranswer,
            RTCSignalingState::Closed => Self::Closed,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            return Err(CallError::Connection(
                "rollback descriptions are not supported".to_string(),
            ))
        }
    };
    Ok(rtc)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(CallError::Connection(
                "unspecified session description type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

/// Builds one `RTCPeerConnection` per call
pub struct WebRtcConnectionFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnectionFactory {
    #[must_use]
    pub fn new(config: &WebRtcConfig) -> Self {
        let mut ice_servers = Vec::new();
        if !config.stun_servers.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: config.stun_servers.clone(),
                ..Default::default()
            });
        }
        if let Some(turn) = &config.turn {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.server_url.clone()],
                username: turn.username.clone(),
                credential: turn.password.clone(),
                ..Default::default()
            });
        }
        Self { ice_servers }
    }

    async fn new_peer_connection(&self) -> Result<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        Ok(api.new_peer_connection(config).await?)
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let pc = Arc::new(self.new_peer_connection().await?);

        let candidates_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidates_tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(ConnectionEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let state_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(state = %state, "Peer connection state changed");
            let _ = state_tx.send(ConnectionEvent::StateChanged(state.into()));
            Box::pin(async {})
        }));

        let track_tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let remote = RemoteTrack::new(track.id(), TrackKind::from(track.kind()), track.stream_id())
                    .with_source(Arc::clone(&track));
                let _ = track_tx.send(ConnectionEvent::RemoteTrack(remote));
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(WebRtcConnection { pc }))
    }
}

/// `PeerConnection` over webrtc-rs
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state().into()
    }

    async fn add_track(&self, track: Arc<dyn CaptureTrack>) -> Result<()> {
        let opus = track
            .as_any()
            .downcast_ref::<OpusCaptureTrack>()
            .ok_or_else(|| CallError::Device(format!("unsupported capture track {}", track.id())))?;

        let sender = self
            .pc
            .add_track(Arc::clone(&opus.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Interceptors only run while RTCP is being read
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Local Opus track written with encoded frames
pub struct OpusCaptureTrack {
    track: Arc<TrackLocalStaticSample>,
    live: AtomicBool,
}

impl OpusCaptureTrack {
    #[must_use]
    pub fn new(stream_id: impl Into<String>) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id.into(),
        );
        Self {
            track: Arc::new(track),
            live: AtomicBool::new(true),
        }
    }

    /// Write one encoded Opus frame; a no-op until the track is bound
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<()> {
        if !self.is_live() {
            return Err(CallError::Device("capture track stopped".to_string()));
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

impl fmt::Debug for OpusCaptureTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpusCaptureTrack")
            .field("id", &self.track.id())
            .field("stream_id", &self.track.stream_id())
            .field("live", &self.is_live())
            .finish()
    }
}

impl CaptureTrack for OpusCaptureTrack {
    fn id(&self) -> &str {
        self.track.id()
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capture device producing Opus silence
///
/// Lets two processes negotiate a real audio path without a sound card.
#[derive(Debug, Default)]
pub struct WebRtcAudioDevices;

#[async_trait]
impl MediaDevices for WebRtcAudioDevices {
    async fn acquire_audio(&self) -> Result<LocalMedia> {
        let track = Arc::new(OpusCaptureTrack::new(format!("apphub-{}", nanoid::nanoid!(8))));

        let feeder = Arc::clone(&track);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_DURATION);
            while feeder.is_live() {
                ticker.tick().await;
                if let Err(e) = feeder
                    .write_frame(Bytes::from_static(&OPUS_SILENCE), FRAME_DURATION)
                    .await
                {
                    debug!(error = %e, "Silence feeder stopped");
                    break;
                }
            }
        });

        Ok(LocalMedia::new(vec![track]))
    }
}
