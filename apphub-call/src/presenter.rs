//! Presentation adapter
//!
//! The controller never touches a playback API. It emits [`CallEvent`]s and a
//! thin adapter task turns them into calls on two sinks: one for the
//! ringtone/ringback cue, one for remote audio playback.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::media::RemoteTrack;
use crate::session::{CallSnapshot, CallStatus};
use crate::types::{ConnectionState, PeerIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCue {
    /// Heard by the caller while the peer is alerted
    Ringback,
    /// Heard by the callee
    Ringtone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "state")]
pub enum EndReason {
    LocalHangUp,
    RemoteHangUp,
    ConnectionLost(ConnectionState),
    DeviceUnavailable,
    NegotiationFailed,
}

/// Output actions of the state machine
#[derive(Debug, Clone)]
pub enum CallEvent {
    PlayCue(AudioCue),
    StopCue(AudioCue),
    IncomingCall(PeerIdentity),
    Connected,
    RemoteTrack(RemoteTrack),
    RemoteAudioEnded,
    Ended { reason: EndReason },
}

/// Ringtone/ringback output
#[async_trait]
pub trait CueSink: Send + Sync {
    async fn play(&self, cue: AudioCue);

    async fn stop(&self, cue: AudioCue);
}

/// Remote audio output
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    async fn attach(&self, track: RemoteTrack);

    async fn detach(&self);
}

pub struct PresentationAdapter;

impl PresentationAdapter {
    /// Drive the sinks from a controller event stream until it closes
    pub fn spawn(
        mut events: broadcast::Receiver<CallEvent>,
        cues: Arc<dyn CueSink>,
        playback: Arc<dyn PlaybackSink>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => Self::dispatch(event, &*cues, &*playback).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Presentation adapter lagged behind call events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Presentation adapter stopped");
        })
    }

    async fn dispatch(event: CallEvent, cues: &dyn CueSink, playback: &dyn PlaybackSink) {
        match event {
            CallEvent::PlayCue(cue) => cues.play(cue).await,
            CallEvent::StopCue(cue) => cues.stop(cue).await,
            CallEvent::RemoteTrack(track) => playback.attach(track).await,
            CallEvent::RemoteAudioEnded => playback.detach().await,
            CallEvent::IncomingCall(_) | CallEvent::Connected | CallEvent::Ended { .. } => {}
        }
    }
}

/// Sinks that only log, for headless runs
#[derive(Debug, Default)]
pub struct LoggingSinks;

#[async_trait]
impl CueSink for LoggingSinks {
    async fn play(&self, cue: AudioCue) {
        info!(cue = ?cue, "Cue playing");
    }

    async fn stop(&self, cue: AudioCue) {
        info!(cue = ?cue, "Cue stopped");
    }
}

#[async_trait]
impl PlaybackSink for LoggingSinks {
    async fn attach(&self, track: RemoteTrack) {
        info!(track_id = %track.id, stream_id = %track.stream_id, "Remote audio attached");
    }

    async fn detach(&self) {
        info!("Remote audio detached");
    }
}

/// Action buttons shown on the capsule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallAction {
    Answer,
    Decline,
    HangUp,
}

/// Compact call status surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallCapsule {
    pub title: String,
    pub subtitle: String,
    pub avatar_url: Option<String>,
    pub actions: Vec<CallAction>,
}

impl CallCapsule {
    /// `None` while idle, when nothing is shown
    #[must_use]
    pub fn from_snapshot(snapshot: &CallSnapshot) -> Option<Self> {
        if snapshot.status == CallStatus::Idle {
            return None;
        }

        let (title, avatar_url) = snapshot.peer.as_ref().map_or_else(
            || ("Unknown".to_string(), None),
            |peer| (peer.display_name().to_string(), peer.avatar_url.clone()),
        );

        let (subtitle, actions) = match snapshot.status {
            CallStatus::Outgoing => ("Calling…".to_string(), vec![CallAction::HangUp]),
            CallStatus::Incoming if snapshot.answered => {
                ("Connecting…".to_string(), vec![CallAction::HangUp])
            }
            CallStatus::Incoming => (
                "Incoming call".to_string(),
                vec![CallAction::Answer, CallAction::Decline],
            ),
            CallStatus::Connected => (format_duration(snapshot.duration_secs), vec![CallAction::HangUp]),
            CallStatus::Disconnected => ("Call ended".to_string(), Vec::new()),
            CallStatus::Idle => return None,
        };

        Some(Self {
            title,
            subtitle,
            avatar_url,
            actions,
        })
    }
}

/// `mm:ss`, or `h:mm:ss` past the hour
#[must_use]
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}
