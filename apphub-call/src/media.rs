//! Local capture and remote media handles

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::types::TrackKind;

/// One live capture track
pub trait CaptureTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    /// Release the device; must be safe to call more than once
    fn stop(&self);

    fn is_live(&self) -> bool;

    /// Lets a connection backend recover its concrete track type
    fn as_any(&self) -> &dyn Any;
}

/// Exclusive handle on the local capture device
///
/// Every track is stopped when the handle is dropped.
#[derive(Debug)]
pub struct LocalMedia {
    tracks: Vec<Arc<dyn CaptureTrack>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn CaptureTrack>>) -> Self {
        Self { tracks }
    }

    #[must_use]
    pub fn tracks(&self) -> &[Arc<dyn CaptureTrack>] {
        &self.tracks
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|track| track.is_live())
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
        debug!(tracks = self.tracks.len(), "Local media released");
    }
}

/// Capture device access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the microphone; fails when the device is denied or missing
    async fn acquire_audio(&self) -> Result<LocalMedia>;
}

/// Track received from the peer, handed to the playback sink
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
    source: Option<Arc<dyn Any + Send + Sync>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            source: None,
        }
    }

    /// Attach the backend's own track object for sinks that know its type
    #[must_use]
    pub fn with_source<T: Any + Send + Sync>(mut self, source: Arc<T>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn source<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.source.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}
