//! App Hub peer call negotiation
//!
//! This crate implements the one-to-one voice calling side channel of the
//! App Hub client. Two logged-in users negotiate a WebRTC connection through
//! a durable append-only signal log hosted by the backend.
//!
//! ## Architecture
//!
//! - **`CallController`**: negotiation state machine, single writer of the call status and peer
//! - **`ConnectionManager`**: owns the connection object and the local capture handle
//! - **`CandidateReconciler`**: buffers remote ICE candidates until the remote description is set
//! - **`SignalTransport`**: append/subscribe boundary to the signal log
//! - **`PresentationAdapter`**: turns state machine outputs into audio cue and playback calls
//!
//! ## Usage
//!
//! ```rust,ignore
//! use apphub_call::{CallController, CallDependencies, CallConfig};
//!
//! let controller = CallController::new(me, CallConfig::default(), deps);
//! controller.start().await?;
//! controller.initiate_call(bob).await?;
//! ```

pub mod config;
pub mod connection;
pub mod controller;
pub mod directory;
pub mod error;
pub mod logging;
pub mod media;
pub mod presenter;
pub mod reconciler;
pub mod rtc;
pub mod session;
pub mod signal;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::{AppConfig, CallConfig, LoggingConfig, TransportConfig, WebRtcConfig};
pub use connection::{
    ConnectionEvent, ConnectionFactory, ConnectionHandle, ConnectionManager, PeerConnection,
};
pub use controller::{CallController, CallDependencies};
pub use directory::{IdentityDirectory, StaticDirectory};
pub use error::{CallError, Result};
pub use media::{CaptureTrack, LocalMedia, MediaDevices, RemoteTrack};
pub use presenter::{
    AudioCue, CallAction, CallCapsule, CallEvent, CueSink, EndReason, LoggingSinks,
    PlaybackSink, PresentationAdapter,
};
pub use reconciler::CandidateReconciler;
pub use session::{CallSnapshot, CallStatus};
pub use signal::{InboundSignal, OutboundSignal, Signal, SignalKind, SignalRecord};
pub use transport::{InMemorySignalLog, RetryingTransport, SignalSubscription, SignalTransport};
pub use types::{
    ConnectionState, IceCandidate, PeerIdentity, SdpType, SessionDescription, SignalingState,
    TrackKind, UserId,
};
