//! Signal records and their typed payloads
//!
//! The backend stores every signal as a row of `{sender_id, receiver_id,
//! signal_type, payload}`. Payloads are decoded once, here, into [`Signal`]
//! before anything reaches the state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CallError, Result};
use crate::types::{IceCandidate, SdpType, SessionDescription, UserId};

/// Signal type tag as stored in the `signal_type` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    HangUp,
}

impl SignalKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::HangUp => "hang-up",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "offer" => Ok(Self::Offer),
            "answer" => Ok(Self::Answer),
            "ice-candidate" => Ok(Self::IceCandidate),
            "hang-up" => Ok(Self::HangUp),
            other => Err(CallError::Protocol(format!("unknown signal type: {other}"))),
        }
    }
}

/// Strongly typed signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    HangUp,
}

#[derive(Serialize, Deserialize)]
struct OfferPayload {
    offer: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct AnswerPayload {
    answer: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct CandidatePayload {
    candidate: IceCandidate,
}

impl Signal {
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match self {
            Self::Offer(_) => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
            Self::HangUp => SignalKind::HangUp,
        }
    }

    /// Encode into the opaque payload bag stored by the backend
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::Offer(offer) => serde_json::to_value(OfferPayload {
                offer: offer.clone(),
            })?,
            Self::Answer(answer) => serde_json::to_value(AnswerPayload {
                answer: answer.clone(),
            })?,
            Self::IceCandidate(candidate) => serde_json::to_value(CandidatePayload {
                candidate: candidate.clone(),
            })?,
            Self::HangUp => serde_json::json!({}),
        };
        Ok(value)
    }

    /// Decode a payload bag for the given tag
    pub fn decode(kind: SignalKind, payload: &serde_json::Value) -> Result<Self> {
        match kind {
            SignalKind::Offer => {
                let OfferPayload { offer } = serde_json::from_value(payload.clone())?;
                expect_sdp_type(&offer, SdpType::Offer)?;
                Ok(Self::Offer(offer))
            }
            SignalKind::Answer => {
                let AnswerPayload { answer } = serde_json::from_value(payload.clone())?;
                expect_sdp_type(&answer, SdpType::Answer)?;
                Ok(Self::Answer(answer))
            }
            SignalKind::IceCandidate => {
                let CandidatePayload { candidate } = serde_json::from_value(payload.clone())?;
                if candidate.candidate.trim().is_empty() {
                    return Err(CallError::Protocol("empty ICE candidate".to_string()));
                }
                Ok(Self::IceCandidate(candidate))
            }
            SignalKind::HangUp => Ok(Self::HangUp),
        }
    }
}

fn expect_sdp_type(desc: &SessionDescription, expected: SdpType) -> Result<()> {
    if desc.sdp_type == expected {
        Ok(())
    } else {
        Err(CallError::Protocol(format!(
            "expected {} description, got {}",
            expected.as_str(),
            desc.sdp_type.as_str()
        )))
    }
}

/// Row of the durable signal log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub signal_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SignalRecord {
    /// Decode the row into a typed inbound signal
    pub fn decode(&self) -> Result<InboundSignal> {
        let kind: SignalKind = self.signal_type.parse()?;
        let signal = Signal::decode(kind, &self.payload)?;
        Ok(InboundSignal {
            record_id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            signal,
        })
    }
}

/// Decoded signal delivered to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    pub record_id: String,
    pub sender_id: UserId,
    pub signal: Signal,
}

/// Signal to append to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSignal {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub signal: Signal,
}

impl OutboundSignal {
    pub fn new(sender_id: UserId, receiver_id: UserId, signal: Signal) -> Self {
        Self {
            sender_id,
            receiver_id,
            signal,
        }
    }

    /// Materialize the row the backend would store
    pub fn into_record(self) -> Result<SignalRecord> {
        Ok(SignalRecord {
            id: nanoid::nanoid!(12),
            signal_type: self.signal.kind().as_str().to_string(),
            payload: self.signal.to_payload()?,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            created_at: Utc::now(),
        })
    }
}
