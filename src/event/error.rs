use std::fmt;

use thiserror::Error;

use super::wire::{ChannelId, EventId};

#[derive(Debug, Error)]
pub enum Error {
    /// No channel was registered when the request had to go out.
    #[error("no remote peer is connected")]
    NoPeerAvailable,
    /// A request was sent but no matching response was consumed.
    #[error("request {id} went unanswered: {reason}")]
    Unanswered { id: EventId, reason: Unanswered },
    #[error("outbound queue of channel {0} is full")]
    QueueFull(ChannelId),
    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    /// The peer answered, but with an error instead of a payload.
    #[error("remote peer failed the request: {0}")]
    Remote(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Why a pending request ended without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unanswered {
    /// The caller's context was cancelled.
    Cancelled,
    /// The configured request timeout elapsed.
    TimedOut,
    /// Every channel the request went to closed first.
    PeersGone,
}

impl fmt::Display for Unanswered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Unanswered::Cancelled => "cancelled",
            Unanswered::TimedOut => "timed out",
            Unanswered::PeersGone => "all target channels closed",
        })
    }
}

impl Error {
    pub fn is_no_peer(&self) -> bool {
        matches!(self, Error::NoPeerAvailable)
    }

    /// Returns the reason if this request was sent but never answered.
    pub fn unanswered(&self) -> Option<Unanswered> {
        match self {
            Error::Unanswered { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
