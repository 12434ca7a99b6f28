//! The audio-spying subsystem: per-call backend subscriptions, per-spectator
//! browser sessions, and the service that coordinates both.

mod service;
mod session;
mod source;

pub use service::{SpyOffer, SpyService};
pub use session::SpySession;
pub use source::SpySource;

use crate::engine::EngineError;
use rtpscope_protocol::NgError;

/// The two legs of the spied call. Every source carries one backend
/// subscription and every session one outbound track per leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    From,
    To,
}

impl Leg {
    pub const BOTH: [Leg; 2] = [Leg::From, Leg::To];

    pub fn label(self) -> &'static str {
        match self {
            Leg::From => "from",
            Leg::To => "to",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Leg::From => 0,
            Leg::To => 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpyError {
    #[error("call has fewer than two legs")]
    NotEnoughTags,
    #[error("no such spy session")]
    SessionNotFound,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("local description unavailable after ICE gathering")]
    MissingLocalDescription,
}

impl From<NgError> for SpyError {
    fn from(err: NgError) -> Self {
        SpyError::Engine(err.into())
    }
}
