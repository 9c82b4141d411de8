//! Error types for the HTTP exchange adapter.
//!
//! # Design
//! `InvalidRequest` covers everything rejected before the substrate sees a
//! single byte. `Transport` covers everything after that point and records
//! the exchange state it interrupted, so a failure reads as
//! "failed while streaming the body" rather than a bare substrate message.
//! End of an incoming body is not an error at all; it is
//! `StreamError::Closed` at the substrate seam and never reaches callers.

use std::fmt;

/// Where an exchange is in its lifecycle.
///
/// `Sending` and `Waiting` run concurrently; an exchange is in both until
/// each branch finishes, and reaches `BothDone` only after both have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Sending,
    Waiting,
    BothDone,
    HeadersReceived,
    StreamingBody,
    Complete,
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExchangeState::Idle => "preparing the request",
            ExchangeState::Sending => "sending the request body",
            ExchangeState::Waiting => "waiting for the response",
            ExchangeState::BothDone => "opening the response",
            ExchangeState::HeadersReceived => "reading response headers",
            ExchangeState::StreamingBody => "streaming the response body",
            ExchangeState::Complete => "completing the exchange",
        };
        f.write_str(label)
    }
}

/// Errors returned by [`crate::send`] and [`crate::send_async`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// The request could not be turned into substrate primitives. No I/O
    /// has happened.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The exchange failed after it was submitted.
    #[error("transport error while {state}: {message}")]
    Transport {
        state: ExchangeState,
        message: String,
    },

    /// The exchange future is pending but left nothing to poll, so no
    /// readiness event can ever resume it.
    #[error("poll loop stalled: task is pending with nothing to poll")]
    Stalled,

    /// `send` was called from inside a running poll loop.
    #[error("poll loop re-entered: send() called while an exchange is already being driven on this thread")]
    Reentered,
}

impl ExchangeError {
    pub(crate) fn transport(state: ExchangeState, message: impl Into<String>) -> Self {
        ExchangeError::Transport {
            state,
            message: message.into(),
        }
    }
}
