//! Error types for the media session engine.

use crate::ids::{RequestId, SessionId, SourceId};
use thiserror::Error;

/// The workspace-wide error type.
///
/// Each variant corresponds 1:1 to one of the seven error kinds of the
/// error-handling design: `InvalidState`, `UnknownId`, `Capacity`,
/// `BadArgument`, `ShmExhausted`, `PipelineFailure`, `StaleHaveData`.
///
/// # Examples
///
/// ```
/// use rialto_shared_types::{RialtoError, SessionId};
///
/// let err = RialtoError::UnknownSession(SessionId::from_raw(7));
/// assert_eq!(err.to_string(), "unknown session id: 7");
/// ```
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RialtoError {
    /// Operation is not allowed in the current session or server state.
    #[error("invalid state for this operation: {0}")]
    InvalidState(String),

    /// `sessionId` was not found in `PlaybackService`'s registry.
    #[error("unknown session id: {0}")]
    UnknownSession(SessionId),

    /// `sourceId` was not found on the addressed session.
    #[error("unknown source id: {0}")]
    UnknownSource(SourceId),

    /// A referenced web-audio/media-keys/control handle was not found.
    #[error("unknown handle: {0}")]
    UnknownHandle(i32),

    /// `maxPlaybacks` or `maxWebAudio` would be exceeded.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Malformed configuration, unsupported mime type, or bad DRM header.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// A segment did not fit the designated shared-memory slot.
    #[error("shared-memory slot exhausted")]
    ShmExhausted,

    /// The streaming-media framework reported a failure.
    #[error("pipeline failure: {0}")]
    PipelineFailure(String),

    /// `haveData` arrived with a `requestId` that does not match the
    /// outstanding `NeedData` for its source.
    #[error("stale haveData for source {source}: expected request {expected}, got {got}")]
    StaleHaveData {
        /// The source the stale reply targeted.
        source: SourceId,
        /// The request id the session is actually waiting on.
        expected: RequestId,
        /// The request id the client sent.
        got: RequestId,
    },
}

/// Result type used throughout the workspace.
pub type RialtoResult<T> = Result<T, RialtoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_have_data_message_names_both_ids() {
        let err = RialtoError::StaleHaveData {
            source: SourceId::from_raw(1),
            expected: RequestId::from_raw(4),
            got: RequestId::from_raw(3),
        };
        let msg = err.to_string();
        assert!(msg.contains("expected request 4"));
        assert!(msg.contains("got 3"));
    }
}
