//! Shared types for the Rialto media session engine.
//!
//! This crate has no behaviour of its own: it is the vocabulary every other
//! `rialto-*` crate talks in — ids, the session/source data model, the
//! client-bound event set, and the workspace-wide error type.

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod error;
mod events;
mod ids;
mod media;

pub use error::{RialtoError, RialtoResult};
pub use events::{ApplicationState, ClientEvent, NetworkState, PlaybackState, SessionStats};
pub use ids::{ControlHandle, IdGenerator, PingId, RequestId, SessionId, SourceId, WebAudioHandle};
pub use media::{
    AppSrcHandle, Caps, CipherMode, EncryptionPattern, MediaSegment, MediaType, NeedDataRequest,
    ShmSlot, SourceRecord, SourceType, SubSample,
};
