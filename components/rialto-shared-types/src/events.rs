//! Client-bound event types and the playback/network state enums they
//! carry.

use crate::ids::{ControlHandle, PingId, RequestId, SessionId, SourceId};
use crate::media::ShmSlot;

/// Coarse playback state surfaced to the client.
///
/// Modeled as an explicit enum with no leakage of the streaming-media
/// framework's own internal state values across the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    /// No media loaded, or freshly created.
    Idle,
    /// Actively playing.
    Playing,
    /// Paused.
    Paused,
    /// A flushing seek is in flight.
    Seeking,
    /// The flushing seek completed successfully.
    SeekDone,
    /// Stopped; pipeline torn down on the next MainThread tick.
    Stopped,
    /// End of stream reached.
    EndOfStream,
    /// Unrecoverable pipeline failure; terminal until `stop`+`destroy`.
    Failure,
}

/// Buffering/network state surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkState {
    /// Not yet known.
    Unknown,
    /// No source loaded.
    Idle,
    /// Waiting for the first data of every attached source.
    Buffering,
    /// Buffering progress update.
    BufferingProgress,
    /// First frame of every attached source has been pushed.
    Buffered,
    /// Ran out of buffered data mid-playback.
    Stalled,
    /// The source format could not be parsed.
    FormatError,
    /// A network-layer failure occurred upstream of this engine.
    NetworkError,
    /// A decode-layer failure was reported.
    DecodeError,
}

/// Application (server) lifecycle state, as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationState {
    /// Server is ACTIVE and accepting session work.
    Running,
    /// Server is INACTIVE.
    Inactive,
    /// Transient/unrecognized state.
    Unknown,
}

/// Per-session playback statistics (`getStats`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames dropped by the pipeline (qos events).
    pub dropped_frames: u64,
    /// Frames successfully rendered (pushed have-data frames).
    pub rendered_frames: u64,
}

/// One message pushed to a registered client.
///
/// Dispatch always goes through a weak reference to the client endpoint
/// (see design notes); a dead endpoint causes the event to be dropped
/// silently rather than failing the originating operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The session's playback state changed.
    PlaybackStateChange {
        /// Session this event targets.
        session_id: SessionId,
        /// The new state.
        state: PlaybackState,
    },
    /// The session's network state changed.
    NetworkStateChange {
        /// Session this event targets.
        session_id: SessionId,
        /// The new state.
        state: NetworkState,
    },
    /// Periodic position report while playing.
    PositionChange {
        /// Session this event targets.
        session_id: SessionId,
        /// Current position, nanoseconds.
        position_ns: i64,
    },
    /// The pipeline is hungry for a source; the client must write a slot
    /// and reply with `haveData`.
    NeedMediaData {
        /// Session this event targets.
        session_id: SessionId,
        /// Source that needs data.
        source_id: SourceId,
        /// How many frames the client may write.
        frame_count: u32,
        /// The request id the matching `haveData` must echo.
        request_id: RequestId,
        /// The slot designated for this round.
        shm_slot: ShmSlot,
    },
    /// A sink signalled underflow for a source.
    BufferUnderflow {
        /// Session this event targets.
        session_id: SessionId,
        /// Source that underflowed.
        source_id: SourceId,
    },
    /// Quality-of-service report from the pipeline bus.
    Qos {
        /// Session this event targets.
        session_id: SessionId,
        /// Source this report is about.
        source_id: SourceId,
        /// Frames dropped since the last report.
        dropped: u64,
    },
    /// A non-fatal playback error was observed.
    PlaybackError {
        /// Session this event targets.
        session_id: SessionId,
        /// Source this error is about, if source-specific.
        source_id: Option<SourceId>,
        /// Human-readable detail.
        message: String,
    },
    /// A `flush` completed.
    SourceFlushed {
        /// Session this event targets.
        session_id: SessionId,
        /// Source that was flushed.
        source_id: SourceId,
    },
    /// Server-wide lifecycle transition.
    ApplicationStateChange {
        /// The new application state.
        state: ApplicationState,
    },
    /// Healthcheck request fanned out to a registered client.
    Ping {
        /// The client's registration handle.
        control_handle: ControlHandle,
        /// The ping id to echo back in the eventual `Ack`.
        id: PingId,
    },
    /// Healthcheck acknowledgement delivered to the host manager.
    Ack {
        /// The ping id this acknowledges.
        id: PingId,
        /// False if any fanned-out handler reported an error.
        success: bool,
    },
}
