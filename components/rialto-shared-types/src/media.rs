//! The session/source data model.

use crate::ids::{RequestId, SourceId};

/// The kind of media a source carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    /// Audio elementary stream.
    Audio,
    /// Video elementary stream.
    Video,
    /// Subtitle/text stream.
    Subtitle,
}

/// The only session type the data model names. Reserved for future
/// extension the way the original source reserves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MediaType {
    /// Media Source Extensions-style session.
    #[default]
    Mse,
}

/// Codec-specific stream attributes carried by `attachSource`.
///
/// Represented as a closed struct of optional fields rather than an open
/// map: the set of attributes a caps negotiation actually uses is fixed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Caps {
    /// MIME type, e.g. `"audio/mpeg"`.
    pub mime_type: String,
    /// Sample rate in Hz, for audio sources.
    pub sample_rate: Option<u32>,
    /// Channel count, for audio sources.
    pub channels: Option<u16>,
    /// Frame width in pixels, for video sources.
    pub width: Option<u32>,
    /// Frame height in pixels, for video sources.
    pub height: Option<u32>,
    /// Frame rate, for video sources.
    pub frame_rate: Option<f32>,
    /// Out-of-band codec-private data (e.g. `avcC`, codec init segment).
    pub codec_data: Option<Vec<u8>>,
}

/// CENC cipher mode for an encrypted segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMode {
    /// AES-CTR ("cenc").
    Cenc,
    /// AES-CBC ("cbcs").
    Cbcs,
}

/// Pattern encryption (`{crypt, skip}` block counts) for `cbcs`/`cbc1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EncryptionPattern {
    /// Number of 16-byte blocks encrypted.
    pub crypt: u32,
    /// Number of 16-byte blocks left in the clear.
    pub skip: u32,
}

/// One CENC subsample: a clear run followed by an encrypted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubSample {
    /// Bytes of clear data preceding the encrypted run.
    pub clear_bytes: u16,
    /// Bytes of encrypted data following the clear run.
    pub encrypted_bytes: u32,
}

/// A single encoded media segment as written by the client and decoded by
/// `FrameReader` from shared memory.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    /// The source this segment belongs to.
    pub source_id: SourceId,
    /// Presentation timestamp, nanoseconds.
    pub timestamp_ns: i64,
    /// Sample duration, nanoseconds.
    pub duration_ns: i64,
    /// Offset of the payload within the shared-memory slot.
    pub data_offset: u32,
    /// Length of the payload in bytes.
    pub data_length: u32,
    /// Whether this segment is DRM-encrypted.
    pub is_encrypted: bool,
    /// Key id for the decryptor, present when `is_encrypted`.
    pub key_id: Vec<u8>,
    /// Initialization vector, present when `is_encrypted`.
    pub init_vector: Vec<u8>,
    /// CENC subsample map, present when `is_encrypted`.
    pub sub_samples: Vec<SubSample>,
    /// The DRM session this segment is scoped to.
    pub media_key_session_id: Option<String>,
    /// Whether the IV should be derived from the last 15 bytes (legacy CENC
    /// quirk some streams rely on).
    pub init_with_last15: bool,
    /// Cipher mode, present when `is_encrypted`.
    pub cipher_mode: Option<CipherMode>,
    /// Pattern encryption parameters, present for `cbcs`.
    pub encryption_pattern: Option<EncryptionPattern>,
    /// Audio clipping start, nanoseconds (audio sources only).
    pub clipping_start_ns: Option<i64>,
    /// Audio clipping end, nanoseconds (audio sources only).
    pub clipping_end_ns: Option<i64>,
    /// Frame width in pixels (video sources only).
    pub width: Option<u32>,
    /// Frame height in pixels (video sources only).
    pub height: Option<u32>,
    /// Frame rate (video sources only).
    pub frame_rate: Option<f32>,
    /// Per-sample codec data override, when the stream signals in-band
    /// codec changes.
    pub codec_data: Option<Vec<u8>>,
}

/// The shared-memory slot designated for one `NeedData` round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmSlot {
    /// Offset of the metadata prefix within the shared-memory region.
    pub metadata_offset: u32,
    /// Maximum bytes available to the metadata prefix.
    pub metadata_max_bytes: u32,
    /// Offset of the payload region within the shared-memory region.
    pub data_offset: u32,
    /// Maximum bytes available to payloads.
    pub data_max_bytes: u32,
}

/// One outstanding need-data/have-data transaction for a source.
///
/// Only one may be outstanding per source at a time (data-model invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedDataRequest {
    /// Monotonic id, scoped to the owning session.
    pub request_id: RequestId,
    /// The source this request was issued for.
    pub source_id: SourceId,
    /// Maximum number of frames the client may write.
    pub max_frames: u32,
    /// The slot the client should write into.
    pub shm_slot: ShmSlot,
}

/// Opaque handle to an attached ingress element inside the pipeline.
///
/// The concrete element lives in `rialto-media-pipeline`; sessions only
/// need to carry this handle, never dereference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppSrcHandle(pub u64);

/// A source attached to a session via `attachSource`.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// Id unique within the owning session.
    pub source_id: SourceId,
    /// Elementary stream kind.
    pub source_type: SourceType,
    /// Negotiated caps.
    pub caps: Caps,
    /// The ingress element this source pushes into, once attached.
    pub app_src: Option<AppSrcHandle>,
    /// True when the pipeline is currently hungry for this source.
    pub need_data: bool,
    /// True while a `NeedData` is outstanding (the singleton invariant).
    pub need_data_pending: bool,
    /// Outstanding request, if `need_data_pending`.
    pub outstanding_request: Option<NeedDataRequest>,
    /// Position to seek to once the first buffer is pushed, if a seek was
    /// requested before any data arrived.
    pub pending_initial_position: Option<i64>,
    /// Set by the underflow-signal callback; cleared on the next push.
    pub underflow_occurred: bool,
    /// True once at least one segment has been pushed for this source.
    pub data_pushed: bool,
    /// Buffers queued before the source was wired into the pipeline.
    pub buffers: Vec<MediaSegment>,
}

impl SourceRecord {
    /// Creates a freshly-attached source record with no pending work.
    pub fn new(source_id: SourceId, source_type: SourceType, caps: Caps) -> Self {
        Self {
            source_id,
            source_type,
            caps,
            app_src: None,
            need_data: false,
            need_data_pending: false,
            outstanding_request: None,
            pending_initial_position: None,
            underflow_occurred: false,
            data_pushed: false,
            buffers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_source_record_has_no_outstanding_request() {
        let record = SourceRecord::new(SourceId::from_raw(0), SourceType::Audio, Caps::default());
        assert!(!record.need_data_pending);
        assert!(record.outstanding_request.is_none());
        assert!(record.buffers.is_empty());
    }
}
