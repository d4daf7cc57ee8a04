//! Errors raised by the shared-memory layer.

use thiserror::Error;

/// Errors from [`crate::SharedMemoryBuffer`], [`crate::FrameReader`] and
/// [`crate::FrameWriter`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The underlying memfd/mmap syscall failed.
    #[error("shared memory syscall failed: {0}")]
    System(#[from] std::io::Error),

    /// A partition was requested for an entity id outside the configured
    /// capacity.
    #[error("no partition available for entity {entity_id} ({kind})")]
    NoPartition {
        /// The entity (session or web-audio handle) that was requested.
        entity_id: i32,
        /// Which partition family (`"playback"` or `"web audio"`).
        kind: &'static str,
    },

    /// A write would not fit the declared slot.
    #[error("segment does not fit the designated slot: {0}")]
    NoSpace(String),

    /// A read found inconsistent metadata (offsets/lengths that do not
    /// agree with the declared slot).
    #[error("corrupt frame metadata: {0}")]
    Corrupt(String),
}

/// Result type for the shared-memory layer.
pub type ShmResult<T> = Result<T, ShmError>;
