//! The partitioned shared-memory region and the frame codec used to write
//! and read [`MediaSegment`](rialto_shared_types::MediaSegment)s through it.

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod buffer;
mod error;
mod frame;
mod layout;

pub use buffer::{ShmRegion, SharedMemoryBuffer};
pub use error::{ShmError, ShmResult};
pub use frame::{FrameReader, FrameWriter};
pub use layout::{PartitionLayout, PlaybackKind};
