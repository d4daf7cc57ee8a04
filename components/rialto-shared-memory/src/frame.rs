//! Metadata+payload framing inside one shared-memory slot.
//!
//! Layout: an in-slot metadata prefix declares a frame count followed by
//! one fixed-shape record per frame (offsets into the payload region plus
//! the encryption fields `MediaSegment` carries); the payload region holds
//! raw bytes only. `FrameWriter` fails with [`ShmError::NoSpace`] when
//! `totalMetadataBytes + totalPayloadBytes > slotSize`; `FrameReader` fails
//! with [`ShmError::Corrupt`] on inconsistent offsets.

use crate::buffer::SharedMemoryBuffer;
use crate::error::{ShmError, ShmResult};
use rialto_shared_types::{CipherMode, EncryptionPattern, MediaSegment, ShmSlot, SourceId, SubSample};

const CIPHER_NONE: u8 = 0;
const CIPHER_CENC: u8 = 1;
const CIPHER_CBCS: u8 = 2;

/// Writes `MediaSegment` descriptors plus their payload bytes into a
/// client-designated shared-memory slot.
pub struct FrameWriter;

impl FrameWriter {
    /// Writes `frames` (each a `MediaSegment` paired with its raw payload)
    /// into `slot`. The segments' own `data_offset`/`data_length` are
    /// ignored on input and recomputed from actual placement.
    pub fn write(
        buffer: &SharedMemoryBuffer,
        slot: ShmSlot,
        frames: &[(MediaSegment, &[u8])],
    ) -> ShmResult<()> {
        let total_payload: usize = frames.iter().map(|(_, payload)| payload.len()).sum();
        if total_payload > slot.data_max_bytes as usize {
            return Err(ShmError::NoSpace(format!(
                "{total_payload} bytes of payload exceed slot capacity {}",
                slot.data_max_bytes
            )));
        }

        let mut metadata = Vec::new();
        metadata.extend_from_slice(&(frames.len() as u32).to_le_bytes());

        let mut payload_cursor = slot.data_offset;
        for (segment, payload) in frames {
            buffer.write_at(payload_cursor, payload)?;
            write_record(&mut metadata, segment, payload_cursor, payload.len() as u32);
            payload_cursor += payload.len() as u32;
        }

        if metadata.len() > slot.metadata_max_bytes as usize {
            return Err(ShmError::NoSpace(format!(
                "{} bytes of metadata exceed slot capacity {}",
                metadata.len(),
                slot.metadata_max_bytes
            )));
        }

        buffer.write_at(slot.metadata_offset, &metadata)
    }
}

fn write_record(out: &mut Vec<u8>, segment: &MediaSegment, data_offset: u32, data_length: u32) {
    out.extend_from_slice(&segment.source_id.as_raw().to_le_bytes());
    out.extend_from_slice(&segment.timestamp_ns.to_le_bytes());
    out.extend_from_slice(&segment.duration_ns.to_le_bytes());
    out.extend_from_slice(&data_offset.to_le_bytes());
    out.extend_from_slice(&data_length.to_le_bytes());
    out.push(segment.is_encrypted as u8);
    out.push(segment.init_with_last15 as u8);

    let cipher = match segment.cipher_mode {
        None => CIPHER_NONE,
        Some(CipherMode::Cenc) => CIPHER_CENC,
        Some(CipherMode::Cbcs) => CIPHER_CBCS,
    };
    out.push(cipher);

    let pattern = segment.encryption_pattern.unwrap_or_default();
    out.extend_from_slice(&pattern.crypt.to_le_bytes());
    out.extend_from_slice(&pattern.skip.to_le_bytes());

    write_bytes(out, &segment.key_id);
    write_bytes(out, &segment.init_vector);

    out.extend_from_slice(&(segment.sub_samples.len() as u16).to_le_bytes());
    for sub in &segment.sub_samples {
        out.extend_from_slice(&sub.clear_bytes.to_le_bytes());
        out.extend_from_slice(&sub.encrypted_bytes.to_le_bytes());
    }

    write_bytes(out, segment.media_key_session_id.as_deref().unwrap_or("").as_bytes());

    out.push(segment.clipping_start_ns.is_some() as u8);
    out.extend_from_slice(&segment.clipping_start_ns.unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&segment.clipping_end_ns.unwrap_or(0).to_le_bytes());

    let has_video = segment.width.is_some();
    out.push(has_video as u8);
    out.extend_from_slice(&segment.width.unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&segment.height.unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&segment.frame_rate.unwrap_or(0.0).to_le_bytes());

    write_bytes(out, segment.codec_data.as_deref().unwrap_or(&[]));
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Reads frame descriptors back out of a shared-memory slot.
pub struct FrameReader;

impl FrameReader {
    /// Reads up to `num_frames` segment descriptors from `slot`'s
    /// metadata prefix. The server reads only `num_frames` records and
    /// ignores bytes beyond, even if the metadata header claims more.
    pub fn read(buffer: &SharedMemoryBuffer, slot: ShmSlot, num_frames: u32) -> ShmResult<Vec<MediaSegment>> {
        let metadata = buffer.read_at(slot.metadata_offset, slot.metadata_max_bytes)?;
        let mut cursor = Cursor::new(&metadata);

        let declared_count = cursor.read_u32()?;
        let count = declared_count.min(num_frames);

        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            segments.push(read_record(&mut cursor)?);
        }
        Ok(segments)
    }
}

fn read_record(cursor: &mut Cursor<'_>) -> ShmResult<MediaSegment> {
    let source_id = SourceId::from_raw(cursor.read_i32()?);
    let timestamp_ns = cursor.read_i64()?;
    let duration_ns = cursor.read_i64()?;
    let data_offset = cursor.read_u32()?;
    let data_length = cursor.read_u32()?;
    let is_encrypted = cursor.read_u8()? != 0;
    let init_with_last15 = cursor.read_u8()? != 0;

    let cipher_mode = match cursor.read_u8()? {
        CIPHER_CENC => Some(CipherMode::Cenc),
        CIPHER_CBCS => Some(CipherMode::Cbcs),
        CIPHER_NONE => None,
        other => return Err(ShmError::Corrupt(format!("unknown cipher mode tag {other}"))),
    };

    let crypt = cursor.read_u32()?;
    let skip = cursor.read_u32()?;
    let encryption_pattern = if crypt == 0 && skip == 0 {
        None
    } else {
        Some(EncryptionPattern { crypt, skip })
    };

    let key_id = cursor.read_bytes()?;
    let init_vector = cursor.read_bytes()?;

    let sub_sample_count = cursor.read_u16()?;
    let mut sub_samples = Vec::with_capacity(sub_sample_count as usize);
    for _ in 0..sub_sample_count {
        let clear_bytes = cursor.read_u16()?;
        let encrypted_bytes = cursor.read_u32()?;
        sub_samples.push(SubSample {
            clear_bytes,
            encrypted_bytes,
        });
    }

    let media_key_session_id_raw = cursor.read_bytes()?;
    let media_key_session_id = if media_key_session_id_raw.is_empty() {
        None
    } else {
        Some(
            String::from_utf8(media_key_session_id_raw)
                .map_err(|e| ShmError::Corrupt(e.to_string()))?,
        )
    };

    let has_clipping = cursor.read_u8()? != 0;
    let clipping_start_ns = cursor.read_i64()?;
    let clipping_end_ns = cursor.read_i64()?;

    let has_video = cursor.read_u8()? != 0;
    let width = cursor.read_u32()?;
    let height = cursor.read_u32()?;
    let frame_rate = cursor.read_f32()?;

    let codec_data_raw = cursor.read_bytes()?;

    Ok(MediaSegment {
        source_id,
        timestamp_ns,
        duration_ns,
        data_offset,
        data_length,
        is_encrypted,
        key_id,
        init_vector,
        sub_samples,
        media_key_session_id,
        init_with_last15,
        cipher_mode,
        encryption_pattern,
        clipping_start_ns: has_clipping.then_some(clipping_start_ns),
        clipping_end_ns: has_clipping.then_some(clipping_end_ns),
        width: has_video.then_some(width),
        height: has_video.then_some(height),
        frame_rate: has_video.then_some(frame_rate),
        codec_data: (!codec_data_raw.is_empty()).then_some(codec_data_raw),
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> ShmResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| ShmError::Corrupt("metadata record truncated".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> ShmResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> ShmResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> ShmResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> ShmResult<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> ShmResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> ShmResult<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_bytes(&mut self) -> ShmResult<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PlaybackKind;

    fn sample_segment(source_id: i32) -> MediaSegment {
        MediaSegment {
            source_id: SourceId::from_raw(source_id),
            timestamp_ns: 1_000,
            duration_ns: 20_000_000,
            data_offset: 0,
            data_length: 0,
            is_encrypted: false,
            key_id: Vec::new(),
            init_vector: Vec::new(),
            sub_samples: Vec::new(),
            media_key_session_id: None,
            init_with_last15: false,
            cipher_mode: None,
            encryption_pattern: None,
            clipping_start_ns: None,
            clipping_end_ns: None,
            width: None,
            height: None,
            frame_rate: None,
            codec_data: None,
        }
    }

    #[test]
    fn round_trips_a_plain_segment() {
        let buffer = SharedMemoryBuffer::new(1, 0).unwrap();
        buffer.map_partition(PlaybackKind::Playback, 1).unwrap();
        let region = buffer
            .region(PlaybackKind::Playback, 1, rialto_shared_types::SourceType::Audio)
            .unwrap();
        let slot = ShmSlot {
            metadata_offset: region.offset,
            metadata_max_bytes: 4096,
            data_offset: region.offset + 4096,
            data_max_bytes: region.length - 4096,
        };

        let payload = b"encoded-frame-bytes";
        let segment = sample_segment(3);
        FrameWriter::write(&buffer, slot, &[(segment.clone(), payload.as_slice())]).unwrap();

        let read_back = FrameReader::read(&buffer, slot, 1).unwrap();
        assert_eq!(read_back.len(), 1);
        assert_eq!(read_back[0].source_id, segment.source_id);
        assert_eq!(read_back[0].timestamp_ns, segment.timestamp_ns);
        assert_eq!(read_back[0].data_length as usize, payload.len());
        let bytes = buffer
            .read_at(read_back[0].data_offset, read_back[0].data_length)
            .unwrap();
        assert_eq!(bytes, payload);
    }

    #[test]
    fn round_trips_encrypted_segment_with_subsamples() {
        let buffer = SharedMemoryBuffer::new(1, 0).unwrap();
        buffer.map_partition(PlaybackKind::Playback, 1).unwrap();
        let region = buffer
            .region(PlaybackKind::Playback, 1, rialto_shared_types::SourceType::Video)
            .unwrap();
        let slot = ShmSlot {
            metadata_offset: region.offset,
            metadata_max_bytes: 4096,
            data_offset: region.offset + 4096,
            data_max_bytes: region.length - 4096,
        };

        let mut segment = sample_segment(9);
        segment.is_encrypted = true;
        segment.key_id = vec![1, 2, 3, 4];
        segment.init_vector = vec![9, 9];
        segment.sub_samples = vec![SubSample {
            clear_bytes: 2,
            encrypted_bytes: 10,
        }];
        segment.cipher_mode = Some(CipherMode::Cenc);

        FrameWriter::write(&buffer, slot, &[(segment.clone(), b"0123456789ab".as_slice())]).unwrap();
        let read_back = FrameReader::read(&buffer, slot, 1).unwrap();
        assert_eq!(read_back[0].key_id, segment.key_id);
        assert_eq!(read_back[0].sub_samples, segment.sub_samples);
        assert_eq!(read_back[0].cipher_mode, segment.cipher_mode);
    }

    #[test]
    fn oversized_payload_is_rejected_with_no_space() {
        let buffer = SharedMemoryBuffer::new(1, 0).unwrap();
        buffer.map_partition(PlaybackKind::Playback, 1).unwrap();
        let region = buffer
            .region(PlaybackKind::Playback, 1, rialto_shared_types::SourceType::Audio)
            .unwrap();
        let slot = ShmSlot {
            metadata_offset: region.offset,
            metadata_max_bytes: 64,
            data_offset: region.offset + 64,
            data_max_bytes: 4,
        };
        let segment = sample_segment(1);
        let err = FrameWriter::write(&buffer, slot, &[(segment, b"too-many-bytes".as_slice())]).unwrap_err();
        assert!(matches!(err, ShmError::NoSpace(_)));
    }

    #[test]
    fn reader_only_consumes_the_requested_frame_count() {
        let buffer = SharedMemoryBuffer::new(1, 0).unwrap();
        buffer.map_partition(PlaybackKind::Playback, 1).unwrap();
        let region = buffer
            .region(PlaybackKind::Playback, 1, rialto_shared_types::SourceType::Audio)
            .unwrap();
        let slot = ShmSlot {
            metadata_offset: region.offset,
            metadata_max_bytes: 4096,
            data_offset: region.offset + 4096,
            data_max_bytes: region.length - 4096,
        };
        let frames: Vec<(MediaSegment, &[u8])> = vec![
            (sample_segment(1), b"aaa".as_slice()),
            (sample_segment(2), b"bbb".as_slice()),
        ];
        FrameWriter::write(&buffer, slot, &frames).unwrap();
        let read_back = FrameReader::read(&buffer, slot, 1).unwrap();
        assert_eq!(read_back.len(), 1);
        assert_eq!(read_back[0].source_id, SourceId::from_raw(1));
    }
}
