//! Up-front partition layout computation.
//!
//! ```text
//! buffer := concat(
//!     repeat numPlaybacks × playbackPartition(audioSlot, videoSlot, subtitleSlot),
//!     repeat numWebAudios × webAudioPartition(audioSlot))
//! ```

use rialto_shared_types::SourceType;

/// Which partition family an offset/length query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackKind {
    /// A `MediaPipelineSession` partition (audio+video+subtitle slots).
    Playback,
    /// A `WebAudioSession` partition (a single audio slot).
    WebAudio,
}

const AUDIO_SLOT_BYTES: usize = 1024 * 1024;
const VIDEO_SLOT_BYTES: usize = 7 * 1024 * 1024;
const SUBTITLE_SLOT_BYTES: usize = 256 * 1024;
const WEB_AUDIO_SLOT_BYTES: usize = 512 * 1024;

/// Computes fixed offsets/lengths for every `(partition index, source
/// type)` pair, for a region sized up front from `numPlaybacks` and
/// `numWebAudios`.
#[derive(Debug, Clone, Copy)]
pub struct PartitionLayout {
    num_playbacks: usize,
    num_web_audios: usize,
    playback_stride: usize,
    web_audio_region_start: usize,
    total_size: usize,
}

impl PartitionLayout {
    /// Computes the layout for a server sized to hold `num_playbacks`
    /// playback sessions and `num_web_audios` web-audio sessions.
    pub fn new(num_playbacks: usize, num_web_audios: usize) -> Self {
        let playback_stride = AUDIO_SLOT_BYTES + VIDEO_SLOT_BYTES + SUBTITLE_SLOT_BYTES;
        let playback_region_len = playback_stride * num_playbacks;
        let total_size = playback_region_len + WEB_AUDIO_SLOT_BYTES * num_web_audios;

        Self {
            num_playbacks,
            num_web_audios,
            playback_stride,
            web_audio_region_start: playback_region_len,
            total_size,
        }
    }

    /// Total size in bytes of the region this layout describes.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Capacity of the given partition family.
    pub fn capacity(&self, kind: PlaybackKind) -> usize {
        match kind {
            PlaybackKind::Playback => self.num_playbacks,
            PlaybackKind::WebAudio => self.num_web_audios,
        }
    }

    /// Byte offset of `source_type`'s slot within partition
    /// `partition_index` of the given family.
    ///
    /// # Panics
    ///
    /// Panics if `partition_index >= capacity(kind)` — callers are
    /// expected to have validated the index via `mapPartition` first.
    pub fn data_offset(&self, kind: PlaybackKind, partition_index: usize, source_type: SourceType) -> usize {
        assert!(partition_index < self.capacity(kind), "partition index out of range");
        match kind {
            PlaybackKind::Playback => {
                let base = partition_index * self.playback_stride;
                base + match source_type {
                    SourceType::Audio => 0,
                    SourceType::Video => AUDIO_SLOT_BYTES,
                    SourceType::Subtitle => AUDIO_SLOT_BYTES + VIDEO_SLOT_BYTES,
                }
            }
            PlaybackKind::WebAudio => {
                self.web_audio_region_start + partition_index * WEB_AUDIO_SLOT_BYTES
            }
        }
    }

    /// Maximum payload length of `source_type`'s slot in the given family.
    pub fn max_data_len(&self, kind: PlaybackKind, source_type: SourceType) -> usize {
        match (kind, source_type) {
            (PlaybackKind::Playback, SourceType::Audio) => AUDIO_SLOT_BYTES,
            (PlaybackKind::Playback, SourceType::Video) => VIDEO_SLOT_BYTES,
            (PlaybackKind::Playback, SourceType::Subtitle) => SUBTITLE_SLOT_BYTES,
            (PlaybackKind::WebAudio, _) => WEB_AUDIO_SLOT_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_partitions_do_not_overlap() {
        let layout = PartitionLayout::new(3, 2);
        let mut ranges = Vec::new();
        for partition in 0..3 {
            for source_type in [SourceType::Audio, SourceType::Video, SourceType::Subtitle] {
                let offset = layout.data_offset(PlaybackKind::Playback, partition, source_type);
                let len = layout.max_data_len(PlaybackKind::Playback, source_type);
                ranges.push((offset, offset + len));
            }
        }
        for partition in 0..2 {
            let offset = layout.data_offset(PlaybackKind::WebAudio, partition, SourceType::Audio);
            let len = layout.max_data_len(PlaybackKind::WebAudio, SourceType::Audio);
            ranges.push((offset, offset + len));
        }
        ranges.sort_unstable();
        for window in ranges.windows(2) {
            assert!(window[0].1 <= window[1].0, "overlap: {:?}", window);
        }
        assert_eq!(ranges.last().unwrap().1, layout.total_size());
    }
}
