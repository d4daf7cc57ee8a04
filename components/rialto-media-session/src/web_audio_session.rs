//! `WebAudioSession`: a two-pointer ring buffer over one Web Audio shared-
//! memory slot, feeding a single-source [`WebAudioPipelinePlayer`].

use parking_lot::Mutex;
use rialto_common::{Timer, TimerType};
use rialto_media_pipeline::WebAudioPipelinePlayer;
use rialto_shared_memory::{PlaybackKind, ShmRegion, SharedMemoryBuffer};
use rialto_shared_types::{Caps, RialtoError, RialtoResult, SourceType, WebAudioHandle};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::client::ClientNotifier;

const RETRY_PERIOD: Duration = Duration::from_millis(100);

/// The contiguous-plus-wrap region a client is permitted to write,
/// returned by `getBufferAvailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAvailable {
    /// Offset of the main (non-wrapped) run.
    pub offset_main: u32,
    /// Length of the main run.
    pub length_main: u32,
    /// Offset of the wrapped run (the start of the slot).
    pub offset_wrap: u32,
    /// Length of the wrapped run; zero when the main run alone covers all
    /// free space.
    pub length_wrap: u32,
}

/// Fixed device characteristics returned by `getDeviceInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The device's preferred frame count per `writeBuffer` call.
    pub preferred_frames: u32,
    /// The maximum frame count the slot can hold in one go.
    pub maximum_frames: u32,
    /// Always true: `writeBuffer` may legally return fewer frames than
    /// requested and retry later.
    pub support_deferred_play: bool,
}

struct Inner {
    handle: WebAudioHandle,
    #[allow(dead_code)]
    client: Weak<dyn ClientNotifier>,
    pipeline: WebAudioPipelinePlayer,
    shm: Arc<SharedMemoryBuffer>,
    region: ShmRegion,
    bytes_per_frame: u32,
    main_thread: rialto_worker::MainThread,
    client_id: rialto_worker::ClientId,
    write_cursor: AtomicU32,
    read_cursor: AtomicU32,
    expect_write_buffer: AtomicBool,
    eos_requested: AtomicBool,
    retry_timer: Mutex<Option<Timer>>,
    /// Set once, right after construction, so the retry timer can re-enter
    /// through a non-owning reference instead of keeping the session
    /// alive forever.
    self_weak: Mutex<Weak<Inner>>,
}

/// Per-handle façade over the Web Audio ring buffer and its pipeline.
pub struct WebAudioSession {
    inner: Arc<Inner>,
}

impl WebAudioSession {
    /// Creates a session over `handle`'s shared-memory partition (already
    /// mapped by the caller) and starts its pipeline.
    pub fn new(handle: WebAudioHandle, caps: Caps, client: Weak<dyn ClientNotifier>, shm: Arc<SharedMemoryBuffer>) -> RialtoResult<Self> {
        let region = shm
            .region(PlaybackKind::WebAudio, handle.as_raw(), SourceType::Audio)
            .map_err(|_| RialtoError::ShmExhausted)?;
        let pipeline = WebAudioPipelinePlayer::new(&format!("web-audio-{}", handle.as_raw()), &caps)?;
        pipeline.play()?;
        let bytes_per_frame = (caps.channels.unwrap_or(2) as u32 * 2).max(1);
        let main_thread = rialto_worker::MainThread::new(format!("web-audio-{}-main", handle.as_raw()));
        let client_id = main_thread.register_client();

        let inner = Arc::new(Inner {
            handle,
            client,
            pipeline,
            shm,
            region,
            bytes_per_frame,
            main_thread,
            client_id,
            write_cursor: AtomicU32::new(0),
            read_cursor: AtomicU32::new(0),
            expect_write_buffer: AtomicBool::new(false),
            eos_requested: AtomicBool::new(false),
            retry_timer: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
        });
        *inner.self_weak.lock() = Arc::downgrade(&inner);

        Ok(Self { inner })
    }

    /// This session's handle.
    pub fn handle(&self) -> WebAudioHandle {
        self.inner.handle
    }

    fn run_sync<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&Inner) -> R + Send + 'static,
    {
        let inner = self.inner.clone();
        let result: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        self.inner.main_thread.enqueue_task_and_wait(self.inner.client_id, move || {
            *result2.lock() = Some(f(&inner));
        });
        result.lock().take().expect("task runs synchronously before enqueue_task_and_wait returns")
    }

    /// `getBufferAvailable()`: atomically returns the writable region and
    /// sets `expectWriteBuffer=true`.
    pub fn get_buffer_available(&self) -> BufferAvailable {
        self.run_sync(|inner| {
            let capacity = inner.region.length;
            let used = inner.write_cursor.load(Ordering::SeqCst) - inner.read_cursor.load(Ordering::SeqCst);
            let free = capacity.saturating_sub(used);
            let start = inner.write_cursor.load(Ordering::SeqCst) % capacity;
            let main_len = free.min(capacity - start);
            let wrap_len = free - main_len;
            inner.expect_write_buffer.store(true, Ordering::SeqCst);
            BufferAvailable {
                offset_main: inner.region.offset + start,
                length_main: main_len,
                offset_wrap: inner.region.offset,
                length_wrap: wrap_len,
            }
        })
    }

    /// `writeBuffer(numberOfFrames, _)`: advances the write cursor by the
    /// bytes the client just wrote and attempts to push the whole
    /// unconsumed range into the pipeline. Returns the number of frames
    /// actually pushed; if the pipeline wasn't ready, returns 0 and the
    /// bytes stay queued for the retry timer.
    pub fn write_buffer(&self, number_of_frames: u32) -> RialtoResult<u32> {
        self.run_sync(move |inner| {
            if !inner.expect_write_buffer.swap(false, Ordering::SeqCst) {
                return Err(RialtoError::InvalidState(
                    "writeBuffer called without a prior getBufferAvailable".into(),
                ));
            }
            let bytes = number_of_frames * inner.bytes_per_frame;
            inner.write_cursor.fetch_add(bytes, Ordering::SeqCst);
            Ok(drain(inner))
        })
    }

    /// `setEos()`: pushes end-of-stream once the ring is fully drained;
    /// otherwise defers until the retry timer empties it.
    pub fn set_eos(&self) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            inner.eos_requested.store(true, Ordering::SeqCst);
            maybe_push_eos(inner)
        })
    }

    /// `getBufferDelay()`: frames queued in the pipeline plus frames
    /// queued but not yet pushed out of shared memory.
    pub fn get_buffer_delay(&self) -> u32 {
        self.run_sync(|inner| {
            let queued_in_shm = inner.write_cursor.load(Ordering::SeqCst) - inner.read_cursor.load(Ordering::SeqCst);
            let queued_in_pipeline = inner.pipeline.queued_bytes();
            (queued_in_shm + queued_in_pipeline as u32) / inner.bytes_per_frame
        })
    }

    /// `getDeviceInfo()`.
    pub fn get_device_info(&self) -> DeviceInfo {
        let region = self.inner.region;
        let bytes_per_frame = self.inner.bytes_per_frame;
        let maximum_frames = region.length / bytes_per_frame;
        DeviceInfo {
            preferred_frames: maximum_frames.min(640),
            maximum_frames,
            support_deferred_play: true,
        }
    }

    /// `ping(heartbeatHandler)`: enqueues a task whose sole effect is to
    /// complete the handler, so a deadlocked Web Audio session's MainThread
    /// is caught by the same healthcheck window as a media session's.
    pub fn ping(&self, handler: rialto_heartbeat::HeartbeatHandler) {
        self.inner.main_thread.enqueue_task(self.inner.client_id, move || {
            drop(handler);
        });
    }
}

/// Reads the unconsumed `[read_cursor, write_cursor)` range out of shared
/// memory (splitting at the ring boundary if it wraps) and pushes it into
/// the pipeline. Returns frames actually pushed.
fn drain(inner: &Inner) -> u32 {
    let read = inner.read_cursor.load(Ordering::SeqCst);
    let write = inner.write_cursor.load(Ordering::SeqCst);
    if write == read {
        return 0;
    }
    let capacity = inner.region.length;
    let pending = write - read;
    let start = read % capacity;
    let first_len = pending.min(capacity - start);

    let mut payload = match inner.shm.read_at(inner.region.offset + start, first_len) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(handle = inner.handle.as_raw(), error = %e, "failed reading web audio ring, retrying later");
            schedule_retry(inner);
            return 0;
        }
    };
    if first_len < pending {
        match inner.shm.read_at(inner.region.offset, pending - first_len) {
            Ok(rest) => payload.extend(rest),
            Err(e) => {
                tracing::warn!(handle = inner.handle.as_raw(), error = %e, "failed reading wrapped web audio ring, retrying later");
                schedule_retry(inner);
                return 0;
            }
        }
    }

    match inner.pipeline.push_pcm(&payload) {
        Ok(()) => {
            inner.read_cursor.store(write, Ordering::SeqCst);
            cancel_retry(inner);
            let _ = maybe_push_eos(inner);
            pending / inner.bytes_per_frame
        }
        Err(e) => {
            tracing::debug!(handle = inner.handle.as_raw(), error = %e, "web audio pipeline not ready, deferring write");
            schedule_retry(inner);
            0
        }
    }
}

fn maybe_push_eos(inner: &Inner) -> RialtoResult<()> {
    if !inner.eos_requested.load(Ordering::SeqCst) {
        return Ok(());
    }
    if inner.read_cursor.load(Ordering::SeqCst) != inner.write_cursor.load(Ordering::SeqCst) {
        return Ok(());
    }
    inner.pipeline.end_of_stream()
}

fn schedule_retry(inner: &Inner) {
    let mut guard = inner.retry_timer.lock();
    if guard.is_some() {
        return;
    }
    let weak = inner.self_weak.lock().clone();
    let timer = Timer::new(
        RETRY_PERIOD,
        move || {
            if let Some(inner) = weak.upgrade() {
                let inner_task = inner.clone();
                inner.main_thread.enqueue_task(inner.client_id, move || {
                    drain(&inner_task);
                });
            }
        },
        TimerType::Periodic,
    );
    *guard = Some(timer);
}

fn cancel_retry(inner: &Inner) {
    if let Some(mut timer) = inner.retry_timer.lock().take() {
        timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn device_info_caps_preferred_frames_at_640() {
        let region_length = 1024 * 1024u32;
        let bytes_per_frame = 4u32;
        let maximum_frames = region_length / bytes_per_frame;
        assert!(maximum_frames > 640);
        assert_eq!(maximum_frames.min(640), 640);
    }
}
