//! `PipelinePlayer`: owns the pipeline element, per-source ingress
//! elements, and the timer/caps-update machinery around them.

use crate::bus::{translate_bus_message, BusEvent};
use crate::config::PipelineConfig;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::Mutex;
use rialto_common::{Timer, TimerType};
use rialto_shared_types::{AppSrcHandle, Caps, MediaSegment, RialtoError, RialtoResult, SourceType};
use rialto_worker::{DispatchControl, Dispatcher};
use std::collections::HashMap;
use std::time::Duration;

struct AttachedSource {
    app_src: gst_app::AppSrc,
    caps: Caps,
    handle: AppSrcHandle,
    sink: gst::Element,
}

/// The target state a caller requests via `play`/`pause`/`stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineTargetState {
    /// Start or resume playback.
    Playing,
    /// Pause playback.
    Paused,
    /// Tear down toward `NULL` on the next tick.
    Stopped,
}

/// Wraps a GStreamer pipeline built from per-source `appsrc` ingress
/// elements, one decode/sink chain each.
///
/// Cancels the position-report timer on any state below `PLAYING`; starts
/// it (period configured via [`PipelineConfig`]) on entering `PLAYING`.
pub struct PipelinePlayer {
    pipeline: gst::Pipeline,
    config: PipelineConfig,
    sources: Mutex<HashMap<SourceType, AttachedSource>>,
    position_timer: Mutex<Option<Timer>>,
    next_handle: std::sync::atomic::AtomicU64,
}

impl PipelinePlayer {
    /// Creates an empty pipeline. Sources are wired in by `attach_source`.
    pub fn new(name: &str, config: PipelineConfig) -> RialtoResult<Self> {
        gst::init().map_err(|e| RialtoError::PipelineFailure(e.to_string()))?;
        let pipeline = gst::Pipeline::builder().name(name).build();

        Ok(Self {
            pipeline,
            config,
            sources: Mutex::new(HashMap::new()),
            position_timer: Mutex::new(None),
            next_handle: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// The pipeline's message bus, polled by a [`rialto_worker::Dispatcher`]
    /// wrapping [`crate::GstBusPoller`].
    pub fn bus(&self) -> Option<gst::Bus> {
        self.pipeline.bus()
    }

    /// Spawns a [`Dispatcher`] polling this pipeline's bus at a 100ms
    /// timeout, translating each message via [`translate_bus_message`] and
    /// handing the ones this system acts on to `on_event`. `on_event` runs
    /// on the dispatcher's own thread — callers that need session-thread
    /// semantics must re-enqueue onto their own `MainThread` from inside it.
    ///
    /// Returns `None` if the pipeline has no bus (never the case for a
    /// `gst::Pipeline`, but `bus()` is fallible so this mirrors it).
    pub fn spawn_bus_dispatcher<F>(&self, mut on_event: F) -> Option<Dispatcher>
    where
        F: FnMut(BusEvent) + Send + 'static,
    {
        let bus = self.pipeline.bus()?;
        let poller = crate::bus::GstBusPoller::new(bus);
        Some(Dispatcher::spawn(poller, Duration::from_millis(100), move |message| {
            if let Some(event) = translate_bus_message(&message) {
                on_event(event);
            }
            DispatchControl::Continue
        }))
    }

    /// Attaches (or, when `switch_source` is true and a source of the same
    /// type already exists, reconfigures in place) a source of `source_type`
    /// with the given caps.
    pub fn attach_source(
        &self,
        source_type: SourceType,
        caps: Caps,
    ) -> RialtoResult<AppSrcHandle> {
        let mut sources = self.sources.lock();
        if let Some(existing) = sources.get_mut(&source_type) {
            self.apply_caps(&existing.app_src, &caps)?;
            existing.caps = caps;
            return Ok(existing.handle);
        }

        let app_src = gst_app::AppSrc::builder()
            .name(format!("rialto-src-{}", source_type_name(source_type)))
            .format(gst::Format::Time)
            .is_live(true)
            .build();
        self.apply_caps(&app_src, &caps)?;

        let sink = self.build_sink_chain(source_type, &app_src)?;

        let handle = AppSrcHandle(self.next_handle.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        sources.insert(
            source_type,
            AttachedSource {
                app_src,
                caps,
                handle,
                sink,
            },
        );
        Ok(handle)
    }

    fn apply_caps(&self, app_src: &gst_app::AppSrc, caps: &Caps) -> RialtoResult<()> {
        let mut builder = gst::Caps::builder(mime_to_gst_media_type(&caps.mime_type));
        if let Some(rate) = caps.sample_rate {
            builder = builder.field("rate", rate as i32);
        }
        if let Some(channels) = caps.channels {
            builder = builder.field("channels", channels as i32);
        }
        if let Some(width) = caps.width {
            builder = builder.field("width", width as i32);
        }
        if let Some(height) = caps.height {
            builder = builder.field("height", height as i32);
        }
        let gst_caps = builder.build();
        app_src.set_caps(Some(&gst_caps));
        Ok(())
    }

    /// Builds the decode/sink chain an ingress `appsrc` feeds into.
    /// Subtitle sources are sunk into `fakesink` — rendering is out of
    /// scope for this engine.
    fn build_sink_chain(&self, source_type: SourceType, app_src: &gst_app::AppSrc) -> RialtoResult<gst::Element> {
        let decodebin = gst::ElementFactory::make("decodebin").build().map_err(to_pipeline_err)?;
        let sink = match source_type {
            SourceType::Audio => gst::ElementFactory::make("autoaudiosink").build().map_err(to_pipeline_err)?,
            SourceType::Video => gst::ElementFactory::make("autovideosink").build().map_err(to_pipeline_err)?,
            SourceType::Subtitle => gst::ElementFactory::make("fakesink").build().map_err(to_pipeline_err)?,
        };
        let convert = match source_type {
            SourceType::Audio => gst::ElementFactory::make("audioconvert").build().ok(),
            SourceType::Video => gst::ElementFactory::make("videoconvert").build().ok(),
            SourceType::Subtitle => None,
        };

        self.pipeline
            .add_many([app_src.upcast_ref::<gst::Element>(), &decodebin])
            .map_err(to_pipeline_err)?;
        if let Some(convert) = &convert {
            self.pipeline.add(convert).map_err(to_pipeline_err)?;
        }
        self.pipeline.add(&sink).map_err(to_pipeline_err)?;

        app_src
            .upcast_ref::<gst::Element>()
            .link(&decodebin)
            .map_err(|_| RialtoError::PipelineFailure("failed to link appsrc to decodebin".into()))?;

        let sink_for_closure = sink.clone();
        let convert_for_closure = convert.clone();
        decodebin.connect_pad_added(move |_bin, src_pad| {
            let target = convert_for_closure.as_ref().unwrap_or(&sink_for_closure);
            if let Some(sink_pad) = target.static_pad("sink") {
                if !sink_pad.is_linked() {
                    let _ = src_pad.link(&sink_pad);
                }
            }
        });

        if let Some(convert) = &convert {
            convert.link(&sink).map_err(to_pipeline_err)?;
        }

        Ok(sink)
    }

    /// Removes a source: sends end-of-stream to its ingress element and
    /// drops the element bookkeeping. Queued buffers are the caller's
    /// (`MediaPipelineSession`'s) responsibility to discard.
    pub fn remove_source(&self, source_type: SourceType) -> RialtoResult<()> {
        let mut sources = self.sources.lock();
        if let Some(source) = sources.remove(&source_type) {
            let _ = source.app_src.end_of_stream();
        }
        Ok(())
    }

    /// Sends end-of-stream to `source_type`'s ingress element without
    /// dropping its bookkeeping (`haveData(status=EOS)`'s contract, lighter
    /// than `remove_source`'s: the source stays attached, so `get_volume`/
    /// `set_volume`/`render_frame`/`connect_underflow` still resolve it).
    pub fn signal_end_of_stream(&self, source_type: SourceType) -> RialtoResult<()> {
        let sources = self.sources.lock();
        let source = sources
            .get(&source_type)
            .ok_or_else(|| RialtoError::InvalidState(format!("no ingress element for {source_type:?}")))?;
        source
            .app_src
            .end_of_stream()
            .map(|_| ())
            .map_err(|e| RialtoError::PipelineFailure(format!("end_of_stream failed: {e:?}")))
    }

    /// Pushes one decoded segment's payload into its ingress element,
    /// stamping timestamp/duration and — for encrypted segments —
    /// protection metadata carrying the DRM parameters the (external)
    /// decryptor consumes.
    pub fn push_segment(&self, source_type: SourceType, segment: &MediaSegment, payload: &[u8]) -> RialtoResult<()> {
        let sources = self.sources.lock();
        let source = sources
            .get(&source_type)
            .ok_or_else(|| RialtoError::InvalidState(format!("no ingress element for {source_type:?}")))?;

        let mut buffer = gst::Buffer::from_slice(payload.to_vec());
        {
            let buffer_mut = buffer.get_mut().expect("buffer was just created, refcount is 1");
            buffer_mut.set_pts(gst::ClockTime::from_nseconds(segment.timestamp_ns.max(0) as u64));
            buffer_mut.set_duration(gst::ClockTime::from_nseconds(segment.duration_ns.max(0) as u64));
            if segment.is_encrypted {
                attach_protection_meta(buffer_mut, segment);
            }
        }

        source
            .app_src
            .push_buffer(buffer)
            .map_err(|e| RialtoError::PipelineFailure(format!("push_buffer failed: {e:?}")))?;
        Ok(())
    }

    /// Requests a pipeline state transition.
    pub fn set_state(&self, target: PipelineTargetState) -> RialtoResult<()> {
        let gst_state = match target {
            PipelineTargetState::Playing => gst::State::Playing,
            PipelineTargetState::Paused => gst::State::Paused,
            PipelineTargetState::Stopped => gst::State::Null,
        };
        self.pipeline
            .set_state(gst_state)
            .map_err(|e| RialtoError::PipelineFailure(e.to_string()))?;

        if target == PipelineTargetState::Playing {
            // position timer started by the caller via `start_position_timer`,
            // which knows the session to enqueue ticks onto.
        } else {
            self.cancel_position_timer();
        }
        Ok(())
    }

    /// Issues a flushing seek with the given rate.
    pub fn seek(&self, position_ns: i64, rate: f64) -> RialtoResult<()> {
        let position = gst::ClockTime::from_nseconds(position_ns.max(0) as u64);
        let flags = gst::SeekFlags::FLUSH | gst::SeekFlags::ACCURATE;
        let ok = if (rate - 1.0).abs() < f64::EPSILON {
            self.pipeline.seek_simple(flags, position)
        } else {
            self.pipeline.seek(
                rate,
                flags,
                gst::SeekType::Set,
                position,
                gst::SeekType::None,
                gst::ClockTime::NONE,
            )
        };
        ok.map_err(|e| RialtoError::PipelineFailure(e.to_string()))
    }

    /// Sends an instant rate-change event downstream (pipeline already at
    /// or above `PLAYING`). Callers below `PLAYING` must instead queue the
    /// rate and re-apply it once `PLAYING` is reached.
    pub fn set_playback_rate_instant(&self, rate: f64) -> RialtoResult<()> {
        if let Some(position) = self.query_position_ns() {
            self.seek(position, rate)
        } else {
            Err(RialtoError::InvalidState("no position to anchor a rate change".into()))
        }
    }

    /// Toggles frame-step-on-preroll on the video sink and steps one
    /// buffer, to display a still frame from `PAUSED`.
    pub fn render_frame(&self) -> RialtoResult<()> {
        let sources = self.sources.lock();
        let video = sources
            .get(&SourceType::Video)
            .ok_or_else(|| RialtoError::InvalidState("no video source attached".into()))?;
        if video.sink.has_property("show-preroll-frame") {
            video.sink.set_property("show-preroll-frame", true);
        }
        let step = gst::event::Step::new(gst::format::Buffers(1), 1.0, true, false);
        if !video.sink.send_event(step) {
            return Err(RialtoError::PipelineFailure("step event rejected by video sink".into()));
        }
        Ok(())
    }

    /// Sets stream volume, `0.0..=1.0`.
    pub fn set_volume(&self, volume: f64) -> RialtoResult<()> {
        self.with_volume_element(|el| el.set_property("volume", volume))
    }

    /// Reads the current stream volume.
    pub fn get_volume(&self) -> RialtoResult<f64> {
        let mut value = 1.0;
        self.with_volume_element(|el| value = el.property("volume"))?;
        Ok(value)
    }

    /// Mutes/unmutes the stream.
    pub fn set_mute(&self, muted: bool) -> RialtoResult<()> {
        self.with_volume_element(|el| el.set_property("mute", muted))
    }

    /// Reads the current mute state.
    pub fn get_mute(&self) -> RialtoResult<bool> {
        let mut muted = false;
        self.with_volume_element(|el| muted = el.property("mute"))?;
        Ok(muted)
    }

    fn with_volume_element(&self, f: impl FnOnce(&gst::Element)) -> RialtoResult<()> {
        let sources = self.sources.lock();
        let audio = sources
            .get(&SourceType::Audio)
            .ok_or_else(|| RialtoError::InvalidState("no audio source attached".into()))?;
        if audio.sink.has_property("volume") {
            f(&audio.sink);
            Ok(())
        } else {
            Err(RialtoError::PipelineFailure("audio sink exposes no stream-volume interface".into()))
        }
    }

    /// Sets the video sink's output rectangle (`setVideoWindow`). A sink
    /// with no such property silently accepts the call — window placement
    /// is compositor-owned on many targets.
    pub fn set_video_window(&self, x: i32, y: i32, width: i32, height: i32) -> RialtoResult<()> {
        let sources = self.sources.lock();
        if let Some(video) = sources.get(&SourceType::Video) {
            if video.sink.has_property("rectangle") {
                video.sink.set_property("rectangle", format!("{x},{y},{width},{height}"));
            }
        }
        Ok(())
    }

    /// Current playback position, nanoseconds, if known.
    pub fn query_position_ns(&self) -> Option<i64> {
        self.pipeline
            .query_position::<gst::ClockTime>()
            .map(|t| t.nseconds() as i64)
    }

    /// Starts the 250ms-default position-report timer, invoking `on_tick`
    /// with the current position on a private thread.
    pub fn start_position_timer<F>(&self, on_tick: F)
    where
        F: Fn(i64) + Send + 'static,
    {
        let period = Duration::from_millis(self.config.position_report_period_ms);
        let pipeline = self.pipeline.clone();
        *self.position_timer.lock() = Some(Timer::new(
            period,
            move || {
                if let Some(position) = pipeline.query_position::<gst::ClockTime>() {
                    on_tick(position.nseconds() as i64);
                }
            },
            TimerType::Periodic,
        ));
    }

    /// Cancels the position-report timer, if running.
    pub fn cancel_position_timer(&self) {
        self.position_timer.lock().take();
    }

    /// Connects a sink's `underflow` signal (when the concrete sink
    /// element exposes one) to `callback`. Elements without the signal
    /// are silently skipped — not every sink backend supports it.
    pub fn connect_underflow<F>(&self, source_type: SourceType, callback: F) -> RialtoResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let sources = self.sources.lock();
        let source = sources
            .get(&source_type)
            .ok_or_else(|| RialtoError::InvalidState(format!("no ingress element for {source_type:?}")))?;

        let sink = source.sink.clone();
        let connected = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sink.connect("underflow", false, move |_values| {
                callback();
                None
            });
        }));
        if connected.is_err() {
            tracing::debug!(?source_type, "sink exposes no underflow signal, skipping");
        }
        Ok(())
    }
}

fn source_type_name(source_type: SourceType) -> &'static str {
    match source_type {
        SourceType::Audio => "audio",
        SourceType::Video => "video",
        SourceType::Subtitle => "subtitle",
    }
}

fn mime_to_gst_media_type(mime_type: &str) -> &'static str {
    if mime_type.starts_with("audio/") {
        "audio/mpeg"
    } else if mime_type.starts_with("video/") {
        "video/x-h264"
    } else {
        "application/x-subtitle"
    }
}

fn to_pipeline_err(e: impl std::fmt::Display) -> RialtoError {
    RialtoError::PipelineFailure(e.to_string())
}

fn attach_protection_meta(buffer: &mut gst::BufferRef, segment: &MediaSegment) {
    let subsamples = pack_subsamples(&segment.sub_samples);
    let structure = gst::Structure::builder("rialto/protection")
        .field("key-id", gst::glib::Bytes::from_owned(segment.key_id.clone()))
        .field("iv", gst::glib::Bytes::from_owned(segment.init_vector.clone()))
        .field("subsamples", gst::glib::Bytes::from_owned(subsamples))
        .field("init-with-last15", segment.init_with_last15)
        .field(
            "cipher-mode",
            segment
                .cipher_mode
                .map(|m| format!("{m:?}"))
                .unwrap_or_default(),
        )
        .field("crypt", segment.encryption_pattern.map(|p| p.crypt).unwrap_or(0))
        .field("skip", segment.encryption_pattern.map(|p| p.skip).unwrap_or(0))
        .field(
            "media-key-session-id",
            segment.media_key_session_id.clone().unwrap_or_default(),
        )
        .build();
    let _ = gst::meta::CustomMeta::add(buffer, "rialto-protection", structure);
}

fn pack_subsamples(subsamples: &[rialto_shared_types::SubSample]) -> Vec<u8> {
    let mut out = Vec::with_capacity(subsamples.len() * 6);
    for sub in subsamples {
        out.extend_from_slice(&sub.clear_bytes.to_le_bytes());
        out.extend_from_slice(&sub.encrypted_bytes.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rialto_shared_types::SubSample;

    #[test]
    fn pack_subsamples_round_trips_byte_layout() {
        let subs = vec![
            SubSample { clear_bytes: 16, encrypted_bytes: 2048 },
            SubSample { clear_bytes: 0, encrypted_bytes: 4096 },
        ];
        let packed = pack_subsamples(&subs);
        assert_eq!(packed.len(), 12);
        assert_eq!(u16::from_le_bytes([packed[0], packed[1]]), 16);
        assert_eq!(
            u32::from_le_bytes([packed[2], packed[3], packed[4], packed[5]]),
            2048
        );
    }

    #[test]
    fn new_pipeline_player_starts_with_no_sources() {
        let player = PipelinePlayer::new("test-pipeline", PipelineConfig::default())
            .expect("gstreamer init and pipeline construction should succeed");
        assert!(player.sources.lock().is_empty());
        assert!(player.position_timer.lock().is_none());
    }

    #[test]
    fn mime_to_gst_media_type_covers_the_three_source_kinds() {
        assert_eq!(mime_to_gst_media_type("audio/mp4"), "audio/mpeg");
        assert_eq!(mime_to_gst_media_type("video/h264"), "video/x-h264");
        assert_eq!(mime_to_gst_media_type("text/vtt"), "application/x-subtitle");
    }
}
