//! A minimal single-source pipeline for the Web Audio ring-buffer path:
//! one `appsrc` feeding straight into an audio sink, no decodebin (PCM
//! arrives already decoded) and no per-source bookkeeping.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use rialto_shared_types::{Caps, RialtoError, RialtoResult};

/// Pipeline backing one Web Audio handle: `appsrc ! audioconvert ! sink`.
pub struct WebAudioPipelinePlayer {
    pipeline: gst::Pipeline,
    app_src: gst_app::AppSrc,
    sink: gst::Element,
}

impl WebAudioPipelinePlayer {
    /// Builds and links the pipeline, wiring caps from `caps` onto the
    /// `appsrc`. Leaves the pipeline in `NULL`.
    pub fn new(name: &str, caps: &Caps) -> RialtoResult<Self> {
        gst::init().map_err(|e| RialtoError::PipelineFailure(e.to_string()))?;
        let pipeline = gst::Pipeline::builder().name(name).build();

        let app_src = gst_app::AppSrc::builder()
            .name(format!("{name}-src"))
            .format(gst::Format::Time)
            .is_live(true)
            .build();
        let convert = gst::ElementFactory::make("audioconvert")
            .build()
            .map_err(to_pipeline_err)?;
        let sink = gst::ElementFactory::make("autoaudiosink")
            .build()
            .map_err(to_pipeline_err)?;

        pipeline
            .add_many([app_src.upcast_ref::<gst::Element>(), &convert, &sink])
            .map_err(to_pipeline_err)?;
        gst::Element::link_many([app_src.upcast_ref::<gst::Element>(), &convert, &sink])
            .map_err(to_pipeline_err)?;

        let mut builder = gst::Caps::builder("audio/x-raw");
        if let Some(rate) = caps.sample_rate {
            builder = builder.field("rate", rate as i32);
        }
        if let Some(channels) = caps.channels {
            builder = builder.field("channels", channels as i32);
        }
        app_src.set_caps(Some(&builder.build()));

        Ok(Self { pipeline, app_src, sink })
    }

    /// The pipeline's message bus.
    pub fn bus(&self) -> Option<gst::Bus> {
        self.pipeline.bus()
    }

    /// Moves the pipeline to `PLAYING`.
    pub fn play(&self) -> RialtoResult<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map(|_| ())
            .map_err(|e| RialtoError::PipelineFailure(e.to_string()))
    }

    /// Moves the pipeline to `PAUSED`.
    pub fn pause(&self) -> RialtoResult<()> {
        self.pipeline
            .set_state(gst::State::Paused)
            .map(|_| ())
            .map_err(|e| RialtoError::PipelineFailure(e.to_string()))
    }

    /// Tears the pipeline down to `NULL`.
    pub fn stop(&self) -> RialtoResult<()> {
        self.pipeline
            .set_state(gst::State::Null)
            .map(|_| ())
            .map_err(|e| RialtoError::PipelineFailure(e.to_string()))
    }

    /// Pushes one chunk of raw PCM read out of the ring buffer.
    pub fn push_pcm(&self, payload: &[u8]) -> RialtoResult<()> {
        let buffer = gst::Buffer::from_slice(payload.to_vec());
        self.app_src
            .push_buffer(buffer)
            .map_err(|e| RialtoError::PipelineFailure(format!("push_buffer failed: {e:?}")))?;
        Ok(())
    }

    /// Signals end-of-stream on the ingress element, for `setEos` once the
    /// ring buffer has fully drained.
    pub fn end_of_stream(&self) -> RialtoResult<()> {
        self.app_src
            .end_of_stream()
            .map(|_| ())
            .map_err(|e| RialtoError::PipelineFailure(format!("end_of_stream failed: {e:?}")))
    }

    /// Bytes currently queued inside the `appsrc`, not yet consumed
    /// downstream (`getBufferDelay`'s pipeline-side term).
    pub fn queued_bytes(&self) -> u64 {
        self.app_src.current_level_bytes()
    }

    /// Sets stream volume, `0.0..=1.0`.
    pub fn set_volume(&self, volume: f64) -> RialtoResult<()> {
        if self.sink.has_property("volume") {
            self.sink.set_property("volume", volume);
            Ok(())
        } else {
            Err(RialtoError::PipelineFailure("audio sink exposes no stream-volume interface".into()))
        }
    }

    /// Reads the current stream volume.
    pub fn get_volume(&self) -> RialtoResult<f64> {
        if self.sink.has_property("volume") {
            Ok(self.sink.property("volume"))
        } else {
            Err(RialtoError::PipelineFailure("audio sink exposes no stream-volume interface".into()))
        }
    }
}

fn to_pipeline_err(e: impl std::fmt::Display) -> RialtoError {
    RialtoError::PipelineFailure(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_web_audio_pipeline_builds_and_links() {
        let caps = Caps {
            mime_type: "audio/x-raw".into(),
            sample_rate: Some(48_000),
            channels: Some(2),
            ..Default::default()
        };
        let player = WebAudioPipelinePlayer::new("test-web-audio", &caps)
            .expect("pipeline construction should succeed");
        assert!(player.bus().is_some());
    }
}
