//! Adapts a GStreamer [`gst::Bus`] to [`rialto_worker::Dispatcher`]'s
//! generic `BusPoller` trait.

use gstreamer as gst;
use gstreamer::prelude::*;
use rialto_worker::BusPoller;
use std::time::Duration;

/// Polls a pipeline's message bus with a bounded timeout.
pub struct GstBusPoller {
    bus: gst::Bus,
}

impl GstBusPoller {
    /// Wraps `bus`.
    pub fn new(bus: gst::Bus) -> Self {
        Self { bus }
    }
}

impl BusPoller for GstBusPoller {
    type Message = gst::Message;

    fn poll_timeout(&self, timeout: Duration) -> Option<gst::Message> {
        let clock_time = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        self.bus.timed_pop(clock_time)
    }
}

/// A bus message translated to session-facing semantics. No `gst` type
/// escapes this module — `rialto-media-session` reacts to these without
/// taking a dependency on the streaming-media framework.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// The pipeline hit an unrecoverable error.
    Error {
        /// Human-readable detail, as reported by the framework.
        message: String,
    },
    /// A `qos` message reported frames dropped since the last report.
    Qos {
        /// Frames dropped.
        dropped: u64,
    },
    /// A previously issued seek or state change completed.
    AsyncDone,
}

/// Translates one bus message to a [`BusEvent`], or `None` for messages
/// this system doesn't act on.
pub fn translate_bus_message(message: &gst::Message) -> Option<BusEvent> {
    use gst::MessageView;
    match message.view() {
        MessageView::Error(err) => Some(BusEvent::Error {
            message: err.error().to_string(),
        }),
        MessageView::Qos(qos) => {
            let (_format, _processed, dropped) = qos.stats();
            Some(BusEvent::Qos { dropped })
        }
        MessageView::AsyncDone(_) => Some(BusEvent::AsyncDone),
        _ => None,
    }
}
