//! Fan-out ping → aggregated ack.
//!
//! A `HeartbeatProcedure` hands out one [`HeartbeatHandler`] per subsystem
//! for a given ping. Each handler is an RAII sentinel: the subsystem that
//! receives it (by way of `ping(handler)`) takes ownership and drops it
//! once its own MainThread task has run. When the last handler for a ping
//! is dropped, the completion callback fires with `success = !any error()`.
//! A handler that is never dropped is the deadlock signal a host's
//! healthcheck window detects.

#![warn(missing_docs)]
#![deny(unsafe_code)]

use parking_lot::Mutex;
use rialto_shared_types::PingId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct Aggregate {
    ping_id: PingId,
    tainted: AtomicBool,
    remaining: AtomicUsize,
    on_complete: Mutex<Option<Box<dyn FnOnce(PingId, bool) + Send>>>,
}

/// Fans a single `Ping{id}` out into one handler per registered subsystem.
pub struct HeartbeatProcedure {
    subsystem_count: usize,
}

impl HeartbeatProcedure {
    /// Creates a procedure that fans every ping out to `subsystem_count`
    /// handlers (one per `PlaybackService`/`CdmService`/`ControlService`-
    /// style subsystem registered with the host).
    pub fn new(subsystem_count: usize) -> Self {
        Self { subsystem_count }
    }

    /// Creates the handlers for one `Ping{ping_id}`. `on_complete` runs
    /// exactly once, when the last handler is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use rialto_heartbeat::HeartbeatProcedure;
    /// use rialto_shared_types::PingId;
    /// use std::sync::atomic::{AtomicBool, Ordering};
    /// use std::sync::Arc;
    ///
    /// let procedure = HeartbeatProcedure::new(2);
    /// let acked = Arc::new(AtomicBool::new(false));
    /// let acked2 = acked.clone();
    /// let handlers = procedure.create_handlers(PingId::from_raw(1), move |_id, success| {
    ///     acked2.store(success, Ordering::SeqCst);
    /// });
    /// drop(handlers);
    /// assert!(acked.load(Ordering::SeqCst));
    /// ```
    pub fn create_handlers<F>(&self, ping_id: PingId, on_complete: F) -> Vec<HeartbeatHandler>
    where
        F: FnOnce(PingId, bool) + Send + 'static,
    {
        let aggregate = Arc::new(Aggregate {
            ping_id,
            tainted: AtomicBool::new(false),
            remaining: AtomicUsize::new(self.subsystem_count),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        });

        (0..self.subsystem_count)
            .map(|_| HeartbeatHandler {
                aggregate: aggregate.clone(),
            })
            .collect()
    }
}

/// An RAII handle to one subsystem's share of a ping.
///
/// Dropping it (typically on the owning entity's MainThread, after the
/// heartbeat task has run to completion) decrements the aggregate's
/// refcount; reaching zero emits the `AckEvent`.
pub struct HeartbeatHandler {
    aggregate: Arc<Aggregate>,
}

impl HeartbeatHandler {
    /// Marks this subsystem's share of the ping as failed. Taints the
    /// aggregated result even if every handler is eventually dropped.
    pub fn error(&self) {
        self.aggregate.tainted.store(true, Ordering::SeqCst);
    }
}

impl Drop for HeartbeatHandler {
    fn drop(&mut self) {
        if self.aggregate.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(on_complete) = self.aggregate.on_complete.lock().take() {
                let success = !self.aggregate.tainted.load(Ordering::SeqCst);
                on_complete(self.aggregate.ping_id, success);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn ack_fires_once_all_handlers_are_dropped() {
        let procedure = HeartbeatProcedure::new(3);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let mut handlers =
            procedure.create_handlers(PingId::from_raw(7), move |id, success| {
                assert_eq!(id, PingId::from_raw(7));
                assert!(success);
                fired2.store(true, Ordering::SeqCst);
            });

        handlers.pop();
        assert!(!fired.load(Ordering::SeqCst));
        handlers.pop();
        assert!(!fired.load(Ordering::SeqCst));
        handlers.pop();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn an_error_on_any_handler_taints_the_ack() {
        let procedure = HeartbeatProcedure::new(2);
        let success_seen = Arc::new(AtomicBool::new(true));
        let success_seen2 = success_seen.clone();
        let mut handlers =
            procedure.create_handlers(PingId::from_raw(1), move |_id, success| {
                success_seen2.store(success, Ordering::SeqCst);
            });

        handlers[0].error();
        drop(handlers);
        assert!(!success_seen.load(Ordering::SeqCst));
    }
}
