//! The bus-poll dispatcher thread.
//!
//! Generic over the message source so the pipeline layer can hand it a
//! GStreamer bus while the rest of the queueing/shutdown plumbing stays
//! shared and testable without a real pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Source of bus messages a [`Dispatcher`] polls.
pub trait BusPoller: Send + 'static {
    /// The message type this poller yields.
    type Message: Send + 'static;

    /// Blocks for up to `timeout`, returning the next message if one
    /// arrived in time.
    fn poll_timeout(&self, timeout: Duration) -> Option<Self::Message>;
}

/// What the message handler wants the dispatch loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchControl {
    /// Keep polling.
    Continue,
    /// Stop the dispatcher thread.
    Exit,
}

/// A single thread per active pipeline, polling its bus with a bounded
/// timeout and translating messages into a caller-supplied handler (which,
/// for the pipeline layer, enqueues a `HandleBusMessage` task onto the
/// owning session's `MainThread`).
pub struct Dispatcher {
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns the dispatcher thread.
    ///
    /// `poll_timeout` is typically `Duration::from_millis(100)`, matching
    /// the bus-poll interval used everywhere else in this system.
    pub fn spawn<P, F>(poller: P, poll_timeout: Duration, mut on_message: F) -> Self
    where
        P: BusPoller,
        F: FnMut(P::Message) -> DispatchControl + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let active_thread = active.clone();

        let handle = thread::spawn(move || {
            while active_thread.load(Ordering::SeqCst) {
                if let Some(message) = poller.poll_timeout(poll_timeout) {
                    if on_message(message) == DispatchControl::Exit {
                        break;
                    }
                }
            }
        });

        Self {
            active,
            handle: Some(handle),
        }
    }

    /// Stops the dispatcher and joins its thread. Idempotent.
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// True while the dispatcher thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CountingPoller {
        remaining: Mutex<u32>,
    }

    impl BusPoller for Arc<CountingPoller> {
        type Message = u32;

        fn poll_timeout(&self, _timeout: Duration) -> Option<u32> {
            let mut remaining = self.remaining.lock().unwrap();
            if *remaining == 0 {
                thread::sleep(Duration::from_millis(5));
                return None;
            }
            *remaining -= 1;
            Some(*remaining)
        }
    }

    #[test]
    fn exit_control_stops_the_loop() {
        let poller = Arc::new(CountingPoller {
            remaining: Mutex::new(3),
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let mut dispatcher = Dispatcher::spawn(poller, Duration::from_millis(1), move |msg| {
            seen2.lock().unwrap().push(msg);
            if msg == 0 {
                DispatchControl::Exit
            } else {
                DispatchControl::Continue
            }
        });
        thread::sleep(Duration::from_millis(50));
        dispatcher.stop();
        assert_eq!(*seen.lock().unwrap(), vec![2, 1, 0]);
    }
}
