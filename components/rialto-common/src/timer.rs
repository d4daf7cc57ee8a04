//! One-shot and periodic cancellable timers.
//!
//! Mirrors the original `ITimer`/`Timer` contract: a private thread waits
//! on a condition variable for either the timeout or a cancellation
//! request, runs the callback on that same thread, and `cancel()` is
//! idempotent and safe to call re-entrantly from inside the callback
//! itself (it must not try to join its own thread).

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Whether a timer fires once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Fires once, then becomes inactive.
    OneShot,
    /// Fires every `timeout` until cancelled.
    Periodic,
}

struct Shared {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

/// A cancellable timer running its callback on a private thread.
///
/// Synchronization between the callback and any other owner (typically a
/// session's MainThread) is the caller's responsibility — the callback
/// should enqueue a task rather than touch shared state directly.
pub struct Timer {
    active: Arc<AtomicBool>,
    shared: Arc<Shared>,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Starts a timer immediately.
    ///
    /// # Examples
    ///
    /// ```
    /// use rialto_common::{Timer, TimerType};
    /// use std::sync::atomic::{AtomicU32, Ordering};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let count = Arc::new(AtomicU32::new(0));
    /// let count2 = count.clone();
    /// let mut timer = Timer::new(Duration::from_millis(5), move || {
    ///     count2.fetch_add(1, Ordering::SeqCst);
    /// }, TimerType::OneShot);
    /// std::thread::sleep(Duration::from_millis(50));
    /// assert_eq!(count.load(Ordering::SeqCst), 1);
    /// assert!(!timer.is_active());
    /// timer.cancel();
    /// ```
    pub fn new<F>(timeout: Duration, mut callback: F, timer_type: TimerType) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(Shared {
            cancelled: Mutex::new(false),
            condvar: Condvar::new(),
        });

        let active_thread = active.clone();
        let shared_thread = shared.clone();

        let handle = thread::spawn(move || loop {
            let mut cancelled = shared_thread.cancelled.lock();
            let timed_out = shared_thread
                .condvar
                .wait_for(&mut cancelled, timeout)
                .timed_out();

            if *cancelled {
                drop(cancelled);
                break;
            }
            drop(cancelled);

            if !timed_out {
                // Spurious wake with no cancellation: re-wait for the
                // remaining timeout rather than firing early.
                continue;
            }

            callback();

            if timer_type == TimerType::OneShot {
                break;
            }
        });

        let thread_id = handle.thread().id();

        // The worker clears `active` itself right before returning, but a
        // periodic timer never returns on its own, so drive `active` from
        // a second thin wrapper instead of relying on the worker's exit.
        let active_watch = active.clone();
        let handle = Self::supervise(handle, active_watch, timer_type);

        Self {
            active,
            shared,
            thread_id,
            handle: Some(handle),
        }
    }

    fn supervise(
        worker: JoinHandle<()>,
        active: Arc<AtomicBool>,
        timer_type: TimerType,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let _ = worker.join();
            if timer_type == TimerType::OneShot {
                active.store(false, Ordering::SeqCst);
            }
        })
    }

    /// Cancels the timer. Idempotent, and safe to call from within the
    /// timer's own callback (it will not attempt to join its own thread,
    /// which would deadlock).
    pub fn cancel(&mut self) {
        {
            let mut cancelled = self.shared.cancelled.lock();
            if *cancelled {
                return;
            }
            *cancelled = true;
            self.shared.condvar.notify_one();
        }
        self.active.store(false, Ordering::SeqCst);

        if thread::current().id() != self.thread_id {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        } else {
            self.handle = None;
        }
    }

    /// True between construction and first expiry (one-shot) or until
    /// `cancel` (periodic).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn cancelled_timer_never_fires_again() {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        let mut timer = Timer::new(
            Duration::from_millis(20),
            move || {
                count2.fetch_add(1, Ordering::SeqCst);
            },
            TimerType::Periodic,
        );
        thread::sleep(Duration::from_millis(30));
        timer.cancel();
        assert!(!timer.is_active());
        let fired_at_cancel = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), fired_at_cancel);
    }

    #[test]
    fn one_shot_becomes_inactive_after_firing() {
        let mut timer = Timer::new(Duration::from_millis(5), || {}, TimerType::OneShot);
        thread::sleep(Duration::from_millis(40));
        assert!(!timer.is_active());
        timer.cancel();
    }

    #[test]
    fn cancel_from_within_callback_does_not_deadlock() {
        let timer: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
        let timer2 = timer.clone();
        let t = Timer::new(
            Duration::from_millis(5),
            move || {
                if let Some(inner) = timer2.lock().as_mut() {
                    inner.cancel();
                }
            },
            TimerType::OneShot,
        );
        *timer.lock() = Some(t);
        thread::sleep(Duration::from_millis(40));
    }
}
