//! The single-consumer task queue (`Worker`) and its per-entity wrapper
//! (`MainThread`).

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A unit of work posted to a [`Worker`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Opaque id returned by [`MainThread::register_client`].
///
/// Producers from the same client execute in FIFO order; across producers,
/// ordering is enqueue-time FIFO (the id itself carries no scheduling
/// weight — it exists so call sites have something concrete to hold,
/// matching the contract's shape).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

/// A single thread pulling [`Task`]s from a FIFO and executing them
/// synchronously, one at a time, to completion.
///
/// A task that panics is caught at this boundary and logged rather than
/// taking the whole worker down — the next task still runs.
pub struct Worker {
    sender: crossbeam_channel::Sender<Task>,
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns the worker thread.
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let active = Arc::new(AtomicBool::new(true));
        let active_thread = active.clone();
        let thread_name = name.into();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                for task in receiver.iter() {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!(thread = %thread_name, "worker task panicked");
                    }
                    if !active_thread.load(Ordering::SeqCst) {
                        break;
                    }
                }
            })
            .expect("failed to spawn worker thread");

        Self {
            sender,
            active,
            handle: Some(handle),
        }
    }

    /// Fire-and-forget: posts `task` to the back of the queue.
    pub fn enqueue(&self, task: Task) {
        if self.sender.send(task).is_err() {
            tracing::warn!("worker queue is closed, dropping task");
        }
    }

    /// Posts `task` and blocks the caller until it has run.
    pub fn enqueue_and_wait<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        self.enqueue(Box::new(move || {
            task();
            let _ = done_tx.send(());
        }));
        let _ = done_rx.recv();
    }

    /// Posts the shutdown task (always last) and joins the thread.
    pub fn shutdown(&mut self) {
        let active = self.active.clone();
        self.enqueue(Box::new(move || {
            active.store(false, Ordering::SeqCst);
        }));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

/// The per-session/per-web-audio-session single-consumer scheduler.
///
/// # Examples
///
/// ```
/// use rialto_worker::MainThread;
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::sync::Arc;
///
/// let main_thread = MainThread::new("session-1");
/// let client = main_thread.register_client();
/// let counter = Arc::new(AtomicU32::new(0));
/// let counter2 = counter.clone();
/// main_thread.enqueue_task_and_wait(client, move || {
///     counter2.fetch_add(1, Ordering::SeqCst);
/// });
/// assert_eq!(counter.load(Ordering::SeqCst), 1);
/// ```
pub struct MainThread {
    worker: Worker,
    next_client_id: AtomicU64,
}

impl MainThread {
    /// Creates a MainThread with its own private worker.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            worker: Worker::new(name),
            next_client_id: AtomicU64::new(0),
        }
    }

    /// Registers a task producer, returning its opaque id.
    pub fn register_client(&self) -> ClientId {
        ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Fire-and-forget task enqueue.
    pub fn enqueue_task<F>(&self, _client: ClientId, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.worker.enqueue(Box::new(task));
    }

    /// Enqueues a task and blocks until it has run.
    pub fn enqueue_task_and_wait<F>(&self, _client: ClientId, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.worker.enqueue_and_wait(task);
    }

    /// Posts the shutdown task and joins the worker thread.
    pub fn shutdown(&mut self) {
        self.worker.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[test]
    fn tasks_from_same_producer_run_in_fifo_order() {
        let main_thread = MainThread::new("test");
        let client = main_thread.register_client();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            main_thread.enqueue_task(client, move || {
                order.lock().unwrap().push(i);
            });
        }
        main_thread.enqueue_task_and_wait(client, || {});
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn enqueue_and_wait_blocks_until_task_ran() {
        let main_thread = MainThread::new("test");
        let client = main_thread.register_client();
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();
        main_thread.enqueue_task_and_wait(client, move || {
            thread::sleep(std::time::Duration::from_millis(10));
            counter2.store(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_panicking_task_does_not_stop_the_worker() {
        let main_thread = MainThread::new("test");
        let client = main_thread.register_client();
        main_thread.enqueue_task(client, || panic!("boom"));
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();
        main_thread.enqueue_task_and_wait(client, move || {
            counter2.store(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
