//! Single-consumer task queues and the pipeline-bus dispatcher thread.
//!
//! `Worker`/`MainThread` implement the per-entity cooperative scheduler
//! every session and web-audio session is built on: one thread consumes a
//! FIFO of boxed closures, `enqueueTask` is fire-and-forget,
//! `enqueueTaskAndWait` blocks the caller until the task has run.
//! `Dispatcher` is the generic bus-poll thread shape used by the pipeline
//! layer to translate bus messages into `MainThread` tasks.

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod dispatcher;
mod worker;

pub use dispatcher::{BusPoller, DispatchControl, Dispatcher};
pub use worker::{ClientId, MainThread, Task, Worker};
