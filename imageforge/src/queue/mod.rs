//! Bounded worker queue over dedicated OS threads.
//!
//! The native raster pipeline keeps thread-local state that must never
//! migrate between OS threads, so render work cannot run on the async
//! runtime's pool. Instead a fixed set of workers each own one OS thread for
//! the life of the process and consume jobs from a bounded MPMC intake:
//!
//! ```text
//!                    try_send (never blocks)
//! process() ────────────────┐
//! process() ──────────────┐ │        ┌──► worker thread 0 ─┐
//! process() ────────────┐ │ │        │                     │ oneshot
//!                       ▼ ▼ ▼        ├──► worker thread 1 ─┼──────────► caller
//!                  [intake: 4 × N]───┤                     │
//!                                    └──► worker thread N ─┘
//! ```
//!
//! Intake capacity is `4 × worker_count`. A submission that cannot be
//! buffered immediately fails with [`QueueError::Full`] so the caller can
//! shed load instead of stacking latency. Callers await their job's oneshot
//! result or their own cancellation, whichever comes first; a worker that
//! finishes a job nobody waits for drops the result without blocking.
//!
//! On shutdown the intake closes, workers drain whatever is buffered
//! (answering cancelled jobs without running them) and exit.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::QUEUE_DEPTH_PER_WORKER;

/// Submission and processing failures.
///
/// `E` is the handler's own error type, passed through untouched.
#[derive(Debug, Error, PartialEq)]
pub enum QueueError<E> {
    /// The intake buffer was full; the job was never enqueued.
    #[error("queue is full")]
    Full,
    /// The queue has been shut down; no new work is accepted.
    #[error("queue has been shut down")]
    Shutdown,
    /// The caller's cancellation fired before the job produced a result.
    #[error("job cancelled")]
    Cancelled,
    /// The handler ran and failed.
    #[error("{0}")]
    Handler(E),
}

/// The work function executed on a worker thread.
pub trait JobHandler: Send + Sync + 'static {
    type Job: Send + 'static;
    type Output: Send + 'static;
    type Error: Send + 'static;

    /// Runs one job. Executes synchronously on the worker's own OS thread;
    /// `cancel` is the submitting caller's token, already checked before
    /// dispatch but available for long handlers that can bail early.
    fn run(&self, cancel: &CancellationToken, job: Self::Job) -> Result<Self::Output, Self::Error>;
}

struct QueuedJob<H: JobHandler> {
    job: H::Job,
    cancel: CancellationToken,
    result_tx: oneshot::Sender<Result<H::Output, QueueError<H::Error>>>,
}

/// Fixed-size worker pool with a bounded FIFO intake.
pub struct WorkQueue<H: JobHandler> {
    worker_count: usize,
    handler: Arc<H>,
    shutdown: CancellationToken,
    /// Taken (dropped) at shutdown to close the intake.
    intake: Mutex<Option<Sender<QueuedJob<H>>>>,
    /// Taken by `run` to hand to the workers.
    intake_rx: Mutex<Option<Receiver<QueuedJob<H>>>>,
}

impl<H: JobHandler> WorkQueue<H> {
    /// Creates a queue with `worker_count` workers and an intake buffer of
    /// `4 × worker_count` jobs. Workers start when [`run`](Self::run) is
    /// called.
    pub fn new(shutdown: CancellationToken, worker_count: usize, handler: Arc<H>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(worker_count * QUEUE_DEPTH_PER_WORKER);
        Self {
            worker_count,
            handler,
            shutdown,
            intake: Mutex::new(Some(tx)),
            intake_rx: Mutex::new(Some(rx)),
        }
    }

    /// Spawns the workers and blocks until shutdown, then closes the intake
    /// and joins the workers after they drain.
    ///
    /// Calling `run` a second time returns immediately.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let Some(receiver) = self.intake_rx.lock().unwrap().take() else {
            return Ok(());
        };

        let mut workers = Vec::with_capacity(self.worker_count);
        for index in 0..self.worker_count {
            let receiver = receiver.clone();
            let handler = Arc::clone(&self.handler);
            let thread = std::thread::Builder::new()
                .name(format!("render-worker-{index}"))
                .spawn(move || worker_loop(index, receiver, handler))?;
            workers.push(thread);
        }
        drop(receiver);
        info!(workers = self.worker_count, "render queue started");

        self.shutdown.cancelled().await;

        // Closing the intake lets workers drain the backlog and exit.
        self.intake.lock().unwrap().take();
        let join = tokio::task::spawn_blocking(move || {
            for worker in workers {
                let _ = worker.join();
            }
        });
        let _ = join.await;
        info!("render queue drained and stopped");
        Ok(())
    }

    /// Submits a job and awaits its result.
    ///
    /// Fails immediately with [`QueueError::Shutdown`] after shutdown and
    /// with [`QueueError::Full`] when the intake buffer has no free slot;
    /// enqueueing never blocks. Once enqueued, the call resolves with the
    /// job's result or, if `cancel` fires first, with
    /// [`QueueError::Cancelled`] while the worker's eventual result is
    /// discarded.
    pub async fn process(
        &self,
        cancel: &CancellationToken,
        job: H::Job,
    ) -> Result<H::Output, QueueError<H::Error>> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Shutdown);
        }
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let (result_tx, result_rx) = oneshot::channel();
        let queued = QueuedJob {
            job,
            cancel: cancel.clone(),
            result_tx,
        };

        let send_result = match self.intake.lock().unwrap().as_ref() {
            Some(sender) => sender.try_send(queued),
            None => return Err(QueueError::Shutdown),
        };
        match send_result {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(QueueError::Full),
            Err(TrySendError::Disconnected(_)) => return Err(QueueError::Shutdown),
        }

        tokio::select! {
            result = result_rx => result.unwrap_or(Err(QueueError::Shutdown)),
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
        }
    }

    /// Intake capacity, `4 × worker_count`.
    pub fn capacity(&self) -> usize {
        self.worker_count * QUEUE_DEPTH_PER_WORKER
    }
}

/// One worker: owns its OS thread until the intake disconnects.
fn worker_loop<H: JobHandler>(index: usize, intake: Receiver<QueuedJob<H>>, handler: Arc<H>) {
    debug!(worker = index, "render worker started");
    while let Ok(queued) = intake.recv() {
        // Jobs whose caller already gave up are answered without running.
        if queued.cancel.is_cancelled() {
            let _ = queued.result_tx.send(Err(QueueError::Cancelled));
            continue;
        }

        let result = handler
            .run(&queued.cancel, queued.job)
            .map_err(QueueError::Handler);
        // A send failure means the caller stopped waiting; the result is
        // simply dropped.
        let _ = queued.result_tx.send(result);
    }
    debug!(worker = index, "render worker stopped");
}
