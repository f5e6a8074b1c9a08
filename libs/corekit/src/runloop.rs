//! Run loops for deferred work.
//!
//! Anything the runtime defers (bus delivery) is handed to a [`Scheduler`] as a
//! [`Task`]. Two loops are provided: [`TickQueue`], driven explicitly by the host or
//! a test, and [`TokioScheduler`], an actor mailbox drained by one tokio task.
//! Both run tasks in scheduling order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::unwind::catch_panic;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Queues `task` to run after the current call stack has unwound.
    fn schedule(&self, task: Task);
}

/// Deterministic FIFO run loop.
#[derive(Default)]
pub struct TickQueue {
    queue: Mutex<VecDeque<Task>>,
}

impl fmt::Debug for TickQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

impl TickQueue {
    /// Upper bound on ticks for [`TickQueue::run_until_idle`].
    pub const MAX_TICKS: usize = 10_000;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs the tasks queued before this call; tasks they schedule wait for the next tick.
    ///
    /// Returns how many tasks ran. On a task error (a panic counts as one) the rest of
    /// the batch is put back at the front of the queue and the error is returned.
    pub fn tick(&self) -> anyhow::Result<usize> {
        let mut batch: VecDeque<Task> = std::mem::take(&mut *self.queue.lock());
        let mut ran = 0;

        while let Some(task) = batch.pop_front() {
            ran += 1;
            if let Err(e) = catch_panic(task) {
                let mut queue = self.queue.lock();
                while let Some(rest) = batch.pop_back() {
                    queue.push_front(rest);
                }
                return Err(e);
            }
        }
        Ok(ran)
    }

    /// Ticks until no task is pending. Returns the total number of tasks run.
    pub fn run_until_idle(&self) -> anyhow::Result<usize> {
        let mut total = 0;
        for _ in 0..Self::MAX_TICKS {
            if self.pending() == 0 {
                return Ok(total);
            }
            total += self.tick()?;
        }
        anyhow::bail!(
            "run loop still busy after {} ticks ({} tasks pending)",
            Self::MAX_TICKS,
            self.pending()
        )
    }
}

impl Scheduler for TickQueue {
    fn schedule(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}

enum Message {
    Run(Task),
    Flush(oneshot::Sender<()>),
}

/// Mailbox drained by a single spawned tokio task.
///
/// Must be created inside a tokio runtime.
pub struct TokioScheduler {
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("open", &self.tx.lock().is_some())
            .field("pending", &self.pending())
            .finish()
    }
}

impl TokioScheduler {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);
        let worker = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Message::Run(task) => {
                        let result = catch_panic(task);
                        worker_pending.fetch_sub(1, Ordering::AcqRel);
                        if let Err(e) = result {
                            tracing::error!(target: "corekit", error = %e, "Deferred task failed");
                        }
                    }
                    Message::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!(target: "corekit", "Run loop drained");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            pending,
        }
    }

    /// Tasks scheduled but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Waits until every task scheduled before this call has run.
    ///
    /// Tasks scheduled by those tasks are not waited for; call again to drain them.
    ///
    /// Returns `false` if the mailbox is closed or the worker is gone.
    pub async fn flush(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if !self.send(Message::Flush(done_tx)) {
            return false;
        }
        done_rx.await.is_ok()
    }

    /// Flushes until no task is pending, including tasks scheduled while draining.
    ///
    /// Returns early once the mailbox can no longer be flushed.
    pub async fn run_until_idle(&self) {
        while self.flush().await {
            if self.pending() == 0 {
                return;
            }
        }
    }

    /// Closes the mailbox and waits for the queued tasks to finish.
    ///
    /// Tasks scheduled after shutdown are dropped.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(target: "corekit", error = %e, "Run loop worker ended abnormally");
            }
        }
    }

    fn send(&self, msg: Message) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Task) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if !self.send(Message::Run(task)) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(target: "corekit", "Run loop is shut down, task dropped");
        }
    }
}
