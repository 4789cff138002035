//! Deferred bookkeeping on a single background task.
//!
//! Jobs run one at a time, in submission order, once their delay has
//! elapsed. Shutting down drops every job that has not run yet.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Scheduled {
    due: Instant,
    label: String,
    job: Job,
}

/// A single-worker delayed job queue.
pub struct Housekeeper {
    sender: Mutex<Option<mpsc::UnboundedSender<Scheduled>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Housekeeper {
    /// Start the worker task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(rx));
        debug!("Started housekeeping worker");
        Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Run `job` after `delay`.
    ///
    /// Returns false if the housekeeper has been shut down.
    pub fn schedule(
        &self,
        label: impl Into<String>,
        delay: Duration,
        job: impl Future<Output = ()> + Send + 'static,
    ) -> bool {
        let scheduled = Scheduled {
            due: Instant::now() + delay,
            label: label.into(),
            job: Box::pin(job),
        };
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(scheduled).is_ok())
    }

    /// Stop the worker and drop pending jobs. Safe to call more than once.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
            info!("Housekeeping worker stopped");
        }
    }

    /// Returns true until [`shutdown`](Self::shutdown) is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Scheduled>) {
    while let Some(Scheduled { due, label, job }) = rx.recv().await {
        tokio::time::sleep_until(due).await;
        debug!(job = %label, "Running housekeeping job");
        job.await;
    }
}
