//! Fire-and-forget work queue. `Authenticator`'s
//! `touch_api_key`, `Biller`'s transaction persistence, and
//! `ReliabilityAggregator::record` all submit onto this bounded channel
//! instead of awaiting their writes inline; a single background worker
//! drains it so submission never blocks the request path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct JobQueue {
    sender: Mutex<Option<mpsc::Sender<(&'static str, Job)>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// `capacity` bounds how many pending jobs may queue before `spawn`
    /// starts dropping work (logged, never propagated to the caller).
    pub fn new(capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<(&'static str, Job)>(capacity);
        let worker = tokio::spawn(async move {
            while let Some((name, job)) = receiver.recv().await {
                debug!(job = name, "running fire-and-forget job");
                job.await;
            }
        });
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Submits `future` for best-effort background execution. Never blocks;
    /// if the queue is full (or already shut down) the job is dropped and
    /// logged rather than stalling the request that triggered it.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(sender) => {
                if let Err(err) = sender.try_send((name, Box::pin(future))) {
                    warn!(job = name, %err, "dropped fire-and-forget job, queue full or closed");
                }
            }
            None => warn!(job = name, "dropped fire-and-forget job, queue already shut down"),
        }
    }

    /// Closes the channel so the worker drains every job already queued and
    /// exits on its own, then awaits it (graceful shutdown: in-flight
    /// persistence/demand-signal writes are not torn by a mid-job abort).
    /// Jobs submitted after this call are dropped by `spawn` instead.
    pub async fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.await;
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.sender.lock().unwrap().take();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_submitted_jobs() {
        let queue = JobQueue::new(8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            queue.spawn("increment", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
