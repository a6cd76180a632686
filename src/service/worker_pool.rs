//! Bounded worker pool.
//!
//! A fixed number of long-lived tasks pull work from one bounded queue. Submission
//! never waits: a full queue is reported to the caller as `QueueFull` so the
//! receive path can apply its overflow policy instead of stalling.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{constants, ProtocolError, Result};

type Task = BoxFuture<'static, ()>;

pub struct WorkerPool {
    sender: StdMutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    worker_count: usize,
    capacity: usize,
}

impl WorkerPool {
    /// Spawn `worker_count` workers over a queue holding `capacity` tasks.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(worker_count: usize, capacity: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(ProtocolError::ConfigError(
                "Worker count must be greater than 0".to_string(),
            ));
        }
        if capacity == 0 {
            return Err(ProtocolError::ConfigError(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::channel::<Task>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, receiver.clone())))
            .collect();

        debug!(worker_count, capacity, "Worker pool started");

        Ok(Self {
            sender: StdMutex::new(Some(sender)),
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
            worker_count,
            capacity,
        })
    }

    /// Enqueue `task` without waiting.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(ProtocolError::PoolClosed);
        }

        let guard = self
            .sender
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;
        let sender = guard.as_ref().ok_or(ProtocolError::PoolClosed)?;

        match sender.try_send(Box::pin(task)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ProtocolError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(ProtocolError::PoolClosed),
        }
    }

    /// Stop accepting work, let the workers drain the queue, and wait for them to exit.
    ///
    /// Every caller returns only after the drain has finished.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }

        // Held across the joins so concurrent callers wait for the same drain.
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        debug!("Worker pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        match self.sender.lock() {
            Ok(guard) => guard
                .as_ref()
                .map_or(0, |sender| self.capacity - sender.capacity()),
            Err(_) => 0,
        }
    }
}

async fn worker_loop(worker_id: usize, receiver: Arc<Mutex<mpsc::Receiver<Task>>>) {
    loop {
        let task = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(task) = task else { break };

        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            error!(worker_id, "Task panicked");
        }
    }
    debug!(worker_id, "Worker exited");
}
