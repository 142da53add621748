//! Subject-keyed queue collection
//!
//! Lazily creates one [`SequentialQueue`] per subject behind a shared
//! handler. This is the surface the engine uses: it never manages individual
//! workers, it enqueues by subject and reads aggregate health counters.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::QueueError;
use crate::worker::{SequentialQueue, SubjectHandler};

/// Collection of per-subject queues sharing one handler
pub struct SubjectQueues<E> {
    handler: SubjectHandler<E>,
    queues: Mutex<HashMap<String, SequentialQueue<E>>>,
    closed: Mutex<bool>,
}

impl<E: Send + 'static> SubjectQueues<E> {
    pub fn new(handler: SubjectHandler<E>) -> Self {
        SubjectQueues {
            handler,
            queues: Mutex::new(HashMap::new()),
            closed: Mutex::new(false),
        }
    }

    fn with_queue<R>(
        &self,
        subject: &str,
        f: impl FnOnce(&SequentialQueue<E>) -> R,
    ) -> Result<R, QueueError> {
        if *self.closed.lock() {
            return Err(QueueError::Closed);
        }
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(subject.to_string())
            .or_insert_with(|| SequentialQueue::new(subject, self.handler.clone(), true));
        Ok(f(queue))
    }

    /// Append an event for a subject, creating its worker on first use
    pub fn enqueue(&self, subject: &str, event: E) -> Result<(), QueueError> {
        self.with_queue(subject, |q| q.enqueue(event))?
    }

    /// Insert an event at the head of a subject's buffer
    pub fn enqueue_next(&self, subject: &str, event: E) -> Result<(), QueueError> {
        self.with_queue(subject, |q| q.enqueue_next(event))?
    }

    /// Resume dispatching for a subject
    pub fn start(&self, subject: &str) {
        let _ = self.with_queue(subject, |q| q.start());
    }

    /// Pause dispatching for a subject; buffered events are kept
    pub fn stop(&self, subject: &str) {
        let _ = self.with_queue(subject, |q| q.stop());
    }

    pub fn is_running(&self, subject: &str) -> bool {
        self.queues
            .lock()
            .get(subject)
            .map(|q| q.is_running())
            .unwrap_or(false)
    }

    /// Buffered events for one subject
    pub fn buffered_count_for(&self, subject: &str) -> usize {
        self.queues
            .lock()
            .get(subject)
            .map(|q| q.buffered_count())
            .unwrap_or(0)
    }

    /// Buffered events across all subjects
    pub fn buffered_count(&self) -> usize {
        self.queues.lock().values().map(|q| q.buffered_count()).sum()
    }

    /// Completed events for one subject
    pub fn processed_count_for(&self, subject: &str) -> u64 {
        self.queues
            .lock()
            .get(subject)
            .map(|q| q.processed_count())
            .unwrap_or(0)
    }

    /// Completed events across all subjects
    pub fn processed_count(&self) -> u64 {
        self.queues
            .lock()
            .values()
            .map(|q| q.processed_count())
            .sum()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.queues.lock().keys().cloned().collect()
    }

    /// Shut down one subject's worker and drop its queue, discarding
    /// whatever it still buffered
    pub fn remove(&self, subject: &str) -> bool {
        let removed = self.queues.lock().remove(subject);
        match removed {
            Some(queue) => {
                queue.close();
                true
            }
            None => false,
        }
    }

    /// Shut down all workers and refuse further events
    pub fn close_all(&self) {
        *self.closed.lock() = true;
        let queues = self.queues.lock();
        for queue in queues.values() {
            queue.close();
        }
    }
}
