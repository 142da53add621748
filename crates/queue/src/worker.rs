//! Single-subject worker
//!
//! One spawned task per subject drains a buffered deque and invokes the
//! handler for one event at a time. The handler borrows the event; ownership
//! stays with the worker so a parked event can be pushed back unchanged.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::QueueError;

/// Handler decision for one dispatched event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Event fully handled; the worker moves on
    Done,
    /// Re-inject the event at the head of the buffer and pause the subject
    /// until [`SequentialQueue::start`] is called
    Park,
}

/// Async handler invoked with `(subject, backlog, event)`.
///
/// `backlog` is the number of events still buffered behind the one being
/// dispatched; consumers use it as a staleness proxy.
pub type SubjectHandler<E> =
    Arc<dyn for<'a> Fn(&'a str, u64, &'a E) -> BoxFuture<'a, Verdict> + Send + Sync>;

struct QueueState<E> {
    buffer: VecDeque<E>,
    running: bool,
    /// Bumped by every `start()`; lets the worker tell whether a resume
    /// landed while a handler was still in flight.
    start_epoch: u64,
    processed: u64,
    closed: bool,
}

struct QueueShared<E> {
    state: Mutex<QueueState<E>>,
    notify: Notify,
}

/// FIFO queue for a single subject with a dedicated worker task
pub struct SequentialQueue<E> {
    subject: String,
    shared: Arc<QueueShared<E>>,
}

impl<E: Send + 'static> SequentialQueue<E> {
    /// Create the queue and spawn its worker
    pub fn new(subject: impl Into<String>, handler: SubjectHandler<E>, running: bool) -> Self {
        let subject = subject.into();
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                running,
                start_epoch: 0,
                processed: 0,
                closed: false,
            }),
            notify: Notify::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_subject = subject.clone();
        tokio::spawn(async move {
            run_worker(worker_subject, handler, worker_shared).await;
        });

        SequentialQueue { subject, shared }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Append an event to the tail of the buffer
    pub fn enqueue(&self, event: E) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.buffer.push_back(event);
        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Insert an event at the head of the buffer, ahead of everything queued
    pub fn enqueue_next(&self, event: E) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.buffer.push_front(event);
        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Resume dispatching
    pub fn start(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = true;
            state.start_epoch += 1;
        }
        self.shared.notify.notify_one();
    }

    /// Pause dispatching. The event currently in the handler still completes;
    /// buffered events stay queued.
    pub fn stop(&self) {
        self.shared.state.lock().running = false;
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Number of buffered (not yet handled) events
    pub fn buffered_count(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Number of events the handler completed with [`Verdict::Done`]
    pub fn processed_count(&self) -> u64 {
        self.shared.state.lock().processed
    }

    /// Shut the worker down, discarding any buffered events
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

impl<E> Drop for SequentialQueue<E> {
    fn drop(&mut self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

async fn run_worker<E>(subject: String, handler: SubjectHandler<E>, shared: Arc<QueueShared<E>>) {
    loop {
        let (next, epoch) = {
            let mut state = shared.state.lock();
            if state.closed {
                if !state.buffer.is_empty() {
                    tracing::debug!(
                        "queue {} closed with {} buffered events",
                        subject,
                        state.buffer.len()
                    );
                }
                return;
            }
            let next = if state.running {
                state.buffer.pop_front()
            } else {
                None
            };
            (next, state.start_epoch)
        };

        let Some(event) = next else {
            // notify_one stores a permit, so a wakeup between the check above
            // and this await is not lost
            shared.notify.notified().await;
            continue;
        };

        let backlog = shared.state.lock().buffer.len() as u64;
        let verdict = handler(&subject, backlog, &event).await;

        let mut state = shared.state.lock();
        match verdict {
            Verdict::Done => state.processed += 1,
            Verdict::Park => {
                state.buffer.push_front(event);
                // A start() that landed while the handler was in flight wins
                // over the park: the re-injected event just goes around
                // again instead of stranding the subject.
                if state.start_epoch == epoch {
                    state.running = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::{Duration, sleep};

    fn counting_handler(seen: Arc<Mutex<Vec<u64>>>) -> SubjectHandler<u64> {
        Arc::new(move |_subject, _backlog, event: &u64| {
            let seen = Arc::clone(&seen);
            let event = *event;
            async move {
                seen.lock().push(event);
                Verdict::Done
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_events_processed_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = SequentialQueue::new("btcusdt", counting_handler(Arc::clone(&seen)), true);

        for i in 0..5 {
            queue.enqueue(i).unwrap();
        }
        sleep(Duration::from_millis(50)).await;

        assert_eq!(queue.subject(), "btcusdt");
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.processed_count(), 5);
        assert_eq!(queue.buffered_count(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_next_jumps_the_line() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = SequentialQueue::new("btcusdt", counting_handler(Arc::clone(&seen)), false);

        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        queue.enqueue_next(0).unwrap();
        queue.start();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_park_reinjects_and_pauses() {
        let attempts = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handler_attempts = Arc::clone(&attempts);
        let handler_seen = Arc::clone(&seen);
        let handler: SubjectHandler<u64> = Arc::new(move |_subject, _backlog, event: &u64| {
            let attempts = Arc::clone(&handler_attempts);
            let seen = Arc::clone(&handler_seen);
            let event = *event;
            async move {
                // Park the first dispatch only
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Verdict::Park
                } else {
                    seen.lock().push(event);
                    Verdict::Done
                }
            }
            .boxed()
        });

        let queue = SequentialQueue::new("btcusdt", handler, true);
        queue.enqueue(42).unwrap();
        queue.enqueue(7).unwrap();
        sleep(Duration::from_millis(50)).await;

        // First event parked: still buffered at the head, queue paused
        assert!(!queue.is_running());
        assert_eq!(queue.buffered_count(), 2);
        assert!(seen.lock().is_empty());

        queue.start();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock(), vec![42, 7]);
        assert_eq!(queue.processed_count(), 2);
    }

    #[tokio::test]
    async fn test_start_during_in_flight_park_keeps_queue_running() {
        let attempts = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handler_attempts = Arc::clone(&attempts);
        let handler_seen = Arc::clone(&seen);
        let handler: SubjectHandler<u64> = Arc::new(move |_subject, _backlog, event: &u64| {
            let attempts = Arc::clone(&handler_attempts);
            let seen = Arc::clone(&handler_seen);
            let event = *event;
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    // Hold the first dispatch long enough for the test to
                    // race a start() against the park verdict.
                    sleep(Duration::from_millis(40)).await;
                    Verdict::Park
                } else {
                    seen.lock().push(event);
                    Verdict::Done
                }
            }
            .boxed()
        });

        let queue = SequentialQueue::new("btcusdt", handler, true);
        queue.enqueue(9).unwrap();
        sleep(Duration::from_millis(10)).await;

        // Resume arrives while the handler is still deciding to park.
        queue.start();
        sleep(Duration::from_millis(80)).await;

        // The park lost: the event was re-dispatched and the queue is live.
        assert!(queue.is_running());
        assert_eq!(*seen.lock(), vec![9]);
        assert_eq!(queue.processed_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_pauses_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = SequentialQueue::new("btcusdt", counting_handler(Arc::clone(&seen)), true);

        queue.stop();
        queue.enqueue(1).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().is_empty());
        assert_eq!(queue.buffered_count(), 1);

        queue.start();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = SequentialQueue::new("btcusdt", counting_handler(seen), true);

        queue.close();
        assert_eq!(queue.enqueue(1), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_backlog_passed_to_handler() {
        let backlogs = Arc::new(Mutex::new(Vec::new()));
        let handler_backlogs = Arc::clone(&backlogs);
        let handler: SubjectHandler<u64> = Arc::new(move |_subject, backlog, _event: &u64| {
            let backlogs = Arc::clone(&handler_backlogs);
            async move {
                backlogs.lock().push(backlog);
                Verdict::Done
            }
            .boxed()
        });

        let queue = SequentialQueue::new("btcusdt", handler, false);
        for i in 0..3 {
            queue.enqueue(i).unwrap();
        }
        queue.start();
        sleep(Duration::from_millis(50)).await;

        // Three buffered before start: backlog shrinks as the worker drains
        assert_eq!(*backlogs.lock(), vec![2, 1, 0]);
    }
}
