//! Per-subject sequential event queues
//!
//! Events for one subject (a symbol, an account scope) are dispatched to an
//! async handler strictly one at a time, in FIFO order; different subjects
//! run concurrently. Handlers can pause a subject and push the current event
//! back to the head of its buffer by returning [`Verdict::Park`], which is
//! how a consumer waits for out-of-band state (a missing snapshot) without
//! losing or reordering events.
//!
//! ```text
//! enqueue("btcusdt", e1)  ──►  [e1 e2 e3] ──► handler(e1) ──► Done
//! enqueue("btcusdt", e2)                       │
//! enqueue("ethusdt", x1)  ──►  [x1]  ──────────┼──► handler(x1)   (concurrent)
//!                                              ▼
//!                                     Park: [e1 e2 e3], paused
//! ```

pub mod error;
pub mod queues;
pub mod worker;

pub use error::QueueError;
pub use queues::SubjectQueues;
pub use worker::{SequentialQueue, SubjectHandler, Verdict};
