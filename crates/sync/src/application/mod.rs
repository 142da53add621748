pub mod balances;
pub mod depth;
pub mod dispatcher;
pub mod engine;
pub mod requests;
pub mod streams;
pub mod subscriber;

pub use balances::{BalanceEngine, BalanceOutcome};
pub use depth::{DepthEngine, DepthOutcome};
pub use dispatcher::MessageDispatcher;
pub use engine::SyncEngine;
pub use requests::RequestTable;
pub use streams::StreamTable;
pub use subscriber::{SubscribeOutcome, SubscriptionPipeline};
