pub mod events;
pub mod ports;
pub mod request;
pub mod spec;
pub mod stream;

pub use events::{Classification, ConnectionEvent, ConnectionId, MessageKind, SyncEvent};
pub use ports::{FetchError, MarketStore, RateLimiter, SnapshotFetcher, StoreError};
pub use request::{RequestKind, TrackedRequest};
pub use spec::{AuthScheme, ChannelSpec, CodecError, ExchangeSpec, PingStyle, WireCodec};
pub use stream::{Stream, StreamBinding};
