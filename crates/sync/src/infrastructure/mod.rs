pub mod connection;
pub mod socket;

pub use connection::ConnectionManager;
pub use socket::{SocketConnector, SocketWriter, TungsteniteConnector, WriterCommand};
