//! Live bidirectional client streams
//!
//! `ConnectionManager` indexes connections, `StreamSession` drives one of
//! them, `PushNotifier` targets registry and config changes at subscribers.

pub mod manager;
pub mod messages;
pub mod push;
pub mod session;
pub mod stream_connection;

pub use manager::{ConnectionLimits, ConnectionManager, ConnectionMetrics};
pub use messages::{
    ClientMessage, ServerMessage, CLOSE_REASON_CLIENT_TIMEOUT, CLOSE_REASON_SERVER_SHUTDOWN,
};
pub use push::PushNotifier;
pub use session::StreamSession;
pub use stream_connection::{
    ClientInfo, ConfigWatch, ServiceSubscription, StreamConnection, StreamTransport,
};
