//! Cluster-wide event propagation with per-node acknowledgments

pub mod bus;
pub mod handler;
pub mod handlers;
pub mod publisher;

pub use bus::ClusterEventBus;
pub use handler::{EventHandler, HandleResult, HandleStatus, HandlerTable};
pub use handlers::{AlertConfigHandler, ConfigSyncHandler, GatewayInstanceHandler};
pub use publisher::EventPublisher;
