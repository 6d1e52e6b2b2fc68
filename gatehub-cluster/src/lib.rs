pub mod connection;
pub mod context;
pub mod events;
pub mod global;
pub mod registry;

pub use connection::{
    ConnectionLimits, ConnectionManager, PushNotifier, ServerMessage, StreamConnection,
    StreamSession,
};
pub use context::ClusterContext;
pub use events::{ClusterEventBus, EventHandler, EventPublisher, HandleResult, HandleStatus};
pub use registry::{InstanceHealthSweeper, InstanceRegistry, LoadBalancer, SweepReport};
