//! Instance Registry: service/instance state, discovery and liveness sweep

pub mod health_sweeper;
pub mod instance_registry;
pub mod load_balancer;

pub use health_sweeper::{InstanceHealthSweeper, SweepReport};
pub use instance_registry::InstanceRegistry;
pub use load_balancer::LoadBalancer;
