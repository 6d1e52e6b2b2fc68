/// Implements `as_str` / `FromStr` / `Display` for unit enums stored as TEXT.
macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $ty {
            type Err = $crate::models::UnknownVariant;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err($crate::models::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use text_enum;

pub mod audit;
pub mod event;
pub mod id;
pub mod instance;
pub mod service;

pub use audit::{AuditFields, Flag};
pub use event::{AckStatus, ClusterEvent, ClusterEventAck, EventAction, EventType};
pub use id::{generate_id, ServiceKey};
pub use instance::{
    HealthStatus, InstanceRegistration, InstanceStatus, InstanceUpdate, ServiceInstance,
};
pub use service::{
    HealthCheckMode, HealthCheckPolicy, HealthCheckType, LoadBalanceStrategy, Service,
    ServiceRegistration, DEFAULT_GROUP,
};

/// Error returned when a persisted enum column holds an unknown value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl std::fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown {} value: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

impl From<UnknownVariant> for crate::Error {
    fn from(err: UnknownVariant) -> Self {
        Self::Deserialization {
            context: err.to_string(),
        }
    }
}
