//! Enterprise integration pattern processors.

pub mod idempotent;
pub mod load_balancer;
pub mod throttle;

pub use idempotent::{IdempotentConsumer, IdempotentMode};
pub use load_balancer::{LoadBalancePolicy, LoadBalancer, ProcessorTarget, Target};
pub use throttle::{RejectionPolicy, ThrottleMode, Throttler};
