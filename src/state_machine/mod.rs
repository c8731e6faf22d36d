//! statig state machines.

pub mod lifecycle_sm;

pub use lifecycle_sm::{LifecycleEvent, LifecycleMachine};
