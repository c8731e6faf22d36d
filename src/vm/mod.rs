//! VM management for macos-virt.
//!
//! Persistent records, boot media assembly, runner supervision, the guest
//! control channel and the controller that drives them through the
//! lifecycle state machine.

pub mod channel;
pub mod codecs;
pub mod download;
pub mod filesystem;
pub mod identity;
pub mod lifecycle;
pub mod profiles;
pub mod provisioning;
pub mod record;
pub mod remote;
pub mod store;
pub mod supervisor;

pub use lifecycle::{CreateOptions, Outcome, UpdateOptions, VmController, VmSummary};
pub use record::{VmRecord, VmStatus};
