//! macos-virt: lifecycle controller for lightweight Linux VMs on macOS.

pub mod error;
pub mod logging;
pub mod paths;
pub mod protocol;
pub mod settings;
pub mod state_machine;
pub mod vm;

pub use error::{Result, VirtError};
