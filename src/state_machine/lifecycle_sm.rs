//! VM lifecycle state machine.
//!
//! Hierarchy:
//! ```text
//! Restoring ──Restore(status)──► any persisted state
//!
//! Uninitialized → Provisioning ──ControlDeviceReady──► Booted (superstate)
//!                                                         ├── Initializing
//!                                                         ├── Initialized  ──Heartbeat(ip)──► Running
//!                                                         └── Running      ──ProcessExited──► Stopped
//! Booted ──GuestFailed──► Error
//! Stopped ──ControlDeviceReady──► Initializing
//! ```
//!
//! Every boot, first or not, walks Initializing → Initialized → Running:
//! the guest agent reports its init status on each start.
//!
//! The machine only decides transitions. The controller persists the
//! resulting status after every event that changes it.

use std::net::Ipv4Addr;

use statig::prelude::*;
use tracing::{info, warn};

use crate::vm::record::VmStatus;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Load the status persisted in the record.
    Restore(VmStatus),
    /// Boot media assembly is about to start.
    BeginProvisioning,
    /// The runner exposed its control device.
    ControlDeviceReady,
    /// Guest agent reported `initializing`.
    GuestInitializing,
    /// Guest agent reported `initialization_complete`.
    GuestInitialized,
    /// Guest agent reported `initialization_error`.
    GuestFailed,
    /// Guest heartbeat; `address` is its NAT address, if one matched.
    Heartbeat { address: Option<Ipv4Addr> },
    /// The runner process is gone.
    ProcessExited,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Shared storage for the lifecycle machine.
pub struct LifecycleMachine {
    pub name: String,
}

impl LifecycleMachine {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }

    /// Persisted status for a machine state; `None` before `Restore`.
    pub fn status(state: &State) -> Option<VmStatus> {
        match state {
            State::Restoring {} => None,
            State::Uninitialized {} => Some(VmStatus::Uninitialized),
            State::Provisioning {} => Some(VmStatus::Provisioning),
            State::Initializing {} => Some(VmStatus::Initializing),
            State::Initialized {} => Some(VmStatus::Initialized),
            State::Running {} => Some(VmStatus::Running),
            State::Stopped {} => Some(VmStatus::Stopped),
            State::Error {} => Some(VmStatus::Error),
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::restoring()",
    state(derive(Debug, Clone, PartialEq))
)]
impl LifecycleMachine {
    #[state]
    fn restoring(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Restore(status) => Transition(match status {
                VmStatus::Uninitialized => State::uninitialized(),
                VmStatus::Provisioning => State::provisioning(),
                VmStatus::Initializing => State::initializing(),
                VmStatus::Initialized => State::initialized(),
                VmStatus::Running => State::running(),
                VmStatus::Stopped => State::stopped(),
                VmStatus::Error => State::error(),
            }),
            _ => Handled,
        }
    }

    #[state]
    fn uninitialized(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::BeginProvisioning => Transition(State::provisioning()),
            _ => Handled,
        }
    }

    /// Media is being built or the first boot is being launched.
    #[state]
    fn provisioning(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::ControlDeviceReady => Transition(State::initializing()),
            _ => Handled,
        }
    }

    // ------------------------------------------------------------------
    // Superstate: Booted (parent of Initializing, Initialized, Running)
    // ------------------------------------------------------------------

    #[superstate]
    fn booted(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::GuestFailed => Transition(State::error()),
            _ => Handled,
        }
    }

    #[state(superstate = "booted")]
    fn initializing(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::GuestInitialized => Transition(State::initialized()),
            _ => Super,
        }
    }

    /// Provisioning finished; waiting for the first heartbeat with an address.
    #[state(superstate = "booted")]
    fn initialized(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Heartbeat { address: Some(_) } => Transition(State::running()),
            _ => Super,
        }
    }

    #[state(superstate = "booted", entry_action = "enter_running")]
    fn running(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::ProcessExited => Transition(State::stopped()),
            _ => Super,
        }
    }

    /// Not running. A plain restart re-enters Initializing once the runner
    /// is up.
    #[state]
    fn stopped(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::ControlDeviceReady => Transition(State::initializing()),
            _ => Handled,
        }
    }

    /// Guest provisioning failed. Terminal; the VM must be recreated.
    #[state(entry_action = "enter_error")]
    fn error(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    // ------------------------------------------------------------------
    // Entry actions
    // ------------------------------------------------------------------

    #[action]
    fn enter_running(&mut self) {
        info!(vm = %self.name, "VM running");
    }

    #[action]
    fn enter_error(&mut self) {
        warn!(vm = %self.name, "VM in error state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(status: VmStatus) -> StateMachine<LifecycleMachine> {
        let mut sm = LifecycleMachine::new("test").state_machine();
        sm.handle(&LifecycleEvent::Restore(status));
        sm
    }

    fn status_of(sm: &StateMachine<LifecycleMachine>) -> Option<VmStatus> {
        LifecycleMachine::status(sm.state())
    }

    const ADDR: Option<Ipv4Addr> = Some(Ipv4Addr::new(192, 168, 64, 5));

    #[test]
    fn restore_reaches_every_persisted_status() {
        for status in [
            VmStatus::Uninitialized,
            VmStatus::Provisioning,
            VmStatus::Initializing,
            VmStatus::Initialized,
            VmStatus::Running,
            VmStatus::Stopped,
            VmStatus::Error,
        ] {
            assert_eq!(status_of(&machine(status)), Some(status));
        }
    }

    #[test]
    fn first_boot_happy_path() {
        let mut sm = machine(VmStatus::Uninitialized);
        let mut seen = vec![];
        for event in [
            LifecycleEvent::BeginProvisioning,
            LifecycleEvent::ControlDeviceReady,
            LifecycleEvent::GuestInitializing,
            LifecycleEvent::GuestInitialized,
            LifecycleEvent::Heartbeat { address: None },
            LifecycleEvent::Heartbeat { address: ADDR },
        ] {
            sm.handle(&event);
            seen.push(status_of(&sm).unwrap());
        }
        assert_eq!(
            seen,
            vec![
                VmStatus::Provisioning,
                VmStatus::Initializing,
                VmStatus::Initializing,
                VmStatus::Initialized,
                VmStatus::Initialized,
                VmStatus::Running,
            ]
        );
    }

    #[test]
    fn uninitialized_only_moves_to_provisioning() {
        for event in [
            LifecycleEvent::ControlDeviceReady,
            LifecycleEvent::GuestInitialized,
            LifecycleEvent::Heartbeat { address: ADDR },
            LifecycleEvent::ProcessExited,
            LifecycleEvent::GuestFailed,
        ] {
            let mut sm = machine(VmStatus::Uninitialized);
            sm.handle(&event);
            assert_eq!(status_of(&sm), Some(VmStatus::Uninitialized), "after {event:?}");
        }
    }

    #[test]
    fn running_requires_addressed_heartbeat_after_initialization() {
        let mut sm = machine(VmStatus::Initializing);
        sm.handle(&LifecycleEvent::Heartbeat { address: ADDR });
        assert_eq!(status_of(&sm), Some(VmStatus::Initializing));

        sm.handle(&LifecycleEvent::GuestInitialized);
        sm.handle(&LifecycleEvent::Heartbeat { address: None });
        assert_eq!(status_of(&sm), Some(VmStatus::Initialized));
    }

    #[test]
    fn guest_failure_is_terminal() {
        for start in [VmStatus::Initializing, VmStatus::Initialized, VmStatus::Running] {
            let mut sm = machine(start);
            sm.handle(&LifecycleEvent::GuestFailed);
            assert_eq!(status_of(&sm), Some(VmStatus::Error));

            sm.handle(&LifecycleEvent::GuestInitialized);
            sm.handle(&LifecycleEvent::Heartbeat { address: ADDR });
            assert_eq!(status_of(&sm), Some(VmStatus::Error));
        }
    }

    #[test]
    fn stop_and_restart() {
        let mut sm = machine(VmStatus::Running);
        sm.handle(&LifecycleEvent::ProcessExited);
        assert_eq!(status_of(&sm), Some(VmStatus::Stopped));

        sm.handle(&LifecycleEvent::Heartbeat { address: ADDR });
        assert_eq!(status_of(&sm), Some(VmStatus::Stopped), "no guest before the runner is up");

        let mut seen = vec![];
        for event in [
            LifecycleEvent::ControlDeviceReady,
            LifecycleEvent::GuestInitializing,
            LifecycleEvent::GuestInitialized,
            LifecycleEvent::Heartbeat { address: ADDR },
        ] {
            sm.handle(&event);
            seen.push(status_of(&sm).unwrap());
        }
        assert_eq!(
            seen,
            vec![VmStatus::Initializing, VmStatus::Initializing, VmStatus::Initialized, VmStatus::Running]
        );
    }

    #[test]
    fn exit_during_initialization_keeps_state_for_redrive() {
        let mut sm = machine(VmStatus::Initialized);
        sm.handle(&LifecycleEvent::ProcessExited);
        assert_eq!(status_of(&sm), Some(VmStatus::Initialized));

        sm.handle(&LifecycleEvent::ControlDeviceReady);
        sm.handle(&LifecycleEvent::GuestInitializing);
        assert_eq!(status_of(&sm), Some(VmStatus::Initialized));
    }
}
