// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM lifecycle as an explicit state machine.
//!
//! The orchestrator drives every remote side effect through
//! [`Lifecycle::apply`], so the order of operations (and which follow-up
//! steps remain) is decided in one place. A pending reboot is part of the
//! running states: shutting the VM down leaves no place to carry it.

use std::fmt;

use pve_api_types::VmStatus;
use slog::{debug, Logger};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    Absent,
    Creating,
    ImportingDisks,
    Starting { reboot_pending: bool },
    Running { reboot_pending: bool },
    Stopping,
    Stopped,
    Rebooting,
    Deleting,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Absent => "absent",
            VmState::Creating => "creating",
            VmState::ImportingDisks => "importing disks",
            VmState::Starting { .. } => "starting",
            VmState::Running { .. } => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Rebooting => "rebooting",
            VmState::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// Events that move a VM between [`VmState`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// A create request is about to be submitted.
    Create,
    /// The create request was accepted.
    Created { has_imports: bool },
    DisksImported,
    /// The remote run state was queried.
    Observed(VmStatus),
    /// A configuration update was applied.
    ConfigApplied { reboot_required: bool },
    Start,
    ReachedRunning,
    Shutdown,
    ReachedStopped,
    Reboot,
    Rebooted,
    Delete,
    /// The VM can no longer be observed.
    Vanished,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition {transition:?} from state {from}")]
pub struct TransitionError {
    pub from: VmState,
    pub transition: Transition,
}

/// The single authoritative transition function.
pub fn next(
    from: VmState,
    transition: Transition,
) -> Result<VmState, TransitionError> {
    use Transition as T;
    use VmState as S;

    let to = match (from, transition) {
        (S::Absent, T::Create) => S::Creating,
        (S::Creating, T::Created { has_imports: true }) => S::ImportingDisks,
        (S::Creating, T::Created { has_imports: false })
        | (S::ImportingDisks, T::DisksImported) => S::Stopped,

        // Hypervisor states other than running and stopped (paused,
        // suspended, ...) still hold the guest in memory, so they count as
        // running.
        (_, T::Observed(VmStatus::Stopped)) => S::Stopped,
        (S::Running { reboot_pending }, T::Observed(_)) => {
            S::Running { reboot_pending }
        }
        (_, T::Observed(_)) => S::Running { reboot_pending: false },

        (
            S::Running { reboot_pending },
            T::ConfigApplied { reboot_required },
        ) => S::Running { reboot_pending: reboot_pending || reboot_required },
        // A stopped VM picks up its new configuration on the next start.
        (S::Stopped, T::ConfigApplied { .. }) => S::Stopped,

        (S::Stopped, T::Start) => S::Starting { reboot_pending: false },
        (S::Starting { reboot_pending }, T::ReachedRunning) => {
            S::Running { reboot_pending }
        }

        (S::Running { .. } | S::Starting { .. }, T::Shutdown) => S::Stopping,
        (S::Stopping, T::ReachedStopped) => S::Stopped,

        (S::Running { reboot_pending: true }, T::Reboot) => S::Rebooting,
        (S::Rebooting, T::Rebooted) => S::Running { reboot_pending: false },

        (S::Stopped, T::Delete) => S::Deleting,
        (S::Deleting, T::Vanished) => S::Absent,

        (from, transition) => {
            return Err(TransitionError { from, transition });
        }
    };
    Ok(to)
}

/// Tracks the state of one VM through a lifecycle operation.
pub struct Lifecycle {
    state: VmState,
    log: Logger,
}

impl Lifecycle {
    pub fn new(state: VmState, log: Logger) -> Self {
        Self { state, log }
    }

    /// A lifecycle seeded from the run state the hypervisor reports.
    pub fn observed(status: VmStatus, log: Logger) -> Self {
        let state = match status {
            VmStatus::Stopped => VmState::Stopped,
            VmStatus::Running | VmStatus::Unknown => {
                VmState::Running { reboot_pending: false }
            }
        };
        Self::new(state, log)
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn apply(
        &mut self,
        transition: Transition,
    ) -> Result<VmState, TransitionError> {
        let to = next(self.state, transition)?;
        debug!(self.log, "lifecycle transition";
            "from" => %self.state,
            "transition" => ?transition,
            "to" => %to,
        );
        self.state = to;
        Ok(to)
    }

    pub fn is_stopped(&self) -> bool {
        self.state == VmState::Stopped
    }

    pub fn reboot_pending(&self) -> bool {
        matches!(self.state, VmState::Running { reboot_pending: true })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lifecycle(state: VmState) -> Lifecycle {
        Lifecycle::new(state, Logger::root(slog::Discard, slog::o!()))
    }

    #[test]
    fn create_with_imports_then_start() {
        let mut lc = lifecycle(VmState::Absent);
        for t in [
            Transition::Create,
            Transition::Created { has_imports: true },
            Transition::DisksImported,
            Transition::Start,
            Transition::ReachedRunning,
        ] {
            lc.apply(t).unwrap();
        }
        assert_eq!(lc.state(), VmState::Running { reboot_pending: false });
    }

    #[test]
    fn shutdown_drops_pending_reboot() {
        let mut lc = lifecycle(VmState::Running { reboot_pending: false });
        lc.apply(Transition::ConfigApplied { reboot_required: true }).unwrap();
        assert!(lc.reboot_pending());

        lc.apply(Transition::Shutdown).unwrap();
        lc.apply(Transition::ReachedStopped).unwrap();
        assert!(lc.is_stopped());
        assert!(!lc.reboot_pending());
        assert!(lc.apply(Transition::Reboot).is_err());
    }

    #[test]
    fn stopped_config_change_needs_no_reboot() {
        let mut lc = lifecycle(VmState::Stopped);
        lc.apply(Transition::ConfigApplied { reboot_required: true }).unwrap();
        lc.apply(Transition::Start).unwrap();
        lc.apply(Transition::ReachedRunning).unwrap();
        assert!(!lc.reboot_pending());
    }

    #[test]
    fn reboot_only_when_pending() {
        let mut lc = lifecycle(VmState::Running { reboot_pending: false });
        assert_eq!(
            lc.apply(Transition::Reboot),
            Err(TransitionError {
                from: VmState::Running { reboot_pending: false },
                transition: Transition::Reboot,
            })
        );

        lc.apply(Transition::ConfigApplied { reboot_required: true }).unwrap();
        lc.apply(Transition::Reboot).unwrap();
        lc.apply(Transition::Rebooted).unwrap();
        assert_eq!(lc.state(), VmState::Running { reboot_pending: false });
    }

    #[test]
    fn delete_requires_stopped() {
        let mut lc = lifecycle(VmState::Running { reboot_pending: false });
        assert!(lc.apply(Transition::Delete).is_err());
        lc.apply(Transition::Observed(VmStatus::Stopped)).unwrap();
        lc.apply(Transition::Delete).unwrap();
        lc.apply(Transition::Vanished).unwrap();
        assert_eq!(lc.state(), VmState::Absent);
    }

    #[test]
    fn unknown_status_counts_as_running() {
        let lc = Lifecycle::observed(
            VmStatus::Unknown,
            Logger::root(slog::Discard, slog::o!()),
        );
        assert_eq!(lc.state(), VmState::Running { reboot_pending: false });
    }
}
