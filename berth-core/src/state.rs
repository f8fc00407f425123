use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a machine is in its lifecycle, as observable from the host.
///
/// The state is never cached: backends recompute it on every query by
/// probing the hypervisor process, so two consecutive queries may disagree
/// if the machine died in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum MachineState {
    /// No live hypervisor process backs the machine.
    Stopped,
    /// The hypervisor process exists and answers a liveness probe.
    Running,
    /// The liveness probe itself failed; the true state could not be read.
    Error,
    /// Transient: the state has not been determined yet.
    Unknown,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::Stopped => "stopped",
            MachineState::Running => "running",
            MachineState::Error => "error",
            MachineState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}
