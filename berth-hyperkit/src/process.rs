//! Process lifecycle: state file reading, liveness probing, signaling.
//!
//! The driver never owns the hyperkit process directly. It owns the pid
//! persisted in the machine state file and re-resolves the live process
//! through the OS process table on every probe or signal; the state file is
//! re-read each time, never cached.

use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use berth_core::MachineState;

use crate::error::DriverError;

/// The OS process table, abstracted so lifecycle logic can be exercised
/// against a fake table. This is the one platform-dependent seam.
pub trait ProcessTable: Send + Sync {
    /// Signal-0 existence probe: `Ok` if the process is alive, `ESRCH` if it
    /// is gone, any other errno if the probe itself failed.
    ///
    /// # Errors
    /// Returns the raw errno from the probe; the caller decides which errnos
    /// are states and which are failures.
    fn probe(&self, pid: i32) -> Result<(), Errno>;

    /// Deliver `signal` to `pid`.
    ///
    /// # Errors
    /// Returns the raw errno from the kill call.
    fn signal(&self, pid: i32, signal: Signal) -> Result<(), Errno>;
}

/// The real process table, backed by `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeProcessTable;

impl ProcessTable for NativeProcessTable {
    fn probe(&self, pid: i32) -> Result<(), Errno> {
        kill(Pid::from_raw(pid), None)
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<(), Errno> {
        kill(Pid::from_raw(pid), Some(signal))
    }
}

/// The on-disk record the hyperkit subprocess writes next to the VM.
///
/// Only the pid matters to the driver; hyperkit's other fields are carried
/// for operators reading the file and ignored on parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MachineRecord {
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub cmdline: String,
}

/// Read the hyperkit pid from the machine state file.
///
/// A missing file, unreadable contents, or a non-positive pid all mean the
/// VM is not running. That is a state, not an error, so problems are only
/// warn-logged.
pub(crate) fn read_pid(state_file: &Path) -> Option<i32> {
    let contents = match std::fs::read_to_string(state_file) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %state_file.display(), error = %e, "error reading state file");
            return None;
        }
    };
    match serde_json::from_str::<MachineRecord>(&contents) {
        Ok(record) if record.pid > 0 => Some(record.pid),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(path = %state_file.display(), error = %e, "error decoding state file");
            None
        }
    }
}

/// Compute the machine's run state by probing the persisted pid.
///
/// # Errors
/// Returns [`DriverError::StateProbe`] when the probe fails for a reason
/// other than "no such process" (e.g. `EPERM`); the caller surfaces that as
/// the `Error` state rather than guessing.
pub(crate) fn current_state(
    table: &dyn ProcessTable,
    state_file: &Path,
) -> Result<MachineState, DriverError> {
    let Some(pid) = read_pid(state_file) else {
        return Ok(MachineState::Stopped);
    };
    match table.probe(pid) {
        Ok(()) => Ok(MachineState::Running),
        Err(Errno::ESRCH) => Ok(MachineState::Stopped),
        Err(source) => Err(DriverError::StateProbe { pid, source }),
    }
}

/// Send `signal` to the machine's hyperkit process.
///
/// Signaling an already-stopped VM is a successful no-op: with no persisted
/// pid the OS is never consulted, and a pid whose process has since exited
/// (`ESRCH`) is treated the same way.
///
/// # Errors
/// Returns [`DriverError::Signal`] when the process exists but could not be
/// signaled.
pub(crate) fn send_signal(
    table: &dyn ProcessTable,
    state_file: &Path,
    signal: Signal,
) -> Result<(), DriverError> {
    let Some(pid) = read_pid(state_file) else {
        tracing::debug!(signal = signal.as_str(), "machine not running, nothing to signal");
        return Ok(());
    };
    match table.signal(pid, signal) {
        Ok(()) => {
            tracing::info!(pid, signal = signal.as_str(), "signaled hyperkit");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, "process already exited before signal");
            Ok(())
        }
        Err(source) => Err(DriverError::Signal { pid, source }),
    }
}
