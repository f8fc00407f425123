//! The machine driver capability set.
//!
//! Every VM backend (hyperkit, or any future hypervisor) implements
//! [`MachineDriver`]; the cluster-management layer above only ever talks to
//! this trait. The contract is deliberately small: one driver value manages
//! exactly one machine for its whole lifetime.

use async_trait::async_trait;

use crate::flags::{CreateFlag, DriverOptions};
use crate::state::MachineState;

/// Lifecycle contract for a single development-cluster machine.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
/// Re-entrant calls on the same driver value (e.g. two concurrent `start`s)
/// are out of contract; operations are meant to be awaited one at a time.
#[async_trait]
pub trait MachineDriver: Send + Sync {
    /// Backend-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Stable identifier for this backend, e.g. `"hyperkit"`.
    fn driver_name(&self) -> &'static str;

    /// The configuration options this backend recognizes.
    fn create_flags(&self) -> Vec<CreateFlag>;

    /// Apply option values supplied by the cluster layer.
    ///
    /// # Errors
    /// Fails on unrecognized options or values that fail validation; the
    /// driver's configuration is left partially applied in that case and the
    /// caller should not proceed to [`create`](Self::create).
    fn configure(&mut self, options: &DriverOptions) -> Result<(), Self::Error>;

    /// Provision the machine from scratch and boot it.
    ///
    /// # Errors
    /// Fails fast on the first sub-step that fails. No rollback is
    /// attempted; whatever was provisioned stays on disk for diagnosis and
    /// retry.
    async fn create(&mut self) -> Result<(), Self::Error>;

    /// Boot the machine, provisioning the disk image on first boot.
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Gracefully stop the machine. A no-op if it is already stopped.
    async fn stop(&self) -> Result<(), Self::Error>;

    /// Forcefully kill the machine. A no-op if it is already stopped.
    async fn kill(&self) -> Result<(), Self::Error>;

    /// Stop then start. Aborts without starting if the stop failed.
    async fn restart(&mut self) -> Result<(), Self::Error>;

    /// Best-effort teardown: stop the machine if it is running.
    ///
    /// Never fails solely because the machine's state could not be read.
    async fn remove(&self) -> Result<(), Self::Error>;

    /// The machine's current run state, recomputed on every call.
    async fn state(&self) -> Result<MachineState, Self::Error>;

    /// Connection URL for the service the machine exposes.
    ///
    /// # Errors
    /// Fails if the machine has no resolved address (it never successfully
    /// started).
    fn url(&self) -> Result<String, Self::Error>;

    /// Hostname for SSH access: the resolved address verbatim, or an empty
    /// string if none was resolved yet. Callers must check.
    fn ssh_hostname(&self) -> String;
}
