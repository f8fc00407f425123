//! Error types for the hyperkit driver crate.

use std::path::PathBuf;

use crate::net::{LeaseError, MacAddress};

/// Errors that can occur during hyperkit VM lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DriverError {
    /// Boot media could not be provisioned into the machine store.
    #[error("boot media provisioning failed: {0}")]
    Provision(String),

    /// The raw disk image could not be created or seeded.
    #[error("creating disk image {path} failed")]
    DiskCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The SSH keypair could not be generated or encoded.
    #[error("ssh keypair generation failed")]
    SshKey(#[from] ssh_key::Error),

    /// The hyperkit subprocess could not be spawned.
    #[error("hyperkit launch failed: {0}")]
    Launch(String),

    /// No DHCP lease appeared for the derived address within the retry budget.
    #[error("IP address for MAC {mac} never appeared in DHCP leases ({attempts} attempts)")]
    AddressResolution {
        mac: MacAddress,
        attempts: u32,
        #[source]
        source: LeaseError,
    },

    /// A live process could not be signaled.
    #[error("failed to signal pid {pid}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },

    /// The liveness probe failed for a reason other than "no such process".
    #[error("liveness probe for pid {pid} failed")]
    StateProbe {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },

    /// The machine has no resolved IP address (it never successfully started).
    #[error("machine has no IP address")]
    AddressUnavailable,

    /// A driver option failed validation.
    #[error(transparent)]
    Options(#[from] berth_core::CoreError),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
