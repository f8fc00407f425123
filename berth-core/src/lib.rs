//! Backend-neutral machine driver contract for berth development clusters.
//!
//! Defines the capability surface every VM backend implements: the
//! [`MachineDriver`] lifecycle trait, the [`MachineState`] vocabulary, and
//! the create-flag configuration surface consumed by the cluster layer.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod driver;
pub mod error;
pub mod flags;
pub mod state;

pub use driver::MachineDriver;
pub use error::CoreError;
pub use flags::{CreateFlag, DriverOptions, FlagValue};
pub use state::MachineState;
