/// Errors produced by the `berth-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// An option was supplied that no create flag declares.
    #[error("unrecognized driver option '{name}'")]
    UnknownOption { name: String },

    /// An option value failed validation.
    #[error("invalid value for option '{name}': {reason}")]
    InvalidValue { name: String, reason: String },
}
