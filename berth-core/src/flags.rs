//! The driver configuration surface.
//!
//! A backend advertises its recognized options as [`CreateFlag`]s; the
//! cluster layer hands values back as [`DriverOptions`]. Flags carry their
//! defaults so a caller can render help text without instantiating a driver.

use std::collections::HashMap;
use std::fmt;

use crate::error::CoreError;

/// A typed option value.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FlagValue {
    Int(i64),
    String(String),
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Int(v) => write!(f, "{v}"),
            FlagValue::String(v) => write!(f, "{v}"),
        }
    }
}

/// One recognized configuration option of a driver backend.
#[derive(Debug, Clone)]
pub struct CreateFlag {
    /// Option name, e.g. `"hyperkit-disk-size"`.
    pub name: &'static str,
    /// What the option changes about VM construction.
    pub usage: &'static str,
    /// Value used when the option is not supplied.
    pub default: FlagValue,
}

/// Option values supplied by the cluster layer, keyed by flag name.
#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    values: HashMap<String, FlagValue>,
}

impl DriverOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option value, replacing any previous value for the name.
    pub fn set(&mut self, name: impl Into<String>, value: FlagValue) {
        self.values.insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FlagValue> {
        self.values.get(name)
    }

    /// Names of all options that were supplied.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// The integer value of `name`, if supplied.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidValue`] if the option was supplied with a
    /// non-integer value.
    pub fn int(&self, name: &str) -> Result<Option<i64>, CoreError> {
        match self.values.get(name) {
            None => Ok(None),
            Some(FlagValue::Int(v)) => Ok(Some(*v)),
            Some(other) => Err(CoreError::InvalidValue {
                name: name.to_owned(),
                reason: format!("expected an integer, got '{other}'"),
            }),
        }
    }

    /// The string value of `name`, if supplied.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidValue`] if the option was supplied with a
    /// non-string value.
    pub fn string(&self, name: &str) -> Result<Option<&str>, CoreError> {
        match self.values.get(name) {
            None => Ok(None),
            Some(FlagValue::String(v)) => Ok(Some(v.as_str())),
            Some(other) => Err(CoreError::InvalidValue {
                name: name.to_owned(),
                reason: format!("expected a string, got '{other}'"),
            }),
        }
    }
}
