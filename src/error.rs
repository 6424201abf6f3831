//! Error taxonomy for the simulator's top-level driver.
//!
//! `Interrupted` is deliberately not a member of [`SimError`]: it is an
//! internal control-flow signal raised by suspension points and always
//! caught inside the writer, transfer, or back-off loop that issued the
//! suspending call (see [`crate::sim::interrupt`]).

use snafu::Snafu;

/// Errors that can escape to the top-level driver.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum SimError {
    /// A scheduler or resource invariant was violated. Fatal: aborts the
    /// simulation.
    #[snafu(display("invariant violation: {message}"))]
    InvariantViolation { message: String },

    /// A service could not be started with the given configuration (e.g.
    /// no datanodes registered, or an unknown node id in a transfer).
    /// Logged at critical severity; the affected service is skipped and
    /// the simulation continues.
    #[snafu(display("configuration error: {message}"))]
    ConfigurationError { message: String },
}

impl SimError {
    pub fn invariant(message: impl Into<String>) -> Self {
        SimError::InvariantViolation {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        SimError::ConfigurationError {
            message: message.into(),
        }
    }

    /// True for errors that should abort the whole run rather than just
    /// skip a service.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SimError::InvariantViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_is_fatal() {
        let err = SimError::invariant("negative delay");
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "invariant violation: negative delay");
    }

    #[test]
    fn configuration_is_not_fatal() {
        let err = SimError::configuration("no datanodes");
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "configuration error: no datanodes");
    }
}
