//! Distinguishable error kinds shared across the runner.
//!
//! Components that already return `Box<dyn Error + Send + Sync>` (the
//! prevailing convention for async trait boundaries in this codebase) box a
//! [`RunnerError`] value rather than an ad-hoc string, so callers that need
//! to distinguish a timeout from a budget overrun can `downcast_ref` instead
//! of parsing messages.

use std::fmt;

/// The sentinel substring the scheduler looks for when classifying a
/// dispatch failure as a budget overrun (see `Display` impl below).
pub const BUDGET_EXCEEDED_MARKER: &str = "budget exceeded";

/// The sentinel the scheduler returns when a run is refused by the kill switch.
pub const KILL_SWITCH_MARKER: &str = "kill switch active";

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("timeout")]
    Timeout,

    #[error("{BUDGET_EXCEEDED_MARKER}: used {used} of {max}")]
    BudgetExceeded { used: u64, max: u64 },

    #[error("{KILL_SWITCH_MARKER}")]
    KillSwitchActive,

    #[error("auth error: {0}")]
    Auth(String),

    #[error("forge error: status {status}: {body}")]
    Forge { status: u16, body: String },
}

impl RunnerError {
    /// True when this error (or a `Box`ed/stringified rendition of it)
    /// represents a budget overrun, per the string-compatible contract
    /// downstream dashboards rely on.
    pub fn is_budget_exceeded(message: &str) -> bool {
        message.contains(BUDGET_EXCEEDED_MARKER)
    }
}

impl From<reqwest::Error> for RunnerError {
    fn from(err: reqwest::Error) -> Self {
        RunnerError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RunnerError {
    fn from(err: serde_json::Error) -> Self {
        RunnerError::Configuration(err.to_string())
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self {
        RunnerError::Configuration(err.to_string())
    }
}

/// Shorthand for the trait-object error type used at async call sites
/// throughout the runner (gateway client, dispatcher, feedback, publisher).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxes any `std::error::Error` into the shared trait-object type.
pub fn box_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> BoxError {
    Box::new(err)
}

impl fmt::Display for BudgetMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BUDGET_EXCEEDED_MARKER}")
    }
}

/// A unit type whose `Display` is the budget-exceeded sentinel, handy for
/// constructing a `BoxError` at call sites that only need the marker string.
#[derive(Debug)]
pub struct BudgetMarker;

impl std::error::Error for BudgetMarker {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exceeded_display_contains_marker() {
        let err = RunnerError::BudgetExceeded { used: 20, max: 15 };
        assert!(RunnerError::is_budget_exceeded(&err.to_string()));
    }

    #[test]
    fn kill_switch_display_contains_marker() {
        let err = RunnerError::KillSwitchActive;
        assert_eq!(err.to_string(), KILL_SWITCH_MARKER);
    }
}
