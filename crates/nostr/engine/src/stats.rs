//! Per-relay diagnostics.

use std::collections::VecDeque;

const MAX_RECENT_ERRORS: usize = 10;

/// Machine-readable prefix of an OK/CLOSED message (NIP-01).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayCondition {
    Duplicate,
    Pow,
    Blocked,
    RateLimited,
    Invalid,
    Restricted,
    AuthRequired,
    Error,
    Other,
}

impl RelayCondition {
    /// Classify a relay message by its `prefix:` convention. Plain text has no condition.
    pub fn parse(message: &str) -> Option<Self> {
        let (prefix, _) = message.split_once(':')?;
        let condition = match prefix.trim() {
            "duplicate" => Self::Duplicate,
            "pow" => Self::Pow,
            "blocked" => Self::Blocked,
            "rate-limited" => Self::RateLimited,
            "invalid" => Self::Invalid,
            "restricted" => Self::Restricted,
            "auth-required" => Self::AuthRequired,
            "error" => Self::Error,
            _ => Self::Other,
        };
        Some(condition)
    }
}

/// Counters and recent errors for one relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Successful socket opens
    pub connects: u64,
    /// Text frames received
    pub messages: u64,
    /// Socket errors and failed connects
    pub errors: u64,
    /// Most recent error texts, oldest first
    pub recent_errors: VecDeque<String>,
    /// Last condition the relay reported
    pub last_condition: Option<RelayCondition>,
    pub notices: u64,
}

impl RelayStats {
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        if self.recent_errors.len() == MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(message.into());
    }

    pub fn record_condition(&mut self, message: &str) -> Option<RelayCondition> {
        let condition = RelayCondition::parse(message)?;
        self.last_condition = Some(condition);
        Some(condition)
    }
}
