use thiserror::Error;

/// Severity classification for an [`AppError`], independent of any transport.
///
/// The crate has no HTTP surface of its own (that's the out-of-scope API
/// layer), but external callers that do expose one need a stable way to map
/// our errors onto their own status codes, so we keep a pure classification
/// function instead of baking in a particular response type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Caller may retry; condition is expected to clear on its own.
    Transient,
    /// Input was rejected; retrying with the same input won't help.
    Rejected,
    /// Operator action (config, disk, permissions) is required.
    Operational,
    /// The surrounding run was cancelled; not a failure of this component.
    Cancelled,
}

/// Application-wide error taxonomy.
///
/// Every component in the pipeline returns `AppResult<T>`; the orchestrator
/// decides per-stage whether a given variant aborts the run or is logged and
/// skipped (see the module docs on `orchestrator`).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("network error: {0}")]
    NetworkError(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("security reject: {0}")]
    SecurityReject(String),

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("i/o error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl AppError {
    /// Classify this error for a caller that needs to decide whether to
    /// retry, surface it to a user, or treat it as an operator issue.
    pub fn severity(&self) -> Severity {
        match self {
            AppError::NetworkError(_) | AppError::RateLimited(_) => Severity::Transient,
            AppError::ParseError(_) | AppError::SecurityReject(_) => Severity::Rejected,
            AppError::CacheError(_) | AppError::IOError(_) | AppError::ConfigError(_) => {
                Severity::Operational
            }
            AppError::Cancelled(_) => Severity::Cancelled,
        }
    }

    /// Process exit code this error should map to when surfaced at the CLI
    /// boundary (see `main.rs`): 0 success is handled separately, 2 is
    /// reserved for configuration problems, 1 covers everything else.
    pub fn exit_code(&self) -> exitcode::ExitCode {
        match self {
            AppError::ConfigError(_) => exitcode::CONFIG,
            _ => exitcode::SOFTWARE,
        }
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_rate_limited_are_transient() {
        assert_eq!(
            AppError::NetworkError("timeout".into()).severity(),
            Severity::Transient
        );
        assert_eq!(
            AppError::RateLimited("host busy".into()).severity(),
            Severity::Transient
        );
    }

    #[test]
    fn security_reject_is_rejected_not_operational() {
        assert_eq!(
            AppError::SecurityReject("bad port".into()).severity(),
            Severity::Rejected
        );
    }

    #[test]
    fn config_error_maps_to_config_exit_code() {
        assert_eq!(AppError::ConfigError("missing key".into()).exit_code(), 78);
    }

    #[test]
    fn other_errors_map_to_software_exit_code() {
        assert_eq!(
            AppError::NetworkError("down".into()).exit_code(),
            exitcode::SOFTWARE
        );
    }
}
