use thiserror::Error;

/// Rejected simulation or solver input. Raised before any trial runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("--total-funds must be finite and > 0")]
    NonPositiveTotalFunds,

    #[error("--monthly-expense must be finite and > 0")]
    NonPositiveMonthlyExpense,

    #[error("--years must be > 0")]
    ZeroYears,

    #[error("--years must be <= {0}")]
    TooManyYears(u32),

    #[error("--trials must be > 0")]
    ZeroTrials,

    #[error("--inflation-rate must be finite and > -100")]
    InflationOutOfRange,

    #[error("--allocation weights must be finite and >= 0")]
    NegativeAllocation,

    #[error("--allocation weights must not sum to zero")]
    ZeroAllocation,

    #[error("unknown bucket {0} in overrides, expected 1, 2 or 3")]
    UnknownBucket(u32),

    #[error("bucket {bucket} {field} must be {requirement}")]
    InvalidBucket {
        bucket: u8,
        field: &'static str,
        requirement: &'static str,
    },

    #[error("{field} must be {requirement}")]
    InvalidSearch {
        field: &'static str,
        requirement: &'static str,
    },
}
