use thiserror::Error;

/// Errors that abort a simulation before any month is stepped.
///
/// Financial edge states (margin calls, liquidation, insolvency) are not
/// errors; they are reported as flags on [`crate::core::AccountState`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no historical return data available; cannot simulate")]
    NoData,

    #[error("invalid return series at row {index}: {reason}")]
    InvalidReturnSeries { index: usize, reason: String },

    #[error("result set has no column `{0}`")]
    MissingColumn(String),
}

pub type Result<T> = std::result::Result<T, SimError>;

pub(crate) fn invalid_config(msg: impl Into<String>) -> SimError {
    SimError::InvalidConfig(msg.into())
}
