//! error types for pool math and parameters

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathError {
    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitsError {
    #[error("empty amount")]
    Empty,

    #[error("invalid character {0:?} in amount")]
    InvalidCharacter(char),

    #[error("amount has more than one decimal point")]
    MultipleDecimalPoints,

    #[error("too many fractional digits: {got} > {max}")]
    TooManyDecimals { got: usize, max: u8 },

    #[error("token decimals {0} out of range")]
    DecimalsOutOfRange(u8),

    #[error("amount does not fit in 256 bits")]
    Overflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamsError {
    #[error("ltv ratio must be in 1..=100, got {0}")]
    LtvOutOfRange(u64),

    #[error("liquidation threshold must be positive")]
    ZeroLiquidationThreshold,

    #[error("threshold ordering violated: {0}")]
    ThresholdOrder(&'static str),
}

pub type Result<T> = std::result::Result<T, MathError>;
