use thiserror::Error;

/// Errors produced while decoding bencode or converting decoded values.
///
/// Every variant means the input did not match the bencode grammar (or a
/// value did not fit the type the caller asked for). Encoding never fails.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("unexpected character: {0:?}")]
    UnexpectedChar(char),

    #[error("trailing data after value")]
    TrailingData,

    #[error("nesting too deep")]
    NestingTooDeep,

    #[error("duplicate dictionary key: {0}")]
    DuplicateKey(String),

    #[error("integer {value} does not fit in {target}")]
    IntegerOutOfRange { value: i64, target: &'static str },

    #[error("expected {expected}")]
    UnexpectedType { expected: &'static str },
}
