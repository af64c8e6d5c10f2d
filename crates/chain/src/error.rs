use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("RLP decode error: {0}")]
    Rlp(String),
    #[error("expected at least {expected_min} fields, got {got}")]
    FieldCount { expected_min: usize, got: usize },
    #[error("{field}: expected {expected} bytes, got {got}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
}
