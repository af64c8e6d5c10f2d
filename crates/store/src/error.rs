use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A write could not be applied (the fatal persistence path).
    #[error("storage backend error: {0}")]
    Backend(String),
    /// A table referenced data that is not there.
    #[error("inconsistent store: {0}")]
    Inconsistent(String),
}
