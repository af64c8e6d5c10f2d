use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Sentry(#[from] sentry::SentryError),
    /// The exchange went away (clean shutdown path, not a failure).
    #[error("block exchange stopped")]
    ExchangeStopped,
    #[error("inconsistent sync state: {0}")]
    Inconsistent(String),
}
