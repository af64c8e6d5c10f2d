use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("null result from sentry call")]
    NullResult,
    #[error("malformed sentry reply: {0}")]
    BadReply(String),
    /// The daemon reported an incompatible chain or fork id. Fatal at
    /// startup only.
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error(transparent)]
    Wire(#[from] chain::ChainError),
}
