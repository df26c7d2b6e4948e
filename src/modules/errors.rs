use thiserror::Error;

// -------------------- Error Taxonomy --------------------

/// Failures surfaced by an exchange client. The client retries what is
/// retryable internally; callers only ever see the exhausted outcome.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network failure or 5xx that survived the retry budget
    #[error("exchange transient failure: {0}")]
    Transient(String),

    /// Signature/credential rejection; never retried
    #[error("exchange auth failure: {0}")]
    Auth(String),

    /// Business rejection (insufficient balance, min notional, precision)
    #[error("exchange rejected order: {0}")]
    Rejected(String),

    /// Response body did not match the expected shape
    #[error("exchange response malformed: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// Rejections are expected business outcomes and are persisted as failed
    /// trades rather than logged as engine faults.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ExchangeError::Rejected(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::Transient(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(String),

    #[error("document serialization failed: {0}")]
    Serialization(String),

    #[error("document not found: {0}")]
    NotFound(String),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for StoreError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<mongodb::bson::de::Error> for StoreError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Top-level failure type threaded through strategies and the runner. The
/// runner logs these per bot and moves on; nothing here tears down a tick
/// loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Bot misconfiguration discovered at evaluation time
    #[error("bot {bot_id} misconfigured: {reason}")]
    BadBot { bot_id: String, reason: String },
}
