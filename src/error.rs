//! Error types.
//!
//! `Status` is the internal outcome enum described in spec §7: it travels
//! between the C-bucket, B-entry, B-layer and state machine layers but
//! never crosses the embedding API, which collapses everything to `bool`
//! or `StoreError`. `StoreError` is the public error type for
//! store-lifecycle failures (`open`/`close`, persistence, allocation).

use thiserror::Error;

/// Internal outcome of a B-layer/B-entry/C-bucket operation.
///
/// `Full` and `Invalid` are consumed internally (by the B-entry's split
/// logic and the state machine's retry loop respectively) and never reach
/// a caller of the public `Store` API. `Retry` likewise never escapes:
/// it means the B-layer observed an in-flight whole-layer expansion on
/// the write path and the state machine's retry loop should spin until
/// the expansion publishes its replacement tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Ok,
    AlreadyExists,
    NotFound,
    Full,
    Invalid,
    Retry,
}

/// Errors that can surface from the embedding API.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("invalid pool directory: {0}")]
    InvalidPoolDir(String),

    #[error("pool already exists at {0} (create_flag=false expected an existing pool)")]
    PoolMissing(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
