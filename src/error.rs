//! Error types for the cache engine and allocator

use thiserror::Error;

/// Main error type for the cache engine
#[derive(Error, Debug)]
pub enum Error {
    /// Wrong number of arguments for a command
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    /// Failed to parse an argument or input line
    #[error("parse error: {0}")]
    Parse(String),

    /// Backing-store request failed; carries the backend message
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Ghost checkpoint error
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Ill-formed mock key-value format
    #[error("ill-formed key-value format: {0}")]
    KvFormat(#[from] KvFormatError),

    /// Unknown configuration name
    #[error("unrecognized config: {0}")]
    UnknownConfig(String),

    /// Invalid value supplied for a configuration option
    #[error("invalid value for <{0}>")]
    InvalidConfigValue(&'static str),

    /// Miss ratio curve failed validation
    #[error("invalid miss ratio curve: {0}")]
    InvalidCurve(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage adapter errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backing store rejected or failed a GET
    #[error("fail to read from backing store: {0}")]
    Get(String),

    /// The backing store rejected or failed a PUT
    #[error("fail to write to backing store: {0}")]
    Put(String),

    /// No backend is configured and mock mode is disabled
    #[error("no storage backend configured")]
    NoBackend,

    /// The storage worker is gone; the completion channel was dropped
    #[error("storage worker unavailable")]
    WorkerGone,
}

/// Ghost checkpoint errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint file could not be opened, read, or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Header magic or hash does not match this build's hash family
    #[error("incompatible checkpoint header")]
    Incompatible,
}

/// Mock key-value format errors
#[derive(Error, Debug)]
pub enum KvFormatError {
    /// key_size/val_size leave no room for the offset field
    #[error("least_len_left <= 0")]
    NoRoomForOffset,

    /// Computed key padding is negative
    #[error("k_pad_len < 0")]
    NegativeKeyPad,

    /// Computed value padding is negative
    #[error("v_pad_len < 0")]
    NegativeValPad,

    /// Key length does not match the configured format
    #[error("key length mismatch: {0}")]
    KeyLenMismatch(String),

    /// Key does not start with the 'K' sentinel
    #[error("leading char must be 'K': {0}")]
    BadKeySentinel(String),

    /// Non-digit character in the key's offset field
    #[error("non-digit char found in offset: {0}")]
    BadKeyOffset(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
