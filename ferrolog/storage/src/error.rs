use std::io;

use ferrolog_transaction::error::{TidError, TxnError};
use ferrolog_transaction::lock::LockError;
use ferrolog_transaction::lsn::Lsn;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("transaction error: {0}")]
    Transaction(#[from] TxnError),
    #[error("log error: {0}")]
    Log(#[from] LogError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl From<TidError> for StorageError {
    fn from(e: TidError) -> Self {
        StorageError::Transaction(TxnError::Tid(e))
    }
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("log i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("log record serialization failed: {0}")]
    SerializationFailed(String),
    #[error("log record deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("log record checksum mismatch")]
    ChecksumMismatch,
    #[error("end of log reached")]
    Eof,
    #[error("no record at {0}")]
    NotFound(Lsn),
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("timed out waiting for transaction quiescence")]
    Timeout,
}
