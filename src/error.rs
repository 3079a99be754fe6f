use std::io;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::lock_manager::LockError;
use crate::TableId;

pub type Result<T> = std::result::Result<T, DbError>;

/// Everything the storage core can fail with.
///
/// `Aborted` mandates a rollback: the caller must run
/// `transaction_complete(tid, false)` to drop dirty state and release the
/// transaction's locks before retrying.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("transaction aborted")]
    Aborted,
    #[error("no evictable page: every resident page is dirty")]
    NoEvictablePage,
    #[error("invalid permission requested")]
    InvalidPermission,
    #[error("no file registered for table {0}")]
    UnknownTable(TableId),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<LockError> for DbError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Deadlock => DbError::Aborted,
        }
    }
}

pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
