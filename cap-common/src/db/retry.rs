//! Retry for transient SQLite lock contention
//!
//! Transactions in this workspace take the write lock with their first
//! statement, so the busy timeout normally absorbs contention. A write that
//! still reports SQLITE_BUSY / SQLITE_LOCKED (pool connections racing on a
//! checkpoint, a stale snapshot) is retried here with exponential backoff
//! until the wait budget runs out.

use crate::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};

/// Wait budget when no `database_lock_wait_ms` setting applies
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 500;

/// True for SQLite busy/locked errors (primary or extended result codes)
pub fn is_lock_error(err: &Error) -> bool {
    let Error::Database(sqlx::Error::Database(db_err)) = err else {
        return false;
    };

    let code_is_lock = db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        // Primary code lives in the low byte: 5 = BUSY, 6 = LOCKED (517 = BUSY_SNAPSHOT)
        .map_or(false, |code| matches!(code & 0xff, 5 | 6));

    code_is_lock || db_err.message().contains("database is locked")
}

/// Run `operation` until it succeeds, fails with a non-lock error, or
/// `max_wait` elapses
///
/// `operation` must be safe to repeat: each attempt runs its own transaction.
pub async fn retry_on_lock<F, Fut, T>(operation_name: &str, max_wait: Duration, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Database operation succeeded after lock retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if is_lock_error(&err) => err,
            Err(err) => return Err(err),
        };

        let elapsed = started.elapsed();
        if elapsed >= max_wait {
            tracing::error!(
                operation = operation_name,
                attempt,
                elapsed_ms = elapsed.as_millis() as u64,
                "Database still locked, giving up: {}",
                err
            );
            return Err(err);
        }

        tracing::warn!(
            operation = operation_name,
            attempt,
            backoff_ms,
            "Database locked, retrying after backoff"
        );
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_success_is_returned_without_retry() {
        let calls = AtomicU32::new(0);
        let value = retry_on_lock("test_op", Duration::from_secs(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(42)
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_lock("test_op", Duration::from_secs(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::NotFound("listing".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_non_database_errors_are_not_lock_errors() {
        assert!(!is_lock_error(&Error::Internal("database is locked".into())));
        assert!(!is_lock_error(&Error::Database(sqlx::Error::RowNotFound)));
    }
}
