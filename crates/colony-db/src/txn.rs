//! Transaction retry runner.
//!
//! Store operations run their statements inside a single sqlx transaction
//! and route the whole attempt through [`with_retry`], which re-runs the
//! closure only for errors classified transient (SQLITE_BUSY /
//! SQLITE_LOCKED). Everything else surfaces immediately: `VersionConflict`
//! and `ClaimContention` in particular are caller-visible outcomes, not
//! retry fodder.
//!
//! Rollback on the error path is handled by sqlx's transaction drop guard,
//! so a `?` anywhere inside the closure abandons all writes of the attempt.
//! Cancellation works the same way: dropping the future mid-flight drops
//! the transaction and rolls back.
//!
//! Composition happens through `*_tx` functions that take the live
//! `&mut SqliteConnection`; nesting `with_retry` inside an open transaction
//! is not supported.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// Maximum attempts for a transactional closure, including the first.
const MAX_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff between attempts.
const BASE_BACKOFF: Duration = Duration::from_millis(20);

/// Run `op` to completion, re-running it with exponential backoff while it
/// fails with a transient store error.
///
/// `op` must be safe to re-run from scratch: each invocation is expected to
/// begin (and commit or abandon) its own transaction.
pub async fn with_retry<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                debug!(attempt, error = %err, "retrying transaction after transient error");
                tokio::time::sleep(backoff(attempt)).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    BASE_BACKOFF * 2u32.saturating_pow(attempt.saturating_sub(1))
}
