//! Deadline helpers.
//!
//! A zero duration means "no deadline" everywhere in the crate.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default read/write deadline for connections
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on graceful server shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Await `fut`, failing with `ProtocolError::Timeout` once `duration` elapses.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if duration.is_zero() {
        return fut.await;
    }

    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Like [`with_timeout_error`] for futures that cannot fail on their own.
pub async fn with_timeout<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    with_timeout_error(async { Ok(fut.await) }, duration).await
}
