//! Helpers for running blocking work and cancellation under Tokio.

use anyhow::Result;
use core::fmt::{Debug, Display};
use futures_util::{Future, FutureExt};
use ::tokio_util::sync::CancellationToken;

/// Call a faillible future, while monitoring `token` and return an error if cancelled.
pub async fn run_with_cancellable<F, R>(f: F, token: &CancellationToken) -> Result<R>
where
    F: Future<Output = Result<R>>,
{
    check_cancelled(token)?;
    tokio::select! {
       r = f => r,
       _ = token.cancelled() => {
           Err(anyhow::anyhow!("Operation was cancelled"))
       }
    }
}

/// Return an error if `token` has been cancelled.
pub fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(anyhow::anyhow!("Operation was cancelled"));
    }
    Ok(())
}

/// Flatten a nested Result<Result<T>>, defaulting to converting the error type to an `anyhow::Error`.
/// See https://doc.rust-lang.org/std/result/enum.Result.html#method.flatten
pub(crate) fn flatten_anyhow<T, E>(r: std::result::Result<Result<T>, E>) -> Result<T>
where
    E: Display + Debug + Send + Sync + 'static,
{
    match r {
        Ok(x) => x,
        Err(e) => Err(anyhow::anyhow!(e)),
    }
}

/// A wrapper around [`tokio::task::spawn_blocking`] that flattens nested results.
pub fn spawn_blocking_flatten<F, T>(f: F) -> impl Future<Output = Result<T>>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).map(flatten_anyhow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancellable() {
        let token = CancellationToken::new();

        let token_copy = token.clone();
        let s = async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            token_copy.cancel();
        };
        let r = async move {
            tokio::time::sleep(std::time::Duration::from_secs(200)).await;
            Ok(())
        };
        let r = run_with_cancellable(r, &token);
        let (_, r) = tokio::join!(s, r);
        assert!(r.is_err());
        assert!(check_cancelled(&token).is_err());
    }

    #[tokio::test]
    async fn test_blocking_flatten() {
        let r = spawn_blocking_flatten(|| Ok(42)).await.unwrap();
        assert_eq!(r, 42);
        let r = spawn_blocking_flatten(|| -> Result<()> { anyhow::bail!("failed") }).await;
        assert_eq!(r.unwrap_err().to_string(), "failed");
    }
}
