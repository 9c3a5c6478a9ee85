//! Polling helper for eventually-consistent assertions.

use std::future::Future;
use std::time::Duration;

/// Poll `check` until it returns `Some(T)` or the deadline passes.
///
/// Broadcast convergence is asynchronous by design; tests assert the
/// converged state rather than racing individual events.
///
/// # Panics
///
/// Panics with `message` if the deadline passes first.
#[allow(clippy::panic)]
pub async fn eventually<T, F, Fut>(deadline: Duration, message: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let started = tokio::time::Instant::now();
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if started.elapsed() >= deadline {
            panic!("eventually: {message}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
