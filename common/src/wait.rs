use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// How often async cloud operations are probed.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on any single cloud operation.
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Probe(E),
}

/// Probes `f` at a fixed `interval` until it yields a value or `deadline`
/// elapses. The first probe runs immediately. A probe returning `Ok(None)`
/// means "not there yet"; a probe error aborts the wait.
pub async fn poll_until<T, E, F, Fut>(
    interval: Duration,
    deadline: Duration,
    mut f: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match f().await {
            Ok(Some(v)) => return Ok(v),
            Ok(None) => {
                tracing::debug!(attempt, elapsed = ?started.elapsed(), "condition not met yet");
            }
            Err(e) => return Err(PollError::Probe(e)),
        }
        if started.elapsed() + interval > deadline {
            return Err(PollError::Timeout(deadline));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn resolves_once_probe_succeeds() {
        let calls = AtomicUsize::new(0);
        let out = poll_until(
            Duration::from_millis(1),
            Duration::from_secs(1),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok::<_, std::convert::Infallible>(None)
                } else {
                    Ok(Some(42))
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_when_condition_never_holds() {
        let res: Result<(), _> = poll_until(
            Duration::from_millis(5),
            Duration::from_millis(12),
            || async { Ok::<_, std::convert::Infallible>(None) },
        )
        .await;
        assert!(matches!(res, Err(PollError::Timeout(_))));
    }

    #[tokio::test]
    async fn probe_errors_abort_immediately() {
        let res: Result<(), _> = poll_until(
            Duration::from_millis(5),
            Duration::from_secs(1),
            || async { Err("boom") },
        )
        .await;
        assert!(matches!(res, Err(PollError::Probe("boom"))));
    }
}
