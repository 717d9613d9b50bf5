//! Bounded, jittered retry for idempotent GETs. Generalized from the
//! teacher's manual market-init retry loop in `main.rs`
//! (`2u64.pow(retry_count)` backoff), turned into a reusable helper and
//! given jitter so many clients backing off simultaneously don't
//! re-hit the upstream in lockstep.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

pub async fn with_retry<T, E, F, Fut>(max_attempts: u32, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                let base_ms = 200u64 * 2u64.pow(attempt - 1);
                let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
                tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, &'static str> = with_retry(3, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, &'static str> = with_retry(3, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err("always fails") }
        })
        .await;
        assert_eq!(result, Err("always fails"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
