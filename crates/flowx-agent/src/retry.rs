//! Fixed-pause retry for language-model calls.

use std::time::Duration;

use flowx_types::{FlowError, Result};

/// Call `f` until it yields a non-empty response.
///
/// `f` runs at most `max_retries + 1` times. An empty response or an error
/// satisfying [`FlowError::is_retryable`] triggers another attempt after
/// `pause`; any other error is returned at once.
pub async fn complete_with_retry<F, Fut>(
    f: F,
    max_retries: usize,
    pause: Duration,
    node: &str,
) -> Result<String>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    for attempt in 0..=max_retries {
        match f().await {
            Ok(text) if !text.is_empty() => return Ok(text),
            Ok(_) if attempt < max_retries => {
                tracing::warn!(node = %node, attempt, pause_ms = %pause.as_millis(), "Empty response, retrying");
                tokio::time::sleep(pause).await;
            }
            Err(e) if e.is_retryable() && attempt < max_retries => {
                tracing::warn!(node = %node, attempt, pause_ms = %pause.as_millis(), error = %e, "Retryable error, retrying");
                tokio::time::sleep(pause).await;
            }
            Err(e) => return Err(e),
            Ok(_) => break,
        }
    }
    Err(FlowError::ExternalCall {
        message: format!("request failed after {} attempts", max_retries + 1),
        retryable: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn success_on_first_try() {
        let result = complete_with_retry(
            || async { Ok("done".to_string()) },
            3,
            Duration::ZERO,
            "node_a",
        )
        .await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn empty_response_is_retried() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result = complete_with_retry(
            move || {
                let cc = cc.clone();
                async move {
                    let n = cc.fetch_add(1, Ordering::SeqCst);
                    Ok(if n < 2 { String::new() } else { "late".to_string() })
                }
            },
            3,
            Duration::ZERO,
            "node_b",
        )
        .await;

        assert_eq!(result.unwrap(), "late");
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result = complete_with_retry(
            move || {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Ok(String::new())
                }
            },
            3,
            Duration::ZERO,
            "node_c",
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "External call failed: request failed after 4 attempts");
        assert_eq!(call_count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retryable_error_is_retried() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result = complete_with_retry(
            move || {
                let cc = cc.clone();
                async move {
                    if cc.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(FlowError::ExternalCall {
                            message: "503".into(),
                            retryable: true,
                        })
                    } else {
                        Ok("recovered".to_string())
                    }
                }
            },
            3,
            Duration::ZERO,
            "node_d",
        )
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_no_retry() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result = complete_with_retry(
            move || {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err(FlowError::config("LLM api undefined"))
                }
            },
            5,
            Duration::ZERO,
            "node_e",
        )
        .await;

        assert!(matches!(result.unwrap_err(), FlowError::Configuration(_)));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_the_fixed_pause_between_attempts() {
        let started = tokio::time::Instant::now();
        let result = complete_with_retry(
            || async { Ok(String::new()) },
            2,
            Duration::from_secs(1),
            "node_f",
        )
        .await;
        assert!(result.is_err());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3), "{waited:?}");
    }
}
