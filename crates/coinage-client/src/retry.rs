//! Bounded retries for exchange requests
//!
//! A `5xx` reply carrying the soft database failure code is retried at
//! once. Other `5xx` replies and transport failures back off
//! exponentially with jitter, capped at `max_delay_ms`. Any other reply is
//! handed back to the caller for interpretation and never retried here.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{ErrorCode, ProtocolError, Result, TransportError};
use crate::transport::HttpResponse;
use crate::wire::ErrorJson;

/// How a single attempt ended
#[derive(Debug, PartialEq, Eq)]
enum AttemptOutcome {
    /// Reply to interpret
    Final,
    /// Retry immediately
    RetryNow(String),
    /// Retry after a backoff
    Backoff(String),
}

fn classify(result: &std::result::Result<HttpResponse, TransportError>) -> AttemptOutcome {
    match result {
        Err(e) => AttemptOutcome::Backoff(e.to_string()),
        Ok(response) if response.is_server_error() => {
            let error = ErrorJson::from_body(&response.body);
            let reason = format!("status {} code {}", response.status, error.code);
            if error.error_code() == Some(ErrorCode::DbSoftFailure) {
                AttemptOutcome::RetryNow(reason)
            } else {
                AttemptOutcome::Backoff(reason)
            }
        }
        Ok(_) => AttemptOutcome::Final,
    }
}

/// Backoff before attempt `attempt + 1`, given `attempt` failures so far
pub fn backoff_delay<R: Rng>(policy: &RetryPolicy, attempt: u32, rng: &mut R) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let ceiling = policy
        .base_delay_ms
        .saturating_mul(1u64 << exp)
        .min(policy.max_delay_ms);
    let half = ceiling / 2;
    Duration::from_millis(half + rng.gen_range(0..=ceiling - half))
}

/// Run `send` until it yields a reply to interpret or the budget runs out
pub async fn send_with_retry<F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut send: F,
) -> Result<HttpResponse>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<HttpResponse, TransportError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = send().await;
        let reason = match classify(&result) {
            AttemptOutcome::Final => {
                return result.map_err(|e| ProtocolError::Transient {
                    attempts: attempt,
                    reason: e.to_string(),
                })
            }
            AttemptOutcome::RetryNow(reason) => {
                debug!("{} hit a soft database failure, retrying", operation);
                if attempt >= policy.max_attempts {
                    reason
                } else {
                    continue;
                }
            }
            AttemptOutcome::Backoff(reason) => {
                if attempt >= policy.max_attempts {
                    reason
                } else {
                    let delay = backoff_delay(policy, attempt, &mut rand::thread_rng());
                    debug!(
                        "{} failed ({}), retrying in {:?}",
                        operation, reason, delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
        };
        warn!("{} gave up after {} attempts: {}", operation, attempt, reason);
        return Err(ProtocolError::Transient {
            attempts: attempt,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_backoff_is_capped_and_grows() {
        let policy = RetryPolicy::default();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        for attempt in 1..40 {
            let delay = backoff_delay(&policy, attempt, &mut rng);
            assert!(delay <= Duration::from_millis(policy.max_delay_ms));
        }
        let first = backoff_delay(&policy, 1, &mut rng);
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
        let fifth = backoff_delay(&policy, 5, &mut rng);
        assert!(fifth >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_soft_db_failure_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let response = send_with_retry(&fast_policy(5), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Ok(HttpResponse::new(500, json!({"code": 1010, "hint": "soft"})))
                } else {
                    Ok(HttpResponse::new(200, json!({})))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_transient() {
        let calls = AtomicU32::new(0);
        let result = send_with_retry(&fast_policy(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Network("connection refused".to_string())) }
        })
        .await;
        assert!(matches!(
            result,
            Err(ProtocolError::Transient { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let response = send_with_retry(&fast_policy(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(HttpResponse::new(409, json!({"code": 1205}))) }
        })
        .await
        .unwrap();
        assert_eq!(response.status, 409);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
