use std::time::Duration;

use crate::StoreError;

/// Bounded exponential backoff for transient store failures.
///
/// Production constants are not pinned by the format; these defaults are the
/// ones this implementation ships: 5 attempts, 100ms base, doubling, 5s cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No retries; direct pass-through. Used by tests and by callers that
    /// layer their own budget.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails terminally, or the attempt budget is
/// spent. The surfaced error carries the number of retries performed.
pub fn with_retries<T>(
    policy: &RetryPolicy,
    op_name: &'static str,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_err: Option<StoreError> = None;
    for attempt in 0..attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    target: "strata_flow",
                    event = "store_retry",
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient store failure, retrying"
                );
                std::thread::sleep(delay);
                last_err = Some(err);
            }
            Err(err) => {
                let err = match err {
                    StoreError::Io { key, message, .. } => StoreError::Io {
                        key,
                        message,
                        retries: attempt,
                    },
                    other => other,
                };
                return Err(err);
            }
        }
    }
    // Unreachable in practice; the loop always returns on the last attempt.
    Err(last_err.unwrap_or_else(|| StoreError::io("<retry>", "no attempts were made")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;
    use crate::ObjectStore;

    #[test]
    fn retries_transient_failures_until_success() {
        let store = MemStore::new();
        store.put("a", b"ok").unwrap();
        store.fail_next_gets(2);

        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let bytes = with_retries(&policy, "get", || store.get("a")).unwrap();
        assert_eq!(bytes, b"ok");
    }

    #[test]
    fn budget_exhaustion_reports_retry_count() {
        let store = MemStore::new();
        store.put("a", b"ok").unwrap();
        store.fail_next_gets(10);

        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let err = with_retries(&policy, "get", || store.get("a")).unwrap_err();
        match err {
            StoreError::Io { retries, .. } => assert_eq!(retries, 2),
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn terminal_errors_do_not_retry() {
        let store = MemStore::new();
        let policy = RetryPolicy::default();
        let err = with_retries(&policy, "get", || store.get("missing")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.get_calls(), 1);
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(20), Duration::from_secs(5));
    }
}
