
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flat() -> RetryConfig {
        RetryConfig::new()
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    #[test]
    fn test_curve_doubles_until_ceiling() {
        let curve = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60))
            .with_jitter(false);

        let delays: Vec<u64> = (1..=8)
            .map(|n| curve.delay_for_attempt(n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(curve.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(curve.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_initial_delay_stays_zero() {
        let curve = RetryConfig::new().with_initial_delay(Duration::ZERO);
        assert_eq!(curve.delay_for_attempt(5), Duration::ZERO);
    }

    #[test]
    fn test_jitter_bounded() {
        let curve = RetryConfig::new().with_initial_delay(Duration::from_millis(400));
        for _ in 0..50 {
            let delay = curve.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay < Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_with_backoff(
            &flat().with_max_attempts(3),
            || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Publish("no responders".into()))
                } else {
                    Ok("stored")
                }
            },
            Error::is_retryable,
        )
        .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), Error> = retry_with_backoff(
            &flat().with_max_attempts(2),
            || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Connection(format!("refused #{n}")))
            },
            Error::is_retryable,
        )
        .await;

        assert_eq!(result.unwrap_err().to_string(), "connection error: refused #1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_returned_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), Error> = retry_with_backoff(
            &flat().with_max_attempts(5),
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Authentication("authorization violation".into()))
            },
            Error::is_retryable,
        )
        .await;

        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
