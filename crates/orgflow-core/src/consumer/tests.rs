
    use super::*;
    use crate::handlers::EventHandler;
    use crate::session::MemoryBroker;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const DURABLE: &str = "test-consumer";

    /// Records every call; fails the first `fail_first` calls per target.
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_first: usize,
        outcome: HandlerOutcome,
        failures: Mutex<HashMap<String, usize>>,
        delay: Duration,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Self::failing(0, HandlerOutcome::Success)
        }

        fn failing(fail_first: usize, outcome: HandlerOutcome) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_first,
                outcome,
                failures: Mutex::new(HashMap::new()),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_first: 0,
                outcome: HandlerOutcome::Success,
                failures: Mutex::new(HashMap::new()),
                delay,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle(&self, event: &Event) -> HandlerOutcome {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let seq = event.data_str("seq").unwrap_or("?").to_string();
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", event.target, seq));

            let mut failures = self.failures.lock().unwrap();
            let seen = failures.entry(event.target.clone()).or_insert(0);
            if *seen < self.fail_first {
                *seen += 1;
                return self.outcome.clone();
            }
            HandlerOutcome::Success
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            durable_name: DURABLE.to_string(),
            fetch_wait: Duration::from_millis(50),
            handler_timeout: Duration::from_secs(2),
            nak_backoff: RetryConfig::new()
                .with_initial_delay(Duration::ZERO)
                .with_jitter(false),
            ..Default::default()
        }
    }

    fn consumer(broker: &MemoryBroker, handler: Arc<dyn EventHandler>, config: ConsumerConfig) -> ConsumerLoop {
        let router = Router::builder()
            .route("change.*.template_changed", handler)
            .build()
            .unwrap();
        ConsumerLoop::new(Arc::new(broker.clone()), Arc::new(router), config)
    }

    async fn publish(broker: &MemoryBroker, target: &str, seq: &str) {
        let event = Event::new("acme", target, "template_changed").with_data("seq", seq);
        broker
            .publish(&event.subject().unwrap(), event.to_payload().unwrap(), None)
            .await
            .unwrap();
    }

    async fn drain(consumer: &ConsumerLoop, subscription: &dyn DurableSubscription) {
        for _ in 0..10 {
            let batch = subscription.fetch(10, Duration::from_millis(50)).await.unwrap();
            if batch.is_empty() {
                return;
            }
            consumer.process_batch(batch).await;
        }
    }

    async fn subscribe(broker: &MemoryBroker) -> Box<dyn DurableSubscription> {
        broker.subscribe_durable("change.>", DURABLE).await.unwrap()
    }

    #[tokio::test]
    async fn test_success_acks_everything() {
        let broker = MemoryBroker::new();
        let handler = Recorder::new();
        let consumer = consumer(&broker, handler.clone(), config());
        let subscription = subscribe(&broker).await;

        publish(&broker, "acme/a", "1").await;
        publish(&broker, "acme/b", "1").await;
        drain(&consumer, subscription.as_ref()).await;

        assert_eq!(handler.calls().len(), 2);
        assert_eq!(broker.unacked(DURABLE), 0);
        let stats = consumer.stats().snapshot();
        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.acked, 2);
    }

    #[tokio::test]
    async fn test_retryable_failure_redelivers() {
        let broker = MemoryBroker::new();
        let handler = Recorder::failing(1, HandlerOutcome::retryable("busy"));
        let consumer = consumer(&broker, handler.clone(), config());
        let subscription = subscribe(&broker).await;

        publish(&broker, "acme/a", "1").await;
        drain(&consumer, subscription.as_ref()).await;

        assert_eq!(handler.calls(), vec!["acme/a:1", "acme/a:1"]);
        assert_eq!(broker.unacked(DURABLE), 0);
        let stats = consumer.stats().snapshot();
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.dead_lettered, 0);
    }

    #[tokio::test]
    async fn test_exhausted_deliveries_are_dead_lettered() {
        let broker = MemoryBroker::new();
        let handler = Recorder::failing(usize::MAX, HandlerOutcome::retryable("downstream down"));
        let consumer = consumer(&broker, handler.clone(), config());
        let subscription = subscribe(&broker).await;

        publish(&broker, "acme/a", "1").await;
        drain(&consumer, subscription.as_ref()).await;

        assert_eq!(handler.calls().len(), 3);
        assert_eq!(broker.unacked(DURABLE), 0);

        let letters = broker.published("deadletter.acme.template_changed").unwrap();
        assert_eq!(letters.len(), 1);
        let record: DeadLetter = serde_json::from_slice(&letters[0]).unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.target, "acme/a");
        assert_eq!(record.subject, "change.acme.template_changed");
        assert_eq!(record.reason, "downstream down");
        assert_eq!(record.handler, "recorder");
        assert_eq!(record.event.data_str("seq"), Some("1"));
        assert_eq!(consumer.stats().snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_acked_once() {
        let broker = MemoryBroker::new();
        let handler = Recorder::failing(usize::MAX, HandlerOutcome::permanent("bad files"));
        let consumer = consumer(&broker, handler.clone(), config());
        let subscription = subscribe(&broker).await;

        publish(&broker, "acme/a", "1").await;
        drain(&consumer, subscription.as_ref()).await;

        assert_eq!(handler.calls().len(), 1);
        assert_eq!(broker.unacked(DURABLE), 0);
        assert!(broker.published("deadletter.>").unwrap().is_empty());
        assert_eq!(consumer.stats().snapshot().permanent_failures, 1);
    }

    #[tokio::test]
    async fn test_group_remainder_waits_for_failed_message() {
        let broker = MemoryBroker::new();
        let handler = Recorder::failing(1, HandlerOutcome::retryable("busy"));
        let consumer = consumer(&broker, handler.clone(), config());
        let subscription = subscribe(&broker).await;

        publish(&broker, "acme/a", "1").await;
        publish(&broker, "acme/a", "2").await;
        publish(&broker, "acme/a", "3").await;
        drain(&consumer, subscription.as_ref()).await;

        // 2 and 3 never ran ahead of 1
        assert_eq!(
            handler.calls(),
            vec!["acme/a:1", "acme/a:1", "acme/a:2", "acme/a:3"]
        );
        let stats = consumer.stats().snapshot();
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.deferred, 2);
        assert_eq!(broker.unacked(DURABLE), 0);
    }

    /// Fails each `seq` the scripted number of times, then succeeds.
    struct Scripted {
        calls: Mutex<Vec<String>>,
        failures: Mutex<HashMap<String, usize>>,
    }

    impl Scripted {
        fn new(script: &[(&str, usize)]) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(
                    script
                        .iter()
                        .map(|(seq, n)| (seq.to_string(), *n))
                        .collect(),
                ),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn handle(&self, event: &Event) -> HandlerOutcome {
            let seq = event.data_str("seq").unwrap_or("?").to_string();
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", event.target, seq));
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&seq) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    HandlerOutcome::retryable(format!("seq {seq} not ready"))
                }
                _ => HandlerOutcome::Success,
            }
        }
    }

    #[tokio::test]
    async fn test_deferrals_do_not_consume_delivery_budget() {
        let broker = MemoryBroker::new();
        let handler = Scripted::new(&[("1", usize::MAX), ("2", 1)]);
        let consumer = consumer(&broker, handler.clone(), config());
        let subscription = subscribe(&broker).await;

        publish(&broker, "acme/a", "1").await;
        publish(&broker, "acme/a", "2").await;
        drain(&consumer, subscription.as_ref()).await;

        // 2 waited behind 1 twice, then got its own three attempts
        assert_eq!(
            handler.calls(),
            vec!["acme/a:1", "acme/a:1", "acme/a:1", "acme/a:2", "acme/a:2"]
        );
        let letters = broker.published("deadletter.>").unwrap();
        assert_eq!(letters.len(), 1);
        let record: DeadLetter = serde_json::from_slice(&letters[0]).unwrap();
        assert_eq!(record.event.data_str("seq"), Some("1"));
        assert_eq!(record.attempts, 3);

        let stats = consumer.stats().snapshot();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.deferred, 2);
        assert_eq!(broker.unacked(DURABLE), 0);
    }

    #[tokio::test]
    async fn test_order_holds_across_batches() {
        let broker = MemoryBroker::new();
        let handler = Scripted::new(&[("1", 1)]);
        let consumer = consumer(
            &broker,
            handler.clone(),
            ConsumerConfig {
                batch_size: 1,
                nak_backoff: RetryConfig::new()
                    .with_initial_delay(Duration::from_millis(200))
                    .with_jitter(false),
                ..config()
            },
        );
        let subscription = subscribe(&broker).await;

        publish(&broker, "acme/a", "1").await;
        publish(&broker, "acme/a", "2").await;
        for _ in 0..20 {
            let batch = subscription.fetch(1, Duration::from_millis(500)).await.unwrap();
            if batch.is_empty() {
                break;
            }
            consumer.process_batch(batch).await;
        }

        // 2 arrived in its own batch while 1 waited for redelivery
        assert_eq!(handler.calls(), vec!["acme/a:1", "acme/a:1", "acme/a:2"]);
        let stats = consumer.stats().snapshot();
        assert!(stats.deferred >= 1);
        assert_eq!(stats.acked, 2);
        assert_eq!(broker.unacked(DURABLE), 0);
    }

    #[tokio::test]
    async fn test_block_lapses_when_failed_message_never_returns() {
        let broker = MemoryBroker::new();
        let handler = Recorder::new();
        let consumer = consumer(
            &broker,
            handler.clone(),
            ConsumerConfig {
                handler_timeout: Duration::from_millis(10),
                fetch_wait: Duration::from_millis(10),
                progress_interval: Duration::from_millis(10),
                ..config()
            },
        );
        consumer.block("acme/acme/a", 0, Duration::ZERO);
        assert!(consumer.blocked_behind("acme/acme/a", 5).is_some());
        assert!(consumer.blocked_behind("acme/acme/a", 0).is_none());
        assert!(consumer.blocked_behind("acme/acme/b", 5).is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(consumer.blocked_behind("acme/acme/a", 5).is_none());
    }

    #[tokio::test]
    async fn test_slow_group_keeps_messages_alive() {
        let broker = MemoryBroker::new().with_ack_wait(Duration::from_millis(100));
        let handler = Recorder::slow(Duration::from_millis(80));
        let consumer = consumer(
            &broker,
            handler.clone(),
            ConsumerConfig {
                progress_interval: Duration::from_millis(30),
                ..config()
            },
        );
        let subscription = subscribe(&broker).await;

        for seq in ["1", "2", "3"] {
            publish(&broker, "acme/a", seq).await;
        }
        let batch = subscription.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 3);
        consumer.process_batch(batch).await;

        assert_eq!(handler.calls(), vec!["acme/a:1", "acme/a:2", "acme/a:3"]);
        let stats = consumer.stats().snapshot();
        assert_eq!(stats.acked, 3);
        assert_eq!(stats.nacked, 0);
        assert_eq!(broker.unacked(DURABLE), 0);
        assert!(subscription
            .fetch(10, Duration::from_millis(150))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_per_target_order_across_targets() {
        let broker = MemoryBroker::new();
        let handler = Recorder::slow(Duration::from_millis(5));
        let consumer = consumer(
            &broker,
            handler.clone(),
            ConsumerConfig {
                max_workers: 4,
                ..config()
            },
        );
        let subscription = subscribe(&broker).await;

        for seq in 0..5 {
            for target in ["acme/a", "acme/b", "acme/c"] {
                publish(&broker, target, &seq.to_string()).await;
            }
        }
        drain(&consumer, subscription.as_ref()).await;

        let calls = handler.calls();
        assert_eq!(calls.len(), 15);
        for target in ["acme/a", "acme/b", "acme/c"] {
            let seen: Vec<&str> = calls
                .iter()
                .filter_map(|c| c.strip_prefix(&format!("{target}:")))
                .collect();
            assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unrouted_are_acked() {
        let broker = MemoryBroker::new();
        let handler = Recorder::new();
        let consumer = consumer(&broker, handler.clone(), config());
        let subscription = subscribe(&broker).await;

        broker
            .publish("change.acme.template_changed", b"{not json".to_vec(), None)
            .await
            .unwrap();
        let other = Event::new("acme", "acme/a", "workflow_status");
        broker
            .publish(&other.subject().unwrap(), other.to_payload().unwrap(), None)
            .await
            .unwrap();
        drain(&consumer, subscription.as_ref()).await;

        assert!(handler.calls().is_empty());
        assert_eq!(broker.unacked(DURABLE), 0);
        let stats = consumer.stats().snapshot();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unrouted, 1);
        assert_eq!(stats.acked, 2);
    }

    #[tokio::test]
    async fn test_handler_timeout_is_retryable() {
        let broker = MemoryBroker::new();
        let handler = Recorder::slow(Duration::from_secs(5));
        let consumer = consumer(
            &broker,
            handler.clone(),
            ConsumerConfig {
                handler_timeout: Duration::from_millis(20),
                ..config()
            },
        );
        let subscription = subscribe(&broker).await;

        publish(&broker, "acme/a", "1").await;
        let batch = subscription.fetch(10, Duration::from_millis(50)).await.unwrap();
        consumer.process_batch(batch).await;

        let stats = consumer.stats().snapshot();
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.acked, 0);
        assert_eq!(broker.unacked(DURABLE), 1);
    }

    #[tokio::test]
    async fn test_timeout_dead_letter_names_handler() {
        let broker = MemoryBroker::new();
        let handler = Recorder::slow(Duration::from_secs(5));
        let consumer = consumer(
            &broker,
            handler.clone(),
            ConsumerConfig {
                handler_timeout: Duration::from_millis(20),
                max_deliveries: 1,
                ..config()
            },
        );
        let subscription = subscribe(&broker).await;

        publish(&broker, "acme/a", "1").await;
        let batch = subscription.fetch(10, Duration::from_millis(50)).await.unwrap();
        consumer.process_batch(batch).await;

        let letters = broker.published("deadletter.>").unwrap();
        assert_eq!(letters.len(), 1);
        let record: DeadLetter = serde_json::from_slice(&letters[0]).unwrap();
        assert!(record.reason.contains("timed out"));
        assert_eq!(record.handler, "recorder");
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let broker = MemoryBroker::new();
        let handler = Recorder::new();
        let consumer = Arc::new(consumer(&broker, handler.clone(), config()));
        let token = CancellationToken::new();

        let task = {
            let consumer = consumer.clone();
            let token = token.clone();
            tokio::spawn(async move { consumer.run(token).await })
        };

        publish(&broker, "acme/a", "1").await;
        for _ in 0..100 {
            if consumer.stats().snapshot().acked == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.calls(), vec!["acme/a:1"]);

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_survives_disconnect() {
        let broker = MemoryBroker::new();
        let handler = Recorder::new();
        let consumer = Arc::new(consumer(
            &broker,
            handler.clone(),
            ConsumerConfig {
                fetch_backoff: RetryConfig::new()
                    .with_initial_delay(Duration::from_millis(10))
                    .with_jitter(false),
                ..config()
            },
        ));
        let token = CancellationToken::new();
        let task = {
            let consumer = consumer.clone();
            let token = token.clone();
            tokio::spawn(async move { consumer.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.drop_connection();
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.restore_connection();
        publish(&broker, "acme/a", "1").await;

        for _ in 0..100 {
            if consumer.stats().snapshot().acked == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.calls(), vec!["acme/a:1"]);

        token.cancel();
        task.await.unwrap().unwrap();
    }
