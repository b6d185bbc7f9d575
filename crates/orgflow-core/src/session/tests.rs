
    use super::*;
    use crate::event_bus::ConnectionEvent;

    fn broker() -> MemoryBroker {
        MemoryBroker::new().with_ack_wait(Duration::from_secs(60))
    }

    async fn fetch_all(sub: &dyn DurableSubscription) -> Vec<Delivery> {
        sub.fetch(100, Duration::from_millis(50)).await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_dedup_window() {
        let broker = broker();
        let first = broker
            .publish("change.acme.x", b"1".to_vec(), Some("k"))
            .await
            .unwrap();
        let second = broker
            .publish("change.acme.x", b"2".to_vec(), Some("k"))
            .await
            .unwrap();
        let unkeyed = broker.publish("change.acme.x", b"3".to_vec(), None).await.unwrap();

        assert_eq!(first, PublishOutcome::Accepted);
        assert_eq!(second, PublishOutcome::Duplicate);
        assert_eq!(unkeyed, PublishOutcome::Accepted);
        assert_eq!(broker.published("change.>").unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_key_reusable_after_window() {
        let broker = MemoryBroker::new().with_dedup_window(Duration::from_secs(10));
        broker.publish("a.b", vec![], Some("k")).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            broker.publish("a.b", vec![], Some("k")).await.unwrap(),
            PublishOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn test_durable_resumes_after_ack() {
        let broker = broker();
        for i in 0..3u8 {
            broker.publish("change.acme.t", vec![i], None).await.unwrap();
        }

        let sub = broker.subscribe_durable("change.>", "d").await.unwrap();
        let batch = sub.fetch(2, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 2);
        for delivery in batch {
            delivery.ack().await.unwrap();
        }
        drop(sub);

        // rebinding the same durable continues where it left off
        let sub = broker.subscribe_durable("change.>", "d").await.unwrap();
        let batch = fetch_all(sub.as_ref()).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, vec![2]);
        assert_eq!(batch[0].delivered, 1);
    }

    #[tokio::test]
    async fn test_durable_filter_is_fixed() {
        let broker = broker();
        broker.subscribe_durable("change.>", "d").await.unwrap();
        assert!(broker.subscribe_durable("lock.>", "d").await.is_err());
    }

    #[tokio::test]
    async fn test_nak_increments_delivery_count() {
        let broker = broker();
        broker.publish("change.acme.t", vec![1], None).await.unwrap();
        let sub = broker.subscribe_durable("change.>", "d").await.unwrap();

        let first = fetch_all(sub.as_ref()).await.remove(0);
        assert_eq!(first.delivered, 1);
        first.nak(Duration::ZERO).await.unwrap();

        let second = fetch_all(sub.as_ref()).await.remove(0);
        assert_eq!(second.delivered, 2);
        second.ack().await.unwrap();

        assert!(fetch_all(sub.as_ref()).await.is_empty());
        assert_eq!(broker.unacked("d"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_wait_expiry_redelivers() {
        let broker = MemoryBroker::new().with_ack_wait(Duration::from_secs(30));
        broker.publish("change.acme.t", vec![1], None).await.unwrap();
        let sub = broker.subscribe_durable("change.>", "d").await.unwrap();

        let forgotten = fetch_all(sub.as_ref()).await;
        assert_eq!(forgotten.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let again = fetch_all(sub.as_ref()).await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_progress_extends_ack_wait() {
        let broker = MemoryBroker::new().with_ack_wait(Duration::from_secs(30));
        broker.publish("change.acme.t", vec![1], None).await.unwrap();
        let sub = broker.subscribe_durable("change.>", "d").await.unwrap();

        let slow = fetch_all(sub.as_ref()).await.remove(0);
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(20)).await;
            slow.progress_handle().in_progress().await.unwrap();
        }
        assert!(fetch_all(sub.as_ref()).await.is_empty());
        slow.ack().await.unwrap();
        assert_eq!(broker.unacked("d"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_after_ack_wait_fails() {
        let broker = MemoryBroker::new().with_ack_wait(Duration::from_secs(30));
        broker.publish("change.acme.t", vec![1], None).await.unwrap();
        let sub = broker.subscribe_durable("change.>", "d").await.unwrap();

        let late = fetch_all(sub.as_ref()).await.remove(0);
        let sequence = late.sequence;
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(late.ack().await.is_err());

        let again = fetch_all(sub.as_ref()).await.remove(0);
        assert_eq!(again.sequence, sequence);
        assert_eq!(again.delivered, 2);
    }

    #[tokio::test]
    async fn test_sequences_follow_publish_order() {
        let broker = broker();
        for i in 0..3u8 {
            broker.publish("change.acme.t", vec![i], None).await.unwrap();
        }
        let sub = broker.subscribe_durable("change.>", "d").await.unwrap();
        let batch = fetch_all(sub.as_ref()).await;
        let sequences: Vec<u64> = batch.iter().map(|d| d.sequence).collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_last_message_reads_newest_on_subject() {
        let broker = broker();
        assert_eq!(broker.last_message("lock.acme.t").await.unwrap(), None);
        broker.publish("change.acme.t", b"a".to_vec(), None).await.unwrap();
        broker.publish("change.acme.t", b"b".to_vec(), None).await.unwrap();
        broker.publish("change.acme.u", b"c".to_vec(), None).await.unwrap();
        assert_eq!(
            broker.last_message("change.acme.t").await.unwrap(),
            Some(b"b".to_vec())
        );
    }

    #[tokio::test]
    async fn test_close_reports_closed() {
        let broker = broker();
        let mut events = broker.events().subscribe();

        broker.close().await.unwrap();
        broker.close().await.unwrap();
        assert_eq!(broker.connection_state(), ConnectionState::Closed);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
        assert!(events.try_recv().is_err());
        assert!(broker.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_connection_drop_redelivers_unacked_only() {
        let broker = broker();
        let mut events = broker.events().subscribe();
        for i in 0..4u8 {
            broker.publish("change.acme.t", vec![i], None).await.unwrap();
        }
        let sub = broker.subscribe_durable("change.>", "d").await.unwrap();

        let mut batch = fetch_all(sub.as_ref()).await;
        assert_eq!(batch.len(), 4);
        let pending = batch.split_off(2);
        for delivery in batch {
            delivery.ack().await.unwrap();
        }

        broker.drop_connection();
        assert_eq!(broker.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Disconnected { .. }
        ));
        // stale handles cannot settle
        for delivery in pending {
            assert!(delivery.ack().await.is_err());
        }
        assert!(sub.fetch(10, Duration::from_millis(10)).await.is_err());

        broker.restore_connection();
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { .. }
        ));

        let redelivered = fetch_all(sub.as_ref()).await;
        let payloads: Vec<u8> = redelivered.iter().map(|d| d.payload[0]).collect();
        assert_eq!(payloads, vec![2, 3]);
        assert!(redelivered.iter().all(|d| d.delivered == 2));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let broker = broker();
        broker
            .reply_with("ping.*", |payload| {
                let mut reply = b"pong:".to_vec();
                reply.extend(payload);
                reply
            })
            .unwrap();

        let reply = broker
            .request("ping.acme", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"pong:ping".to_vec());

        assert!(broker
            .request("other", vec![], Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_offline_connector_fails() {
        let offline = MemoryBroker::offline();
        assert!(matches!(offline.connect().await, Err(crate::Error::Connection(_))));

        let online = broker();
        let session = online.connect().await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Connected);
    }
