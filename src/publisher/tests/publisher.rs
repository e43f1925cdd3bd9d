//! Tests for Publisher delivery, retries and failure reporting

#[cfg(test)]
mod tests {
    use crate::broker::api::{BrokerClient, ErrorClass, MessageId};
    use crate::core::retry::RetryPolicy;
    use crate::notifications::api::{Event, EventFilter, PublishEventType};
    use crate::publisher::api::{
        Batch, BatchAccumulator, BatchSettings, OutboundMessage, PublishError, PublisherSettings,
    };
    use crate::publisher::tests::helpers::{
        batch_settings, messages, publisher_fixture, publisher_fixture_with,
    };
    use std::time::Duration;

    fn batch_of(outbound: Vec<OutboundMessage>) -> Batch {
        let acc =
            BatchAccumulator::new(batch_settings(1 << 20, outbound.len() + 1, 60_000)).unwrap();
        for message in outbound {
            assert!(acc.add(message).unwrap().is_none());
        }
        acc.flush().unwrap().remove(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_three_unavailable_failures() {
        let fx = publisher_fixture(BatchSettings::default()).await;
        fx.broker
            .inject_publish_failures(ErrorClass::ServiceUnavailable, 3)
            .unwrap();

        let report = fx
            .publisher
            .publish(batch_of(messages(1)))
            .wait()
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.attempts, 4);
        assert_eq!(report.message_ids(), vec![&MessageId("1".to_string())]);
        assert_eq!(fx.broker.stats().unwrap().publish_calls, 4);
        assert_eq!(fx.broker.backlog_len(&fx.subscription).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_reported_per_message() {
        let fx = publisher_fixture(BatchSettings::default()).await;
        fx.broker
            .inject_publish_failures(ErrorClass::PermissionDenied, 1)
            .unwrap();

        let report = fx
            .publisher
            .publish(batch_of(messages(3)))
            .wait()
            .await
            .unwrap();

        assert!(!report.is_success());
        assert_eq!(report.attempts, 1);
        let failures = report.failures();
        assert_eq!(failures.len(), 3);
        let payloads: Vec<&[u8]> = failures.iter().map(|(m, _)| m.payload()).collect();
        assert_eq!(payloads, vec![&b"event-0"[..], b"event-1", b"event-2"]);
        for (_, error) in failures {
            assert!(matches!(
                error,
                PublishError::Permanent { attempts: 1, source } if source.class == ErrorClass::PermissionDenied
            ));
            assert!(!error.is_retryable());
        }
        assert_eq!(fx.broker.stats().unwrap().publish_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retry_deadline() {
        let fx = publisher_fixture_with(PublisherSettings {
            batch: BatchSettings::default(),
            retry: RetryPolicy {
                deadline: Duration::from_secs(5),
                ..RetryPolicy::default()
            },
            timeout: None,
        })
        .await;
        fx.broker
            .inject_publish_failures(ErrorClass::Unknown, 1_000)
            .unwrap();

        let report = fx
            .publisher
            .publish(batch_of(messages(2)))
            .wait()
            .await
            .unwrap();

        assert_eq!(report.failures().len(), 2);
        assert!(matches!(
            report.failures()[0].1,
            PublishError::DeadlineExceeded { .. }
        ));
        assert!(report.attempts > 1);
        assert!(report.latency >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_pending_retries() {
        let fx = publisher_fixture_with(PublisherSettings {
            batch: BatchSettings::default(),
            retry: RetryPolicy {
                initial: Duration::from_secs(30),
                ..RetryPolicy::default()
            },
            timeout: None,
        })
        .await;
        fx.broker
            .inject_publish_failures(ErrorClass::Aborted, 1_000)
            .unwrap();

        let handle = fx.publisher.publish(batch_of(messages(1)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        fx.shutdown.trigger_shutdown();

        let report = handle.wait().await.unwrap();
        assert!(matches!(
            report.failures()[0].1,
            PublishError::Cancelled { attempts: 1, .. }
        ));
        assert_eq!(fx.broker.stats().unwrap().publish_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_only_that_publish() {
        let fx = publisher_fixture_with(PublisherSettings {
            batch: BatchSettings::default(),
            retry: RetryPolicy::default(),
            timeout: Some(Duration::from_secs(3)),
        })
        .await;
        fx.broker
            .inject_publish_failures(ErrorClass::ResourceExhausted, 1_000)
            .unwrap();

        let report = fx
            .publisher
            .publish(batch_of(messages(1)))
            .wait()
            .await
            .unwrap();

        assert!(matches!(
            report.failures()[0].1,
            PublishError::Cancelled { .. }
        ));
        assert!(report.latency < Duration::from_secs(10));
        assert!(!fx.shutdown.is_shutdown_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_interrupts_hung_broker_call() {
        let fx = publisher_fixture_with(PublisherSettings {
            batch: BatchSettings::default(),
            retry: RetryPolicy::default(),
            timeout: Some(Duration::from_secs(3)),
        })
        .await;
        fx.broker.stall_publish(true).unwrap();

        let report = tokio::time::timeout(
            Duration::from_secs(600),
            fx.publisher.publish(batch_of(messages(2))).wait(),
        )
        .await
        .expect("publish outlived its timeout")
        .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.failures().len(), 2);
        for (_, error) in report.failures() {
            assert!(matches!(error, PublishError::Cancelled { attempts: 1, .. }));
            assert!(error.is_retryable());
        }
        assert!(report.latency >= Duration::from_secs(3));
        assert!(report.latency < Duration::from_secs(4));
        assert_eq!(fx.broker.stats().unwrap().stalled_calls, 1);
        assert!(!fx.shutdown.is_shutdown_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_does_not_interrupt_attempt_in_flight() {
        let fx = publisher_fixture(BatchSettings::default()).await;
        fx.broker.stall_publish(true).unwrap();

        let handle = fx.publisher.publish(batch_of(messages(1)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        fx.shutdown.trigger_shutdown();

        let waited = tokio::time::timeout(Duration::from_secs(60), handle.wait()).await;
        assert!(waited.is_err());
        assert_eq!(fx.broker.stats().unwrap().stalled_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_dispatches_by_count() {
        let fx = publisher_fixture(batch_settings(10_000, 2, 60_000)).await;

        for message in messages(5) {
            fx.publisher.enqueue(message).unwrap();
        }
        assert_eq!(fx.publisher.accumulator().pending_messages().unwrap(), 1);
        assert_eq!(fx.publisher.flush().unwrap(), 1);

        let summary = fx.publisher.wait_in_flight().await.unwrap();
        let mut sizes: Vec<usize> = summary.reports.iter().map(|r| r.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2]);
        assert_eq!(summary.published(), 5);
        assert_eq!(summary.failed(), 0);
        assert_eq!(summary.dropped_batches, 0);
        assert_eq!(fx.broker.backlog_len(&fx.subscription).unwrap(), 5);
        assert_eq!(fx.broker.stats().unwrap().publish_calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_timer_publishes_stale_batch() {
        let fx = publisher_fixture(batch_settings(10_000, 10, 1_000)).await;
        let timer = fx.publisher.start_flush_timer();

        fx.publisher
            .enqueue(OutboundMessage::new("lonely"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let summary = fx.publisher.wait_in_flight().await.unwrap();
        assert_eq!(summary.published(), 1);
        let latency = summary.max_latency().unwrap();
        assert!(latency >= Duration::from_secs(1));
        assert!(latency < Duration::from_millis(1_500));

        fx.shutdown.trigger_shutdown();
        timer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_measured_from_accumulation_start() {
        let fx = publisher_fixture(batch_settings(10_000, 10, 60_000)).await;
        fx.publisher.enqueue(OutboundMessage::new("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        fx.publisher.flush().unwrap();

        let summary = fx.publisher.wait_in_flight().await.unwrap();
        assert!(summary.reports[0].latency >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_report_flush_retry_and_publish() {
        let fx = publisher_fixture(BatchSettings::default()).await;
        let mut receiver = fx
            .events
            .subscribe("test", EventFilter::PublishOnly, "test:publisher")
            .unwrap();
        fx.broker
            .inject_publish_failures(ErrorClass::DeadlineExceeded, 1)
            .unwrap();

        fx.publisher
            .publish(batch_of(messages(2)))
            .wait()
            .await
            .unwrap();

        let kinds: Vec<PublishEventType> = receiver
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                Event::Publish(e) => Some(e.event_type),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                PublishEventType::BatchFlushed,
                PublishEventType::RetryScheduled,
                PublishEventType::Published
            ]
        );
    }

    #[tokio::test]
    async fn test_publish_to_missing_topic_fails_permanently() {
        let fx = publisher_fixture(BatchSettings::default()).await;
        fx.broker.delete_topic(&fx.topic).await.unwrap();

        let report = fx
            .publisher
            .publish(batch_of(messages(1)))
            .wait()
            .await
            .unwrap();
        assert!(matches!(
            report.failures()[0].1,
            PublishError::Permanent { source, .. } if source.class == ErrorClass::NotFound
        ));
    }
}
