//! Tests for Consumer dispatch, backpressure and shutdown

#[cfg(test)]
mod tests {
    use crate::broker::api::{AckHandle, ErrorClass};
    use crate::core::shutdown::ShutdownCoordinator;
    use crate::notifications::api::{ConsumerEventType, Event, EventFilter};
    use crate::subscriber::api::{
        Consumer, ConsumerSettings, InboundMessage, SubscribeError, WorkerError,
    };
    use crate::subscriber::tests::helpers::{consumer_fixture, consumer_settings};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    async fn acknowledge_all(
        _message: InboundMessage,
        _shutdown: ShutdownCoordinator,
    ) -> Result<(), WorkerError> {
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_worker_is_extended_then_acknowledged_once() {
        let fx = consumer_fixture().await;
        fx.publish(1).await;
        let consumer = fx.consumer(ConsumerSettings {
            ack_deadline_seconds: 30,
            lease_tick: Duration::from_secs(10),
            ..ConsumerSettings::default()
        });

        let report = consumer
            .run_for(
                |_message, _shutdown| async {
                    tokio::time::sleep(Duration::from_secs(35)).await;
                    Ok(())
                },
                &fx.shutdown,
                Some(Duration::from_secs(40)),
            )
            .await
            .unwrap();

        let handle = AckHandle("ack-1".to_string());
        let stats = fx.broker.stats().unwrap();
        assert!(stats.extension_count(&handle) >= 2);
        assert_eq!(stats.ack_count(&handle), 1);
        assert_eq!(stats.redeliveries, 0);

        assert_eq!(report.received, 1);
        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.abandoned, 0);
        assert!(report.extensions >= 2);
        assert_eq!(fx.broker.outstanding_len(&fx.subscription).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_message_acknowledged_once() {
        let fx = consumer_fixture().await;
        fx.publish(5).await;
        let consumer = fx.consumer(ConsumerSettings::default());

        let report = consumer
            .run_for(acknowledge_all, &fx.shutdown, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(report.received, 5);
        assert_eq!(report.acknowledged, 5);
        let stats = fx.broker.stats().unwrap();
        assert_eq!(stats.acknowledgments.len(), 5);
        assert!(stats.acknowledgments.values().all(|count| *count == 1));
        assert_eq!(fx.broker.backlog_len(&fx.subscription).unwrap(), 0);
        assert_eq!(fx.broker.outstanding_len(&fx.subscription).unwrap(), 0);

        let flow = consumer.flow().stats();
        assert_eq!(flow.admitted, 5);
        assert_eq!(flow.admitted, flow.released);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_worker_is_abandoned_and_redelivered() {
        let fx = consumer_fixture().await;
        fx.publish(1).await;
        let consumer = fx.consumer(ConsumerSettings::default());

        let report = consumer
            .run_for(
                |message: InboundMessage, _shutdown| async move {
                    if message.is_redelivery() {
                        Ok(())
                    } else {
                        Err(WorkerError::failed("first delivery rejected"))
                    }
                },
                &fx.shutdown,
                Some(Duration::from_secs(40)),
            )
            .await
            .unwrap();

        assert_eq!(report.received, 2);
        assert_eq!(report.worker_failures, 1);
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.acknowledged, 1);

        let stats = fx.broker.stats().unwrap();
        assert_eq!(stats.redeliveries, 1);
        assert_eq!(stats.ack_count(&AckHandle("ack-1".to_string())), 0);
        assert_eq!(stats.ack_count(&AckHandle("ack-2".to_string())), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outstanding_never_exceeds_budget() {
        let fx = consumer_fixture().await;
        fx.publish(6).await;
        let mut receiver = fx
            .events
            .subscribe("flow-test", EventFilter::ConsumerOnly, "test")
            .unwrap();
        let consumer = fx.consumer(consumer_settings(2, Duration::from_secs(30)));

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handler = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            move |_message: InboundMessage, _shutdown: ShutdownCoordinator| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        };

        let report = consumer
            .run_for(handler, &fx.shutdown, Some(Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(report.acknowledged, 6);
        assert_eq!(report.nacked, 0);
        let flow = consumer.flow().stats();
        assert_eq!(flow.outstanding, 0);
        assert_eq!(flow.admitted, 6);
        assert_eq!(flow.released, 6);

        let types: Vec<ConsumerEventType> = receiver
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                Event::Consumer(consumer) => Some(consumer.event_type),
                _ => None,
            })
            .collect();
        assert_eq!(types.first(), Some(&ConsumerEventType::Started));
        assert!(types.contains(&ConsumerEventType::Paused));
        assert!(types.contains(&ConsumerEventType::Resumed));
        assert_eq!(types.last(), Some(&ConsumerEventType::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_lets_workers_finish_within_grace() {
        let fx = consumer_fixture().await;
        fx.publish(3).await;
        let consumer = fx.consumer(consumer_settings(10, Duration::from_secs(30)));
        let _timer = fx.shutdown.trigger_after(Duration::from_secs(1));

        let report = consumer
            .run(
                |_message, _shutdown| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                &fx.shutdown,
            )
            .await
            .unwrap();

        assert_eq!(report.acknowledged, 3);
        assert_eq!(report.aborted_workers, 0);
        assert_eq!(fx.broker.outstanding_len(&fx.subscription).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_past_grace_are_aborted_and_abandoned() {
        let fx = consumer_fixture().await;
        fx.publish(3).await;
        let consumer = fx.consumer(consumer_settings(10, Duration::from_secs(2)));
        let _timer = fx.shutdown.trigger_after(Duration::from_secs(1));

        let report = consumer
            .run(
                |_message, _shutdown| async {
                    tokio::time::sleep(Duration::from_secs(100)).await;
                    Ok(())
                },
                &fx.shutdown,
            )
            .await
            .unwrap();

        assert_eq!(report.aborted_workers, 3);
        assert_eq!(report.abandoned, 3);
        assert_eq!(report.acknowledged, 0);
        assert!(fx.broker.stats().unwrap().acknowledgments.is_empty());
        assert_eq!(consumer.lease().outstanding().await, 0);
        assert_eq!(consumer.flow().outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_workers_stop_on_shutdown() {
        let fx = consumer_fixture().await;
        fx.publish(2).await;
        let consumer = fx.consumer(consumer_settings(10, Duration::from_secs(30)));
        let _timer = fx.shutdown.trigger_after(Duration::from_secs(1));

        let report = consumer
            .run(
                |_message, shutdown: ShutdownCoordinator| async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => Err(WorkerError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_secs(100)) => Ok(()),
                    }
                },
                &fx.shutdown,
            )
            .await
            .unwrap();

        assert_eq!(report.abandoned, 2);
        assert_eq!(report.worker_failures, 0);
        assert_eq!(report.aborted_workers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_run_when_acknowledgments_hang() {
        let fx = consumer_fixture().await;
        fx.publish(2).await;
        fx.broker.stall_acknowledge(true).unwrap();
        let consumer = fx.consumer(consumer_settings(10, Duration::from_secs(5)));

        let report = tokio::time::timeout(
            Duration::from_secs(3600),
            consumer.run_for(acknowledge_all, &fx.shutdown, Some(Duration::from_secs(10))),
        )
        .await
        .expect("consumer outlived its timeout and grace period")
        .unwrap();

        assert_eq!(report.received, 2);
        assert_eq!(report.acknowledged, 0);
        assert_eq!(report.abandoned, 2);
        assert_eq!(fx.broker.stats().unwrap().stalled_calls, 2);
        assert_eq!(consumer.lease().outstanding().await, 0);
        assert_eq!(consumer.flow().outstanding(), 0);
        assert!(!fx.shutdown.is_shutdown_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_pull_failures_are_retried() {
        let fx = consumer_fixture().await;
        fx.publish(2).await;
        fx.broker
            .inject_pull_failures(ErrorClass::ServiceUnavailable, 2)
            .unwrap();
        let consumer = fx.consumer(ConsumerSettings::default());

        let report = consumer
            .run_for(acknowledge_all, &fx.shutdown, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(report.acknowledged, 2);
        assert!(fx.broker.stats().unwrap().pull_calls > 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_pull_failure_stops_consumer() {
        let fx = consumer_fixture().await;
        fx.broker
            .inject_pull_failures(ErrorClass::PermissionDenied, 1)
            .unwrap();
        let consumer = fx.consumer(ConsumerSettings::default());

        let err = consumer.run(acknowledge_all, &fx.shutdown).await.unwrap_err();
        match err {
            SubscribeError::Pull { subscription, source } => {
                assert_eq!(subscription, "projects/test/subscriptions/events-sub");
                assert_eq!(source.class, ErrorClass::PermissionDenied);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_pull_acknowledges_batch() {
        let fx = consumer_fixture().await;
        fx.publish(3).await;
        let consumer = fx.consumer(ConsumerSettings::default());

        let messages = consumer.synchronous_pull(10, &fx.shutdown).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].payload_str(), "event-0");
        assert_eq!(messages[2].attributes.get("index").map(String::as_str), Some("2"));

        let stats = fx.broker.stats().unwrap();
        for message in &messages {
            assert_eq!(stats.ack_count(&message.ack_handle), 1);
        }
        assert_eq!(fx.broker.outstanding_len(&fx.subscription).unwrap(), 0);
        assert!(consumer
            .synchronous_pull(10, &fx.shutdown)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_pull_retries_transient_failures() {
        let fx = consumer_fixture().await;
        fx.publish(1).await;
        fx.broker
            .inject_pull_failures(ErrorClass::ServiceUnavailable, 2)
            .unwrap();
        let consumer = fx.consumer(ConsumerSettings::default());

        let messages = consumer.synchronous_pull(10, &fx.shutdown).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(fx.broker.stats().unwrap().pull_calls, 3);
    }

    #[tokio::test]
    async fn test_synchronous_pull_rejects_zero_messages() {
        let fx = consumer_fixture().await;
        let consumer = fx.consumer(ConsumerSettings::default());

        let err = consumer.synchronous_pull(0, &fx.shutdown).await.unwrap_err();
        assert!(matches!(err, SubscribeError::SyncPull { .. }));
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let fx = consumer_fixture().await;
        let invalid = [
            ConsumerSettings {
                ack_deadline_seconds: 5,
                ..ConsumerSettings::default()
            },
            ConsumerSettings {
                ack_deadline_seconds: 601,
                ..ConsumerSettings::default()
            },
            ConsumerSettings {
                lease_tick: Duration::from_secs(30),
                ..ConsumerSettings::default()
            },
            ConsumerSettings {
                max_outstanding: 0,
                ..ConsumerSettings::default()
            },
        ];
        for settings in invalid {
            assert!(Consumer::new(
                fx.broker.clone(),
                fx.subscription.clone(),
                settings,
                fx.events.clone()
            )
            .is_err());
        }
    }
}
