//! Tests for replicated publishing

#[cfg(test)]
mod tests {
    use crate::broker::api::ErrorClass;
    use crate::publisher::tests::helpers::{batch_settings, messages, publisher_fixture};

    #[tokio::test(start_paused = true)]
    async fn test_each_replication_publishes_full_list() {
        let fx = publisher_fixture(batch_settings(10_000, 2, 60_000)).await;
        let outbound = messages(3);

        let summaries = fx.publisher.publish_all(&outbound, 5).await.unwrap();

        assert_eq!(summaries.len(), 5);
        for summary in &summaries {
            assert_eq!(summary.published(), 3);
            assert_eq!(summary.reports.len(), 2);
        }
        assert_eq!(fx.broker.backlog_len(&fx.subscription).unwrap(), 15);
        // Every copy gets its own id
        let mut ids: Vec<String> = summaries
            .iter()
            .flat_map(|s| s.message_ids())
            .map(|id| id.to_string())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_replication_matches_publish_messages() {
        let fx = publisher_fixture(batch_settings(10_000, 10, 60_000)).await;
        let summaries = fx.publisher.publish_all(&messages(4), 1).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].published(), 4);
        assert_eq!(fx.broker.stats().unwrap().publish_calls, 1);
    }

    #[tokio::test]
    async fn test_zero_replications_publish_nothing() {
        let fx = publisher_fixture(batch_settings(10_000, 10, 60_000)).await;
        let summaries = fx.publisher.publish_all(&messages(4), 0).await.unwrap();
        assert!(summaries.is_empty());
        assert_eq!(fx.broker.stats().unwrap().publish_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_replication_does_not_stop_the_next() {
        let fx = publisher_fixture(batch_settings(10_000, 10, 60_000)).await;
        fx.broker
            .inject_publish_failures(ErrorClass::InvalidArgument, 1)
            .unwrap();

        let summaries = fx.publisher.publish_all(&messages(2), 2).await.unwrap();
        assert_eq!(summaries[0].failed(), 2);
        assert_eq!(summaries[1].published(), 2);
    }

    #[tokio::test]
    async fn test_no_replication_starts_after_shutdown() {
        let fx = publisher_fixture(batch_settings(10_000, 10, 60_000)).await;
        fx.shutdown.trigger_shutdown();
        let summaries = fx.publisher.publish_all(&messages(2), 3).await.unwrap();
        assert!(summaries.is_empty());
    }
}
