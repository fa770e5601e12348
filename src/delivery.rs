//! Ack/Nack resolution and the retry controller.
//!
//! Every execution ends in exactly one call to [`Delivery::ack`] or
//! [`Delivery::nack`]; the reclaimer uses [`Delivery::reclaim`] for messages
//! whose worker never got that far.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    dead_letter::DeadLetters,
    error::Error,
    message::{Message, MessageStatus},
    metrics::{self, Metrics, Outcome},
    queue::{Body, Loaded, Location, QueueStore},
    retry::Backoff,
};

/// Error recorded on messages recovered from a dead worker.
pub const LOCK_EXPIRED: &str = "processing lock expired";

#[derive(Clone)]
pub struct Delivery {
    queue: QueueStore,
    backoff: Backoff,
    dead_letters: DeadLetters,
    metrics: Arc<dyn Metrics>,
}

impl Delivery {
    pub fn new(
        queue: QueueStore,
        backoff: Backoff,
        dead_letters: DeadLetters,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            queue,
            backoff,
            dead_letters,
            metrics,
        }
    }

    /// Completes a message. Terminal: the id leaves every list.
    pub async fn ack(&self, mut message: Message, from: Location) -> Result<Message, Error> {
        let now = Utc::now();

        message.status = MessageStatus::Completed;
        message.processed_at = Some(now);
        message.next_retry_at = None;
        message.error_message = None;
        message.touch(now);

        let res = self
            .queue
            .transition(&message, from, None, Body::Store, None)
            .await;

        self.metrics
            .incr(metrics::ACK, &message.topic, Outcome::from(&res));
        res?;

        tracing::debug!(topic = message.topic, message_id = %message.id, "Message completed");

        Ok(message)
    }

    /// Fails a processing message: schedules a retry, or dead-letters it once
    /// `max_retries` retries have been used.
    pub async fn nack(&self, message: Message, reason: impl Into<String>) -> Result<Message, Error> {
        self.fail(message, reason.into(), None, Utc::now()).await
    }

    /// Fails a message whose processing lock expired.
    ///
    /// Only applies if the stored body is still exactly what the reclaimer
    /// read, so a message picked up concurrently is never reclaimed twice.
    pub async fn reclaim(&self, loaded: Loaded, now: DateTime<Utc>) -> Result<Message, Error> {
        let res = self
            .fail(loaded.message, LOCK_EXPIRED.to_owned(), Some(&loaded.raw), now)
            .await;

        if let Ok(message) = &res {
            self.metrics.incr(metrics::RECLAIM, &message.topic, Outcome::Success);
            tracing::info!(
                topic = message.topic,
                message_id = %message.id,
                retry_count = message.retry_count,
                status = %message.status,
                "Reclaimed message with expired processing lock"
            );
        }

        res
    }

    /// Returns a claimed message that never started back to pending.
    ///
    /// No attempt was made, so the retry budget is untouched. Guarded like
    /// [`Delivery::reclaim`]: a worker that marks the message first wins.
    pub async fn release(&self, loaded: Loaded) -> Result<Message, Error> {
        let message = loaded.message;

        self.queue
            .transition(
                &message,
                Location::Processing,
                Some(Location::Pending),
                Body::Store,
                Some(&loaded.raw),
            )
            .await?;

        self.metrics
            .incr(metrics::RECLAIM, &message.topic, Outcome::Success);
        tracing::info!(
            topic = message.topic,
            message_id = %message.id,
            status = %message.status,
            "Released claimed message that never started"
        );

        Ok(message)
    }

    async fn fail(
        &self,
        mut message: Message,
        reason: String,
        expected: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> Result<Message, Error> {
        message.status = MessageStatus::Failed;
        message.error_message = Some(reason);
        message.touch(now);

        let res = if message.retries_exhausted() {
            self.dead_letters.bury(&mut message, expected, now).await
        } else {
            self.schedule_retry(&mut message, expected, now).await
        };

        self.metrics
            .incr(metrics::NACK, &message.topic, Outcome::from(&res));

        res.map(|_| message)
    }

    async fn schedule_retry(
        &self,
        message: &mut Message,
        expected: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        message.retry_count += 1;
        message.status = MessageStatus::Retrying;
        message.next_retry_at = Some(self.backoff.next_retry_at(message.retry_count, now));

        let res = self
            .queue
            .transition(
                message,
                Location::Processing,
                Some(Location::Pending),
                Body::Store,
                expected,
            )
            .await;

        self.metrics
            .incr(metrics::RETRY, &message.topic, Outcome::from(&res));

        if res.is_ok() {
            tracing::info!(
                topic = message.topic,
                message_id = %message.id,
                retry_count = message.retry_count,
                max_retries = message.max_retries,
                error = message.error_message.as_deref().unwrap_or_default(),
                "Message failed, scheduled retry"
            );
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{message::NewMessage, metrics::RecordingMetrics, store::MemoryStore};

    struct Fixture {
        queue: QueueStore,
        delivery: Delivery,
        dead_letters: DeadLetters,
        metrics: RecordingMetrics,
    }

    fn fixture() -> Fixture {
        let queue = QueueStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(600));
        let metrics = RecordingMetrics::new();
        let dead_letters = DeadLetters::new(queue.clone(), Arc::new(metrics.clone()));
        let backoff = Backoff::new(vec![Duration::from_secs(1), Duration::from_secs(10)]).unwrap();
        let delivery = Delivery::new(
            queue.clone(),
            backoff,
            dead_letters.clone(),
            Arc::new(metrics.clone()),
        );

        Fixture {
            queue,
            delivery,
            dead_letters,
            metrics,
        }
    }

    async fn publish_and_claim(queue: &QueueStore, max_retries: u32) -> Message {
        let message = Message::new(
            NewMessage::builder()
                .topic("ai_process")
                .payload(json!({ "track": 1 }))
                .max_retries(max_retries)
                .build(),
            3,
            Utc::now(),
        );
        queue.publish(&message).await.unwrap();
        claim(queue).await
    }

    async fn claim(queue: &QueueStore) -> Message {
        let id = queue.claim("ai_process").await.unwrap().unwrap();
        let mut message = queue.get_message(id).await.unwrap();
        queue.mark_processing(&mut message, Utc::now()).await.unwrap();
        message
    }

    #[tokio::test]
    async fn ack_completes_message() {
        let f = fixture();
        let message = publish_and_claim(&f.queue, 2).await;

        let done = f.delivery.ack(message, Location::Processing).await.unwrap();

        assert_eq!(done.status, MessageStatus::Completed);
        assert!(done.processed_at.is_some());
        assert_eq!(f.queue.locate(&done).await.unwrap(), None);
        assert_eq!(f.queue.get_message(done.id).await.unwrap(), done);

        let stats = f.queue.stats("ai_process").await.unwrap();
        assert_eq!(stats.size, 0);
        assert!(stats.consistent());
        assert_eq!(
            f.metrics.counter(metrics::ACK, "ai_process", Outcome::Success),
            1
        );
    }

    #[tokio::test]
    async fn double_ack_conflicts() {
        let f = fixture();
        let message = publish_and_claim(&f.queue, 2).await;

        f.delivery
            .ack(message.clone(), Location::Processing)
            .await
            .unwrap();
        let err = f
            .delivery
            .ack(message, Location::Processing)
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(
            f.metrics.counter(metrics::ACK, "ai_process", Outcome::Failure),
            1
        );
    }

    #[tokio::test]
    async fn nack_schedules_retry_with_backoff() {
        let f = fixture();
        let message = publish_and_claim(&f.queue, 2).await;
        let before = Utc::now();

        let retried = f.delivery.nack(message, "upstream timeout").await.unwrap();

        assert_eq!(retried.status, MessageStatus::Retrying);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.error_message.as_deref(), Some("upstream timeout"));
        let next = retried.next_retry_at.unwrap();
        assert!(next >= before + chrono::TimeDelta::seconds(1));
        assert_eq!(
            f.queue.locate(&retried).await.unwrap(),
            Some(Location::Pending)
        );
        assert_eq!(
            f.metrics.counter(metrics::RETRY, "ai_process", Outcome::Success),
            1
        );
    }

    #[tokio::test]
    async fn retry_cap_dead_letters() {
        let f = fixture();
        let mut message = publish_and_claim(&f.queue, 2).await;

        for expected in 1..=2 {
            let retried = f.delivery.nack(message, "boom").await.unwrap();
            assert_eq!(retried.retry_count, expected);
            message = claim(&f.queue).await;
        }

        let dead = f.delivery.nack(message, "boom").await.unwrap();

        assert_eq!(dead.status, MessageStatus::DeadLetter);
        assert_eq!(dead.retry_count, 2);
        assert!(dead.dead_letter_at.is_some());
        assert_eq!(
            f.queue.locate(&dead).await.unwrap(),
            Some(Location::DeadLetter)
        );
        assert_eq!(f.queue.claim("ai_process").await.unwrap(), None);

        let listed = f.dead_letters.list("ai_process", 0, 10).await.unwrap();
        assert_eq!(listed, vec![dead]);
        assert_eq!(
            f.metrics
                .gauge_value(metrics::DEAD_LETTER_DEPTH, "ai_process"),
            Some(1)
        );
    }

    #[tokio::test]
    async fn reclaim_requires_unchanged_body() {
        let f = fixture();
        let message = publish_and_claim(&f.queue, 3).await;
        let loaded = f.queue.load(message.id).await.unwrap().unwrap();

        let reclaimed = f
            .delivery
            .reclaim(loaded.clone(), Utc::now())
            .await
            .unwrap();
        assert_eq!(reclaimed.retry_count, 1);
        assert_eq!(reclaimed.error_message.as_deref(), Some(LOCK_EXPIRED));

        let again = f.delivery.reclaim(loaded, Utc::now()).await.unwrap_err();
        assert!(again.is_conflict());
        assert_eq!(
            f.queue.get_message(message.id).await.unwrap().retry_count,
            1
        );
    }
}
