//! Dead-letter management.
//!
//! Messages land here once their retry budget is spent. They stay until an
//! operator replays or purges them, or the TTL sweep expires them.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::{
    error::Error,
    message::{Message, MessageStatus},
    metrics::{self, Metrics, Outcome},
    queue::{Body, Location, QueueStore},
};

#[derive(Clone)]
pub struct DeadLetters {
    queue: QueueStore,
    metrics: Arc<dyn Metrics>,
}

impl DeadLetters {
    pub fn new(queue: QueueStore, metrics: Arc<dyn Metrics>) -> Self {
        Self { queue, metrics }
    }

    /// Moves a processing message to the dead-letter list.
    pub(crate) async fn bury(
        &self,
        message: &mut Message,
        expected: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        message.status = MessageStatus::DeadLetter;
        message.dead_letter_at = Some(now);
        message.next_retry_at = None;
        message.touch(now);

        let res = self
            .queue
            .transition(
                message,
                Location::Processing,
                Some(Location::DeadLetter),
                Body::Store,
                expected,
            )
            .await;

        self.metrics
            .incr(metrics::DEAD_LETTER, &message.topic, Outcome::from(&res));

        if res.is_ok() {
            tracing::warn!(
                topic = message.topic,
                message_id = %message.id,
                retry_count = message.retry_count,
                error = message.error_message.as_deref().unwrap_or_default(),
                "Message exhausted its retries and was dead-lettered"
            );
            metrics::report_depth(self.metrics.as_ref(), &self.queue, &message.topic).await;
        }

        res
    }

    /// Reads a page of dead-lettered messages, oldest dead-lettered first.
    pub async fn list(
        &self,
        topic: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, Error> {
        let ids = self
            .queue
            .ids(topic, Location::DeadLetter, offset, limit)
            .await?;

        let mut messages = Vec::with_capacity(ids.len());

        for id in ids {
            let Ok(id) = id.parse::<Uuid>() else {
                tracing::warn!(topic, id, "Skipping malformed dead-letter id");
                continue;
            };

            match self.queue.load(id).await? {
                Some(loaded) => messages.push(loaded.message),
                None => tracing::debug!(topic, message_id = %id, "Dead-letter entry has no body"),
            }
        }

        Ok(messages)
    }

    /// Returns a dead-lettered message to the pending list with a fresh
    /// retry budget.
    pub async fn replay(&self, id: Uuid) -> Result<Message, Error> {
        let mut message = self.queue.get_message(id).await?;

        message.status = MessageStatus::Pending;
        message.retry_count = 0;
        message.next_retry_at = None;
        message.processed_at = None;
        message.dead_letter_at = None;
        message.error_message = None;
        message.touch(Utc::now());

        self.queue
            .transition(
                &message,
                Location::DeadLetter,
                Some(Location::Pending),
                Body::Store,
                None,
            )
            .await?;

        tracing::info!(topic = message.topic, message_id = %id, "Replayed dead-lettered message");

        metrics::report_depth(self.metrics.as_ref(), &self.queue, &message.topic).await;

        Ok(message)
    }

    /// Irreversibly deletes every dead-lettered message of a topic.
    pub async fn purge(&self, topic: &str) -> Result<u64, Error> {
        let purged = self.queue.purge_dead_letters(topic).await?;

        tracing::warn!(topic, purged, "Purged dead-letter queue");

        metrics::report_depth(self.metrics.as_ref(), &self.queue, topic).await;

        Ok(purged)
    }

    /// Deletes dead-lettered messages of a topic older than `ttl`.
    pub async fn expire(
        &self,
        topic: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        let ids = self
            .queue
            .ids(topic, Location::DeadLetter, 0, usize::MAX)
            .await?;

        let mut expired = 0;

        for raw_id in ids {
            let loaded = match raw_id.parse::<Uuid>() {
                Ok(id) => match self.queue.load(id).await {
                    Ok(loaded) => loaded,
                    Err(e @ Error::Serialization { .. }) => {
                        if self
                            .queue
                            .drop_undecodable(topic, &raw_id, Location::DeadLetter)
                            .await?
                        {
                            self.metrics
                                .incr(metrics::UNDECODABLE, topic, Outcome::Failure);
                            tracing::error!(topic, message_id = %id, "Dropped undecodable dead-letter message: {e}");
                            expired += 1;
                        }
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                Err(_) => None,
            };

            let Some(loaded) = loaded else {
                if self
                    .queue
                    .drop_orphan(topic, &raw_id, Location::DeadLetter)
                    .await?
                {
                    expired += 1;
                }
                continue;
            };

            let since = loaded
                .message
                .dead_letter_at
                .unwrap_or(loaded.message.updated_at);

            if now.signed_duration_since(since) <= ttl {
                continue;
            }

            match self
                .queue
                .transition(
                    &loaded.message,
                    Location::DeadLetter,
                    None,
                    Body::Delete,
                    Some(&loaded.raw),
                )
                .await
            {
                Ok(()) => expired += 1,
                Err(e) if e.is_conflict() => {
                    tracing::debug!(topic, message_id = %loaded.message.id, "Dead letter changed during expiry: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        if expired > 0 {
            tracing::info!(topic, expired, "Expired dead-lettered messages");
            metrics::report_depth(self.metrics.as_ref(), &self.queue, topic).await;
        }

        Ok(expired)
    }
}
