//! Crash recovery.
//!
//! A worker that dies mid-execution leaves its message in the processing
//! list. The reclaimer finds messages whose processing lock has expired and
//! fails them through the normal retry path. Ids that were claimed but never
//! marked processing go back to pending without using a retry. A second, slower sweep expires
//! old dead letters and evicts expired values from the store.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    dead_letter::DeadLetters,
    delivery::Delivery,
    error::Error,
    message::MessageStatus,
    metrics::{self, Metrics, Outcome},
    queue::{Location, QueueStore},
};

#[derive(Clone)]
pub struct Reclaimer {
    queue: QueueStore,
    delivery: Delivery,
    dead_letters: DeadLetters,
    metrics: std::sync::Arc<dyn Metrics>,
    lock_duration: Duration,
    dead_letter_ttl: Duration,
}

#[bon::bon]
impl Reclaimer {
    #[builder]
    pub fn new(
        queue: QueueStore,
        delivery: Delivery,
        dead_letters: DeadLetters,
        metrics: std::sync::Arc<dyn Metrics>,
        lock_duration: Duration,
        dead_letter_ttl: Duration,
    ) -> Self {
        Self {
            queue,
            delivery,
            dead_letters,
            metrics,
            lock_duration,
            dead_letter_ttl,
        }
    }
}

impl Reclaimer {
    /// Reclaims every message of every topic whose lock expired before
    /// `now`. Returns how many were moved out of processing.
    pub async fn sweep_processing(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let mut reclaimed = 0;

        for topic in self.queue.topics().await? {
            match self.sweep_topic(&topic, now).await {
                Ok(n) => reclaimed += n,
                Err(e) => {
                    self.metrics
                        .incr(metrics::STORE_ERROR, &topic, Outcome::Failure);
                    tracing::error!(topic, "Reclaim sweep failed: {e}");
                }
            }
        }

        Ok(reclaimed)
    }

    async fn sweep_topic(&self, topic: &str, now: DateTime<Utc>) -> Result<usize, Error> {
        let lock = TimeDelta::from_std(self.lock_duration).unwrap_or(TimeDelta::MAX);
        let ids = self
            .queue
            .ids(topic, Location::Processing, 0, usize::MAX)
            .await?;

        let mut reclaimed = 0;

        for raw_id in ids {
            let loaded = match raw_id.parse::<Uuid>() {
                Ok(id) => match self.queue.load(id).await {
                    Ok(loaded) => loaded,
                    Err(e @ Error::Serialization { .. }) => {
                        if self
                            .queue
                            .drop_undecodable(topic, &raw_id, Location::Processing)
                            .await?
                        {
                            self.metrics
                                .incr(metrics::UNDECODABLE, topic, Outcome::Failure);
                            tracing::error!(topic, message_id = %id, "Dropped undecodable processing message: {e}");
                            reclaimed += 1;
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
                    .drop_orphan(topic, &raw_id, Location::Processing)
                    .await?
                {
                    tracing::warn!(topic, id = raw_id, "Dropped processing id without a body");
                    reclaimed += 1;
                }
                continue;
            };

            if now.signed_duration_since(loaded.message.updated_at) <= lock {
                continue;
            }

            let id = loaded.message.id;
            let res = if loaded.message.status == MessageStatus::Processing {
                self.delivery.reclaim(loaded, now).await
            } else {
                // Claimed but never marked: the worker died before starting it.
                self.delivery.release(loaded).await
            };

            match res {
                Ok(_) => reclaimed += 1,
                Err(e) if e.is_conflict() => {
                    tracing::debug!(topic, message_id = %id, "Skipped reclaim: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(reclaimed)
    }

    /// Expires dead letters older than the configured TTL on every topic,
    /// then evicts expired values from the store.
    pub async fn sweep_dead_letters(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let mut expired = 0;

        for topic in self.queue.topics().await? {
            match self
                .dead_letters
                .expire(&topic, self.dead_letter_ttl, now)
                .await
            {
                Ok(n) => expired += n,
                Err(e) => {
                    self.metrics
                        .incr(metrics::STORE_ERROR, &topic, Outcome::Failure);
                    tracing::error!(topic, "Dead-letter expiry failed: {e}");
                }
            }
        }

        let evicted = self.queue.backing_store().evict_expired().await?;
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired store values");
        }

        Ok(expired)
    }

    /// Sweeps processing lists every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep_processing(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(reclaimed = n, "Reclaim sweep finished"),
                Err(e) => tracing::error!("Reclaim sweep failed: {e}"),
            }
        }

        tracing::debug!("Reclaimer stopped");
    }

    /// Expires dead letters every `interval` until `shutdown` fires.
    pub async fn run_cleanup(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sweep_dead_letters(Utc::now()).await {
                tracing::error!("Dead-letter cleanup failed: {e}");
            }
        }

        tracing::debug!("Dead-letter cleanup stopped");
    }
}
