//! Topic-scoped queue state on top of a [`BackingStore`].
//!
//! A message id lives in exactly one of three per-topic lists while it is
//! not completed: pending, processing or dead-letter. Each transition between
//! them is a single guarded [`Batch`] that moves the id, rewrites the message
//! body and adjusts the two size counters together.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::Error,
    message::{Message, MessageStatus},
    store::{keys, BackingStore, Batch},
};

/// The list a message id currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Location {
    Pending,
    Processing,
    DeadLetter,
}

impl Location {
    pub fn key(self, topic: &str) -> String {
        match self {
            Self::Pending => keys::pending(topic),
            Self::Processing => keys::processing(topic),
            Self::DeadLetter => keys::dead_letter(topic),
        }
    }

    fn counter(self, topic: &str) -> String {
        match self {
            Self::Pending | Self::Processing => keys::size(topic),
            Self::DeadLetter => keys::dead_letter_size(topic),
        }
    }
}

/// What happens to the stored body in a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    /// Write the caller's updated copy.
    Store,
    /// Remove it; the message is gone for good.
    Delete,
}

/// A message as read from the store, with the exact bytes it was decoded
/// from so a later write can be made conditional on nothing having changed.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub message: Message,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    /// Counter of pending plus processing messages.
    pub size: i64,
    pub dead_letter_size: i64,
    pub pending: u64,
    pub processing: u64,
    pub dead_letter: u64,
}

impl TopicStats {
    /// Whether the counters agree with the list lengths.
    pub fn consistent(&self) -> bool {
        self.size == (self.pending + self.processing) as i64
            && self.dead_letter_size == self.dead_letter as i64
    }
}

#[derive(Clone)]
pub struct QueueStore {
    store: Arc<dyn BackingStore>,
    message_ttl: Duration,
}

impl QueueStore {
    pub fn new(store: Arc<dyn BackingStore>, message_ttl: Duration) -> Self {
        Self { store, message_ttl }
    }

    pub fn backing_store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Stores a new message and appends it to its topic's pending list.
    ///
    /// Returns `false` if a message with the same id already exists, in which
    /// case nothing is written.
    pub async fn publish(&self, message: &Message) -> Result<bool, Error> {
        let id = message.id.to_string();
        let topic = message.topic.as_str();

        let batch = Batch::new()
            .guard_absent(keys::message(&id))
            .set(keys::message(&id), message.encode()?, Some(self.message_ttl))
            .push(keys::pending(topic), id)
            .incr(keys::size(topic), 1)
            .push_unique(keys::TOPICS, topic);

        self.store.commit(batch).await
    }

    pub async fn load(&self, id: Uuid) -> Result<Option<Loaded>, Error> {
        let Some(raw) = self.store.get(&keys::message(id)).await? else {
            return Ok(None);
        };

        let message = Message::decode(&raw)?;

        Ok(Some(Loaded { message, raw }))
    }

    pub async fn get_message(&self, id: Uuid) -> Result<Message, Error> {
        self.load(id)
            .await?
            .map(|loaded| loaded.message)
            .ok_or_else(|| Error::message_not_found(id))
    }

    /// Atomically moves the oldest pending id of a topic into processing.
    ///
    /// Ids that do not parse are left in processing for the reclaimer to drop.
    pub async fn claim(&self, topic: &str) -> Result<Option<Uuid>, Error> {
        let Some(raw) = self
            .store
            .transfer(&keys::pending(topic), &keys::processing(topic))
            .await?
        else {
            return Ok(None);
        };

        raw.parse::<Uuid>()
            .map(Some)
            .map_err(|e| Error::internal(eyre::eyre!("malformed id {raw:?} in {topic}: {e}")))
    }

    /// Persists `message` and moves its id from `from` to `to` (or out of every
    /// list when `to` is `None`), adjusting counters in the same batch.
    ///
    /// The batch is guarded on the id being in `from`, and on the stored body
    /// still matching `expected` when given. A failed guard is a conflict.
    pub async fn transition(
        &self,
        message: &Message,
        from: Location,
        to: Option<Location>,
        body: Body,
        expected: Option<&[u8]>,
    ) -> Result<(), Error> {
        let id = message.id.to_string();
        let topic = message.topic.as_str();
        let body_key = keys::message(&id);

        let mut batch = Batch::new().guard_member(from.key(topic), id.as_str());

        if let Some(expected) = expected {
            batch = batch.guard_unchanged(body_key.as_str(), expected.to_vec());
        }

        batch = batch
            .remove(from.key(topic), id.as_str())
            .incr(from.counter(topic), -1);

        if let Some(to) = to {
            batch = batch
                .push(to.key(topic), id.as_str())
                .incr(to.counter(topic), 1);
        }

        batch = match body {
            Body::Store => batch.set(body_key, message.encode()?, Some(self.message_ttl)),
            Body::Delete => batch.delete(body_key),
        };

        if self.store.commit(batch).await? {
            Ok(())
        } else {
            Err(Error::conflict(format!(
                "message {id} is no longer in {from} of {topic}"
            )))
        }
    }

    /// Rewrites the body of a message that stays where it is.
    pub async fn save_in_place(&self, message: &Message, at: Location) -> Result<(), Error> {
        let id = message.id.to_string();
        let batch = Batch::new()
            .guard_member(at.key(&message.topic), id.as_str())
            .set(keys::message(&id), message.encode()?, Some(self.message_ttl));

        if self.store.commit(batch).await? {
            Ok(())
        } else {
            Err(Error::conflict(format!(
                "message {id} is no longer in {at} of {}",
                message.topic
            )))
        }
    }

    /// Marks a freshly claimed message as processing.
    pub async fn mark_processing(
        &self,
        message: &mut Message,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        message.status = MessageStatus::Processing;
        message.attempts += 1;
        message.touch(now);

        self.save_in_place(message, Location::Processing).await
    }

    /// Removes an id whose body is gone from a list, fixing the counter.
    pub async fn drop_orphan(&self, topic: &str, id: &str, from: Location) -> Result<bool, Error> {
        let batch = Batch::new()
            .guard_member(from.key(topic), id)
            .guard_absent(keys::message(id))
            .remove(from.key(topic), id)
            .incr(from.counter(topic), -1);

        self.store.commit(batch).await
    }

    /// Removes an id whose stored body no longer decodes, deleting the body.
    ///
    /// Guarded on the bytes just read, so a body rewritten in between is
    /// left alone. Returns whether anything was removed.
    pub async fn drop_undecodable(
        &self,
        topic: &str,
        id: &str,
        from: Location,
    ) -> Result<bool, Error> {
        let key = keys::message(id);
        let Some(raw) = self.store.get(&key).await? else {
            return self.drop_orphan(topic, id, from).await;
        };

        if Message::decode(&raw).is_ok() {
            return Ok(false);
        }

        let batch = Batch::new()
            .guard_member(from.key(topic), id)
            .guard_unchanged(key.as_str(), raw)
            .remove(from.key(topic), id)
            .incr(from.counter(topic), -1)
            .delete(key);

        self.store.commit(batch).await
    }

    /// Finds which list holds the message, if any.
    pub async fn locate(&self, message: &Message) -> Result<Option<Location>, Error> {
        let id = message.id.to_string();

        for location in [
            Location::Processing,
            Location::Pending,
            Location::DeadLetter,
        ] {
            if self
                .store
                .contains(&location.key(&message.topic), &id)
                .await?
            {
                return Ok(Some(location));
            }
        }

        Ok(None)
    }

    pub async fn ids(
        &self,
        topic: &str,
        location: Location,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, Error> {
        self.store.range(&location.key(topic), offset, limit).await
    }

    /// Deletes every dead-lettered message of a topic.
    ///
    /// Each id is removed in its own batch guarded on it still being
    /// dead-lettered, so a message replayed or buried concurrently keeps its
    /// body and list entry. Returns how many were deleted.
    pub async fn purge_dead_letters(&self, topic: &str) -> Result<u64, Error> {
        let ids = self.ids(topic, Location::DeadLetter, 0, usize::MAX).await?;

        let mut purged = 0;
        for id in &ids {
            let batch = Batch::new()
                .guard_member(keys::dead_letter(topic), id.as_str())
                .remove(keys::dead_letter(topic), id.as_str())
                .incr(keys::dead_letter_size(topic), -1)
                .delete(keys::message(id));

            if self.store.commit(batch).await? {
                purged += 1;
            }
        }

        Ok(purged)
    }

    /// Every topic that has been published to.
    pub async fn topics(&self) -> Result<Vec<String>, Error> {
        self.store.range(keys::TOPICS, 0, usize::MAX).await
    }

    pub async fn stats(&self, topic: &str) -> Result<TopicStats, Error> {
        Ok(TopicStats {
            size: self.store.counter(&keys::size(topic)).await?,
            dead_letter_size: self.store.counter(&keys::dead_letter_size(topic)).await?,
            pending: self.store.len(&keys::pending(topic)).await?,
            processing: self.store.len(&keys::processing(topic)).await?,
            dead_letter: self.store.len(&keys::dead_letter(topic)).await?,
        })
    }

    /// Recomputes both counters from list lengths.
    ///
    /// Counters are adjusted in the same batch as list mutations, but a
    /// crash between a read and a retried write can still leave them off.
    /// The recount runs inside the store's atomic step, so transitions
    /// committed around it are never erased.
    pub async fn reconcile(&self, topic: &str) -> Result<TopicStats, Error> {
        let before = self.stats(topic).await?;

        let batch = Batch::new()
            .recount(
                keys::size(topic),
                [keys::pending(topic), keys::processing(topic)],
            )
            .recount(keys::dead_letter_size(topic), [keys::dead_letter(topic)]);

        self.store.commit(batch).await?;

        let after = self.stats(topic).await?;

        if before.size != after.size || before.dead_letter_size != after.dead_letter_size {
            tracing::info!(
                topic,
                size = after.size,
                dead_letter_size = after.dead_letter_size,
                was_size = before.size,
                was_dead_letter_size = before.dead_letter_size,
                "Reconciled drifted queue counters"
            );
        }

        Ok(after)
    }
}
