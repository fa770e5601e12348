//! Message types and status management for the queue engine.
//!
//! A [`Message`] is the unit of work handed to topic handlers. It is stored as
//! JSON in the backing store, keyed by its id, while the id itself moves
//! between the per-topic pending, processing and dead-letter lists.
//!
//! # Message Lifecycle
//!
//! 1. Messages are published in `Pending` status
//! 2. The dispatcher claims them and marks them `Processing`
//! 3. A successful handler run moves them to `Completed` (terminal)
//! 4. A failed run moves them to `Retrying` and back onto the pending list,
//!    or to `DeadLetter` once the retry budget is spent
//! 5. Dead-lettered messages stay put until replayed, purged or expired

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

const MAX_TOPIC_LEN: usize = 128;

/// Current status of a message.
///
/// `Failed` is recorded on the in-flight copy of a message when its handler
/// reports an error; the retry controller immediately settles it into
/// `Retrying` or `DeadLetter` before anything is persisted.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    DeadLetter,
}

/// Advisory priority. Delivery order within a topic is FIFO regardless.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub status: MessageStatus,
    #[serde(default)]
    pub priority: Priority,

    pub retry_count: u32,
    pub max_retries: u32,
    /// Number of times the message has been handed to a handler.
    #[serde(default)]
    pub attempts: u32,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub dead_letter_at: Option<DateTime<Utc>>,
}

/// Parameters for publishing a message.
///
/// ```
/// use tempoq::message::{NewMessage, Priority};
///
/// let new = NewMessage::builder()
///     .topic("ai_process")
///     .payload(serde_json::json!({ "track": 42 }))
///     .max_retries(5)
///     .priority(Priority::High)
///     .build();
/// assert_eq!(new.max_retries, Some(5));
/// ```
#[derive(Builder, Debug, Clone)]
pub struct NewMessage {
    #[builder(into)]
    pub topic: String,
    pub payload: serde_json::Value,
    /// Caller-chosen id. Publishing the same id twice is a no-op.
    pub id: Option<Uuid>,
    /// Overrides the configured default retry cap.
    pub max_retries: Option<u32>,
    #[builder(default)]
    pub priority: Priority,
}

impl Message {
    pub fn new(new: NewMessage, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id.unwrap_or_else(Uuid::new_v4),
            topic: new.topic,
            payload: new.payload,
            status: MessageStatus::Pending,
            priority: new.priority,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            attempts: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            processed_at: None,
            dead_letter_at: None,
        }
    }

    /// Derives a stable id from a topic and a caller key, so that retried
    /// publishes of the same logical job land on the same message.
    pub fn deterministic_id(topic: &str, key: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{topic}:{key}").as_bytes())
    }

    /// Records a transition. `updated_at` never moves backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Topics are embedded in store keys, so they are kept short and free of
/// separators.
pub fn validate_topic(topic: &str) -> Result<(), Error> {
    if topic.is_empty() {
        return Err(Error::invalid_topic("topic must not be empty"));
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::invalid_topic(format!(
            "topic must be at most {MAX_TOPIC_LEN} bytes"
        )));
    }

    if topic.chars().any(|c| c == ':' || c.is_whitespace()) {
        return Err(Error::invalid_topic(format!(
            "topic {topic:?} contains ':' or whitespace"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::TimeDelta;

    use super::*;

    fn sample() -> Message {
        Message::new(
            NewMessage::builder()
                .topic("ai_process")
                .payload(serde_json::json!({ "track": 1 }))
                .build(),
            3,
            Utc::now(),
        )
    }

    #[test]
    fn new_messages_start_pending() {
        let msg = sample();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.max_retries, 3);
        assert_eq!(msg.priority, Priority::Medium);
        assert_eq!(msg.created_at, msg.updated_at);
    }

    #[test]
    fn status_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&MessageStatus::DeadLetter).unwrap(),
            "\"dead_letter\""
        );
        assert_eq!(MessageStatus::DeadLetter.to_string(), "dead_letter");
        assert_eq!(
            MessageStatus::from_str("retrying").unwrap(),
            MessageStatus::Retrying
        );
    }

    #[test]
    fn touch_is_monotonic() {
        let mut msg = sample();
        let later = msg.updated_at + TimeDelta::seconds(5);

        msg.touch(later);
        assert_eq!(msg.updated_at, later);

        msg.touch(later - TimeDelta::seconds(60));
        assert_eq!(msg.updated_at, later);
    }

    #[test]
    fn deterministic_ids_are_stable_per_topic() {
        let a = Message::deterministic_id("ai_process", "track-7");
        let b = Message::deterministic_id("ai_process", "track-7");
        let c = Message::deterministic_id("ddex_export", "track-7");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn encodes_and_decodes() {
        let msg = sample();
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn topic_validation() {
        assert!(validate_topic("ai_process").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("a:b").is_err());
        assert!(validate_topic("has space").is_err());
        assert!(validate_topic(&"x".repeat(MAX_TOPIC_LEN + 1)).is_err());
    }
}
