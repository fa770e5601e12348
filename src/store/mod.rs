//! Backing store abstraction for the queue engine.
//!
//! The engine keeps all cross-worker state in a shared key-value store that
//! offers plain values with an optional TTL, ordered lists of strings, and
//! integer counters. Every mutation that touches more than one key is
//! expressed as a [`Batch`] and applied atomically by [`BackingStore::commit`].
//!
//! Two implementations ship with the crate:
//! - [`memory::MemoryStore`]: process-local, for tests and single-process use
//! - [`sqlite::SqliteStore`]: durable, one SQLite transaction per batch

use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::error::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T, Error>>;

/// A single mutation inside a [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Writes a value, replacing any previous one and its TTL.
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    /// Appends to the tail of a list.
    Push {
        list: String,
        value: String,
    },
    /// Appends to the tail of a list unless the value is already present.
    PushUnique {
        list: String,
        value: String,
    },
    /// Removes every occurrence of a value from a list.
    Remove {
        list: String,
        value: String,
    },
    Incr {
        counter: String,
        delta: i64,
    },
    /// Sets a counter to the combined length of `lists`, as of this batch.
    Recount {
        counter: String,
        lists: Vec<String>,
    },
}

/// A precondition checked inside the same atomic step that applies a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// The list contains the value.
    Member { list: String, value: String },
    /// The key holds no live value.
    Absent { key: String },
    /// The key holds exactly these bytes.
    Unchanged { key: String, value: Vec<u8> },
}

/// An ordered group of mutations applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub guards: Vec<Guard>,
    pub ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard_member(mut self, list: impl Into<String>, value: impl Into<String>) -> Self {
        self.guards.push(Guard::Member {
            list: list.into(),
            value: value.into(),
        });
        self
    }

    pub fn guard_absent(mut self, key: impl Into<String>) -> Self {
        self.guards.push(Guard::Absent { key: key.into() });
        self
    }

    pub fn guard_unchanged(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.guards.push(Guard::Unchanged {
            key: key.into(),
            value,
        });
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> Self {
        self.ops.push(Op::Set {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(Op::Delete { key: key.into() });
        self
    }

    pub fn push(mut self, list: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(Op::Push {
            list: list.into(),
            value: value.into(),
        });
        self
    }

    pub fn push_unique(mut self, list: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(Op::PushUnique {
            list: list.into(),
            value: value.into(),
        });
        self
    }

    pub fn remove(mut self, list: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(Op::Remove {
            list: list.into(),
            value: value.into(),
        });
        self
    }

    pub fn incr(mut self, counter: impl Into<String>, delta: i64) -> Self {
        if delta != 0 {
            self.ops.push(Op::Incr {
                counter: counter.into(),
                delta,
            });
        }
        self
    }

    pub fn recount<I, S>(mut self, counter: impl Into<String>, lists: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ops.push(Op::Recount {
            counter: counter.into(),
            lists: lists.into_iter().map(Into::into).collect(),
        });
        self
    }
}

/// Core trait for the shared store the queue engine runs on.
///
/// Implementations must apply each [`Batch`] atomically with respect to every
/// other call on the same store, including [`BackingStore::transfer`], and
/// must be safe to share between tasks.
pub trait BackingStore: Send + Sync + 'static {
    /// Reads a value, ignoring expired entries.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>>;

    /// Atomically pops the head of `from` and pushes it onto the tail of `to`.
    ///
    /// Returns the moved value, or `None` if `from` was empty. There is no
    /// point at which the value belongs to neither list.
    fn transfer<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Reads up to `limit` values of a list starting at `offset`, head first.
    fn range<'a>(
        &'a self,
        list: &'a str,
        offset: usize,
        limit: usize,
    ) -> StoreFuture<'a, Vec<String>>;

    fn len<'a>(&'a self, list: &'a str) -> StoreFuture<'a, u64>;

    fn contains<'a>(&'a self, list: &'a str, value: &'a str) -> StoreFuture<'a, bool>;

    /// Reads a counter. Missing counters read as zero.
    fn counter<'a>(&'a self, counter: &'a str) -> StoreFuture<'a, i64>;

    /// Applies a batch if all its guards hold.
    ///
    /// Returns `false`, leaving the store untouched, when a guard fails.
    fn commit(&self, batch: Batch) -> StoreFuture<'_, bool>;

    /// Drops expired values. Returns how many were removed.
    fn evict_expired(&self) -> StoreFuture<'_, u64>;

    /// Releases connections. Further calls may fail.
    fn close(&self) -> StoreFuture<'_, ()>;
}

/// Key layout shared by every component.
pub mod keys {
    /// Every topic that has ever been published to.
    pub const TOPICS: &str = "tempoq:topics";

    pub fn message(id: impl std::fmt::Display) -> String {
        format!("tempoq:msg:{id}")
    }

    pub fn pending(topic: &str) -> String {
        format!("tempoq:{topic}:pending")
    }

    pub fn processing(topic: &str) -> String {
        format!("tempoq:{topic}:processing")
    }

    pub fn dead_letter(topic: &str) -> String {
        format!("tempoq:{topic}:dead")
    }

    /// Pending plus processing.
    pub fn size(topic: &str) -> String {
        format!("tempoq:{topic}:size")
    }

    pub fn dead_letter_size(topic: &str) -> String {
        format!("tempoq:{topic}:dead_size")
    }
}
