//! In-memory implementation of the backing store.
//!
//! All state sits behind one async mutex, which makes every call trivially
//! atomic. Primarily used for tests and single-process deployments.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};

use tokio::sync::Mutex;

use super::{BackingStore, Batch, Guard, Op, StoreFuture};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct State {
    values: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    counters: HashMap<String, i64>,
}

impl State {
    fn live_value(&self, key: &str, now: Instant) -> Option<&Vec<u8>> {
        self.values
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| &entry.value)
    }

    fn holds(&self, guard: &Guard, now: Instant) -> bool {
        match guard {
            Guard::Member { list, value } => self
                .lists
                .get(list)
                .is_some_and(|l| l.iter().any(|v| v == value)),
            Guard::Absent { key } => self.live_value(key, now).is_none(),
            Guard::Unchanged { key, value } => self.live_value(key, now) == Some(value),
        }
    }

    fn apply(&mut self, op: Op, now: Instant) {
        match op {
            Op::Set { key, value, ttl } => {
                let expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
                self.values.insert(key, Entry { value, expires_at });
            }
            Op::Delete { key } => {
                self.values.remove(&key);
            }
            Op::Push { list, value } => {
                self.lists.entry(list).or_default().push_back(value);
            }
            Op::PushUnique { list, value } => {
                let list = self.lists.entry(list).or_default();
                if !list.contains(&value) {
                    list.push_back(value);
                }
            }
            Op::Remove { list, value } => {
                if let Some(l) = self.lists.get_mut(&list) {
                    l.retain(|v| *v != value);
                    if l.is_empty() {
                        self.lists.remove(&list);
                    }
                }
            }
            Op::Incr { counter, delta } => {
                *self.counters.entry(counter).or_default() += delta;
            }
            Op::Recount { counter, lists } => {
                let value = lists
                    .iter()
                    .filter_map(|list| self.lists.get(list))
                    .map(|l| l.len() as i64)
                    .sum();
                self.counters.insert(counter, value);
            }
        }
    }
}

#[derive(Clone, Default)]
/// Thread-safe in-memory store.
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackingStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.live_value(key, Instant::now()).cloned())
        })
    }

    fn transfer<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;

            let Some(value) = state.lists.get_mut(from).and_then(|l| l.pop_front()) else {
                return Ok(None);
            };

            if state.lists.get(from).is_some_and(|l| l.is_empty()) {
                state.lists.remove(from);
            }

            state
                .lists
                .entry(to.to_owned())
                .or_default()
                .push_back(value.clone());

            Ok(Some(value))
        })
    }

    fn range<'a>(
        &'a self,
        list: &'a str,
        offset: usize,
        limit: usize,
    ) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .lists
                .get(list)
                .map(|l| l.iter().skip(offset).take(limit).cloned().collect())
                .unwrap_or_default())
        })
    }

    fn len<'a>(&'a self, list: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.lists.get(list).map_or(0, |l| l.len() as u64))
        })
    }

    fn contains<'a>(&'a self, list: &'a str, value: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .lists
                .get(list)
                .is_some_and(|l| l.iter().any(|v| v == value)))
        })
    }

    fn counter<'a>(&'a self, counter: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.counters.get(counter).copied().unwrap_or(0))
        })
    }

    fn commit(&self, batch: Batch) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let now = Instant::now();

            if !batch.guards.iter().all(|guard| state.holds(guard, now)) {
                return Ok(false);
            }

            for op in batch.ops {
                state.apply(op, now);
            }

            Ok(true)
        })
    }

    fn evict_expired(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let before = state.values.len();
            state.values.retain(|_, entry| entry.live(now));
            Ok((before - state.values.len()) as u64)
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn transfer_moves_head_to_tail() {
        let store = MemoryStore::new();
        store
            .commit(Batch::new().push("a", "1").push("a", "2").push("b", "x"))
            .await
            .unwrap();

        assert_eq!(store.transfer("a", "b").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.range("a", 0, 10).await.unwrap(), vec!["2"]);
        assert_eq!(store.range("b", 0, 10).await.unwrap(), vec!["x", "1"]);

        assert_eq!(store.transfer("a", "b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.transfer("a", "b").await.unwrap(), None);
        assert_eq!(store.len("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_guard_leaves_state_untouched() {
        let store = MemoryStore::new();

        let applied = store
            .commit(
                Batch::new()
                    .guard_member("list", "missing")
                    .push("list", "v")
                    .incr("count", 1),
            )
            .await
            .unwrap();

        assert!(!applied);
        assert_eq!(store.len("list").await.unwrap(), 0);
        assert_eq!(store.counter("count").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn guards_check_values() {
        let store = MemoryStore::new();
        store
            .commit(Batch::new().set("k", b"one".to_vec(), None))
            .await
            .unwrap();

        assert!(!store.commit(Batch::new().guard_absent("k")).await.unwrap());
        assert!(store.commit(Batch::new().guard_absent("other")).await.unwrap());
        assert!(store
            .commit(Batch::new().guard_unchanged("k", b"one".to_vec()))
            .await
            .unwrap());
        assert!(!store
            .commit(Batch::new().guard_unchanged("k", b"two".to_vec()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn push_unique_and_remove() {
        let store = MemoryStore::new();
        store
            .commit(
                Batch::new()
                    .push_unique("topics", "a")
                    .push_unique("topics", "a")
                    .push_unique("topics", "b"),
            )
            .await
            .unwrap();
        assert_eq!(store.range("topics", 0, 10).await.unwrap(), vec!["a", "b"]);

        store
            .commit(Batch::new().remove("topics", "a"))
            .await
            .unwrap();
        assert!(!store.contains("topics", "a").await.unwrap());
        assert!(store.contains("topics", "b").await.unwrap());
    }

    #[tokio::test]
    async fn counters_increment_and_recount() {
        let store = MemoryStore::new();
        store
            .commit(Batch::new().incr("c", 3).incr("c", -1))
            .await
            .unwrap();
        assert_eq!(store.counter("c").await.unwrap(), 2);

        // Pushes earlier in the same batch are counted.
        store
            .commit(
                Batch::new()
                    .push("a", "1")
                    .push("b", "2")
                    .push("b", "3")
                    .recount("c", ["a", "b", "missing"]),
            )
            .await
            .unwrap();
        assert_eq!(store.counter("c").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn values_expire() {
        let store = MemoryStore::new();
        store
            .commit(
                Batch::new()
                    .set("short", b"v".to_vec(), Some(Duration::from_millis(10)))
                    .set("long", b"v".to_vec(), None),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(store.get("long").await.unwrap().is_some());
        assert_eq!(store.evict_expired().await.unwrap(), 1);
    }
}
