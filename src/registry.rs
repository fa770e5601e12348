//! Topic handlers.

use std::{collections::HashMap, future::Future, sync::Arc, time::Instant};

use futures_util::future::BoxFuture;
use tokio::sync::{RwLock, Semaphore};

use crate::{error::Error, message::Message};

/// Per-execution information handed to a handler alongside the message.
#[derive(Debug, Clone)]
pub struct Context {
    pub topic: String,
    /// 1-based delivery attempt of this message.
    pub attempt: u32,
    /// The execution is failed and its future dropped past this instant.
    pub deadline: Instant,
}

/// Processes messages of one topic.
///
/// `Ok` acknowledges the message, `Err` negatively acknowledges it and the
/// error text is recorded on the message. Delivery is at-least-once, so
/// implementations must be idempotent, and they are invoked concurrently for
/// distinct messages.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, ctx: Context, message: Message) -> BoxFuture<'static, eyre::Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    fn handle(&self, ctx: Context, message: Message) -> BoxFuture<'static, eyre::Result<()>> {
        Box::pin(self(ctx, message))
    }
}

/// A registered handler plus the permits bounding its concurrent executions.
#[derive(Clone)]
pub struct Subscription {
    pub handler: Arc<dyn Handler>,
    pub permits: Arc<Semaphore>,
}

/// Topic to handler map. Reads (dispatch) are concurrent, writes exclusive.
pub struct Registry {
    handlers: RwLock<HashMap<String, Subscription>>,
    max_in_flight: usize,
}

impl Registry {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            max_in_flight,
        }
    }

    pub async fn subscribe(&self, topic: String, handler: Arc<dyn Handler>) -> Result<(), Error> {
        let mut handlers = self.handlers.write().await;

        if handlers.contains_key(&topic) {
            return Err(Error::AlreadyRegistered { topic });
        }

        handlers.insert(
            topic,
            Subscription {
                handler,
                permits: Arc::new(Semaphore::new(self.max_in_flight)),
            },
        );

        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        self.handlers
            .write()
            .await
            .remove(topic)
            .map(|_| ())
            .ok_or_else(|| Error::NotRegistered {
                topic: topic.to_owned(),
            })
    }

    pub async fn get(&self, topic: &str) -> Option<Subscription> {
        self.handlers.read().await.get(topic).cloned()
    }

    pub async fn snapshot(&self) -> Vec<(String, Subscription)> {
        self.handlers
            .read()
            .await
            .iter()
            .map(|(topic, sub)| (topic.clone(), sub.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn Handler> {
        Arc::new(|_: Context, _: Message| async { Ok::<_, eyre::Report>(()) })
    }

    #[tokio::test]
    async fn one_handler_per_topic() {
        let registry = Registry::new(2);

        registry.subscribe("a".into(), noop()).await.unwrap();
        assert!(matches!(
            registry.subscribe("a".into(), noop()).await,
            Err(Error::AlreadyRegistered { .. })
        ));

        registry.subscribe("b".into(), noop()).await.unwrap();
        assert_eq!(registry.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_requires_registration() {
        let registry = Registry::new(2);
        assert!(matches!(
            registry.unsubscribe("a").await,
            Err(Error::NotRegistered { .. })
        ));

        registry.subscribe("a".into(), noop()).await.unwrap();
        registry.unsubscribe("a").await.unwrap();
        assert!(registry.get("a").await.is_none());

        registry.subscribe("a".into(), noop()).await.unwrap();
    }

    #[tokio::test]
    async fn subscriptions_carry_in_flight_permits() {
        let registry = Registry::new(3);
        registry.subscribe("a".into(), noop()).await.unwrap();

        let sub = registry.get("a").await.unwrap();
        assert_eq!(sub.permits.available_permits(), 3);
    }
}
