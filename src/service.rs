use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

use crate::{
    config::Config,
    dead_letter::DeadLetters,
    delivery::Delivery,
    dispatcher::Dispatcher,
    error::Error,
    message::{validate_topic, Message, MessageStatus, NewMessage},
    metrics::{self, Metrics, Outcome, TracingMetrics},
    queue::{Body, Location, QueueStore, TopicStats},
    reclaim::Reclaimer,
    registry::{Handler, Registry},
    retry::Backoff,
    store::{BackingStore, MemoryStore, SqliteStore},
};

/// The queue engine: publishing, handler registration, background loops and
/// the admin operations, over one backing store.
pub struct Service {
    config: Config,
    queue: QueueStore,
    registry: Arc<Registry>,
    delivery: Delivery,
    dead_letters: DeadLetters,
    dispatcher: Dispatcher,
    reclaimer: Reclaimer,
    metrics: Arc<dyn Metrics>,
    shutdown: CancellationToken,
    loops: TaskTracker,
    started: AtomicBool,
    closed: AtomicBool,
}

#[bon::bon]
impl Service {
    /// Connects using the configuration from the environment.
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with().config(Config::load()?).call().await
    }

    /// Connects with an explicit configuration.
    ///
    /// Without a `store`, a SQLite store is opened at `config.db_path`, or an
    /// in-memory store is used when no path is set. Metrics default to
    /// [`TracingMetrics`].
    #[builder]
    pub async fn connect_with(
        #[builder(default)] config: Config,
        store: Option<Arc<dyn BackingStore>>,
        metrics: Option<Arc<dyn Metrics>>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let store: Arc<dyn BackingStore> = match (store, &config.db_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(SqliteStore::connect(path).await?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let metrics = metrics.unwrap_or_else(|| Arc::new(TracingMetrics));

        let queue = QueueStore::new(store, config.message_ttl());
        let registry = Arc::new(Registry::new(config.max_in_flight()));
        let dead_letters = DeadLetters::new(queue.clone(), metrics.clone());
        let delivery = Delivery::new(
            queue.clone(),
            Backoff::new(config.retry_delays())?,
            dead_letters.clone(),
            metrics.clone(),
        );

        let dispatcher = Dispatcher::builder()
            .queue(queue.clone())
            .registry(registry.clone())
            .delivery(delivery.clone())
            .metrics(metrics.clone())
            .batch_size(config.batch_size)
            .processing_timeout(config.processing_timeout())
            .build();

        let reclaimer = Reclaimer::builder()
            .queue(queue.clone())
            .delivery(delivery.clone())
            .dead_letters(dead_letters.clone())
            .metrics(metrics.clone())
            .lock_duration(config.lock_duration())
            .dead_letter_ttl(config.dead_letter_ttl())
            .build();

        Ok(Self {
            config,
            queue,
            registry,
            delivery,
            dead_letters,
            dispatcher,
            reclaimer,
            metrics,
            shutdown: CancellationToken::new(),
            loops: TaskTracker::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

impl Service {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub async fn publish(&self, topic: impl Into<String>, payload: Value) -> Result<Uuid, Error> {
        self.publish_message(NewMessage::builder().topic(topic).payload(payload).build())
            .await
    }

    pub async fn publish_with_retry(
        &self,
        topic: impl Into<String>,
        payload: Value,
        max_retries: u32,
    ) -> Result<Uuid, Error> {
        self.publish_message(
            NewMessage::builder()
                .topic(topic)
                .payload(payload)
                .max_retries(max_retries)
                .build(),
        )
        .await
    }

    /// Publishes under an id derived from `key`. Publishing the same key to
    /// the same topic again returns the same id and enqueues nothing.
    pub async fn publish_idempotent(
        &self,
        topic: impl Into<String>,
        key: &str,
        payload: Value,
    ) -> Result<Uuid, Error> {
        let topic = topic.into();
        let id = Message::deterministic_id(&topic, key);

        self.publish_message(
            NewMessage::builder()
                .topic(topic)
                .payload(payload)
                .id(id)
                .build(),
        )
        .await
    }

    pub async fn publish_message(&self, new: NewMessage) -> Result<Uuid, Error> {
        self.ensure_open()?;
        validate_topic(&new.topic)?;

        let message = Message::new(new, self.config.default_max_retries, Utc::now());

        let res = self.queue.publish(&message).await;
        self.metrics
            .incr(metrics::PUBLISH, &message.topic, Outcome::from(&res));

        if res? {
            tracing::debug!(topic = message.topic, message_id = %message.id, "Published message");
            metrics::report_depth(self.metrics.as_ref(), &self.queue, &message.topic).await;
        } else {
            tracing::debug!(topic = message.topic, message_id = %message.id, "Message already published");
        }

        Ok(message.id)
    }

    pub async fn subscribe<H: Handler>(
        &self,
        topic: impl Into<String>,
        handler: H,
    ) -> Result<(), Error> {
        self.subscribe_shared(topic, Arc::new(handler)).await
    }

    pub async fn subscribe_shared(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), Error> {
        self.ensure_open()?;

        let topic = topic.into();
        validate_topic(&topic)?;

        self.registry
            .subscribe(topic.clone(), handler)
            .await?;

        tracing::info!(topic, "Subscribed handler");

        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        self.registry.unsubscribe(topic).await?;

        tracing::info!(topic, "Unsubscribed handler");

        Ok(())
    }

    pub async fn get_message(&self, id: Uuid) -> Result<Message, Error> {
        self.queue.get_message(id).await
    }

    pub async fn list_dead_letters(
        &self,
        topic: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, Error> {
        self.dead_letters.list(topic, offset, limit).await
    }

    pub async fn replay_dead_letter(&self, id: Uuid) -> Result<Message, Error> {
        self.dead_letters.replay(id).await
    }

    pub async fn purge_dead_letters(&self, topic: &str) -> Result<u64, Error> {
        self.dead_letters.purge(topic).await
    }

    /// Forces a message back to pending with its retries reset.
    pub async fn retry_message(&self, id: Uuid) -> Result<Message, Error> {
        let mut message = self.queue.get_message(id).await?;

        let from = match self.queue.locate(&message).await? {
            Some(Location::DeadLetter) => return self.dead_letters.replay(id).await,
            Some(location) => location,
            None => {
                return Err(Error::conflict(format!(
                    "message {id} is {} and cannot be retried",
                    message.status
                )))
            }
        };

        message.status = MessageStatus::Pending;
        message.retry_count = 0;
        message.next_retry_at = None;
        message.error_message = None;
        message.touch(Utc::now());

        match from {
            Location::Pending => self.queue.save_in_place(&message, from).await?,
            _ => {
                self.queue
                    .transition(&message, from, Some(Location::Pending), Body::Store, None)
                    .await?
            }
        }

        tracing::info!(topic = message.topic, message_id = %id, "Forced message retry");

        Ok(message)
    }

    /// Completes a message out of band, wherever it currently is.
    pub async fn ack_message(&self, id: Uuid) -> Result<Message, Error> {
        let message = self.queue.get_message(id).await?;

        let Some(from) = self.queue.locate(&message).await? else {
            return Err(Error::conflict(format!(
                "message {id} is already {}",
                message.status
            )));
        };

        self.delivery.ack(message, from).await
    }

    /// Fails a processing message out of band, as if its handler had.
    pub async fn nack_message(&self, id: Uuid, error: impl Into<String>) -> Result<Message, Error> {
        let message = self.queue.get_message(id).await?;

        if self.queue.locate(&message).await? != Some(Location::Processing) {
            return Err(Error::conflict(format!(
                "message {id} is {} and not processing",
                message.status
            )));
        }

        self.delivery.nack(message, error).await
    }

    pub async fn stats(&self, topic: &str) -> Result<TopicStats, Error> {
        self.queue.stats(topic).await
    }

    pub async fn reconcile(&self, topic: &str) -> Result<TopicStats, Error> {
        self.queue.reconcile(topic).await
    }

    pub async fn topics(&self) -> Result<Vec<String>, Error> {
        self.queue.topics().await
    }

    /// Runs a single dispatch pass without waiting for the executions.
    pub async fn dispatch_once(&self) -> usize {
        self.dispatcher.tick().await
    }

    /// Dispatches and waits until an idle pass finds nothing left to start.
    pub async fn drain(&self) {
        loop {
            let idle = self.dispatcher.in_flight() == 0;
            let started = self.dispatcher.tick().await;
            self.dispatcher.wait_idle().await;
            if idle && started == 0 {
                break;
            }
        }
    }

    /// Number of handler executions currently running.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    pub async fn reclaim_once(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        self.reclaimer.sweep_processing(now).await
    }

    pub async fn expire_dead_letters_once(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        self.reclaimer.sweep_dead_letters(now).await
    }

    /// Starts the dispatch, reclaim and dead-letter cleanup loops. Calling it
    /// again is a no-op.
    pub fn start(&self) -> Result<(), Error> {
        self.ensure_open()?;

        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.loops.spawn(
            self.dispatcher
                .clone()
                .run(self.config.poll_interval(), self.shutdown.clone()),
        );
        self.loops.spawn(
            self.reclaimer
                .clone()
                .run(self.config.cleanup_interval(), self.shutdown.clone()),
        );
        self.loops.spawn(
            self.reclaimer
                .clone()
                .run_cleanup(self.config.cleanup_interval(), self.shutdown.clone()),
        );

        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            cleanup_interval_ms = self.config.cleanup_interval_ms,
            "Queue service started"
        );

        Ok(())
    }

    /// Stops the loops, waits for running executions to settle and closes the
    /// store. Only the first call does anything.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();
        self.loops.close();
        self.loops.wait().await;
        self.dispatcher.wait_idle().await;

        self.queue.backing_store().close().await?;

        tracing::info!("Queue service closed");

        Ok(())
    }
}
