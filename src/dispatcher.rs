//! Claims pending messages and runs them through their topic's handler.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::OwnedSemaphorePermit, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    delivery::Delivery,
    error::Error,
    message::Message,
    metrics::{self, Metrics, Outcome},
    queue::{Location, QueueStore},
    registry::{Context, Handler, Registry, Subscription},
};

#[derive(Clone)]
pub struct Dispatcher {
    queue: QueueStore,
    registry: Arc<Registry>,
    delivery: Delivery,
    metrics: Arc<dyn Metrics>,
    batch_size: usize,
    processing_timeout: Duration,
    tracker: TaskTracker,
}

#[bon::bon]
impl Dispatcher {
    #[builder]
    pub fn new(
        queue: QueueStore,
        registry: Arc<Registry>,
        delivery: Delivery,
        metrics: Arc<dyn Metrics>,
        batch_size: usize,
        processing_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            registry,
            delivery,
            metrics,
            batch_size,
            processing_timeout,
            tracker: TaskTracker::new(),
        }
    }
}

impl Dispatcher {
    /// Runs one dispatch pass over every subscribed topic and returns how
    /// many executions were started.
    ///
    /// A failing topic is logged and skipped so one bad topic cannot stall
    /// the others.
    pub async fn tick(&self) -> usize {
        let mut started = 0;

        for (topic, subscription) in self.registry.snapshot().await {
            match self.dispatch_topic(&topic, &subscription).await {
                Ok(n) => started += n,
                Err(e) => {
                    self.metrics
                        .incr(metrics::STORE_ERROR, &topic, Outcome::Failure);
                    tracing::error!(topic, "Dispatch failed: {e}");
                }
            }

            metrics::report_depth(self.metrics.as_ref(), &self.queue, &topic).await;
        }

        started
    }

    async fn dispatch_topic(&self, topic: &str, subscription: &Subscription) -> Result<usize, Error> {
        let mut started = 0;

        for _ in 0..self.batch_size {
            // Leave messages pending rather than claim what cannot run yet.
            let Ok(permit) = subscription.permits.clone().try_acquire_owned() else {
                break;
            };

            let Some(id) = self.queue.claim(topic).await? else {
                break;
            };

            let Some(loaded) = self.queue.load(id).await? else {
                tracing::warn!(topic, message_id = %id, "Claimed message has no body, dropping");
                self.queue
                    .drop_orphan(topic, &id.to_string(), Location::Processing)
                    .await?;
                continue;
            };

            let mut message = loaded.message;
            match self.queue.mark_processing(&mut message, Utc::now()).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    tracing::debug!(topic, message_id = %id, "Lost claimed message: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            }

            tracing::debug!(
                topic,
                message_id = %id,
                attempt = message.attempts,
                "Dispatching message"
            );

            self.tracker.spawn(execute(
                self.delivery.clone(),
                self.metrics.clone(),
                subscription.handler.clone(),
                message,
                self.processing_timeout,
                permit,
            ));
            started += 1;
        }

        Ok(started)
    }

    /// Polls every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.tick().await;
        }

        tracing::debug!("Dispatcher stopped");
    }

    /// Waits for every execution started so far to settle.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of executions currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

async fn execute(
    delivery: Delivery,
    metrics: Arc<dyn Metrics>,
    handler: Arc<dyn Handler>,
    message: Message,
    timeout: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let topic = message.topic.clone();
    let id = message.id;
    let started = Instant::now();

    let ctx = Context {
        topic: topic.clone(),
        attempt: message.attempts,
        deadline: (started + timeout).into_std(),
    };

    // Run the handler on its own task so a panic is contained and a timeout
    // can abort it.
    let mut task = tokio::spawn(handler.handle(ctx, message.clone()));

    let outcome = match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(format!("{e:#}")),
        Ok(Err(e)) if e.is_panic() => Err("handler panicked".to_owned()),
        Ok(Err(e)) => Err(format!("handler task failed: {e}")),
        Err(_) => {
            task.abort();
            Err(format!("handler timed out after {}ms", timeout.as_millis()))
        }
    };

    metrics.observe(metrics::PROCESSING_DURATION, &topic, started.elapsed());

    let res = match outcome {
        Ok(()) => delivery.ack(message, Location::Processing).await,
        Err(reason) => {
            tracing::warn!(topic, message_id = %id, "Handler failed: {reason}");
            delivery.nack(message, reason).await
        }
    };

    match res {
        Ok(_) => {}
        Err(e) if e.is_conflict() => {
            tracing::warn!(topic, message_id = %id, "Message was settled elsewhere: {e}");
        }
        Err(e) => {
            metrics.incr(metrics::STORE_ERROR, &topic, Outcome::Failure);
            tracing::error!(topic, message_id = %id, "Failed to settle message: {e}");
        }
    }
}
