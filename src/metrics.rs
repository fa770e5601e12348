//! Metrics sink used by the queue engine.
//!
//! The engine reports through the [`Metrics`] trait and never depends on a
//! particular metrics backend. [`TracingMetrics`] forwards every data point as
//! a `tracing` event, [`RecordingMetrics`] keeps them in lock-free maps so they
//! can be inspected by tests and embedding applications.

use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::queue::QueueStore;

pub const PUBLISH: &str = "tempoq_publish_total";
pub const ACK: &str = "tempoq_ack_total";
pub const NACK: &str = "tempoq_nack_total";
pub const RETRY: &str = "tempoq_retry_total";
pub const DEAD_LETTER: &str = "tempoq_dead_letter_total";
pub const RECLAIM: &str = "tempoq_reclaim_total";
pub const STORE_ERROR: &str = "tempoq_store_error_total";
/// Ids dropped because their stored body could not be decoded.
pub const UNDECODABLE: &str = "tempoq_undecodable_total";

pub const QUEUE_DEPTH: &str = "tempoq_queue_depth";
pub const DEAD_LETTER_DEPTH: &str = "tempoq_dead_letter_depth";

pub const PROCESSING_DURATION: &str = "tempoq_processing_duration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl<T, E> From<&Result<T, E>> for Outcome {
    fn from(res: &Result<T, E>) -> Self {
        match res {
            Ok(_) => Self::Success,
            Err(_) => Self::Failure,
        }
    }
}

pub trait Metrics: Send + Sync + 'static {
    fn incr(&self, name: &'static str, topic: &str, outcome: Outcome);

    fn gauge(&self, name: &'static str, topic: &str, value: i64);

    fn observe(&self, name: &'static str, topic: &str, value: Duration);
}

/// Publishes both depth gauges of a topic from its counters.
pub async fn report_depth(metrics: &dyn Metrics, queue: &QueueStore, topic: &str) {
    match queue.stats(topic).await {
        Ok(stats) => {
            metrics.gauge(QUEUE_DEPTH, topic, stats.size);
            metrics.gauge(DEAD_LETTER_DEPTH, topic, stats.dead_letter_size);
        }
        Err(e) => {
            metrics.incr(STORE_ERROR, topic, Outcome::Failure);
            tracing::warn!(topic, "Failed to read queue depth: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr(&self, _: &'static str, _: &str, _: Outcome) {}

    fn gauge(&self, _: &'static str, _: &str, _: i64) {}

    fn observe(&self, _: &'static str, _: &str, _: Duration) {}
}

/// Emits every data point as a `trace` level event on the `tempoq::metrics`
/// target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn incr(&self, name: &'static str, topic: &str, outcome: Outcome) {
        tracing::trace!(target: "tempoq::metrics", metric = name, topic, outcome = outcome.as_ref(), "counter");
    }

    fn gauge(&self, name: &'static str, topic: &str, value: i64) {
        tracing::trace!(target: "tempoq::metrics", metric = name, topic, value, "gauge");
    }

    fn observe(&self, name: &'static str, topic: &str, value: Duration) {
        tracing::trace!(
            target: "tempoq::metrics",
            metric = name,
            topic,
            micros = value.as_micros() as u64,
            "histogram"
        );
    }
}

type CounterKey = (&'static str, String, Outcome);
type SeriesKey = (&'static str, String);

#[derive(Default)]
struct Histogram {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

/// Summary of a recorded histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub total_micros: u64,
    pub max_micros: u64,
}

/// Keeps every data point in memory.
#[derive(Clone, Default)]
pub struct RecordingMetrics {
    counters: Arc<papaya::HashMap<CounterKey, AtomicU64>>,
    gauges: Arc<papaya::HashMap<SeriesKey, AtomicI64>>,
    histograms: Arc<papaya::HashMap<SeriesKey, Histogram>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &'static str, topic: &str, outcome: Outcome) -> u64 {
        let guard = self.counters.guard();
        self.counters
            .get(&(name, topic.to_owned(), outcome), &guard)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_value(&self, name: &'static str, topic: &str) -> Option<i64> {
        let guard = self.gauges.guard();
        self.gauges
            .get(&(name, topic.to_owned()), &guard)
            .map(|g| g.load(Ordering::Relaxed))
    }

    pub fn histogram(&self, name: &'static str, topic: &str) -> Option<HistogramSummary> {
        let guard = self.histograms.guard();
        self.histograms
            .get(&(name, topic.to_owned()), &guard)
            .map(|h| HistogramSummary {
                count: h.count.load(Ordering::Relaxed),
                total_micros: h.total_micros.load(Ordering::Relaxed),
                max_micros: h.max_micros.load(Ordering::Relaxed),
            })
    }
}

impl Metrics for RecordingMetrics {
    fn incr(&self, name: &'static str, topic: &str, outcome: Outcome) {
        let guard = self.counters.guard();
        self.counters
            .get_or_insert_with((name, topic.to_owned(), outcome), AtomicU64::default, &guard)
            .fetch_add(1, Ordering::Relaxed);
    }

    fn gauge(&self, name: &'static str, topic: &str, value: i64) {
        let guard = self.gauges.guard();
        self.gauges
            .get_or_insert_with((name, topic.to_owned()), AtomicI64::default, &guard)
            .store(value, Ordering::Relaxed);
    }

    fn observe(&self, name: &'static str, topic: &str, value: Duration) {
        let micros = value.as_micros() as u64;
        let guard = self.histograms.guard();
        let histogram =
            self.histograms
                .get_or_insert_with((name, topic.to_owned()), Histogram::default, &guard);

        histogram.count.fetch_add(1, Ordering::Relaxed);
        histogram.total_micros.fetch_add(micros, Ordering::Relaxed);
        histogram.max_micros.fetch_max(micros, Ordering::Relaxed);
    }
}
