//! Fleet-wide outbound metrics
//!
//! Four metrics are registered lazily on first use, label-keyed by
//! `(protocol, peer)` where `peer` is the `"[host]:port"` rendering of
//! the target:
//!
//! - `outbound_count`: gauge, recomputed on every scrape by walking the
//!   live-outbound registry
//! - `outbound_in` / `outbound_out`: counters; the scrape pulls
//!   per-outbound byte deltas and folds them into the per-label counter
//!   and the aggregate
//! - `outbound_conn_time`: histogram with buckets `floor(1.5^i)` for
//!   i in 1..=20 (milliseconds) plus +∞, observed once per successful
//!   connect
//!
//! Everything here is atomics over shared maps; a scrape never blocks
//! outbound I/O.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::registry;

/// Name of the live-outbound gauge.
pub const METRIC_OUTBOUND_COUNT: &str = "outbound_count";
/// Name of the inbound traffic counter.
pub const METRIC_OUTBOUND_IN: &str = "outbound_in";
/// Name of the outbound traffic counter.
pub const METRIC_OUTBOUND_OUT: &str = "outbound_out";
/// Name of the connect-time histogram.
pub const METRIC_OUTBOUND_CONN_TIME: &str = "outbound_conn_time";

/// Label set keying every outbound metric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels {
    /// `"TCP"` or `"UDP"`
    pub protocol: String,
    /// `"[host]:port"` of the target
    pub peer: String,
}

type LabelKey = (&'static str, String);

/// Monotonic atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a zeroed counter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Add `n` to the counter.
    pub fn increase(&self, n: u64) {
        if n > 0 {
            self.value.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Upper bounds of the connect-time buckets in milliseconds.
///
/// `floor(1.5^i)` for i in 1..=20; observations above the last bound
/// land in the implicit +∞ bucket.
#[must_use]
pub fn conn_time_bounds() -> Vec<f64> {
    let mut bounds = Vec::with_capacity(20);
    let mut limit = 1.5_f64;
    for _ in 0..20 {
        bounds.push(limit.floor());
        limit *= 1.5;
    }
    bounds
}

/// Fixed-bucket histogram over millisecond observations.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    // One slot per bound plus the +inf overflow slot.
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given finite upper bounds.
    #[must_use]
    pub fn new(bounds: Vec<f64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Create a histogram with the connect-time bucket table.
    #[must_use]
    pub fn conn_time() -> Self {
        Self::new(conn_time_bounds())
    }

    /// Record one observation in milliseconds.
    pub fn observe_ms(&self, ms: f64) {
        let slot = self
            .bounds
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(self.bounds.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((ms * 1000.0).max(0.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one observed duration.
    pub fn observe(&self, duration: Duration) {
        self.observe_ms(duration.as_secs_f64() * 1000.0);
    }

    /// Number of observations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of the histogram.
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            sum_ms: self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            count: self.count(),
        }
    }
}

/// Serialized form of a [`Histogram`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// Finite bucket upper bounds (milliseconds)
    pub bounds: Vec<f64>,
    /// Per-bucket observation counts; the extra last slot is +∞
    pub buckets: Vec<u64>,
    /// Sum of observations in milliseconds
    pub sum_ms: f64,
    /// Total observation count
    pub count: u64,
}

/// The process-wide outbound metric families.
pub struct OutboundMetrics {
    in_total: Counter,
    out_total: Counter,
    conn_time_total: Histogram,
    traffic_in: DashMap<LabelKey, Arc<Counter>>,
    traffic_out: DashMap<LabelKey, Arc<Counter>>,
    conn_time: DashMap<LabelKey, Arc<Histogram>>,
}

impl OutboundMetrics {
    fn new() -> Self {
        Self {
            in_total: Counter::new(),
            out_total: Counter::new(),
            conn_time_total: Histogram::conn_time(),
            traffic_in: DashMap::new(),
            traffic_out: DashMap::new(),
            conn_time: DashMap::new(),
        }
    }

    /// Per-label inbound traffic counter, created on first use.
    #[must_use]
    pub fn traffic_in(&self, protocol: &'static str, peer: &str) -> Arc<Counter> {
        Arc::clone(
            &self
                .traffic_in
                .entry((protocol, peer.to_string()))
                .or_insert_with(|| Arc::new(Counter::new())),
        )
    }

    /// Per-label outbound traffic counter, created on first use.
    #[must_use]
    pub fn traffic_out(&self, protocol: &'static str, peer: &str) -> Arc<Counter> {
        Arc::clone(
            &self
                .traffic_out
                .entry((protocol, peer.to_string()))
                .or_insert_with(|| Arc::new(Counter::new())),
        )
    }

    /// Per-label connect-time histogram, created on first use.
    #[must_use]
    pub fn conn_time(&self, protocol: &'static str, peer: &str) -> Arc<Histogram> {
        Arc::clone(
            &self
                .conn_time
                .entry((protocol, peer.to_string()))
                .or_insert_with(|| Arc::new(Histogram::conn_time())),
        )
    }

    /// Aggregate inbound traffic counter.
    #[must_use]
    pub fn in_total(&self) -> &Counter {
        &self.in_total
    }

    /// Aggregate outbound traffic counter.
    #[must_use]
    pub fn out_total(&self) -> &Counter {
        &self.out_total
    }

    /// Aggregate connect-time histogram.
    #[must_use]
    pub fn conn_time_total(&self) -> &Histogram {
        &self.conn_time_total
    }
}

/// The lazily-initialized global metric families.
pub fn outbound_metrics() -> &'static OutboundMetrics {
    static METRICS: OnceLock<OutboundMetrics> = OnceLock::new();
    METRICS.get_or_init(OutboundMetrics::new)
}

/// One labeled scalar value inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledValue {
    /// Metric labels
    pub labels: Labels,
    /// Metric value
    pub value: u64,
}

/// Snapshot of a gauge or counter family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilySnapshot {
    /// Aggregate across all labels
    pub total: u64,
    /// Per-label values, sorted by label
    pub entries: Vec<LabeledValue>,
}

impl FamilySnapshot {
    /// Look up the value for one label pair.
    #[must_use]
    pub fn get(&self, protocol: &str, peer: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.labels.protocol == protocol && e.labels.peer == peer)
            .map(|e| e.value)
    }
}

/// One labeled histogram inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledHistogram {
    /// Metric labels
    pub labels: Labels,
    /// Histogram state
    pub histogram: HistogramSnapshot,
}

/// Snapshot of the connect-time histogram family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramFamilySnapshot {
    /// Aggregate across all labels
    pub total: HistogramSnapshot,
    /// Per-label histograms, sorted by label
    pub entries: Vec<LabeledHistogram>,
}

impl HistogramFamilySnapshot {
    /// Look up the histogram for one label pair.
    #[must_use]
    pub fn get(&self, protocol: &str, peer: &str) -> Option<&HistogramSnapshot> {
        self.entries
            .iter()
            .find(|e| e.labels.protocol == protocol && e.labels.peer == peer)
            .map(|e| &e.histogram)
    }
}

/// Point-in-time view of every outbound metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Live outbounds per label plus total
    pub outbound_count: FamilySnapshot,
    /// Bytes read from peers
    pub outbound_in: FamilySnapshot,
    /// Bytes written to peers
    pub outbound_out: FamilySnapshot,
    /// Connect durations
    pub outbound_conn_time: HistogramFamilySnapshot,
}

/// Scrape every outbound metric.
///
/// Walks the live-outbound registry: recomputes the `outbound_count`
/// gauge, drains per-outbound traffic deltas into the label-keyed and
/// aggregate counters, then snapshots all families.
#[must_use]
pub fn scrape() -> MetricsSnapshot {
    let metrics = outbound_metrics();

    let mut gauge: BTreeMap<Labels, u64> = BTreeMap::new();
    let mut total = 0_u64;

    registry::for_each(|outbound| {
        let labels = Labels {
            protocol: outbound.protocol().name().to_string(),
            peer: outbound.address(),
        };
        *gauge.entry(labels).or_insert(0) += 1;
        total += 1;

        // TCP accumulates per-outbound deltas drained here; UDP updates
        // the label counters inline and its deltas read as zero.
        let n_in = outbound.take_traffic_in();
        let n_out = outbound.take_traffic_out();
        if let Some(attached) = outbound.attached_metrics() {
            attached.traffic_in.increase(n_in);
            attached.traffic_out.increase(n_out);
        }
        metrics.in_total.increase(n_in);
        metrics.out_total.increase(n_out);
    });

    MetricsSnapshot {
        outbound_count: FamilySnapshot {
            total,
            entries: gauge
                .into_iter()
                .map(|(labels, value)| LabeledValue { labels, value })
                .collect(),
        },
        outbound_in: counter_family(&metrics.traffic_in, metrics.in_total.value()),
        outbound_out: counter_family(&metrics.traffic_out, metrics.out_total.value()),
        outbound_conn_time: histogram_family(&metrics.conn_time, &metrics.conn_time_total),
    }
}

fn counter_family(map: &DashMap<LabelKey, Arc<Counter>>, total: u64) -> FamilySnapshot {
    let mut entries: Vec<LabeledValue> = map
        .iter()
        .map(|entry| LabeledValue {
            labels: Labels {
                protocol: entry.key().0.to_string(),
                peer: entry.key().1.clone(),
            },
            value: entry.value().value(),
        })
        .collect();
    entries.sort_by(|a, b| a.labels.cmp(&b.labels));
    FamilySnapshot { total, entries }
}

fn histogram_family(
    map: &DashMap<LabelKey, Arc<Histogram>>,
    total: &Histogram,
) -> HistogramFamilySnapshot {
    let mut entries: Vec<LabeledHistogram> = map
        .iter()
        .map(|entry| LabeledHistogram {
            labels: Labels {
                protocol: entry.key().0.to_string(),
                peer: entry.key().1.clone(),
            },
            histogram: entry.value().snapshot(),
        })
        .collect();
    entries.sort_by(|a, b| a.labels.cmp(&b.labels));
    HistogramFamilySnapshot {
        total: total.snapshot(),
        entries,
    }
}
