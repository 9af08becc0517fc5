//! Named-operation timing with per-name aggregate statistics.
//!
//! Spans are keyed by a [`SpanId`] so overlapping operations with the same
//! name never clobber each other. [`PerformanceTracker::end`] keeps the
//! by-name interface and finalizes the most recently begun active span
//! carrying that name.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Identifies one begun span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

/// One timed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl PerformanceMetric {
    /// Seconds between start and end, once the span has ended
    pub fn duration(&self) -> Option<f64> {
        self.end_time
            .map(|end| seconds(end.signed_duration_since(self.start_time)))
    }
}

/// Aggregate over the completed spans of one name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanStatistics {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

#[derive(Debug, Default)]
struct TrackerState {
    active: HashMap<SpanId, PerformanceMetric>,
    history: HashMap<String, Vec<PerformanceMetric>>,
}

#[derive(Debug, Default)]
pub struct PerformanceTracker {
    next_id: AtomicU64,
    state: Mutex<TrackerState>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, name: &str, metadata: Option<Metadata>) -> SpanId {
        self.begin_at(name, metadata, Utc::now())
    }

    pub fn begin_at(&self, name: &str, metadata: Option<Metadata>, at: DateTime<Utc>) -> SpanId {
        let id = SpanId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let metric = PerformanceMetric {
            name: name.to_string(),
            start_time: at,
            end_time: None,
            metadata: metadata.unwrap_or_default(),
        };
        self.lock().active.insert(id, metric);
        ::log::trace!("Began span {} ({:?})", name, id);
        id
    }

    /// End the most recently begun active span named `name`
    pub fn end(&self, name: &str) -> Option<f64> {
        self.end_at(name, Utc::now())
    }

    pub fn end_at(&self, name: &str, at: DateTime<Utc>) -> Option<f64> {
        let mut state = self.lock();
        let latest = state
            .active
            .iter()
            .filter(|(_, metric)| metric.name == name)
            .map(|(id, _)| *id)
            .max()?;
        finish(&mut state, latest, at)
    }

    /// End one specific span
    pub fn end_span(&self, id: SpanId) -> Option<f64> {
        self.end_span_at(id, Utc::now())
    }

    pub fn end_span_at(&self, id: SpanId, at: DateTime<Utc>) -> Option<f64> {
        finish(&mut self.lock(), id, at)
    }

    /// Number of spans begun but not yet ended
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn statistics(&self, name: &str) -> Option<SpanStatistics> {
        let state = self.lock();
        let durations: Vec<f64> = state
            .history
            .get(name)?
            .iter()
            .filter_map(PerformanceMetric::duration)
            .collect();
        summarize(durations)
    }

    pub fn all_statistics(&self) -> BTreeMap<String, SpanStatistics> {
        let state = self.lock();
        state
            .history
            .iter()
            .filter_map(|(name, metrics)| {
                let durations = metrics.iter().filter_map(PerformanceMetric::duration).collect();
                summarize(durations).map(|stats| (name.clone(), stats))
            })
            .collect()
    }

    /// Warn about, and return, completed spans longer than `threshold_secs`
    pub fn log_slow(&self, threshold_secs: f64) -> Vec<PerformanceMetric> {
        let state = self.lock();
        let mut slow = Vec::new();
        for metrics in state.history.values() {
            for metric in metrics {
                if let Some(duration) = metric.duration() {
                    if duration > threshold_secs {
                        ::log::warn!(
                            "Slow operation detected: {} took {:.2}s. Metadata: {}",
                            metric.name,
                            duration,
                            serde_json::Value::Object(metric.metadata.clone())
                        );
                        slow.push(metric.clone());
                    }
                }
            }
        }
        slow
    }

    /// Drop completed spans that started more than `max_age_hours` ago
    pub fn evict_older_than(&self, max_age_hours: u64) -> usize {
        self.evict_before(Utc::now() - ChronoDuration::hours(max_age_hours as i64))
    }

    pub fn evict_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let mut evicted = 0;
        for metrics in state.history.values_mut() {
            let before = metrics.len();
            metrics.retain(|m| m.start_time >= cutoff);
            evicted += before - metrics.len();
        }
        state.history.retain(|_, metrics| !metrics.is_empty());
        if evicted > 0 {
            ::log::debug!("Evicted {} spans older than {}", evicted, cutoff);
        }
        evicted
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn finish(state: &mut TrackerState, id: SpanId, at: DateTime<Utc>) -> Option<f64> {
    let mut metric = state.active.remove(&id)?;
    metric.end_time = Some(at);
    let duration = metric.duration();
    ::log::trace!("Ended span {} after {:?}s", metric.name, duration);
    state
        .history
        .entry(metric.name.clone())
        .or_default()
        .push(metric);
    duration
}

fn seconds(delta: ChronoDuration) -> f64 {
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

fn summarize(mut durations: Vec<f64>) -> Option<SpanStatistics> {
    if durations.is_empty() {
        return None;
    }
    durations.sort_by(|a, b| a.total_cmp(b));

    let count = durations.len();
    let mean = durations.iter().sum::<f64>() / count as f64;
    let median = if count % 2 == 1 {
        durations[count / 2]
    } else {
        (durations[count / 2 - 1] + durations[count / 2]) / 2.0
    };
    // Sample standard deviation
    let stddev = if count > 1 {
        let variance =
            durations.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
        variance.sqrt()
    } else {
        0.0
    };

    Some(SpanStatistics {
        count,
        mean,
        median,
        min: durations[0],
        max: durations[count - 1],
        stddev,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    #[test]
    fn test_statistics_over_known_durations() {
        let tracker = PerformanceTracker::new();
        for (i, d) in [1, 2, 3].into_iter().enumerate() {
            let start = t(i as i64 * 10);
            tracker.begin_at("crawl", None, start);
            tracker.end_at("crawl", start + ChronoDuration::seconds(d));
        }

        let stats = tracker.statistics("crawl").unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.mean, 2.0);
        assert_eq!(stats.median, 2.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert!((stats.stddev - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_or_incomplete_names_have_no_statistics() {
        let tracker = PerformanceTracker::new();
        assert!(tracker.statistics("missing").is_none());

        tracker.begin("running", None);
        assert!(tracker.statistics("running").is_none());
        assert!(tracker.all_statistics().is_empty());
    }

    #[test]
    fn test_single_span_has_zero_stddev() {
        let tracker = PerformanceTracker::new();
        let id = tracker.begin_at("one", None, t(0));
        assert_eq!(tracker.end_span_at(id, t(4)), Some(4.0));
        let stats = tracker.statistics("one").unwrap();
        assert_eq!(stats.stddev, 0.0);
        assert_eq!(stats.median, 4.0);
    }

    #[test]
    fn test_overlapping_spans_with_same_name_are_both_kept() {
        let tracker = PerformanceTracker::new();
        let first = tracker.begin_at("http", None, t(0));
        let _second = tracker.begin_at("http", None, t(1));

        // By-name end finalizes the most recent span, the first stays active
        assert_eq!(tracker.end_at("http", t(2)), Some(1.0));
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(tracker.end_span_at(first, t(5)), Some(5.0));

        let stats = tracker.statistics("http").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max, 5.0);
        assert_eq!(tracker.end("http"), None);
    }

    #[test]
    fn test_log_slow_returns_spans_over_threshold() {
        let tracker = PerformanceTracker::new();
        let mut metadata = Metadata::new();
        metadata.insert("url".into(), "https://example.com".into());
        tracker.begin_at("fast", None, t(0));
        tracker.end_at("fast", t(0) + ChronoDuration::milliseconds(200));
        tracker.begin_at("slow", Some(metadata), t(0));
        tracker.end_at("slow", t(3));

        let slow = tracker.log_slow(1.0);
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].name, "slow");
        assert_eq!(slow[0].metadata["url"], "https://example.com");
    }

    #[test]
    fn test_evict_before_cutoff() {
        let tracker = PerformanceTracker::new();
        tracker.begin_at("a", None, t(0));
        tracker.end_at("a", t(1));
        tracker.begin_at("a", None, t(100));
        tracker.end_at("a", t(102));
        tracker.begin_at("b", None, t(0));
        tracker.end_at("b", t(1));

        assert_eq!(tracker.evict_before(t(50)), 2);
        assert_eq!(tracker.statistics("a").unwrap().count, 1);
        assert!(tracker.statistics("b").is_none());
    }

    #[test]
    fn test_evict_older_than_hours() {
        let tracker = PerformanceTracker::new();
        let old = Utc::now() - ChronoDuration::hours(30);
        tracker.begin_at("old", None, old);
        tracker.end_at("old", old + ChronoDuration::seconds(1));
        tracker.begin("new", None);
        tracker.end("new");

        assert_eq!(tracker.evict_older_than(24), 1);
        assert!(tracker.statistics("new").is_some());
    }
}
