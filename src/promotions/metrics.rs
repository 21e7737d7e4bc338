// Performance metrics for the pricing engine
//
// Tracks cache hit rates, per-operation latency, slow operations and degraded
// responses.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Threshold above which an operation is logged as slow (100ms)
const SLOW_OPERATION_THRESHOLD_MS: u64 = 100;

/// Operations the engine times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    EventResolution,
    PromoValidation,
    CartPricing,
    ShippingCalculation,
    UsageAccounting,
}

impl Operation {
    const ALL: [Operation; 5] = [
        Operation::EventResolution,
        Operation::PromoValidation,
        Operation::CartPricing,
        Operation::ShippingCalculation,
        Operation::UsageAccounting,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn label(self) -> &'static str {
        match self {
            Operation::EventResolution => "event resolution",
            Operation::PromoValidation => "promo validation",
            Operation::CartPricing => "cart pricing",
            Operation::ShippingCalculation => "shipping calculation",
            Operation::UsageAccounting => "usage accounting",
        }
    }
}

#[derive(Debug, Default)]
struct OperationCounters {
    count: AtomicU64,
    total_time_us: AtomicU64,
    slow: AtomicU64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    degraded_responses: AtomicU64,
    operations: [OperationCounters; 5],
}

/// Shared, cheaply cloneable metrics handle
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    inner: Arc<MetricsInner>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A response fell back to base prices or reported shipping unavailable
    pub fn record_degraded(&self) {
        self.inner.degraded_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Cache hit rate (0.0 to 1.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Start timing an operation; the duration is recorded when the timer drops
    pub fn start(&self, operation: Operation) -> OperationTimer {
        OperationTimer {
            start: Instant::now(),
            operation,
            metrics: self.clone(),
        }
    }

    fn record(&self, operation: Operation, duration: Duration) {
        let counters = &self.inner.operations[operation.index()];
        counters.count.fetch_add(1, Ordering::Relaxed);
        counters
            .total_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        if duration.as_millis() as u64 > SLOW_OPERATION_THRESHOLD_MS {
            counters.slow.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Slow {}: {}ms", operation.label(), duration.as_millis());
        }
    }

    pub fn operation_count(&self, operation: Operation) -> u64 {
        self.inner.operations[operation.index()].count.load(Ordering::Relaxed)
    }

    /// Average duration in milliseconds
    pub fn avg_time_ms(&self, operation: Operation) -> f64 {
        let counters = &self.inner.operations[operation.index()];
        let count = counters.count.load(Ordering::Relaxed);
        let total_us = counters.total_time_us.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            (total_us as f64 / count as f64) / 1000.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let operations = Operation::ALL
            .iter()
            .map(|&operation| OperationSummary {
                operation: operation.label(),
                count: self.operation_count(operation),
                avg_time_ms: self.avg_time_ms(operation),
                slow: self.inner.operations[operation.index()]
                    .slow
                    .load(Ordering::Relaxed),
            })
            .collect();

        MetricsSummary {
            cache_hit_rate: self.cache_hit_rate(),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
            degraded_responses: self.inner.degraded_responses.load(Ordering::Relaxed),
            operations,
        }
    }

    pub fn log_summary(&self) {
        let summary = self.summary();
        tracing::info!(
            "Pricing cache: {:.1}% hit rate ({} hits, {} misses), {} degraded responses",
            summary.cache_hit_rate * 100.0,
            summary.cache_hits,
            summary.cache_misses,
            summary.degraded_responses,
        );
        for op in &summary.operations {
            tracing::info!(
                "Pricing {}: {} runs, avg {:.2}ms, {} slow",
                op.operation,
                op.count,
                op.avg_time_ms,
                op.slow
            );
        }
    }
}

/// Records the elapsed time of one operation on drop
pub struct OperationTimer {
    start: Instant,
    operation: Operation,
    metrics: PerformanceMetrics,
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        self.metrics.record(self.operation, self.start.elapsed());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub operation: &'static str,
    pub count: u64,
    pub avg_time_ms: f64,
    pub slow: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub cache_hit_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub degraded_responses: u64,
    pub operations: Vec<OperationSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = PerformanceMetrics::new();
        assert_eq!(metrics.cache_hit_rate(), 0.0);
        assert_eq!(metrics.avg_time_ms(Operation::CartPricing), 0.0);
    }

    #[test]
    fn test_cache_metrics() {
        let metrics = PerformanceMetrics::new();

        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();

        assert_eq!(metrics.cache_hit_rate(), 2.0 / 3.0);
    }

    #[test]
    fn test_operation_timer_records_once() {
        let metrics = PerformanceMetrics::new();

        {
            let _timer = metrics.start(Operation::EventResolution);
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(metrics.operation_count(Operation::EventResolution), 1);
        assert!(metrics.avg_time_ms(Operation::EventResolution) >= 10.0);
        assert_eq!(metrics.operation_count(Operation::CartPricing), 0);
    }

    #[test]
    fn test_slow_operation_detection() {
        let metrics = PerformanceMetrics::new();

        {
            let _timer = metrics.start(Operation::ShippingCalculation);
            thread::sleep(Duration::from_millis(150));
        }

        let summary = metrics.summary();
        let shipping = summary
            .operations
            .iter()
            .find(|op| op.operation == "shipping calculation")
            .unwrap();
        assert_eq!(shipping.slow, 1);
    }

    #[test]
    fn test_degraded_counter() {
        let metrics = PerformanceMetrics::new();
        metrics.record_degraded();
        assert_eq!(metrics.summary().degraded_responses, 1);
    }
}
