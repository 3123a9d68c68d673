//! Prometheus metrics for the ordering engines.

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts};
use std::sync::OnceLock;

pub(crate) struct Metrics {
    /// Batches formed, labelled by trigger.
    pub batches_formed: IntCounterVec,
    /// Height of the last block handed to the executor.
    pub committed_height: IntGauge,
    /// Transactions currently pooled.
    pub pool_size: IntGauge,
    /// Seconds between consecutive batches.
    pub batch_interval: Histogram,
}

pub(crate) fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(|| {
        let batches_formed = IntCounterVec::new(
            Opts::new("consensus_batches_formed_total", "Batches formed by trigger"),
            &["trigger"],
        )
        .expect("metric opts");
        let committed_height = IntGauge::new(
            "consensus_committed_height",
            "Height of the last block handed to the executor",
        )
        .expect("metric opts");
        let pool_size =
            IntGauge::new("consensus_pool_txs", "Transactions currently pooled").expect("metric opts");
        let batch_interval = Histogram::with_opts(HistogramOpts::new(
            "consensus_batch_interval_seconds",
            "Seconds between consecutive batches",
        ))
        .expect("metric opts");

        let registry = prometheus::default_registry();
        let _ = registry.register(Box::new(batches_formed.clone()));
        let _ = registry.register(Box::new(committed_height.clone()));
        let _ = registry.register(Box::new(pool_size.clone()));
        let _ = registry.register(Box::new(batch_interval.clone()));

        Metrics {
            batches_formed,
            committed_height,
            pool_size,
            batch_interval,
        }
    })
}

/// Trigger label values.
pub(crate) fn trigger_label(trigger: palisade_types::BatchTrigger) -> &'static str {
    match trigger {
        palisade_types::BatchTrigger::Size => "size",
        palisade_types::BatchTrigger::Timeout => "timeout",
        palisade_types::BatchTrigger::NoTxTimeout => "timeout_no_tx",
    }
}
