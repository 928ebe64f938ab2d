//! Prometheus metrics for the engine.
//!
//! Each instance owns its registry so tests can build engines freely without
//! colliding in the process-global default registry.

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    /// Committed on-hand mutations.
    pub mutations_total: IntCounter,

    /// Reservations created.
    pub reservations_created_total: IntCounter,

    /// Reservations confirmed.
    pub reservations_confirmed_total: IntCounter,

    /// Reservations cancelled by a caller.
    pub reservations_cancelled_total: IntCounter,

    /// Reservations expired by the sweeper.
    pub reservations_expired_total: IntCounter,

    /// Optimistic-lock misses surfaced to callers.
    pub version_conflicts_total: IntCounter,

    /// Outbound publishes that failed after a committed write.
    pub publish_failures_total: IntCounter,

    /// Releases that found `reserved` below the item quantity.
    pub release_shortfall_total: IntCounter,

    /// Inbound bus events consumed.
    pub events_consumed_total: IntCounter,

    /// Inbound events dropped as duplicates.
    pub events_deduplicated_total: IntCounter,

    /// Sweep pass duration.
    pub sweep_duration: Histogram,

    pub registry: Arc<Registry>,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let mutations_total = IntCounter::with_opts(Opts::new(
            "inventory_mutations_total",
            "Committed on-hand mutations",
        ))?;
        registry.register(Box::new(mutations_total.clone()))?;

        let reservations_created_total = IntCounter::with_opts(Opts::new(
            "inventory_reservations_created_total",
            "Reservations created",
        ))?;
        registry.register(Box::new(reservations_created_total.clone()))?;

        let reservations_confirmed_total = IntCounter::with_opts(Opts::new(
            "inventory_reservations_confirmed_total",
            "Reservations confirmed",
        ))?;
        registry.register(Box::new(reservations_confirmed_total.clone()))?;

        let reservations_cancelled_total = IntCounter::with_opts(Opts::new(
            "inventory_reservations_cancelled_total",
            "Reservations cancelled by callers",
        ))?;
        registry.register(Box::new(reservations_cancelled_total.clone()))?;

        let reservations_expired_total = IntCounter::with_opts(Opts::new(
            "inventory_reservations_expired_total",
            "Reservations expired by the sweeper",
        ))?;
        registry.register(Box::new(reservations_expired_total.clone()))?;

        let version_conflicts_total = IntCounter::with_opts(Opts::new(
            "inventory_version_conflicts_total",
            "Optimistic-lock misses",
        ))?;
        registry.register(Box::new(version_conflicts_total.clone()))?;

        let publish_failures_total = IntCounter::with_opts(Opts::new(
            "inventory_publish_failures_total",
            "Outbound publish failures after commit",
        ))?;
        registry.register(Box::new(publish_failures_total.clone()))?;

        let release_shortfall_total = IntCounter::with_opts(Opts::new(
            "inventory_release_shortfall_total",
            "Releases that found reserved below the held quantity",
        ))?;
        registry.register(Box::new(release_shortfall_total.clone()))?;

        let events_consumed_total = IntCounter::with_opts(Opts::new(
            "inventory_events_consumed_total",
            "Inbound bus events consumed",
        ))?;
        registry.register(Box::new(events_consumed_total.clone()))?;

        let events_deduplicated_total = IntCounter::with_opts(Opts::new(
            "inventory_events_deduplicated_total",
            "Inbound events dropped as duplicates",
        ))?;
        registry.register(Box::new(events_deduplicated_total.clone()))?;

        let sweep_duration = Histogram::with_opts(
            HistogramOpts::new("inventory_sweep_duration_seconds", "Sweep pass duration")
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(sweep_duration.clone()))?;

        Ok(Self {
            mutations_total,
            reservations_created_total,
            reservations_confirmed_total,
            reservations_cancelled_total,
            reservations_expired_total,
            version_conflicts_total,
            publish_failures_total,
            release_shortfall_total,
            events_consumed_total,
            events_deduplicated_total,
            sweep_duration,
            registry,
        })
    }

    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&self.registry.gather())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("failed to create metrics")
    }
}
