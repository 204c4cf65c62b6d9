use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, Counter};

macro_rules! _telemetry_tags {
    ($($k:literal => $v:expr),*) => {
        [
            ::metrics::Label::from_static_parts("client", "rust"),
            ::metrics::Label::from_static_parts("client_version", env!("CARGO_PKG_VERSION")),
            $(::metrics::Label::from_static_parts($k, $v),)*
        ]
    };
}

use _telemetry_tags as telemetry_tags;

/// Client telemetry.
///
/// Counts what the client itself is doing: records sent by kind, and records dropped because the
/// queue was full. Counts accumulate locally and are pushed as deltas onto [`metrics`] counters
/// when flushed, under the `datadog.dogstatsd.client` namespace used by official DogStatsD
/// clients.
pub struct Telemetry {
    metrics_sent: AtomicU64,
    events_sent: AtomicU64,
    service_checks_sent: AtomicU64,
    queue_dropped: AtomicU64,

    metrics: Counter,
    events: Counter,
    service_checks: Counter,
    packets_dropped_queue: Counter,
}

impl Telemetry {
    /// Creates a `Telemetry` instance labeled with the given transport identifier.
    pub fn new(transport: &'static str) -> Self {
        let labels = telemetry_tags!("client_transport" => transport);

        Telemetry {
            metrics_sent: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            service_checks_sent: AtomicU64::new(0),
            queue_dropped: AtomicU64::new(0),
            metrics: counter!("datadog.dogstatsd.client.metrics", labels.iter()),
            events: counter!("datadog.dogstatsd.client.events", labels.iter()),
            service_checks: counter!("datadog.dogstatsd.client.service_checks", labels.iter()),
            packets_dropped_queue: counter!(
                "datadog.dogstatsd.client.packets_dropped_queue",
                labels.iter()
            ),
        }
    }

    pub(crate) fn on_metric_sent(&self) {
        self.metrics_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_event_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_service_check_sent(&self) {
        self.service_checks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_record_dropped_queue(&self) {
        self.queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Pushes all accumulated counts onto the underlying counters, resetting the accumulators.
    pub fn flush(&self) {
        self.metrics.increment(self.metrics_sent.swap(0, Ordering::Relaxed));
        self.events.increment(self.events_sent.swap(0, Ordering::Relaxed));
        self.service_checks.increment(self.service_checks_sent.swap(0, Ordering::Relaxed));
        self.packets_dropped_queue.increment(self.queue_dropped.swap(0, Ordering::Relaxed));
    }

    #[cfg(test)]
    pub(crate) fn pending_metrics_sent(&self) -> u64 {
        self.metrics_sent.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn pending_queue_dropped(&self) -> u64 {
        self.queue_dropped.load(Ordering::Relaxed)
    }
}
