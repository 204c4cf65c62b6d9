use std::sync::Arc;

use crate::{
    buffer::StatsBuffering,
    sender::MetricsSender,
    serialize::{Event, MetricType, MetricValue, SerializeError, ServiceCheck},
    telemetry::Telemetry,
    transport::Transport,
};

/// A DogStatsD client.
///
/// Emission is fire-and-forget: metric sends never block the caller beyond a brief internal lock
/// and never fail visibly; only event and service-check encoding errors are surfaced. The client
/// also coordinates the pipeline's lifecycle — [`flush`][DogStatsDClient::flush] synchronously
/// drains buffered records, and dropping (or [`shutdown`][DogStatsDClient::shutdown]) tears the
/// pipeline down in order so no record can reach an already-released transport.
pub struct DogStatsDClient {
    sender: MetricsSender,
    telemetry: Option<Arc<Telemetry>>,
    buffering: Arc<StatsBuffering>,

    // Kept alive so the socket outlives the draining worker; dropped last by field order.
    _transport: Option<Arc<dyn Transport>>,
}

impl DogStatsDClient {
    pub(crate) fn new(
        sender: MetricsSender,
        telemetry: Option<Arc<Telemetry>>,
        buffering: Arc<StatsBuffering>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Self {
        DogStatsDClient { sender, telemetry, buffering, _transport: transport }
    }

    /// Adjusts a count by the given value.
    pub fn count<V: Into<MetricValue>>(
        &self,
        name: &str,
        value: V,
        sample_rate: f64,
        tags: &[String],
    ) {
        self.sender.send_metric(MetricType::Count, name, value.into(), sample_rate, tags);
    }

    /// Increments a count by one.
    pub fn increment(&self, name: &str, tags: &[String]) {
        self.count(name, 1, 1.0, tags);
    }

    /// Decrements a count by one.
    pub fn decrement(&self, name: &str, tags: &[String]) {
        self.count(name, -1, 1.0, tags);
    }

    /// Records the current value of a gauge.
    pub fn gauge<V: Into<MetricValue>>(
        &self,
        name: &str,
        value: V,
        sample_rate: f64,
        tags: &[String],
    ) {
        self.sender.send_metric(MetricType::Gauge, name, value.into(), sample_rate, tags);
    }

    /// Records a value in a histogram.
    pub fn histogram<V: Into<MetricValue>>(
        &self,
        name: &str,
        value: V,
        sample_rate: f64,
        tags: &[String],
    ) {
        self.sender.send_metric(MetricType::Histogram, name, value.into(), sample_rate, tags);
    }

    /// Records a value in a distribution.
    pub fn distribution<V: Into<MetricValue>>(
        &self,
        name: &str,
        value: V,
        sample_rate: f64,
        tags: &[String],
    ) {
        self.sender.send_metric(MetricType::Distribution, name, value.into(), sample_rate, tags);
    }

    /// Records a member of a set.
    pub fn set(&self, name: &str, value: &str, sample_rate: f64, tags: &[String]) {
        self.sender.send_metric(MetricType::Set, name, value.into(), sample_rate, tags);
    }

    /// Records a timing, in milliseconds.
    pub fn timing<V: Into<MetricValue>>(
        &self,
        name: &str,
        value: V,
        sample_rate: f64,
        tags: &[String],
    ) {
        self.sender.send_metric(MetricType::Timing, name, value.into(), sample_rate, tags);
    }

    /// Runs `f`, measuring its wall-clock duration and emitting it as a timing metric.
    ///
    /// The duration is recorded even if `f` panics; the panic then propagates unchanged.
    pub fn time<F, T>(&self, f: F, name: &str, sample_rate: f64, tags: &[String]) -> T
    where
        F: FnOnce() -> T,
    {
        self.sender.time(f, name, sample_rate, tags)
    }

    /// Sends an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoded event exceeds the maximum payload size and truncation is
    /// not permitted (or insufficient).
    pub fn event(
        &self,
        event: &Event<'_>,
        tags: &[String],
        truncate_if_too_long: bool,
    ) -> Result<(), SerializeError> {
        self.sender.send_event(event, tags, truncate_if_too_long)
    }

    /// Sends a service check.
    ///
    /// # Errors
    ///
    /// Returns an error if the name contains a pipe character, or if the encoded check exceeds
    /// the maximum payload size and the message cannot absorb the truncation.
    pub fn service_check(
        &self,
        check: &ServiceCheck<'_>,
        tags: &[String],
        truncate_if_too_long: bool,
    ) -> Result<(), SerializeError> {
        self.sender.send_service_check(check, tags, truncate_if_too_long)
    }

    /// Synchronously flushes all buffered state: the buffering pipeline first, then telemetry.
    pub fn flush(&self) {
        self.buffering.flush();

        if let Some(telemetry) = &self.telemetry {
            telemetry.flush();
        }
    }

    /// Tears the pipeline down in order: telemetry first, then the buffering worker (draining any
    /// queued records), with the transport released last when the client itself is dropped.
    ///
    /// Safe to call more than once; `Drop` performs the same teardown.
    pub fn shutdown(&self) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.flush();
        }

        self.buffering.shutdown();
    }
}

impl Drop for DogStatsDClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
