use std::{env, sync::Arc, time::Instant};

use rand::Rng;
use tracing::debug;

use crate::{
    buffer::StatsBuffering,
    record::Record,
    serialize::{self, Event, MetricType, MetricValue, SerializeError, ServiceCheck},
    telemetry::Telemetry,
};

const ENTITY_ID_ENV_VAR: &str = "DD_ENTITY_ID";
const ENTITY_ID_TAG_KEY: &str = "dd.internal.entity_id";

/// Decides whether a sampled metric call is actually emitted.
///
/// Injected as a capability so deterministic implementations can be substituted in tests.
pub trait Sampler: Send + Sync {
    /// Returns `true` if a call sampled at `sample_rate` should be emitted.
    fn should_send(&self, sample_rate: f64) -> bool;
}

/// Sampler backed by the thread-local random number generator.
pub struct ThreadRngSampler;

impl Sampler for ThreadRngSampler {
    fn should_send(&self, sample_rate: f64) -> bool {
        sample_rate >= 1.0 || rand::rng().random::<f64>() < sample_rate
    }
}

/// The send surface: encodes requests and hands the resulting records to the buffering pipeline.
///
/// Emission is fire-and-forget: queue-full conditions are reflected in telemetry and a debug log,
/// never surfaced to the caller. Only encoding and validation errors propagate, and only for
/// events and service checks.
pub(crate) struct MetricsSender {
    buffering: Arc<StatsBuffering>,
    sampler: Box<dyn Sampler>,
    telemetry: Option<Arc<Telemetry>>,
    prefix: String,
    constant_tags: Vec<String>,
    truncate_if_too_long: bool,
}

impl MetricsSender {
    /// Creates a sender.
    ///
    /// The `DD_ENTITY_ID` environment variable is read here, once: a non-empty value appends a
    /// `dd.internal.entity_id` constant tag after the user-supplied ones. The configured tag set
    /// is immutable afterwards.
    pub fn new(
        buffering: Arc<StatsBuffering>,
        sampler: Box<dyn Sampler>,
        telemetry: Option<Arc<Telemetry>>,
        prefix: String,
        constant_tags: Vec<String>,
        truncate_if_too_long: bool,
    ) -> Self {
        let entity_id = env::var(ENTITY_ID_ENV_VAR).ok();
        Self::with_entity_id(
            buffering,
            sampler,
            telemetry,
            prefix,
            constant_tags,
            truncate_if_too_long,
            entity_id,
        )
    }

    fn with_entity_id(
        buffering: Arc<StatsBuffering>,
        sampler: Box<dyn Sampler>,
        telemetry: Option<Arc<Telemetry>>,
        prefix: String,
        mut constant_tags: Vec<String>,
        truncate_if_too_long: bool,
        entity_id: Option<String>,
    ) -> Self {
        if let Some(entity_id) = entity_id.filter(|id| !id.is_empty()) {
            constant_tags.push(format!("{ENTITY_ID_TAG_KEY}:{entity_id}"));
        }

        MetricsSender {
            buffering,
            sampler,
            telemetry,
            prefix,
            constant_tags,
            truncate_if_too_long,
        }
    }

    /// Encodes and enqueues a metric, subject to sampling.
    pub fn send_metric(
        &self,
        metric_type: MetricType,
        name: &str,
        value: MetricValue,
        sample_rate: f64,
        tags: &[String],
    ) {
        if !self.sampler.should_send(sample_rate) {
            return;
        }

        let line = serialize::metric_line(
            &self.prefix,
            name,
            metric_type,
            &value,
            sample_rate,
            &self.constant_tags,
            tags,
        );
        self.enqueue(Record::new(line));

        if let Some(telemetry) = &self.telemetry {
            telemetry.on_metric_sent();
        }
    }

    /// Encodes and enqueues an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoded event exceeds the maximum payload size and truncation is
    /// not permitted (or insufficient).
    pub fn send_event(
        &self,
        event: &Event<'_>,
        tags: &[String],
        truncate_if_too_long: bool,
    ) -> Result<(), SerializeError> {
        let truncate = truncate_if_too_long || self.truncate_if_too_long;
        let line = serialize::event_line(event, &self.constant_tags, tags, truncate)?;
        self.enqueue(Record::new(line));

        if let Some(telemetry) = &self.telemetry {
            telemetry.on_event_sent();
        }

        Ok(())
    }

    /// Encodes and enqueues a service check.
    ///
    /// # Errors
    ///
    /// Returns an error if the name contains a pipe character, or if the encoded check exceeds
    /// the maximum payload size and the message cannot absorb the truncation.
    pub fn send_service_check(
        &self,
        check: &ServiceCheck<'_>,
        tags: &[String],
        truncate_if_too_long: bool,
    ) -> Result<(), SerializeError> {
        let truncate = truncate_if_too_long || self.truncate_if_too_long;
        let line = serialize::service_check_line(check, &self.constant_tags, tags, truncate)?;
        self.enqueue(Record::new(line));

        if let Some(telemetry) = &self.telemetry {
            telemetry.on_service_check_sent();
        }

        Ok(())
    }

    /// Runs `f`, measuring its wall-clock duration and emitting it as a timing metric.
    ///
    /// The duration is recorded even if `f` panics; the panic then propagates unchanged.
    pub fn time<F, T>(&self, f: F, name: &str, sample_rate: f64, tags: &[String]) -> T
    where
        F: FnOnce() -> T,
    {
        let _guard = TimingGuard { sender: self, name, sample_rate, tags, start: Instant::now() };
        f()
    }

    fn enqueue(&self, record: Record) {
        if !self.buffering.send(record) {
            debug!("Metrics queue is full, dropping record.");
            if let Some(telemetry) = &self.telemetry {
                telemetry.on_record_dropped_queue();
            }
        }
    }
}

struct TimingGuard<'a> {
    sender: &'a MetricsSender,
    name: &'a str,
    sample_rate: f64,
    tags: &'a [String],
    start: Instant,
}

impl Drop for TimingGuard<'_> {
    fn drop(&mut self) {
        // Runs on both return and unwind, so the timing is emitted no matter how the measured
        // closure exits.
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        self.sender.send_metric(
            MetricType::Timing,
            self.name,
            MetricValue::Unsigned(elapsed_ms),
            self.sample_rate,
            self.tags,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        panic::{catch_unwind, AssertUnwindSafe},
        sync::Mutex,
        time::Duration,
    };

    use crate::router::Router;

    use super::*;

    #[derive(Default)]
    struct CapturingRouter {
        lines: Mutex<Vec<String>>,
    }

    impl Router for Arc<CapturingRouter> {
        fn route(&self, record: &Record) -> io::Result<()> {
            self.lines.lock().unwrap().push(record.as_str().to_string());
            Ok(())
        }

        fn on_idle(&self) -> io::Result<()> {
            Ok(())
        }

        fn flush(&self) -> io::Result<()> {
            Ok(())
        }
    }

    struct NeverSampler;

    impl Sampler for NeverSampler {
        fn should_send(&self, _sample_rate: f64) -> bool {
            false
        }
    }

    fn sender_with(
        prefix: &str,
        constant_tags: &[&str],
        entity_id: Option<&str>,
    ) -> (MetricsSender, Arc<StatsBuffering>, Arc<CapturingRouter>) {
        let router = Arc::new(CapturingRouter::default());
        let buffering = Arc::new(
            StatsBuffering::new(
                Box::new(Arc::clone(&router)),
                1,
                1024,
                Some(Duration::from_millis(50)),
                Duration::from_secs(60),
            )
            .expect("failed to spawn buffering worker"),
        );

        let sender = MetricsSender::with_entity_id(
            Arc::clone(&buffering),
            Box::new(ThreadRngSampler),
            None,
            prefix.to_string(),
            constant_tags.iter().map(|s| (*s).to_string()).collect(),
            false,
            entity_id.map(str::to_string),
        );

        (sender, buffering, router)
    }

    fn routed_lines(buffering: &StatsBuffering, router: &CapturingRouter) -> Vec<String> {
        buffering.flush();
        router.lines.lock().unwrap().clone()
    }

    #[test]
    fn metric_applies_prefix_and_tags() {
        let (sender, buffering, router) = sender_with("app.", &["env:prod"], None);

        sender.send_metric(
            MetricType::Count,
            "hits",
            MetricValue::Signed(5),
            1.0,
            &["host:a".to_string()],
        );

        assert_eq!(
            routed_lines(&buffering, &router),
            vec!["app.hits:5|c|#env:prod,host:a".to_string()]
        );
    }

    #[test]
    fn sampled_out_metric_is_not_sent() {
        let (sender, buffering, router) = sender_with("", &[], None);
        let sender = MetricsSender {
            sampler: Box::new(NeverSampler),
            ..sender
        };

        sender.send_metric(MetricType::Count, "hits", MetricValue::Signed(1), 0.5, &[]);
        assert!(routed_lines(&buffering, &router).is_empty());
    }

    #[test]
    fn entity_id_tag_is_appended_after_constant_tags() {
        let (sender, buffering, router) = sender_with("", &["env:prod"], Some("pod-abc"));

        sender.send_metric(MetricType::Count, "hits", MetricValue::Signed(1), 1.0, &[]);

        assert_eq!(
            routed_lines(&buffering, &router),
            vec!["hits:1|c|#env:prod,dd.internal.entity_id:pod-abc".to_string()]
        );
    }

    #[test]
    fn empty_entity_id_is_ignored() {
        let (sender, buffering, router) = sender_with("", &[], Some(""));

        sender.send_metric(MetricType::Count, "hits", MetricValue::Signed(1), 1.0, &[]);
        assert_eq!(routed_lines(&buffering, &router), vec!["hits:1|c".to_string()]);
    }

    #[test]
    fn queue_full_drops_are_counted_in_telemetry() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct BlockingRouter {
            release: Arc<AtomicBool>,
        }

        impl Router for BlockingRouter {
            fn route(&self, _record: &Record) -> io::Result<()> {
                while !self.release.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }

            fn on_idle(&self) -> io::Result<()> {
                Ok(())
            }

            fn flush(&self) -> io::Result<()> {
                Ok(())
            }
        }

        let release = Arc::new(AtomicBool::new(false));
        let buffering = Arc::new(
            StatsBuffering::new(
                Box::new(BlockingRouter { release: Arc::clone(&release) }),
                1,
                1,
                Some(Duration::from_millis(10)),
                Duration::from_secs(60),
            )
            .expect("failed to spawn buffering worker"),
        );
        let telemetry = Arc::new(Telemetry::new("udp"));

        let sender = MetricsSender::with_entity_id(
            Arc::clone(&buffering),
            Box::new(ThreadRngSampler),
            Some(Arc::clone(&telemetry)),
            String::new(),
            Vec::new(),
            false,
            None,
        );

        // The consumer stalls on the first record and capacity is 1, so at most two of these are
        // accepted; the rest are dropped and must show up in telemetry.
        for _ in 0..8 {
            sender.send_metric(MetricType::Count, "hits", MetricValue::Signed(1), 1.0, &[]);
        }

        assert!(telemetry.pending_queue_dropped() >= 6);
        assert_eq!(telemetry.pending_metrics_sent(), 8);

        release.store(true, Ordering::Release);
        buffering.shutdown();
    }

    #[test]
    fn event_errors_propagate_synchronously() {
        let (sender, buffering, router) = sender_with("", &[], None);

        let text = "x".repeat(9000);
        let event = Event::new("big", &text);
        assert!(sender.send_event(&event, &[], false).is_err());
        assert!(routed_lines(&buffering, &router).is_empty());
    }

    #[test]
    fn time_emits_timing_metric() {
        let (sender, buffering, router) = sender_with("", &[], None);

        let result = sender.time(|| 42, "op.duration", 1.0, &[]);
        assert_eq!(result, 42);

        let lines = routed_lines(&buffering, &router);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("op.duration:"));
        assert!(lines[0].ends_with("|ms"));
    }

    #[test]
    fn time_emits_even_when_closure_panics() {
        let (sender, buffering, router) = sender_with("", &[], None);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            sender.time(|| -> u32 { panic!("boom") }, "op.duration", 1.0, &[]);
        }));
        assert!(outcome.is_err());

        let lines = routed_lines(&buffering, &router);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("|ms"));
    }
}
