use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    buffer::StatsBuffering,
    client::DogStatsDClient,
    router::{Router, TransportRouter},
    sender::{MetricsSender, Sampler, ThreadRngSampler},
    telemetry::Telemetry,
    transport::{self, RemoteAddr, Transport},
};

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_PAYLOAD_LEN: usize = 8192;
const DEFAULT_QUEUE_CAPACITY: usize = 100_000;
const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_MAX_IDLE_WAIT: Duration = Duration::from_secs(2);

/// Errors that could occur while building a DogStatsD client.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// Failed to connect the transport to the remote address.
    #[error("failed to connect transport: {source}")]
    Transport {
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Failed to spawn the background worker thread(s).
    #[error("failed to spawn background worker thread")]
    Backend,
}

/// Builder for a DogStatsD client.
pub struct DogStatsDClientBuilder {
    remote_addr: RemoteAddr,
    write_timeout: Duration,
    max_payload_len: usize,
    prefix: String,
    constant_tags: Vec<String>,
    queue_capacity: usize,
    dequeue_timeout: Option<Duration>,
    max_idle_wait: Duration,
    worker_threads: usize,
    telemetry: bool,
    truncate_if_too_long: bool,
    sampler: Box<dyn Sampler>,
}

impl DogStatsDClientBuilder {
    /// Set the remote address to send metrics to.
    ///
    /// For UDP, the address simply needs to be in the format of `<host>:<port>`. For Unix domain
    /// sockets, an address in the format of `<scheme>://<path>`. The scheme can be either `unix`
    /// or `unixgram`, for a stream (`SOCK_STREAM`) or datagram (`SOCK_DGRAM`) socket,
    /// respectively.
    ///
    /// Defaults to sending to `127.0.0.1:8125` over UDP.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be
    /// returned indicating the reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.remote_addr = RemoteAddr::try_from(addr.as_ref())
            .map_err(|reason| BuildError::InvalidRemoteAddress { reason })?;
        Ok(self)
    }

    /// Set the write timeout for sending payloads.
    ///
    /// When the write timeout is reached, the payload being sent at the time is dropped without
    /// retrying.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the maximum payload length for outgoing packets.
    ///
    /// This should generally be set to the same value (or lower) as the receive buffer size of
    /// the server; larger payloads are likely to be discarded on the other end.
    ///
    /// Defaults to 8192 bytes.
    #[must_use]
    pub fn with_maximum_payload_length(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    /// Set the prefix prepended verbatim to every metric name.
    ///
    /// Include a trailing separator if one is desired, e.g. `"app."`.
    ///
    /// Defaults to no prefix.
    #[must_use]
    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the constant tags attached to every record emitted by this client.
    ///
    /// If the `DD_ENTITY_ID` environment variable is set and non-empty when the client is built,
    /// a `dd.internal.entity_id` tag is appended after these.
    ///
    /// Defaults to no constant tags.
    #[must_use]
    pub fn with_constant_tags(mut self, constant_tags: Vec<String>) -> Self {
        self.constant_tags = constant_tags;
        self
    }

    /// Set the maximum number of records that may be queued for the background worker.
    ///
    /// When the queue is full, further records are dropped (and counted in client telemetry)
    /// rather than blocking the caller.
    ///
    /// Defaults to 100,000 records.
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Set the worker's dequeue poll interval, which drives idle detection.
    ///
    /// With `None`, the worker blocks until a record arrives and idle detection is disabled.
    ///
    /// Defaults to 100 milliseconds.
    #[must_use]
    pub fn with_dequeue_timeout(mut self, dequeue_timeout: Option<Duration>) -> Self {
        self.dequeue_timeout = dequeue_timeout;
        self
    }

    /// Set how long traffic must be absent before partially filled buffers are flushed.
    ///
    /// Once this threshold is crossed, the flush fires on every poll interval until new traffic
    /// arrives.
    ///
    /// Defaults to 2 seconds.
    #[must_use]
    pub fn with_max_idle_wait(mut self, max_idle_wait: Duration) -> Self {
        self.max_idle_wait = max_idle_wait;
        self
    }

    /// Set the number of background worker threads.
    ///
    /// With more than one thread, records are no longer routed in strict FIFO order and the
    /// router must tolerate concurrent invocation.
    ///
    /// Defaults to 1.
    #[must_use]
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Sets whether or not to collect client telemetry.
    ///
    /// When enabled, counters describing the client's own behavior (records sent by kind, records
    /// dropped on a full queue) are emitted through the [`metrics`] facade under the
    /// `datadog.dogstatsd.client` namespace.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Sets whether oversized events and service checks are truncated by default.
    ///
    /// Individual send calls can still opt in to truncation explicitly.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_truncate_if_too_long(mut self, truncate_if_too_long: bool) -> Self {
        self.truncate_if_too_long = truncate_if_too_long;
        self
    }

    /// Set the sampler deciding whether sampled metric calls are emitted.
    ///
    /// Defaults to a thread-local RNG sampler.
    #[must_use]
    pub fn with_sampler(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Builds the client, connecting a transport to the configured remote address.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be connected or the background worker thread(s)
    /// cannot be spawned.
    pub fn build(self) -> Result<DogStatsDClient, BuildError> {
        let transport = transport::connect(&self.remote_addr, self.write_timeout)
            .map_err(|source| BuildError::Transport { source })?;
        let router = TransportRouter::new(Arc::clone(&transport), self.max_payload_len);
        self.assemble(Box::new(router), Some(transport))
    }

    /// Builds the client around a caller-provided router, bypassing transport construction.
    ///
    /// # Errors
    ///
    /// Returns an error if the background worker thread(s) cannot be spawned.
    pub fn build_with_router(self, router: Box<dyn Router>) -> Result<DogStatsDClient, BuildError> {
        self.assemble(router, None)
    }

    fn assemble(
        self,
        router: Box<dyn Router>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<DogStatsDClient, BuildError> {
        let telemetry = if self.telemetry {
            let transport_id = transport.as_ref().map_or("custom", |t| t.transport_id());
            Some(Arc::new(Telemetry::new(transport_id)))
        } else {
            None
        };

        let buffering = Arc::new(
            StatsBuffering::new(
                router,
                self.worker_threads,
                self.queue_capacity,
                self.dequeue_timeout,
                self.max_idle_wait,
            )
            .map_err(|_| BuildError::Backend)?,
        );

        let sender = MetricsSender::new(
            Arc::clone(&buffering),
            self.sampler,
            telemetry.clone(),
            self.prefix,
            self.constant_tags,
            self.truncate_if_too_long,
        );

        Ok(DogStatsDClient::new(sender, telemetry, buffering, transport))
    }
}

impl Default for DogStatsDClientBuilder {
    fn default() -> Self {
        DogStatsDClientBuilder {
            remote_addr: RemoteAddr::Udp(vec![SocketAddr::from(([127, 0, 0, 1], 8125))]),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            prefix: String::new(),
            constant_tags: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dequeue_timeout: Some(DEFAULT_DEQUEUE_TIMEOUT),
            max_idle_wait: DEFAULT_MAX_IDLE_WAIT,
            worker_threads: 1,
            telemetry: true,
            truncate_if_too_long: false,
            sampler: Box::new(ThreadRngSampler),
        }
    }
}
