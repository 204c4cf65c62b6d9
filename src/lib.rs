//! A client for sending metrics to a [DogStatsD][dsd]-compatible server.
//!
//! [dsd]: https://docs.datadoghq.com/developers/dogstatsd/
//!
//! # Usage
//!
//! Using the client is straightforward:
//!
//! ```no_run
//! # use dogstatsd_client::DogStatsDClientBuilder;
//! // First, create a builder.
//! //
//! // The builder can configure many aspects of the client, such as the remote address, metric
//! // prefix and constant tags, queue capacity, and idle flushing behavior.
//! let client = DogStatsDClientBuilder::default()
//!     .with_prefix("app.")
//!     .build()
//!     .expect("failed to build client");
//!
//! // Metric sends are fire-and-forget and never block on the network:
//! client.increment("requests", &[]);
//! client.gauge("queue.depth", 42, 1.0, &["env:prod".to_string()]);
//!
//! // Dropping the client drains any queued records before releasing the transport; `flush` does
//! // the same synchronously without shutting down.
//! client.flush();
//! ```
//!
//! # Features
//!
//! ## Non-blocking emission
//!
//! Records are encoded on the calling thread and handed to a bounded queue serviced by a
//! background worker. When the queue is full, records are dropped (and counted in client
//! telemetry) rather than ever blocking the caller.
//!
//! ## Idle flushing
//!
//! Small payloads are batched up to the maximum payload size before being sent. When traffic
//! stops, the worker detects the inactivity and flushes partially filled buffers so records are
//! not held indefinitely.
//!
//! ## Full transport support for Unix domain sockets
//!
//! Metrics can be sent over all three major allowable transports: UDP, and Unix domain sockets in
//! either `SOCK_DGRAM` or `SOCK_STREAM` mode.
//!
//! ## Telemetry
//!
//! The client captures its own internal telemetry around the number of records sent by kind and
//! the number dropped on a full queue, emitted through the [`metrics`] facade.
//!
//! All internal telemetry is under the `datadog.dogstatsd.client` namespace, to align with the
//! internal telemetry emitted by official DogStatsD clients.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod builder;
pub use self::builder::{BuildError, DogStatsDClientBuilder};

mod buffer;
pub use self::buffer::StatsBuffering;

mod client;
pub use self::client::DogStatsDClient;

mod record;
pub use self::record::Record;

mod router;
pub use self::router::{Router, TransportRouter};

mod sender;
pub use self::sender::{Sampler, ThreadRngSampler};

mod serialize;
pub use self::serialize::{
    Event, MetricType, MetricValue, SerializeError, ServiceCheck, ServiceCheckStatus,
};

mod telemetry;
pub use self::telemetry::Telemetry;

mod transport;
pub use self::transport::{Transport, UdpTransport};
#[cfg(target_os = "linux")]
pub use self::transport::{UnixStreamTransport, UnixgramTransport};

mod worker;
pub use self::worker::{Worker, WorkerHandler};
