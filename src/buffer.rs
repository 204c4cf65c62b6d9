use std::{
    io,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::{
    record::Record,
    router::Router,
    worker::{Worker, WorkerHandler},
};

/// Buffers records in a bounded background worker before routing them.
///
/// Producers hand encoded records to [`send`][StatsBuffering::send] without ever waiting on the
/// consumer; the worker routes them in order on its own thread, and converts sustained inactivity
/// into router idle callbacks so partially filled downstream buffers still go out when traffic
/// stops.
pub struct StatsBuffering {
    worker: Worker<BufferingHandler>,
}

impl StatsBuffering {
    /// Creates the buffering pipeline and spawns its worker.
    ///
    /// `max_queue_items` bounds how many records may be queued, `dequeue_timeout` is the worker's
    /// idle poll interval, and `max_idle_wait` is how long traffic must be absent before the
    /// router's idle callback starts firing. The router (and handler) only need to be safe for
    /// concurrent invocation when `worker_threads` is greater than one; with one thread, routing
    /// is strictly FIFO.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread(s) could not be spawned.
    pub fn new(
        router: Box<dyn Router>,
        worker_threads: usize,
        max_queue_items: usize,
        dequeue_timeout: Option<Duration>,
        max_idle_wait: Duration,
    ) -> io::Result<Self> {
        let handler = BufferingHandler {
            router,
            max_idle_wait,
            idle_since: Mutex::new(None),
        };

        let worker = Worker::spawn(handler, worker_threads, max_queue_items, dequeue_timeout)?;
        Ok(StatsBuffering { worker })
    }

    /// Hands a record to the worker queue.
    ///
    /// Returns `false` if the queue is at capacity (or shut down); the record is released
    /// immediately in that case. Never waits on the consumer.
    pub fn send(&self, record: Record) -> bool {
        match self.worker.try_enqueue(record) {
            Ok(()) => true,
            Err(record) => {
                // The queue rejected it, so the record is released here, exactly once.
                drop(record);
                false
            }
        }
    }

    /// Blocks until all currently queued records have been routed and the router has flushed.
    pub fn flush(&self) {
        self.worker.flush();
    }

    /// Drains and stops the worker. Idempotent.
    pub fn shutdown(&self) {
        self.worker.shutdown();
    }
}

struct BufferingHandler {
    router: Box<dyn Router>,
    max_idle_wait: Duration,

    // Owned by the consumer side: producers never touch this. `None` while traffic is flowing.
    // The mutex only exists to satisfy the multi-consumer configuration.
    idle_since: Mutex<Option<Instant>>,
}

impl WorkerHandler for BufferingHandler {
    type Value = Record;

    fn on_new_value(&self, record: Record) -> io::Result<()> {
        // The record lives exactly as long as this scope: whether routing succeeds or fails, it
        // is released on exit.
        let result = self.router.route(&record);

        *self.idle_since.lock().unwrap_or_else(PoisonError::into_inner) = None;
        result
    }

    fn on_idle(&self) -> io::Result<bool> {
        let mut idle_since = self.idle_since.lock().unwrap_or_else(PoisonError::into_inner);
        let idle_start = idle_since.get_or_insert_with(Instant::now);

        if idle_start.elapsed() > self.max_idle_wait {
            // The timestamp is deliberately not reset: once the threshold is crossed, the router
            // is notified on every poll until new traffic arrives.
            self.router.on_idle()?;
        }

        Ok(true)
    }

    fn flush(&self) -> io::Result<()> {
        self.router.flush()
    }
}
