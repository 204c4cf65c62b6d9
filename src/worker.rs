use std::{
    collections::VecDeque,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error};

/// A consumer of values dequeued by a [`Worker`].
///
/// This is a small capability set rather than a base class: one concrete handler exists per worker
/// instantiation. A handler must be safe for concurrent invocation when the worker is configured
/// with more than one consumer thread, which is what the `Sync` bound encodes. With a single
/// consumer thread, invocations are strictly serialized and arrive in enqueue order.
pub trait WorkerHandler: Send + Sync + 'static {
    /// The type of value processed by this handler.
    type Value: Send + 'static;

    /// Processes a single dequeued value.
    ///
    /// Errors (and panics) are logged by the consumer loop and the value is considered processed:
    /// it is never redelivered and the loop continues.
    fn on_new_value(&self, value: Self::Value) -> io::Result<()>;

    /// Called when a dequeue attempt times out with no value available.
    ///
    /// Returns `true` to keep the consumer loop running, or `false` to stop this consumer.
    fn on_idle(&self) -> io::Result<bool>;

    /// Called when a flush marker is dequeued, after all values enqueued before it have been
    /// processed.
    fn flush(&self) -> io::Result<()>;
}

enum Item<T> {
    Value(T),

    // Carries the per-call acknowledgement channel for `Worker::flush`.
    Flush(Sender<()>),
}

struct QueueState<T> {
    items: VecDeque<Item<T>>,

    // Number of `Item::Value` entries in `items`. Flush markers never count against capacity, so
    // a flush can always be injected even when the queue is full.
    records: usize,

    shutdown: bool,
}

struct Shared<H: WorkerHandler> {
    handler: H,
    queue: Mutex<QueueState<H::Value>>,
    not_empty: Condvar,
    max_items: usize,
    dequeue_timeout: Option<Duration>,
}

impl<H: WorkerHandler> Shared<H> {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState<H::Value>> {
        // The queue mutex is never held across handler calls, so a poisoned lock still guards a
        // consistent queue.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A bounded multi-producer queue drained by dedicated background consumer threads.
///
/// The worker decouples producer threads from a consumer loop while bounding memory: enqueueing
/// never waits on the consumer, enqueue order equals dequeue order, and enqueueing beyond capacity
/// is rejected rather than blocking or displacing an accepted value. A dequeue timeout drives idle
/// detection through [`WorkerHandler::on_idle`], and [`flush`][Worker::flush] provides a
/// synchronous drain observed in FIFO order relative to already-queued values.
pub struct Worker<H: WorkerHandler> {
    shared: Arc<Shared<H>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: WorkerHandler> Worker<H> {
    /// Creates a worker and spawns its consumer thread(s).
    ///
    /// `max_items` bounds the number of queued values, and `dequeue_timeout` controls how long a
    /// consumer waits for a value before invoking the handler's idle callback. With no timeout,
    /// consumers block until a value arrives and idle detection is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if a consumer thread could not be spawned.
    pub fn spawn(
        handler: H,
        threads: usize,
        max_items: usize,
        dequeue_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            handler,
            queue: Mutex::new(QueueState { items: VecDeque::new(), records: 0, shutdown: false }),
            not_empty: Condvar::new(),
            max_items,
            dequeue_timeout,
        });

        let mut handles = Vec::with_capacity(threads.max(1));
        for idx in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("dogstatsd-client-worker-{idx}"))
                .spawn(move || consumer_loop(&shared))?;
            handles.push(handle);
        }

        Ok(Worker { shared, threads: Mutex::new(handles) })
    }

    /// Attempts to enqueue a value without blocking.
    ///
    /// Returns the value back to the caller if the queue is at capacity or the worker has been
    /// shut down; the caller then owns it again and is responsible for releasing it. On success,
    /// ownership transfers to the queue. This only ever waits on the queue's internal lock, never
    /// on the consumer.
    pub fn try_enqueue(&self, value: H::Value) -> Result<(), H::Value> {
        {
            let mut queue = self.shared.lock_queue();
            if queue.shutdown || queue.records >= self.shared.max_items {
                return Err(value);
            }

            queue.items.push_back(Item::Value(value));
            queue.records += 1;
        }

        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until every value enqueued before this call has been processed and the handler's
    /// flush has run.
    ///
    /// The flush marker is observed in FIFO order relative to already-queued values and does not
    /// consume queue capacity, so flushing a full queue cannot deadlock. Values enqueued
    /// concurrently with this call may be processed before or after the flush. Returns immediately
    /// if the worker has already been shut down.
    pub fn flush(&self) {
        let (tx, rx) = bounded(1);

        {
            let mut queue = self.shared.lock_queue();
            if queue.shutdown {
                return;
            }

            queue.items.push_back(Item::Flush(tx));
        }

        self.shared.not_empty.notify_all();

        // The consumer drains every queued item before exiting, so the acknowledgement arrives
        // even if a shutdown races with this flush.
        let _ = rx.recv();
    }

    /// Signals the consumer thread(s) to stop after draining all queued work, and joins them.
    ///
    /// No value enqueued before this call is lost. Calling this more than once has no additional
    /// effect.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.lock_queue();
            if queue.shutdown {
                debug!("Worker already shut down.");
            }
            queue.shutdown = true;
        }

        self.shared.not_empty.notify_all();

        let handles = {
            let mut threads =
                self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *threads)
        };

        for handle in handles {
            if handle.join().is_err() {
                error!("Worker consumer thread panicked.");
            }
        }
    }
}

impl<H: WorkerHandler> Drop for Worker<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consumer_loop<H: WorkerHandler>(shared: &Shared<H>) {
    loop {
        let dequeued = match next_item(shared) {
            Some(dequeued) => dequeued,
            // Shut down and fully drained.
            None => return,
        };

        // Handler panics are caught here: a dead consumer would leave queued flush markers
        // unacknowledged, hanging every `Worker::flush` caller forever.
        match dequeued {
            Some(Item::Value(value)) => {
                match panic::catch_unwind(AssertUnwindSafe(|| shared.handler.on_new_value(value))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "Failed to process queued record."),
                    Err(_) => error!("Handler panicked while processing a record."),
                }
            }
            Some(Item::Flush(ack)) => {
                match panic::catch_unwind(AssertUnwindSafe(|| shared.handler.flush())) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "Failed to flush handler."),
                    Err(_) => error!("Handler panicked while flushing."),
                }

                // The flush caller may have given up waiting; that's fine.
                let _ = ack.send(());
            }
            // Dequeue timed out with nothing available.
            None => match panic::catch_unwind(AssertUnwindSafe(|| shared.handler.on_idle())) {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    debug!("Handler requested consumer stop.");
                    return;
                }
                Ok(Err(e)) => error!(error = %e, "Handler idle callback failed."),
                Err(_) => error!("Handler panicked in idle callback."),
            },
        }
    }
}

// Returns `None` once the worker is shut down and the queue is drained, `Some(None)` when the
// dequeue timed out, and `Some(Some(item))` otherwise.
fn next_item<H: WorkerHandler>(shared: &Shared<H>) -> Option<Option<Item<H::Value>>> {
    let mut queue = shared.lock_queue();

    loop {
        if let Some(item) = queue.items.pop_front() {
            if matches!(item, Item::Value(_)) {
                queue.records -= 1;
            }
            return Some(Some(item));
        }

        if queue.shutdown {
            return None;
        }

        match shared.dequeue_timeout {
            Some(timeout) => {
                let (guard, result) = shared
                    .not_empty
                    .wait_timeout(queue, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
                queue = guard;

                if result.timed_out() && queue.items.is_empty() && !queue.shutdown {
                    return Some(None);
                }
            }
            None => {
                queue = shared
                    .not_empty
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Instant,
    };

    use super::*;

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[derive(Default)]
    struct CollectingHandler {
        values: Mutex<Vec<u32>>,
        idle_polls: AtomicUsize,
        flushes: AtomicUsize,
        stop_on_idle: AtomicBool,
        fail_values: AtomicBool,
        panic_on_values: AtomicBool,
    }

    impl WorkerHandler for Arc<CollectingHandler> {
        type Value = u32;

        fn on_new_value(&self, value: u32) -> io::Result<()> {
            if self.panic_on_values.load(Ordering::Relaxed) {
                panic!("induced panic");
            }

            if self.fail_values.load(Ordering::Relaxed) {
                return Err(io::Error::new(io::ErrorKind::Other, "induced failure"));
            }

            self.values.lock().unwrap().push(value);
            Ok(())
        }

        fn on_idle(&self) -> io::Result<bool> {
            self.idle_polls.fetch_add(1, Ordering::Relaxed);
            Ok(!self.stop_on_idle.load(Ordering::Relaxed))
        }

        fn flush(&self) -> io::Result<()> {
            self.flushes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn spawn_collecting(
        max_items: usize,
        dequeue_timeout: Option<Duration>,
    ) -> (Worker<Arc<CollectingHandler>>, Arc<CollectingHandler>) {
        let handler = Arc::new(CollectingHandler::default());
        let worker = Worker::spawn(Arc::clone(&handler), 1, max_items, dequeue_timeout)
            .expect("failed to spawn worker");
        (worker, handler)
    }

    #[test]
    fn processes_in_enqueue_order() {
        let (worker, handler) = spawn_collecting(128, Some(Duration::from_millis(10)));

        for value in 0..100 {
            assert!(worker.try_enqueue(value).is_ok());
        }

        worker.flush();

        let values = handler.values.lock().unwrap();
        assert_eq!(*values, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn enqueue_after_shutdown_returns_value_unchanged() {
        let handler = Arc::new(CollectingHandler::default());
        let worker = Worker::spawn(Arc::clone(&handler), 1, 2, Some(Duration::from_millis(10)))
            .expect("failed to spawn worker");
        worker.shutdown();

        assert_eq!(worker.try_enqueue(1), Err(1));
        assert!(handler.values.lock().unwrap().is_empty());
    }

    #[test]
    fn capacity_is_enforced() {
        struct GatedHandler {
            release: Arc<AtomicBool>,
            processed: AtomicUsize,
        }

        impl WorkerHandler for GatedHandler {
            type Value = u32;

            fn on_new_value(&self, _value: u32) -> io::Result<()> {
                while !self.release.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
                self.processed.fetch_add(1, Ordering::Release);
                Ok(())
            }

            fn on_idle(&self) -> io::Result<bool> {
                Ok(true)
            }

            fn flush(&self) -> io::Result<()> {
                Ok(())
            }
        }

        let release = Arc::new(AtomicBool::new(false));
        let handler = GatedHandler { release: Arc::clone(&release), processed: AtomicUsize::new(0) };
        let worker = Worker::spawn(handler, 1, 4, Some(Duration::from_millis(10)))
            .expect("failed to spawn worker");

        // The consumer stalls on the first value; one value may be in flight, so at most
        // capacity + 1 enqueues can succeed before rejection starts.
        let mut accepted = 0;
        let mut rejected = 0;
        for value in 0..32 {
            match worker.try_enqueue(value) {
                Ok(()) => accepted += 1,
                Err(returned) => {
                    assert_eq!(returned, value);
                    rejected += 1;
                }
            }
        }

        assert!(accepted <= 5, "accepted {accepted} values with capacity 4");
        assert!(rejected > 0);

        release.store(true, Ordering::Release);
        worker.flush();
    }

    #[test]
    fn flush_waits_for_prior_records_then_flushes_handler() {
        let (worker, handler) = spawn_collecting(128, Some(Duration::from_millis(50)));

        for value in 0..10 {
            assert!(worker.try_enqueue(value).is_ok());
        }

        worker.flush();

        assert_eq!(handler.values.lock().unwrap().len(), 10);
        assert_eq!(handler.flushes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn flush_on_full_queue_does_not_deadlock() {
        let handler = Arc::new(CollectingHandler::default());
        let worker = Worker::spawn(Arc::clone(&handler), 1, 1, Some(Duration::from_millis(10)))
            .expect("failed to spawn worker");

        // Keep the queue saturated while flushing. The flush marker bypasses the capacity check,
        // so this completes regardless of how full the queue is.
        for value in 0..64 {
            let _ = worker.try_enqueue(value);
            worker.flush();
        }

        assert!(handler.flushes.load(Ordering::Relaxed) >= 64);
    }

    #[test]
    fn idle_polls_fire_on_dequeue_timeout() {
        let (worker, handler) = spawn_collecting(16, Some(Duration::from_millis(5)));

        let deadline = Instant::now() + Duration::from_secs(2);
        while handler.idle_polls.load(Ordering::Relaxed) < 3 {
            assert!(Instant::now() < deadline, "idle callback never fired");
            thread::sleep(Duration::from_millis(5));
        }

        worker.shutdown();
    }

    #[test]
    fn idle_false_stops_consumer() {
        let handler = Arc::new(CollectingHandler::default());
        handler.stop_on_idle.store(true, Ordering::Relaxed);

        let worker = Worker::spawn(Arc::clone(&handler), 1, 16, Some(Duration::from_millis(5)))
            .expect("failed to spawn worker");

        let deadline = Instant::now() + Duration::from_secs(2);
        while handler.idle_polls.load(Ordering::Relaxed) == 0 {
            assert!(Instant::now() < deadline, "idle callback never fired");
            thread::sleep(Duration::from_millis(5));
        }

        // The consumer stopped after the first idle poll; shutdown still joins cleanly.
        worker.shutdown();
        assert_eq!(handler.idle_polls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn shutdown_drains_queued_values() {
        let (worker, handler) = spawn_collecting(1024, Some(Duration::from_millis(50)));

        for value in 0..500 {
            assert!(worker.try_enqueue(value).is_ok());
        }

        worker.shutdown();

        let values = handler.values.lock().unwrap();
        assert_eq!(*values, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (worker, handler) = spawn_collecting(16, Some(Duration::from_millis(5)));

        assert!(worker.try_enqueue(1).is_ok());
        worker.shutdown();
        worker.shutdown();

        assert_eq!(*handler.values.lock().unwrap(), vec![1]);
    }

    #[test]
    fn handler_errors_do_not_stop_the_consumer() {
        init_test_tracing();
        let (worker, handler) = spawn_collecting(16, Some(Duration::from_millis(50)));

        handler.fail_values.store(true, Ordering::Relaxed);
        assert!(worker.try_enqueue(1).is_ok());
        worker.flush();

        // The failed value was dropped, not redelivered, and the consumer kept going.
        handler.fail_values.store(false, Ordering::Relaxed);
        assert!(worker.try_enqueue(2).is_ok());
        worker.flush();

        assert_eq!(*handler.values.lock().unwrap(), vec![2]);
    }

    #[test]
    fn handler_panics_do_not_stop_the_consumer() {
        init_test_tracing();
        let (worker, handler) = spawn_collecting(16, Some(Duration::from_millis(50)));

        handler.panic_on_values.store(true, Ordering::Relaxed);
        assert!(worker.try_enqueue(1).is_ok());

        // The flush marker sits behind the panicking record; it must still be acknowledged.
        worker.flush();

        handler.panic_on_values.store(false, Ordering::Relaxed);
        assert!(worker.try_enqueue(2).is_ok());
        worker.flush();

        assert_eq!(*handler.values.lock().unwrap(), vec![2]);
    }

    #[test]
    fn rejected_value_is_released_exactly_once() {
        struct Tracked(Arc<AtomicUsize>);

        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        struct NoopHandler;

        impl WorkerHandler for NoopHandler {
            type Value = Tracked;

            fn on_new_value(&self, _value: Tracked) -> io::Result<()> {
                Ok(())
            }

            fn on_idle(&self) -> io::Result<bool> {
                Ok(true)
            }

            fn flush(&self) -> io::Result<()> {
                Ok(())
            }
        }

        let worker = Worker::spawn(NoopHandler, 1, 4, Some(Duration::from_millis(10)))
            .expect("failed to spawn worker");
        worker.shutdown();

        let drops = Arc::new(AtomicUsize::new(0));
        let rejected = worker.try_enqueue(Tracked(Arc::clone(&drops)));
        assert!(rejected.is_err());
        drop(rejected);

        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
