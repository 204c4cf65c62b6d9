use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{record::Record, transport::Transport};

/// The downstream consumer of buffered records.
///
/// The buffering adapter hands every dequeued record to `route`, converts sustained inactivity
/// into `on_idle` calls, and forwards synchronous flush requests to `flush`. Implementations must
/// be safe for concurrent invocation only when the worker runs more than one consumer thread.
pub trait Router: Send + Sync {
    /// Routes a single record towards delivery.
    fn route(&self, record: &Record) -> io::Result<()>;

    /// Called repeatedly while the pipeline has been idle longer than the configured maximum idle
    /// wait; typically flushes partially filled buffers.
    fn on_idle(&self) -> io::Result<()>;

    /// Flushes all buffered state towards delivery.
    fn flush(&self) -> io::Result<()>;
}

/// A router that packs records into payloads and hands them to a [`Transport`].
///
/// Records are newline-delimited, so multiple records can share a payload and be split apart
/// trivially by the server; packing them saves a system call per record. A payload never exceeds
/// the maximum payload length: a record that no longer fits causes the current payload to be sent
/// first, and a record too large to fit in any payload is dropped.
pub struct TransportRouter {
    transport: Arc<dyn Transport>,
    max_payload_len: usize,
    payload: Mutex<Vec<u8>>,
}

impl TransportRouter {
    /// Creates a router packing payloads of at most `max_payload_len` bytes.
    ///
    /// This should be no larger than the server's configured receive buffer, or payloads may be
    /// discarded on the other end.
    pub fn new(transport: Arc<dyn Transport>, max_payload_len: usize) -> Self {
        TransportRouter { transport, max_payload_len, payload: Mutex::new(Vec::new()) }
    }

    fn lock_payload(&self) -> MutexGuard<'_, Vec<u8>> {
        self.payload.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_payload(&self, payload: &mut Vec<u8>) -> io::Result<()> {
        if payload.is_empty() {
            return Ok(());
        }

        // Clear before checking the result: delivery is fire-and-forget, so a failed payload is
        // dropped rather than retried.
        let result = self.transport.send(payload);
        payload.clear();
        result
    }
}

impl Router for TransportRouter {
    fn route(&self, record: &Record) -> io::Result<()> {
        if record.len() + 1 > self.max_payload_len {
            // Not logged here: the worker's consumer loop already logs every routing error once.
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record of {} bytes exceeds maximum payload length", record.len()),
            ));
        }

        let mut payload = self.lock_payload();
        if payload.len() + record.len() + 1 > self.max_payload_len {
            self.send_payload(&mut payload)?;
        }

        payload.extend_from_slice(record.as_bytes());
        payload.push(b'\n');
        Ok(())
    }

    fn on_idle(&self) -> io::Result<()> {
        let mut payload = self.lock_payload();
        self.send_payload(&mut payload)
    }

    fn flush(&self) -> io::Result<()> {
        let mut payload = self.lock_payload();
        self.send_payload(&mut payload)
    }
}
