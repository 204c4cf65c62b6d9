use std::fmt;

/// A single fully-encoded protocol line awaiting delivery.
///
/// A `Record` may also hold a batch of lines already joined by newline separators. It is created by
/// the sender, owned exclusively by the worker queue while enqueued, and released exactly once:
/// either after it has been routed, or immediately when the queue rejects it. Ownership transfer is
/// enforced by move semantics, so a record can never be routed twice or leaked.
pub struct Record {
    line: String,
}

impl Record {
    /// Creates a record from an already-encoded protocol line.
    pub fn new(line: String) -> Self {
        Self { line }
    }

    /// Returns the encoded line as a string slice.
    pub fn as_str(&self) -> &str {
        &self.line
    }

    /// Returns the encoded line as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.line.as_bytes()
    }

    /// Returns the encoded length, in bytes.
    pub fn len(&self) -> usize {
        self.line.len()
    }

    /// Returns `true` if the record holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.line.is_empty()
    }
}

impl From<String> for Record {
    fn from(line: String) -> Self {
        Record::new(line)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}
