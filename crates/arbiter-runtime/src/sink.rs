//! Sinks consuming interaction records.
//!
//! The dispatcher hands every record to one sink as it is produced, in
//! addition to returning the records on the call result. Sinks are the
//! integration point for external metrics and log pipelines; the core
//! itself never persists records.

use parking_lot::Mutex;

use arbiter_core::InteractionRecord;

/// Consumer of interaction records.
///
/// Appends must be safe to call from many tasks at once; records arrive
/// in attempt order within a logical call but interleave freely across
/// calls.
pub trait RecordSink: Send + Sync {
    /// Consume one record.
    fn append(&self, record: &InteractionRecord);
}

/// Default sink: emits each record as a `tracing` event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl RecordSink for TracingSink {
    fn append(&self, record: &InteractionRecord) {
        tracing::debug!(
            provider = %record.provider,
            model = %record.model,
            purpose = %record.purpose,
            attempt = record.attempt,
            succeeded = record.succeeded(),
            tokens = record.usage.total(),
            latency_ms = record.latency.as_millis() as u64,
            "interaction recorded"
        );
    }
}

/// Buffers records in memory.
///
/// Useful in tests and for collaborators that flush records to their
/// own storage after a batch of calls.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<InteractionRecord>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<InteractionRecord> {
        self.records.lock().clone()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Drop all buffered records.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl RecordSink for MemorySink {
    fn append(&self, record: &InteractionRecord) {
        self.records.lock().push(record.clone());
    }
}
