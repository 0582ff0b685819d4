//! Observation hooks for table activity.
//!
//! A [`Telemetry`] sink receives notifications about inserts, erases,
//! rehashes, and storage changes. Every method has a no-op default, so a sink
//! implements only what it cares about, and a table without a sink pays a
//! single branch per event.
//!
//! Sinks are attached with [`HashTable::set_telemetry`] and must be
//! `'static`: the table keeps the reference for its whole lifetime and calls
//! [`Telemetry::unregister`] when it is dropped.
//!
//! [`HashTable::set_telemetry`]: crate::hash_table::HashTable::set_telemetry

/// A sink for table activity notifications.
///
/// Implementations must tolerate calls in any order and must not call back
/// into the table that is notifying them.
pub trait Telemetry: Sync {
    /// The sink was attached to a table.
    fn register(&self) {}

    /// The table the sink was attached to is being dropped.
    fn unregister(&self) {}

    /// A value was inserted. `probe_length` is the number of buckets walked
    /// past the home bucket to place it.
    fn record_insert(&self, _hash: u64, _probe_length: usize) {}

    /// A value was erased.
    fn record_erase(&self) {}

    /// The table rehashed. `total_probe_length` is the sum of placement
    /// probe lengths over all moved entries.
    fn record_rehash(&self, _total_probe_length: usize) {}

    /// The backing array was allocated, replaced, or released.
    fn record_storage_changed(&self, _size: usize, _capacity: usize) {}

    /// A reservation was requested via `reserve` or `rehash`.
    fn record_reservation(&self, _requested: usize) {}

    /// The table was cleared.
    fn record_clear(&self) {}
}

/// Table-side handle to an optional sink. All recording methods are no-ops
/// while no sink is attached.
#[derive(Clone, Copy, Default)]
pub(crate) struct TelemetryHandle {
    sink: Option<&'static dyn Telemetry>,
}

impl TelemetryHandle {
    pub(crate) fn attach(&mut self, sink: &'static dyn Telemetry) {
        if let Some(old) = self.sink.replace(sink) {
            old.unregister();
        }
        sink.register();
    }

    pub(crate) fn register(&self) {
        if let Some(sink) = self.sink {
            sink.register();
        }
    }

    pub(crate) fn unregister(&self) {
        if let Some(sink) = self.sink {
            sink.unregister();
        }
    }

    #[inline]
    pub(crate) fn record_insert(&self, hash: u64, probe_length: usize) {
        if let Some(sink) = self.sink {
            sink.record_insert(hash, probe_length);
        }
    }

    #[inline]
    pub(crate) fn record_erase(&self) {
        if let Some(sink) = self.sink {
            sink.record_erase();
        }
    }

    #[inline]
    pub(crate) fn record_rehash(&self, total_probe_length: usize) {
        if let Some(sink) = self.sink {
            sink.record_rehash(total_probe_length);
        }
    }

    #[inline]
    pub(crate) fn record_storage_changed(&self, size: usize, capacity: usize) {
        if let Some(sink) = self.sink {
            sink.record_storage_changed(size, capacity);
        }
    }

    #[inline]
    pub(crate) fn record_reservation(&self, requested: usize) {
        if let Some(sink) = self.sink {
            sink.record_reservation(requested);
        }
    }

    #[inline]
    pub(crate) fn record_clear(&self) {
        if let Some(sink) = self.sink {
            sink.record_clear();
        }
    }
}
