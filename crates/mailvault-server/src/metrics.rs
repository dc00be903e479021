//! Named numeric gauges.
//!
//! The reactor keeps a handful of gauges current (connection counts by
//! role, bytes buffered in connection queues) and pushes every change to a
//! [`MetricsSink`]. The sink is the observability boundary: what happens to
//! the numbers after that (graphing, aggregation, wire format) is somebody
//! else's business.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Receives gauge updates.
pub trait MetricsSink {
    /// Records that the gauge `name` now has `value`.
    fn record(&self, name: &str, value: u64);
}

/// A sink that emits gauge updates as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, name: &str, value: u64) {
        tracing::debug!(target: "mailvault_server::metrics", gauge = name, value, "gauge updated");
    }
}

/// A registry of named gauges, pushing changes to a sink.
pub struct Gauges {
    sink: Rc<dyn MetricsSink>,
    values: RefCell<HashMap<String, u64>>,
}

impl Gauges {
    /// Creates a registry pushing to the given sink.
    #[must_use]
    pub fn new(sink: Rc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            values: RefCell::new(HashMap::new()),
        }
    }

    /// Sets `name` to `value`, notifying the sink if the value changed.
    pub fn set(&self, name: &str, value: u64) {
        let mut values = self.values.borrow_mut();
        match values.get(name) {
            Some(old) if *old == value => return,
            _ => {
                values.insert(name.to_owned(), value);
            }
        }
        drop(values);
        self.sink.record(name, value);
    }

    /// Returns the last recorded value of `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.borrow().get(name).copied()
    }
}

impl Default for Gauges {
    fn default() -> Self {
        Self::new(Rc::new(TracingSink))
    }
}
