// Resource ledger - LIFO teardown list
//
// Every GPU object registers its destruction closure here right after it is
// created. Teardown runs the closures newest-first, so anything created on
// top of the allocator or device is gone before they are.

use std::panic::{catch_unwind, AssertUnwindSafe};

type Teardown = Box<dyn FnOnce() + Send>;

struct Entry {
    label: &'static str,
    teardown: Teardown,
}

/// Stack of teardown closures.
#[derive(Default)]
pub struct ResourceLedger {
    name: &'static str,
    entries: Vec<Entry>,
}

impl ResourceLedger {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    /// Register a teardown closure. `label` only shows up in diagnostics.
    pub fn push<F>(&mut self, label: &'static str, teardown: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.entries.push(Entry {
            label,
            teardown: Box::new(teardown),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every closure in reverse registration order and clear the ledger.
    ///
    /// A closure that panics is logged and skipped; the rest still run.
    /// Calling this on an empty ledger does nothing.
    pub fn flush(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        log::debug!("Flushing ledger '{}' ({} entries)", self.name, self.entries.len());

        while let Some(entry) = self.entries.pop() {
            let label = entry.label;
            if catch_unwind(AssertUnwindSafe(entry.teardown)).is_err() {
                log::error!(
                    "Teardown of '{}' in ledger '{}' panicked, continuing",
                    label,
                    self.name
                );
            }
        }
    }
}

impl Drop for ResourceLedger {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            log::warn!(
                "Ledger '{}' dropped with {} pending entries, flushing",
                self.name,
                self.entries.len()
            );
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |id: u32| -> Box<dyn FnOnce() + Send> {
            let log = log_clone.clone();
            Box::new(move || log.lock().push(id))
        };
        (log, make)
    }

    #[test]
    fn flush_runs_in_reverse_registration_order() {
        let (log, make) = recorder();
        let mut ledger = ResourceLedger::new("test");
        ledger.push("f1", make(1));
        ledger.push("f2", make(2));
        ledger.push("f3", make(3));
        assert_eq!(ledger.len(), 3);

        ledger.flush();

        assert_eq!(*log.lock(), vec![3, 2, 1]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn second_flush_invokes_nothing() {
        let (log, make) = recorder();
        let mut ledger = ResourceLedger::new("test");
        ledger.push("f1", make(1));

        ledger.flush();
        ledger.flush();

        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn panicking_entry_does_not_stop_teardown() {
        let (log, make) = recorder();
        let mut ledger = ResourceLedger::new("test");
        ledger.push("first", make(1));
        ledger.push("bad", || panic!("destroy failed"));
        ledger.push("last", make(3));

        ledger.flush();

        assert_eq!(*log.lock(), vec![3, 1]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn drop_flushes_pending_entries() {
        let (log, make) = recorder();
        {
            let mut ledger = ResourceLedger::new("scoped");
            ledger.push("a", make(10));
            ledger.push("b", make(20));
        }
        assert_eq!(*log.lock(), vec![20, 10]);
    }

    #[test]
    fn entries_pushed_after_flush_run_on_next_flush() {
        let (log, make) = recorder();
        let mut ledger = ResourceLedger::new("swapchain");
        ledger.push("old", make(1));
        ledger.flush();
        ledger.push("new", make(2));
        ledger.flush();

        assert_eq!(*log.lock(), vec![1, 2]);
    }
}
