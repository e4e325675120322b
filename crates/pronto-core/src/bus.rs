//! Inbound line fan-out.
//!
//! The transport's reader thread hands every line to [`LineBus::dispatch`],
//! which delivers it to the registered listeners in registration order.
//! Sessions register listeners while lines are flowing, so the registry is
//! only touched through [`LineBus::register`] and [`LineBus::deregister`],
//! and each dispatch pass works on a snapshot taken when it starts.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::events::{ConsoleEvent, ConsoleObserver, NullObserver};
use crate::protocol::markers;

/// What a listener wants after seeing a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stay registered.
    Keep,
    /// Remove after the current dispatch pass.
    Done,
}

/// Consumer of inbound printer lines.
///
/// Runs on the reader thread: must be quick and must not block.
pub trait LineListener: Send + Sync {
    fn on_line(&self, line: &str) -> anyhow::Result<Disposition>;

    /// Name used when reporting failures.
    fn name(&self) -> &str {
        "listener"
    }
}

impl<F> LineListener for F
where
    F: Fn(&str) -> anyhow::Result<Disposition> + Send + Sync,
{
    fn on_line(&self, line: &str) -> anyhow::Result<Disposition> {
        self(line)
    }
}

/// Handle returned by [`LineBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Entry = (ListenerId, Arc<dyn LineListener>);

/// Ordered listener registry with snapshot dispatch.
pub struct LineBus {
    listeners: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    temperature: Mutex<Option<String>>,
    observer: Arc<dyn ConsoleObserver>,
}

impl LineBus {
    pub fn new() -> Self {
        Self::with_observer(Arc::new(NullObserver))
    }

    /// Bus that reports listener failures to `observer`.
    pub fn with_observer(observer: Arc<dyn ConsoleObserver>) -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            temperature: Mutex::new(None),
            observer,
        }
    }

    /// Append a listener; it sees lines from the next dispatch pass on.
    pub fn register(&self, listener: Arc<dyn LineListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(id = id.0, listener = listener.name(), "Listener registered");
        self.registry().push((id, listener));
        id
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn deregister(&self, id: ListenerId) -> bool {
        let mut registry = self.registry();
        match registry.iter().position(|(entry_id, _)| *entry_id == id) {
            Some(idx) => {
                registry.remove(idx);
                debug!(id = id.0, "Listener deregistered");
                true
            }
            None => false,
        }
    }

    /// Deliver `line` to every listener registered when the pass starts.
    pub fn dispatch(&self, line: &str) {
        trace!(line = %line, "Dispatch");
        if markers::is_temperature(line) {
            *self.temperature.lock().unwrap_or_else(|e| e.into_inner()) = Some(line.to_string());
        }

        let snapshot: Vec<Entry> = self.registry().clone();
        let mut finished = Vec::new();

        for (id, listener) in &snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_line(line)));
            match outcome {
                Ok(Ok(Disposition::Keep)) => {}
                Ok(Ok(Disposition::Done)) => finished.push(*id),
                Ok(Err(e)) => self.report_failure(listener.name(), e.to_string()),
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panic".to_string());
                    self.report_failure(listener.name(), message);
                }
            }
        }

        for id in finished {
            self.deregister(id);
        }
    }

    /// Most recent line carrying a temperature readout.
    pub fn latest_temperature(&self) -> Option<String> {
        self.temperature
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.registry().iter().any(|(entry_id, _)| *entry_id == id)
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Entry>> {
        // Listeners never run under this lock.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report_failure(&self, listener: &str, message: String) {
        warn!(listener = %listener, error = %message, "Listener failed");
        self.observer.on_event(&ConsoleEvent::ListenerFailed {
            listener: listener.to_string(),
            message,
        });
    }
}

impl Default for LineBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingObserver;
    use std::sync::Mutex;

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        tag: &'static str,
        done_on: &'static str,
    ) -> Arc<dyn LineListener> {
        let log = Arc::clone(log);
        Arc::new(move |line: &str| -> anyhow::Result<Disposition> {
            log.lock().unwrap().push(format!("{}:{}", tag, line));
            Ok(if line == done_on {
                Disposition::Done
            } else {
                Disposition::Keep
            })
        })
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let bus = LineBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(recorder(&log, "a", ""));
        bus.register(recorder(&log, "b", ""));
        bus.register(recorder(&log, "c", ""));

        bus.dispatch("ok");
        assert_eq!(*log.lock().unwrap(), vec!["a:ok", "b:ok", "c:ok"]);
    }

    #[test]
    fn test_self_deregistration_does_not_skip_others() {
        let bus = LineBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(recorder(&log, "a", "stop"));
        bus.register(recorder(&log, "b", ""));

        bus.dispatch("stop");
        bus.dispatch("next");

        assert_eq!(*log.lock().unwrap(), vec!["a:stop", "b:stop", "b:next"]);
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn test_registration_during_dispatch_waits_for_next_pass() {
        let bus = Arc::new(LineBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let late = recorder(&log, "late", "");

        let bus_ref = Arc::downgrade(&bus);
        let added = Mutex::new(false);
        bus.register(Arc::new(move |_: &str| -> anyhow::Result<Disposition> {
            let mut added = added.lock().unwrap();
            if !*added
                && let Some(bus) = bus_ref.upgrade()
            {
                bus.register(Arc::clone(&late));
                *added = true;
            }
            Ok(Disposition::Keep)
        }));

        bus.dispatch("first");
        assert!(log.lock().unwrap().is_empty());
        bus.dispatch("second");
        assert_eq!(*log.lock().unwrap(), vec!["late:second"]);
    }

    #[test]
    fn test_deregister_during_dispatch_keeps_snapshot() {
        let bus = Arc::new(LineBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let victim = Arc::new(Mutex::new(None::<ListenerId>));
        let bus_ref = Arc::downgrade(&bus);
        let victim_ref = Arc::clone(&victim);
        bus.register(Arc::new(move |_: &str| -> anyhow::Result<Disposition> {
            if let (Some(bus), Some(id)) = (bus_ref.upgrade(), *victim_ref.lock().unwrap()) {
                bus.deregister(id);
            }
            Ok(Disposition::Keep)
        }));
        let id = bus.register(recorder(&log, "b", ""));
        *victim.lock().unwrap() = Some(id);

        bus.dispatch("one");
        bus.dispatch("two");
        assert_eq!(*log.lock().unwrap(), vec!["b:one"]);
        assert!(!bus.is_registered(id));
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let bus = LineBus::new();
        let id = bus.register(Arc::new(|_: &str| -> anyhow::Result<Disposition> {
            Ok(Disposition::Keep)
        }));
        assert!(bus.deregister(id));
        assert!(!bus.deregister(id));
        assert!(bus.is_empty());
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let observer = Arc::new(RecordingObserver::default());
        let bus = LineBus::with_observer(observer.clone());
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register(Arc::new(|_: &str| -> anyhow::Result<Disposition> {
            anyhow::bail!("bad line")
        }));
        bus.register(Arc::new(|_: &str| -> anyhow::Result<Disposition> {
            panic!("listener exploded")
        }));
        bus.register(recorder(&log, "c", ""));

        bus.dispatch("x");
        assert_eq!(*log.lock().unwrap(), vec!["c:x"]);
        let failures = observer
            .events()
            .into_iter()
            .filter(|e| matches!(e, ConsoleEvent::ListenerFailed { .. }))
            .count();
        assert_eq!(failures, 2);
        assert_eq!(bus.len(), 3);
    }

    #[test]
    fn test_temperature_cached_without_listeners() {
        let bus = LineBus::new();
        assert!(bus.latest_temperature().is_none());
        bus.dispatch("ok T:210.0 /210.0 B:60.0 /60.0");
        bus.dispatch("ok");
        assert_eq!(
            bus.latest_temperature().as_deref(),
            Some("ok T:210.0 /210.0 B:60.0 /60.0")
        );
    }
}
