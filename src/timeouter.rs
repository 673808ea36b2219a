//! Per-owner named timeouts on top of selector alarms.
//!
//! A connection owns a [`Timeouter`] and addresses its timeouts by its own
//! 64-bit ids; the timeouter maps them to selector alarms, replacing an
//! alarm when an id is re-armed and suppressing the callback when a clear
//! races a firing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::selector::{AlarmId, Selector};

/// Caller-chosen timeout identifier.
pub type TimeoutId = i64;

struct TimeouterInner {
    /// Invoked on the selector thread for every timeout that fires.
    callback: Box<dyn Fn(TimeoutId) + Send + Sync>,
    /// Armed timeouts and their alarms. An alarm firing for an id no
    /// longer mapped here was cleared in the meantime.
    timeouts: Mutex<HashMap<TimeoutId, AlarmId>>,
}

impl TimeouterInner {
    fn fire(self: &Arc<Self>, timeout_id: TimeoutId) {
        let armed = self.timeouts.lock().remove(&timeout_id).is_some();
        if armed {
            (self.callback)(timeout_id);
        }
    }
}

/// A set of named, replaceable timeouts. Callable from any thread; the
/// callback always runs on the selector thread.
pub struct Timeouter {
    selector: Arc<Selector>,
    inner: Arc<TimeouterInner>,
}

impl Timeouter {
    pub fn new(
        selector: Arc<Selector>,
        callback: impl Fn(TimeoutId) + Send + Sync + 'static,
    ) -> Timeouter {
        Timeouter {
            selector,
            inner: Arc::new(TimeouterInner {
                callback: Box::new(callback),
                timeouts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Arm (or re-arm) the timeout `timeout_id`, `timeout` from now.
    pub fn set_timeout(&self, timeout_id: TimeoutId, timeout: Duration) {
        let inner = self.inner.clone();
        let alarm_callback = move || inner.fire(timeout_id);
        let mut timeouts = self.inner.timeouts.lock();
        if let Some(old_alarm) = timeouts.get(&timeout_id) {
            self.selector.unregister_alarm(*old_alarm);
        }
        let alarm_id = self.selector.register_alarm(alarm_callback, timeout);
        timeouts.insert(timeout_id, alarm_id);
    }

    /// Disarm a timeout. Returns whether one was actually cleared.
    pub fn clear_timeout(&self, timeout_id: TimeoutId) -> bool {
        let mut timeouts = self.inner.timeouts.lock();
        match timeouts.remove(&timeout_id) {
            Some(alarm_id) => {
                self.selector.unregister_alarm(alarm_id);
                true
            }
            None => false,
        }
    }

    /// Disarm everything.
    pub fn clear_all_timeouts(&self) {
        let mut timeouts = self.inner.timeouts.lock();
        for (_, alarm_id) in timeouts.drain() {
            self.selector.unregister_alarm(alarm_id);
        }
    }
}

impl Drop for Timeouter {
    fn drop(&mut self) {
        self.clear_all_timeouts();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectorParams;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn clear_reports_presence() {
        let selector = Selector::new(SelectorParams::default()).unwrap();
        let timeouter = Timeouter::new(selector, |_| {});
        timeouter.set_timeout(7, Duration::from_secs(60));
        assert!(timeouter.clear_timeout(7));
        assert!(!timeouter.clear_timeout(7));
        assert!(!timeouter.clear_timeout(8));
    }

    #[test]
    fn rearming_replaces_the_alarm() {
        let selector = Selector::new(SelectorParams::default()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let timeouter = Timeouter::new(selector, move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        timeouter.set_timeout(1, Duration::from_secs(60));
        timeouter.set_timeout(1, Duration::from_secs(60));
        // One mapping, one pending alarm.
        assert_eq!(timeouter.inner.timeouts.lock().len(), 1);
        assert!(timeouter.clear_timeout(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fire_after_clear_is_suppressed() {
        let selector = Selector::new(SelectorParams::default()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let timeouter = Timeouter::new(selector, move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        timeouter.set_timeout(3, Duration::from_secs(60));
        timeouter.clear_timeout(3);
        // Simulate a stale alarm firing after the clear.
        timeouter.inner.fire(3);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // And a live one firing normally.
        timeouter.inner.timeouts.lock().insert(4, 0);
        timeouter.inner.fire(4);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
