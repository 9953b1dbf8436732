//! Device proxy: the last-known state of one unit, its change subscribers, and the outbound
//! command path for that unit.

use log::{debug, error, warn};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::models::dkn::{DeviceData, DeviceInfo, MachineEvent, Mac};
use crate::socketio::ChannelError;

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked with a snapshot of the device state whenever it changes.
pub type UpdateCallback = Arc<dyn Fn(&DeviceData) -> Result<(), CallbackError> + Send + Sync>;

pub fn callback<F>(f: F) -> UpdateCallback
where
    F: Fn(&DeviceData) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("command for {mac} failed: {source}")]
    Command {
        mac: Mac,
        #[source]
        source: ChannelError,
    },
    #[error("device {0} was closed before it reported any data")]
    Closed(Mac),
}

/// Where a proxy sends its commands; implemented by the installation channel.
pub trait CommandSink: Send + Sync {
    fn send_machine_event(&self, event: &MachineEvent) -> Result<(), ChannelError>;
}

/// Value of an outbound command. Rendered as a string on the wire, kept typed for the
/// optimistic local update.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CommandValue {
    fn to_json(&self) -> Value {
        match self {
            CommandValue::Bool(b) => Value::Bool(*b),
            CommandValue::Int(i) => Value::from(*i),
            CommandValue::Float(f) => Value::from(*f),
            CommandValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl Display for CommandValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            // the cloud expects the capitalised spelling
            CommandValue::Bool(true) => f.write_str("True"),
            CommandValue::Bool(false) => f.write_str("False"),
            CommandValue::Int(i) => write!(f, "{}", i),
            CommandValue::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{}", *v as i64),
            CommandValue::Float(v) => write!(f, "{}", v),
            CommandValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct StateSlot {
    data: Option<DeviceData>,
    closed: bool,
}

pub struct DeviceProxy {
    mac: Mac,
    name: String,
    sink: Arc<dyn CommandSink>,
    state: Mutex<StateSlot>,
    populated: Condvar,
    subscribers: Mutex<Vec<(SubscriptionId, UpdateCallback)>>,
    next_subscription: AtomicU64,
    /// Held from merge through notification so subscribers see snapshots in merge order.
    delivery: Mutex<()>,
}

impl DeviceProxy {
    pub fn new(info: &DeviceInfo, sink: Arc<dyn CommandSink>) -> Self {
        DeviceProxy {
            mac: info.mac.clone(),
            name: info.name.clone().unwrap_or_else(|| info.mac.0.clone()),
            sink,
            state: Mutex::new(StateSlot::default()),
            populated: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
            delivery: Mutex::new(()),
        }
    }

    pub fn mac(&self) -> &Mac {
        &self.mac
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, StateSlot> {
        // subscribers run outside this lock
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the current state, `None` until the first update arrived.
    pub fn state(&self) -> Option<DeviceData> {
        self.lock_state().data.clone()
    }

    pub fn has_data(&self) -> bool {
        self.lock_state().data.is_some()
    }

    /// Merge the present fields of `update` and notify subscribers if anything changed.
    ///
    /// Concurrent updates are delivered one at a time, in the order they were merged.
    /// Subscribers run inside that window and must not call `apply_update` or
    /// `send_command` on the same proxy.
    pub fn apply_update(&self, update: &DeviceData) -> bool {
        let _delivery = self.lock_delivery();
        let snapshot = {
            let mut slot = self.lock_state();
            let first = slot.data.is_none();
            let data = slot.data.get_or_insert_with(DeviceData::default);
            let changed = data.merge(update);
            let snapshot = data.clone();
            if first {
                self.populated.notify_all();
            }
            if changed.is_empty() {
                debug!("Device '{}' update carried no changes", self.name);
                return false;
            }
            debug!("Device '{}' changed: {}", self.name, changed.join(", "));
            snapshot
        };
        self.notify(&snapshot);
        true
    }

    fn notify(&self, snapshot: &DeviceData) {
        let callbacks = match self.subscribers.lock() {
            Ok(subs) => subs.iter().map(|(_, cb)| Arc::clone(cb)).collect::<Vec<_>>(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, cb)| Arc::clone(cb)).collect(),
        };
        for callback in callbacks {
            self.invoke(&callback, snapshot);
        }
    }

    fn invoke(&self, callback: &UpdateCallback, snapshot: &DeviceData) {
        match catch_unwind(AssertUnwindSafe(|| callback(snapshot))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to execute a callback for device '{}': {}", self.name, e),
            Err(_) => error!("A callback for device '{}' panicked", self.name),
        }
    }

    /// Register `callback` and invoke it once right away with the current state.
    pub fn subscribe(&self, callback: UpdateCallback) -> SubscriptionId {
        let _delivery = self.lock_delivery();
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push((id, Arc::clone(&callback))),
            Err(poisoned) => poisoned.into_inner().push((id, Arc::clone(&callback))),
        }
        let snapshot = self.state().unwrap_or_default();
        self.invoke(&callback, &snapshot);
        id
    }

    /// Remove a subscription; unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = match self.subscribers.lock() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|(sub, _)| *sub != id);
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or_default()
    }

    /// Send `property = value` to the unit and assume it took effect.
    ///
    /// The acknowledgement is only logged; a rejected command leaves the optimistic value in
    /// place until the next realtime update overwrites it.
    pub fn send_command(&self, property: &str, value: CommandValue) -> Result<(), DeviceError> {
        let event = MachineEvent {
            mac: self.mac.clone(),
            property: property.to_string(),
            value: value.to_string(),
        };
        debug!("Setting device '{}' value '{}' to '{}'", self.mac, property, event.value);
        self.sink.send_machine_event(&event).map_err(|source| DeviceError::Command {
            mac: self.mac.clone(),
            source,
        })?;

        let Some(update) = DeviceData::from_property(property, value.to_json()) else {
            debug!("Property '{}' is not tracked locally; skipping optimistic update", property);
            return Ok(());
        };
        if self.has_data() {
            self.apply_update(&update);
        } else {
            debug!("Device '{}' has no state yet; skipping optimistic update", self.name);
        }
        Ok(())
    }

    /// Block until the first update has been applied. Never times out; returns an error only
    /// when the proxy is closed first.
    pub fn wait_for_data(&self) -> Result<(), DeviceError> {
        let slot = self.lock_state();
        let slot = self
            .populated
            .wait_while(slot, |s| s.data.is_none() && !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.data.is_some() {
            Ok(())
        } else {
            Err(DeviceError::Closed(self.mac.clone()))
        }
    }

    /// Release every pending `wait_for_data`; called when the owning channel goes away.
    pub fn close(&self) {
        let mut slot = self.lock_state();
        if !slot.closed {
            slot.closed = true;
            if slot.data.is_none() {
                warn!("Device '{}' closed before reporting any data", self.name);
            }
        }
        self.populated.notify_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: Mutex<Vec<MachineEvent>>,
        pub(crate) fail: bool,
    }

    impl RecordingSink {
        pub(crate) fn sent(&self) -> Vec<(String, String)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|e| (e.property.clone(), e.value.clone()))
                .collect()
        }
    }

    impl CommandSink for RecordingSink {
        fn send_machine_event(&self, event: &MachineEvent) -> Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError::NotConnected("/test".into()));
            }
            self.sent.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    pub(crate) fn proxy_with_sink(sink: Arc<RecordingSink>) -> DeviceProxy {
        let info = DeviceInfo {
            mac: Mac("AABBCCDDEEFF".into()),
            name: Some("Living Room".into()),
        };
        DeviceProxy::new(&info, sink)
    }

    fn counter() -> (Arc<Mutex<usize>>, UpdateCallback) {
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let cb = callback(move |_| {
            *c.lock().unwrap() += 1;
            Ok(())
        });
        (count, cb)
    }

    #[test]
    fn first_update_creates_state() {
        let proxy = proxy_with_sink(Arc::default());
        assert!(proxy.state().is_none());
        assert!(proxy.apply_update(&DeviceData {
            power: Some(true),
            ..Default::default()
        }));
        assert_eq!(proxy.state().and_then(|s| s.power), Some(true));
    }

    #[test]
    fn subscribe_invokes_immediately_once() {
        let proxy = proxy_with_sink(Arc::default());
        proxy.apply_update(&DeviceData {
            mode: Some(3),
            ..Default::default()
        });
        let (count, cb) = counter();
        proxy.subscribe(cb);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn unchanged_update_does_not_notify() {
        let proxy = proxy_with_sink(Arc::default());
        let update = DeviceData {
            mode: Some(3),
            power: Some(true),
            ..Default::default()
        };
        proxy.apply_update(&update);
        let (count, cb) = counter();
        proxy.subscribe(cb);

        assert!(!proxy.apply_update(&update));
        assert!(!proxy.apply_update(&DeviceData::default()));
        assert_eq!(*count.lock().unwrap(), 1);

        assert!(proxy.apply_update(&DeviceData {
            mode: Some(2),
            ..Default::default()
        }));
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn failing_subscribers_do_not_stop_others() {
        let proxy = proxy_with_sink(Arc::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        proxy.subscribe(callback(move |_| {
            o.lock().unwrap().push("first");
            Err("boom".into())
        }));
        let o = Arc::clone(&order);
        proxy.subscribe(callback(move |data| {
            if data.power.is_some() {
                panic!("subscriber panic");
            }
            o.lock().unwrap().push("second");
            Ok(())
        }));
        let o = Arc::clone(&order);
        proxy.subscribe(callback(move |_| {
            o.lock().unwrap().push("third");
            Ok(())
        }));
        order.lock().unwrap().clear();

        assert!(proxy.apply_update(&DeviceData {
            power: Some(true),
            ..Default::default()
        }));
        assert_eq!(*order.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn unsubscribe_removes_and_ignores_unknown() {
        let proxy = proxy_with_sink(Arc::default());
        let (count, cb) = counter();
        let id = proxy.subscribe(cb);
        proxy.unsubscribe(id);
        proxy.unsubscribe(id);
        assert_eq!(proxy.subscriber_count(), 0);

        proxy.apply_update(&DeviceData {
            power: Some(false),
            ..Default::default()
        });
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn command_is_sent_then_applied_optimistically() {
        let sink = Arc::new(RecordingSink::default());
        let proxy = proxy_with_sink(Arc::clone(&sink));
        proxy.apply_update(&DeviceData {
            power: Some(false),
            ..Default::default()
        });

        proxy.send_command("power", CommandValue::Bool(true)).expect("sent");
        proxy.send_command("setpoint_air_cool", CommandValue::Float(23.5)).expect("sent");
        proxy.send_command("speed_state", CommandValue::Int(4)).expect("sent");

        assert_eq!(
            sink.sent(),
            vec![
                ("power".to_string(), "True".to_string()),
                ("setpoint_air_cool".to_string(), "23.5".to_string()),
                ("speed_state".to_string(), "4".to_string()),
            ]
        );
        let state = proxy.state().expect("state");
        assert_eq!(state.power, Some(true));
        assert_eq!(state.setpoint_air_cool, Some(23.5));
        assert_eq!(state.speed_state, Some(4));
    }

    #[test]
    fn failed_send_leaves_state_untouched() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let proxy = proxy_with_sink(sink);
        proxy.apply_update(&DeviceData {
            power: Some(false),
            ..Default::default()
        });
        let err = proxy.send_command("power", CommandValue::Bool(true)).unwrap_err();
        assert!(matches!(err, DeviceError::Command { .. }));
        assert_eq!(proxy.state().and_then(|s| s.power), Some(false));
    }

    #[test]
    fn renders_command_values() {
        assert_eq!(CommandValue::Bool(false).to_string(), "False");
        assert_eq!(CommandValue::Float(22.0).to_string(), "22");
        assert_eq!(CommandValue::Float(21.5).to_string(), "21.5");
        assert_eq!(CommandValue::Text("x".into()).to_string(), "x");
    }

    #[test]
    fn wait_returns_after_first_update() {
        let proxy = Arc::new(proxy_with_sink(Arc::default()));
        let feeder = Arc::clone(&proxy);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            feeder.apply_update(&DeviceData {
                power: Some(true),
                ..Default::default()
            });
        });
        proxy.wait_for_data().expect("data arrives");
        handle.join().unwrap();
        assert!(proxy.has_data());
    }

    #[test]
    fn close_releases_waiters() {
        let proxy = Arc::new(proxy_with_sink(Arc::default()));
        let closer = Arc::clone(&proxy);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            closer.close();
        });
        let err = proxy.wait_for_data().unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, DeviceError::Closed(_)));
    }

    #[test]
    fn concurrent_updates_reach_subscribers_in_merge_order() {
        let proxy = Arc::new(proxy_with_sink(Arc::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        proxy.subscribe(callback(move |data| {
            if data.mode == Some(2) {
                // slow host while a newer update arrives
                thread::sleep(Duration::from_millis(150));
            }
            s.lock().unwrap().push(data.clone());
            Ok(())
        }));

        let first = Arc::clone(&proxy);
        let handle = thread::spawn(move || {
            first.apply_update(&DeviceData {
                mode: Some(2),
                ..Default::default()
            })
        });
        thread::sleep(Duration::from_millis(30));
        assert!(proxy.apply_update(&DeviceData {
            mode: Some(3),
            ..Default::default()
        }));
        assert!(handle.join().unwrap());

        let seen = seen.lock().unwrap();
        let modes: Vec<_> = seen.iter().map(|d| d.mode).collect();
        assert_eq!(modes, vec![None, Some(2), Some(3)]);
        assert_eq!(seen.last().cloned(), proxy.state());
    }
}
