//! Per-channel listener registry (§4.2).
//!
//! Listeners are grouped by channel, then by priority (ascending,
//! default 50). Registering the same [`ListenerId`] on a channel again
//! replaces its priority rather than adding a second entry, mirroring the
//! reference implementation's identity-keyed `set`.
//!
//! The priority buckets are kept in a `BTreeMap<u16, Vec<_>>`, the same
//! shape the retrieval pack's own `PriorityEventBus` uses for prioritized
//! dispatch: ascending key order gives the ordering guarantee for free, and
//! each bucket's `Vec` preserves registration order for same-priority
//! listeners (whose relative order the bus makes no promises about anyway).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::channel::ChannelId;
use crate::error::{ListenerError, Payload};

/// Default priority assigned when a listener doesn't declare one (§3).
pub const DEFAULT_PRIORITY: u16 = 50;

/// Identifies a registered listener within a channel, so it can be replaced
/// or removed. Rust closures have no usable identity of their own (unlike
/// the reference implementation's callables, compared by Python object
/// identity), so callers name their listener explicitly — typically the
/// plugin name plus channel, e.g. `"clean-exit"` (see [`crate::SimplePlugin`]
/// for the common case of one id per plugin method).
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ListenerId(Arc<str>);

impl ListenerId {
    pub fn new(name: impl AsRef<str>) -> Self {
        ListenerId(Arc::from(name.as_ref()))
    }
}

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({:?})", self.0)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ListenerId {
    fn from(s: &str) -> Self {
        ListenerId::new(s)
    }
}

impl From<String> for ListenerId {
    fn from(s: String) -> Self {
        ListenerId(Arc::from(s))
    }
}

/// A channel subscriber. Implemented automatically for any
/// `Fn(&Payload) -> Result<(), ListenerError> + Send + Sync`, so ordinary
/// closures subscribe directly; implement the trait yourself for a listener
/// that carries its own state beyond what a closure's captures allow.
pub trait Listener: Send + Sync {
    fn call(&self, payload: &Payload) -> Result<(), ListenerError>;
}

impl<F> Listener for F
where
    F: Fn(&Payload) -> Result<(), ListenerError> + Send + Sync,
{
    fn call(&self, payload: &Payload) -> Result<(), ListenerError> {
        self(payload)
    }
}

type PriorityBuckets = BTreeMap<u16, Vec<(ListenerId, Arc<dyn Listener>)>>;

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    channels: Mutex<HashMap<ChannelId, PriorityBuckets>>,
}

impl ListenerRegistry {
    /// Declare a channel with no listeners, if it doesn't exist yet. Used
    /// at bus construction so every state and extra channel is known even
    /// before anything subscribes (lazily-created channels still work via
    /// `subscribe`'s own `entry` call).
    pub fn ensure_channel(&self, channel: &ChannelId) {
        let mut guard = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        guard.entry(channel.clone()).or_default();
    }

    pub fn subscribe(
        &self,
        channel: &ChannelId,
        id: ListenerId,
        priority: u16,
        listener: Arc<dyn Listener>,
    ) {
        let mut guard = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let buckets = guard.entry(channel.clone()).or_default();
        for bucket in buckets.values_mut() {
            bucket.retain(|(existing, _)| existing != &id);
        }
        buckets.retain(|_, bucket| !bucket.is_empty());
        buckets.entry(priority).or_default().push((id, listener));
    }

    pub fn unsubscribe(&self, channel: &ChannelId, id: &ListenerId) {
        let mut guard = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(buckets) = guard.get_mut(channel) {
            for bucket in buckets.values_mut() {
                bucket.retain(|(existing, _)| existing != id);
            }
            buckets.retain(|_, bucket| !bucket.is_empty());
        }
    }

    /// Remove every subscription on every channel. Channels already known
    /// (via `ensure_channel` or a prior `subscribe`) remain declared, just
    /// empty — matching the reference implementation, which empties each
    /// channel's listener set rather than deleting the channel key.
    pub fn clear(&self) {
        let mut guard = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        for buckets in guard.values_mut() {
            buckets.clear();
        }
    }

    /// A priority-ordered snapshot of the listeners currently on `channel`.
    /// Taken under the registry lock and then released, so a concurrent
    /// `subscribe`/`unsubscribe`/`clear` never observes or mutates a
    /// snapshot already handed to a `publish` in progress (§5).
    pub fn snapshot(&self, channel: &ChannelId) -> Vec<Arc<dyn Listener>> {
        let guard = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        match guard.get(channel) {
            Some(buckets) => buckets
                .values()
                .flat_map(|bucket| bucket.iter().map(|(_, listener)| listener.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has_channel(&self, channel: &ChannelId) -> bool {
        let guard = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        guard.contains_key(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop(_: &Payload) -> Result<(), ListenerError> {
        Ok(())
    }

    #[test]
    fn silent_publish_on_unknown_channel() {
        let reg = ListenerRegistry::default();
        assert!(reg.snapshot(&ChannelId::new("RUN")).is_empty());
    }

    #[test]
    fn priority_ordering() {
        let reg = ListenerRegistry::default();
        let channel = ChannelId::new("C");
        let order = Arc::new(Mutex::new(Vec::new()));

        let make = |tag: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
            Arc::new(move |_: &Payload| {
                order.lock().unwrap().push(tag);
                Ok(())
            }) as Arc<dyn Listener>
        };

        reg.subscribe(&channel, ListenerId::new("L1"), 100, make("L1", order.clone()));
        reg.subscribe(&channel, ListenerId::new("L2"), 50, make("L2", order.clone()));
        reg.subscribe(&channel, ListenerId::new("L3"), 0, make("L3", order.clone()));
        reg.subscribe(&channel, ListenerId::new("L4"), 51, make("L4", order.clone()));

        for listener in reg.snapshot(&channel) {
            listener.call(&Payload::None).unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["L3", "L2", "L4", "L1"]);
    }

    #[test]
    fn resubscribe_replaces_priority_not_adds_entry() {
        let reg = ListenerRegistry::default();
        let channel = ChannelId::new("C");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let listener: Arc<dyn Listener> = Arc::new(move |_: &Payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        reg.subscribe(&channel, ListenerId::new("L"), 100, listener.clone());
        reg.subscribe(&channel, ListenerId::new("L"), 0, listener);

        let snap = reg.snapshot(&channel);
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn unsubscribe_absent_listener_is_noop() {
        let reg = ListenerRegistry::default();
        let channel = ChannelId::new("C");
        reg.unsubscribe(&channel, &ListenerId::new("nope"));
        assert!(reg.snapshot(&channel).is_empty());
    }

    #[test]
    fn clear_empties_every_channel() {
        let reg = ListenerRegistry::default();
        let a = ChannelId::new("A");
        let b = ChannelId::new("B");
        reg.subscribe(&a, ListenerId::new("x"), 50, Arc::new(noop));
        reg.subscribe(&b, ListenerId::new("y"), 50, Arc::new(noop));
        reg.clear();
        assert!(reg.snapshot(&a).is_empty());
        assert!(reg.snapshot(&b).is_empty());
    }
}
