//! Plugin registration (§9, replacing the reference implementation's
//! reflection-based `SimplePlugin`).
//!
//! The original walks `self.bus.listeners` and auto-subscribes any method
//! of the plugin object named after a known channel (`self.start`,
//! `self.exit`, ...). Rust has no runtime reflection to hang that on, so a
//! plugin here is simply a named bundle of `(channel, id, priority,
//! listener)` registrations, staged with a small fluent builder and applied
//! to (or removed from) a bus all at once.

use std::sync::Arc;

use crate::bus::Bus;
use crate::channel::ChannelId;
use crate::registry::{Listener, ListenerId, DEFAULT_PRIORITY};

struct Registration {
    channel: ChannelId,
    id: ListenerId,
    priority: u16,
    listener: Arc<dyn Listener>,
}

/// A named group of listeners that subscribe and unsubscribe together.
///
/// ```no_run
/// use magicbus::{Bus, Payload, SimplePlugin};
///
/// fn install(bus: &Bus) {
///     SimplePlugin::new("heartbeat")
///         .on("main", |_: &Payload| -> Result<(), magicbus::ListenerError> {
///             println!("tick");
///             Ok(())
///         })
///         .subscribe(bus);
/// }
/// ```
pub struct SimplePlugin {
    name: &'static str,
    registrations: Vec<Registration>,
}

impl SimplePlugin {
    pub fn new(name: &'static str) -> Self {
        SimplePlugin {
            name,
            registrations: Vec::new(),
        }
    }

    /// Stage a listener on `channel` at the default priority. Each
    /// channel/listener pair gets its own [`ListenerId`] derived from the
    /// plugin's name and the channel, so `subscribe`/`unsubscribe` act on
    /// exactly the registrations this plugin staged and nothing else.
    pub fn on(self, channel: impl Into<ChannelId>, listener: impl Listener + 'static) -> Self {
        self.on_with_priority(channel, DEFAULT_PRIORITY, listener)
    }

    pub fn on_with_priority(
        mut self,
        channel: impl Into<ChannelId>,
        priority: u16,
        listener: impl Listener + 'static,
    ) -> Self {
        let channel = channel.into();
        let id = ListenerId::new(format!("{}::{}", self.name, channel));
        self.registrations.push(Registration {
            channel,
            id,
            priority,
            listener: Arc::new(listener),
        });
        self
    }

    /// Register every staged listener on `bus`.
    pub fn subscribe(self, bus: &Bus) -> SubscribedPlugin {
        for reg in &self.registrations {
            bus.subscribe(&reg.channel, reg.id.clone(), Some(reg.priority), ArcListener(reg.listener.clone()));
        }
        SubscribedPlugin { plugin: self }
    }
}

/// A `Listener` that forwards through a shared `Arc<dyn Listener>`, so a
/// `SimplePlugin`'s staged listeners (already boxed once) don't need to be
/// reboxed on `subscribe`.
struct ArcListener(Arc<dyn Listener>);

impl Listener for ArcListener {
    fn call(&self, payload: &crate::error::Payload) -> Result<(), crate::error::ListenerError> {
        self.0.call(payload)
    }
}

/// A [`SimplePlugin`] that has been subscribed to a bus. Holding onto this
/// (rather than discarding the value `subscribe` returns) is what lets you
/// later remove exactly the listeners it staged.
pub struct SubscribedPlugin {
    plugin: SimplePlugin,
}

impl SubscribedPlugin {
    pub fn unsubscribe(self, bus: &Bus) {
        for reg in &self.plugin.registrations {
            bus.unsubscribe(&reg.channel, reg.id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ListenerError, Payload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_bus() -> Bus {
        Bus::builder()
            .transitions(crate::graph::edge_map(&[("A", &["B"])]))
            .initial_state("A")
            .build()
    }

    #[test]
    fn subscribe_runs_staged_listeners() {
        let bus = test_bus();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        SimplePlugin::new("counter")
            .on("B", move |_: &Payload| -> Result<(), ListenerError> {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .subscribe(&bus);

        bus.publish("B", &Payload::None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_only_this_plugins_listeners() {
        let bus = test_bus();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let plugin = SimplePlugin::new("first")
            .on("B", move |_: &Payload| -> Result<(), ListenerError> {
                o1.lock().unwrap().push("first");
                Ok(())
            })
            .subscribe(&bus);

        let o2 = order.clone();
        bus.subscribe("B", "second::B", None, move |_: &Payload| -> Result<(), ListenerError> {
            o2.lock().unwrap().push("second");
            Ok(())
        });

        plugin.unsubscribe(&bus);
        bus.publish("B", &Payload::None).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["second"]);
    }
}
