//! A process-lifecycle state machine with an in-process publish/subscribe
//! bus.
//!
//! [`Bus`] models a set of named states (§3) connected by a transition
//! graph (§4.1): moving the bus into state `N` publishes to every listener
//! subscribed on the channel named `N`, in priority order, and a listener
//! failure can be redirected to an error state instead of simply
//! propagating out of the caller (§4.3). [`ProcessBus`] wires this up with
//! the fixed `INITIAL -> ENTER -> IDLE -> START -> RUN -> STOP -> ...`
//! graph a whole OS process's lifecycle needs, plus the built-in listeners
//! that keep a failed start or stop from leaving the process stuck (§4.6).
//!
//! ```
//! use magicbus::{Bus, Payload};
//!
//! let bus = Bus::builder()
//!     .transitions(magicbus::edge_map(&[("IDLE", &["RUN"]), ("RUN", &["IDLE"])]))
//!     .initial_state("IDLE")
//!     .build();
//!
//! bus.subscribe("RUN", "printer", None, |_: &Payload| -> Result<(), magicbus::ListenerError> {
//!     println!("now running");
//!     Ok(())
//! });
//!
//! bus.transition("RUN").unwrap();
//! assert_eq!(bus.state(), magicbus::ChannelId::new("RUN"));
//! ```

pub mod bus;
pub mod channel;
pub mod error;
pub mod graph;
pub mod plugin;
pub mod process;
pub mod registry;
mod wait;

pub use bus::{Bus, BusBuilder};
pub use channel::{ChannelId, StateId};
pub use error::{BusError, CapturedError, ChannelFailures, ListenerError, LogLevel, Payload};
pub use graph::{edge_map, EdgeMap, Graph};
pub use plugin::{SimplePlugin, SubscribedPlugin};
pub use process::ProcessBus;
pub use registry::{Listener, ListenerId, DEFAULT_PRIORITY};
