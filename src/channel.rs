//! Channel/state identity.
//!
//! Every state token doubles as a channel name (§3, §6 of the design):
//! the bus publishes to channel `N` whenever it transitions into state `N`.
//! A single interned-string type therefore serves both roles.

use std::fmt;
use std::sync::Arc;

/// A channel or state name. Cheap to clone (backed by `Arc<str>`) and
/// compared by content, not by pointer.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ChannelId(Arc<str>);

/// States are channels too (see module docs); this alias exists purely to
/// make call sites that think in terms of "desired state" read naturally.
pub type StateId = ChannelId;

impl ChannelId {
    pub fn new(name: impl AsRef<str>) -> Self {
        ChannelId(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({:?})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        ChannelId::new(s)
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        ChannelId(Arc::from(s))
    }
}

impl From<&ChannelId> for ChannelId {
    fn from(c: &ChannelId) -> Self {
        c.clone()
    }
}

impl std::borrow::Borrow<str> for ChannelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_content() {
        assert_eq!(ChannelId::new("RUN"), ChannelId::new("RUN"));
        assert_ne!(ChannelId::new("RUN"), ChannelId::new("STOP"));
    }

    #[test]
    fn cloning_is_cheap_and_shares_storage() {
        let a = ChannelId::new("IDLE");
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "IDLE");
    }
}
