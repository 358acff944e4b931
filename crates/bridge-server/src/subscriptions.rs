//! Capability name → interested connections, plus the "all notifications" set.
//!
//! One lock guards every set and the live-connection roster, so a reader
//! never sees a half-applied change and a connection whose teardown has
//! started can neither be re-added nor handed a new notification.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use bridge_core::{ConnectionId, SubscriptionError};
use parking_lot::RwLock;

/// Subscribable device capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    ButtonState,
    ButtonEdges,
}

impl Capability {
    pub const ALL: [Capability; 2] = [Capability::ButtonState, Capability::ButtonEdges];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ButtonState => "get_button_state",
            Self::ButtonEdges => "subscribe_button_edges",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get_button_state" => Ok(Self::ButtonState),
            "subscribe_button_edges" => Ok(Self::ButtonEdges),
            other => Err(SubscriptionError::InvalidSubscription(other.to_string())),
        }
    }
}

/// Who a notification is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience {
    Capability(Capability),
    Everyone,
}

#[derive(Default)]
struct Inner {
    live: HashSet<ConnectionId>,
    by_capability: HashMap<Capability, BTreeSet<ConnectionId>>,
    broadcast: BTreeSet<ConnectionId>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a freshly opened connection. Only admitted connections can subscribe.
    pub fn register_connection(&self, id: &ConnectionId) {
        self.inner.write().live.insert(id.clone());
    }

    /// Subscribe by wire name. Returns whether the connection was newly added.
    pub fn subscribe(&self, capability: &str, id: &ConnectionId) -> Result<bool, SubscriptionError> {
        let capability: Capability = capability.parse()?;
        self.subscribe_capability(capability, id)
    }

    pub fn subscribe_capability(
        &self,
        capability: Capability,
        id: &ConnectionId,
    ) -> Result<bool, SubscriptionError> {
        let mut inner = self.inner.write();
        if !inner.live.contains(id) {
            return Err(SubscriptionError::ConnectionClosed(id.to_string()));
        }
        let added = inner
            .by_capability
            .entry(capability)
            .or_default()
            .insert(id.clone());
        if added {
            tracing::info!(
                connection_id = %id,
                capability = %capability,
                subscribers = inner.by_capability[&capability].len(),
                "Connection subscribed"
            );
        }
        Ok(added)
    }

    /// Join the broadcast set. A connection already torn down is ignored.
    pub fn subscribe_all(&self, id: &ConnectionId) -> bool {
        let mut inner = self.inner.write();
        if !inner.live.contains(id) {
            return false;
        }
        inner.broadcast.insert(id.clone())
    }

    /// Drop every reference to `id`. Safe for unknown or never-subscribed ids.
    pub fn unsubscribe_all(&self, id: &ConnectionId) {
        let mut inner = self.inner.write();
        inner.live.remove(id);
        inner.broadcast.remove(id);
        for set in inner.by_capability.values_mut() {
            set.remove(id);
        }
    }

    /// Snapshot of the current subscribers to `capability`.
    pub fn subscribers_of(&self, capability: Capability) -> Vec<ConnectionId> {
        self.inner
            .read()
            .by_capability
            .get(&capability)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn broadcast_subscribers(&self) -> Vec<ConnectionId> {
        self.inner.read().broadcast.iter().cloned().collect()
    }

    pub fn has_subscribers(&self, capability: Capability) -> bool {
        self.inner
            .read()
            .by_capability
            .get(&capability)
            .is_some_and(|set| !set.is_empty())
    }

    pub fn is_subscribed(&self, capability: Capability, id: &ConnectionId) -> bool {
        self.inner
            .read()
            .by_capability
            .get(&capability)
            .is_some_and(|set| set.contains(id))
    }

    /// Call `deliver` once per distinct connection in any of `audiences`.
    ///
    /// The read lock is held for the whole pass, so `unsubscribe_all` waits
    /// for an in-flight delivery and none starts after it returns. `deliver`
    /// must not block.
    pub fn fan_out(&self, audiences: &[Audience], mut deliver: impl FnMut(&ConnectionId)) {
        let inner = self.inner.read();
        let mut seen: BTreeSet<&ConnectionId> = BTreeSet::new();
        for audience in audiences {
            let members: Box<dyn Iterator<Item = &ConnectionId>> = match audience {
                Audience::Everyone => Box::new(inner.broadcast.iter()),
                Audience::Capability(cap) => match inner.by_capability.get(cap) {
                    Some(set) => Box::new(set.iter()),
                    None => Box::new(std::iter::empty()),
                },
            };
            for id in members {
                if seen.insert(id) {
                    deliver(id);
                }
            }
        }
    }
}
