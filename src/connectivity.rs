//! Network connectivity tracking for dispatch gating.
//!
//! # Overview
//!
//! The engine never probes the network itself. The host application owns
//! platform-specific connectivity detection and feeds the current state into
//! a [`ConnectivityMonitor`]; the scheduler subscribes to changes and gates
//! dispatch on each task's [`NetworkRequirement`].
//!
//! # Example
//!
//! ```
//! use downlink::connectivity::{ConnectivityMonitor, ConnectivitySnapshot, NetworkKind};
//!
//! let monitor = ConnectivityMonitor::new(ConnectivitySnapshot::offline());
//! monitor.set(ConnectivitySnapshot::online([NetworkKind::Wifi]));
//! assert!(monitor.current().is_online());
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;

use crate::task::NetworkRequirement;

/// A kind of network interface the device may be connected through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkKind {
    /// Wireless LAN. Unmetered.
    Wifi,
    /// Wired LAN. Unmetered.
    Ethernet,
    /// Cellular data. Metered.
    Mobile,
}

/// An immutable view of which network kinds are currently available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    available: HashSet<NetworkKind>,
}

impl ConnectivitySnapshot {
    /// A snapshot with no connectivity at all.
    #[must_use]
    pub fn offline() -> Self {
        Self::default()
    }

    /// A snapshot with the given network kinds available.
    #[must_use]
    pub fn online(kinds: impl IntoIterator<Item = NetworkKind>) -> Self {
        Self {
            available: kinds.into_iter().collect(),
        }
    }

    /// True when at least one network kind is available.
    #[must_use]
    pub fn is_online(&self) -> bool {
        !self.available.is_empty()
    }

    /// True when the given network kind is available.
    #[must_use]
    pub fn has(&self, kind: NetworkKind) -> bool {
        self.available.contains(&kind)
    }

    /// Whether this snapshot satisfies a task's network requirement.
    ///
    /// `Any` is satisfied by any online network. `WifiOnly` requires wifi
    /// specifically. `Unmetered` accepts wifi or ethernet but not mobile
    /// data.
    #[must_use]
    pub fn satisfies(&self, requirement: NetworkRequirement) -> bool {
        match requirement {
            NetworkRequirement::Any => self.is_online(),
            NetworkRequirement::WifiOnly => self.has(NetworkKind::Wifi),
            NetworkRequirement::Unmetered => {
                self.has(NetworkKind::Wifi) || self.has(NetworkKind::Ethernet)
            }
        }
    }
}

/// Shared connectivity state with change notification.
///
/// Cheap to clone; all clones publish to and observe the same state. The
/// host application calls [`set`](Self::set) whenever the platform reports a
/// connectivity change, and the scheduler reacts through
/// [`subscribe`](Self::subscribe).
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<ConnectivitySnapshot>>,
}

impl ConnectivityMonitor {
    /// Creates a monitor with the given initial state.
    #[must_use]
    pub fn new(initial: ConnectivitySnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Returns the current connectivity snapshot.
    #[must_use]
    pub fn current(&self) -> ConnectivitySnapshot {
        self.tx.borrow().clone()
    }

    /// Publishes a new connectivity snapshot to all subscribers.
    pub fn set(&self, snapshot: ConnectivitySnapshot) {
        self.tx.send_replace(snapshot);
    }

    /// Subscribes to connectivity changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    /// A monitor that starts online with every network kind available.
    fn default() -> Self {
        Self::new(ConnectivitySnapshot::online([
            NetworkKind::Wifi,
            NetworkKind::Ethernet,
            NetworkKind::Mobile,
        ]))
    }
}
