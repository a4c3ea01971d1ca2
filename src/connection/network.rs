//! Network path snapshots fed in by the platform's path monitor.

use serde::Serialize;

/// Reachability reported for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Satisfied,
    Unsatisfied,
    /// Reachable once a connection (e.g. VPN on demand) is established.
    RequiresConnection,
}

/// Physical interface kinds a path can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceType {
    Wifi,
    Cellular,
    Ethernet,
}

/// One observation from the network path monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPath {
    pub status: PathStatus,

    /// Low-data mode or similar restriction.
    pub is_constrained: bool,

    /// Interfaces the path currently uses.
    pub interfaces: Vec<InterfaceType>,
}

impl NetworkPath {
    /// A satisfied, unconstrained path over a single interface.
    #[must_use]
    pub fn satisfied(interface: InterfaceType) -> Self {
        Self {
            status: PathStatus::Satisfied,
            is_constrained: false,
            interfaces: vec![interface],
        }
    }

    /// A path with no connectivity.
    #[must_use]
    pub fn unsatisfied() -> Self {
        Self {
            status: PathStatus::Unsatisfied,
            is_constrained: false,
            interfaces: Vec::new(),
        }
    }

    /// Same path, marked constrained.
    #[must_use]
    pub fn constrained(mut self) -> Self {
        self.is_constrained = true;
        self
    }

    /// Whether the path uses the given interface.
    #[must_use]
    pub fn uses(&self, interface: InterfaceType) -> bool {
        self.interfaces.contains(&interface)
    }

    /// Map the path onto the connectivity status exposed to the app.
    #[must_use]
    pub fn network_status(&self) -> NetworkStatus {
        match (self.status, self.is_constrained) {
            (PathStatus::Satisfied, false) => NetworkStatus::Available,
            (PathStatus::Satisfied, true) => NetworkStatus::Constrained,
            (PathStatus::Unsatisfied, _) => NetworkStatus::Unavailable,
            (PathStatus::RequiresConnection, _) => NetworkStatus::Unknown,
        }
    }
}

/// Connectivity as seen by the rest of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Available,
    Constrained,
    Unavailable,
    #[default]
    Unknown,
}

impl NetworkStatus {
    /// Whether a connection attempt can reasonably succeed.
    #[must_use]
    pub fn is_available(self) -> bool {
        matches!(self, Self::Available | Self::Constrained)
    }
}

/// Detect a switch between Wi-Fi and cellular.
///
/// The first observation (no `old` path) is never a change, and a path that
/// only toggles its constrained flag stays on the same interface.
#[must_use]
pub fn did_interface_change(old: Option<&NetworkPath>, new: &NetworkPath) -> bool {
    let Some(old) = old else {
        return false;
    };
    old.uses(InterfaceType::Wifi) != new.uses(InterfaceType::Wifi)
        || old.uses(InterfaceType::Cellular) != new.uses(InterfaceType::Cellular)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wifi_to_cellular_is_change() {
        let wifi = NetworkPath::satisfied(InterfaceType::Wifi);
        let cellular = NetworkPath::satisfied(InterfaceType::Cellular);
        assert!(did_interface_change(Some(&wifi), &cellular));
        assert!(did_interface_change(Some(&cellular), &wifi));
    }

    #[test]
    fn same_interface_is_not_change() {
        let wifi = NetworkPath::satisfied(InterfaceType::Wifi);
        assert!(!did_interface_change(Some(&wifi), &wifi.clone()));
    }

    #[test]
    fn constrained_toggle_is_not_change() {
        let constrained = NetworkPath::satisfied(InterfaceType::Wifi).constrained();
        let wifi = NetworkPath::satisfied(InterfaceType::Wifi);
        assert!(!did_interface_change(Some(&constrained), &wifi));
    }

    #[test]
    fn first_observation_is_not_change() {
        assert!(!did_interface_change(
            None,
            &NetworkPath::satisfied(InterfaceType::Cellular)
        ));
        assert!(!did_interface_change(None, &NetworkPath::unsatisfied()));
    }

    #[test]
    fn ethernet_only_switch_is_not_tracked() {
        let ethernet = NetworkPath::satisfied(InterfaceType::Ethernet);
        let none = NetworkPath::unsatisfied();
        assert!(!did_interface_change(Some(&ethernet), &none));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            NetworkPath::satisfied(InterfaceType::Wifi).network_status(),
            NetworkStatus::Available
        );
        assert_eq!(
            NetworkPath::satisfied(InterfaceType::Wifi)
                .constrained()
                .network_status(),
            NetworkStatus::Constrained
        );
        assert_eq!(
            NetworkPath::unsatisfied().network_status(),
            NetworkStatus::Unavailable
        );
        let pending = NetworkPath {
            status: PathStatus::RequiresConnection,
            is_constrained: false,
            interfaces: vec![],
        };
        assert_eq!(pending.network_status(), NetworkStatus::Unknown);
        assert!(!NetworkStatus::Unknown.is_available());
        assert!(NetworkStatus::Constrained.is_available());
    }
}
