//! Device model and discovery registry

use crate::types::Rotation;
use std::net::IpAddr;

/// Reported availability of a motion platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Free to be claimed by a check-in
    Available,
    /// Claimed by another session
    Reserved,
    /// Manually entered device whose status has not been reported
    Unknown,
}

/// A physical motion platform reachable over the network
///
/// Created by the discovery service or by manual entry. Registry entries are
/// replaced, never mutated in place, when status or control port changes;
/// only the last-reported orientation is updated on a live device.
#[derive(Debug, Clone, PartialEq)]
pub struct YawDevice {
    /// Stable identity (device MAC address string)
    pub id: String,
    /// Display name
    pub name: String,
    /// Network address
    pub address: IpAddr,
    /// Control channel (TCP) port
    pub tcp_port: u16,
    /// Telemetry channel (UDP) port
    pub udp_port: u16,
    /// Reported availability
    pub status: DeviceStatus,
    /// Last orientation reported by the platform, if any
    pub actual_position: Option<Rotation>,
}

impl YawDevice {
    /// Create a device entry from a discovery response
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: IpAddr,
        tcp_port: u16,
        udp_port: u16,
        status: DeviceStatus,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address,
            tcp_port,
            udp_port,
            status,
            actual_position: None,
        }
    }

    /// Create a manually entered device (address and ports typed in by hand)
    ///
    /// Status starts as `Unknown`; connecting requires marking it
    /// `Available` once the caller has reason to believe it is.
    pub fn manual(address: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self::new(
            "Manually set device",
            "Manually set device",
            address,
            tcp_port,
            udp_port,
            DeviceStatus::Unknown,
        )
    }
}

/// Device-reported tilt bounds in degrees
///
/// Absent until the platform sends a tilt-limits report. Pitch is bounded
/// asymmetrically (`[-pitch_backward, +pitch_forward]` in signed form), roll
/// symmetrically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiltLimits {
    pub pitch_forward: i32,
    pub pitch_backward: i32,
    pub roll: i32,
}

/// Ordered collection of discovered devices
///
/// Iteration order is append order. An updated entry (changed status or
/// control port) is removed and re-appended, so it moves to the end; this
/// reordering is observable by consumers and deliberate.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<YawDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a discovery response into the registry
    ///
    /// Returns `true` when the registry changed (new entry, or an existing
    /// entry replaced). A repeat report with identical fields is a no-op.
    pub fn fold(&mut self, device: YawDevice) -> bool {
        if let Some(index) = self.devices.iter().position(|d| d.id == device.id) {
            let known = &self.devices[index];
            if known.status != device.status || known.tcp_port != device.tcp_port {
                self.devices.remove(index);
                self.devices.push(device);
                true
            } else {
                false
            }
        } else {
            self.devices.push(device);
            true
        }
    }

    /// Devices in iteration order
    pub fn devices(&self) -> &[YawDevice] {
        &self.devices
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn device(id: &str, status: DeviceStatus) -> YawDevice {
        YawDevice::new(
            id,
            "Sim",
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            50020,
            50010,
            status,
        )
    }

    #[test]
    fn test_manual_device_starts_unknown() {
        let device = YawDevice::manual(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 50020, 50010);
        assert_eq!(device.status, DeviceStatus::Unknown);
        assert_eq!(device.id, "Manually set device");
        assert!(device.actual_position.is_none());
    }

    #[test]
    fn test_fold_appends_unknown_id() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.fold(device("X", DeviceStatus::Available)));
        assert!(registry.fold(device("Y", DeviceStatus::Available)));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.devices()[0].id, "X");
        assert_eq!(registry.devices()[1].id, "Y");
    }

    #[test]
    fn test_fold_identical_report_is_noop() {
        let mut registry = DeviceRegistry::new();
        registry.fold(device("X", DeviceStatus::Available));
        assert!(!registry.fold(device("X", DeviceStatus::Available)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_fold_changed_status_reorders() {
        let mut registry = DeviceRegistry::new();
        registry.fold(device("X", DeviceStatus::Available));
        registry.fold(device("Y", DeviceStatus::Available));

        // Status change removes and re-appends, moving X to the end
        assert!(registry.fold(device("X", DeviceStatus::Reserved)));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.devices()[0].id, "Y");
        assert_eq!(registry.devices()[1].id, "X");
        assert_eq!(registry.devices()[1].status, DeviceStatus::Reserved);
    }

    #[test]
    fn test_fold_changed_tcp_port_reorders() {
        let mut registry = DeviceRegistry::new();
        registry.fold(device("X", DeviceStatus::Available));
        registry.fold(device("Y", DeviceStatus::Available));

        let mut moved = device("X", DeviceStatus::Available);
        moved.tcp_port = 50099;
        assert!(registry.fold(moved));
        assert_eq!(registry.devices()[1].id, "X");
        assert_eq!(registry.devices()[1].tcp_port, 50099);
    }
}
