//! Connection registry for the orchestration server
//!
//! Pure bookkeeping over registered connections:
//! - One [`Device`] record per connection that has chosen a role
//! - Single-controller exclusivity
//! - Collision-free device id generation
//! - Device lookups by connection and by id
//!
//! Connections that have not yet chosen a role live in the role arbiter, not
//! here. The registry holds no policy beyond the controller invariant; the
//! hub decides when a change is worth telling the controller about.

use crate::error::HubError;
use log::info;
use rand::Rng;
use shared::{DeviceEntry, Role, STATUS_CONNECTED};
use std::collections::HashMap;
use std::fmt;

/// Server-assigned handle for one accepted socket
///
/// Handles are issued in increasing order, which gives the registry a stable
/// iteration order for the sequential pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Open,
    Closed,
}

/// A registered device and its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// Random 8-hex-digit token, unique for the registry's lifetime
    pub id: String,
    pub role: Role,
    /// Human label set through a rename command
    pub display_name: Option<String>,
    pub username: String,
    pub liveness: Liveness,
}

impl Device {
    pub fn is_open_display(&self) -> bool {
        self.role == Role::Display && self.liveness == Liveness::Open
    }

    pub fn to_entry(&self) -> DeviceEntry {
        DeviceEntry {
            id: self.id.clone(),
            role: self.role,
            username: self.username.clone(),
            name: self.display_name.clone(),
            status: STATUS_CONNECTED.to_string(),
        }
    }
}

/// Mapping from connection to device, with the controller tracked separately
#[derive(Debug, Default)]
pub struct Registry {
    devices: HashMap<ConnectionId, Device>,
    controller: Option<ConnectionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `conn` under `role`
    ///
    /// Fails with [`HubError::RoleConflict`] when a different connection
    /// already holds the controller role. Registering an already registered
    /// connection again keeps its id and display name and replaces role and
    /// username.
    pub fn register<R: Rng>(
        &mut self,
        conn: ConnectionId,
        role: Role,
        username: String,
        rng: &mut R,
    ) -> Result<Device, HubError> {
        if role == Role::Controller {
            if let Some(existing) = self.controller {
                if existing != conn {
                    return Err(HubError::RoleConflict);
                }
            }
        }

        let (id, display_name) = match self.devices.get(&conn) {
            Some(existing) => (existing.id.clone(), existing.display_name.clone()),
            None => (self.generate_id(rng), None),
        };

        if role == Role::Controller {
            self.controller = Some(conn);
        } else if self.controller == Some(conn) {
            self.controller = None;
        }

        let device = Device {
            id,
            role,
            display_name,
            username,
            liveness: Liveness::Open,
        };
        info!(
            "Connection {} registered as {} with id {}",
            conn, role, device.id
        );
        self.devices.insert(conn, device.clone());
        Ok(device)
    }

    /// Removes the device for `conn`, returning it if one was registered
    pub fn unregister(&mut self, conn: ConnectionId) -> Option<Device> {
        if self.controller == Some(conn) {
            info!("Master device disconnected");
            self.controller = None;
        }
        self.devices.remove(&conn)
    }

    /// Sets the human label of the device on `conn`; no-op if unregistered
    pub fn rename(&mut self, conn: ConnectionId, name: String) -> bool {
        match self.devices.get_mut(&conn) {
            Some(device) => {
                device.display_name = Some(name);
                true
            }
            None => false,
        }
    }

    /// Marks a device as closed ahead of its connection being torn down
    pub fn mark_closed(&mut self, conn: ConnectionId) {
        if let Some(device) = self.devices.get_mut(&conn) {
            device.liveness = Liveness::Closed;
        }
    }

    /// Open display devices, ordered by connection handle
    pub fn list_displays(&self) -> Vec<(ConnectionId, &Device)> {
        let mut displays: Vec<_> = self
            .devices
            .iter()
            .filter(|(_, device)| device.is_open_display())
            .map(|(conn, device)| (*conn, device))
            .collect();
        displays.sort_by_key(|(conn, _)| *conn);
        displays
    }

    /// Every open device, ordered by connection handle
    pub fn list_open(&self) -> Vec<(ConnectionId, &Device)> {
        let mut devices: Vec<_> = self
            .devices
            .iter()
            .filter(|(_, device)| device.liveness == Liveness::Open)
            .map(|(conn, device)| (*conn, device))
            .collect();
        devices.sort_by_key(|(conn, _)| *conn);
        devices
    }

    pub fn device_list(&self) -> Vec<DeviceEntry> {
        self.list_open()
            .into_iter()
            .map(|(_, device)| device.to_entry())
            .collect()
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&Device> {
        self.devices.get(&conn)
    }

    pub fn find_by_id(&self, device_id: &str) -> Option<(ConnectionId, &Device)> {
        self.devices
            .iter()
            .find(|(_, device)| device.id == device_id)
            .map(|(conn, device)| (*conn, device))
    }

    pub fn controller(&self) -> Option<ConnectionId> {
        self.controller
    }

    pub fn is_controller(&self, conn: ConnectionId) -> bool {
        self.controller == Some(conn)
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.controller = None;
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn generate_id<R: Rng>(&self, rng: &mut R) -> String {
        loop {
            let candidate = format!("{:08x}", rng.gen::<u32>());
            if self.find_by_id(&candidate).is_none() {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_register_assigns_hex_id() {
        let mut registry = Registry::new();
        let device = registry
            .register(ConnectionId(1), Role::Display, "client-a".into(), &mut rng())
            .unwrap();

        assert_eq!(device.id.len(), 8);
        assert!(device.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(device.liveness, Liveness::Open);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let mut registry = Registry::new();
        let mut rng = rng();
        for i in 0..200 {
            registry
                .register(ConnectionId(i), Role::Display, format!("d{}", i), &mut rng)
                .unwrap();
        }
        let mut ids: Vec<_> = registry
            .list_displays()
            .into_iter()
            .map(|(_, d)| d.id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn test_second_controller_rejected() {
        let mut registry = Registry::new();
        let mut rng = rng();
        registry
            .register(ConnectionId(1), Role::Controller, "m1".into(), &mut rng)
            .unwrap();

        let result = registry.register(ConnectionId(2), Role::Controller, "m2".into(), &mut rng);
        assert!(matches!(result, Err(HubError::RoleConflict)));
        assert_eq!(registry.controller(), Some(ConnectionId(1)));
        assert!(registry.get(ConnectionId(2)).is_none());
    }

    #[test]
    fn test_controller_can_reregister_on_same_connection() {
        let mut registry = Registry::new();
        let mut rng = rng();
        let first = registry
            .register(ConnectionId(1), Role::Controller, "m".into(), &mut rng)
            .unwrap();
        let second = registry
            .register(ConnectionId(1), Role::Controller, "m".into(), &mut rng)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rejoin_keeps_display_name() {
        let mut registry = Registry::new();
        let mut rng = rng();
        let first = registry
            .register(ConnectionId(4), Role::Display, "d".into(), &mut rng)
            .unwrap();
        assert!(registry.rename(ConnectionId(4), "Left wall".into()));

        let again = registry
            .register(ConnectionId(4), Role::Display, "d2".into(), &mut rng)
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.display_name.as_deref(), Some("Left wall"));
        assert_eq!(again.username, "d2");
    }

    #[test]
    fn test_controller_slot_freed_on_unregister() {
        let mut registry = Registry::new();
        let mut rng = rng();
        registry
            .register(ConnectionId(1), Role::Controller, "m1".into(), &mut rng)
            .unwrap();
        let removed = registry.unregister(ConnectionId(1)).unwrap();
        assert_eq!(removed.role, Role::Controller);
        assert_eq!(registry.controller(), None);

        assert!(registry
            .register(ConnectionId(2), Role::Controller, "m2".into(), &mut rng)
            .is_ok());
    }

    #[test]
    fn test_unregister_unknown_connection() {
        let mut registry = Registry::new();
        assert!(registry.unregister(ConnectionId(99)).is_none());
    }

    #[test]
    fn test_rename_keeps_id_and_role() {
        let mut registry = Registry::new();
        let device = registry
            .register(ConnectionId(3), Role::Display, "client-x".into(), &mut rng())
            .unwrap();

        assert!(registry.rename(ConnectionId(3), "Left wall".into()));
        let entries = registry.device_list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, device.id);
        assert_eq!(entries[0].role, Role::Display);
        assert_eq!(entries[0].name.as_deref(), Some("Left wall"));

        assert!(!registry.rename(ConnectionId(4), "ghost".into()));
    }

    #[test]
    fn test_list_displays_skips_controller_and_closed() {
        let mut registry = Registry::new();
        let mut rng = rng();
        registry
            .register(ConnectionId(1), Role::Controller, "m".into(), &mut rng)
            .unwrap();
        registry
            .register(ConnectionId(2), Role::Display, "a".into(), &mut rng)
            .unwrap();
        registry
            .register(ConnectionId(3), Role::Display, "b".into(), &mut rng)
            .unwrap();
        registry.mark_closed(ConnectionId(3));

        let displays = registry.list_displays();
        assert_eq!(displays.len(), 1);
        assert_eq!(displays[0].0, ConnectionId(2));
        assert_eq!(registry.device_list().len(), 2);
    }

    #[test]
    fn test_find_by_id() {
        let mut registry = Registry::new();
        let device = registry
            .register(ConnectionId(5), Role::Display, "a".into(), &mut rng())
            .unwrap();
        let (conn, found) = registry.find_by_id(&device.id).unwrap();
        assert_eq!(conn, ConnectionId(5));
        assert_eq!(found.username, "a");
        assert!(registry.find_by_id("ffffffff_").is_none());
    }
}
