//! Outbound delivery to connected peers
//!
//! Each connection owns one unbounded queue drained by its writer task, so
//! messages from the hub reach a given peer in the order they were queued.
//! Delivery is best-effort: sends to closed peers are dropped silently.

use crate::registry::{ConnectionId, Liveness, Registry};
use log::{debug, error};
use shared::{Envelope, Payload};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Frames queued for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close,
}

pub type PeerSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug)]
struct Peer {
    sender: PeerSender,
    open: bool,
}

/// Outbound queues for every live connection, pending or registered
#[derive(Debug, Default)]
pub struct Outbox {
    peers: HashMap<ConnectionId, Peer>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, conn: ConnectionId, sender: PeerSender) {
        self.peers.insert(conn, Peer { sender, open: true });
    }

    pub fn detach(&mut self, conn: ConnectionId) {
        self.peers.remove(&conn);
    }

    pub fn is_open(&self, conn: ConnectionId) -> bool {
        self.peers.get(&conn).is_some_and(|peer| peer.open)
    }

    /// Queues an already encoded frame; false if the peer is gone or closed
    pub fn send_text(&mut self, conn: ConnectionId, text: &str) -> bool {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return false;
        };
        if !peer.open {
            return false;
        }
        if peer.sender.send(Outbound::Text(text.to_string())).is_err() {
            debug!("Writer for connection {} is gone, marking closed", conn);
            peer.open = false;
            return false;
        }
        true
    }

    pub fn send(&mut self, conn: ConnectionId, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(text) => self.send_text(conn, &text),
            Err(e) => {
                error!("Failed to encode message for {}: {}", conn, e);
                false
            }
        }
    }

    /// Asks the writer to close the socket; closing twice is a no-op
    pub fn close(&mut self, conn: ConnectionId) {
        if let Some(peer) = self.peers.get_mut(&conn) {
            if peer.open {
                peer.open = false;
                let _ = peer.sender.send(Outbound::Close);
            }
        }
    }

    pub fn close_all(&mut self) {
        let conns: Vec<ConnectionId> = self.peers.keys().copied().collect();
        for conn in conns {
            self.close(conn);
        }
    }

    /// Sends to every registered device whose connection is open
    pub fn broadcast_all(&mut self, registry: &Registry, envelope: &Envelope) {
        let Ok(text) = envelope.encode() else {
            error!("Failed to encode broadcast message");
            return;
        };
        for (conn, _) in registry.list_open() {
            self.send_text(conn, &text);
        }
    }

    /// Sends the same frame to every open display
    pub fn broadcast_displays(&mut self, registry: &Registry, envelope: &Envelope) {
        let Ok(text) = envelope.encode() else {
            error!("Failed to encode display broadcast");
            return;
        };
        for (conn, _) in registry.list_displays() {
            self.send_text(conn, &text);
        }
    }

    /// Resolves `device_id` and sends to it; no-op if absent or closed
    pub fn send_to(&mut self, registry: &Registry, device_id: &str, envelope: &Envelope) -> bool {
        match registry.find_by_id(device_id) {
            Some((conn, device)) if device.liveness == Liveness::Open => self.send(conn, envelope),
            _ => false,
        }
    }

    /// Sends to the controller; no-op if none is registered
    pub fn notify_controller(&mut self, registry: &Registry, envelope: &Envelope) -> bool {
        match registry.controller() {
            Some(conn) => self.send(conn, envelope),
            None => false,
        }
    }

    /// Pushes the current device list to the controller
    pub fn refresh_controller(&mut self, registry: &Registry) {
        let envelope = Envelope::system(Payload::DeviceList(registry.device_list()));
        self.notify_controller(registry, &envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use shared::{Command, Role};

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn setup() -> (
        Registry,
        Outbox,
        Vec<(String, mpsc::UnboundedReceiver<Outbound>)>,
    ) {
        let mut registry = Registry::new();
        let mut outbox = Outbox::new();
        let mut rng = StdRng::seed_from_u64(1);
        let mut receivers = Vec::new();
        let roles = [Role::Controller, Role::Display, Role::Display];
        for (i, role) in roles.into_iter().enumerate() {
            let conn = ConnectionId(i as u64 + 1);
            let (tx, rx) = mpsc::unbounded_channel();
            outbox.attach(conn, tx);
            let device = registry
                .register(conn, role, format!("user{}", i), &mut rng)
                .unwrap();
            receivers.push((device.id, rx));
        }
        (registry, outbox, receivers)
    }

    #[test]
    fn test_broadcast_all_reaches_every_open_device() {
        let (registry, mut outbox, mut receivers) = setup();
        let envelope = Envelope::system(Payload::System("hello".into()));
        outbox.broadcast_all(&registry, &envelope);

        for (_, rx) in receivers.iter_mut() {
            assert_eq!(drain(rx).len(), 1);
        }
    }

    #[test]
    fn test_broadcast_skips_closed_connections() {
        let (mut registry, mut outbox, mut receivers) = setup();
        outbox.close(ConnectionId(2));
        registry.mark_closed(ConnectionId(2));

        let envelope = Envelope::system(Payload::System("hello".into()));
        outbox.broadcast_all(&registry, &envelope);

        assert_eq!(drain(&mut receivers[1].1), vec![Outbound::Close]);
        assert_eq!(drain(&mut receivers[2].1).len(), 1);
    }

    #[test]
    fn test_closed_peer_never_receives_after_close() {
        let (registry, mut outbox, mut receivers) = setup();
        outbox.close(ConnectionId(3));
        outbox.close(ConnectionId(3));

        let envelope = Envelope::system(Payload::Command(Command::off()));
        outbox.broadcast_displays(&registry, &envelope);

        assert_eq!(drain(&mut receivers[2].1), vec![Outbound::Close]);
        assert_eq!(drain(&mut receivers[1].1).len(), 1);
        assert!(drain(&mut receivers[0].1).is_empty());
    }

    #[test]
    fn test_send_to_by_device_id() {
        let (registry, mut outbox, mut receivers) = setup();
        let target = receivers[1].0.clone();
        let envelope = Envelope::system(Payload::Command(Command::off()));

        assert!(outbox.send_to(&registry, &target, &envelope));
        assert!(!outbox.send_to(&registry, "00000000x", &envelope));
        assert_eq!(drain(&mut receivers[1].1).len(), 1);
        assert!(drain(&mut receivers[2].1).is_empty());
    }

    #[test]
    fn test_dropped_writer_marks_peer_closed() {
        let (registry, mut outbox, mut receivers) = setup();
        let (_, rx) = receivers.remove(1);
        drop(rx);

        let envelope = Envelope::system(Payload::System("x".into()));
        outbox.broadcast_all(&registry, &envelope);
        assert!(!outbox.is_open(ConnectionId(2)));
        assert!(outbox.is_open(ConnectionId(3)));
    }

    #[test]
    fn test_notify_controller() {
        let (mut registry, mut outbox, mut receivers) = setup();
        outbox.refresh_controller(&registry);

        let frames = drain(&mut receivers[0].1);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Outbound::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text).unwrap();
                assert_eq!(value["type"], "deviceList");
                assert_eq!(value["content"].as_array().unwrap().len(), 3);
            }
            other => panic!("Unexpected frame: {:?}", other),
        }

        registry.unregister(ConnectionId(1));
        let envelope = Envelope::system(Payload::System("x".into()));
        assert!(!outbox.notify_controller(&registry, &envelope));
    }
}
