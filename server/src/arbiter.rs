//! Role arbitration for freshly accepted connections
//!
//! A connection stays pending until it sends a join frame, closes, or runs
//! out of time. Two independent paths enforce the deadline: a deferred check
//! armed on accept and a periodic sweep. Both funnel into the hub, and both
//! are idempotent because an expired connection is no longer pending.

use crate::hub::HubEvent;
use crate::registry::ConnectionId;
use log::debug;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

#[derive(Debug)]
pub struct PendingConnection {
    pub conn: ConnectionId,
    pub accepted_at: Instant,
    deadline: Option<AbortHandle>,
}

impl PendingConnection {
    /// Cancels the deferred role-selection check
    fn disarm(&mut self) {
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.accepted_at) >= timeout
    }
}

/// Connections that have been accepted but have not chosen a role
#[derive(Debug)]
pub struct RoleArbiter {
    pending: HashMap<ConnectionId, PendingConnection>,
    timeout: Duration,
}

impl RoleArbiter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Tracks `conn` as pending and arms its deferred timeout check
    pub fn accept(&mut self, conn: ConnectionId, events: &mpsc::UnboundedSender<HubEvent>) {
        let accepted_at = Instant::now();
        let expires_at = accepted_at + self.timeout;
        let events = events.clone();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            let _ = events.send(HubEvent::RoleTimeout { conn });
        })
        .abort_handle();

        self.pending.insert(
            conn,
            PendingConnection {
                conn,
                accepted_at,
                deadline: Some(deadline),
            },
        );
    }

    /// Ends the pending phase for `conn`, on a role message or on close
    pub fn resolve(&mut self, conn: ConnectionId) -> Option<PendingConnection> {
        let mut pending = self.pending.remove(&conn)?;
        pending.disarm();
        Some(pending)
    }

    /// Handles the deferred check; true if `conn` was still pending
    pub fn expire(&mut self, conn: ConnectionId) -> bool {
        match self.pending.get(&conn) {
            Some(pending) if pending.is_stale(Instant::now(), self.timeout) => {
                self.pending.remove(&conn);
                true
            }
            _ => false,
        }
    }

    /// Removes and returns every pending connection older than the timeout
    pub fn sweep(&mut self, now: Instant) -> Vec<ConnectionId> {
        let stale: Vec<ConnectionId> = self
            .pending
            .values()
            .filter(|pending| pending.is_stale(now, self.timeout))
            .map(|pending| pending.conn)
            .collect();

        for conn in &stale {
            if let Some(mut pending) = self.pending.remove(conn) {
                debug!("Sweeping stale pending connection {}", conn);
                pending.disarm();
            }
        }
        stale
    }

    /// Drains every pending connection, disarming their checks
    pub fn drain(&mut self) -> Vec<ConnectionId> {
        self.pending
            .drain()
            .map(|(conn, mut pending)| {
                pending.disarm();
                conn
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deferred_check_fires_after_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut arbiter = RoleArbiter::new(Duration::from_secs(10));
        arbiter.accept(ConnectionId(1), &tx);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        match rx.try_recv() {
            Ok(HubEvent::RoleTimeout { conn }) => assert_eq!(conn, ConnectionId(1)),
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(arbiter.expire(ConnectionId(1)));
        assert!(!arbiter.pending.contains_key(&ConnectionId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_cancels_deferred_check() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut arbiter = RoleArbiter::new(Duration::from_secs(10));
        arbiter.accept(ConnectionId(1), &tx);

        assert!(arbiter.resolve(ConnectionId(1)).is_some());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(arbiter.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut arbiter = RoleArbiter::new(Duration::from_secs(10));
        arbiter.accept(ConnectionId(1), &tx);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(arbiter.expire(ConnectionId(1)));
        assert!(!arbiter.expire(ConnectionId(1)));
        assert!(arbiter.sweep(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_expire_keeps_connection_pending() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut arbiter = RoleArbiter::new(Duration::from_secs(10));
        arbiter.accept(ConnectionId(1), &tx);

        assert!(!arbiter.expire(ConnectionId(1)));
        assert!(arbiter.pending.contains_key(&ConnectionId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_only_removes_stale() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut arbiter = RoleArbiter::new(Duration::from_secs(10));
        arbiter.accept(ConnectionId(1), &tx);
        tokio::time::advance(Duration::from_secs(6)).await;
        arbiter.accept(ConnectionId(2), &tx);
        tokio::time::advance(Duration::from_secs(5)).await;

        let swept = arbiter.sweep(Instant::now());
        assert_eq!(swept, vec![ConnectionId(1)]);
        assert!(arbiter.pending.contains_key(&ConnectionId(2)));
        assert_eq!(arbiter.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_drain() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut arbiter = RoleArbiter::new(Duration::from_secs(10));
        arbiter.accept(ConnectionId(1), &tx);
        arbiter.accept(ConnectionId(2), &tx);

        let mut drained = arbiter.drain();
        drained.sort();
        assert_eq!(drained, vec![ConnectionId(1), ConnectionId(2)]);
        assert_eq!(arbiter.pending_count(), 0);
    }
}
