//! Server network layer: WebSocket accept loop and per-connection tasks
//!
//! Each accepted socket gets a reader task that turns frames into
//! [`HubEvent`]s and a writer task that drains the connection's outbound
//! queue. The main loop is the only place the [`Hub`] is touched.

use crate::broadcast::Outbound;
use crate::config::ServerConfig;
use crate::hub::{Hub, HubEvent};
use crate::registry::ConnectionId;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Time given to writer tasks to flush close frames on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);
/// How long a peer has to answer our close frame before the socket is dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Main server coordinating the listener, connection tasks and the hub
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    hub: Hub,
    hub_tx: mpsc::UnboundedSender<HubEvent>,
    hub_rx: mpsc::UnboundedReceiver<HubEvent>,
    next_conn: u64,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, BoxError> {
        let listener = TcpListener::bind(config.bind_address()).await?;
        info!("Server is running on {}", listener.local_addr()?);

        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let hub = Hub::new(&config, hub_tx.clone());

        Ok(Server {
            listener,
            config,
            hub,
            hub_tx,
            hub_rx,
            next_conn: 1,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until SIGINT or SIGTERM
    pub async fn run(self) -> Result<(), BoxError> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `shutdown` resolves, then closes every connection
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()>,
    {
        let period = self.config.sweep_interval;
        let mut sweep = interval_at(Instant::now() + period, period);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                },

                Some(event) = self.hub_rx.recv() => {
                    self.hub.handle(event);
                },

                _ = sweep.tick() => {
                    self.hub.handle(HubEvent::Sweep);
                },

                _ = &mut shutdown => {
                    info!("Shutdown requested. Closing server...");
                    self.hub.handle(HubEvent::Shutdown);
                    break;
                },
            }
        }

        tokio::time::sleep(SHUTDOWN_GRACE).await;
        drop(self.listener);
        info!("Server stopped");
        Ok(())
    }

    fn spawn_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let conn = ConnectionId(self.next_conn);
        self.next_conn += 1;
        let hub_tx = self.hub_tx.clone();
        let handshake_timeout = self.config.role_timeout;
        tokio::spawn(handle_connection(stream, peer, conn, hub_tx, handshake_timeout));
    }
}

/// Completes the upgrade handshake and pumps frames in both directions
///
/// A peer that has not finished the upgrade within `handshake_timeout` is
/// dropped before the hub ever hears of it.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn: ConnectionId,
    hub_tx: mpsc::UnboundedSender<HubEvent>,
    handshake_timeout: Duration,
) {
    let ws_stream = match timeout(handshake_timeout, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            info!("WebSocket handshake with {} timed out, dropping", peer);
            return;
        }
    };
    let (mut sink, mut source) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let (closing_tx, mut closing_rx) = oneshot::channel::<()>();

    if hub_tx
        .send(HubEvent::Connected {
            conn,
            peer,
            sender: out_tx,
        })
        .is_err()
    {
        return;
    }

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!("Failed to send to connection {}: {}", conn, e);
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = timeout(CLOSE_TIMEOUT, async {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                    })
                    .await;
                    break;
                }
            }
        }
        // Dropping the sender tells the reader we are done writing
        drop(closing_tx);
    });

    loop {
        let message = tokio::select! {
            message = source.next() => message,
            _ = &mut closing_rx => {
                // Wait briefly for the peer's close reply, then drop the socket
                let echoed = timeout(CLOSE_TIMEOUT, async {
                    while let Some(Ok(message)) = source.next().await {
                        if message.is_close() {
                            break;
                        }
                    }
                })
                .await;
                if echoed.is_err() {
                    debug!("Connection {} ignored close, terminating", conn);
                }
                break;
            }
        };

        let event = match message {
            Some(Ok(Message::Text(text))) => HubEvent::Message { conn, text },
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => HubEvent::Message { conn, text },
                Err(_) => {
                    warn!("Dropping non UTF-8 frame from connection {}", conn);
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                let _ = hub_tx.send(HubEvent::Error {
                    conn,
                    error: e.to_string(),
                });
                return;
            }
        };
        if hub_tx.send(event).is_err() {
            return;
        }
    }

    drop(source);
    let _ = hub_tx.send(HubEvent::Closed { conn });
}

/// Resolves on Ctrl+C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio_test::assert_ok;

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = assert_ok!(Server::new(local_config()).await);
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_run_until_releases_port() {
        let server = assert_ok!(Server::new(local_config()).await);
        let addr = server.local_addr().unwrap();
        server.run_until(async {}).await.unwrap();

        // The port is free again once the server has stopped
        assert_ok!(TcpListener::bind(addr).await);
    }

    #[tokio::test]
    async fn test_plain_tcp_client_never_reaches_hub() {
        let server = assert_ok!(Server::new(local_config()).await);
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        // A connection that never completes the upgrade is simply dropped
        let stream = TcpStream::connect(addr).await.unwrap();
        drop(stream);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let _ = stop_tx.send(());
        assert_ok!(assert_ok!(handle.await));
    }

    #[tokio::test]
    async fn test_stalled_handshake_is_dropped() {
        let config = ServerConfig {
            role_timeout: Duration::from_millis(300),
            ..local_config()
        };
        let server = assert_ok!(Server::new(config).await);
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        // Connects but never sends the upgrade request
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 64];
        let read = timeout(Duration::from_secs(3), stream.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));

        let _ = stop_tx.send(());
        assert_ok!(assert_ok!(handle.await));
    }
}
