//! Outbound TCP connection that reconnects on its own.
//!
//! The [`ResilientConnection`] handle owns the logical endpoint, the retry
//! policy and a background task; the task owns whichever socket is current and
//! replaces it on every reconnect. Nothing written while disconnected survives:
//! the agent stream is live data, not a queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("not connected to {0}")]
    NotConnected(Endpoint),
    #[error("connection to {0} is closed")]
    Closed(Endpoint),
    #[error("outbound queue to {0} is full")]
    QueueFull(Endpoint),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A reconnect attempt is starting after a lost session.
    Connecting,
    Connected,
    Data(Vec<u8>),
    Disconnected,
}

#[derive(Debug)]
pub struct ResilientConnection {
    endpoint: Endpoint,
    outbound: mpsc::Sender<Vec<u8>>,
    connected: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    attempts: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl ResilientConnection {
    /// Start connecting immediately. Events arrive on the returned receiver
    /// until [`close`](Self::close) is called or the handle is dropped.
    pub fn open(
        endpoint: Endpoint,
        config: &ConnectionConfig,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
        let (events_tx, events_rx) = mpsc::channel(config.event_queue);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let attempts = Arc::new(AtomicU64::new(0));

        let worker = ConnectionTask {
            endpoint: endpoint.clone(),
            retry_interval: config.retry_interval(),
            connect_timeout: config.connect_timeout(),
            write_timeout: config.write_timeout(),
            read_chunk_size: config.read_chunk_size,
            outbound: outbound_rx,
            events: events_tx,
            connected: connected_tx,
            shutdown: shutdown_rx,
            attempts: Arc::clone(&attempts),
        };
        let task = tokio::spawn(worker.run());

        let connection = Self {
            endpoint,
            outbound: outbound_tx,
            connected: connected_rx,
            shutdown: shutdown_tx,
            attempts,
            task,
        };
        (connection, events_rx)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Observe connect/disconnect transitions.
    pub fn watch_state(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Connection attempts made so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.task.is_finished()
    }

    /// Queue `bytes` for the current socket without waiting. A full queue
    /// drops the data and reports [`ConnectionError::QueueFull`].
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed(self.endpoint.clone()));
        }
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected(self.endpoint.clone()));
        }
        self.outbound.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => ConnectionError::QueueFull(self.endpoint.clone()),
            TrySendError::Closed(_) => ConnectionError::Closed(self.endpoint.clone()),
        })
    }

    /// Stop retrying and release the socket. No reconnection happens afterwards.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            info!(endpoint = %self.endpoint, "closing connection");
        }
    }
}

impl Drop for ResilientConnection {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

enum SessionEnd {
    Lost,
    Shutdown,
    OwnerGone,
}

struct ConnectionTask {
    endpoint: Endpoint,
    retry_interval: Duration,
    connect_timeout: Duration,
    write_timeout: Duration,
    read_chunk_size: usize,
    outbound: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<ConnectionEvent>,
    connected: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
    attempts: Arc<AtomicU64>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut reconnecting = false;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if reconnecting {
                reconnecting = false;
                if self.events.send(ConnectionEvent::Connecting).await.is_err() {
                    break;
                }
            }

            self.attempts.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %self.endpoint, "connecting");
            let address = (self.endpoint.host.clone(), self.endpoint.port);
            let attempt = tokio::select! {
                result = time::timeout(self.connect_timeout, TcpStream::connect(address)) => result,
                _ = self.shutdown.changed() => break,
            };

            match attempt {
                Ok(Ok(stream)) => {
                    info!(endpoint = %self.endpoint, "connected");
                    self.connected.send_replace(true);
                    if self.events.send(ConnectionEvent::Connected).await.is_err() {
                        break;
                    }

                    let end = self.session(stream).await;
                    self.connected.send_replace(false);
                    match end {
                        SessionEnd::Lost => {
                            info!(endpoint = %self.endpoint, "connection lost");
                            if self.events.send(ConnectionEvent::Disconnected).await.is_err() {
                                break;
                            }
                            reconnecting = true;
                        }
                        SessionEnd::Shutdown => {
                            let _ = self.events.try_send(ConnectionEvent::Disconnected);
                            break;
                        }
                        SessionEnd::OwnerGone => break,
                    }
                }
                Ok(Err(e)) => {
                    debug!(endpoint = %self.endpoint, error = %e, "connect failed");
                }
                Err(_) => {
                    warn!(endpoint = %self.endpoint, timeout = ?self.connect_timeout, "connect timed out");
                }
            }

            tokio::select! {
                _ = time::sleep(self.retry_interval) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        self.connected.send_replace(false);
        debug!(endpoint = %self.endpoint, "connection task stopped");
    }

    async fn session(&mut self, stream: TcpStream) -> SessionEnd {
        // Anything queued before this socket existed is stale
        while self.outbound.try_recv().is_ok() {}

        if let Err(e) = stream.set_nodelay(true) {
            debug!(endpoint = %self.endpoint, error = %e, "failed to set TCP_NODELAY");
        }
        let (mut reader, mut writer) = stream.into_split();
        let mut buffer = vec![0u8; self.read_chunk_size];

        loop {
            tokio::select! {
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => return SessionEnd::Lost,
                    Ok(n) => {
                        let chunk = buffer[..n].to_vec();
                        if self.events.send(ConnectionEvent::Data(chunk)).await.is_err() {
                            return SessionEnd::OwnerGone;
                        }
                    }
                    Err(e) => {
                        warn!(endpoint = %self.endpoint, error = %e, "read failed");
                        return SessionEnd::Lost;
                    }
                },
                outgoing = self.outbound.recv() => match outgoing {
                    Some(bytes) => {
                        match time::timeout(self.write_timeout, writer.write_all(&bytes)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!(endpoint = %self.endpoint, error = %e, "write failed");
                                return SessionEnd::Lost;
                            }
                            Err(_) => {
                                warn!(endpoint = %self.endpoint, timeout = ?self.write_timeout, "peer stopped reading, dropping session");
                                return SessionEnd::Lost;
                            }
                        }
                    }
                    None => return SessionEnd::OwnerGone,
                },
                _ = self.shutdown.changed() => {
                    let _ = writer.shutdown().await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}
