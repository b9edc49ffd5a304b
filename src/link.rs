use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, FrameDecoder, FrameEncoder};
use crate::config::{CodecConfig, ConnectionConfig, LinkConfig};
use crate::connection::{ConnectionError, ConnectionEvent, Endpoint, ResilientConnection};
use crate::geometry::YawConvention;
use crate::protocol::{AgentCommand, AgentId};
use crate::telemetry::{maps_from_frame, AgentEvent, AgentStatus, StatusUpdate, TelemetryMessage};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("encoding failed: {0}")]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Default)]
struct LinkCounters {
    sessions: AtomicU64,
    bytes_received: AtomicU64,
    frames_decoded: AtomicU64,
    frames_dropped: AtomicU64,
    maps_emitted: AtomicU64,
    commands_sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub sessions: u64,
    pub bytes_received: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub maps_emitted: u64,
    pub commands_sent: u64,
}

/// One agent bound to one resilient connection.
///
/// A background task turns connection events into [`AgentEvent`]s on the
/// shared upstream channel; the handle encodes and writes outbound commands.
#[derive(Debug)]
pub struct AgentLink {
    agent_id: AgentId,
    connection: ResilientConnection,
    encoder: FrameEncoder,
    state: Arc<watch::Sender<LinkState>>,
    counters: Arc<LinkCounters>,
    task: JoinHandle<()>,
}

impl AgentLink {
    pub fn spawn(
        agent_id: AgentId,
        endpoint: Endpoint,
        connection_config: &ConnectionConfig,
        codec_config: &CodecConfig,
        link_config: &LinkConfig,
        upstream: mpsc::Sender<AgentEvent>,
    ) -> Self {
        info!(agent_id, endpoint = %endpoint, "starting agent link");
        let (connection, events) = ResilientConnection::open(endpoint, connection_config);
        let (state, _) = watch::channel(LinkState::Connecting);
        let state = Arc::new(state);
        let counters = Arc::new(LinkCounters::default());

        let worker = LinkTask {
            agent_id,
            events,
            decoder: FrameDecoder::new(codec_config),
            yaw: link_config.yaw,
            mirror_maps: link_config.mirror_maps,
            upstream,
            state: Arc::clone(&state),
            counters: Arc::clone(&counters),
            offline_reported: false,
        };
        let task = tokio::spawn(worker.run());

        Self {
            agent_id,
            connection,
            encoder: FrameEncoder::new(codec_config),
            state,
            counters,
            task,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.connection.endpoint()
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn stats(&self) -> LinkStats {
        let c = &self.counters;
        LinkStats {
            sessions: c.sessions.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            frames_decoded: c.frames_decoded.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            maps_emitted: c.maps_emitted.load(Ordering::Relaxed),
            commands_sent: c.commands_sent.load(Ordering::Relaxed),
        }
    }

    /// Returns `Ok(false)` when the command was addressed to another agent.
    /// Never waits on the socket: a stalled agent surfaces as
    /// [`ConnectionError::QueueFull`].
    pub fn send_control(
        &self,
        agent_id: AgentId,
        linear_x: f64,
        angular_z: f64,
    ) -> Result<bool, LinkError> {
        self.send_command(agent_id, &AgentCommand::control(linear_x, angular_z))
    }

    /// Returns `Ok(false)` when the command was addressed to another agent.
    pub fn send_navigation(
        &self,
        agent_id: AgentId,
        x: f64,
        y: f64,
        heading: Option<f64>,
    ) -> Result<bool, LinkError> {
        self.send_command(agent_id, &AgentCommand::navigate(x, y, heading))
    }

    fn send_command(&self, agent_id: AgentId, command: &AgentCommand) -> Result<bool, LinkError> {
        if agent_id != self.agent_id {
            warn!(
                link_agent = self.agent_id,
                command_agent = agent_id,
                "ignoring command addressed to another agent"
            );
            return Ok(false);
        }

        let frame = self.encoder.encode(command)?;
        self.connection.send(frame)?;
        self.counters.commands_sent.fetch_add(1, Ordering::Relaxed);
        debug!(agent_id, ?command, "command sent");
        Ok(true)
    }

    pub fn close(&self) {
        if matches!(self.state(), LinkState::Closing) {
            return;
        }
        info!(agent_id = self.agent_id, endpoint = %self.endpoint(), "closing agent link");
        self.state.send_replace(LinkState::Closing);
        self.connection.close();
    }

    /// Close and wait for the event task to drain. Dropping the link closes
    /// it too, without waiting.
    pub async fn shutdown(self) {
        self.close();
        let AgentLink { task, connection, .. } = self;
        drop(connection);
        let _ = task.await;
    }
}

struct LinkTask {
    agent_id: AgentId,
    events: mpsc::Receiver<ConnectionEvent>,
    decoder: FrameDecoder,
    yaw: YawConvention,
    mirror_maps: bool,
    upstream: mpsc::Sender<AgentEvent>,
    state: Arc<watch::Sender<LinkState>>,
    counters: Arc<LinkCounters>,
    offline_reported: bool,
}

impl LinkTask {
    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                ConnectionEvent::Connecting => self.set_state(LinkState::Connecting),
                ConnectionEvent::Connected => {
                    self.counters.sessions.fetch_add(1, Ordering::Relaxed);
                    self.decoder.reset();
                    self.set_state(LinkState::Connected);
                    self.emit_status(StatusUpdate::status(AgentStatus::Idle)).await;
                }
                ConnectionEvent::Data(bytes) => self.handle_data(&bytes).await,
                ConnectionEvent::Disconnected => {
                    self.decoder.reset();
                    self.set_state(LinkState::Disconnected);
                    self.emit_status(StatusUpdate::status(AgentStatus::Offline)).await;
                }
            }
        }
        // Closed before any session ended, e.g. never connected
        if !self.offline_reported {
            self.emit_status(StatusUpdate::status(AgentStatus::Offline)).await;
        }
        self.state.send_replace(LinkState::Disconnected);
        debug!(agent_id = self.agent_id, "agent link task stopped");
    }

    fn set_state(&self, next: LinkState) {
        // Closing only gives way to Disconnected
        self.state.send_if_modified(|state| {
            if *state == LinkState::Closing && next != LinkState::Disconnected {
                return false;
            }
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    async fn handle_data(&mut self, bytes: &[u8]) {
        self.counters
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        for frame in self.decoder.feed(bytes) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(agent_id = self.agent_id, error = %e, "dropping undecodable frame");
                    continue;
                }
            };
            self.counters.frames_decoded.fetch_add(1, Ordering::Relaxed);

            if let Some(telemetry) = TelemetryMessage::from_frame(&frame, self.yaw) {
                self.emit_status(StatusUpdate::from(&telemetry)).await;
            }

            for map in maps_from_frame(&frame, self.mirror_maps) {
                match map {
                    Ok(grid) => {
                        self.counters.maps_emitted.fetch_add(1, Ordering::Relaxed);
                        debug!(agent_id = self.agent_id, kind = ?grid.kind, width = grid.width, height = grid.height, "map updated");
                        self.emit(AgentEvent::Map {
                            agent_id: self.agent_id,
                            grid,
                        })
                        .await;
                    }
                    Err(e) => warn!(agent_id = self.agent_id, error = %e, "dropping map"),
                }
            }
        }
    }

    async fn emit_status(&mut self, update: StatusUpdate) {
        self.offline_reported = update.status == Some(AgentStatus::Offline);
        self.emit(AgentEvent::Status {
            agent_id: self.agent_id,
            update,
        })
        .await;
    }

    async fn emit(&self, event: AgentEvent) {
        if self.upstream.send(event).await.is_err() {
            debug!(agent_id = self.agent_id, "upstream receiver gone, event discarded");
        }
    }
}
