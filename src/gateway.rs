//! Entry point used by the fleet server.
//!
//! A [`Gateway`] owns the agent registry, the control dispatcher and the
//! integrity relay, and runs the process-wide control tick. Every event the
//! links produce arrives on the receiver returned by [`Gateway::start`].

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, GatewayConfig};
use crate::control::{ControlDispatcher, Direction};
use crate::integrity::{IntegrityError, IntegrityGateway};
use crate::link::{LinkState, LinkStats};
use crate::protocol::AgentId;
use crate::registry::{
    AgentEndpoint, AgentRegistry, AgentSelector, ReconcileReport, RegistryError, RosterSource,
};
use crate::telemetry::AgentEvent;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("integrity relay: {0}")]
    Integrity(#[from] IntegrityError),
}

#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<Mutex<AgentRegistry>>,
    dispatcher: Arc<Mutex<ControlDispatcher>>,
    integrity: Arc<IntegrityGateway>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    pub fn start(config: GatewayConfig) -> Result<(Self, mpsc::Receiver<AgentEvent>), GatewayError> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::channel(config.link.event_buffer);
        let registry = Arc::new(Mutex::new(AgentRegistry::new(&config, events_tx)));
        let dispatcher = Arc::new(Mutex::new(ControlDispatcher::new(config.control.clone())));
        let integrity = Arc::new(IntegrityGateway::connect(
            &config.integrity,
            &config.connection,
        )?);
        let (shutdown, _) = watch::channel(false);

        let control_loop = tokio::spawn(control_loop(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            config.control.tick_interval(),
            shutdown.subscribe(),
        ));

        info!(
            tick = ?config.control.tick_interval(),
            agent_port = config.link.agent_port,
            integrity = !integrity.is_bypass(),
            "gateway started"
        );

        let gateway = Self {
            config,
            registry,
            dispatcher,
            integrity,
            shutdown,
            tasks: vec![control_loop],
        };
        Ok((gateway, events_rx))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn connect_to_agent(&self, entry: AgentEndpoint) -> Result<bool, GatewayError> {
        Ok(self.registry.lock().await.connect_to_agent(entry).await?)
    }

    pub async fn disconnect_from_agent(&self, selector: &AgentSelector) -> Vec<AgentId> {
        let removed = self.registry.lock().await.disconnect(selector).await;
        let mut dispatcher = self.dispatcher.lock().await;
        for id in &removed {
            dispatcher.forget(*id);
        }
        removed
    }

    pub async fn reconcile(&self, roster: &[AgentEndpoint]) -> Result<ReconcileReport, GatewayError> {
        Ok(self.registry.lock().await.reconcile(roster).await?)
    }

    pub async fn send_control_cmd(&self, agent_id: AgentId, linear_x: f64, angular_z: f64) -> Result<bool, GatewayError> {
        Ok(self
            .registry
            .lock()
            .await
            .send_control(agent_id, linear_x, angular_z)?)
    }

    pub async fn send_navigation_cmd(
        &self,
        agent_id: AgentId,
        x: f64,
        y: f64,
        heading: Option<f64>,
    ) -> Result<bool, GatewayError> {
        Ok(self
            .registry
            .lock()
            .await
            .send_navigation(agent_id, x, y, heading)?)
    }

    /// Teleoperation input; the control tick keeps re-sending it until it
    /// goes stale.
    pub async fn set_direction(&self, agent_id: AgentId, direction: Direction) -> Result<(), GatewayError> {
        self.registry.lock().await.link(agent_id)?;
        self.dispatcher
            .lock()
            .await
            .set_direction(agent_id, direction, Instant::now());
        Ok(())
    }

    /// One-shot navigation goal, not subject to the control watchdog.
    pub async fn set_target_position(
        &self,
        agent_id: AgentId,
        x: f64,
        y: f64,
        heading: Option<f64>,
    ) -> Result<bool, GatewayError> {
        self.send_navigation_cmd(agent_id, x, y, heading).await
    }

    pub async fn link_stats(&self, agent_id: AgentId) -> Result<LinkStats, GatewayError> {
        Ok(self.registry.lock().await.link(agent_id)?.stats())
    }

    pub async fn link_state(&self, agent_id: AgentId) -> Result<LinkState, GatewayError> {
        Ok(self.registry.lock().await.link(agent_id)?.state())
    }

    pub fn integrity(&self) -> &IntegrityGateway {
        &self.integrity
    }

    /// Reload `source` every `roster.refresh_interval_ms` and reconcile it.
    /// The first load happens immediately.
    pub fn spawn_roster_refresh(&mut self, source: Arc<dyn RosterSource>) {
        let registry = Arc::clone(&self.registry);
        let period = self.config.roster.refresh_interval();
        let mut shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let roster = match source.load() {
                    Ok(roster) => roster,
                    Err(e) => {
                        warn!(source = %source.describe(), error = %e, "roster load failed");
                        continue;
                    }
                };
                match registry.lock().await.reconcile(&roster).await {
                    Ok(report) if !report.is_noop() => info!(
                        connected = report.connected.len(),
                        reconnected = report.reconnected.len(),
                        updated = report.updated.len(),
                        "roster reconciled"
                    ),
                    Ok(_) => debug!("roster unchanged"),
                    Err(e) => warn!(source = %source.describe(), error = %e, "roster rejected"),
                }
            }
        });
        self.tasks.push(task);
    }

    pub async fn shutdown(self) {
        info!("gateway shutting down");
        self.shutdown.send_replace(true);
        for task in self.tasks {
            let _ = task.await;
        }
        self.registry.lock().await.close_all().await;
        self.integrity.close();
    }
}

async fn control_loop(
    registry: Arc<Mutex<AgentRegistry>>,
    dispatcher: Arc<Mutex<ControlDispatcher>>,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        let due = dispatcher.lock().await.tick(Instant::now());
        if due.is_empty() {
            continue;
        }

        let mut untracked = Vec::new();
        {
            let registry = registry.lock().await;
            for dispatch in due {
                match registry.send_control(dispatch.agent_id, dispatch.linear_x, dispatch.angular_z) {
                    Ok(true) => {}
                    Ok(false) => debug!(agent_id = dispatch.agent_id, "control tick not delivered"),
                    Err(e) => {
                        debug!(agent_id = dispatch.agent_id, error = %e, "dropping intent for untracked agent");
                        untracked.push(dispatch.agent_id);
                    }
                }
            }
        }
        if !untracked.is_empty() {
            let mut dispatcher = dispatcher.lock().await;
            for agent_id in untracked {
                dispatcher.forget(agent_id);
            }
        }
    }
    debug!("control loop stopped");
}
