//! # Fleetlink
//!
//! Gateway between a fleet-management server and a set of mobile robot
//! agents, each reached over its own TCP link speaking a framed binary
//! protocol.
//!
//! ## Features
//!
//! - **Resilient links**: one self-reconnecting connection per agent, retried every 3 s until closed
//! - **Wire codec**: magic header, 3-byte big-endian length, zlib-compressed JSON body
//! - **Telemetry decoding**: velocity, pose and occupancy grids turned into display-ready events
//! - **Control watchdog**: direction intents re-sent every tick and stopped once stale
//! - **Integrity relay**: optional seal/unseal round trip through an external service
//! - **Roster reconciliation**: additive sync of the agent list against live links
//!
//! ## Quick Start
//!
//! ```no_run
//! use fleetlink::{AgentEndpoint, Direction, Gateway, GatewayConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (gateway, mut events) = Gateway::start(GatewayConfig::default())?;
//! gateway.connect_to_agent(AgentEndpoint::new(7, Some("10.0.0.7"))).await?;
//! gateway.set_direction(7, Direction::Forward).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`connection`] - Reconnecting TCP connection primitive
//! - [`codec`] - Frame encoder and stateful receive buffer
//! - [`geometry`] - Yaw conversion, grid reshaping and rasterizing
//! - [`patch`] - Binary diffs between map grids
//! - [`protocol`] - Outbound commands and inbound payload shapes
//! - [`telemetry`] - Status and map events decoded from frames
//! - [`link`] - Per-agent link state machine
//! - [`control`] - Dead-man's-switch control dispatcher
//! - [`integrity`] - Integrity service relay
//! - [`registry`] - Roster tracking and reconciliation
//! - [`gateway`] - Top-level façade and control tick

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod gateway;
pub mod geometry;
pub mod integrity;
pub mod link;
pub mod patch;
pub mod protocol;
pub mod registry;
pub mod telemetry;

// Re-export main public types for convenience
pub use config::GatewayConfig;
pub use control::{ControlDispatcher, Direction};
pub use gateway::{Gateway, GatewayError};
pub use geometry::{MapGrid, MapKind, YawConvention};
pub use link::{AgentLink, LinkState};
pub use protocol::{AgentCommand, AgentId};
pub use registry::{AgentEndpoint, AgentRegistry, AgentSelector, FileRoster, RosterSource};
pub use telemetry::{AgentEvent, AgentStatus, StatusUpdate};
