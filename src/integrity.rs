//! Relay through the external integrity service.
//!
//! The service listens on a secure and an insecure port. Sealing writes a
//! marked packet to the insecure side and waits for the sealed form on the
//! secure side; unsealing goes the other way. A missing response within the
//! timeout yields `None`, never an error.

use std::time::Duration;

use heapless::String as MarkerString;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, IntegrityConfig};
use crate::connection::{ConnectionEvent, Endpoint, ResilientConnection};

pub const MAX_MARKER_LEN: usize = 16;

type Marker = MarkerString<MAX_MARKER_LEN>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("{field} marker exceeds {MAX_MARKER_LEN} bytes")]
    MarkerTooLong { field: &'static str },
    #[error("{field} marker is empty")]
    EmptyMarker { field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformDirection {
    /// Plain payload in, sealed payload out.
    Seal,
    /// Sealed payload in, plain payload out.
    Unseal,
}

struct Channel {
    connection: ResilientConnection,
    events: Mutex<mpsc::Receiver<ConnectionEvent>>,
}

impl Channel {
    fn open(endpoint: Endpoint, config: &ConnectionConfig) -> Self {
        let (connection, events) = ResilientConnection::open(endpoint, config);
        Self {
            connection,
            events: Mutex::new(events),
        }
    }
}

struct Channels {
    secure: Channel,
    insecure: Channel,
}

pub struct IntegrityGateway {
    designator: Marker,
    tail: Marker,
    response_timeout: Duration,
    channels: Option<Channels>,
    exchange: Mutex<()>,
}

impl std::fmt::Debug for IntegrityGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityGateway")
            .field("designator", &self.designator)
            .field("bypass", &self.is_bypass())
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

fn marker(field: &'static str, value: &str) -> Result<Marker, IntegrityError> {
    if value.is_empty() {
        return Err(IntegrityError::EmptyMarker { field });
    }
    let mut out = Marker::new();
    out.push_str(value)
        .map_err(|_| IntegrityError::MarkerTooLong { field })?;
    Ok(out)
}

impl IntegrityGateway {
    /// Identity transform; no connections are opened.
    pub fn bypass() -> Self {
        let defaults = IntegrityConfig::default();
        Self {
            designator: marker("designator", &defaults.designator).unwrap_or_default(),
            tail: marker("tail", &defaults.tail).unwrap_or_default(),
            response_timeout: defaults.response_timeout(),
            channels: None,
            exchange: Mutex::new(()),
        }
    }

    /// Connect both channels, or build a bypass gateway when the config
    /// disables integrity.
    pub fn connect(
        config: &IntegrityConfig,
        connection: &ConnectionConfig,
    ) -> Result<Self, IntegrityError> {
        let designator = marker("designator", &config.designator)?;
        let tail = marker("tail", &config.tail)?;

        let channels = if config.enabled {
            info!(host = %config.host, secure = config.secure_port, insecure = config.insecure_port, "connecting to integrity service");
            Some(Channels {
                secure: Channel::open(Endpoint::new(config.host.clone(), config.secure_port), connection),
                insecure: Channel::open(
                    Endpoint::new(config.host.clone(), config.insecure_port),
                    connection,
                ),
            })
        } else {
            debug!("integrity service bypassed");
            None
        };

        Ok(Self {
            designator,
            tail,
            response_timeout: config.response_timeout(),
            channels,
            exchange: Mutex::new(()),
        })
    }

    pub fn is_bypass(&self) -> bool {
        self.channels.is_none()
    }

    /// Both channels currently hold a socket.
    pub fn is_ready(&self) -> bool {
        self.channels.as_ref().map_or(true, |c| {
            c.secure.connection.is_connected() && c.insecure.connection.is_connected()
        })
    }

    /// `None` means the service did not answer in time or could not be
    /// reached; callers choose their own fallback.
    pub async fn transform(&self, direction: TransformDirection, payload: &str) -> Option<String> {
        let Some(channels) = &self.channels else {
            return Some(payload.to_string());
        };

        // One exchange in flight; responses carry no correlation id
        let _guard = self.exchange.lock().await;

        match direction {
            TransformDirection::Seal => {
                let packet = format!("{}{}{}", self.designator, payload, self.tail);
                self.round_trip(&channels.insecure, &channels.secure, packet)
                    .await
            }
            TransformDirection::Unseal => {
                let body = payload.get(self.designator.len()..).unwrap_or("");
                let packet = format!("{}{}", self.designator, body);
                let response = self
                    .round_trip(&channels.secure, &channels.insecure, packet)
                    .await?;
                Some(self.strip_markers(&response).to_string())
            }
        }
    }

    pub async fn seal(&self, payload: &str) -> Option<String> {
        self.transform(TransformDirection::Seal, payload).await
    }

    pub async fn unseal(&self, payload: &str) -> Option<String> {
        self.transform(TransformDirection::Unseal, payload).await
    }

    fn strip_markers<'a>(&self, response: &'a str) -> &'a str {
        let body = response
            .strip_prefix(self.designator.as_str())
            .unwrap_or(response);
        body.strip_suffix(self.tail.as_str()).unwrap_or(body)
    }

    async fn round_trip(&self, outbound: &Channel, inbound: &Channel, packet: String) -> Option<String> {
        let mut events = inbound.events.lock().await;
        // Late answers to an earlier timed-out exchange
        while events.try_recv().is_ok() {}

        if let Err(e) = outbound.connection.send(packet.into_bytes()) {
            warn!(error = %e, "integrity request not sent");
            return None;
        }

        let tail = self.tail.as_bytes();
        let read = async {
            let mut response = Vec::new();
            while let Some(event) = events.recv().await {
                if let ConnectionEvent::Data(bytes) = event {
                    response.extend_from_slice(&bytes);
                    if response.ends_with(tail) {
                        return Some(response);
                    }
                }
            }
            None
        };

        match time::timeout(self.response_timeout, read).await {
            Ok(Some(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(error = %e, "integrity response is not UTF-8");
                    None
                }
            },
            Ok(None) => {
                warn!("integrity channel closed while waiting for response");
                None
            }
            Err(_) => {
                info!(timeout = ?self.response_timeout, "no response from integrity service within timeout");
                None
            }
        }
    }

    pub fn close(&self) {
        if let Some(channels) = &self.channels {
            channels.secure.connection.close();
            channels.insecure.connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_limits() {
        assert!(marker("tail", "e^&og\r\n\r\n").is_ok());
        assert_eq!(
            marker("designator", ""),
            Err(IntegrityError::EmptyMarker { field: "designator" })
        );
        assert_eq!(
            marker("tail", &"x".repeat(MAX_MARKER_LEN + 1)),
            Err(IntegrityError::MarkerTooLong { field: "tail" })
        );
    }

    #[test]
    fn test_strip_markers() {
        let gateway = IntegrityGateway::bypass();
        assert_eq!(gateway.strip_markers("S0hello e^&og\r\n\r\n"), "hello ");
        assert_eq!(gateway.strip_markers("plain"), "plain");
    }

    #[tokio::test]
    async fn test_disabled_config_is_bypass() {
        let gateway =
            IntegrityGateway::connect(&IntegrityConfig::default(), &ConnectionConfig::default())
                .unwrap();
        assert!(gateway.is_bypass());
        assert!(gateway.is_ready());
        assert_eq!(gateway.seal("payload").await.as_deref(), Some("payload"));
    }
}
