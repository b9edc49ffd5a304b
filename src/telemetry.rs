use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::geometry::{quaternion_to_yaw_degrees, GeometryError, MapGrid, MapKind, YawConvention};
use crate::protocol::{f64_at, payload_of, pose_fields, AgentId, RawGrid, MAP_SOURCES};

// Velocities below this are reported as standing still
const MOTION_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Idle,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub linear_velocity: f64,
    pub angular_velocity: f64,
    pub heading_degrees: f64,
    pub position: Option<(f64, f64)>,
}

impl TelemetryMessage {
    /// Velocity/pose telemetry from a decoded frame. Missing sub-fields default
    /// to zero (or no position); `None` when the frame carries neither
    /// velocity nor pose.
    pub fn from_frame(frame: &Value, yaw: YawConvention) -> Option<Self> {
        let payload = payload_of(frame);
        let velocity = payload.get("velocity");
        let pose = pose_fields(payload);
        if velocity.is_none() && pose.is_none() {
            return None;
        }

        let (position, orientation) = pose.unwrap_or_default();
        Some(Self {
            linear_velocity: f64_at(payload, "/velocity/linear/x").unwrap_or(0.0),
            angular_velocity: f64_at(payload, "/velocity/angular/z").unwrap_or(0.0),
            heading_degrees: quaternion_to_yaw_degrees(orientation, yaw),
            position,
        })
    }

    pub fn is_moving(&self) -> bool {
        self.linear_velocity.abs() > MOTION_EPSILON || self.angular_velocity.abs() > MOTION_EPSILON
    }
}

/// Partial condition update surfaced upstream; absent fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linear_velo: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angular_velo: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 2]>,
}

impl StatusUpdate {
    pub fn status(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl From<&TelemetryMessage> for StatusUpdate {
    fn from(msg: &TelemetryMessage) -> Self {
        Self {
            status: Some(if msg.is_moving() {
                AgentStatus::Active
            } else {
                AgentStatus::Idle
            }),
            linear_velo: Some(msg.linear_velocity),
            angular_velo: Some(msg.angular_velocity),
            heading: Some(msg.heading_degrees),
            position: msg.position.map(|(x, y)| [x, y]),
        }
    }
}

/// Events surfaced to the pub/sub layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum AgentEvent {
    #[serde(rename = "statusData")]
    Status {
        #[serde(rename = "agentId")]
        agent_id: AgentId,
        update: StatusUpdate,
    },
    #[serde(rename = "mapData")]
    Map {
        #[serde(rename = "agentId")]
        agent_id: AgentId,
        grid: MapGrid,
    },
}

impl AgentEvent {
    pub fn agent_id(&self) -> AgentId {
        match self {
            AgentEvent::Status { agent_id, .. } | AgentEvent::Map { agent_id, .. } => *agent_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum MapDecodeError {
    #[error("{kind:?} object is malformed: {source}")]
    Malformed {
        kind: MapKind,
        source: serde_json::Error,
    },
    #[error("{0:?} object has no dimensions")]
    MissingDimensions(MapKind),
    #[error("{kind:?} grid is invalid: {source}")]
    Geometry {
        kind: MapKind,
        source: GeometryError,
    },
}

/// Build display-oriented grids for every non-empty map object in a frame.
pub fn maps_from_frame(frame: &Value, mirror: bool) -> Vec<Result<MapGrid, MapDecodeError>> {
    let payload = payload_of(frame);
    MAP_SOURCES
        .iter()
        .filter_map(|&(key, kind)| {
            let object = payload.get(key)?;
            if object.as_object().map_or(true, serde_json::Map::is_empty) {
                return None;
            }
            Some(build_map(object, kind, mirror))
        })
        .collect()
}

fn build_map(object: &Value, kind: MapKind, mirror: bool) -> Result<MapGrid, MapDecodeError> {
    let raw: RawGrid = serde_json::from_value(object.clone())
        .map_err(|source| MapDecodeError::Malformed { kind, source })?;
    let meta = raw.meta().ok_or(MapDecodeError::MissingDimensions(kind))?;

    MapGrid::from_flat(kind, &raw.data, meta.width, meta.height, meta.resolution, meta.origin)
        .and_then(|grid| grid.rotated(mirror))
        .map_err(|source| MapDecodeError::Geometry { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_fields_default() {
        let frame = json!({"payload": {"velocity": {"linear": {"x": 0.4}}}});
        let msg = TelemetryMessage::from_frame(&frame, YawConvention::Signed).unwrap();
        assert!((msg.linear_velocity - 0.4).abs() < f64::EPSILON);
        assert_eq!(msg.angular_velocity, 0.0);
        assert_eq!(msg.heading_degrees, 0.0);
        assert!(msg.position.is_none());
        assert!(msg.is_moving());
    }

    #[test]
    fn test_map_only_frame_has_no_telemetry() {
        let frame = json!({"payload": {"map": {"width": 1, "height": 1, "data": [0]}}});
        assert!(TelemetryMessage::from_frame(&frame, YawConvention::Signed).is_none());
        assert_eq!(maps_from_frame(&frame, true).len(), 1);
    }

    #[test]
    fn test_wrongly_typed_fields_do_not_fail() {
        let frame = json!({"payload": {"velocity": {"linear": {"x": "fast"}}, "pose": 7}});
        let msg = TelemetryMessage::from_frame(&frame, YawConvention::Signed).unwrap();
        assert_eq!(msg.linear_velocity, 0.0);
        assert!(msg.position.is_none());
    }

    #[test]
    fn test_status_update_serialization() {
        let update = StatusUpdate::status(AgentStatus::Offline);
        assert_eq!(serde_json::to_value(&update).unwrap(), json!({"status": "offline"}));

        let msg = TelemetryMessage {
            linear_velocity: 0.0,
            angular_velocity: 0.0,
            heading_degrees: 90.0,
            position: Some((1.5, -2.0)),
        };
        let value = serde_json::to_value(StatusUpdate::from(&msg)).unwrap();
        assert_eq!(value["status"], "idle");
        assert_eq!(value["linearVelo"], 0.0);
        assert_eq!(value["position"], json!([1.5, -2.0]));
    }

    #[test]
    fn test_empty_map_objects_skipped() {
        let frame = json!({"payload": {"map": {}, "global_costmap": null}});
        assert!(maps_from_frame(&frame, true).is_empty());
    }

    #[test]
    fn test_shape_mismatch_reported() {
        let frame = json!({"payload": {"global_costmap": {
            "info": {"width": 3, "height": 3, "resolution": 0.05}, "data": [0, 1]
        }}});
        let maps = maps_from_frame(&frame, true);
        assert!(matches!(
            maps[0],
            Err(MapDecodeError::Geometry {
                kind: MapKind::GlobalCostmap,
                source: GeometryError::ShapeMismatch { .. }
            })
        ));
    }

    #[test]
    fn test_event_serialization() {
        let event = AgentEvent::Status {
            agent_id: 7,
            update: StatusUpdate::status(AgentStatus::Idle),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "statusData", "agentId": 7, "update": {"status": "idle"}})
        );
    }
}
