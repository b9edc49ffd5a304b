use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geometry::{MapKind, Quaternion};

pub type AgentId = u64;

/// Outbound command bodies, serialized as
/// `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AgentCommand {
    #[serde(rename = "command_control")]
    Control(ControlPayload),
    #[serde(rename = "command_navigate")]
    Navigate(NavigationPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub linear_x: f64,
    pub angular_z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NavigationPayload {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl AgentCommand {
    pub fn control(linear_x: f64, angular_z: f64) -> Self {
        AgentCommand::Control(ControlPayload { linear_x, angular_z })
    }

    /// A missing heading is sent as 0.
    pub fn navigate(x: f64, y: f64, heading: Option<f64>) -> Self {
        AgentCommand::Navigate(NavigationPayload {
            x,
            y,
            heading: heading.unwrap_or(0.0),
        })
    }
}

/// The `payload` object of an inbound frame, or the frame itself when the
/// agent sends an unwrapped body.
pub fn payload_of(frame: &Value) -> &Value {
    match frame.get("payload") {
        Some(payload) if payload.is_object() => payload,
        _ => frame,
    }
}

pub fn f64_at(value: &Value, pointer: &str) -> Option<f64> {
    value.pointer(pointer).and_then(Value::as_f64)
}

/// Position and orientation, accepting both `pose.pose.*` and `pose.*`.
pub fn pose_fields(payload: &Value) -> Option<(Option<(f64, f64)>, Quaternion)> {
    let pose = payload.get("pose")?;
    let pose = match pose.get("pose") {
        Some(inner) if inner.is_object() => inner,
        _ => pose,
    };

    let position = match (f64_at(pose, "/position/x"), f64_at(pose, "/position/y")) {
        (Some(x), Some(y)) => Some((x, y)),
        _ => None,
    };
    let orientation = match pose.get("orientation") {
        Some(o) if o.is_object() => Quaternion {
            x: f64_at(o, "/x").unwrap_or(0.0),
            y: f64_at(o, "/y").unwrap_or(0.0),
            z: f64_at(o, "/z").unwrap_or(0.0),
            w: f64_at(o, "/w").unwrap_or(1.0),
        },
        _ => Quaternion::IDENTITY,
    };
    Some((position, orientation))
}

/// Grid sub-object as sent by agents. Metadata may live at the top level
/// (`map.width`) or under `info` (`global_costmap.info.width`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawGrid {
    pub info: Option<GridInfo>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub resolution: Option<f64>,
    pub origin: Option<RawOrigin>,
    pub data: Vec<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GridInfo {
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub resolution: Option<f64>,
    pub origin: Option<RawOrigin>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawOrigin {
    Pose { position: RawPoint },
    Point(RawPoint),
    Triple(Vec<f64>),
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RawPoint {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl RawOrigin {
    pub fn to_array(&self) -> [f64; 3] {
        match self {
            RawOrigin::Pose { position: p } | RawOrigin::Point(p) => [p.x, p.y, p.z],
            RawOrigin::Triple(v) => [
                v.first().copied().unwrap_or(0.0),
                v.get(1).copied().unwrap_or(0.0),
                v.get(2).copied().unwrap_or(0.0),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridMeta {
    pub width: usize,
    pub height: usize,
    pub resolution: f64,
    pub origin: [f64; 3],
}

impl RawGrid {
    /// Merged metadata, `info` taking precedence. `None` without dimensions.
    pub fn meta(&self) -> Option<GridMeta> {
        let info = self.info.as_ref();
        let width = info.and_then(|i| i.width).or(self.width)?;
        let height = info.and_then(|i| i.height).or(self.height)?;
        let resolution = info
            .and_then(|i| i.resolution)
            .or(self.resolution)
            .unwrap_or(0.0);
        let origin = info
            .and_then(|i| i.origin.as_ref())
            .or(self.origin.as_ref())
            .map_or([0.0; 3], RawOrigin::to_array);
        Some(GridMeta {
            width,
            height,
            resolution,
            origin,
        })
    }
}

/// Payload keys that carry grids, with the kind each is tagged as.
pub const MAP_SOURCES: [(&str, MapKind); 3] = [
    ("map", MapKind::Static),
    ("global_costmap", MapKind::GlobalCostmap),
    ("local_costmap", MapKind::LocalCostmap),
];
