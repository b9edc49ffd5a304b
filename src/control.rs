use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ControlConfig;
use crate::protocol::AgentId;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown direction '{0}'")]
pub struct InvalidDirection(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
}

impl FromStr for Direction {
    type Err = InvalidDirection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Direction::Forward),
            "backward" => Ok(Direction::Backward),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            _ => Err(InvalidDirection(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentControlIntent {
    pub agent_id: Option<AgentId>,
    pub last_update: Instant,
    pub linear_x: f64,
    pub angular_z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlDispatch {
    pub agent_id: AgentId,
    pub linear_x: f64,
    pub angular_z: f64,
}

impl ControlDispatch {
    pub fn is_stop(&self) -> bool {
        self.linear_x == 0.0 && self.angular_z == 0.0
    }
}

/// Dead-man's switch for teleoperation.
///
/// Each commanded agent has its own intent. A tick re-sends every fresh
/// intent; a stale one is sent as a single `(0, 0)` and then forgotten.
#[derive(Debug)]
pub struct ControlDispatcher {
    config: ControlConfig,
    intents: BTreeMap<AgentId, AgentControlIntent>,
}

impl ControlDispatcher {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            intents: BTreeMap::new(),
        }
    }

    /// Overwrite the agent's intent; the latest direction wins.
    pub fn set_direction(&mut self, agent_id: AgentId, direction: Direction, now: Instant) {
        let (linear_x, angular_z) = match direction {
            Direction::Forward => (self.config.linear_speed, 0.0),
            Direction::Backward => (-self.config.linear_speed, 0.0),
            Direction::Left => (0.0, self.config.angular_speed),
            Direction::Right => (0.0, -self.config.angular_speed),
        };
        debug!(agent_id, ?direction, "direction intent updated");
        self.intents.insert(
            agent_id,
            AgentControlIntent {
                agent_id: Some(agent_id),
                last_update: now,
                linear_x,
                angular_z,
            },
        );
    }

    pub fn tick(&mut self, now: Instant) -> Vec<ControlDispatch> {
        let staleness = self.config.staleness();
        let mut due = Vec::with_capacity(self.intents.len());

        for (&agent_id, intent) in &mut self.intents {
            if now.saturating_duration_since(intent.last_update) < staleness {
                due.push(ControlDispatch {
                    agent_id,
                    linear_x: intent.linear_x,
                    angular_z: intent.angular_z,
                });
            } else {
                debug!(agent_id, "control intent went stale, stopping agent");
                due.push(ControlDispatch {
                    agent_id,
                    linear_x: 0.0,
                    angular_z: 0.0,
                });
                intent.agent_id = None;
                intent.linear_x = 0.0;
                intent.angular_z = 0.0;
            }
        }

        self.intents.retain(|_, intent| intent.agent_id.is_some());
        due
    }

    pub fn intent(&self, agent_id: AgentId) -> Option<&AgentControlIntent> {
        self.intents.get(&agent_id)
    }

    pub fn active_agents(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.intents.keys().copied()
    }

    /// Drop an agent's intent without sending a stop, e.g. when its link goes away.
    pub fn forget(&mut self, agent_id: AgentId) -> bool {
        self.intents.remove(&agent_id).is_some()
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_direction_parsing() {
        assert_eq!("forward".parse::<Direction>(), Ok(Direction::Forward));
        assert_eq!(" Left ".parse::<Direction>(), Ok(Direction::Left));
        assert_eq!(
            "up".parse::<Direction>(),
            Err(InvalidDirection("up".to_string()))
        );
    }

    #[test]
    fn test_latest_direction_wins() {
        let mut dispatcher = ControlDispatcher::new(ControlConfig::default());
        let t0 = Instant::now();
        dispatcher.set_direction(3, Direction::Forward, t0);
        dispatcher.set_direction(3, Direction::Right, t0 + Duration::from_millis(100));

        let due = dispatcher.tick(t0 + Duration::from_millis(200));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].linear_x, 0.0);
        assert_eq!(due[0].angular_z, -1.0);
    }

    #[test]
    fn test_idle_tick_sends_nothing() {
        let mut dispatcher = ControlDispatcher::new(ControlConfig::default());
        assert!(dispatcher.tick(Instant::now()).is_empty());
    }

    #[test]
    fn test_forget_drops_intent() {
        let mut dispatcher = ControlDispatcher::new(ControlConfig::default());
        dispatcher.set_direction(9, Direction::Backward, Instant::now());
        assert!(dispatcher.forget(9));
        assert!(!dispatcher.forget(9));
        assert_eq!(dispatcher.active_agents().count(), 0);
    }
}
