use std::fmt;

/// Index of one agent instance within a launch batch.
///
/// Doubles as the name of the instance directory under the artifact root.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl InstanceId {
    pub fn dir_name(self) -> String {
        self.0.to_string()
    }

    /// All ids of a batch of `count` instances, in ascending order.
    pub fn range(count: u32) -> impl Iterator<Item = InstanceId> {
        (0..count).map(InstanceId)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BatchId(pub String);

impl BatchId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    Running,
    Stopping,
    Exited,
    Killed,
    Errored,
}

impl AgentState {
    /// True while the OS process may still be alive.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentStatus {
    pub instance: InstanceId,
    pub state: AgentState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_id_is_non_empty() {
        let id = BatchId::new();
        assert!(!id.0.is_empty());
        assert_ne!(id, BatchId::new());
    }

    #[test]
    fn instance_range_is_ascending() {
        let ids: Vec<_> = InstanceId::range(3).collect();
        assert_eq!(ids, vec![InstanceId(0), InstanceId(1), InstanceId(2)]);
        assert_eq!(InstanceId(2).dir_name(), "2");
    }

    #[test]
    fn live_states() {
        assert!(AgentState::Starting.is_live());
        assert!(AgentState::Stopping.is_live());
        assert!(!AgentState::Exited.is_live());
        assert!(!AgentState::Killed.is_live());
        assert!(!AgentState::Errored.is_live());
    }

    #[test]
    fn status_serializes_state_in_snake_case() {
        let status = AgentStatus {
            instance: InstanceId(4),
            state: AgentState::Running,
            pid: Some(42),
            exit_code: None,
            signal: None,
            message: None,
        };
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["instance"], 4);
        assert_eq!(v["state"], "running");
    }
}
