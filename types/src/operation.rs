use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// State of a work ticket. Ordered: a persisted state may only move
/// forward, never back.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord,
)]
pub enum OperationState {
    #[default]
    Pending,
    Running,
    Done,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::Pending => f.write_str("Pending"),
            OperationState::Running => f.write_str("Running"),
            OperationState::Done => f.write_str("Done"),
        }
    }
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(OperationState::Pending),
            // Accepted as a legacy alias.
            "Running" | "Progress" => Ok(OperationState::Running),
            "Done" => Ok(OperationState::Done),
            other => Err(format!("unknown operation state: {other}")),
        }
    }
}

/// A persistent work ticket. The dispatcher only acts on `Pending`
/// tickets; replays of anything else are acked and dropped.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Operation {
    /// Storage-assigned id (autoincrement under the relational backend).
    #[serde(default)]
    pub id: i64,

    pub user_id: String,

    pub cluster_id: String,

    /// External id carried in bus messages.
    pub code: String,

    #[serde(default)]
    pub state: OperationState,
}

impl Operation {
    /// Moves to `next`, refusing any transition that goes backwards.
    pub fn transition(&mut self, next: OperationState) -> Result<(), String> {
        if next < self.state {
            return Err(format!(
                "operation {} cannot move from {} back to {}",
                self.code, self.state, next
            ));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(OperationState::Pending < OperationState::Running);
        assert!(OperationState::Running < OperationState::Done);
    }

    #[test]
    fn progress_is_a_running_alias() {
        assert_eq!(
            "Progress".parse::<OperationState>().unwrap(),
            OperationState::Running
        );
    }

    #[test]
    fn transitions_are_monotone() {
        let mut op = Operation {
            code: "op-17".into(),
            ..Default::default()
        };
        op.transition(OperationState::Running).unwrap();
        op.transition(OperationState::Running).unwrap();
        op.transition(OperationState::Done).unwrap();
        assert!(op.transition(OperationState::Pending).is_err());
        assert_eq!(op.state, OperationState::Done);
    }
}
