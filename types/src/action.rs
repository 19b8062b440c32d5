use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Add,
    Delete,
    Update,
    Nop,
}

/// Externally visible record of what the reconciler intends to do (dry
/// run) or has done.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub resource: String,
    pub message: String,
}

impl Action {
    pub fn add(resource: &str, message: impl Into<String>) -> Self {
        Action {
            kind: ActionKind::Add,
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    pub fn delete(resource: &str, message: impl Into<String>) -> Self {
        Action {
            kind: ActionKind::Delete,
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    pub fn update(resource: &str, message: impl Into<String>) -> Self {
        Action {
            kind: ActionKind::Update,
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    pub fn nop(resource: &str, message: impl Into<String>) -> Self {
        Action {
            kind: ActionKind::Nop,
            resource: resource.to_string(),
            message: message.into(),
        }
    }
}
