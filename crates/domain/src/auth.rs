use serde::{Deserialize, Serialize};

/// Member role of a user within an owner's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Editor,
    Owner,
    System,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "viewer" | "readonly" => Some(Role::Viewer),
            "editor" | "member" => Some(Role::Editor),
            "owner" | "admin" => Some(Role::Owner),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Owner => "owner",
            Role::System => "system",
        }
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, Role::Editor | Role::Owner | Role::System)
    }

    pub fn can_apply(&self) -> bool {
        matches!(self, Role::Owner | Role::System)
    }
}
