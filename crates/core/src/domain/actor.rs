use serde::{Deserialize, Serialize};

/// The identity performing a mutating call. Lookup failures resolve to
/// `System` rather than a bare fallback string, so every audit field records
/// which of the two cases actually happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    Authenticated { id: String, name: String },
    System,
}

impl Actor {
    pub fn authenticated(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Authenticated { id: id.into(), name: name.into() }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Self::Authenticated { name, .. } => name,
            Self::System => "System",
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Authenticated { id, .. } => Some(id),
            Self::System => None,
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}
