//! Project resource.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Active,
    Archived,
}

/// A project as returned by the backing data service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Numeric project ID.
    pub id: u64,
    /// URL-safe identifier (e.g. "website-relaunch").
    pub identifier: String,
    /// Display name.
    pub name: String,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub is_public: bool,
}

impl Project {
    /// Create an active, private project.
    pub fn new(id: u64, identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            identifier: identifier.into(),
            name: name.into(),
            status: ProjectStatus::Active,
            is_public: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ProjectStatus::Active
    }
}
