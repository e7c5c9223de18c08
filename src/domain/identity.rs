//! Credential identities.
//!
//! The engine only stores who an identity is and where its secret lives.
//! The secret itself stays in the external keychain, addressed by the opaque
//! `credential_ref`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::checkpoint::sanitize_component;

/// A stored identity record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,

    pub username: String,

    /// Grouping used as the registry section
    #[serde(default = "default_group")]
    pub group: String,

    #[serde(default)]
    pub comment: String,

    /// Opaque keychain handle
    pub credential_ref: String,

    pub last_modified: DateTime<Utc>,
}

fn default_group() -> String {
    "default".to_string()
}

impl Identity {
    pub fn new(username: impl Into<String>, credential_ref: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            group: default_group(),
            comment: String::new(),
            credential_ref: credential_ref.into(),
            last_modified: Utc::now(),
        }
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.group = sanitize_component(group);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}
