//! Closed role vocabulary for almsgate accounts.
//!
//! Roles are stored on the profile record as string tags. The set is closed:
//! `donor`, `monastery_admin`, `super_admin`. Accounts may hold several roles
//! at once (a monastery administrator who also donates). Unknown tags in
//! stored data are dropped on read so that a bad row degrades to "no elevated
//! access" instead of failing the whole record.

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Donor,
    MonasteryAdmin,
    SuperAdmin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Donor, Role::MonasteryAdmin, Role::SuperAdmin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Donor => "donor",
            Role::MonasteryAdmin => "monastery_admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    /// Parse a stored role tag. Unknown tags yield `None`.
    pub fn parse(tag: &str) -> Option<Role> {
        match tag.trim() {
            "donor" => Some(Role::Donor),
            "monastery_admin" => Some(Role::MonasteryAdmin),
            "super_admin" => Some(Role::SuperAdmin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collect role tags into a deduplicated role set, dropping unknown tags.
pub fn roles_from_tags<'a, I>(tags: I) -> Vec<Role>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out: Vec<Role> = Vec::new();
    for tag in tags {
        if let Some(role) = Role::parse(tag) {
            if !out.contains(&role) {
                out.push(role);
            }
        }
    }
    out
}

/// Serde helper for role lists stored as string arrays: lenient on unknown
/// tags, strict on shape (a non-array still fails the record).
pub fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Vec<Role>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<String>> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(tags) => roles_from_tags(tags.iter().map(|s| s.as_str())),
        None => Vec::new(),
    })
}
