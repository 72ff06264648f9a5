//! Role names and their normalized lookup key.
//!
//! Roles are matched case-insensitively everywhere (liveness, readiness,
//! task assignment, restart configs). `RoleKey` is the only place that
//! normalization happens.

use serde::{Deserialize, Serialize};

/// Role name of the human participant.
pub const USER_ROLE: &str = "user";

/// Role that authors implementation work.
pub const BUILDER_ROLE: &str = "builder";

/// Role that reviews implementation work.
pub const REVIEWER_ROLE: &str = "reviewer";

/// Case-insensitive role identifier.
///
/// Constructed from any spelling of a role name; stores the trimmed,
/// lowercased form so equality and hashing agree with role matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleKey(String);

impl RoleKey {
    pub fn new(name: &str) -> Self {
        Self(normalize(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Case-insensitive comparison against a raw role name.
    pub fn matches(&self, name: &str) -> bool {
        self.0 == normalize(name)
    }
}

impl std::fmt::Display for RoleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RoleKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<&String> for RoleKey {
    fn from(name: &String) -> Self {
        Self::new(name)
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Deduplicate role names case-insensitively, keeping the first spelling
/// seen and the original order.
pub fn dedup_roles<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for name in names {
        let name = name.as_ref();
        let key = RoleKey::new(name);
        if key.is_empty() {
            continue;
        }
        if seen.insert(key) {
            out.push(name.trim().to_string());
        }
    }
    out
}
