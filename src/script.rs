//! Script descriptions attached to hooks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Input record for [`HookRegistry::add_script`](crate::HookRegistry::add_script).
///
/// Same shape as [`ScriptRecord`] without the engine-assigned id and hash.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Script {
    /// Unique name within the hook.
    pub name: String,
    /// Full Lua source.
    pub source: String,
    /// Disabled scripts stay registered but are skipped at dispatch.
    pub enabled: bool,
    /// Lower runs first; ties keep insertion order.
    pub priority: i32,
    /// Free-form description.
    pub description: String,
    /// Author.
    pub author: String,
    /// Version string.
    pub version: String,
    /// Recorded for reporting; every failure stops the dispatch regardless.
    pub critical: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: String::new(),
            enabled: true,
            priority: 0,
            description: String::new(),
            author: String::new(),
            version: String::new(),
            critical: false,
        }
    }
}

impl Script {
    /// Enabled script with priority 0.
    #[must_use]
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            ..Self::default()
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Immutable script description owned by a hook slot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ScriptRecord {
    /// Monotonic id assigned by the registry.
    pub id: u64,
    /// Hook that owns this record.
    pub hook: String,
    /// Unique name within the hook.
    pub name: String,
    /// Full Lua source.
    pub source: String,
    /// Whether dispatch runs this record.
    pub enabled: bool,
    /// Lower runs first; ties keep insertion order.
    pub priority: i32,
    /// Free-form description.
    pub description: String,
    /// Author.
    pub author: String,
    /// Version string.
    pub version: String,
    /// Recorded for reporting; every failure stops the dispatch regardless.
    pub critical: bool,
    /// SHA-256 of `source`, hex encoded.
    pub hash: String,
}

impl ScriptRecord {
    pub(crate) fn from_script(id: u64, hook: &str, script: Script) -> Self {
        let hash = content_hash(&script.source);
        Self {
            id,
            hook: hook.to_string(),
            name: script.name,
            source: script.source,
            enabled: script.enabled,
            priority: script.priority,
            description: script.description,
            author: script.author,
            version: script.version,
            critical: script.critical,
            hash,
        }
    }

    /// Build a detached record for [`Engine::execute`](crate::Engine::execute).
    ///
    /// The id is 0 because the record is not registered anywhere.
    #[must_use]
    pub fn detached(hook: &str, script: Script) -> Self {
        Self::from_script(0, hook, script)
    }
}

/// Hex SHA-256 of a script body.
#[must_use]
pub fn content_hash(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}
