//! Hook registry: known hook names and the script records attached to each.
//!
//! The registry itself is a plain data structure; the engine shares it as
//! [`SharedRegistry`] so dispatch can snapshot under a read lock while
//! registration takes the write lock.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::EngineError;
use crate::script::{Script, ScriptRecord};

#[derive(Debug, Default, Clone)]
struct HookSlot {
    description: String,
    scripts: Vec<ScriptRecord>,
}

/// Set of registered hooks and their ordered script records.
#[derive(Debug, Default, Clone)]
pub struct HookRegistry {
    hooks: BTreeMap<String, HookSlot>,
    next_id: u64,
}

/// Registry shared between the engine and the `hook` Lua module.
pub type SharedRegistry = Arc<RwLock<HookRegistry>>;

/// Create an empty shared registry.
#[must_use]
pub fn new_shared_registry() -> SharedRegistry {
    Arc::new(RwLock::new(HookRegistry::new()))
}

impl HookRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. Idempotent; a non-empty description replaces the old one.
    pub fn register_hook(&mut self, name: &str, description: &str) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("hook name must not be empty".to_string()));
        }

        let slot = self.hooks.entry(name.to_string()).or_default();
        if !description.is_empty() {
            slot.description = description.to_string();
        }
        log::debug!("Registered hook '{}'", name);
        Ok(())
    }

    /// Append a script to an existing hook and return the stored record.
    pub fn add_script(&mut self, hook: &str, script: Script) -> Result<ScriptRecord, EngineError> {
        if script.name.trim().is_empty() {
            return Err(EngineError::Validation("script name must not be empty".to_string()));
        }
        if script.source.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "script '{}' has empty source",
                script.name
            )));
        }

        let Some(slot) = self.hooks.get_mut(hook) else {
            return Err(EngineError::Validation(format!("hook '{hook}' is not registered")));
        };
        if slot.scripts.iter().any(|s| s.name == script.name) {
            return Err(EngineError::Validation(format!(
                "script '{}' already exists on hook '{hook}'",
                script.name
            )));
        }

        self.next_id += 1;
        let record = ScriptRecord::from_script(self.next_id, hook, script);
        slot.scripts.push(record.clone());

        log::debug!(
            "Added script '{}' (id={}, priority={}) to hook '{}'",
            record.name,
            record.id,
            record.priority,
            hook
        );
        Ok(record)
    }

    /// Remove a script by `(hook, name)`.
    pub fn remove_script(&mut self, hook: &str, name: &str) -> Result<ScriptRecord, EngineError> {
        let slot = self
            .hooks
            .get_mut(hook)
            .ok_or_else(|| EngineError::Validation(format!("hook '{hook}' is not registered")))?;
        let idx = slot
            .scripts
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| {
                EngineError::Validation(format!("script '{name}' not found on hook '{hook}'"))
            })?;

        log::debug!("Removed script '{}' from hook '{}'", name, hook);
        Ok(slot.scripts.remove(idx))
    }

    /// Names of all registered hooks, sorted.
    #[must_use]
    pub fn list_hooks(&self) -> Vec<String> {
        self.hooks.keys().cloned().collect()
    }

    /// Whether `hook` is registered.
    #[must_use]
    pub fn has_hook(&self, hook: &str) -> bool {
        self.hooks.contains_key(hook)
    }

    /// Description of `hook`, if registered.
    #[must_use]
    pub fn description(&self, hook: &str) -> Option<&str> {
        self.hooks.get(hook).map(|s| s.description.as_str())
    }

    /// Scripts of `hook` ordered by ascending priority, then insertion order.
    ///
    /// Unknown hooks yield an empty list.
    #[must_use]
    pub fn get_scripts(&self, hook: &str) -> Vec<ScriptRecord> {
        let mut scripts = self
            .hooks
            .get(hook)
            .map(|s| s.scripts.clone())
            .unwrap_or_default();
        // ids are monotonic, so they encode insertion order
        scripts.sort_by_key(|s| (s.priority, s.id));
        scripts
    }

    /// Same as [`get_scripts`](Self::get_scripts) without disabled records.
    #[must_use]
    pub fn enabled_scripts(&self, hook: &str) -> Vec<ScriptRecord> {
        let mut scripts = self.get_scripts(hook);
        scripts.retain(|s| s.enabled);
        scripts
    }

    /// Total number of script records across all hooks.
    #[must_use]
    pub fn script_count(&self) -> usize {
        self.hooks.values().map(|s| s.scripts.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_hook_idempotent() {
        let mut reg = HookRegistry::new();
        reg.register_hook("user.created", "fired after signup").unwrap();
        reg.register_hook("user.created", "").unwrap();

        assert_eq!(reg.list_hooks(), vec!["user.created".to_string()]);
        assert_eq!(reg.description("user.created"), Some("fired after signup"));

        reg.register_hook("user.created", "updated").unwrap();
        assert_eq!(reg.list_hooks().len(), 1);
        assert_eq!(reg.description("user.created"), Some("updated"));
    }

    #[test]
    fn test_register_hook_rejects_empty_name() {
        let mut reg = HookRegistry::new();
        assert!(matches!(reg.register_hook("  ", ""), Err(EngineError::Validation(_))));
        assert!(reg.list_hooks().is_empty());
    }

    #[test]
    fn test_add_script_validation() {
        let mut reg = HookRegistry::new();
        assert!(matches!(
            reg.add_script("missing", Script::new("a", "return true")),
            Err(EngineError::Validation(_))
        ));

        reg.register_hook("h", "").unwrap();
        assert!(reg.add_script("h", Script::new("", "return true")).is_err());
        assert!(reg.add_script("h", Script::new("a", "")).is_err());

        reg.add_script("h", Script::new("a", "return true")).unwrap();
        let dup = reg.add_script("h", Script::new("a", "return false")).unwrap_err();
        assert!(dup.to_string().contains("already exists"));
        assert_eq!(reg.script_count(), 1);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut reg = HookRegistry::new();
        reg.register_hook("a", "").unwrap();
        reg.register_hook("b", "").unwrap();

        let first = reg.add_script("a", Script::new("x", "return 1")).unwrap();
        let second = reg.add_script("b", Script::new("x", "return 2")).unwrap();
        assert!(second.id > first.id);
        assert_eq!(second.hook, "b");
    }

    #[test]
    fn test_get_scripts_priority_then_insertion() {
        let mut reg = HookRegistry::new();
        reg.register_hook("h", "").unwrap();
        reg.add_script("h", Script::new("late", "x()").with_priority(10)).unwrap();
        reg.add_script("h", Script::new("first_tie", "x()").with_priority(1)).unwrap();
        reg.add_script("h", Script::new("negative", "x()").with_priority(-5)).unwrap();
        reg.add_script("h", Script::new("second_tie", "x()").with_priority(1)).unwrap();

        let names: Vec<_> = reg.get_scripts("h").into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["negative", "first_tie", "second_tie", "late"]);
    }

    #[test]
    fn test_enabled_scripts_skips_disabled() {
        let mut reg = HookRegistry::new();
        reg.register_hook("h", "").unwrap();
        reg.add_script("h", Script::new("on", "x()")).unwrap();
        reg.add_script("h", Script::new("off", "x()").with_enabled(false)).unwrap();

        assert_eq!(reg.get_scripts("h").len(), 2);
        let enabled: Vec<_> = reg.enabled_scripts("h").into_iter().map(|s| s.name).collect();
        assert_eq!(enabled, vec!["on"]);
    }

    #[test]
    fn test_add_then_remove() {
        let mut reg = HookRegistry::new();
        reg.register_hook("h", "").unwrap();
        reg.add_script("h", Script::new("a", "x()")).unwrap();
        reg.add_script("h", Script::new("b", "x()")).unwrap();

        let removed = reg.remove_script("h", "a").unwrap();
        assert_eq!(removed.name, "a");
        assert!(reg.get_scripts("h").iter().all(|s| s.name != "a"));

        assert!(reg.remove_script("h", "a").is_err());
        assert!(reg.remove_script("nope", "b").is_err());
    }

    #[test]
    fn test_unknown_hook_has_no_scripts() {
        let reg = HookRegistry::new();
        assert!(reg.get_scripts("nothing").is_empty());
        assert!(!reg.has_hook("nothing"));
    }
}
