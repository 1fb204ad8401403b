//! Engine configuration.
//!
//! [`EngineConfig`] can be built in code, read from a JSON file, and
//! overridden from the environment. Durations are stored in milliseconds
//! on disk.
//!
//! # Environment overrides
//!
//! - `LUAHOOK_SCRIPTS_DIR` - startup auto-load directory
//! - `LUAHOOK_VM_TIMEOUT_MS` - per-script timeout
//! - `LUAHOOK_POOL_SIZE` - pre-created interpreters
//! - `LUAHOOK_MAX_VMS` - concurrent pooled interpreter bound
//! - `LUAHOOK_DEBUG` - if "1", keep Lua stack traces in error messages
//! - `LUAHOOK_ENCRYPTION_KEY` - base64 AES-256 key for the `crypto` module

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Smallest memory budget accepted by [`EngineConfig::validate`].
const MIN_MEMORY: usize = 1024 * 1024;

/// Configuration for the hook engine.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing pooled interpreters.
    pub max_vms: usize,
    /// Per-script execution timeout.
    #[serde(rename = "vm_timeout_ms", with = "duration_ms")]
    pub vm_timeout: Duration,
    /// Memory budget per interpreter, in bytes.
    pub max_memory: usize,
    /// Keep interpreter stack traces in error messages.
    pub enable_debug: bool,
    /// Directory walked for `.lua` files at startup. Empty disables auto-load.
    pub scripts_dir: PathBuf,
    /// Reserved for future module allow-listing; not enforced.
    pub allowed_modules: Vec<String>,
    /// Interpreters created when the engine starts.
    pub pool_size: usize,
    /// Base64 AES-256 key for the default encryptor - NOT serialized to disk.
    #[serde(skip_serializing)]
    pub encryption_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_vms: 10,
            vm_timeout: Duration::from_secs(5),
            max_memory: 50 * 1024 * 1024,
            enable_debug: false,
            scripts_dir: PathBuf::from("scripts"),
            allowed_modules: Vec::new(),
            pool_size: 5,
            encryption_key: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file, then apply environment overrides.
    ///
    /// Missing fields fall back to [`EngineConfig::default`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `LUAHOOK_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("LUAHOOK_SCRIPTS_DIR") {
            self.scripts_dir = PathBuf::from(dir);
        }

        if let Ok(timeout) = std::env::var("LUAHOOK_VM_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.vm_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(pool_size) = std::env::var("LUAHOOK_POOL_SIZE") {
            if let Ok(size) = pool_size.parse::<usize>() {
                self.pool_size = size;
            }
        }

        if let Ok(max_vms) = std::env::var("LUAHOOK_MAX_VMS") {
            if let Ok(max) = max_vms.parse::<usize>() {
                self.max_vms = max;
            }
        }

        if let Ok(debug) = std::env::var("LUAHOOK_DEBUG") {
            self.enable_debug = debug == "1";
        }

        if let Ok(key) = std::env::var("LUAHOOK_ENCRYPTION_KEY") {
            self.encryption_key = Some(key);
        }
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.pool_size == 0 {
            return Err(EngineError::Config("pool_size must be at least 1".to_string()));
        }
        if self.max_vms < self.pool_size {
            return Err(EngineError::Config(format!(
                "max_vms ({}) must not be smaller than pool_size ({})",
                self.max_vms, self.pool_size
            )));
        }
        if self.vm_timeout.is_zero() {
            return Err(EngineError::Config("vm_timeout must be non-zero".to_string()));
        }
        if self.max_memory < MIN_MEMORY {
            return Err(EngineError::Config(format!(
                "max_memory ({} bytes) is below the {} byte minimum",
                self.max_memory, MIN_MEMORY
            )));
        }
        Ok(())
    }
}

/// Serialize a `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_vms, 10);
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.vm_timeout, Duration::from_secs(5));
        assert_eq!(config.max_memory, 50 * 1024 * 1024);
        assert!(!config.enable_debug);
        assert_eq!(config.scripts_dir, PathBuf::from("scripts"));
        assert!(config.allowed_modules.is_empty());
        config.validate().expect("defaults should validate");
    }

    #[test]
    fn test_serialization_excludes_encryption_key() {
        let config = EngineConfig {
            encryption_key: Some("c2VjcmV0".to_string()),
            ..EngineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("c2VjcmV0"));
        assert!(json.contains("\"vm_timeout_ms\":5000"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"vm_timeout_ms": 250, "enable_debug": true}"#).unwrap();
        assert_eq!(config.vm_timeout, Duration::from_millis(250));
        assert!(config.enable_debug);
        assert_eq!(config.pool_size, 5);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{"pool_size": 2, "max_vms": 4, "scripts_dir": ""}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.max_vms, 4);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = EngineConfig::load(Path::new("/nonexistent/engine.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_pool = EngineConfig { pool_size: 0, ..EngineConfig::default() };
        assert!(matches!(zero_pool.validate(), Err(EngineError::Config(_))));

        let small_max = EngineConfig { max_vms: 2, pool_size: 3, ..EngineConfig::default() };
        assert!(matches!(small_max.validate(), Err(EngineError::Config(_))));

        let no_timeout = EngineConfig { vm_timeout: Duration::ZERO, ..EngineConfig::default() };
        assert!(matches!(no_timeout.validate(), Err(EngineError::Config(_))));

        let tiny_memory = EngineConfig { max_memory: 1024, ..EngineConfig::default() };
        assert!(matches!(tiny_memory.validate(), Err(EngineError::Config(_))));
    }
}
