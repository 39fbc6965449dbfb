//! User and project configuration management
//!
//! Configuration is stored in TOML format at `~/.forge/config.toml`.
//! Every section is optional; missing values fall back to defaults.
//!
//! # Examples
//!
//! ```no_run
//! use forgepm::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//!
//! for registry in config.enabled_registries() {
//!     println!("{} (priority {}): {}", registry.name, registry.priority, registry.url);
//! }
//!
//! let mut config = config;
//! config.cache.ttl_seconds = 600;
//! config.save()?;
//! # Ok(())
//! # }
//! ```

use crate::logging::LoggingConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// User configuration file (`~/.forge/config.toml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem tier locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Remote registries, tried in ascending priority order
    #[serde(default = "default_registries")]
    pub registries: Vec<RegistrySource>,

    /// Manifest cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Dependency resolver settings
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Project-local tier
    #[serde(default = "default_local_path")]
    pub local: String,

    /// User-global tier
    #[serde(default = "default_global_path")]
    pub global: String,
}

fn default_local_path() -> String {
    "./.forge".to_string()
}

fn default_global_path() -> String {
    "~/.forge".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            local: default_local_path(),
            global: default_global_path(),
        }
    }
}

/// A remote registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySource {
    pub name: String,

    /// `https://...`, `file://...` or a plain directory path
    pub url: String,

    /// 1 is the highest priority
    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_registries() -> Vec<RegistrySource> {
    vec![RegistrySource {
        name: "fractary".to_string(),
        url: "https://registry.fractary.com".to_string(),
        priority: 1,
        enabled: true,
    }]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Time-to-live for cached manifests and content
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Cache directory; defaults to `<global>/cache`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

fn default_ttl_seconds() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: default_ttl_seconds(),
            dir: None,
        }
    }
}

/// Dependency resolver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Maximum dependency depth before resolution is aborted (default: 10)
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Timeout for every registry request in seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
}

fn default_max_depth() -> usize {
    10
}

fn default_fetch_timeout() -> u64 {
    30
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            fetch_timeout_seconds: default_fetch_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            registries: default_registries(),
            cache: CacheConfig::default(),
            resolver: ResolverConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Get the default config file path
    ///
    /// Uses FORGE_CONFIG_DIR if set, otherwise ~/.forge/config.toml
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(config_dir) = std::env::var("FORGE_CONFIG_DIR") {
            return Ok(PathBuf::from(config_dir).join("config.toml"));
        }

        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not find home directory".to_string()))?;

        Ok(home.join(".forge").join("config.toml"))
    }

    /// Load config from the default location, or defaults if it doesn't exist
    ///
    /// Environment variable overrides:
    /// - `FORGE_REGISTRY_LOCAL_PATH` / `FORGE_REGISTRY_GLOBAL_PATH`: tier roots
    /// - `FORGE_REGISTRY_REMOTE_URL`: URL of the highest-priority registry
    /// - `FORGE_CACHE_ENABLED`: `true`, `1` or `yes` enables the cache
    /// - `FORGE_LOG_LEVEL`: logging level
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a specific file without applying env overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::default_path()?)
    }

    /// Save config to a specific file
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_value("FORGE_REGISTRY_LOCAL_PATH") {
            self.paths.local = value;
        }
        if let Some(value) = env_value("FORGE_REGISTRY_GLOBAL_PATH") {
            self.paths.global = value;
        }
        if let Some(url) = env_value("FORGE_REGISTRY_REMOTE_URL") {
            self.set_primary_registry_url(url);
        }
        if let Some(value) = env_value("FORGE_CACHE_ENABLED") {
            self.cache.enabled = matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(value) = env_value("FORGE_LOG_LEVEL") {
            self.logging.level = value.to_ascii_lowercase();
        }
    }

    /// Point the highest-priority registry at `url`, adding one if none exist
    pub fn set_primary_registry_url(&mut self, url: String) {
        let primary = self
            .registries
            .iter_mut()
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

        match primary {
            Some(registry) => registry.url = url,
            None => self.registries.push(RegistrySource {
                name: "default".to_string(),
                url,
                priority: 1,
                enabled: true,
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for registry in &self.registries {
            // Registry names become cache directory names
            crate::component::validate_name(&registry.name)
                .map_err(|e| Error::Config(format!("Invalid registry name: {}", e)))?;
            if !seen.insert(registry.name.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate registry name '{}'",
                    registry.name
                )));
            }
        }
        if self.resolver.max_depth == 0 {
            return Err(Error::Config("resolver.max_depth must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Enabled registries in ascending priority order (ties broken by name)
    pub fn enabled_registries(&self) -> Vec<RegistrySource> {
        let mut registries: Vec<RegistrySource> =
            self.registries.iter().filter(|r| r.enabled).cloned().collect();
        registries.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        registries
    }

    pub fn local_root(&self) -> PathBuf {
        expand_path(&self.paths.local)
    }

    pub fn global_root(&self) -> PathBuf {
        expand_path(&self.paths.global)
    }

    pub fn cache_dir(&self) -> PathBuf {
        match &self.cache.dir {
            Some(dir) => expand_path(dir),
            None => self.global_root().join("cache"),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Expand `~` and environment variables in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}
