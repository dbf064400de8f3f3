//! Cache configuration
//!
//! Loaded from YAML, JSON or TOML by file extension, then overridden by
//! `INTERCACHE_*` environment variables.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::backend::{BackendKind, CookieAttributes};
use crate::error::{CacheError, Result};

/// Default prefix prepended to every logical cache key
pub const DEFAULT_KEY_PREFIX: &str = "intercache_";

/// Prefix of the environment variables that override file configuration
pub const ENV_PREFIX: &str = "INTERCACHE_";

/// Whether and where cached values are mirrored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Persistence {
    #[default]
    Disabled,
    Store,
    Cookie,
    Indexed,
}

impl Persistence {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Persistence::Disabled)
    }

    /// Backend selected by this setting, `None` when disabled
    pub fn backend_kind(&self) -> Option<BackendKind> {
        match self {
            Persistence::Disabled => None,
            Persistence::Store => Some(BackendKind::Store),
            Persistence::Cookie => Some(BackendKind::Cookie),
            Persistence::Indexed => Some(BackendKind::Indexed),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Persistence::Disabled => "false",
            Persistence::Store => "store",
            Persistence::Cookie => "cookie",
            Persistence::Indexed => "indexed",
        }
    }
}

impl From<bool> for Persistence {
    fn from(enabled: bool) -> Self {
        if enabled {
            Persistence::Store
        } else {
            Persistence::Disabled
        }
    }
}

impl From<BackendKind> for Persistence {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Store => Persistence::Store,
            BackendKind::Cookie => Persistence::Cookie,
            BackendKind::Indexed => Persistence::Indexed,
        }
    }
}

impl FromStr for Persistence {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "false" | "0" | "off" | "none" => Ok(Persistence::Disabled),
            "true" | "1" | "on" | "store" => Ok(Persistence::Store),
            "cookie" => Ok(Persistence::Cookie),
            "indexed" => Ok(Persistence::Indexed),
            other => Err(CacheError::Config {
                message: format!("unknown persistence setting '{}'", other),
            }),
        }
    }
}

impl fmt::Display for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Persistence {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Persistence::Disabled => serializer.serialize_bool(false),
            other => serializer.serialize_str(other.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for Persistence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(enabled) => Ok(Persistence::from(enabled)),
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Configuration of one cache layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub persistence: Persistence,
    pub key_prefix: String,
    /// Ttl in seconds for mirrored writes; negative never expires, `None`
    /// keeps mirrored data for the session only
    pub persist_ttl_secs: Option<i64>,
    /// Directory holding the durable storage file and the indexed database
    pub storage_dir: PathBuf,
    pub cookie: CookieAttributes,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persistence: Persistence::Disabled,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            persist_ttl_secs: Some(-1),
            storage_dir: default_storage_dir(),
            cookie: CookieAttributes::default(),
        }
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("intercache")
}

/// Serialization format of a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => Some(ConfigFormat::Yaml),
            Some("json") => Some(ConfigFormat::Json),
            Some("toml") => Some(ConfigFormat::Toml),
            _ => None,
        }
    }
}

impl CacheConfig {
    /// Load a configuration file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path).ok_or_else(|| CacheError::Config {
            message: format!("unsupported config file extension: {}", path.display()),
        })?;
        let content = fs::read_to_string(path)?;

        let mut config = Self::parse(&content, format)?;
        EnvOverrides::from_env().apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text without consulting the environment
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        let config: CacheConfig = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| CacheError::Config {
                message: format!("failed to parse YAML config: {}", e),
            })?,
            ConfigFormat::Json => serde_json::from_str(content)?,
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| CacheError::Config {
                message: format!("failed to parse TOML config: {}", e),
            })?,
        };
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        EnvOverrides::from_env().apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.persistence.is_enabled() && self.persist_ttl_secs == Some(0) {
            return Err(CacheError::Config {
                message: "persist_ttl_secs of 0 rejects every mirrored write".to_string(),
            });
        }
        Ok(())
    }

    /// Cookie attributes to attach to mirrored writes, if any are set
    pub fn cookie_attributes(&self) -> Option<CookieAttributes> {
        (!self.cookie.is_empty()).then(|| self.cookie.clone())
    }
}

/// `INTERCACHE_*` variables captured from an environment
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    vars: Vec<(String, String)>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self { vars }
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn apply(&self, config: &mut CacheConfig) -> Result<()> {
        for (name, value) in &self.vars {
            let field = &name[ENV_PREFIX.len()..];
            match field {
                "PERSISTENCE" => config.persistence = value.parse()?,
                "KEY_PREFIX" => config.key_prefix = value.clone(),
                "PERSIST_TTL_SECS" => {
                    config.persist_ttl_secs = match value.trim() {
                        "" | "session" | "none" => None,
                        ttl => Some(ttl.parse().map_err(|_| CacheError::Config {
                            message: format!("{} is not an integer: '{}'", name, ttl),
                        })?),
                    }
                }
                "STORAGE_DIR" => config.storage_dir = PathBuf::from(value),
                "COOKIE_PATH" => config.cookie.path = non_blank(value),
                "COOKIE_DOMAIN" => config.cookie.domain = non_blank(value),
                "COOKIE_SECURE" => {
                    config.cookie.secure = value.trim().parse().map_err(|_| CacheError::Config {
                        message: format!("{} is not a boolean: '{}'", name, value),
                    })?
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
