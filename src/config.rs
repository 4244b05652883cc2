//! Process configuration.
//!
//! One TOML file with a `[mqtt]` table for the broker connection, a `[bridge]`
//! table for the topic projection and optional `[[elements]]` tables that seed
//! the in-memory model:
//!
//! ```toml
//! log_level = "info"
//!
//! [mqtt]
//! broker = "localhost"
//! username = "car"
//! password = "secret"
//!
//! [bridge]
//! prefix = "carconnectivity/0"
//! topic_format = "json"
//! convert_timezone = "Europe/Berlin"
//!
//! [[elements]]
//! path = "/garage/WVW1/climatization/target_temperature"
//! value_type = "float"
//! writable = true
//! unit = "°C"
//! units = ["°C", "°F", "K"]
//! ```
//!
//! [`Config::validate`] turns the raw file into the typed settings consumed by
//! the bridge and the broker client. Everything that could fail later at
//! runtime (regexes, strftime patterns, timezones) is checked here.

use crate::bridge::codec::{CodecOptions, ImageFormat};
use crate::bridge::engine::{BridgeSettings, DEFAULT_PLUGIN_ID, DEFAULT_PREFIX};
use crate::bridge::topics::TopicFormat;
use crate::model::{ElementSeed, ValueKind};
use crate::mqtt::config::{DEFAULT_PORT, DEFAULT_TLS_PORT};
use crate::mqtt::{MqttConfig, TlsConfig};
use chrono::format::{Item, StrftimeItems};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "CARBRIDGE_CONFIG";
const CONFIG_DIR: &str = "carbridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("No config file given and no config directory available")]
    NoConfigLocation,

    #[error("No MQTT broker specified in config (\"broker\" missing)")]
    MissingBroker,

    #[error("Invalid port specified in config (\"port\" out of range, must be 1-65535): {0}")]
    InvalidPort(i64),

    #[error("Invalid keepalive specified in config (must be at least 1 second)")]
    InvalidKeepalive,

    #[error("\"username\" and \"password\" must be given together")]
    IncompleteCredentials,

    #[error("TLS file {0} is not readable")]
    TlsFile(PathBuf),

    #[error("Invalid topic format \"{0}\" (\"topic_format\" must be one of [simple, json])")]
    InvalidTopicFormat(String),

    #[error("Invalid image format \"{0}\" (\"image_format\" must be one of [txt, png])")]
    InvalidImageFormat(String),

    #[error("Invalid timezone \"{0}\" in \"convert_timezone\"")]
    InvalidTimezone(String),

    #[error("Invalid time format \"{0}\" in \"time_format\"")]
    InvalidTimeFormat(String),

    #[error("Invalid locale \"{0}\"")]
    InvalidLocale(String),

    #[error("Invalid topic filter regex: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error("Invalid element {path}: {reason}")]
    InvalidElement { path: String, reason: String },
}

/// Raw `[mqtt]` table.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    pub broker: Option<String>,
    pub port: Option<i64>,
    pub clientid: Option<String>,
    /// Seconds.
    pub keepalive: Option<u64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub tls_cafile: Option<PathBuf>,
    pub tls_certfile: Option<PathBuf>,
    pub tls_keyfile: Option<PathBuf>,
}

/// Raw `[bridge]` table.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BridgeSection {
    pub plugin_id: Option<String>,
    pub prefix: Option<String>,
    pub topic_format: Option<String>,
    pub image_format: Option<String>,
    pub topic_filter_regex: Option<String>,
    pub republish_on_update: bool,
    pub retain_on_disconnect: bool,
    /// Seconds.
    pub ignore_for: Option<u64>,
    pub with_full_json: bool,
    pub convert_timezone: Option<String>,
    pub time_format: Option<String>,
    pub locale: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub mqtt: MqttSection,
    pub bridge: BridgeSection,
    pub elements: Vec<ElementSeed>,
}

/// Validated, typed configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_level: String,
    pub mqtt: MqttConfig,
    pub bridge: BridgeSettings,
    pub elements: Vec<ElementSeed>,
}

impl Config {
    /// Picks the config file: explicit argument, then `CARBRIDGE_CONFIG`,
    /// then `<config dir>/carbridge/config.toml`.
    pub fn locate(cli_arg: Option<&str>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = cli_arg {
            return Ok(PathBuf::from(path));
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigLocation)?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        debug!("Parsed config with {} element seeds", config.elements.len());
        Ok(config)
    }

    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let mqtt = self.mqtt.validate()?;
        let bridge = self.bridge.validate()?;
        validate_seeds(&self.elements)?;
        Ok(Settings {
            log_level: self.log_level.clone().unwrap_or_else(|| "info".to_string()),
            mqtt,
            bridge,
            elements: self.elements.clone(),
        })
    }
}

impl MqttSection {
    fn validate(&self) -> Result<MqttConfig, ConfigError> {
        let broker = self
            .broker
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or(ConfigError::MissingBroker)?;

        let port = match self.port {
            Some(port) => u16::try_from(port)
                .ok()
                .filter(|p| *p != 0)
                .ok_or(ConfigError::InvalidPort(port))?,
            None if self.tls => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        };

        let client_id = self
            .clientid
            .clone()
            .unwrap_or_else(|| format!("carbridge-{}", std::process::id()));

        let mut config = MqttConfig::new(broker, client_id);
        config.port = port;
        if let Some(keepalive) = self.keepalive {
            if keepalive == 0 {
                return Err(ConfigError::InvalidKeepalive);
            }
            config.keepalive = Duration::from_secs(keepalive);
        }

        match (&self.username, &self.password) {
            (Some(_), Some(_)) | (None, None) => {
                config.username = self.username.clone();
                config.password = self.password.clone();
            }
            _ => return Err(ConfigError::IncompleteCredentials),
        }

        if self.tls {
            for path in [&self.tls_cafile, &self.tls_certfile, &self.tls_keyfile]
                .into_iter()
                .flatten()
            {
                if !path.is_file() {
                    return Err(ConfigError::TlsFile(path.clone()));
                }
            }
            config.tls = Some(TlsConfig {
                ca_file: self.tls_cafile.clone(),
                client_cert: self.tls_certfile.clone(),
                client_key: self.tls_keyfile.clone(),
            });
        }
        Ok(config)
    }
}

impl BridgeSection {
    fn validate(&self) -> Result<BridgeSettings, ConfigError> {
        let defaults = BridgeSettings::default();

        let topic_format = match self.topic_format.as_deref().map(str::to_lowercase) {
            None => TopicFormat::Simple,
            Some(f) if f == "simple" => TopicFormat::Simple,
            Some(f) if f == "json" => TopicFormat::Json,
            Some(f) => return Err(ConfigError::InvalidTopicFormat(f)),
        };

        let image_format = match self.image_format.as_deref().map(str::to_lowercase) {
            None => ImageFormat::default(),
            Some(f) if f == "txt" => ImageFormat::Txt,
            Some(f) if f == "png" => ImageFormat::Png,
            Some(f) => return Err(ConfigError::InvalidImageFormat(f)),
        };

        let timezone = self
            .convert_timezone
            .as_deref()
            .map(|name| {
                name.parse::<Tz>()
                    .map_err(|_| ConfigError::InvalidTimezone(name.to_string()))
            })
            .transpose()?;

        if let Some(pattern) = &self.time_format {
            if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
                return Err(ConfigError::InvalidTimeFormat(pattern.clone()));
            }
        }

        if let Some(locale) = &self.locale {
            if !is_locale_tag(locale) {
                return Err(ConfigError::InvalidLocale(locale.clone()));
            }
        }

        let topic_filter = self
            .topic_filter_regex
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        Ok(BridgeSettings {
            plugin_id: self
                .plugin_id
                .clone()
                .unwrap_or_else(|| DEFAULT_PLUGIN_ID.to_string()),
            prefix: self
                .prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            topic_format,
            topic_filter,
            republish_on_update: self.republish_on_update,
            retain_on_disconnect: self.retain_on_disconnect,
            ignore_for: self
                .ignore_for
                .map(Duration::from_secs)
                .unwrap_or(defaults.ignore_for),
            with_full_json: self.with_full_json,
            codec: CodecOptions {
                locale: self.locale.clone(),
                timezone,
                time_format: self.time_format.clone(),
                image_format,
            },
        })
    }
}

/// Accepts POSIX and BCP 47 style tags such as `de_DE`, `en-US` or `de_DE.UTF-8`.
fn is_locale_tag(tag: &str) -> bool {
    let (name, encoding) = match tag.split_once('.') {
        Some((name, encoding)) => (name, Some(encoding)),
        None => (tag, None),
    };
    if encoding.is_some_and(|e| e.is_empty() || !e.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')) {
        return false;
    }
    let mut parts = name.split(['_', '-']);
    let language_ok = parts
        .next()
        .is_some_and(|l| (2..=3).contains(&l.len()) && l.chars().all(|c| c.is_ascii_alphabetic()));
    language_ok
        && parts.all(|p| (2..=8).contains(&p.len()) && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

fn validate_seeds(seeds: &[ElementSeed]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for seed in seeds {
        let invalid = |reason: &str| ConfigError::InvalidElement {
            path: seed.path.clone(),
            reason: reason.to_string(),
        };
        if !seed.path.starts_with('/') || seed.path.len() < 2 {
            return Err(invalid("path must start with '/'"));
        }
        if !seen.insert(seed.path.as_str()) {
            return Err(invalid("duplicate path"));
        }
        if seed.value_type == ValueKind::Enum && seed.members.is_empty() && !seed.command {
            return Err(invalid("enum elements need \"members\""));
        }
        if let (Some(min), Some(max)) = (seed.min, seed.max) {
            if min > max {
                return Err(invalid("\"min\" is greater than \"max\""));
            }
        }
        if let Some(unit) = &seed.unit {
            if !seed.units.is_empty() && !seed.units.contains(unit) {
                return Err(invalid("\"unit\" is not listed in \"units\""));
            }
        }
    }
    Ok(())
}
