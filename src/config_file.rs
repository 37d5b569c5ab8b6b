//! Dashboard configuration: a YAML (or TOML) file plus secrets from the environment.
//!
//! Format of config file:
//! ```rust
//! let cfg = "
//! prometheus_url: http://localhost:9090
//! dashboards:
//!   - name: Hosts
//!     refresh_interval: 15
//!     metrics:
//!       - title: CPU
//!         query: 1 - avg(rate(node_cpu_seconds_total{mode=\"idle\"}[5m]))
//!         unit: \"%\"
//!         alert:
//!           threshold: 0.9
//!           duration: 10m
//!           priority: HIGH
//! ";
//! let secrets = [("pushover_token", "token"), ("pushover_user", "user")];
//! yamp::parse_config_str(cfg, yamp::Format::Yaml, secrets).unwrap();
//! ```
//!
//! `pushover_token` and `pushover_user` are normally left out of the file and supplied
//! through `YAMP_PUSHOVER_TOKEN` and `YAMP_PUSHOVER_USER`.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::alert::AlertConfig;

pub const ENV_PREFIX: &str = "YAMP_";
pub const CONFIG_PATH_VAR: &str = "YAMP_CONFIG_PATH";
const SECRET_FIELDS: [&str; 2] = ["pushover_token", "pushover_user"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found at {}", .path.display())]
    NotFound { path: PathBuf },
    #[error("Could not read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Error parsing config file: {0}")]
    Parse(#[from] ParseError),
    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

/// One schema violation: a dotted field path and what is wrong with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

/// Every violation found while validating a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.len();
        write!(f, "{} validation error{}", n, if n == 1 { "" } else { "s" })?;
        for FieldError { field, reason } in &self.0 {
            write!(f, "; {field}: {reason}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Document syntax, picked from the file extension by the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Toml,
}

impl Format {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }

    fn parse(self, text: &str) -> Result<Value, ParseError> {
        Ok(match self {
            Self::Yaml => serde_yaml::from_str(text)?,
            Self::Toml => toml::from_str(text)?,
        })
    }
}

/// Validated configuration. Built once at startup and only read afterwards.
#[derive(Debug)]
pub struct Config {
    pub prometheus_url: Url,
    pub pushover_token: SecretString,
    pub pushover_user: SecretString,
    pub dashboards: Vec<Dashboard>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dashboard {
    pub name: String,
    /// Seconds between refreshes, always > 0.
    pub refresh_interval: u64,
    pub metrics: Vec<Metric>,
}

impl Dashboard {
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Metric {
    pub title: String,
    pub query: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub alert: Option<AlertConfig>,
}

// Each field is deserialized on its own so that one bad field does not hide the others.
enum Raw<T> {
    Missing,
    Invalid,
    Value(T),
}

impl<T> Raw<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> Raw<U> {
        match self {
            Raw::Missing => Raw::Missing,
            Raw::Invalid => Raw::Invalid,
            Raw::Value(v) => Raw::Value(f(v)),
        }
    }
}

fn take<T: DeserializeOwned>(
    map: &mut Map<String, Value>,
    key: &str,
    path: &str,
    errors: &mut Vec<FieldError>,
) -> Raw<T> {
    match map.remove(key) {
        None | Some(Value::Null) => Raw::Missing,
        Some(v) => match serde_json::from_value(v) {
            Ok(t) => Raw::Value(t),
            Err(e) => {
                errors.push(FieldError {
                    field: path.to_owned(),
                    reason: e.to_string(),
                });
                Raw::Invalid
            }
        },
    }
}

struct RawConfig {
    prometheus_url: Raw<String>,
    pushover_token: Raw<String>,
    pushover_user: Raw<String>,
    dashboards: Raw<Vec<RawDashboard>>,
}

struct RawDashboard {
    path: String,
    name: Raw<String>,
    refresh_interval: Raw<i64>,
    metrics: Raw<Vec<Metric>>,
}

const DEFAULT_REFRESH_INTERVAL: i64 = 30;

impl RawDashboard {
    fn from_map(mut map: Map<String, Value>, path: String, errors: &mut Vec<FieldError>) -> Self {
        let name = take(&mut map, "name", &format!("{path}.name"), errors);
        let refresh_interval = take(
            &mut map,
            "refresh_interval",
            &format!("{path}.refresh_interval"),
            errors,
        );
        let metrics: Raw<Vec<Metric>> =
            take::<Vec<Value>>(&mut map, "metrics", &format!("{path}.metrics"), errors).map(|items| {
                items
                    .into_iter()
                    .enumerate()
                    .filter_map(|(j, item)| match serde_json::from_value::<Metric>(item) {
                        Ok(m) => Some(m),
                        Err(e) => {
                            errors.push(FieldError {
                                field: format!("{path}.metrics.{j}"),
                                reason: e.to_string(),
                            });
                            None
                        }
                    })
                    .collect()
            });

        Self {
            path,
            name,
            refresh_interval,
            metrics,
        }
    }
}

impl RawConfig {
    fn from_document(mut doc: Map<String, Value>, errors: &mut Vec<FieldError>) -> Self {
        let prometheus_url = take(&mut doc, "prometheus_url", "prometheus_url", errors);
        let pushover_token = take(&mut doc, "pushover_token", "pushover_token", errors);
        let pushover_user = take(&mut doc, "pushover_user", "pushover_user", errors);
        let dashboards = take::<Vec<Value>>(&mut doc, "dashboards", "dashboards", errors).map(
            |items| {
                let mut dashboards = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let path = format!("dashboards.{i}");
                    match item {
                        Value::Object(map) => {
                            dashboards.push(RawDashboard::from_map(map, path, errors))
                        }
                        other => errors.push(FieldError {
                            field: path,
                            reason: format!("expected a mapping, found {}", value_kind(&other)),
                        }),
                    }
                }
                dashboards
            },
        );

        Self {
            prometheus_url,
            pushover_token,
            pushover_user,
            dashboards,
        }
    }

    /// Check the invariants, adding to the type errors already found in `errors`.
    fn validate(self, mut errors: Vec<FieldError>) -> Result<Config, ValidationErrors> {
        let mut fail = |field: &str, reason: String| {
            errors.push(FieldError {
                field: field.to_owned(),
                reason,
            })
        };

        let prometheus_url = match self.prometheus_url {
            Raw::Missing => {
                fail("prometheus_url", "field required".to_owned());
                None
            }
            Raw::Invalid => None,
            Raw::Value(url) => match Url::parse(&url) {
                Ok(u) if !matches!(u.scheme(), "http" | "https") => {
                    fail(
                        "prometheus_url",
                        format!("URL scheme should be 'http' or 'https', got {:?}", u.scheme()),
                    );
                    None
                }
                Ok(u) if !u.has_host() => {
                    fail("prometheus_url", "URL has no host".to_owned());
                    None
                }
                Ok(u) => Some(u),
                Err(e) => {
                    fail("prometheus_url", format!("invalid URL {url:?}: {e}"));
                    None
                }
            },
        };

        let mut secret = |field: &str, value: Raw<String>| match value {
            Raw::Missing => {
                fail(
                    field,
                    format!("field required (set {}{})", ENV_PREFIX, field.to_uppercase()),
                );
                None
            }
            Raw::Invalid => None,
            Raw::Value(s) if s.trim().is_empty() => {
                fail(field, "must not be empty".to_owned());
                None
            }
            Raw::Value(s) => Some(SecretString::new(s.into())),
        };
        let pushover_token = secret("pushover_token", self.pushover_token);
        let pushover_user = secret("pushover_user", self.pushover_user);

        let dashboards = match self.dashboards {
            Raw::Missing => {
                fail("dashboards", "field required".to_owned());
                None
            }
            Raw::Invalid => None,
            Raw::Value(raw) => {
                let mut dashboards = Vec::with_capacity(raw.len());
                for d in raw {
                    let path = d.path;
                    let name = match d.name {
                        Raw::Missing => {
                            fail(&format!("{path}.name"), "field required".to_owned());
                            None
                        }
                        Raw::Invalid => None,
                        Raw::Value(n) if n.trim().is_empty() => {
                            fail(&format!("{path}.name"), "must not be empty".to_owned());
                            None
                        }
                        Raw::Value(n) => Some(n),
                    };
                    let refresh_interval = match d.refresh_interval {
                        Raw::Missing => Some(DEFAULT_REFRESH_INTERVAL as u64),
                        Raw::Invalid => None,
                        Raw::Value(r) if r <= 0 => {
                            fail(
                                &format!("{path}.refresh_interval"),
                                format!("must be greater than 0, got {r}"),
                            );
                            None
                        }
                        Raw::Value(r) => Some(r as u64),
                    };
                    let metrics = match d.metrics {
                        Raw::Missing => {
                            fail(&format!("{path}.metrics"), "field required".to_owned());
                            None
                        }
                        Raw::Invalid => None,
                        Raw::Value(m) => Some(m),
                    };

                    if let (Some(name), Some(refresh_interval), Some(metrics)) =
                        (name, refresh_interval, metrics)
                    {
                        dashboards.push(Dashboard {
                            name,
                            refresh_interval,
                            metrics,
                        });
                    }
                }
                Some(dashboards)
            }
        };

        match (prometheus_url, pushover_token, pushover_user, dashboards) {
            (Some(prometheus_url), Some(pushover_token), Some(pushover_user), Some(dashboards))
                if errors.is_empty() =>
            {
                Ok(Config {
                    prometheus_url,
                    pushover_token,
                    pushover_user,
                    dashboards,
                })
            }
            _ => Err(ValidationErrors(errors)),
        }
    }
}

/// Parse an in-memory document, overlaying `secrets` (field name, value) on top of it.
pub fn parse_config_str<K, V>(
    cfg: &str,
    format: Format,
    secrets: impl IntoIterator<Item = (K, V)>,
) -> Result<Config, ConfigError>
where
    K: Into<String>,
    V: Into<String>,
{
    let doc = format.parse(cfg)?;
    let mut doc = match doc {
        Value::Object(map) => map,
        // an empty YAML document
        Value::Null => Map::new(),
        other => {
            return Err(ValidationErrors(vec![FieldError {
                field: "<root>".to_owned(),
                reason: format!("expected a mapping, found {}", value_kind(&other)),
            }])
            .into())
        }
    };

    for (field, value) in secrets {
        doc.insert(field.into(), Value::String(value.into()));
    }

    let mut errors = Vec::new();
    let raw = RawConfig::from_document(doc, &mut errors);
    Ok(raw.validate(errors)?)
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

/// `config/yamp.yaml` under the installation root.
pub fn default_config_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join("yamp.yaml")
}

/// Load the configuration using the process environment.
pub fn load_config() -> Result<Config, ConfigError> {
    ConfigLoader::from_env().load()
}

/// Resolves, reads and validates the config file against a snapshot of environment variables.
#[derive(Clone, Debug, Default)]
pub struct ConfigLoader {
    vars: HashMap<String, String>,
    // kept as an OS string so non-UTF-8 paths still work
    env_path: Option<PathBuf>,
    path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn from_env() -> Self {
        Self::with_vars(std::env::vars_os())
    }

    pub fn with_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut loader = Self::default();
        for (k, v) in vars {
            let (k, v) = (k.into(), v.into());
            if k.to_str() == Some(CONFIG_PATH_VAR) {
                if !v.to_string_lossy().trim().is_empty() {
                    loader.env_path = Some(PathBuf::from(v));
                }
                continue;
            }

            match (k.into_string(), v.into_string()) {
                (Ok(k), Ok(v)) => {
                    loader.vars.insert(k, v);
                }
                (Ok(k), Err(_)) if k.starts_with(ENV_PREFIX) => {
                    warn!(var = %k, "ignoring environment variable that is not valid UTF-8");
                }
                _ => {}
            }
        }
        loader
    }

    /// Use this file regardless of `YAMP_CONFIG_PATH`.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    // empty and whitespace-only variables count as unset
    fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn resolve_path(&self) -> PathBuf {
        if let Some(p) = &self.path {
            return p.clone();
        }

        self.env_path.clone().unwrap_or_else(default_config_path)
    }

    fn secrets(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        SECRET_FIELDS.into_iter().filter_map(move |field| {
            let var = format!("{}{}", ENV_PREFIX, field.to_uppercase());
            self.var(&var).map(|v| (field, v))
        })
    }

    pub fn load(&self) -> Result<Config, ConfigError> {
        let path = self.resolve_path();
        if !path.exists() {
            return Err(ConfigError::NotFound { path });
        }

        debug!(path = %path.display(), "loading configuration");
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let cfg = parse_config_str(&text, Format::from_path(&path), self.secrets())?;
        info!(
            path = %path.display(),
            dashboards = cfg.dashboards.len(),
            "configuration loaded"
        );
        Ok(cfg)
    }
}
