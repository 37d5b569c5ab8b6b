//! Alert definitions attached to dashboard metrics.

use std::fmt;

use color_eyre::{eyre::eyre, Report};
use serde::Deserialize;

/// Delivery priority of an alert, ordered `Low < Normal < High`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "PriorityRepr")]
pub enum AlertPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl AlertPriority {
    pub fn level(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }
}

impl fmt::Display for AlertPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
        };
        f.write_str(s)
    }
}

// priorities are written either as their numeric level or by name.
#[derive(Deserialize)]
#[serde(untagged)]
enum PriorityRepr {
    Level(i64),
    Name(String),
}

impl TryFrom<PriorityRepr> for AlertPriority {
    type Error = String;
    fn try_from(value: PriorityRepr) -> Result<Self, Self::Error> {
        match value {
            PriorityRepr::Level(0) => Ok(Self::Low),
            PriorityRepr::Level(1) => Ok(Self::Normal),
            PriorityRepr::Level(2) => Ok(Self::High),
            PriorityRepr::Level(l) => Err(format!("unknown alert priority level {l}")),
            PriorityRepr::Name(name) => match name.to_lowercase().as_str() {
                "low" => Ok(Self::Low),
                "normal" => Ok(Self::Normal),
                "high" => Ok(Self::High),
                _ => Err(format!("unknown alert priority {name:?}")),
            },
        }
    }
}

fn default_duration() -> String {
    "5m".to_owned()
}

/// When a metric should alert: the value crosses `threshold` for `duration`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct AlertConfig {
    pub threshold: f64,
    #[serde(default = "default_duration")]
    pub duration: String,
    #[serde(default)]
    pub priority: AlertPriority,
}

impl AlertConfig {
    /// The sustained-violation window. `duration` is only checked here, not at load time.
    pub fn window(&self) -> Result<chrono::Duration, Report> {
        duration_str::parse_chrono(&self.duration)
            .map_err(|e| eyre!("Invalid alert duration {:?}: {}", self.duration, e))
    }
}
