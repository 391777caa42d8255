//! TOML configuration for the engine and the HTTP server.
//!
//! Every key has a default, so a missing file or an empty one is a valid
//! configuration.
//!
//! ```toml
//! log_filter = "info"
//!
//! [engine]
//! default_confidence_level = 0.95
//! baseline_conversion_rate = 0.03
//! minimum_detectable_effect = 0.2
//! power = 0.8
//! winner_metric = "revenue_per_visitor"
//!
//! [server]
//! bind = "127.0.0.1"
//! port = 8787
//! database = "experiments.db"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ExperimentError, Result};
use crate::model::ConfidenceLevel;
use crate::results::WinnerMetric;
use crate::stats::{DEFAULT_BASELINE_RATE, DEFAULT_POWER};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Used when a create request does not name a confidence level.
    pub default_confidence_level: ConfidenceLevel,
    /// Expected conversion rate of the control, for sample sizing.
    pub baseline_conversion_rate: f64,
    /// Relative lift the default minimum sample size is designed to detect.
    pub minimum_detectable_effect: f64,
    pub power: f64,
    pub winner_metric: WinnerMetric,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_confidence_level: ConfidenceLevel::NinetyFive,
            baseline_conversion_rate: DEFAULT_BASELINE_RATE,
            minimum_detectable_effect: 0.2,
            power: DEFAULT_POWER,
            winner_metric: WinnerMetric::RevenuePerVisitor,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let open_unit = |name: &str, v: f64| {
            if v > 0.0 && v < 1.0 {
                Ok(())
            } else {
                Err(ExperimentError::Config(format!("{name} must be in (0, 1), got {v}")))
            }
        };
        open_unit("baseline_conversion_rate", self.baseline_conversion_rate)?;
        open_unit("power", self.power)?;
        if !(self.minimum_detectable_effect > 0.0 && self.minimum_detectable_effect.is_finite()) {
            return Err(ExperimentError::Config(format!(
                "minimum_detectable_effect must be positive, got {}",
                self.minimum_detectable_effect
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// SQLite database file; the in-memory store is used when absent.
    pub database: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1".into(), port: 8787, database: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub log_filter: String,
    pub engine: EngineConfig,
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".into(),
            engine: EngineConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| ExperimentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| {
                    ExperimentError::Config(format!("cannot read {}: {e}", p.display()))
                })?;
                Self::from_toml(&text)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.server.port == 0 {
            return Err(ExperimentError::Config("server.port must be non-zero".into()));
        }
        Ok(())
    }
}
