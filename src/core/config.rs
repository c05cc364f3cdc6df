//! Configuration - Type-safe, validated config
//!
//! Loaded from `config.toml`. The shared secret can be overridden with the
//! `ALEPH_SECRET` environment variable (a `.env` file is honoured).

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::book::security::InstrumentKind;
use crate::core::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Agent gateway
    #[serde(default)]
    pub server: ServerConfig,

    /// Trading session clock
    #[serde(default)]
    pub session: SessionConfig,

    /// Replay inputs for the simulated broker
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Tracked instruments
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. "127.0.0.1:7000"
    #[serde(default = "default_listen")]
    pub listen: String,

    /// First line the agent must send after connecting
    #[serde(default = "default_secret")]
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session open, "HH:MM:SS" local exchange time
    #[serde(default = "default_open")]
    pub open: String,

    /// Session close, "HH:MM:SS"
    #[serde(default = "default_close")]
    pub close: String,

    /// Wall-clock seconds per tick
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u32,

    /// Named operations allowed per tick (cancel-all is exempt)
    #[serde(default = "default_max_ops")]
    pub max_ops_per_tick: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Recorded quote tape
    pub quote_file: Option<PathBuf>,

    /// Recorded trade tape
    pub trade_file: Option<PathBuf>,

    /// Starting cash in KRW
    #[serde(default = "default_balance")]
    pub initial_balance: i64,

    /// Where to write the end-of-session statistics (JSON)
    pub report: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub code: String,
    pub kind: InstrumentKind,
    /// Holdings carried over from the previous session
    #[serde(default)]
    pub holdings: i64,
}

fn default_listen() -> String {
    "127.0.0.1:7000".to_string()
}
fn default_secret() -> String {
    "aleph".to_string()
}
fn default_open() -> String {
    "09:00:00".to_string()
}
fn default_close() -> String {
    "15:20:00".to_string()
}
fn default_tick_secs() -> u32 {
    10
}
fn default_max_ops() -> usize {
    20
}
fn default_balance() -> i64 {
    10_000_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            secret: default_secret(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open: default_open(),
            close: default_close(),
            tick_secs: default_tick_secs(),
            max_ops_per_tick: default_max_ops(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            quote_file: None,
            trade_file: None,
            initial_balance: default_balance(),
            report: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            simulation: SimulationConfig::default(),
            instruments: vec![],
        }
    }
}

impl SessionConfig {
    pub fn open_secs(&self) -> Result<u32> {
        parse_clock(&self.open)
    }

    pub fn close_secs(&self) -> Result<u32> {
        parse_clock(&self.close)
    }
}

/// "HH:MM:SS" to seconds since midnight.
pub fn parse_clock(s: &str) -> Result<u32> {
    let t = NaiveTime::parse_from_str(s, "%H:%M:%S")
        .map_err(|e| Error::Config(format!("bad clock time {s:?}: {e}")))?;
    Ok(t.num_seconds_from_midnight())
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from the default locations, falling back to built-in defaults.
    pub fn load_default() -> Self {
        let candidates = [
            "config.toml",
            concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml"),
        ];

        for path in &candidates {
            match Self::load(Path::new(path)) {
                Ok(cfg) => {
                    tracing::info!("📋 Loaded config from {}", path);
                    return cfg;
                }
                Err(e) => tracing::debug!("config candidate {} skipped: {}", path, e),
            }
        }

        tracing::warn!("⚠️ No config.toml found, using defaults");
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        dotenv::dotenv().ok();
        if let Ok(secret) = std::env::var("ALEPH_SECRET") {
            if !secret.is_empty() {
                self.server.secret = secret;
            }
        }
    }

    /// Reject configs the session could not run with.
    pub fn validate(&self) -> Result<()> {
        let open = self.session.open_secs()?;
        let close = self.session.close_secs()?;
        if close <= open {
            return Err(Error::Config(format!(
                "session closes ({}) before it opens ({})",
                self.session.close, self.session.open
            )));
        }
        if self.session.tick_secs == 0 {
            return Err(Error::Config("tick_secs must be positive".into()));
        }
        if self.simulation.initial_balance < 0 {
            return Err(Error::Config("initial_balance must not be negative".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for inst in &self.instruments {
            if !seen.insert(inst.code.as_str()) {
                return Err(Error::Config(format!("duplicate instrument {}", inst.code)));
            }
            if inst.holdings < 0 {
                return Err(Error::Config(format!("negative holdings for {}", inst.code)));
            }
        }
        Ok(())
    }

    /// Get instrument config by code
    pub fn instrument(&self, code: &str) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|i| i.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let text = r#"
            [server]
            listen = "0.0.0.0:9000"
            secret = "s3cret"

            [session]
            open = "09:00:00"
            close = "15:20:00"
            tick_secs = 10
            max_ops_per_tick = 8

            [simulation]
            quote_file = "data/quote.txt"
            trade_file = "data/trade.txt"
            initial_balance = 5000000

            [[instruments]]
            code = "005930"
            kind = "equity"
            holdings = 10

            [[instruments]]
            code = "57JA01"
            kind = "warrant"
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.session.max_ops_per_tick, 8);
        assert_eq!(cfg.session.open_secs().unwrap(), 9 * 3600);
        assert_eq!(cfg.instruments.len(), 2);
        assert_eq!(cfg.instruments[1].kind, InstrumentKind::Warrant);
        assert_eq!(cfg.instrument("005930").unwrap().holdings, 10);
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.session.tick_secs, 10);
        assert_eq!(cfg.server.listen, "127.0.0.1:7000");
        assert_eq!(cfg.simulation.initial_balance, 10_000_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_session() {
        let mut cfg = Config::default();
        cfg.session.close = "08:00:00".into();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
