//! Service configuration
//!
//! Loaded from a JSON document. Tuner hosts and guide suppliers are typed
//! variants validated at load time. Changes reach the running service through
//! a [`ConfigWatcher`], which only notifies when the configuration actually
//! differs from the current one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{LiveTvError, Result};

const SCHEDULES_DIRECT_URL: &str = "https://json.schedulesdirect.org/20141201";

/// A configured tuner device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunerHostConfig {
    /// Network tuner speaking the HDHomeRun HTTP API
    HdHomeRun {
        id: String,
        url: String,
        #[serde(default)]
        favorites_only: bool,
    },
    /// IPTV playlist acting as a tuner with a fixed number of slots
    M3u {
        id: String,
        url: String,
        #[serde(default = "default_m3u_tuner_count")]
        tuner_count: usize,
        #[serde(default)]
        favorites_only: bool,
    },
}

fn default_m3u_tuner_count() -> usize {
    1
}

impl TunerHostConfig {
    pub fn id(&self) -> &str {
        match self {
            TunerHostConfig::HdHomeRun { id, .. } | TunerHostConfig::M3u { id, .. } => id,
        }
    }

    fn validate(&self) -> Result<()> {
        let (id, url) = match self {
            TunerHostConfig::HdHomeRun { id, url, .. } => (id, url),
            TunerHostConfig::M3u {
                id,
                url,
                tuner_count,
                ..
            } => {
                if *tuner_count == 0 {
                    return Err(LiveTvError::Config(format!(
                        "tuner host {} must have at least one tuner",
                        id
                    )));
                }
                (id, url)
            }
        };

        if id.trim().is_empty() {
            return Err(LiveTvError::Config("tuner host id is missing".to_string()));
        }
        if url.trim().is_empty() {
            return Err(LiveTvError::Config(format!(
                "tuner host {} has no hostname or url",
                id
            )));
        }
        Ok(())
    }
}

/// A configured program guide supplier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EpgConfig {
    SchedulesDirect {
        username: String,
        password: String,
        lineup_id: String,
        #[serde(default = "default_schedules_direct_url")]
        base_url: String,
    },
    /// XMLTV document from a URL or a local file, optionally gzipped
    Xmltv { path: String },
}

fn default_schedules_direct_url() -> String {
    SCHEDULES_DIRECT_URL.to_string()
}

impl EpgConfig {
    fn validate(&self) -> Result<()> {
        match self {
            EpgConfig::SchedulesDirect {
                username,
                password,
                lineup_id,
                ..
            } => {
                if username.trim().is_empty() || password.is_empty() {
                    return Err(LiveTvError::Config(
                        "program guide credentials are missing".to_string(),
                    ));
                }
                if lineup_id.trim().is_empty() {
                    return Err(LiveTvError::EpgNotConfigured);
                }
                Ok(())
            }
            EpgConfig::Xmltv { path } => {
                if path.trim().is_empty() {
                    return Err(LiveTvError::Config("XMLTV path is missing".to_string()));
                }
                Ok(())
            }
        }
    }
}

/// Settings for the Live TV service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveTvConfig {
    /// Directory holding the persisted timer documents
    pub data_path: PathBuf,
    /// Directory recordings are written to
    pub recording_path: PathBuf,
    pub tuner_hosts: Vec<TunerHostConfig>,
    pub epg: Option<EpgConfig>,
    pub default_pre_padding_sec: i64,
    pub default_post_padding_sec: i64,
    /// Upper bound for any single tuner or guide request
    pub network_timeout_sec: u64,
    pub guide_refresh_interval_hours: u64,
    pub guide_days: u32,
}

impl Default for LiveTvConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("livetv");
        let recordings = dirs::video_dir()
            .unwrap_or_else(|| base.clone())
            .join("LiveTV-Recordings");

        Self {
            data_path: base,
            recording_path: recordings,
            tuner_hosts: Vec::new(),
            epg: None,
            default_pre_padding_sec: 60,
            default_post_padding_sec: 300,
            network_timeout_sec: 30,
            guide_refresh_interval_hours: 4,
            guide_days: 3,
        }
    }
}

impl LiveTvConfig {
    /// Load and validate a configuration document
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {:?}", path))?;
        let config: LiveTvConfig = serde_json::from_str(&content)?;
        config.validate()?;
        info!(
            "Loaded configuration from {:?}: {} tuner host(s), guide {}",
            path,
            config.tuner_hosts.len(),
            if config.epg.is_some() { "configured" } else { "not configured" }
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (idx, host) in self.tuner_hosts.iter().enumerate() {
            host.validate()?;
            if self.tuner_hosts[..idx].iter().any(|h| h.id() == host.id()) {
                return Err(LiveTvError::Config(format!(
                    "duplicate tuner host id {}",
                    host.id()
                )));
            }
        }
        if let Some(epg) = &self.epg {
            epg.validate()?;
        }
        if self.default_pre_padding_sec < 0 || self.default_post_padding_sec < 0 {
            return Err(LiveTvError::Config("padding must not be negative".to_string()));
        }
        Ok(())
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_sec.max(1))
    }

    pub fn timers_path(&self) -> PathBuf {
        self.data_path.join("timers.json")
    }

    pub fn series_timers_path(&self) -> PathBuf {
        self.data_path.join("series_timers.json")
    }
}

/// Publishes configuration changes to subscribers
pub struct ConfigWatcher {
    tx: watch::Sender<LiveTvConfig>,
}

impl ConfigWatcher {
    pub fn new(config: LiveTvConfig) -> Self {
        let (tx, _) = watch::channel(config);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveTvConfig> {
        self.tx.subscribe()
    }

    /// Replace the configuration. Returns whether subscribers were notified.
    pub fn update(&self, config: LiveTvConfig) -> Result<bool> {
        config.validate()?;
        Ok(self.tx.send_if_modified(|current| {
            if *current == config {
                false
            } else {
                *current = config;
                true
            }
        }))
    }
}
