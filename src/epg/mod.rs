//! Program guide suppliers

pub mod schedules_direct;
pub mod xmltv;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::EpgConfig;
use crate::error::Result;
use crate::models::{ProgramInfo, StationInfo};

pub use schedules_direct::SchedulesDirectClient;
pub use xmltv::XmltvSupplier;

#[async_trait]
pub trait EpgSupplier: Send + Sync {
    fn name(&self) -> &str;

    /// Station metadata keyed by normalized channel number
    async fn get_stations(&self) -> Result<HashMap<String, StationInfo>>;

    /// Airings on a channel overlapping `[start, end)`. Returned programs carry
    /// `channel_id` as passed in.
    async fn get_programs(
        &self,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProgramInfo>>;
}

/// Channel number with leading zeros stripped, so "005" and "5" share a key
pub fn normalize_channel_number(number: &str) -> String {
    let stripped = number.trim().trim_start_matches('0');
    if stripped.is_empty() || stripped.starts_with('.') {
        format!("0{}", stripped)
    } else {
        stripped.to_string()
    }
}

/// Whether an airing overlaps the requested window
pub(crate) fn overlaps(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> bool {
    start < window_end && end > window_start
}

/// Series identity shared by every episode of a show, derived from a
/// Gracenote-style program id (`EP01234567.0002` -> `SH01234567`)
pub(crate) fn series_id(program_id: &str) -> Option<String> {
    let is_episodic = program_id.starts_with("EP") || program_id.starts_with("SH");
    match program_id.get(2..10) {
        Some(core) if is_episodic => Some(format!("SH{}", core)),
        _ => None,
    }
}

/// Instantiate the supplier described by the configuration
pub fn build_epg_supplier(config: &EpgConfig, client: reqwest::Client) -> Arc<dyn EpgSupplier> {
    match config {
        EpgConfig::SchedulesDirect {
            username,
            password,
            lineup_id,
            base_url,
        } => Arc::new(SchedulesDirectClient::new(
            base_url, username, password, lineup_id, client,
        )),
        EpgConfig::Xmltv { path } => Arc::new(XmltvSupplier::new(path, client)),
    }
}
