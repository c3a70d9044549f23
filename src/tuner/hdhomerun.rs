//! HDHomeRun network tuner
//!
//! Talks to the device's HTTP API: `discover.json` for identity,
//! `lineup.json` for channels and `status.json` for tuner occupancy.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{LiveTvError, Result};
use crate::models::{ChannelInfo, DeviceInfo, MediaSource, TunerState, TunerStatus};
use crate::tuner::{filter_favorites, normalize_base_url, HostState, TunerHost};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiscoverResponse {
    #[serde(rename = "DeviceID")]
    device_id: Option<String>,
    model_number: Option<String>,
    firmware_version: Option<String>,
    tuner_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LineupEntry {
    guide_number: String,
    guide_name: Option<String>,
    #[serde(rename = "URL")]
    url: Option<String>,
    #[serde(default)]
    favorite: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatusEntry {
    resource: String,
    vct_number: Option<String>,
    frequency: Option<u64>,
}

pub struct HdHomeRunHost {
    id: String,
    base_url: String,
    favorites_only: bool,
    client: reqwest::Client,
    state: HostState,
    /// Channel number to stream URL, from the last lineup fetch
    stream_urls: RwLock<HashMap<String, String>>,
}

impl HdHomeRunHost {
    pub fn new(id: &str, url: &str, favorites_only: bool, client: reqwest::Client) -> Self {
        Self {
            id: id.to_string(),
            base_url: normalize_base_url(url),
            favorites_only,
            client,
            state: HostState::default(),
            stream_urls: RwLock::new(HashMap::new()),
        }
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn fetch_lineup(&self) -> Result<Vec<ChannelInfo>> {
        let entries: Vec<LineupEntry> = self.fetch_json("lineup.json").await?;

        let mut urls = HashMap::with_capacity(entries.len());
        let channels = entries
            .into_iter()
            .map(|entry| {
                let mut channel = ChannelInfo::new(
                    &self.id,
                    &entry.guide_number,
                    entry.guide_name.as_deref().unwrap_or(&entry.guide_number),
                );
                channel.is_favorite = entry.favorite != 0;
                let url = entry.url.unwrap_or_else(|| {
                    format!("{}/auto/v{}", self.base_url, entry.guide_number)
                });
                urls.insert(entry.guide_number, url);
                channel
            })
            .collect();

        *self.stream_urls.write() = urls;
        Ok(channels)
    }

    async fn stream_url(&self, channel_id: &str) -> Result<String> {
        if let Some(url) = self.stream_urls.read().get(channel_id) {
            return Ok(url.clone());
        }
        self.fetch_lineup().await?;
        self.stream_urls
            .read()
            .get(channel_id)
            .cloned()
            .ok_or_else(|| LiveTvError::NotFound(format!("channel {} on {}", channel_id, self.id)))
    }
}

#[async_trait]
impl TunerHost for HdHomeRunHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    fn last_device_info(&self) -> Option<DeviceInfo> {
        self.state.device()
    }

    async fn get_device_info(&self) -> Option<DeviceInfo> {
        match self.fetch_json::<DiscoverResponse>("discover.json").await {
            Ok(discover) => {
                let info = DeviceInfo {
                    device_id: discover.device_id.unwrap_or_else(|| self.id.clone()),
                    model: discover.model_number.unwrap_or_default(),
                    firmware: discover.firmware_version.unwrap_or_default(),
                    tuner_count: discover.tuner_count.unwrap_or(0),
                };
                info!(
                    "HDHomeRun {} online: model {} firmware {} ({} tuners)",
                    self.id, info.model, info.firmware, info.tuner_count
                );
                self.state.mark_available(info.clone());
                Some(info)
            }
            Err(e) => {
                warn!("HDHomeRun {} unreachable at {}: {}", self.id, self.base_url, e);
                self.state.mark_unavailable();
                None
            }
        }
    }

    async fn get_channels(&self) -> Vec<ChannelInfo> {
        match self.fetch_lineup().await {
            Ok(channels) => {
                debug!("HDHomeRun {} reported {} channels", self.id, channels.len());
                filter_favorites(channels, self.favorites_only)
            }
            Err(e) => {
                warn!("Failed to fetch lineup from HDHomeRun {}: {}", self.id, e);
                Vec::new()
            }
        }
    }

    async fn get_tuner_statuses(&self) -> Result<Vec<TunerStatus>> {
        let entries: Vec<StatusEntry> = self.fetch_json("status.json").await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.resource.starts_with("tuner"))
            .map(|e| {
                let busy = e.vct_number.is_some() || e.frequency.is_some();
                TunerStatus {
                    host_id: self.id.clone(),
                    name: e.resource,
                    state: if busy {
                        TunerState::InUse
                    } else {
                        TunerState::Available
                    },
                    channel: e.vct_number,
                }
            })
            .collect())
    }

    async fn get_channel_stream_info(&self, channel_id: &str) -> Result<MediaSource> {
        let statuses = self.get_tuner_statuses().await?;
        if !statuses.is_empty() && statuses.iter().all(|s| s.state == TunerState::InUse) {
            debug!("All {} tuners on {} are busy", statuses.len(), self.id);
            return Err(LiveTvError::NoTunerAvailable(channel_id.to_string()));
        }

        let url = self.stream_url(channel_id).await?;
        Ok(MediaSource::http(&self.id, channel_id, &url))
    }
}
