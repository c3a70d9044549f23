//! M3U playlist tuner
//!
//! An IPTV playlist exposed as a tuner host. The playlist cannot report
//! tuner occupancy, so every configured slot is reported available and the
//! upstream server decides whether a stream can be opened.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{LiveTvError, Result};
use crate::models::{ChannelInfo, DeviceInfo, MediaSource, TunerState, TunerStatus};
use crate::tuner::{filter_favorites, HostState, TunerHost};

const FAVORITES_GROUP: &str = "favorites";

/// One playable playlist entry
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub channel: ChannelInfo,
    pub url: String,
}

pub struct M3uHost {
    id: String,
    url: String,
    tuner_count: usize,
    favorites_only: bool,
    client: reqwest::Client,
    state: HostState,
    stream_urls: RwLock<HashMap<String, String>>,
}

impl M3uHost {
    pub fn new(
        id: &str,
        url: &str,
        tuner_count: usize,
        favorites_only: bool,
        client: reqwest::Client,
    ) -> Self {
        Self {
            id: id.to_string(),
            url: url.trim().to_string(),
            tuner_count,
            favorites_only,
            client,
            state: HostState::default(),
            stream_urls: RwLock::new(HashMap::new()),
        }
    }

    async fn read_playlist(&self) -> Result<String> {
        if self.url.starts_with("http://") || self.url.starts_with("https://") {
            let response = self.client.get(&self.url).send().await?.error_for_status()?;
            Ok(response.text().await?)
        } else {
            Ok(tokio::fs::read_to_string(&self.url).await?)
        }
    }

    async fn load_entries(&self) -> Result<Vec<PlaylistEntry>> {
        let content = self.read_playlist().await?;
        let entries = parse_playlist(&self.id, &content);
        *self.stream_urls.write() = entries
            .iter()
            .map(|e| (e.channel.id.clone(), e.url.clone()))
            .collect();
        Ok(entries)
    }
}

#[async_trait]
impl TunerHost for M3uHost {
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
        match self.load_entries().await {
            Ok(entries) => {
                debug!("Playlist {} lists {} channels", self.id, entries.len());
                let info = DeviceInfo {
                    device_id: self.id.clone(),
                    model: "M3U".to_string(),
                    firmware: String::new(),
                    tuner_count: self.tuner_count,
                };
                self.state.mark_available(info.clone());
                Some(info)
            }
            Err(e) => {
                warn!("Playlist {} unavailable: {}", self.id, e);
                self.state.mark_unavailable();
                None
            }
        }
    }

    async fn get_channels(&self) -> Vec<ChannelInfo> {
        match self.load_entries().await {
            Ok(entries) => filter_favorites(
                entries.into_iter().map(|e| e.channel).collect(),
                self.favorites_only,
            ),
            Err(e) => {
                warn!("Failed to read playlist {}: {}", self.id, e);
                Vec::new()
            }
        }
    }

    async fn get_tuner_statuses(&self) -> Result<Vec<TunerStatus>> {
        Ok((0..self.tuner_count)
            .map(|idx| TunerStatus {
                host_id: self.id.clone(),
                name: format!("tuner{}", idx),
                state: TunerState::Available,
                channel: None,
            })
            .collect())
    }

    async fn get_channel_stream_info(&self, channel_id: &str) -> Result<MediaSource> {
        let cached = self.stream_urls.read().get(channel_id).cloned();
        let url = match cached {
            Some(url) => url,
            None => {
                self.load_entries().await?;
                self.stream_urls
                    .read()
                    .get(channel_id)
                    .cloned()
                    .ok_or_else(|| {
                        LiveTvError::NotFound(format!("channel {} on {}", channel_id, self.id))
                    })?
            }
        };
        Ok(MediaSource::http(&self.id, channel_id, &url))
    }
}

/// Parse an extended M3U playlist.
///
/// Channel numbers come from `tvg-chno`, falling back to the entry position.
pub fn parse_playlist(host_id: &str, content: &str) -> Vec<PlaylistEntry> {
    let mut entries = Vec::new();
    let mut pending: Option<ChannelInfo> = None;

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(info) = line.strip_prefix("#EXTINF:") {
            let position = entries.len() + 1;
            let attrs = parse_attributes(info);
            let name = info
                .rsplit_once(',')
                .map(|(_, name)| name.trim().to_string())
                .filter(|n| !n.is_empty())
                .or_else(|| attrs.get("tvg-name").cloned())
                .unwrap_or_else(|| format!("Channel {}", position));
            let number = attrs
                .get("tvg-chno")
                .cloned()
                .unwrap_or_else(|| position.to_string());

            let mut channel = ChannelInfo::new(host_id, &number, &name);
            channel.image_url = attrs.get("tvg-logo").cloned().filter(|l| !l.is_empty());
            channel.is_favorite = attrs
                .get("group-title")
                .map(|g| g.eq_ignore_ascii_case(FAVORITES_GROUP))
                .unwrap_or(false);
            pending = Some(channel);
        } else if line.starts_with('#') {
            continue;
        } else if let Some(channel) = pending.take() {
            entries.push(PlaylistEntry {
                channel,
                url: line.to_string(),
            });
        }
    }

    entries
}

/// Extract `key="value"` pairs from an `#EXTINF` line
fn parse_attributes(info: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = info;

    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq]
            .rsplit(|c: char| c.is_whitespace() || c == ',')
            .next()
            .unwrap_or("")
            .to_string();
        let value_start = eq + 2;
        let Some(len) = rest[value_start..].find('"') else {
            break;
        };
        if !key.is_empty() {
            attrs.insert(key, rest[value_start..value_start + len].to_string());
        }
        rest = &rest[value_start + len + 1..];
    }

    attrs
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYLIST: &str = r#"#EXTM3U
#EXTINF:-1 tvg-id="news.us" tvg-chno="5" tvg-logo="http://logos/5.png" group-title="Favorites",News Five
http://iptv.example/live/5.ts
#EXTINF:-1 tvg-id="sports.us" group-title="Sports",Sports Seven
#EXTVLCOPT:http-user-agent=VLC
http://iptv.example/live/7.ts
#EXTINF:-1,Dangling entry
"#;

    #[test]
    fn test_parse_playlist() {
        let entries = parse_playlist("iptv", PLAYLIST);
        assert_eq!(entries.len(), 2);

        let first = &entries[0];
        assert_eq!(first.channel.number, "5");
        assert_eq!(first.channel.name, "News Five");
        assert_eq!(first.channel.image_url.as_deref(), Some("http://logos/5.png"));
        assert!(first.channel.is_favorite);
        assert_eq!(first.url, "http://iptv.example/live/5.ts");

        let second = &entries[1];
        assert_eq!(second.channel.number, "2");
        assert_eq!(second.channel.name, "Sports Seven");
        assert!(!second.channel.is_favorite);
        assert_eq!(second.url, "http://iptv.example/live/7.ts");
    }

    #[tokio::test]
    async fn test_playlist_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("list.m3u");
        std::fs::write(&path, PLAYLIST).unwrap();

        let host = M3uHost::new(
            "iptv",
            path.to_str().unwrap(),
            2,
            true,
            reqwest::Client::new(),
        );

        let info = host.get_device_info().await.unwrap();
        assert_eq!(info.tuner_count, 2);
        assert!(host.is_enabled());

        let channels = host.get_channels().await;
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].id, "5");

        let source = host.get_channel_stream_info("2").await.unwrap();
        assert_eq!(source.url, "http://iptv.example/live/7.ts");
        assert_eq!(host.get_tuner_statuses().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_playlist_disables_host() {
        let host = M3uHost::new("iptv", "/nonexistent/list.m3u", 1, false, reqwest::Client::new());
        assert!(host.get_device_info().await.is_none());
        assert!(!host.is_enabled());
        assert!(host.get_channels().await.is_empty());
    }
}
