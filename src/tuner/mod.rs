//! Tuner hosts
//!
//! A tuner host is a device (or playlist) that can receive channels and hand
//! out live streams. Several hosts may be registered at once; the service
//! treats a host that fails to respond as absent rather than fatal.

pub mod hdhomerun;
pub mod m3u;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::TunerHostConfig;
use crate::error::Result;
use crate::models::{ChannelInfo, DeviceInfo, MediaSource, TunerStatus};

pub use hdhomerun::HdHomeRunHost;
pub use m3u::M3uHost;

#[async_trait]
pub trait TunerHost: Send + Sync {
    fn id(&self) -> &str;

    /// Result of the most recent device probe
    fn is_enabled(&self) -> bool;

    /// Probe the device. Never fails: an unreachable device is marked
    /// disabled and `None` is returned.
    async fn get_device_info(&self) -> Option<DeviceInfo>;

    /// Device info recorded by the last successful probe
    fn last_device_info(&self) -> Option<DeviceInfo> {
        None
    }

    /// Channels currently reported by the device; empty when it cannot be reached
    async fn get_channels(&self) -> Vec<ChannelInfo>;

    async fn get_tuner_statuses(&self) -> Result<Vec<TunerStatus>>;

    /// Stream for a channel. Fails with `NoTunerAvailable` when every
    /// physical tuner on this host is busy.
    async fn get_channel_stream_info(&self, channel_id: &str) -> Result<MediaSource>;
}

/// Probe outcome shared by the host implementations
#[derive(Default)]
pub(crate) struct HostState {
    enabled: AtomicBool,
    device: RwLock<Option<DeviceInfo>>,
}

impl HostState {
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_available(&self, info: DeviceInfo) {
        *self.device.write() = Some(info);
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_unavailable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub(crate) fn device(&self) -> Option<DeviceInfo> {
        self.device.read().clone()
    }
}

/// Keep only favorite channels when the host is configured that way
pub fn filter_favorites(channels: Vec<ChannelInfo>, favorites_only: bool) -> Vec<ChannelInfo> {
    if !favorites_only {
        return channels;
    }
    channels.into_iter().filter(|c| c.is_favorite).collect()
}

/// Prefix a bare hostname with a scheme and drop trailing slashes
pub(crate) fn normalize_base_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// Instantiate the host described by a configuration entry
pub fn build_tuner_host(config: &TunerHostConfig, client: reqwest::Client) -> Arc<dyn TunerHost> {
    match config {
        TunerHostConfig::HdHomeRun {
            id,
            url,
            favorites_only,
        } => Arc::new(HdHomeRunHost::new(id, url, *favorites_only, client)),
        TunerHostConfig::M3u {
            id,
            url,
            tuner_count,
            favorites_only,
        } => Arc::new(M3uHost::new(id, url, *tuner_count, *favorites_only, client)),
    }
}
