//! In-memory collaborators for service tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{LiveTvConfig, TunerHostConfig};
use crate::epg::{normalize_channel_number, overlaps, EpgSupplier};
use crate::error::{LiveTvError, Result};
use crate::models::{
    ChannelInfo, DeviceInfo, MediaSource, ProgramInfo, StationInfo, TunerState, TunerStatus,
};
use crate::recorder::{HttpRecorder, Recorder, RecordingOutcome};
use crate::service::CollaboratorFactory;
use crate::tuner::TunerHost;

pub struct FakeTunerHost {
    pub id: String,
    pub channels: Vec<ChannelInfo>,
    pub online: bool,
    pub busy: bool,
    /// Base URL streams are served from instead of a made-up device address
    pub stream_base: Option<String>,
    pub stream_requests: AtomicUsize,
}

impl FakeTunerHost {
    pub fn new(id: &str, channels: &[(&str, &str)]) -> Self {
        Self {
            id: id.to_string(),
            channels: channels
                .iter()
                .map(|(number, name)| ChannelInfo::new(id, number, name))
                .collect(),
            online: true,
            busy: false,
            stream_base: None,
            stream_requests: AtomicUsize::new(0),
        }
    }

    pub fn busy(mut self) -> Self {
        self.busy = true;
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    pub fn streaming_from(mut self, base_url: &str) -> Self {
        self.stream_base = Some(base_url.to_string());
        self
    }
}

#[async_trait]
impl TunerHost for FakeTunerHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_enabled(&self) -> bool {
        self.online
    }

    async fn get_device_info(&self) -> Option<DeviceInfo> {
        self.online.then(|| DeviceInfo {
            device_id: self.id.clone(),
            model: "fake".to_string(),
            firmware: "1".to_string(),
            tuner_count: 2,
        })
    }

    async fn get_channels(&self) -> Vec<ChannelInfo> {
        if self.online {
            self.channels.clone()
        } else {
            Vec::new()
        }
    }

    async fn get_tuner_statuses(&self) -> Result<Vec<TunerStatus>> {
        if !self.online {
            return Err(LiveTvError::Config(format!("{} is offline", self.id)));
        }
        let state = if self.busy {
            TunerState::InUse
        } else {
            TunerState::Available
        };
        Ok((0..2)
            .map(|idx| TunerStatus {
                host_id: self.id.clone(),
                name: format!("tuner{}", idx),
                state,
                channel: None,
            })
            .collect())
    }

    async fn get_channel_stream_info(&self, channel_id: &str) -> Result<MediaSource> {
        self.stream_requests.fetch_add(1, Ordering::SeqCst);
        if !self.online || self.busy {
            return Err(LiveTvError::NoTunerAvailable(channel_id.to_string()));
        }
        if !self.channels.iter().any(|c| c.id == channel_id) {
            return Err(LiveTvError::NotFound(channel_id.to_string()));
        }
        let base = self
            .stream_base
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.id));
        Ok(MediaSource::http(
            &self.id,
            channel_id,
            &format!("{}/auto/v{}", base, channel_id),
        ))
    }
}

#[derive(Default)]
pub struct FakeEpg {
    pub stations: HashMap<String, StationInfo>,
    pub programs: Vec<ProgramInfo>,
}

impl FakeEpg {
    pub fn with_station(mut self, number: &str, name: &str) -> Self {
        self.stations.insert(
            number.to_string(),
            StationInfo {
                station_id: format!("st-{}", number),
                name: name.to_string(),
                affiliate: None,
                image_url: None,
            },
        );
        self
    }

    pub fn with_program(mut self, program: ProgramInfo) -> Self {
        self.programs.push(program);
        self
    }
}

#[async_trait]
impl EpgSupplier for FakeEpg {
    fn name(&self) -> &str {
        "fake"
    }

    async fn get_stations(&self) -> Result<HashMap<String, StationInfo>> {
        Ok(self.stations.clone())
    }

    async fn get_programs(
        &self,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProgramInfo>> {
        let key = normalize_channel_number(channel_id);
        Ok(self
            .programs
            .iter()
            .filter(|p| normalize_channel_number(&p.channel_id) == key)
            .filter(|p| overlaps(p.start_date, p.end_date, start, end))
            .cloned()
            .collect())
    }
}

/// Pretends to record by waiting out the duration
#[derive(Default)]
pub struct FakeRecorder {
    pub recordings: Mutex<Vec<(MediaSource, PathBuf, Duration)>>,
}

#[async_trait]
impl Recorder for FakeRecorder {
    async fn record(
        &self,
        source: &MediaSource,
        output: &Path,
        duration: Duration,
        cancel: CancellationToken,
    ) -> anyhow::Result<RecordingOutcome> {
        self.recordings
            .lock()
            .push((source.clone(), output.to_path_buf(), duration));
        tokio::select! {
            _ = cancel.cancelled() => Ok(RecordingOutcome::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(RecordingOutcome::Completed),
        }
    }
}

/// Hands out fakes for the host ids present in the configuration
pub struct FakeFactory {
    pub hosts: Vec<Arc<FakeTunerHost>>,
    pub epg: Option<Arc<FakeEpg>>,
    pub recorder: Arc<FakeRecorder>,
    /// Record through real HTTP instead of the fake recorder
    pub http_recorder: bool,
}

impl FakeFactory {
    pub fn new(hosts: Vec<FakeTunerHost>, epg: Option<FakeEpg>) -> Self {
        Self {
            hosts: hosts.into_iter().map(Arc::new).collect(),
            epg: epg.map(Arc::new),
            recorder: Arc::new(FakeRecorder::default()),
            http_recorder: false,
        }
    }

    pub fn with_http_recorder(mut self) -> Self {
        self.http_recorder = true;
        self
    }
}

impl CollaboratorFactory for FakeFactory {
    fn tuner_hosts(&self, config: &LiveTvConfig) -> Result<Vec<Arc<dyn TunerHost>>> {
        Ok(config
            .tuner_hosts
            .iter()
            .filter_map(|c| self.hosts.iter().find(|h| h.id == c.id()))
            .map(|h| h.clone() as Arc<dyn TunerHost>)
            .collect())
    }

    fn epg_supplier(&self, _config: &LiveTvConfig) -> Result<Option<Arc<dyn EpgSupplier>>> {
        Ok(self.epg.clone().map(|e| e as Arc<dyn EpgSupplier>))
    }

    fn recorder(&self, _config: &LiveTvConfig) -> Result<Arc<dyn Recorder>> {
        if self.http_recorder {
            return Ok(Arc::new(HttpRecorder::new(reqwest::Client::new())));
        }
        Ok(self.recorder.clone() as Arc<dyn Recorder>)
    }
}

/// Configuration naming the given host ids, storing state under `dir`
pub fn test_config(dir: &Path, host_ids: &[&str]) -> LiveTvConfig {
    LiveTvConfig {
        data_path: dir.join("data"),
        recording_path: dir.join("recordings"),
        tuner_hosts: host_ids
            .iter()
            .map(|id| TunerHostConfig::M3u {
                id: id.to_string(),
                url: format!("http://{}/list.m3u", id),
                tuner_count: 2,
                favorites_only: false,
            })
            .collect(),
        ..Default::default()
    }
}
