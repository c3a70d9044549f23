//! Data models for Live TV operations

use chrono::{DateTime, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Scheduled,
    Recording,
    Completed,
    Failed,
    Cancelled,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::Scheduled => "scheduled",
            TimerStatus::Recording => "recording",
            TimerStatus::Completed => "completed",
            TimerStatus::Failed => "failed",
            TimerStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TimerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TimerStatus::Scheduled),
            "recording" => Ok(TimerStatus::Recording),
            "completed" => Ok(TimerStatus::Completed),
            "failed" => Ok(TimerStatus::Failed),
            "cancelled" => Ok(TimerStatus::Cancelled),
            _ => Err(format!("Unknown timer status: {}", s)),
        }
    }
}

/// Busy state of one physical tuner slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunerState {
    Available,
    InUse,
}

/// Status of one physical tuner as reported by its device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunerStatus {
    pub host_id: String,
    pub name: String,
    pub state: TunerState,
    /// Channel currently tuned, if the device reports one
    pub channel: Option<String>,
}

/// Identity reported by a tuner device probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub model: String,
    pub firmware: String,
    pub tuner_count: usize,
}

/// A channel as surfaced to the host platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Same as `number`, so the id resolves on every host carrying the channel
    pub id: String,
    pub number: String,
    pub name: String,
    pub image_url: Option<String>,
    /// Host that first reported this channel
    pub host_id: String,
    #[serde(default)]
    pub is_favorite: bool,
}

impl ChannelInfo {
    pub fn new(host_id: &str, number: &str, name: &str) -> Self {
        Self {
            id: number.to_string(),
            number: number.to_string(),
            name: name.to_string(),
            image_url: None,
            host_id: host_id.to_string(),
            is_favorite: false,
        }
    }
}

/// Station metadata from the program guide, keyed by channel number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationInfo {
    pub station_id: String,
    pub name: String,
    pub affiliate: Option<String>,
    pub image_url: Option<String>,
}

impl StationInfo {
    /// Name to show for the channel, affiliate preferred over the raw station name
    pub fn display_name(&self) -> &str {
        match self.affiliate.as_deref() {
            Some(affiliate) if !affiliate.trim().is_empty() => affiliate,
            _ => &self.name,
        }
    }
}

/// One airing reported by the program guide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub id: String,
    pub channel_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub name: String,
    pub overview: Option<String>,
    pub episode_title: Option<String>,
    pub series_id: Option<String>,
    pub is_series: bool,
    pub is_movie: bool,
    pub is_sports: bool,
    pub is_news: bool,
    pub is_repeat: bool,
    pub is_hd: bool,
    pub official_rating: Option<String>,
    pub audio: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
}

impl ProgramInfo {
    pub fn new(
        id: &str,
        channel_id: &str,
        name: &str,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            channel_id: channel_id.to_string(),
            start_date,
            end_date,
            name: name.to_string(),
            overview: None,
            episode_title: None,
            series_id: None,
            is_series: false,
            is_movie: false,
            is_sports: false,
            is_news: false,
            is_repeat: false,
            is_hd: false,
            official_rating: None,
            audio: None,
            genres: Vec::new(),
        }
    }
}

/// Transport of a live stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamProtocol {
    Http,
    Hls,
}

/// A ready-to-play stream handed out by a tuner host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSource {
    pub host_id: String,
    pub channel_id: String,
    pub url: String,
    pub protocol: StreamProtocol,
}

impl MediaSource {
    pub fn http(host_id: &str, channel_id: &str, url: &str) -> Self {
        let protocol = if url.contains(".m3u8") {
            StreamProtocol::Hls
        } else {
            StreamProtocol::Http
        };
        Self {
            host_id: host_id.to_string(),
            channel_id: channel_id.to_string(),
            url: url.to_string(),
            protocol,
        }
    }
}

/// Derive the timer id for an airing. The same airing always yields the same id.
pub fn timer_id(program_id: &str, channel_id: &str, start: DateTime<Utc>) -> String {
    format!("{}_{}_{}", channel_id, program_id, start.timestamp_millis())
}

/// A pending or in-progress recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub id: String,
    #[serde(default)]
    pub series_timer_id: Option<String>,
    pub channel_id: String,
    pub program_id: String,
    pub name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub pre_padding_seconds: i64,
    pub post_padding_seconds: i64,
    pub status: TimerStatus,
}

impl TimerInfo {
    pub fn new(
        channel_id: &str,
        program_id: &str,
        name: &str,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: timer_id(program_id, channel_id, start_date),
            series_timer_id: None,
            channel_id: channel_id.to_string(),
            program_id: program_id.to_string(),
            name: name.to_string(),
            start_date,
            end_date,
            pre_padding_seconds: 0,
            post_padding_seconds: 0,
            status: TimerStatus::Scheduled,
        }
    }

    /// Timer for a guide airing
    pub fn for_program(program: &ProgramInfo) -> Self {
        Self::new(
            &program.channel_id,
            &program.id,
            &program.name,
            program.start_date,
            program.end_date,
        )
    }

    pub fn with_padding(mut self, pre_seconds: i64, post_seconds: i64) -> Self {
        self.pre_padding_seconds = pre_seconds;
        self.post_padding_seconds = post_seconds;
        self
    }

    /// Start time accounting for padding
    pub fn actual_start(&self) -> DateTime<Utc> {
        self.start_date - Duration::seconds(self.pre_padding_seconds)
    }

    /// End time accounting for padding
    pub fn actual_end(&self) -> DateTime<Utc> {
        self.end_date + Duration::seconds(self.post_padding_seconds)
    }

    /// Padded recording length
    pub fn duration(&self) -> Duration {
        self.actual_end() - self.actual_start()
    }
}

/// A recurring recording rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesTimerInfo {
    pub id: String,
    pub name: String,
    /// Guide series identity; when absent programs are matched by name
    #[serde(default)]
    pub series_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    pub record_any_channel: bool,
    /// Time-of-day reference used when `record_any_time` is off
    pub start_date: DateTime<Utc>,
    pub record_any_time: bool,
    /// Weekdays to record on; empty means every day
    #[serde(default)]
    pub days: Vec<Weekday>,
    pub record_new_only: bool,
    pub pre_padding_seconds: i64,
    pub post_padding_seconds: i64,
    /// Airings the user cancelled; expansion will not schedule them again
    #[serde(default)]
    pub skipped_timer_ids: Vec<String>,
}

impl SeriesTimerInfo {
    /// Rule recording every airing of `name` on any channel at any time
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            series_id: None,
            channel_id: None,
            record_any_channel: true,
            start_date: Utc::now(),
            record_any_time: true,
            days: Vec::new(),
            record_new_only: false,
            pre_padding_seconds: 0,
            post_padding_seconds: 0,
            skipped_timer_ids: Vec::new(),
        }
    }
}

/// Event published when a recording starts or finishes
#[derive(Debug, Clone, Serialize)]
pub struct RecordingEvent {
    pub event_type: String, // "started", "completed", "failed", "cancelled"
    pub timer_id: String,
    pub channel_id: String,
    pub program_name: String,
    pub path: Option<String>,
    pub message: Option<String>,
}

impl RecordingEvent {
    fn new(event_type: &str, timer: &TimerInfo) -> Self {
        Self {
            event_type: event_type.to_string(),
            timer_id: timer.id.clone(),
            channel_id: timer.channel_id.clone(),
            program_name: timer.name.clone(),
            path: None,
            message: None,
        }
    }

    pub fn started(timer: &TimerInfo, path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            ..Self::new("started", timer)
        }
    }

    pub fn completed(timer: &TimerInfo) -> Self {
        Self::new("completed", timer)
    }

    pub fn cancelled(timer: &TimerInfo) -> Self {
        Self::new("cancelled", timer)
    }

    pub fn failed(timer: &TimerInfo, error: String) -> Self {
        Self {
            message: Some(error),
            ..Self::new("failed", timer)
        }
    }
}
