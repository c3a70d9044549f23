//! Error types for Live TV operations

use std::fmt;

/// Why a timer could not be scheduled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerRejection {
    /// Padded end time is not after the padded start time
    EndBeforeStart,
    /// The recording window is already over
    AlreadyElapsed,
    /// The padded start lies further in the past than the scheduling tolerance allows
    StartInPast { seconds_late: i64 },
    /// Padded duration is below the minimum viable recording length
    TooShort { seconds: i64, minimum: i64 },
}

impl fmt::Display for TimerRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerRejection::EndBeforeStart => write!(f, "end time is before start time"),
            TimerRejection::AlreadyElapsed => write!(f, "program has already ended"),
            TimerRejection::StartInPast { seconds_late } => {
                write!(f, "start time is {}s in the past", seconds_late)
            }
            TimerRejection::TooShort { seconds, minimum } => write!(
                f,
                "recording would last {}s, minimum is {}s",
                seconds, minimum
            ),
        }
    }
}

/// Errors surfaced by the Live TV core
#[derive(Debug, thiserror::Error)]
pub enum LiveTvError {
    /// Missing or invalid configuration (host URL, credentials, lineup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// No registered tuner host could supply a stream
    #[error("No tuner available for channel {0}")]
    NoTunerAvailable(String),

    #[error("Timer rejected: {0}")]
    TimerRejected(TimerRejection),

    #[error("Timer {0} already exists")]
    DuplicateTimer(String),

    #[error("Invalid series timer: {0}")]
    InvalidSeriesTimer(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// No program guide supplier has been configured
    #[error("No program guide lineup configured")]
    EpgNotConfigured,

    #[error("Program guide error: {0}")]
    Epg(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<TimerRejection> for LiveTvError {
    fn from(reason: TimerRejection) -> Self {
        LiveTvError::TimerRejected(reason)
    }
}

pub type Result<T> = std::result::Result<T, LiveTvError>;
