//! Live TV core
//!
//! Coordinates network tuners, merges their lineups with program guide data
//! and records scheduled programs. Timers survive restarts through JSON
//! documents in the data directory.

pub mod config;
pub mod epg;
pub mod error;
pub mod guide_refresh;
pub mod models;
pub mod reconcile;
pub mod recorder;
pub mod series;
pub mod service;
pub mod store;
pub mod timer;
pub mod tuner;

#[cfg(test)]
pub(crate) mod test_utils;

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use config::{ConfigWatcher, EpgConfig, LiveTvConfig, TunerHostConfig};
pub use error::{LiveTvError, Result, TimerRejection};
pub use guide_refresh::GuideRefresher;
pub use models::*;
pub use service::{CollaboratorFactory, HttpCollaborators, LiveTvService};

/// Install the global subscriber: console output plus, when `log_dir` is
/// given, a daily-rotated log file. Keep the returned guard alive for as long
/// as file logging is wanted.
pub fn init_logging(log_dir: Option<&Path>, debug_logging: bool) -> Option<WorkerGuard> {
    let default_level = if debug_logging { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},reqwest=warn,hyper=warn", default_level)));

    let console = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "livetv.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();

    guard
}
