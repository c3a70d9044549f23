//! `livetv` daemon
//!
//! Usage: `livetv <CONFIG_PATH> [--debug] [--log-dir <LOG_DIR>]`

use std::path::{Path, PathBuf};

use clap::Parser;
use livetv::{init_logging, ConfigWatcher, GuideRefresher, LiveTvConfig, LiveTvService};
use tracing::{error, info};

/// livetv - Live TV tuner, program guide and recording daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON)
    config_path: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Directory for daily rotated log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(args.log_dir.as_deref(), args.debug);

    let config = LiveTvConfig::load(&args.config_path)?;
    let watcher = ConfigWatcher::new(config.clone());

    let service = LiveTvService::start_http(config).await?;
    let config_task = service.watch_config(watcher.subscribe());

    let mut refresher = GuideRefresher::from_config(service.clone());
    refresher.start().await?;

    wait_for_shutdown(&args.config_path, &watcher).await;

    info!("Shutting down");
    refresher.stop().await;
    service.stop().await;
    let _ = config_task.await;
    Ok(())
}

fn reload(path: &Path, watcher: &ConfigWatcher) {
    match LiveTvConfig::load(path).and_then(|config| watcher.update(config)) {
        Ok(true) => info!("Configuration reloaded from {:?}", path),
        Ok(false) => info!("Configuration unchanged"),
        Err(e) => error!("Keeping current configuration: {}", e),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(config_path: &Path, watcher: &ConfigWatcher) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!("Cannot listen for SIGHUP: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = hangup.recv() => reload(config_path, watcher),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_config_path: &Path, _watcher: &ConfigWatcher) {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from([
            "livetv",
            "/etc/livetv.json",
            "--debug",
            "--log-dir",
            "/var/log/livetv",
        ])
        .unwrap();
        assert_eq!(args.config_path, PathBuf::from("/etc/livetv.json"));
        assert!(args.debug);
        assert_eq!(args.log_dir, Some(PathBuf::from("/var/log/livetv")));

        let args = Args::try_parse_from(["livetv", "config.json"]).unwrap();
        assert!(!args.debug);
        assert!(args.log_dir.is_none());

        assert!(Args::try_parse_from(["livetv"]).is_err());
    }
}
