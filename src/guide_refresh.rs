//! Periodic guide refresh
//!
//! Re-reads the guide look-ahead window on a fixed interval so series timers
//! pick up newly listed airings. Uses tokio-cron-scheduler for the repeated job.

use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::error::LiveTvError;
use crate::service::LiveTvService;

/// Runs the series-timer refresh on an interval
pub struct GuideRefresher {
    service: LiveTvService,
    interval: Duration,
    scheduler: Option<JobScheduler>,
    is_running: bool,
}

impl GuideRefresher {
    pub fn new(service: LiveTvService, interval: Duration) -> Self {
        Self {
            service,
            interval,
            scheduler: None,
            is_running: false,
        }
    }

    /// Refresher using the service's configured interval
    pub fn from_config(service: LiveTvService) -> Self {
        let hours = service.config().guide_refresh_interval_hours.max(1);
        Self::new(service, Duration::from_secs(hours * 60 * 60))
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// Refresh once now, then on every interval
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.is_running {
            warn!("Guide refresh already running");
            return Ok(());
        }

        info!(
            "Starting guide refresh (every {} minutes)",
            self.interval.as_secs() / 60
        );

        let sched = JobScheduler::new().await?;

        let service = self.service.clone();
        let job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                refresh(&service).await;
            })
        })?;
        sched.add(job).await?;

        let service = self.service.clone();
        tokio::spawn(async move {
            refresh(&service).await;
        });

        sched.start().await?;

        self.scheduler = Some(sched);
        self.is_running = true;
        Ok(())
    }

    pub async fn stop(&mut self) {
        if !self.is_running {
            return;
        }

        info!("Stopping guide refresh");
        if let Some(mut sched) = self.scheduler.take() {
            if let Err(e) = sched.shutdown().await {
                error!("Error shutting down guide refresh: {}", e);
            }
        }
        self.is_running = false;
    }
}

async fn refresh(service: &LiveTvService) {
    match service.refresh_series_timers().await {
        Ok(0) => debug!("Guide refresh found no new airings"),
        Ok(created) => info!("Guide refresh scheduled {} recordings", created),
        Err(LiveTvError::EpgNotConfigured) => debug!("Guide refresh skipped, no guide configured"),
        Err(e) => error!("Guide refresh failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProgramInfo, SeriesTimerInfo};
    use crate::test_utils::{test_config, FakeEpg, FakeFactory, FakeTunerHost};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_refreshes_series_timers() {
        let dir = TempDir::new().unwrap();
        let start = Utc::now() + ChronoDuration::hours(5);
        let epg = FakeEpg::default().with_program(ProgramInfo::new(
            "EP1",
            "5",
            "Evening News",
            start,
            start + ChronoDuration::minutes(30),
        ));
        let factory = FakeFactory::new(vec![FakeTunerHost::new("a", &[("5", "News")])], Some(epg));
        let service = LiveTvService::start(test_config(dir.path(), &["a"]), Arc::new(factory))
            .await
            .unwrap();
        service
            .create_series_timer(SeriesTimerInfo::new("r1", "Evening News"))
            .await
            .unwrap();

        let mut refresher = GuideRefresher::from_config(service.clone());
        refresher.start().await.unwrap();
        assert!(refresher.is_running());

        for _ in 0..100 {
            if !service.get_timers().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let timers = service.get_timers().await;
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].series_timer_id.as_deref(), Some("r1"));

        refresher.stop().await;
        assert!(!refresher.is_running());
        service.stop().await;
    }
}
