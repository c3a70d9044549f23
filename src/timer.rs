//! Timer arming and firing
//!
//! Each armed timer runs as its own task: it sleeps until the padded start,
//! then hands over to the recording callback. Cancellation races the sleep and
//! the recording through a shared token.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::TimerRejection;
use crate::models::{TimerInfo, TimerStatus};

/// Shortest padded recording that will be scheduled
pub const MIN_RECORDING_SECONDS: i64 = 300;

/// How far in the past a padded start may lie at creation
pub const START_TOLERANCE_SECONDS: i64 = 60;

/// Reject timers that cannot produce a useful recording
pub fn check_viability(timer: &TimerInfo, now: DateTime<Utc>) -> Result<(), TimerRejection> {
    let start = timer.actual_start();
    let end = timer.actual_end();

    if end <= start {
        return Err(TimerRejection::EndBeforeStart);
    }
    if end <= now {
        return Err(TimerRejection::AlreadyElapsed);
    }

    let seconds_late = (now - start).num_seconds();
    if seconds_late > START_TOLERANCE_SECONDS {
        return Err(TimerRejection::StartInPast { seconds_late });
    }

    let seconds = timer.duration().num_seconds();
    if seconds < MIN_RECORDING_SECONDS {
        return Err(TimerRejection::TooShort {
            seconds,
            minimum: MIN_RECORDING_SECONDS,
        });
    }
    Ok(())
}

/// Wait before firing and recording length, measured from `now`.
///
/// A start already in the past fires immediately and records only what is
/// left of the padded window.
pub fn fire_schedule(timer: &TimerInfo, now: DateTime<Utc>) -> (Duration, Duration) {
    let start = timer.actual_start();
    let wait = (start - now).to_std().unwrap_or(Duration::ZERO);
    let record_for = (timer.actual_end() - start.max(now))
        .to_std()
        .unwrap_or(Duration::ZERO);
    (wait, record_for)
}

/// Handle to an armed timer task
pub struct TimerHandle {
    cancel: CancellationToken,
    status: watch::Receiver<TimerStatus>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn status(&self) -> TimerStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TimerStatus> {
        self.status.clone()
    }

    /// Stop the countdown, or the recording if it already started
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to end and return the final status
    pub async fn join(self) -> TimerStatus {
        let status = self.status.clone();
        let _ = self.task.await;
        let final_status = *status.borrow();
        final_status
    }
}

/// Arm a timer. `on_fire` runs at most once, when the padded start is reached,
/// and receives the remaining recording length plus the cancellation token;
/// its output becomes the final status.
pub fn arm<F, Fut>(timer: TimerInfo, now: DateTime<Utc>, on_fire: F) -> TimerHandle
where
    F: FnOnce(TimerInfo, Duration, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = TimerStatus> + Send + 'static,
{
    let (wait, record_for) = fire_schedule(&timer, now);
    let cancel = CancellationToken::new();
    let (status_tx, status_rx) = watch::channel(TimerStatus::Scheduled);

    debug!(
        "Arming timer {} ({}): fires in {}s, records {}s",
        timer.id,
        timer.name,
        wait.as_secs(),
        record_for.as_secs()
    );

    let token = cancel.clone();
    let task = tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Timer {} cancelled before start", timer.id);
                status_tx.send_replace(TimerStatus::Cancelled);
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        info!("Timer {} fired: {}", timer.id, timer.name);
        status_tx.send_replace(TimerStatus::Recording);
        let outcome = on_fire(timer, record_for, token).await;
        status_tx.send_replace(outcome);
    });

    TimerHandle {
        cancel,
        status: status_rx,
        task,
    }
}
