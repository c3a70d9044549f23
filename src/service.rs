//! Live TV service
//!
//! Ties the tuner hosts, the guide supplier and the timer stores together.
//! Every armed timer runs in its own task; the service keeps the table of
//! timer handles and rewrites the stores whenever that table changes.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LiveTvConfig;
use crate::epg::{build_epg_supplier, EpgSupplier};
use crate::error::{LiveTvError, Result};
use crate::models::{
    timer_id, ChannelInfo, MediaSource, ProgramInfo, RecordingEvent, SeriesTimerInfo, TimerInfo,
    TimerStatus, TunerStatus,
};
use crate::reconcile::merge_channels;
use crate::recorder::{recording_path, HttpRecorder, Recorder, RecordingOutcome};
use crate::series;
use crate::store::JsonStore;
use crate::timer::{self, check_viability, TimerHandle};
use crate::tuner::{build_tuner_host, TunerHost};

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Builds the service's collaborators from configuration
pub trait CollaboratorFactory: Send + Sync {
    fn tuner_hosts(&self, config: &LiveTvConfig) -> Result<Vec<Arc<dyn TunerHost>>>;
    fn epg_supplier(&self, config: &LiveTvConfig) -> Result<Option<Arc<dyn EpgSupplier>>>;
    fn recorder(&self, config: &LiveTvConfig) -> Result<Arc<dyn Recorder>>;
}

/// Real HTTP-backed tuner hosts, guide suppliers and recorder
pub struct HttpCollaborators;

impl HttpCollaborators {
    fn api_client(config: &LiveTvConfig) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(config.network_timeout())
            .user_agent(concat!("livetv/", env!("CARGO_PKG_VERSION")))
            .build()?)
    }
}

impl CollaboratorFactory for HttpCollaborators {
    fn tuner_hosts(&self, config: &LiveTvConfig) -> Result<Vec<Arc<dyn TunerHost>>> {
        let client = Self::api_client(config)?;
        Ok(config
            .tuner_hosts
            .iter()
            .map(|host| build_tuner_host(host, client.clone()))
            .collect())
    }

    fn epg_supplier(&self, config: &LiveTvConfig) -> Result<Option<Arc<dyn EpgSupplier>>> {
        match &config.epg {
            Some(epg) => Ok(Some(build_epg_supplier(epg, Self::api_client(config)?))),
            None => Ok(None),
        }
    }

    fn recorder(&self, config: &LiveTvConfig) -> Result<Arc<dyn Recorder>> {
        // Only connection setup is bounded; the body streams for the whole recording
        let client = reqwest::Client::builder()
            .connect_timeout(config.network_timeout())
            .user_agent(concat!("livetv/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Arc::new(HttpRecorder::new(client)))
    }
}

/// Collaborators for one configuration generation
struct Collaborators {
    hosts: Vec<Arc<dyn TunerHost>>,
    epg: Option<Arc<dyn EpgSupplier>>,
    recorder: Arc<dyn Recorder>,
    recording_path: PathBuf,
    network_timeout: Duration,
}

impl Collaborators {
    fn build(factory: &dyn CollaboratorFactory, config: &LiveTvConfig) -> Result<Self> {
        Ok(Self {
            hosts: factory.tuner_hosts(config)?,
            epg: factory.epg_supplier(config)?,
            recorder: factory.recorder(config)?,
            recording_path: config.recording_path.clone(),
            network_timeout: config.network_timeout(),
        })
    }

    fn epg(&self) -> Result<Arc<dyn EpgSupplier>> {
        self.epg.clone().ok_or(LiveTvError::EpgNotConfigured)
    }
}

struct ArmedTimer {
    generation: u64,
    handle: TimerHandle,
}

#[derive(Default)]
struct TimerTable {
    timers: Vec<TimerInfo>,
    armed: HashMap<String, ArmedTimer>,
    next_generation: u64,
}

impl TimerTable {
    fn contains(&self, id: &str) -> bool {
        self.timers.iter().any(|t| t.id == id)
    }

    fn ids(&self) -> HashSet<String> {
        self.timers.iter().map(|t| t.id.clone()).collect()
    }

    fn remove(&mut self, id: &str) -> Option<(TimerInfo, Option<ArmedTimer>)> {
        let idx = self.timers.iter().position(|t| t.id == id)?;
        let timer = self.timers.remove(idx);
        Some((timer, self.armed.remove(id)))
    }
}

/// Sent by a timer task when its recording ends
struct TimerFinished {
    timer_id: String,
    generation: u64,
    status: TimerStatus,
}

struct Inner {
    config: RwLock<LiveTvConfig>,
    factory: Arc<dyn CollaboratorFactory>,
    collaborators: RwLock<Arc<Collaborators>>,
    timers: Mutex<TimerTable>,
    series_timers: Mutex<Vec<SeriesTimerInfo>>,
    timer_store: JsonStore<TimerInfo>,
    series_store: JsonStore<SeriesTimerInfo>,
    events: broadcast::Sender<RecordingEvent>,
    finished_tx: mpsc::UnboundedSender<TimerFinished>,
    series_counter: AtomicU64,
    shutdown: CancellationToken,
}

/// Entry point for channel, guide and timer operations
#[derive(Clone)]
pub struct LiveTvService {
    inner: Arc<Inner>,
}

impl LiveTvService {
    /// Build the service, restore persisted timers and re-arm the ones whose
    /// padded end is still ahead.
    pub async fn start(config: LiveTvConfig, factory: Arc<dyn CollaboratorFactory>) -> Result<Self> {
        config.validate()?;
        let collaborators = Collaborators::build(factory.as_ref(), &config)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            timer_store: JsonStore::new(config.timers_path()),
            series_store: JsonStore::new(config.series_timers_path()),
            config: RwLock::new(config),
            factory,
            collaborators: RwLock::new(Arc::new(collaborators)),
            timers: Mutex::new(TimerTable::default()),
            series_timers: Mutex::new(Vec::new()),
            events,
            finished_tx,
            series_counter: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(process_finished_timers(
            Arc::downgrade(&inner),
            finished_rx,
            inner.shutdown.clone(),
        ));

        let service = Self { inner };
        service.restore().await;
        info!("Live TV service started");
        Ok(service)
    }

    /// Start with the real HTTP collaborators
    pub async fn start_http(config: LiveTvConfig) -> Result<Self> {
        Self::start(config, Arc::new(HttpCollaborators)).await
    }

    async fn restore(&self) {
        let now = Utc::now();
        let stored = self.inner.timer_store.load().await;
        let stored_count = stored.len();

        {
            let mut table = self.inner.timers.lock().await;
            for mut timer in stored {
                if timer.actual_end() <= now {
                    info!("Dropping expired timer {} ({})", timer.id, timer.name);
                    continue;
                }
                if table.contains(&timer.id) {
                    continue;
                }
                timer.status = TimerStatus::Scheduled;
                self.inner.arm(&mut table, timer);
            }
            info!("Restored {} of {} timers", table.timers.len(), stored_count);
            if table.timers.len() != stored_count {
                self.inner.persist_timers(&table).await;
            }
        }

        let rules = self.inner.series_store.load().await;
        info!("Restored {} series timers", rules.len());
        *self.inner.series_timers.lock().await = rules;
    }

    fn collaborators(&self) -> Arc<Collaborators> {
        self.inner.collaborators.read().clone()
    }

    pub fn config(&self) -> LiveTvConfig {
        self.inner.config.read().clone()
    }

    /// Recording lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.inner.events.subscribe()
    }

    /// Channels from every reachable tuner host, merged with guide station data
    pub async fn get_channels(&self) -> Result<Vec<ChannelInfo>> {
        let collab = self.collaborators();
        let timeout = collab.network_timeout;

        let lineups = join_all(collab.hosts.iter().map(|host| async move {
            let probe = async {
                if host.get_device_info().await.is_none() {
                    return Vec::new();
                }
                host.get_channels().await
            };
            match tokio::time::timeout(timeout, probe).await {
                Ok(channels) => channels,
                Err(_) => {
                    warn!("Tuner host {} timed out", host.id());
                    Vec::new()
                }
            }
        }))
        .await;

        let stations = match &collab.epg {
            Some(epg) => match with_timeout(timeout, epg.get_stations()).await {
                Ok(stations) => stations,
                Err(e) => {
                    warn!("Guide station lookup via {} failed: {}", epg.name(), e);
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        let channels = merge_channels(&lineups, &stations);
        debug!(
            "Merged {} channels from {} hosts",
            channels.len(),
            collab.hosts.len()
        );
        Ok(channels)
    }

    /// Guide listings for a channel. Series timers are expanded against the
    /// returned programs.
    pub async fn get_programs(
        &self,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProgramInfo>> {
        let collab = self.collaborators();
        let epg = collab.epg()?;
        let programs =
            with_timeout(collab.network_timeout, epg.get_programs(channel_id, start, end)).await?;

        self.expand_series_timers(&programs).await;
        Ok(programs)
    }

    async fn expand_series_timers(&self, programs: &[ProgramInfo]) -> usize {
        let rules = self.inner.series_timers.lock().await.clone();
        if rules.is_empty() || programs.is_empty() {
            return 0;
        }

        let mut table = self.inner.timers.lock().await;
        let created = series::expand(&rules, programs, &table.ids(), Utc::now());
        if created.is_empty() {
            return 0;
        }

        let count = created.len();
        for timer in created {
            info!(
                "Series timer {} scheduled {} at {}",
                timer.series_timer_id.as_deref().unwrap_or_default(),
                timer.name,
                timer.start_date
            );
            self.inner.arm(&mut table, timer);
        }
        self.inner.persist_timers(&table).await;
        count
    }

    /// Fetch the look-ahead window for every channel a series timer can
    /// record from. Returns the number of timers created.
    pub async fn refresh_series_timers(&self) -> Result<usize> {
        let rules = self.get_series_timers().await;
        if rules.is_empty() {
            return Ok(0);
        }
        self.collaborators().epg()?;

        let channel_ids: Vec<String> = if rules.iter().any(|r| r.record_any_channel) {
            self.get_channels()
                .await?
                .into_iter()
                .map(|c| c.id)
                .collect()
        } else {
            let mut ids: Vec<String> = rules.iter().filter_map(|r| r.channel_id.clone()).collect();
            ids.sort();
            ids.dedup();
            ids
        };

        let days = i64::from(self.config().guide_days.max(1));
        let start = Utc::now();
        let end = start + chrono::Duration::days(days);
        let before = self.inner.timers.lock().await.timers.len();

        for channel_id in &channel_ids {
            if let Err(e) = self.get_programs(channel_id, start, end).await {
                warn!("Guide refresh for channel {} failed: {}", channel_id, e);
            }
        }

        let after = self.inner.timers.lock().await.timers.len();
        let created = after.saturating_sub(before);
        info!(
            "Guide refresh covered {} channels, {} new timers",
            channel_ids.len(),
            created
        );
        Ok(created)
    }

    /// Timer for a program using the configured default padding
    pub fn new_timer_defaults(&self, program: &ProgramInfo) -> TimerInfo {
        let config = self.inner.config.read();
        TimerInfo::for_program(program)
            .with_padding(config.default_pre_padding_sec, config.default_post_padding_sec)
    }

    /// Validate, persist and arm a timer
    pub async fn create_timer(&self, mut info: TimerInfo) -> Result<TimerInfo> {
        info.id = timer_id(&info.program_id, &info.channel_id, info.start_date);
        info.status = TimerStatus::Scheduled;
        check_viability(&info, Utc::now())?;

        let mut table = self.inner.timers.lock().await;
        if table.contains(&info.id) {
            return Err(LiveTvError::DuplicateTimer(info.id));
        }

        info!(
            "Creating timer {} for {} on channel {} at {}",
            info.id, info.name, info.channel_id, info.start_date
        );
        self.inner.arm(&mut table, info.clone());
        self.inner.persist_timers(&table).await;
        Ok(info)
    }

    /// Validate and persist a recurring rule
    pub async fn create_series_timer(&self, mut info: SeriesTimerInfo) -> Result<SeriesTimerInfo> {
        if info.name.trim().is_empty() && info.series_id.is_none() {
            return Err(LiveTvError::InvalidSeriesTimer(
                "a name or series id is required".to_string(),
            ));
        }
        if !info.record_any_channel && info.channel_id.is_none() {
            return Err(LiveTvError::InvalidSeriesTimer(
                "a channel is required unless recording on any channel".to_string(),
            ));
        }
        if info.pre_padding_seconds < 0 || info.post_padding_seconds < 0 {
            return Err(LiveTvError::InvalidSeriesTimer(
                "padding must not be negative".to_string(),
            ));
        }
        if info.id.trim().is_empty() {
            let seq = self.inner.series_counter.fetch_add(1, Ordering::SeqCst);
            info.id = format!("series_{}_{}", Utc::now().timestamp_millis(), seq);
        }

        let mut rules = self.inner.series_timers.lock().await;
        if rules.iter().any(|r| r.id == info.id) {
            return Err(LiveTvError::DuplicateTimer(info.id));
        }

        info!("Creating series timer {} for {}", info.id, info.name);
        rules.push(info.clone());
        self.inner.persist_series(&rules).await;
        Ok(info)
    }

    /// Remove a timer and stop its countdown or recording. A timer scheduled
    /// by a series rule is remembered as skipped so the rule does not bring it
    /// back.
    pub async fn cancel_timer(&self, id: &str) -> Result<()> {
        let timer = {
            let mut table = self.inner.timers.lock().await;
            let (timer, armed) = table
                .remove(id)
                .ok_or_else(|| LiveTvError::NotFound(format!("timer {}", id)))?;

            if let Some(armed) = armed {
                armed.handle.cancel();
            }
            info!("Cancelled timer {} ({})", timer.id, timer.name);
            self.inner.persist_timers(&table).await;
            timer
        };

        if let Some(series_timer_id) = &timer.series_timer_id {
            let mut rules = self.inner.series_timers.lock().await;
            if let Some(rule) = rules.iter_mut().find(|r| &r.id == series_timer_id) {
                if !rule.skipped_timer_ids.contains(&timer.id) {
                    rule.skipped_timer_ids.push(timer.id.clone());
                    debug!("Series timer {} will skip {}", rule.id, timer.id);
                    self.inner.persist_series(&rules).await;
                }
            }
        }
        Ok(())
    }

    /// Remove a series rule along with the timers it scheduled that have not
    /// started recording yet
    pub async fn cancel_series_timer(&self, id: &str) -> Result<()> {
        {
            let mut rules = self.inner.series_timers.lock().await;
            let idx = rules
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| LiveTvError::NotFound(format!("series timer {}", id)))?;
            rules.remove(idx);
            self.inner.persist_series(&rules).await;
        }

        let mut table = self.inner.timers.lock().await;
        let pending: Vec<String> = table
            .timers
            .iter()
            .filter(|t| t.series_timer_id.as_deref() == Some(id))
            .filter(|t| {
                table
                    .armed
                    .get(&t.id)
                    .map(|a| a.handle.status() == TimerStatus::Scheduled)
                    .unwrap_or(true)
            })
            .map(|t| t.id.clone())
            .collect();

        for timer_id in &pending {
            if let Some((_, Some(armed))) = table.remove(timer_id) {
                armed.handle.cancel();
            }
        }
        info!(
            "Cancelled series timer {} and {} pending timers",
            id,
            pending.len()
        );
        if !pending.is_empty() {
            self.inner.persist_timers(&table).await;
        }
        Ok(())
    }

    /// Stream for a channel from the first host that can supply one
    pub async fn get_channel_stream(&self, channel_id: &str) -> Result<MediaSource> {
        open_stream(&self.collaborators(), channel_id).await
    }

    pub async fn get_tuner_statuses(&self) -> Vec<TunerStatus> {
        let collab = self.collaborators();
        let timeout = collab.network_timeout;

        join_all(collab.hosts.iter().map(|host| async move {
            match with_timeout(timeout, host.get_tuner_statuses()).await {
                Ok(statuses) => statuses,
                Err(e) => {
                    warn!("Tuner status for {} unavailable: {}", host.id(), e);
                    Vec::new()
                }
            }
        }))
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    /// Active timers with their live status
    pub async fn get_timers(&self) -> Vec<TimerInfo> {
        let table = self.inner.timers.lock().await;
        table
            .timers
            .iter()
            .map(|t| {
                let mut timer = t.clone();
                if let Some(armed) = table.armed.get(&t.id) {
                    timer.status = armed.handle.status();
                }
                timer
            })
            .collect()
    }

    pub async fn get_series_timers(&self) -> Vec<SeriesTimerInfo> {
        self.inner.series_timers.lock().await.clone()
    }

    /// Swap in a new configuration. Tuner hosts and the guide supplier are
    /// rebuilt; armed timers keep running.
    pub fn apply_config(&self, config: LiveTvConfig) -> Result<()> {
        config.validate()?;
        let collaborators = Collaborators::build(self.inner.factory.as_ref(), &config)?;

        let data_path_changed = self.inner.config.read().data_path != config.data_path;
        if data_path_changed {
            warn!("data_path changes take effect after a restart");
        }

        *self.inner.collaborators.write() = Arc::new(collaborators);
        info!(
            "Configuration applied: {} tuner host(s), guide {}",
            config.tuner_hosts.len(),
            if config.epg.is_some() { "configured" } else { "not configured" }
        );
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Apply every configuration published on `rx` until the service stops
    pub fn watch_config(&self, mut rx: watch::Receiver<LiveTvConfig>) -> JoinHandle<()> {
        let service = self.clone();
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            debug!("Configuration publisher dropped");
                            break;
                        }
                        let config = rx.borrow_and_update().clone();
                        if let Err(e) = service.apply_config(config) {
                            error!("Rejected configuration update: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Stop every timer task. Persisted timers are kept for the next start.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let handles: Vec<TimerHandle> = {
            let mut table = self.inner.timers.lock().await;
            table.armed.drain().map(|(_, armed)| armed.handle).collect()
        };
        for handle in &handles {
            handle.cancel();
        }
        join_all(handles.into_iter().map(TimerHandle::join)).await;
        info!("Live TV service stopped");
    }
}

impl Inner {
    /// Arm a timer and add it to the table
    fn arm(self: &Arc<Self>, table: &mut TimerTable, timer: TimerInfo) {
        let generation = table.next_generation;
        table.next_generation += 1;

        let weak = Arc::downgrade(self);
        let handle = timer::arm(timer.clone(), Utc::now(), move |timer, record_for, token| {
            async move {
                let Some(inner) = weak.upgrade() else {
                    return TimerStatus::Cancelled;
                };
                let status = inner.record(&timer, record_for, token).await;
                let _ = inner.finished_tx.send(TimerFinished {
                    timer_id: timer.id.clone(),
                    generation,
                    status,
                });
                status
            }
        });

        table
            .armed
            .insert(timer.id.clone(), ArmedTimer { generation, handle });
        table.timers.push(timer);
    }

    async fn record(
        &self,
        timer: &TimerInfo,
        record_for: Duration,
        token: CancellationToken,
    ) -> TimerStatus {
        let collab = self.collaborators.read().clone();

        let source = match open_stream(&collab, &timer.channel_id).await {
            Ok(source) => source,
            Err(e) => {
                error!("Recording {} could not start: {}", timer.id, e);
                self.emit(RecordingEvent::failed(timer, e.to_string()));
                return TimerStatus::Failed;
            }
        };

        let path = recording_path(&collab.recording_path, timer);
        self.emit(RecordingEvent::started(timer, &path.to_string_lossy()));

        match collab.recorder.record(&source, &path, record_for, token).await {
            Ok(RecordingOutcome::Completed) => {
                info!("Recording {} completed: {:?}", timer.id, path);
                self.emit(RecordingEvent::completed(timer));
                TimerStatus::Completed
            }
            Ok(RecordingOutcome::Cancelled) => {
                info!("Recording {} cancelled, partial file kept", timer.id);
                self.emit(RecordingEvent::cancelled(timer));
                TimerStatus::Cancelled
            }
            Err(e) => {
                error!("Recording {} failed: {:#}", timer.id, e);
                self.emit(RecordingEvent::failed(timer, format!("{:#}", e)));
                TimerStatus::Failed
            }
        }
    }

    fn emit(&self, event: RecordingEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn persist_timers(&self, table: &TimerTable) {
        if let Err(e) = self.timer_store.save(&table.timers).await {
            error!("Failed to persist timers: {}", e);
        }
    }

    async fn persist_series(&self, rules: &[SeriesTimerInfo]) {
        if let Err(e) = self.series_store.save(rules).await {
            error!("Failed to persist series timers: {}", e);
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LiveTvError::Other(anyhow::anyhow!(
            "request timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Try hosts in configured order; the first stream wins
async fn open_stream(collab: &Collaborators, channel_id: &str) -> Result<MediaSource> {
    for host in &collab.hosts {
        match with_timeout(collab.network_timeout, host.get_channel_stream_info(channel_id)).await {
            Ok(source) => {
                debug!("Host {} supplies channel {}", host.id(), channel_id);
                return Ok(source);
            }
            Err(e) => debug!("Host {} cannot supply channel {}: {}", host.id(), channel_id, e),
        }
    }
    warn!("No tuner host could supply channel {}", channel_id);
    Err(LiveTvError::NoTunerAvailable(channel_id.to_string()))
}

/// Drop finished timers from the table and persist the change
async fn process_finished_timers(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<TimerFinished>,
    shutdown: CancellationToken,
) {
    loop {
        let finished = tokio::select! {
            _ = shutdown.cancelled() => break,
            finished = rx.recv() => match finished {
                Some(finished) => finished,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let mut table = inner.timers.lock().await;
        let current = table
            .armed
            .get(&finished.timer_id)
            .map(|a| a.generation == finished.generation)
            .unwrap_or(false);
        if !current {
            continue;
        }

        table.remove(&finished.timer_id);
        debug!(
            "Timer {} finished as {}",
            finished.timer_id,
            finished.status.as_str()
        );
        inner.persist_timers(&table).await;
    }
}
