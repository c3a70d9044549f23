//! Schedules Direct JSON guide client
//!
//! Authenticates for a token, maps the lineup's stations to channel numbers
//! and fetches schedules plus program metadata per station and date.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::epg::{normalize_channel_number, overlaps, series_id, EpgSupplier};
use crate::error::{LiveTvError, Result};
use crate::models::{ProgramInfo, StationInfo};

/// Tokens are valid for 24 hours; renew well before that
const TOKEN_LIFETIME: StdDuration = StdDuration::from_secs(20 * 60 * 60);

/// API code for an expired or revoked token
const TOKEN_EXPIRED_CODE: i32 = 4006;

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i32,
    message: Option<String>,
    token: Option<String>,
}

/// Status envelope the API returns in place of a payload on failure
#[derive(Debug, Deserialize)]
struct ApiStatus {
    code: i32,
    message: Option<String>,
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct LineupResponse {
    #[serde(default)]
    map: Vec<LineupMapEntry>,
    #[serde(default)]
    stations: Vec<LineupStation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineupMapEntry {
    #[serde(rename = "stationID")]
    station_id: String,
    channel: Option<String>,
    atsc_major: Option<u32>,
    atsc_minor: Option<u32>,
}

impl LineupMapEntry {
    fn channel_number(&self) -> Option<String> {
        match (&self.channel, self.atsc_major, self.atsc_minor) {
            (Some(channel), _, _) => Some(channel.clone()),
            (None, Some(major), Some(minor)) => Some(format!("{}.{}", major, minor)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LineupStation {
    #[serde(rename = "stationID")]
    station_id: String,
    name: Option<String>,
    callsign: Option<String>,
    affiliate: Option<String>,
    logo: Option<StationLogo>,
}

#[derive(Debug, Deserialize)]
struct StationLogo {
    #[serde(rename = "URL")]
    url: String,
}

#[derive(Debug, Serialize)]
struct ScheduleRequest {
    #[serde(rename = "stationID")]
    station_id: String,
    date: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    #[serde(default)]
    programs: Vec<Airing>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Airing {
    #[serde(rename = "programID")]
    program_id: String,
    air_date_time: DateTime<Utc>,
    duration: i64,
    #[serde(default)]
    new: bool,
    #[serde(default)]
    audio_properties: Vec<String>,
    #[serde(default)]
    video_properties: Vec<String>,
    #[serde(default)]
    ratings: Vec<Rating>,
}

#[derive(Debug, Deserialize)]
struct Rating {
    code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgramDetails {
    #[serde(rename = "programID")]
    program_id: String,
    #[serde(default)]
    titles: Vec<Title>,
    episode_title150: Option<String>,
    descriptions: Option<Descriptions>,
    #[serde(default)]
    genres: Vec<String>,
    entity_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Title {
    title120: String,
}

#[derive(Debug, Deserialize)]
struct Descriptions {
    description1000: Option<Vec<Description>>,
    description100: Option<Vec<Description>>,
}

#[derive(Debug, Deserialize)]
struct Description {
    description: String,
}

/// Lineup data resolved once per client
#[derive(Debug, Default)]
struct Lineup {
    stations: HashMap<String, StationInfo>,
}

pub struct SchedulesDirectClient {
    base_url: String,
    username: String,
    password: String,
    lineup_id: String,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
    lineup: RwLock<Option<Arc<Lineup>>>,
}

impl SchedulesDirectClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        lineup_id: &str,
        client: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            lineup_id: lineup_id.to_string(),
            client,
            token: Mutex::new(None),
            lineup: RwLock::new(None),
        }
    }

    /// Cached token, authenticating on first use and once it is due for renewal
    async fn token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
            debug!("Schedules Direct token is due for renewal");
        }

        if self.username.is_empty() || self.password.is_empty() {
            return Err(LiveTvError::Config(
                "program guide credentials are missing".to_string(),
            ));
        }

        debug!("Requesting Schedules Direct token for {}", self.username);
        let response: TokenResponse = self
            .client
            .post(format!("{}/token", self.base_url))
            .json(&TokenRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.token {
            Some(value) if response.code == 0 => {
                info!("Authenticated with Schedules Direct");
                *cached = Some(CachedToken {
                    value: value.clone(),
                    expires_at: Instant::now() + TOKEN_LIFETIME,
                });
                Ok(value)
            }
            _ => Err(LiveTvError::Epg(format!(
                "authentication failed (code {}): {}",
                response.code,
                response.message.unwrap_or_default()
            ))),
        }
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// Send a request carrying the token. A rejected token is dropped and the
    /// request retried once with a fresh one.
    async fn authorized<T, F>(&self, request: F) -> Result<T>
    where
        T: DeserializeOwned + Send,
        F: Fn(&str) -> RequestBuilder + Send + Sync,
    {
        let mut renewed = false;
        loop {
            let token = self.token().await?;
            let response = request(&token).send().await?;

            let status = response.status();
            if !renewed && (status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN) {
                warn!("Schedules Direct rejected the token ({}), renewing", status);
                self.invalidate_token().await;
                renewed = true;
                continue;
            }

            let body = response.error_for_status()?.bytes().await?;
            if let Ok(api) = serde_json::from_slice::<ApiStatus>(&body) {
                if api.code == TOKEN_EXPIRED_CODE && !renewed {
                    warn!("Schedules Direct token expired, renewing");
                    self.invalidate_token().await;
                    renewed = true;
                    continue;
                }
                if api.code != 0 {
                    return Err(LiveTvError::Epg(format!(
                        "request failed (code {}): {}",
                        api.code,
                        api.message.unwrap_or_default()
                    )));
                }
            }
            return Ok(serde_json::from_slice(&body)?);
        }
    }

    async fn lineup(&self) -> Result<Arc<Lineup>> {
        if let Some(lineup) = self.lineup.read().await.as_ref() {
            return Ok(lineup.clone());
        }
        if self.lineup_id.trim().is_empty() {
            return Err(LiveTvError::EpgNotConfigured);
        }

        let url = format!("{}/lineups/{}", self.base_url, self.lineup_id);
        let response: LineupResponse = self
            .authorized(|token| self.client.get(&url).header("token", token))
            .await?;

        let lineup = Arc::new(build_lineup(response));
        info!(
            "Loaded lineup {} with {} stations",
            self.lineup_id,
            lineup.stations.len()
        );
        *self.lineup.write().await = Some(lineup.clone());
        Ok(lineup)
    }

    async fn fetch_schedule(
        &self,
        station_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Airing>> {
        let request = vec![ScheduleRequest {
            station_id: station_id.to_string(),
            date: schedule_dates(start, end),
        }];

        let url = format!("{}/schedules", self.base_url);
        let schedules: Vec<ScheduleResponse> = self
            .authorized(|token| self.client.post(&url).header("token", token).json(&request))
            .await?;

        Ok(schedules.into_iter().flat_map(|s| s.programs).collect())
    }

    async fn fetch_details(
        &self,
        program_ids: Vec<String>,
    ) -> Result<HashMap<String, ProgramDetails>> {
        if program_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{}/programs", self.base_url);
        let details: Vec<ProgramDetails> = self
            .authorized(|token| self.client.post(&url).header("token", token).json(&program_ids))
            .await?;

        Ok(details
            .into_iter()
            .map(|d| (d.program_id.clone(), d))
            .collect())
    }
}

#[async_trait]
impl EpgSupplier for SchedulesDirectClient {
    fn name(&self) -> &str {
        "Schedules Direct"
    }

    async fn get_stations(&self) -> Result<HashMap<String, StationInfo>> {
        Ok(self.lineup().await?.stations.clone())
    }

    async fn get_programs(
        &self,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProgramInfo>> {
        let lineup = self.lineup().await?;
        let Some(station) = lineup.stations.get(&normalize_channel_number(channel_id)) else {
            warn!("Channel {} is not part of lineup {}", channel_id, self.lineup_id);
            return Ok(Vec::new());
        };

        let airings: Vec<Airing> = self
            .fetch_schedule(&station.station_id, start, end)
            .await?
            .into_iter()
            .filter(|a| {
                let air_end = a.air_date_time + Duration::seconds(a.duration);
                overlaps(a.air_date_time, air_end, start, end)
            })
            .collect();

        let unique: HashSet<String> = airings.iter().map(|a| a.program_id.clone()).collect();
        let details = self.fetch_details(unique.into_iter().collect()).await?;

        let mut programs: Vec<ProgramInfo> = airings
            .into_iter()
            .map(|airing| {
                let details = details.get(&airing.program_id);
                to_program_info(channel_id, airing, details)
            })
            .collect();
        programs.sort_by_key(|p| p.start_date);

        debug!(
            "Fetched {} programs for channel {} ({} - {})",
            programs.len(),
            channel_id,
            start,
            end
        );
        Ok(programs)
    }
}

fn build_lineup(response: LineupResponse) -> Lineup {
    let stations: HashMap<String, &LineupStation> = response
        .stations
        .iter()
        .map(|s| (s.station_id.clone(), s))
        .collect();

    let mut lineup = Lineup::default();
    for entry in &response.map {
        let Some(number) = entry.channel_number() else {
            continue;
        };
        let station = stations.get(&entry.station_id);
        let name = station
            .and_then(|s| s.name.clone().or_else(|| s.callsign.clone()))
            .unwrap_or_else(|| entry.station_id.clone());

        lineup
            .stations
            .entry(normalize_channel_number(&number))
            .or_insert(StationInfo {
                station_id: entry.station_id.clone(),
                name,
                affiliate: station.and_then(|s| s.affiliate.clone()),
                image_url: station.and_then(|s| s.logo.as_ref().map(|l| l.url.clone())),
            });
    }
    lineup
}

/// Every UTC date touched by the window, in the `YYYY-MM-DD` form the API expects
fn schedule_dates(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<String> {
    let mut dates = Vec::new();
    let mut day = start.date_naive();
    let last = end.date_naive();
    while day <= last {
        dates.push(day.format("%Y-%m-%d").to_string());
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    dates
}

fn to_program_info(
    channel_id: &str,
    airing: Airing,
    details: Option<&ProgramDetails>,
) -> ProgramInfo {
    let end = airing.air_date_time + Duration::seconds(airing.duration);
    let name = details
        .and_then(|d| d.titles.first())
        .map(|t| t.title120.clone())
        .unwrap_or_else(|| airing.program_id.clone());

    let mut program = ProgramInfo::new(
        &airing.program_id,
        channel_id,
        &name,
        airing.air_date_time,
        end,
    );

    let genres = details.map(|d| d.genres.clone()).unwrap_or_default();
    let has_genre = |g: &str| genres.iter().any(|x| x.eq_ignore_ascii_case(g));

    program.is_movie = airing.program_id.starts_with("MV");
    program.is_sports = airing.program_id.starts_with("SP") || has_genre("Sports event");
    program.is_news = has_genre("News");
    program.series_id = series_id(&airing.program_id);
    program.is_series = program.series_id.is_some()
        || details
            .and_then(|d| d.entity_type.as_deref())
            .map(|t| t.eq_ignore_ascii_case("Episode"))
            .unwrap_or(false);
    program.is_repeat = !airing.new;
    program.is_hd = airing
        .video_properties
        .iter()
        .any(|v| v.eq_ignore_ascii_case("hdtv"));
    program.audio = airing.audio_properties.first().cloned();
    program.official_rating = airing.ratings.first().map(|r| r.code.clone());
    program.episode_title = details.and_then(|d| d.episode_title150.clone());
    program.overview = details.and_then(|d| d.descriptions.as_ref()).and_then(|d| {
        d.description1000
            .as_ref()
            .or(d.description100.as_ref())
            .and_then(|list| list.first())
            .map(|desc| desc.description.clone())
    });
    program.genres = genres;
    program
}
