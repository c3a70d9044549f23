//! XMLTV guide supplier
//!
//! Reads an XMLTV document (optionally gzip-compressed) from a URL or a local
//! path. The parsed guide is cached for an hour.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use quick_xml::encoding::Decoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::epg::{normalize_channel_number, overlaps, series_id, EpgSupplier};
use crate::error::{LiveTvError, Result};
use crate::models::{ProgramInfo, StationInfo};

const GUIDE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Parsed guide, keyed by normalized channel number
#[derive(Debug, Default)]
pub struct XmltvGuide {
    pub stations: HashMap<String, StationInfo>,
    pub programs: HashMap<String, Vec<ProgramInfo>>,
}

pub struct XmltvSupplier {
    source: String,
    client: reqwest::Client,
    guide: RwLock<Option<(Instant, Arc<XmltvGuide>)>>,
}

impl XmltvSupplier {
    pub fn new(source: &str, client: reqwest::Client) -> Self {
        Self {
            source: source.trim().to_string(),
            client,
            guide: RwLock::new(None),
        }
    }

    async fn read_source(&self) -> Result<Vec<u8>> {
        let data = if self.source.starts_with("http://") || self.source.starts_with("https://") {
            let response = self.client.get(&self.source).send().await?.error_for_status()?;
            response.bytes().await?.to_vec()
        } else {
            tokio::fs::read(&self.source).await?
        };

        if data.starts_with(&GZIP_MAGIC) {
            let mut decompressed = Vec::new();
            GzDecoder::new(data.as_slice()).read_to_end(&mut decompressed)?;
            Ok(decompressed)
        } else {
            Ok(data)
        }
    }

    async fn guide(&self) -> Result<Arc<XmltvGuide>> {
        if let Some((loaded_at, guide)) = self.guide.read().await.as_ref() {
            if loaded_at.elapsed() < GUIDE_CACHE_TTL {
                return Ok(guide.clone());
            }
        }

        let mut slot = self.guide.write().await;
        // Another caller may have reloaded while we waited for the lock
        if let Some((loaded_at, guide)) = slot.as_ref() {
            if loaded_at.elapsed() < GUIDE_CACHE_TTL {
                return Ok(guide.clone());
            }
        }

        let data = self.read_source().await?;
        let guide = tokio::task::spawn_blocking(move || parse_xmltv(&data))
            .await
            .map_err(anyhow::Error::from)??;
        let guide = Arc::new(guide);

        info!(
            "Loaded XMLTV guide from {}: {} channels, {} programmes",
            self.source,
            guide.stations.len(),
            guide.programs.values().map(Vec::len).sum::<usize>()
        );
        *slot = Some((Instant::now(), guide.clone()));
        Ok(guide)
    }
}

#[async_trait]
impl EpgSupplier for XmltvSupplier {
    fn name(&self) -> &str {
        "XMLTV"
    }

    async fn get_stations(&self) -> Result<HashMap<String, StationInfo>> {
        Ok(self.guide().await?.stations.clone())
    }

    async fn get_programs(
        &self,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProgramInfo>> {
        let guide = self.guide().await?;
        let Some(programs) = guide.programs.get(&normalize_channel_number(channel_id)) else {
            debug!("No XMLTV listings for channel {}", channel_id);
            return Ok(Vec::new());
        };

        Ok(programs
            .iter()
            .filter(|p| overlaps(p.start_date, p.end_date, start, end))
            .map(|p| ProgramInfo {
                channel_id: channel_id.to_string(),
                ..p.clone()
            })
            .collect())
    }
}

#[derive(Debug, Default)]
struct RawChannel {
    id: String,
    names: Vec<String>,
    lcn: Option<String>,
    icon: Option<String>,
}

#[derive(Debug, Default)]
struct RawProgramme {
    channel: String,
    start: Option<DateTime<Utc>>,
    stop: Option<DateTime<Utc>>,
    title: Option<String>,
    sub_title: Option<String>,
    desc: Option<String>,
    categories: Vec<String>,
    dd_progid: Option<String>,
    episodic: bool,
    previously_shown: bool,
    new: bool,
    hd: bool,
    audio: Option<String>,
    rating: Option<String>,
}

#[derive(Default)]
struct ParseState {
    channels: Vec<RawChannel>,
    programmes: Vec<RawProgramme>,
    channel: Option<RawChannel>,
    programme: Option<RawProgramme>,
    text: String,
    episode_system: Option<String>,
    in_rating: bool,
}

impl ParseState {
    fn open(&mut self, name: &str, attrs: HashMap<String, String>) {
        self.text.clear();
        match name {
            "channel" => {
                self.channel = Some(RawChannel {
                    id: attrs.get("id").cloned().unwrap_or_default(),
                    ..Default::default()
                });
            }
            "programme" => {
                self.programme = Some(RawProgramme {
                    channel: attrs.get("channel").cloned().unwrap_or_default(),
                    start: attrs.get("start").and_then(|s| parse_xmltv_time(s)),
                    stop: attrs.get("stop").and_then(|s| parse_xmltv_time(s)),
                    ..Default::default()
                });
            }
            "icon" => {
                if let Some(channel) = self.channel.as_mut() {
                    if channel.icon.is_none() {
                        channel.icon = attrs.get("src").cloned();
                    }
                }
            }
            "episode-num" => self.episode_system = attrs.get("system").cloned(),
            "rating" => self.in_rating = true,
            "previously-shown" => {
                if let Some(p) = self.programme.as_mut() {
                    p.previously_shown = true;
                }
            }
            "new" => {
                if let Some(p) = self.programme.as_mut() {
                    p.new = true;
                }
            }
            _ => {}
        }
    }

    fn close(&mut self, name: &str) {
        let text = self.text.trim().to_string();
        self.text.clear();

        match name {
            "channel" => {
                if let Some(channel) = self.channel.take() {
                    self.channels.push(channel);
                }
                return;
            }
            "programme" => {
                if let Some(programme) = self.programme.take() {
                    self.programmes.push(programme);
                }
                return;
            }
            "rating" => {
                self.in_rating = false;
                return;
            }
            _ => {}
        }

        if let Some(channel) = self.channel.as_mut() {
            match name {
                "display-name" if !text.is_empty() => channel.names.push(text),
                "lcn" if !text.is_empty() => channel.lcn = Some(text),
                _ => {}
            }
            return;
        }

        let Some(p) = self.programme.as_mut() else {
            return;
        };
        match name {
            "title" if p.title.is_none() => p.title = Some(text),
            "sub-title" => p.sub_title = Some(text),
            "desc" if p.desc.is_none() => p.desc = Some(text),
            "category" if !text.is_empty() => p.categories.push(text),
            "episode-num" => match self.episode_system.take().as_deref() {
                Some("dd_progid") => p.dd_progid = Some(text.replace('.', "")),
                Some("xmltv_ns") | Some("onscreen") => p.episodic = true,
                _ => {}
            },
            "quality" => p.hd |= text.eq_ignore_ascii_case("HDTV"),
            "stereo" => p.audio = Some(text),
            "value" if self.in_rating => p.rating = Some(text),
            _ => {}
        }
    }
}

fn attributes(e: &BytesStart, decoder: Decoder) -> HashMap<String, String> {
    e.attributes()
        .flatten()
        .map(|attr| {
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let value = attr
                .decode_and_unescape_value(decoder)
                .map(|v| v.to_string())
                .unwrap_or_default();
            (key, value)
        })
        .collect()
}

/// Parse an XMLTV document into stations and per-channel listings
pub fn parse_xmltv(data: &[u8]) -> Result<XmltvGuide> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut state = ParseState::default();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                state.open(&name, attributes(&e, reader.decoder()));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                state.open(&name, attributes(&e, reader.decoder()));
                state.close(&name);
            }
            Ok(Event::Text(e)) => {
                if let Ok(text) = e.unescape() {
                    state.text.push_str(&text);
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                state.close(&name);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(LiveTvError::Epg(format!(
                    "malformed XMLTV at byte {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(build_guide(state))
}

fn build_guide(state: ParseState) -> XmltvGuide {
    let mut guide = XmltvGuide::default();
    let mut numbers: HashMap<String, String> = HashMap::new();

    for channel in state.channels {
        let number = channel
            .lcn
            .clone()
            .or_else(|| channel.names.iter().find(|n| is_channel_number(n)).cloned())
            .unwrap_or_else(|| channel.id.clone());
        let name = channel
            .names
            .iter()
            .find(|n| !is_channel_number(n))
            .cloned()
            .unwrap_or_else(|| channel.id.clone());
        let key = normalize_channel_number(&number);

        numbers.insert(channel.id.clone(), key.clone());
        guide.stations.entry(key).or_insert(StationInfo {
            station_id: channel.id,
            name,
            affiliate: None,
            image_url: channel.icon,
        });
    }

    for raw in state.programmes {
        let (Some(start), Some(stop)) = (raw.start, raw.stop) else {
            continue;
        };
        let key = numbers
            .get(&raw.channel)
            .cloned()
            .unwrap_or_else(|| normalize_channel_number(&raw.channel));
        let id = raw
            .dd_progid
            .clone()
            .unwrap_or_else(|| format!("{}_{}", key, start.timestamp()));
        let has_category = |c: &str| raw.categories.iter().any(|x| x.eq_ignore_ascii_case(c));

        let mut program = ProgramInfo::new(
            &id,
            &key,
            raw.title.as_deref().unwrap_or("Unknown"),
            start,
            stop,
        );
        program.series_id = raw.dd_progid.as_deref().and_then(series_id);
        program.is_movie = has_category("Movie") || id.starts_with("MV");
        program.is_sports = has_category("Sports") || has_category("Sports event");
        program.is_news = has_category("News");
        program.is_series =
            program.series_id.is_some() || raw.episodic || has_category("Series");
        program.is_repeat = raw.previously_shown && !raw.new;
        program.is_hd = raw.hd;
        program.audio = raw.audio.clone();
        program.official_rating = raw.rating.clone();
        program.episode_title = raw.sub_title.clone();
        program.overview = raw.desc.clone();
        program.genres = raw.categories.clone();

        guide.programs.entry(key).or_default().push(program);
    }

    for programs in guide.programs.values_mut() {
        programs.sort_by_key(|p| p.start_date);
    }
    guide
}

fn is_channel_number(value: &str) -> bool {
    !value.is_empty()
        && value.chars().any(|c| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-')
}

/// Parse XMLTV timestamps such as `20261019200000 +0000`
pub fn parse_xmltv_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y%m%d%H%M%S %z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}
