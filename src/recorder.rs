//! Recording writer
//!
//! Copies a live tuner stream into a transport-stream file until the padded
//! end of the timer or until the recording is cancelled. Plain HTTP streams
//! are copied as they arrive; HLS playlists are polled and their segments
//! appended in order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Url;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{MediaSource, StreamProtocol, TimerInfo};

const DEFAULT_PLAYLIST_POLL: Duration = Duration::from_secs(2);

/// How a recording that did not fail came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingOutcome {
    /// Ran for the full requested duration
    Completed,
    /// Stopped early by cancellation; the partial file is kept
    Cancelled,
}

#[async_trait]
pub trait Recorder: Send + Sync {
    async fn record(
        &self,
        source: &MediaSource,
        output: &Path,
        duration: Duration,
        cancel: CancellationToken,
    ) -> Result<RecordingOutcome>;
}

/// Streams the tuner's HTTP or HLS output straight to disk
pub struct HttpRecorder {
    client: reqwest::Client,
}

impl HttpRecorder {
    /// `client` should only bound connection setup; an overall request
    /// timeout would cut recordings short.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn record_stream(
        &self,
        source: &MediaSource,
        output: &Path,
        duration: Duration,
        cancel: CancellationToken,
    ) -> Result<RecordingOutcome> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(RecordingOutcome::Cancelled),
            response = self.client.get(&source.url).send() => response
                .with_context(|| format!("Failed to open stream {}", source.url))?,
        };
        let response = response
            .error_for_status()
            .with_context(|| format!("Tuner refused stream {}", source.url))?;

        let mut file = open_output(output).await?;
        info!(
            "Recording channel {} to {:?} for {}s",
            source.channel_id,
            output,
            duration.as_secs()
        );

        let mut stream = response.bytes_stream();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        let mut written: u64 = 0;

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break RecordingOutcome::Cancelled,
                _ = &mut deadline => break RecordingOutcome::Completed,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        file.write_all(&bytes).await.context("Failed to write recording")?;
                        written += bytes.len() as u64;
                    }
                    Some(Err(e)) => {
                        file.flush().await.ok();
                        return Err(e).context(format!("Stream interrupted after {} bytes", written));
                    }
                    None => {
                        file.flush().await.ok();
                        bail!("Stream ended early after {} bytes", written);
                    }
                },
            }
        };

        finish(file, output, outcome, written).await
    }

    async fn record_hls(
        &self,
        source: &MediaSource,
        output: &Path,
        duration: Duration,
        cancel: CancellationToken,
    ) -> Result<RecordingOutcome> {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        let (media_url, mut playlist) = tokio::select! {
            _ = cancel.cancelled() => return Ok(RecordingOutcome::Cancelled),
            loaded = self.load_media_playlist(&source.url) => loaded?,
        };

        let mut file = open_output(output).await?;
        info!(
            "Recording HLS channel {} from {} to {:?} for {}s",
            source.channel_id,
            media_url,
            output,
            duration.as_secs()
        );

        let mut next_sequence: Option<u64> = None;
        let mut written: u64 = 0;

        let outcome = 'poll: loop {
            for (sequence, segment) in playlist.numbered_segments() {
                if next_sequence.is_some_and(|next| sequence < next) {
                    continue;
                }
                let fetched = tokio::select! {
                    _ = cancel.cancelled() => break 'poll RecordingOutcome::Cancelled,
                    _ = &mut deadline => break 'poll RecordingOutcome::Completed,
                    fetched = self.fetch_segment(segment) => fetched,
                };
                match fetched {
                    Ok(bytes) => {
                        file.write_all(&bytes).await.context("Failed to write recording")?;
                        written += bytes.len() as u64;
                    }
                    Err(e) => {
                        file.flush().await.ok();
                        return Err(e.context(format!("Segment failed after {} bytes", written)));
                    }
                }
            }
            next_sequence = Some(playlist.next_sequence());

            if playlist.ended {
                file.flush().await.ok();
                bail!("Playlist ended early after {} bytes", written);
            }

            tokio::select! {
                _ = cancel.cancelled() => break 'poll RecordingOutcome::Cancelled,
                _ = &mut deadline => break 'poll RecordingOutcome::Completed,
                _ = tokio::time::sleep(playlist.poll_interval()) => {}
            }

            let refreshed = tokio::select! {
                _ = cancel.cancelled() => break 'poll RecordingOutcome::Cancelled,
                _ = &mut deadline => break 'poll RecordingOutcome::Completed,
                refreshed = self.fetch_playlist(&media_url) => refreshed,
            };
            playlist = match refreshed {
                Ok(playlist) => playlist,
                Err(e) => {
                    file.flush().await.ok();
                    return Err(e.context(format!("Playlist refresh failed after {} bytes", written)));
                }
            };
        };

        finish(file, output, outcome, written).await
    }

    /// Media playlist for `url`, following a master playlist to its first variant
    async fn load_media_playlist(&self, url: &str) -> Result<(Url, Playlist)> {
        let url = Url::parse(url).with_context(|| format!("Invalid stream URL {}", url))?;
        let mut playlist = self.fetch_playlist(&url).await?;
        let Some(variant) = playlist.variant.take() else {
            return Ok((url, playlist));
        };

        debug!("Master playlist {} points to {}", url, variant);
        let media = self.fetch_playlist(&variant).await?;
        if media.variant.is_some() {
            bail!("Playlist {} does not lead to any media segments", variant);
        }
        Ok((variant, media))
    }

    async fn fetch_playlist(&self, url: &Url) -> Result<Playlist> {
        let text = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to load playlist {}", url))?
            .text()
            .await
            .with_context(|| format!("Failed to read playlist {}", url))?;
        parse_playlist(url, &text)
    }

    async fn fetch_segment(&self, url: &Url) -> Result<Bytes> {
        self.client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to load segment {}", url))?
            .bytes()
            .await
            .with_context(|| format!("Failed to read segment {}", url))
    }
}

#[async_trait]
impl Recorder for HttpRecorder {
    async fn record(
        &self,
        source: &MediaSource,
        output: &Path,
        duration: Duration,
        cancel: CancellationToken,
    ) -> Result<RecordingOutcome> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create recording directory")?;
        }

        match source.protocol {
            StreamProtocol::Http => self.record_stream(source, output, duration, cancel).await,
            StreamProtocol::Hls => self.record_hls(source, output, duration, cancel).await,
        }
    }
}

/// Open for appending so a recording resumed after a restart keeps what was
/// already captured
async fn open_output(output: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .await
        .with_context(|| format!("Failed to open {:?}", output))?;

    let existing = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    if existing > 0 {
        info!("Resuming {:?}, keeping {} bytes already recorded", output, existing);
    }
    Ok(file)
}

async fn finish(
    mut file: File,
    output: &Path,
    outcome: RecordingOutcome,
    written: u64,
) -> Result<RecordingOutcome> {
    file.flush().await.context("Failed to flush recording")?;
    match outcome {
        RecordingOutcome::Completed => debug!("Recorded {} bytes to {:?}", written, output),
        RecordingOutcome::Cancelled => {
            warn!("Recording {:?} stopped early after {} bytes", output, written)
        }
    }
    Ok(outcome)
}

/// The parts of an HLS playlist the recorder needs
#[derive(Debug, Default, PartialEq)]
struct Playlist {
    media_sequence: u64,
    target_duration: Option<u64>,
    segments: Vec<Url>,
    /// First variant stream when this is a master playlist
    variant: Option<Url>,
    ended: bool,
}

impl Playlist {
    fn numbered_segments(&self) -> impl Iterator<Item = (u64, &Url)> {
        (self.media_sequence..).zip(self.segments.iter())
    }

    fn next_sequence(&self) -> u64 {
        self.media_sequence + self.segments.len() as u64
    }

    fn poll_interval(&self) -> Duration {
        self.target_duration
            .map(|secs| Duration::from_secs(secs.clamp(1, 10)))
            .unwrap_or(DEFAULT_PLAYLIST_POLL)
    }
}

fn parse_playlist(base: &Url, text: &str) -> Result<Playlist> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("#EXTM3U") {
        bail!("{} is not an HLS playlist", base);
    }

    let mut playlist = Playlist::default();
    let mut variant_follows = false;
    for line in lines {
        if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            playlist.media_sequence = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            playlist.target_duration = value.trim().parse().ok();
        } else if line == "#EXT-X-ENDLIST" {
            playlist.ended = true;
        } else if line.starts_with("#EXT-X-STREAM-INF") {
            variant_follows = true;
        } else if !line.starts_with('#') {
            let uri = base
                .join(line)
                .with_context(|| format!("Invalid playlist entry {}", line))?;
            if variant_follows {
                variant_follows = false;
                playlist.variant.get_or_insert(uri);
            } else {
                playlist.segments.push(uri);
            }
        }
    }
    Ok(playlist)
}

fn sanitize(value: &str, max_len: usize) -> String {
    value
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(max_len)
        .collect()
}

/// File name for a timer's recording: `<start>_<channel>_<title>.ts`
pub fn generate_filename(timer: &TimerInfo) -> String {
    format!(
        "{}_{}_{}.ts",
        format_timestamp(timer.start_date),
        sanitize(&timer.channel_id, 30),
        sanitize(&timer.name, 50)
    )
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H-%M-%S").to_string()
}

/// Full output path for a timer under the recordings directory
pub fn recording_path(dir: &Path, timer: &TimerInfo) -> PathBuf {
    dir.join(generate_filename(timer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockito::Server;
    use std::io::Write;
    use tempfile::TempDir;

    fn endless_stream(server: &mut Server) -> mockito::Mock {
        server
            .mock("GET", "/auto/v5.1")
            .with_chunked_body(|w| loop {
                w.write_all(&[0x47; 188])?;
                w.flush()?;
                std::thread::sleep(Duration::from_millis(20));
            })
    }

    fn source(server: &Server) -> MediaSource {
        MediaSource::http("hdhr", "5.1", &format!("{}/auto/v5.1", server.url()))
    }

    #[test]
    fn test_generate_filename() {
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 20, 0, 0).unwrap();
        let timer = TimerInfo::new(
            "5.1",
            "EP0001",
            "News: Who/What?",
            start,
            start + chrono::Duration::minutes(30),
        );
        assert_eq!(
            generate_filename(&timer),
            "2026-10-19T20-00-00_5.1_News_ Who_What_.ts"
        );
    }

    #[tokio::test]
    async fn test_records_for_requested_duration() {
        let mut server = Server::new_async().await;
        let _mock = endless_stream(&mut server).create_async().await;
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("rec").join("news.ts");

        let outcome = HttpRecorder::new(reqwest::Client::new())
            .record(
                &source(&server),
                &output,
                Duration::from_millis(300),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, RecordingOutcome::Completed);
        assert!(std::fs::metadata(&output).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_file() {
        let mut server = Server::new_async().await;
        let _mock = endless_stream(&mut server).create_async().await;
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("news.ts");

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let outcome = HttpRecorder::new(reqwest::Client::new())
            .record(&source(&server), &output, Duration::from_secs(60), token)
            .await
            .unwrap();

        assert_eq!(outcome, RecordingOutcome::Cancelled);
        assert!(output.exists());
    }

    #[tokio::test]
    async fn test_refused_stream_fails() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/auto/v5.1")
            .with_status(503)
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();

        let result = HttpRecorder::new(reqwest::Client::new())
            .record(
                &source(&server),
                &dir.path().join("news.ts"),
                Duration::from_secs(60),
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resumed_recording_keeps_earlier_bytes() {
        let mut server = Server::new_async().await;
        let _mock = endless_stream(&mut server).create_async().await;
        let dir = TempDir::new().unwrap();

        let start = Utc::now() - chrono::Duration::minutes(10);
        let timer = TimerInfo::new(
            "5.1",
            "EP0001",
            "Evening News",
            start,
            start + chrono::Duration::minutes(30),
        );
        let output = recording_path(dir.path(), &timer);
        std::fs::write(&output, b"PARTIAL-BEFORE-RESTART").unwrap();

        let outcome = HttpRecorder::new(reqwest::Client::new())
            .record(
                &source(&server),
                &output,
                Duration::from_millis(300),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, RecordingOutcome::Completed);
        let content = std::fs::read(&output).unwrap();
        assert!(content.starts_with(b"PARTIAL-BEFORE-RESTART"));
        assert!(content.len() > b"PARTIAL-BEFORE-RESTART".len());
    }

    async fn mock_body(server: &mut Server, path: &str, body: &str) -> mockito::Mock {
        server
            .mock("GET", path)
            .with_body(body)
            .create_async()
            .await
    }

    fn hls_source(server: &Server) -> MediaSource {
        MediaSource::http("iptv", "9", &format!("{}/live.m3u8", server.url()))
    }

    #[tokio::test]
    async fn test_hls_follows_master_playlist_to_segments() {
        let mut server = Server::new_async().await;
        let _mocks = vec![
            mock_body(
                &mut server,
                "/live.m3u8",
                "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nhd/index.m3u8\n",
            )
            .await,
            mock_body(
                &mut server,
                "/hd/index.m3u8",
                "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:41\n#EXTINF:6.0,\nseg41.ts\n#EXTINF:6.0,\nseg42.ts\n",
            )
            .await,
            mock_body(&mut server, "/hd/seg41.ts", "AAAA").await,
            mock_body(&mut server, "/hd/seg42.ts", "BBBB").await,
        ];
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("movie.ts");

        let source = hls_source(&server);
        assert_eq!(source.protocol, StreamProtocol::Hls);
        let outcome = HttpRecorder::new(reqwest::Client::new())
            .record(&source, &output, Duration::from_millis(500), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, RecordingOutcome::Completed);
        assert_eq!(std::fs::read(&output).unwrap(), b"AAAABBBB");
    }

    #[tokio::test]
    async fn test_hls_playlist_ending_early_fails() {
        let mut server = Server::new_async().await;
        let _mocks = vec![
            mock_body(
                &mut server,
                "/live.m3u8",
                "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:0\nseg0.ts\n#EXT-X-ENDLIST\n",
            )
            .await,
            mock_body(&mut server, "/seg0.ts", "AAAA").await,
        ];
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("movie.ts");

        let result = HttpRecorder::new(reqwest::Client::new())
            .record(
                &hls_source(&server),
                &output,
                Duration::from_secs(60),
                CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(std::fs::read(&output).unwrap(), b"AAAA");
    }

    #[tokio::test]
    async fn test_hls_rejects_non_playlist() {
        let mut server = Server::new_async().await;
        let _m = mock_body(&mut server, "/live.m3u8", "<html>blocked</html>").await;
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("movie.ts");

        let result = HttpRecorder::new(reqwest::Client::new())
            .record(
                &hls_source(&server),
                &output,
                Duration::from_secs(60),
                CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        assert!(!output.exists());
    }

    #[test]
    fn test_parse_playlist() {
        let base = Url::parse("http://iptv/ch9/index.m3u8").unwrap();
        let playlist = parse_playlist(
            &base,
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:7\n\
             #EXTINF:4.0,\na.ts\n#EXTINF:4.0,\nhttp://cdn/b.ts\n",
        )
        .unwrap();

        let numbered: Vec<(u64, String)> = playlist
            .numbered_segments()
            .map(|(seq, url)| (seq, url.to_string()))
            .collect();
        assert_eq!(
            numbered,
            vec![
                (7, "http://iptv/ch9/a.ts".to_string()),
                (8, "http://cdn/b.ts".to_string())
            ]
        );
        assert_eq!(playlist.next_sequence(), 9);
        assert_eq!(playlist.poll_interval(), Duration::from_secs(4));
        assert!(playlist.variant.is_none());
        assert!(!playlist.ended);
    }
}
