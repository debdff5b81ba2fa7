//! Reachability probes
//!
//! A probe answers one question for one URL: can playback begin? The
//! validator races every probe against its own timeout, so implementations
//! never enforce an overall deadline themselves. Everything they hold (HTTP
//! bodies, child processes) must be released when the future is dropped.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, REFERER, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::config::{Config, ProbeBackend};
use crate::errors::{AppError, AppResult, MediaLoadError};
use crate::models::Stream;
use crate::utils::url::UrlUtils;

/// Nested master playlists are followed at most this deep
const MAX_MANIFEST_DEPTH: usize = 3;

/// Media playlists are small; anything larger is not a manifest
const MAX_MANIFEST_BYTES: usize = 512 * 1024;

/// MPEG-TS packet size, used to confirm a second sync byte
const TS_PACKET_SIZE: usize = 188;

/// One URL to probe plus the optional per-source headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub url: String,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

impl ProbeTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: None,
            referrer: None,
        }
    }
}

impl From<&Stream> for ProbeTarget {
    fn from(stream: &Stream) -> Self {
        Self {
            url: stream.url.clone(),
            user_agent: stream.user_agent.clone(),
            referrer: stream.http_referrer.clone(),
        }
    }
}

#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Attempt an actual media load and succeed once playback could begin
    async fn load_media(&self, target: &ProbeTarget) -> Result<(), MediaLoadError>;

    /// Manifest-level check for segmented streams
    async fn probe_manifest(&self, target: &ProbeTarget) -> Result<(), MediaLoadError>;
}

/// Build the probe selected in the configuration
pub fn probe_from_config(config: &Config) -> AppResult<Arc<dyn MediaProbe>> {
    let manifest = HlsManifestProbe::from_config(config)?;
    let probe: Arc<dyn MediaProbe> = match config.validation.backend {
        ProbeBackend::Http => Arc::new(HttpMediaProbe::new(
            manifest,
            config.validation.sniff_bytes,
        )),
        ProbeBackend::Ffprobe => Arc::new(FfprobeMediaProbe::new(
            config.validation.ffprobe_command.clone(),
            config.http.user_agent.clone(),
            manifest,
        )),
    };
    Ok(probe)
}

fn http_client(config: &Config) -> AppResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.http.connect_timeout_secs))
        .build()
        .map_err(AppError::from)
}

/// Attach the per-source headers, skipping values the HTTP stack rejects
fn with_source_headers(
    request: RequestBuilder,
    target: &ProbeTarget,
    default_user_agent: &str,
) -> RequestBuilder {
    let mut request = request;
    let user_agent = target.user_agent.as_deref().unwrap_or(default_user_agent);
    match HeaderValue::from_str(user_agent) {
        Ok(value) => request = request.header(USER_AGENT, value),
        Err(_) => warn!("Ignoring unusable user-agent for {}", UrlUtils::obfuscate_credentials(&target.url)),
    }
    if let Some(referrer) = target.referrer.as_deref() {
        match HeaderValue::from_str(referrer) {
            Ok(value) => request = request.header(REFERER, value),
            Err(_) => warn!("Ignoring unusable referrer for {}", UrlUtils::obfuscate_credentials(&target.url)),
        }
    }
    request
}

fn network_error(err: reqwest::Error) -> MediaLoadError {
    MediaLoadError::Network(err.to_string())
}

fn check_status(response: Response) -> Result<Response, MediaLoadError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(MediaLoadError::Network(format!("HTTP {}", status)))
    }
}

/// Direct load: fetch the head of the body and recognize a media container
pub struct HttpMediaProbe {
    manifest: HlsManifestProbe,
    sniff_bytes: usize,
}

impl HttpMediaProbe {
    pub fn new(manifest: HlsManifestProbe, sniff_bytes: usize) -> Self {
        Self {
            manifest,
            sniff_bytes: sniff_bytes.max(TS_PACKET_SIZE + 1),
        }
    }

    async fn read_prefix(&self, mut response: Response) -> Result<Vec<u8>, MediaLoadError> {
        let mut buffer = Vec::with_capacity(self.sniff_bytes.min(64 * 1024));
        while buffer.len() < self.sniff_bytes {
            match response.chunk().await {
                Ok(Some(chunk)) => buffer.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) if buffer.is_empty() => return Err(network_error(e)),
                Err(e) => {
                    trace!("Body ended early after {} bytes: {}", buffer.len(), e);
                    break;
                }
            }
        }
        Ok(buffer)
    }
}

#[async_trait]
impl MediaProbe for HttpMediaProbe {
    async fn load_media(&self, target: &ProbeTarget) -> Result<(), MediaLoadError> {
        let request = with_source_headers(
            self.manifest.client.get(&target.url),
            target,
            &self.manifest.default_user_agent,
        );
        let response = check_status(request.send().await.map_err(network_error)?)?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);
        if let Some(content_type) = content_type.as_deref() {
            if content_type.starts_with("text/html") {
                return Err(MediaLoadError::UnsupportedFormat(content_type.to_string()));
            }
        }

        let head = self.read_prefix(response).await?;
        let container = sniff_container(&head)?;
        debug!(
            "Recognized {} container at {}",
            container,
            UrlUtils::obfuscate_credentials(&target.url)
        );
        Ok(())
    }

    async fn probe_manifest(&self, target: &ProbeTarget) -> Result<(), MediaLoadError> {
        self.manifest.probe(target).await
    }
}

/// Recognize a playable container from the first bytes of a body
pub fn sniff_container(head: &[u8]) -> Result<&'static str, MediaLoadError> {
    if head.is_empty() {
        return Err(MediaLoadError::Decode("empty response body".to_string()));
    }

    let text_start = trim_ascii_start(head);
    if text_start.starts_with(b"#EXTM3U") {
        return Err(MediaLoadError::UnsupportedFormat(
            "segmented manifest cannot be loaded directly".to_string(),
        ));
    }
    if text_start.starts_with(b"<") {
        return Err(MediaLoadError::UnsupportedFormat("markup document".to_string()));
    }

    if head[0] == 0x47 && (head.len() <= TS_PACKET_SIZE || head[TS_PACKET_SIZE] == 0x47) {
        return Ok("mpegts");
    }
    if head.len() >= 8 && matches!(&head[4..8], b"ftyp" | b"moof" | b"moov") {
        return Ok("mp4");
    }
    if head.starts_with(b"FLV") {
        return Ok("flv");
    }
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Ok("matroska");
    }
    if head.starts_with(b"OggS") {
        return Ok("ogg");
    }
    if head.starts_with(b"ID3") {
        return Ok("id3");
    }
    if head.len() >= 2 && head[0] == 0xFF && (head[1] & 0xF6) == 0xF0 {
        return Ok("adts");
    }
    if head.len() >= 2 && head[0] == 0xFF && (head[1] & 0xE0) == 0xE0 {
        return Ok("mpeg-audio");
    }

    Err(MediaLoadError::Decode(
        "unrecognized media signature".to_string(),
    ))
}

fn trim_ascii_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace() && *b != 0xEF && *b != 0xBB && *b != 0xBF)
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// What a fetched manifest turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestVerdict {
    /// Master playlist; follow this variant
    Variant(String),
    /// Media playlist with this many segments
    Segments(usize),
}

/// Parse manifest bytes fetched from `base_url`
pub fn inspect_manifest(base_url: &str, body: &[u8]) -> Result<ManifestVerdict, MediaLoadError> {
    match m3u8_rs::parse_playlist(body) {
        Ok((_, m3u8_rs::Playlist::MasterPlaylist(master))) => {
            let variant = master
                .variants
                .first()
                .ok_or_else(|| MediaLoadError::Manifest("master playlist has no variants".to_string()))?;
            let resolved = UrlUtils::join(base_url, &variant.uri).map_err(|e| {
                MediaLoadError::Manifest(format!("bad variant URI {}: {}", variant.uri, e))
            })?;
            Ok(ManifestVerdict::Variant(resolved))
        }
        Ok((_, m3u8_rs::Playlist::MediaPlaylist(media))) => {
            if media.segments.is_empty() {
                Err(MediaLoadError::Manifest("media playlist has no segments".to_string()))
            } else {
                Ok(ManifestVerdict::Segments(media.segments.len()))
            }
        }
        Err(_) => Err(MediaLoadError::Manifest("could not parse manifest".to_string())),
    }
}

fn append_manifest_chunk(
    body: &mut Vec<u8>,
    chunk: &[u8],
    limit: usize,
) -> Result<(), MediaLoadError> {
    if body.len() + chunk.len() > limit {
        return Err(MediaLoadError::Manifest("manifest too large".to_string()));
    }
    body.extend_from_slice(chunk);
    Ok(())
}

/// Read a manifest body, giving up once it exceeds `limit` bytes
async fn read_manifest(mut response: Response, limit: usize) -> Result<Vec<u8>, MediaLoadError> {
    if let Some(length) = response.content_length() {
        if length > limit as u64 {
            return Err(MediaLoadError::Manifest("manifest too large".to_string()));
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(network_error)? {
        append_manifest_chunk(&mut body, &chunk, limit)?;
    }
    Ok(body)
}

/// HLS manifest probe: resolve variants until a media playlist with segments
pub struct HlsManifestProbe {
    client: Client,
    default_user_agent: String,
}

impl HlsManifestProbe {
    pub fn new(client: Client, default_user_agent: impl Into<String>) -> Self {
        Self {
            client,
            default_user_agent: default_user_agent.into(),
        }
    }

    pub fn from_config(config: &Config) -> AppResult<Self> {
        Ok(Self::new(http_client(config)?, config.http.user_agent.clone()))
    }

    pub async fn probe(&self, target: &ProbeTarget) -> Result<(), MediaLoadError> {
        let mut url = target.url.clone();

        for depth in 0..MAX_MANIFEST_DEPTH {
            let request = with_source_headers(self.client.get(&url), target, &self.default_user_agent);
            let response = check_status(request.send().await.map_err(network_error)?)?;
            let body = read_manifest(response, MAX_MANIFEST_BYTES).await?;

            match inspect_manifest(&url, &body)? {
                ManifestVerdict::Segments(count) => {
                    debug!(
                        "Manifest {} lists {} segments",
                        UrlUtils::obfuscate_credentials(&url),
                        count
                    );
                    return Ok(());
                }
                ManifestVerdict::Variant(next) => {
                    trace!("Following variant at depth {}: {}", depth + 1, UrlUtils::obfuscate_credentials(&next));
                    url = next;
                }
            }
        }

        Err(MediaLoadError::Manifest(format!(
            "master playlists nested deeper than {}",
            MAX_MANIFEST_DEPTH
        )))
    }
}

/// Decode-level load through an external ffprobe binary
pub struct FfprobeMediaProbe {
    ffprobe_command: String,
    default_user_agent: String,
    manifest: HlsManifestProbe,
}

impl FfprobeMediaProbe {
    pub fn new(
        ffprobe_command: impl Into<String>,
        default_user_agent: impl Into<String>,
        manifest: HlsManifestProbe,
    ) -> Self {
        Self {
            ffprobe_command: ffprobe_command.into(),
            default_user_agent: default_user_agent.into(),
            manifest,
        }
    }

    fn command(&self, target: &ProbeTarget) -> Command {
        let mut cmd = Command::new(&self.ffprobe_command);
        cmd.args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_error",
            "-show_entries",
            "stream=index,codec_type,codec_name",
            "-analyzeduration",
            "5000000",
            "-probesize",
            "5000000",
        ]);
        cmd.arg("-user_agent")
            .arg(target.user_agent.as_deref().unwrap_or(&self.default_user_agent));
        if let Some(referrer) = target.referrer.as_deref() {
            cmd.arg("-headers").arg(format!("Referer: {}\r\n", referrer));
        }
        cmd.arg(&target.url);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // the validator drops this future on timeout
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl MediaProbe for FfprobeMediaProbe {
    async fn load_media(&self, target: &ProbeTarget) -> Result<(), MediaLoadError> {
        let output = self
            .command(target)
            .output()
            .await
            .map_err(|e| MediaLoadError::Unexpected(format!("Failed to execute ffprobe: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let probe_data: serde_json::Value = if stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            serde_json::json!({
                "error": {
                    "code": output.status.code().unwrap_or(-1),
                    "string": stderr.trim().to_string()
                }
            })
        } else {
            serde_json::from_str(&stdout).map_err(|e| {
                MediaLoadError::Unexpected(format!("Failed to parse ffprobe output: {}", e))
            })?
        };

        interpret_ffprobe_output(&probe_data)
    }

    async fn probe_manifest(&self, target: &ProbeTarget) -> Result<(), MediaLoadError> {
        self.manifest.probe(target).await
    }
}

/// Turn ffprobe's JSON document into a verdict
pub fn interpret_ffprobe_output(data: &serde_json::Value) -> Result<(), MediaLoadError> {
    if let Some(error) = data.get("error") {
        let message = error
            .get("string")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("Unknown ffprobe error");
        return Err(classify_ffprobe_error(message));
    }

    let playable = data
        .get("streams")
        .and_then(|v| v.as_array())
        .map(|streams| {
            streams.iter().any(|stream| {
                matches!(
                    stream.get("codec_type").and_then(|v| v.as_str()),
                    Some("video") | Some("audio")
                )
            })
        })
        .unwrap_or(false);

    if playable {
        Ok(())
    } else {
        Err(MediaLoadError::Decode("no audio or video streams found".to_string()))
    }
}

fn classify_ffprobe_error(message: &str) -> MediaLoadError {
    let lower = message.to_ascii_lowercase();
    let network_markers = [
        "connection",
        "server returned",
        "timed out",
        "resolve",
        "network is unreachable",
        "no route to host",
    ];

    if network_markers.iter().any(|m| lower.contains(m)) {
        MediaLoadError::Network(message.to_string())
    } else if lower.contains("protocol not found") || lower.contains("unknown format") {
        MediaLoadError::UnsupportedFormat(message.to_string())
    } else {
        MediaLoadError::Decode(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_transport_stream() {
        let mut head = vec![0u8; 400];
        head[0] = 0x47;
        head[TS_PACKET_SIZE] = 0x47;
        assert_eq!(sniff_container(&head), Ok("mpegts"));

        head[TS_PACKET_SIZE] = 0x00;
        assert!(matches!(sniff_container(&head), Err(MediaLoadError::Decode(_))));
    }

    #[test]
    fn test_sniff_common_containers() {
        assert_eq!(sniff_container(b"\x00\x00\x00\x18ftypmp42"), Ok("mp4"));
        assert_eq!(sniff_container(b"\x00\x00\x00\x10moof\x00\x00\x00\x10"), Ok("mp4"));
        assert_eq!(sniff_container(b"FLV\x01\x05"), Ok("flv"));
        assert_eq!(sniff_container(&[0x1A, 0x45, 0xDF, 0xA3, 0x01]), Ok("matroska"));
        assert_eq!(sniff_container(b"ID3\x04\x00"), Ok("id3"));
        assert_eq!(sniff_container(&[0xFF, 0xF1, 0x50, 0x80]), Ok("adts"));
    }

    #[test]
    fn test_sniff_rejects_documents() {
        assert!(matches!(
            sniff_container(b"\n#EXTM3U\n#EXT-X-VERSION:3\n"),
            Err(MediaLoadError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            sniff_container(b"<!DOCTYPE html><html>"),
            Err(MediaLoadError::UnsupportedFormat(_))
        ));
        assert!(matches!(sniff_container(b""), Err(MediaLoadError::Decode(_))));
    }

    #[test]
    fn test_inspect_master_playlist_resolves_first_variant() {
        let body = b"#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1280000\nlow/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2560000\nhigh/index.m3u8\n";
        let verdict = inspect_manifest("http://cdn.example.com/live/master.m3u8", body).unwrap();
        assert_eq!(
            verdict,
            ManifestVerdict::Variant("http://cdn.example.com/live/low/index.m3u8".to_string())
        );
    }

    #[test]
    fn test_inspect_media_playlist_counts_segments() {
        let body = b"#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:1\n#EXTINF:10.0,\nseg1.ts\n#EXTINF:10.0,\nseg2.ts\n";
        let verdict = inspect_manifest("http://cdn.example.com/live/index.m3u8", body).unwrap();
        assert_eq!(verdict, ManifestVerdict::Segments(2));
    }

    #[test]
    fn test_inspect_empty_media_playlist_fails() {
        let body = b"#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n";
        assert!(matches!(
            inspect_manifest("http://cdn.example.com/live/index.m3u8", body),
            Err(MediaLoadError::Manifest(_))
        ));
    }

    #[test]
    fn test_ffprobe_output_interpretation() {
        let ok = serde_json::json!({
            "streams": [{"index": 0, "codec_type": "video", "codec_name": "h264"}]
        });
        assert_eq!(interpret_ffprobe_output(&ok), Ok(()));

        let no_streams = serde_json::json!({ "streams": [] });
        assert!(matches!(
            interpret_ffprobe_output(&no_streams),
            Err(MediaLoadError::Decode(_))
        ));

        let refused = serde_json::json!({
            "error": {"code": -111, "string": "Connection refused"}
        });
        assert!(matches!(
            interpret_ffprobe_output(&refused),
            Err(MediaLoadError::Network(_))
        ));

        let invalid = serde_json::json!({
            "error": {"code": -1094995529, "string": "Invalid data found when processing input"}
        });
        assert!(matches!(
            interpret_ffprobe_output(&invalid),
            Err(MediaLoadError::Decode(_))
        ));
    }

    #[test]
    fn test_probe_target_from_stream() {
        let stream = Stream {
            channel_id: "ch_0_A_00000000".to_string(),
            url: "http://x/a.m3u8".to_string(),
            http_referrer: Some("http://ref".to_string()),
            user_agent: None,
        };
        let target = ProbeTarget::from(&stream);
        assert_eq!(target.url, "http://x/a.m3u8");
        assert_eq!(target.referrer.as_deref(), Some("http://ref"));
        assert_eq!(target.user_agent, None);
    }

    #[test]
    fn test_manifest_read_stops_past_size_limit() {
        let mut body = Vec::new();
        assert!(append_manifest_chunk(&mut body, b"#EXTM3U\n", 16).is_ok());
        assert!(append_manifest_chunk(&mut body, b"#EXT-X-", 16).is_ok());
        assert_eq!(body.len(), 15);

        // a TS stream behind a manifest-looking URL never stops sending
        let packet = [0x47u8; TS_PACKET_SIZE];
        assert_eq!(
            append_manifest_chunk(&mut body, &packet, 16),
            Err(MediaLoadError::Manifest("manifest too large".to_string()))
        );
        assert_eq!(body.len(), 15);

        let mut large = Vec::new();
        let mut outcome = Ok(());
        for _ in 0..(MAX_MANIFEST_BYTES / TS_PACKET_SIZE + 2) {
            outcome = append_manifest_chunk(&mut large, &packet, MAX_MANIFEST_BYTES);
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(outcome, Err(MediaLoadError::Manifest(_))));
        assert!(large.len() <= MAX_MANIFEST_BYTES);
    }
}
