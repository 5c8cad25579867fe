//! Classifies a stream as normal, audio-only or video-only.
//!
//! Rules are tried in order: codec tags, then the URL's file extension, then
//! the content type of a small ranged request. Detection never fails; when
//! nothing is conclusive the stream is treated as normal.

use m3u8_rs::Playlist;
use tracing::{debug, warn};
use url::Url;

use crate::http::{HttpTransport, ProbeRequest, Route};
use crate::selector::Variant;

const VIDEO_CODECS: &[&str] = &[
    "avc1", "avc3", "hvc1", "hev1", "vp8", "vp08", "vp9", "vp09", "av01", "dvh1", "dvhe", "mp4v",
];
const AUDIO_CODECS: &[&str] = &[
    "mp4a", "ac-3", "ec-3", "opus", "mp3", "flac", "vorbis", "aac", "alac", "dtsc",
];

const AUDIO_EXTENSIONS: &[&str] = &["aac", "m4a", "mp3", "ogg", "opus", "flac"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "mov", "ts", "m2ts", "flv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKind {
    Normal,
    AudioOnly,
    VideoOnly,
}

/// What is known about a stream before detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub url: Url,
    pub route: Route,
    /// Content type learned earlier, saves the probe when present.
    pub content_type: Option<String>,
    pub codecs: Vec<String>,
}

impl StreamDescriptor {
    pub fn new(url: Url, route: Route) -> Self {
        Self {
            url,
            route,
            content_type: None,
            codecs: Vec::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_codecs(mut self, codecs: Vec<String>) -> Self {
        self.codecs = codecs;
        self
    }
}

fn codec_family(tag: &str) -> &str {
    tag.split('.').next().unwrap_or(tag)
}

/// Rule 1. `None` when no tag belongs to a known family.
pub fn classify_codecs<S: AsRef<str>>(codecs: &[S]) -> Option<VariantKind> {
    let mut has_video = false;
    let mut has_audio = false;
    for tag in codecs {
        let tag = tag.as_ref().trim().to_ascii_lowercase();
        let family = codec_family(&tag);
        has_video |= VIDEO_CODECS.contains(&family);
        has_audio |= AUDIO_CODECS.contains(&family);
    }

    match (has_video, has_audio) {
        (true, true) => Some(VariantKind::Normal),
        (true, false) => Some(VariantKind::VideoOnly),
        (false, true) => Some(VariantKind::AudioOnly),
        (false, false) => None,
    }
}

/// Rule 2. Query strings and fragments are ignored.
pub fn classify_extension(url: &Url) -> Option<VariantKind> {
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        Some(VariantKind::AudioOnly)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(VariantKind::Normal)
    } else {
        None
    }
}

/// Rule 3.
pub fn classify_content_type(content_type: &str) -> VariantKind {
    if content_type.trim().to_ascii_lowercase().starts_with("audio/") {
        VariantKind::AudioOnly
    } else {
        VariantKind::Normal
    }
}

/// Codec tags of the highest-bandwidth variant of an HLS master playlist.
pub fn hls_master_codecs(playlist: &[u8]) -> Vec<String> {
    match m3u8_rs::parse_playlist_res(playlist) {
        Ok(Playlist::MasterPlaylist(master)) => master
            .variants
            .iter()
            .filter(|v| !v.is_i_frame)
            .max_by_key(|v| v.bandwidth)
            .and_then(|v| v.codecs.as_deref())
            .map(|codecs| codecs.split(',').map(|c| c.trim().to_string()).collect())
            .unwrap_or_default(),
        Ok(Playlist::MediaPlaylist(_)) => Vec::new(),
        Err(e) => {
            debug!(error = ?e, "Playlist is not parseable, no codec information");
            Vec::new()
        }
    }
}

/// Codec tags of the tracks a DASH variant muxes.
pub fn variant_codecs(variant: &Variant<'_>) -> Vec<String> {
    variant
        .video
        .into_iter()
        .chain(variant.audio)
        .flat_map(|rep| rep.codec_tags())
        .collect()
}

pub struct VariantDetector<'a, T: ?Sized> {
    transport: &'a T,
}

impl<'a, T> VariantDetector<'a, T>
where
    T: HttpTransport + ?Sized,
{
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    pub async fn detect(&self, stream: &StreamDescriptor) -> VariantKind {
        if let Some(kind) = classify_codecs(&stream.codecs) {
            debug!(kind = ?kind, codecs = ?stream.codecs, "Classified by codecs");
            return kind;
        }

        if let Some(kind) = classify_extension(&stream.url) {
            debug!(kind = ?kind, "Classified by file extension");
            return kind;
        }

        if let Some(content_type) = &stream.content_type {
            let kind = classify_content_type(content_type);
            debug!(kind = ?kind, content_type = %content_type, "Classified by known content type");
            return kind;
        }

        match self
            .transport
            .probe(ProbeRequest::content_type(stream.url.clone(), stream.route))
            .await
        {
            Ok(response) => {
                let kind = response
                    .content_type
                    .as_deref()
                    .map_or(VariantKind::Normal, classify_content_type);
                debug!(kind = ?kind, content_type = ?response.content_type, "Classified by probe");
                kind
            }
            Err(e) => {
                warn!(error = %e, "Content type probe failed, assuming a normal stream");
                VariantKind::Normal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ProbeResponse;
    use crate::testing::RecordingTransport;
    use reqwest::StatusCode;
    use rstest::rstest;

    #[rstest]
    #[case(&["avc1.64001f", "mp4a.40.2"], Some(VariantKind::Normal))]
    #[case(&["hvc1.1.6.L93.B0"], Some(VariantKind::VideoOnly))]
    #[case(&["MP4A.40.5"], Some(VariantKind::AudioOnly))]
    #[case(&["ec-3", "opus"], Some(VariantKind::AudioOnly))]
    #[case(&["wvtt"], None)]
    #[case(&[], None)]
    fn codec_rule(#[case] codecs: &[&str], #[case] expected: Option<VariantKind>) {
        assert_eq!(classify_codecs(codecs), expected);
    }

    #[rstest]
    #[case("http://r.lan/radio.AAC?sid=1", Some(VariantKind::AudioOnly))]
    #[case("http://r.lan/radio/stream.mp3", Some(VariantKind::AudioOnly))]
    #[case("http://r.lan/movie.mkv", Some(VariantKind::Normal))]
    #[case("http://r.lan/live", None)]
    #[case("http://r.lan/", None)]
    fn extension_rule(#[case] url: &str, #[case] expected: Option<VariantKind>) {
        assert_eq!(classify_extension(&Url::parse(url).unwrap()), expected);
    }

    #[tokio::test]
    async fn codecs_win_without_network() {
        let transport = RecordingTransport::default();
        let stream = StreamDescriptor::new(Url::parse("http://r.lan/live").unwrap(), Route::Proxied)
            .with_codecs(vec!["mp4a.40.2".into()]);

        let kind = VariantDetector::new(&transport).detect(&stream).await;
        assert_eq!(kind, VariantKind::AudioOnly);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn probe_content_type_decides_last() {
        let url = Url::parse("http://r.lan/live").unwrap();
        let transport = RecordingTransport::default().with_probe(
            url.as_str(),
            ProbeResponse::new(StatusCode::PARTIAL_CONTENT).with_content_type("audio/mpeg"),
        );

        let kind = VariantDetector::new(&transport)
            .detect(&StreamDescriptor::new(url, Route::Proxied))
            .await;
        assert_eq!(kind, VariantKind::AudioOnly);

        let probes = transport.probes();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].range, Some(crate::http::PROBE_RANGE));
        assert_eq!(probes[0].route, Route::Proxied);
    }

    #[tokio::test]
    async fn probe_failure_means_normal() {
        let transport = RecordingTransport::default();
        let stream = StreamDescriptor::new(Url::parse("http://r.lan/live").unwrap(), Route::Direct);
        assert_eq!(
            VariantDetector::new(&transport).detect(&stream).await,
            VariantKind::Normal
        );
    }

    #[tokio::test]
    async fn known_content_type_skips_probe() {
        let transport = RecordingTransport::default();
        let stream = StreamDescriptor::new(Url::parse("http://r.lan/live").unwrap(), Route::Direct)
            .with_content_type(Some("video/mp2t".into()));
        assert_eq!(
            VariantDetector::new(&transport).detect(&stream).await,
            VariantKind::Normal
        );
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn hls_master_uses_highest_bandwidth_variant() {
        let playlist = b"#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,CODECS=\"avc1.4d401e,mp4a.40.2\"\n\
low.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=128000,CODECS=\"mp4a.40.2\"\n\
audio.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2400000,CODECS=\"avc1.64001f\"\n\
high.m3u8\n";
        assert_eq!(hls_master_codecs(playlist), vec!["avc1.64001f".to_string()]);
        assert_eq!(
            classify_codecs(&hls_master_codecs(playlist)),
            Some(VariantKind::VideoOnly)
        );
    }

    #[test]
    fn hls_media_playlist_has_no_codecs() {
        let playlist = b"#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg1.ts\n";
        assert!(hls_master_codecs(playlist).is_empty());
    }
}
