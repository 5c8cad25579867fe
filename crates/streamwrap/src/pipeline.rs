//! End-to-end relay: decide how to fetch a stream, then copy it to the sink.
//!
//! [`Relay::prepare`] runs every decision stage and fails before a single
//! media byte is written. [`Relay::run`] starts the processes the prepared
//! plan needs and pumps the result.

use std::fmt;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::bypass::{BypassResolver, ProxyDecision};
use crate::config::{RelayConfig, split_clearkey_fragment};
use crate::detect::{StreamDescriptor, VariantDetector, VariantKind, hls_master_codecs, variant_codecs};
use crate::error::{Error, Result};
use crate::http::{HttpTransport, ProbeRequest, Route};
use crate::keys::{ClearKeyTable, KeySet};
use crate::manifest::{Manifest, Representation};
use crate::mux::{self, MuxInput, MuxPlan, Muxer, TrackRole};
use crate::proxy::ProxyType;
use crate::pump::{PumpOutcome, PumpReport, pump};
use crate::selector::{RepresentationSelector, SelectionPolicy, Variant};
use crate::synthetic::{SyntheticKind, SyntheticTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Dash,
    Hls,
    MpegTs,
    Other,
}

impl StreamFormat {
    pub fn from_url(url: &Url) -> Option<Self> {
        let last = url.path_segments()?.next_back()?;
        let (_, ext) = last.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "mpd" => Some(Self::Dash),
            "m3u8" | "m3u" => Some(Self::Hls),
            "ts" => Some(Self::MpegTs),
            _ => None,
        }
    }

    pub fn from_content_type(content_type: &str) -> Self {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("dash+xml") {
            Self::Dash
        } else if content_type.contains("mpegurl") {
            Self::Hls
        } else if content_type.starts_with("video/mp2t") {
            Self::MpegTs
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dash => "dash",
            Self::Hls => "hls",
            Self::MpegTs => "mpegts",
            Self::Other => "generic",
        })
    }
}

/// How the output bytes are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelaySource {
    /// Body copied straight from HTTP.
    Passthrough { url: Url, route: Route },
    /// Output of a muxer process.
    Mux { plan: MuxPlan, args: Vec<String> },
}

/// Every decision made for a run.
#[derive(Debug, Clone)]
pub struct PreparedRelay {
    pub decision: ProxyDecision,
    pub format: StreamFormat,
    pub keys: KeySet,
    /// Chosen DASH variant name.
    pub variant: Option<String>,
    pub detected: Option<VariantKind>,
    pub synthetic: Option<SyntheticKind>,
    pub source: RelaySource,
}

impl PreparedRelay {
    pub fn url(&self) -> &Url {
        self.decision.url()
    }
}

pub struct Relay<T: ?Sized> {
    config: RelayConfig,
    transport: Arc<T>,
}

impl<T> Relay<T>
where
    T: HttpTransport + ?Sized,
{
    pub fn new(config: RelayConfig, transport: Arc<T>) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn prepare(&self) -> Result<PreparedRelay> {
        self.config.validate()?;

        let (raw_url, inline_keys) = split_clearkey_fragment(&self.config.input);
        let raw_url = raw_url.trim();
        let url = Url::parse(raw_url).map_err(|e| Error::invalid_url(raw_url, e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::invalid_url(raw_url, "only http and https are supported"));
        }

        let keys = self.resolve_keys(&url, inline_keys).await?;
        if !keys.is_empty() {
            if self.config.overrides.any() {
                return Err(Error::configuration(
                    "variant overrides cannot be combined with decryption keys",
                ));
            }
            info!(keys = keys.len(), "Decryption keys available");
        }

        let decision = self.resolve_route(&url).await?;
        let target = decision.url().clone();
        let route = decision.route();

        let (format, content_type) = if !keys.is_empty() {
            (StreamFormat::Dash, None)
        } else if let Some(format) = StreamFormat::from_url(&target) {
            (format, None)
        } else {
            self.probe_format(&target, route).await
        };
        info!(url = %target, %format, route = ?route, "Stream classified");

        let prepared = match format {
            StreamFormat::Dash => self.prepare_dash(decision, keys).await?,
            StreamFormat::Hls => self.prepare_hls(decision).await?,
            StreamFormat::MpegTs | StreamFormat::Other => {
                self.prepare_generic(decision, format, content_type).await?
            }
        };

        if let RelaySource::Mux { args, .. } = &prepared.source {
            debug!(args = %mux::redacted(args), "Muxer command prepared");
        }
        Ok(prepared)
    }

    /// Produce the stream into `sink` until the source ends, the consumer
    /// goes away or `token` is cancelled.
    pub async fn run<W>(&self, prepared: PreparedRelay, sink: W, token: &CancellationToken) -> Result<PumpReport>
    where
        W: AsyncWrite + Unpin,
    {
        match prepared.source {
            RelaySource::Passthrough { url, route } => {
                info!(url = %url, "Relaying stream without remuxing");
                let body = self.transport.open(&url, route).await?;
                Ok(pump(body, sink, token).await?)
            }
            RelaySource::Mux { plan, args } => self.run_muxer(&plan, &args, sink, token).await,
        }
    }

    async fn run_muxer<W>(&self, plan: &MuxPlan, args: &[String], sink: W, token: &CancellationToken) -> Result<PumpReport>
    where
        W: AsyncWrite + Unpin,
    {
        let program = self.config.ffmpeg_path.as_str();

        let mut generator = plan
            .generated()
            .map(|kind| SyntheticTrack::spawn(kind, program, &self.config.synthetic))
            .transpose()?;
        let feed = generator.as_mut().and_then(SyntheticTrack::take_output);

        let mut muxer = Muxer::spawn(program, args, feed)?;
        let output = muxer
            .take_output()
            .ok_or_else(|| Error::process("muxer stdout is not available"))?;

        let result = pump(output, sink, token).await;

        let status = muxer.shutdown().await;
        if let Some(generator) = generator {
            generator.close().await;
        }

        let report = result?;
        if report.outcome == PumpOutcome::EndOfStream
            && report.bytes == 0
            && let Some(status) = status.filter(|s| !s.success())
        {
            return Err(Error::process(format!(
                "muxer exited with {status} before producing output"
            )));
        }
        Ok(report)
    }

    async fn resolve_keys(&self, url: &Url, inline: Option<&str>) -> Result<KeySet> {
        if let Some(raw) = inline {
            debug!("Using keys from the URL fragment");
            return KeySet::parse(raw);
        }
        if let Some(source) = &self.config.clearkeys {
            let table = ClearKeyTable::load(source, self.transport.as_ref()).await?;
            if let Some(raw) = table.lookup(url.as_str()) {
                return KeySet::parse(raw);
            }
        }
        Ok(KeySet::empty())
    }

    async fn resolve_route(&self, url: &Url) -> Result<ProxyDecision> {
        let use_proxy = ProxyDecision::UseProxy { url: url.clone() };
        if self.config.proxy.is_none() {
            return Ok(use_proxy);
        }
        let list = self.config.bypass_list()?;
        if list.is_empty() {
            return Ok(use_proxy);
        }
        Ok(BypassResolver::new(&list, self.transport.as_ref())
            .resolve(url)
            .await)
    }

    async fn probe_format(&self, url: &Url, route: Route) -> (StreamFormat, Option<String>) {
        match self
            .transport
            .probe(ProbeRequest::content_type(url.clone(), route))
            .await
        {
            Ok(response) => {
                let format = response
                    .content_type
                    .as_deref()
                    .map_or(StreamFormat::Other, StreamFormat::from_content_type);
                (format, response.content_type)
            }
            Err(e) => {
                warn!(error = %e, "Could not probe stream format");
                (StreamFormat::Other, None)
            }
        }
    }

    async fn detect(&self, stream: &StreamDescriptor) -> Option<VariantKind> {
        if !self.config.overrides.requires_detection() {
            return None;
        }
        let kind = VariantDetector::new(self.transport.as_ref()).detect(stream).await;
        info!(kind = ?kind, "Variant detected");
        Some(kind)
    }

    async fn prepare_dash(&self, decision: ProxyDecision, keys: KeySet) -> Result<PreparedRelay> {
        let route = decision.route();
        let document = self.transport.fetch(decision.url(), route).await?;
        let manifest = Manifest::parse(&document.body, document.url.clone())?;
        info!(
            dynamic = manifest.is_dynamic(),
            periods = manifest.periods.len(),
            minimum_update_period = manifest.minimum_update_period.as_deref().unwrap_or("-"),
            suggested_presentation_delay = manifest.suggested_presentation_delay.as_deref().unwrap_or("-"),
            "Loaded DASH manifest"
        );

        let period = manifest.period(&self.config.period)?;
        let selector = RepresentationSelector::new(SelectionPolicy {
            keys_available: !keys.is_empty(),
            include_subtitles: self.config.include_subtitles,
            language: self.config.language.clone(),
        });
        let variants = selector.select(period, decision.url().as_str())?;
        debug!(variants = ?variants.names().collect::<Vec<_>>(), "Available variants");

        let (name, variant) = variants.select(&self.config.variant)?;
        info!(variant = name, bandwidth = variant.bandwidth(), "Selected variant");

        let stream = StreamDescriptor::new(decision.url().clone(), route)
            .with_codecs(variant_codecs(variant));
        let detected = self.detect(&stream).await;
        let synthetic = self
            .config
            .overrides
            .synthetic_for(detected)
            .filter(|kind| match kind {
                SyntheticKind::BlankVideo => variant.video.is_none(),
                SyntheticKind::SilentAudio => variant.audio.is_none(),
            });

        let plan = dash_plan(variant, &manifest.url, route, synthetic)?;
        let name = name.to_string();
        Ok(self.mux_relay(decision, StreamFormat::Dash, keys, plan, Some(name), detected, synthetic))
    }

    async fn prepare_hls(&self, decision: ProxyDecision) -> Result<PreparedRelay> {
        let route = decision.route();
        let mut stream = StreamDescriptor::new(decision.url().clone(), route);
        if self.config.overrides.requires_detection() {
            let playlist = self.transport.fetch(decision.url(), route).await?;
            stream = stream
                .with_codecs(hls_master_codecs(&playlist.body))
                .with_content_type(playlist.content_type);
        }

        let detected = self.detect(&stream).await;
        let synthetic = self.config.overrides.synthetic_for(detected);

        let mut plan = MuxPlan::new();
        plan.push(
            MuxInput::remote(primary_role(detected), decision.url().clone(), route)
                .with_live_start_index(self.config.hls_live_edge.map(|edge| -edge)),
        );
        if let Some(kind) = synthetic {
            plan.push(MuxInput::generated(kind));
        }

        Ok(self.mux_relay(decision, StreamFormat::Hls, KeySet::empty(), plan, None, detected, synthetic))
    }

    async fn prepare_generic(
        &self,
        decision: ProxyDecision,
        format: StreamFormat,
        content_type: Option<String>,
    ) -> Result<PreparedRelay> {
        let route = decision.route();
        let stream = StreamDescriptor::new(decision.url().clone(), route).with_content_type(content_type);
        let detected = self.detect(&stream).await;
        let synthetic = self.config.overrides.synthetic_for(detected);

        if format == StreamFormat::MpegTs && synthetic.is_none() {
            return Ok(PreparedRelay {
                source: RelaySource::Passthrough {
                    url: decision.url().clone(),
                    route,
                },
                decision,
                format,
                keys: KeySet::empty(),
                variant: None,
                detected,
                synthetic,
            });
        }

        let mut plan = MuxPlan::new();
        plan.push(MuxInput::remote(primary_role(detected), decision.url().clone(), route));
        if let Some(kind) = synthetic {
            plan.push(MuxInput::generated(kind));
        }

        Ok(self.mux_relay(decision, format, KeySet::empty(), plan, None, detected, synthetic))
    }

    #[allow(clippy::too_many_arguments)]
    fn mux_relay(
        &self,
        decision: ProxyDecision,
        format: StreamFormat,
        keys: KeySet,
        plan: MuxPlan,
        variant: Option<String>,
        detected: Option<VariantKind>,
        synthetic: Option<SyntheticKind>,
    ) -> PreparedRelay {
        let proxy = self.config.proxy.as_ref();
        if decision.uses_proxy() && proxy.is_some_and(|p| p.proxy_type == ProxyType::Socks5) {
            warn!("The muxer cannot use a SOCKS proxy, its inputs connect directly");
        }

        let args = mux::build_command(
            &plan,
            &self.config.request_context(),
            proxy,
            &keys,
            &self.config.mux,
        );

        PreparedRelay {
            decision,
            format,
            keys,
            variant,
            detected,
            synthetic,
            source: RelaySource::Mux { plan, args },
        }
    }
}

fn primary_role(detected: Option<VariantKind>) -> TrackRole {
    match detected {
        Some(VariantKind::AudioOnly) => TrackRole::Audio,
        _ => TrackRole::Video,
    }
}

fn dash_plan(
    variant: &Variant<'_>,
    manifest_url: &Url,
    route: Route,
    synthetic: Option<SyntheticKind>,
) -> Result<MuxPlan> {
    let track = |rep: &Representation, role| track_input(rep, role, manifest_url, route);
    let mut plan = MuxPlan::new();

    if let Some(video) = variant.video {
        plan.push(track(video, TrackRole::Video)?);
    }
    if let Some(audio) = variant.audio {
        plan.push(track(audio, TrackRole::Audio)?);
    }
    let primary_audio = variant.audio.map(|a| &a.ident);
    for audio in &variant.audio_tracks {
        if Some(&audio.ident) != primary_audio {
            plan.push(track(audio, TrackRole::Audio)?);
        }
    }
    if variant.video.is_some() {
        for subtitle in &variant.subtitle_tracks {
            plan.push(track(subtitle, TrackRole::Subtitle)?);
        }
    }
    if let Some(kind) = synthetic {
        plan.push(MuxInput::generated(kind));
    }
    Ok(plan)
}

/// Segmented representations are read through the manifest, one mapped
/// stream per input. Others are read from their own BaseURL.
fn track_input(rep: &Representation, role: TrackRole, manifest_url: &Url, route: Route) -> Result<MuxInput> {
    let input = if rep.segmented {
        MuxInput::remote(role, manifest_url.clone(), route).with_stream(rep.stream_index)
    } else {
        let url = rep.base_url.clone().ok_or_else(|| {
            Error::setup(format!(
                "{} representation {} has neither a BaseURL nor segment addressing",
                rep.media_type, rep.ident.id
            ))
        })?;
        MuxInput::remote(role, url, route)
    };
    Ok(input.with_language(rep.lang.clone()))
}
