use url::Url;

use super::args::MuxArg;
use crate::http::{RequestContext, Route};
use crate::proxy::{ProxyConfig, ProxyType};
use crate::synthetic::SyntheticKind;

/// Locator the muxer reads a generated track from.
pub const GENERATED_INPUT: &str = "pipe:0";
/// Locator the muxer writes to.
pub const OUTPUT_SINK: &str = "pipe:1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackRole {
    Video,
    Audio,
    Subtitle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Remote { url: Url, route: Route },
    Generated(SyntheticKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxInput {
    pub role: TrackRole,
    pub source: InputSource,
    pub language: Option<String>,
    /// Playlist position to start a live HLS input at.
    pub live_start_index: Option<i32>,
    /// Which stream of the input's `role` to map, for inputs carrying several.
    pub stream: Option<usize>,
}

impl MuxInput {
    pub fn remote(role: TrackRole, url: Url, route: Route) -> Self {
        Self {
            role,
            source: InputSource::Remote { url, route },
            language: None,
            live_start_index: None,
            stream: None,
        }
    }

    pub fn generated(kind: SyntheticKind) -> Self {
        let role = match kind {
            SyntheticKind::BlankVideo => TrackRole::Video,
            SyntheticKind::SilentAudio => TrackRole::Audio,
        };
        Self {
            role,
            source: InputSource::Generated(kind),
            language: None,
            live_start_index: None,
            stream: None,
        }
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    pub fn with_live_start_index(mut self, index: Option<i32>) -> Self {
        self.live_start_index = index;
        self
    }

    pub fn with_stream(mut self, stream: usize) -> Self {
        self.stream = Some(stream);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxSettings {
    pub loglevel: String,
    pub output_format: String,
    pub copy_timestamps: bool,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            loglevel: "error".to_string(),
            output_format: "mpegts".to_string(),
            copy_timestamps: true,
        }
    }
}

/// Ordered muxer inputs: primary track first, then the ride-along tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxPlan {
    inputs: Vec<MuxInput>,
}

impl MuxPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, input: MuxInput) -> &mut Self {
        self.inputs.push(input);
        self
    }

    pub fn inputs(&self) -> &[MuxInput] {
        &self.inputs
    }

    pub fn has_subtitles(&self) -> bool {
        self.inputs.iter().any(|i| i.role == TrackRole::Subtitle)
    }

    pub fn generated(&self) -> Option<SyntheticKind> {
        self.inputs.iter().find_map(|i| match i.source {
            InputSource::Generated(kind) => Some(kind),
            InputSource::Remote { .. } => None,
        })
    }

    /// Base command template, before per-input keys and timestamp flags are spliced in.
    pub fn template(
        &self,
        request: &RequestContext,
        proxy: Option<&ProxyConfig>,
        settings: &MuxSettings,
    ) -> Vec<MuxArg> {
        let mut args = vec![
            MuxArg::flag("-hide_banner"),
            MuxArg::option("-loglevel", settings.loglevel.clone()),
        ];
        if self.generated().is_none() {
            args.push(MuxArg::flag("-nostdin"));
        }

        for input in &self.inputs {
            match &input.source {
                InputSource::Remote { url, route } => {
                    args.push(MuxArg::option("-user_agent", request.user_agent.clone()));
                    if let Some(block) = request.header_block_for(url) {
                        args.push(MuxArg::option("-headers", block));
                    }
                    if *route == Route::Proxied
                        && let Some(proxy) = proxy.filter(|p| p.proxy_type != ProxyType::Socks5)
                    {
                        args.push(MuxArg::option("-http_proxy", proxy.url_with_auth()));
                    }
                    if let Some(index) = input.live_start_index {
                        args.push(MuxArg::option("-live_start_index", index.to_string()));
                    }
                    args.push(MuxArg::input(url.as_str()));
                }
                InputSource::Generated(_) => {
                    args.push(MuxArg::option("-f", "mpegts"));
                    args.push(MuxArg::generated_input(GENERATED_INPUT));
                }
            }
        }

        let mut audio_index = 0;
        let mut subtitle_index = 0;
        for (n, input) in self.inputs.iter().enumerate() {
            let selector = match input.role {
                TrackRole::Video => "v",
                TrackRole::Audio => "a",
                TrackRole::Subtitle => "s",
            };
            match input.stream {
                Some(stream) => args.push(MuxArg::option("-map", format!("{n}:{selector}:{stream}"))),
                None if n == 0 => {
                    args.push(MuxArg::option("-map", "0:v?"));
                    args.push(MuxArg::option("-map", "0:a?"));
                }
                None => args.push(MuxArg::option("-map", format!("{n}:{selector}"))),
            }

            match input.role {
                TrackRole::Audio => {
                    if let Some(lang) = &input.language {
                        args.push(MuxArg::option(
                            &format!("-metadata:s:a:{audio_index}"),
                            format!("language={lang}"),
                        ));
                    }
                    audio_index += 1;
                }
                TrackRole::Subtitle => {
                    if let Some(lang) = &input.language {
                        args.push(MuxArg::option(
                            &format!("-metadata:s:s:{subtitle_index}"),
                            format!("language={lang}"),
                        ));
                    }
                    subtitle_index += 1;
                }
                TrackRole::Video => {}
            }
        }

        args.push(MuxArg::option("-c:v", "copy"));
        args.push(MuxArg::option("-c:a", "copy"));
        args.push(MuxArg::option("-f", settings.output_format.clone()));
        args.push(MuxArg::output(OUTPUT_SINK));
        args
    }
}
