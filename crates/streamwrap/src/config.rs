//! Run configuration for a single relay.


use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::bypass::BypassList;
use crate::cookies::CookieJar;
use crate::error::{Error, Result};
use crate::http::{DEFAULT_USER_AGENT, HttpSettings, RequestContext};
use crate::keys::ClearKeySource;
use crate::manifest::PeriodSelector;
use crate::mux::MuxSettings;
use crate::proxy::ProxyConfig;
use crate::selector::BEST;
use crate::synthetic::{SyntheticSettings, VariantOverrides};

/// Fragment marker carrying inline keys, e.g. `https://x/a.mpd#clearkey=kid:key`.
pub const CLEARKEY_FRAGMENT: &str = "#clearkey=";

/// Default playlist position for live HLS inputs, counted from the live edge.
pub const DEFAULT_HLS_LIVE_EDGE: i32 = 6;

/// Split inline keys off an input URL.
pub fn split_clearkey_fragment(input: &str) -> (&str, Option<&str>) {
    match input.find(CLEARKEY_FRAGMENT) {
        Some(at) => {
            let keys = &input[at + CLEARKEY_FRAGMENT.len()..];
            (&input[..at], (!keys.is_empty()).then_some(keys))
        }
        None => (input, None),
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Stream URL, optionally carrying a `#clearkey=` fragment.
    pub input: String,
    pub user_agent: String,
    pub headers: HeaderMap,
    pub cookies: CookieJar,
    pub proxy: Option<ProxyConfig>,
    /// Raw comma-separated host patterns.
    pub proxy_bypass: Option<String>,
    pub clearkeys: Option<ClearKeySource>,
    pub include_subtitles: bool,
    pub overrides: VariantOverrides,
    /// Variant name, [`BEST`] by default.
    pub variant: String,
    pub period: PeriodSelector,
    pub language: Option<String>,
    pub hls_live_edge: Option<i32>,
    pub ffmpeg_path: String,
    pub mux: MuxSettings,
    pub synthetic: SyntheticSettings,
    pub http: HttpSettings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            input: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: HeaderMap::new(),
            cookies: CookieJar::default(),
            proxy: None,
            proxy_bypass: None,
            clearkeys: None,
            include_subtitles: false,
            overrides: VariantOverrides::default(),
            variant: BEST.to_string(),
            period: PeriodSelector::default(),
            language: None,
            hls_live_edge: Some(DEFAULT_HLS_LIVE_EDGE),
            ffmpeg_path: "ffmpeg".to_string(),
            mux: MuxSettings::default(),
            synthetic: SyntheticSettings::default(),
            http: HttpSettings::default(),
        }
    }
}

impl RelayConfig {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_proxy_bypass(mut self, patterns: impl Into<String>) -> Self {
        self.proxy_bypass = Some(patterns.into());
        self
    }

    pub fn with_clearkeys(mut self, source: ClearKeySource) -> Self {
        self.clearkeys = Some(source);
        self
    }

    pub fn with_overrides(mut self, overrides: VariantOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    pub fn with_period(mut self, period: PeriodSelector) -> Self {
        self.period = period;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_subtitles(mut self, include: bool) -> Self {
        self.include_subtitles = include;
        self
    }

    /// Add a request header given as `Name: Value`.
    pub fn with_header(mut self, raw: &str) -> Result<Self> {
        let (name, value) = raw.split_once(':').ok_or_else(|| {
            Error::configuration(format!("header `{raw}` is not in `Name: Value` form"))
        })?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| Error::configuration(format!("invalid header name in `{raw}`: {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| Error::configuration(format!("invalid header value in `{raw}`: {e}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn request_context(&self) -> RequestContext {
        RequestContext {
            user_agent: self.user_agent.clone(),
            headers: self.headers.clone(),
            cookies: self.cookies.clone(),
        }
    }

    /// Parsed bypass list, empty when none is configured.
    pub fn bypass_list(&self) -> Result<BypassList> {
        match self.proxy_bypass.as_deref() {
            Some(raw) => BypassList::parse(raw),
            None => Ok(BypassList::default()),
        }
    }

    /// Reject combinations that cannot be honoured. Runs before any network
    /// activity.
    pub fn validate(&self) -> Result<()> {
        let (url, inline_keys) = split_clearkey_fragment(&self.input);
        if url.trim().is_empty() {
            return Err(Error::configuration("no input URL given"));
        }

        if self.overrides.conflicting() {
            return Err(Error::configuration(
                "--no-video, --no-audio and --no-variant-check are mutually exclusive",
            ));
        }
        if self.overrides.any() && inline_keys.is_some() {
            return Err(Error::configuration(
                "variant overrides cannot be combined with decryption keys",
            ));
        }

        if let Some(raw) = self.proxy_bypass.as_deref() {
            if self.proxy.is_none() {
                return Err(Error::configuration("--proxy-bypass requires --proxy"));
            }
            validate_bypass_patterns(raw)?;
        }

        if self.variant.trim().is_empty() {
            return Err(Error::configuration("variant name is empty"));
        }

        debug!("Configuration validated");
        Ok(())
    }
}

fn validate_bypass_patterns(raw: &str) -> Result<()> {
    let entry = Regex::new(r"^\.?[A-Za-z0-9*?\[\]!.\-]+(:\d{1,5})?$")
        .map_err(|e| Error::configuration(e.to_string()))?;

    let mut seen = 0;
    for pattern in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if !entry.is_match(pattern) {
            return Err(Error::configuration(format!(
                "invalid proxy bypass pattern `{pattern}`"
            )));
        }
        seen += 1;
    }
    if seen == 0 {
        return Err(Error::configuration("proxy bypass list is empty"));
    }
    BypassList::parse(raw).map(|_| ())
}
