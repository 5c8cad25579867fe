use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use streamwrap_engine::http::DEFAULT_USER_AGENT;
use streamwrap_engine::{
    BEST, ClearKeySource, CookieJar, PeriodSelector, ProxyConfig, RelayConfig, VariantOverrides,
};
use tracing::Level;

use crate::AppError;

/// Re-broadcast a DASH, HLS or direct stream as MPEG-TS on stdout.
#[derive(Parser, Debug)]
#[command(name = "streamwrap", version, about, long_about = None)]
pub struct Args {
    /// Stream URL. Keys may be appended as `#clearkey=KID:KEY,...`
    #[arg(short = 'i', long = "input", value_name = "URL")]
    pub input: String,

    /// User agent for every request, including the muxer's
    #[arg(long = "ua", alias = "user-agent", env = "STREAMWRAP_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Extra request header, `Name: Value`. May be repeated
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Proxy URL (http, https or socks5)
    #[arg(long, env = "STREAMWRAP_PROXY")]
    pub proxy: Option<String>,

    /// Comma-separated hosts reached without the proxy, e.g. `*.lan,10.0.0.*,cdn.example.com:8443`
    #[arg(long = "proxy-bypass", env = "STREAMWRAP_PROXY_BYPASS", requires = "proxy")]
    pub proxy_bypass: Option<String>,

    /// JSON file or URL mapping stream URL patterns to keys
    #[arg(long, env = "STREAMWRAP_CLEARKEYS")]
    pub clearkeys: Option<String>,

    /// Netscape cookies.txt file
    #[arg(long, value_name = "FILE")]
    pub cookies: Option<PathBuf>,

    /// Mux subtitle tracks when the stream has video
    #[arg(long)]
    pub subtitles: bool,

    /// The stream has no video, generate a blank picture
    #[arg(long = "no-video")]
    pub no_video: bool,

    /// The stream has no audio, generate silence
    #[arg(long = "no-audio")]
    pub no_audio: bool,

    /// Skip audio/video detection and relay as is
    #[arg(long = "no-variant-check")]
    pub no_variant_check: bool,

    /// DASH variant name, `best` or `worst`
    #[arg(long, default_value = BEST)]
    pub variant: String,

    /// DASH period, by index or id
    #[arg(long, default_value = "0")]
    pub period: PeriodSelector,

    /// Preferred audio language, e.g. `en` or `deu`
    #[arg(long)]
    pub language: Option<String>,

    /// Live HLS start position, in segments from the live edge. 0 starts at the muxer's default
    #[arg(long = "live-edge", default_value_t = streamwrap_engine::config::DEFAULT_HLS_LIVE_EDGE)]
    pub live_edge: i32,

    /// Do not carry source timestamps into the output
    #[arg(long = "no-copyts")]
    pub no_copyts: bool,

    /// ffmpeg binary
    #[arg(long, env = "STREAMWRAP_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: String,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Notset,
}

impl LogLevel {
    pub fn as_tracing(self) -> Level {
        match self {
            Self::Critical | Self::Error => Level::ERROR,
            Self::Warning => Level::WARN,
            Self::Info => Level::INFO,
            Self::Debug => Level::DEBUG,
            Self::Notset => Level::TRACE,
        }
    }

    /// ffmpeg's own `-loglevel`. Its stderr is relayed at debug, so it
    /// stays one step quieter than ours.
    pub fn ffmpeg_level(self) -> &'static str {
        match self {
            Self::Critical => "fatal",
            Self::Error => "error",
            Self::Warning | Self::Info => "warning",
            Self::Debug => "info",
            Self::Notset => "debug",
        }
    }
}

impl Args {
    pub async fn into_config(self) -> Result<RelayConfig, AppError> {
        let mut config = RelayConfig::new(self.input);
        config.user_agent = self.user_agent;
        for header in &self.headers {
            config = config.with_header(header)?;
        }
        if let Some(path) = &self.cookies {
            config.cookies = CookieJar::load(path).await?;
        }

        if let Some(raw) = &self.proxy {
            config.proxy = Some(ProxyConfig::parse(raw)?);
        }
        config.proxy_bypass = self.proxy_bypass;
        if let Some(raw) = &self.clearkeys {
            config.clearkeys = Some(ClearKeySource::parse(raw)?);
        }

        config.include_subtitles = self.subtitles;
        config.overrides = VariantOverrides {
            force_no_video: self.no_video,
            force_no_audio: self.no_audio,
            skip_variant_check: self.no_variant_check,
        };
        config.variant = self.variant;
        config.period = self.period;
        config.language = self.language;
        config.hls_live_edge = (self.live_edge > 0).then_some(self.live_edge);

        config.ffmpeg_path = self.ffmpeg;
        config.mux.loglevel = self.loglevel.ffmpeg_level().to_string();
        config.mux.copy_timestamps = !self.no_copyts;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use streamwrap_engine::{ErrorKind, ProxyType};

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("streamwrap").chain(args.iter().copied()))
    }

    #[tokio::test]
    async fn defaults() {
        let config = parse(&["-i", "https://a/x.mpd"]).unwrap().into_config().await.unwrap();
        assert_eq!(config.variant, BEST);
        assert_eq!(config.period, PeriodSelector::Index(0));
        assert_eq!(config.hls_live_edge, Some(6));
        assert!(config.mux.copy_timestamps);
        assert!(config.proxy.is_none());
        assert!(!config.overrides.any());
    }

    #[tokio::test]
    async fn full_mapping() {
        let mut cookies = tempfile::NamedTempFile::new().unwrap();
        writeln!(cookies, ".example.com\tTRUE\t/\tFALSE\t0\tsid\tabc").unwrap();
        let cookie_path = cookies.path().to_str().unwrap().to_string();

        let config = parse(&[
            "-i",
            "https://cdn.example.com/live/index.m3u8",
            "--ua",
            "Agent/2",
            "-H",
            "Referer: https://example.com/",
            "--proxy",
            "socks5://user:pw@proxy.lan:1080",
            "--proxy-bypass",
            "*.lan",
            "--clearkeys",
            "https://keys.example.com/keys.json",
            "--cookies",
            &cookie_path,
            "--subtitles",
            "--no-audio",
            "--variant",
            "720p",
            "--period",
            "main",
            "--language",
            "fr",
            "--live-edge",
            "0",
            "--no-copyts",
            "--ffmpeg",
            "/opt/ffmpeg",
            "--loglevel",
            "debug",
        ])
        .unwrap()
        .into_config()
        .await
        .unwrap();

        assert_eq!(config.user_agent, "Agent/2");
        assert!(config.headers.contains_key("referer"));
        assert_eq!(config.cookies.len(), 1);
        assert_eq!(config.proxy.as_ref().unwrap().proxy_type, ProxyType::Socks5);
        assert_eq!(config.proxy_bypass.as_deref(), Some("*.lan"));
        assert!(matches!(config.clearkeys, Some(ClearKeySource::Url(_))));
        assert!(config.include_subtitles);
        assert!(config.overrides.force_no_audio);
        assert_eq!(config.variant, "720p");
        assert_eq!(config.period, PeriodSelector::Id("main".into()));
        assert_eq!(config.language.as_deref(), Some("fr"));
        assert_eq!(config.hls_live_edge, None);
        assert!(!config.mux.copy_timestamps);
        assert_eq!(config.ffmpeg_path, "/opt/ffmpeg");
        assert_eq!(config.mux.loglevel, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bypass_requires_a_proxy() {
        assert!(parse(&["-i", "http://a/x.ts", "--proxy-bypass", "*.lan"]).is_err());
    }

    #[tokio::test]
    async fn conflicting_overrides_fail_validation() {
        let config = parse(&["-i", "http://a/x.ts", "--no-video", "--no-variant-check"])
            .unwrap()
            .into_config()
            .await
            .unwrap();
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[rstest]
    #[case("critical", Level::ERROR)]
    #[case("warning", Level::WARN)]
    #[case("info", Level::INFO)]
    #[case("notset", Level::TRACE)]
    fn log_levels(#[case] raw: &str, #[case] expected: Level) {
        let args = parse(&["-i", "http://a/x.ts", "--loglevel", raw]).unwrap();
        assert_eq!(args.loglevel.as_tracing(), expected);
    }
}
