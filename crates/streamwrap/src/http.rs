//! Network collaborator used by every decision stage.
//!
//! The engine talks to the network only through [`HttpTransport`], so tests
//! can substitute a recording fake and assert exactly which requests happen.

use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode, redirect};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use url::Url;

use crate::cookies::CookieJar;
use crate::error::{Error, Result};
use crate::proxy::{ProxyConfig, build_proxy_from_config};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Byte range requested by classification probes.
pub const PROBE_RANGE: &str = "bytes=0-1023";

/// Redirect limit for requests that follow redirects.
pub const MAX_REDIRECTS: usize = 10;

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Whether a request goes through the configured proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Through the configured proxy, or direct when none is configured.
    Proxied,
    /// Never through a proxy.
    Direct,
}

/// A single metadata request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub url: Url,
    pub route: Route,
    pub follow_redirects: bool,
    /// Value for the `Range` header.
    pub range: Option<&'static str>,
}

impl ProbeRequest {
    /// Direct probe that reports redirects instead of following them.
    pub fn reachability(url: Url) -> Self {
        Self {
            url,
            route: Route::Direct,
            follow_redirects: false,
            range: None,
        }
    }

    /// Ranged probe used to learn the content type of a resource.
    pub fn content_type(url: Url, route: Route) -> Self {
        Self {
            url,
            route,
            follow_redirects: true,
            range: Some(PROBE_RANGE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: StatusCode,
    /// Raw `Location` header, possibly relative.
    pub location: Option<String>,
    pub content_type: Option<String>,
}

impl ProbeResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            location: None,
            content_type: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// A probe that produced no HTTP response at all.
#[derive(Debug, Clone, thiserror::Error)]
#[error("probe of {url} failed: {reason}")]
pub struct ProbeFailure {
    pub url: String,
    pub reason: String,
}

/// A small document such as a manifest or a playlist.
#[derive(Debug, Clone)]
pub struct Document {
    /// Final URL after redirects, the base for relative references.
    pub url: Url,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn probe(&self, request: ProbeRequest) -> Result<ProbeResponse, ProbeFailure>;

    async fn fetch(&self, url: &Url, route: Route) -> Result<Document>;

    async fn open(&self, url: &Url, route: Route) -> Result<ByteStream>;
}

/// Request identity shared by the HTTP client and the muxer inputs.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user_agent: String,
    pub headers: HeaderMap,
    pub cookies: CookieJar,
}

impl RequestContext {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            headers: HeaderMap::new(),
            cookies: CookieJar::default(),
        }
    }

    /// Extra headers for a request to `url`: the configured ones plus cookies.
    pub fn headers_for(&self, url: &Url) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(cookie) = self.cookies.header_for(url)
            && let Ok(value) = HeaderValue::from_str(&cookie)
        {
            headers.insert(header::COOKIE, value);
        }
        headers
    }

    /// Headers rendered as a CRLF-terminated block, the muxer's `-headers` format.
    pub fn header_block_for(&self, url: &Url) -> Option<String> {
        let headers = self.headers_for(url);
        let block: String = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| format!("{}: {v}\r\n", canonical_name(name)))
            })
            .collect();
        (!block.is_empty()).then_some(block)
    }
}

fn canonical_name(name: &HeaderName) -> String {
    name.as_str()
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

pub fn get_default_headers() -> HeaderMap {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    default_headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.5"),
    );
    default_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    default_headers
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub connect_timeout: Duration,
    /// Timeout for probes.
    pub probe_timeout: Duration,
    /// Timeout for manifest and key-table downloads. Media streams have none.
    pub fetch_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// reqwest-backed [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpSession {
    proxied: Client,
    proxied_no_redirect: Client,
    direct: Client,
    direct_no_redirect: Client,
    context: Arc<RequestContext>,
    settings: HttpSettings,
}

impl HttpSession {
    pub fn new(
        context: Arc<RequestContext>,
        proxy: Option<&ProxyConfig>,
        settings: HttpSettings,
    ) -> Result<Self> {
        install_rustls_provider();

        if let Some(proxy) = proxy {
            info!(proxy_url = %proxy.url, "Using explicitly configured proxy");
        }

        Ok(Self {
            proxied: create_client(&context, proxy, true, &settings)?,
            proxied_no_redirect: create_client(&context, proxy, false, &settings)?,
            direct: create_client(&context, None, true, &settings)?,
            direct_no_redirect: create_client(&context, None, false, &settings)?,
            context,
            settings,
        })
    }

    fn client(&self, route: Route, follow_redirects: bool) -> &Client {
        match (route, follow_redirects) {
            (Route::Proxied, true) => &self.proxied,
            (Route::Proxied, false) => &self.proxied_no_redirect,
            (Route::Direct, true) => &self.direct,
            (Route::Direct, false) => &self.direct_no_redirect,
        }
    }
}

fn create_client(
    context: &RequestContext,
    proxy: Option<&ProxyConfig>,
    follow_redirects: bool,
    settings: &HttpSettings,
) -> Result<Client> {
    let mut builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&context.user_agent)
        .default_headers(get_default_headers())
        .redirect(if follow_redirects {
            redirect::Policy::limited(MAX_REDIRECTS)
        } else {
            redirect::Policy::none()
        });

    if !settings.connect_timeout.is_zero() {
        builder = builder.connect_timeout(settings.connect_timeout);
    }

    builder = match proxy {
        Some(proxy) => builder.proxy(build_proxy_from_config(proxy)?),
        // Environment proxies never apply, a direct route means direct.
        None => builder.no_proxy(),
    };

    builder.build().map_err(Error::from)
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl HttpTransport for HttpSession {
    async fn probe(&self, request: ProbeRequest) -> Result<ProbeResponse, ProbeFailure> {
        let mut builder = self
            .client(request.route, request.follow_redirects)
            .get(request.url.clone())
            .headers(self.context.headers_for(&request.url));
        if let Some(range) = request.range {
            builder = builder.header(header::RANGE, range);
        }
        if !self.settings.probe_timeout.is_zero() {
            builder = builder.timeout(self.settings.probe_timeout);
        }

        debug!(url = %request.url, route = ?request.route, "Probing");
        let response = builder.send().await.map_err(|e| ProbeFailure {
            url: request.url.to_string(),
            reason: e.to_string(),
        })?;

        // Only the head matters, the body is dropped unread.
        Ok(ProbeResponse {
            status: response.status(),
            location: header_string(response.headers(), header::LOCATION),
            content_type: header_string(response.headers(), header::CONTENT_TYPE),
        })
    }

    async fn fetch(&self, url: &Url, route: Route) -> Result<Document> {
        let mut builder = self
            .client(route, true)
            .get(url.clone())
            .headers(self.context.headers_for(url));
        if !self.settings.fetch_timeout.is_zero() {
            builder = builder.timeout(self.settings.fetch_timeout);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(Error::http_status(response.status(), url.as_str(), "fetch"));
        }

        let final_url = response.url().clone();
        let content_type = header_string(response.headers(), header::CONTENT_TYPE);
        let body = response.bytes().await?;
        debug!(url = %final_url, bytes = body.len(), "Fetched document");

        Ok(Document {
            url: final_url,
            content_type,
            body,
        })
    }

    async fn open(&self, url: &Url, route: Route) -> Result<ByteStream> {
        let response = self
            .client(route, true)
            .get(url.clone())
            .headers(self.context.headers_for(url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::http_status(response.status(), url.as_str(), "open"));
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::CookieJar;

    fn context_with_cookie() -> RequestContext {
        let mut context = RequestContext::new("TestAgent/1.0");
        context.cookies =
            CookieJar::parse(".example.com\tTRUE\t/\tFALSE\t0\tsid\t42\n").unwrap();
        context
            .headers
            .insert("x-forwarded-for", HeaderValue::from_static("10.1.1.1"));
        context
    }

    #[test]
    fn cookies_are_scoped_to_matching_hosts() {
        let context = context_with_cookie();
        let matching = context.headers_for(&Url::parse("https://cdn.example.com/a.mpd").unwrap());
        assert_eq!(matching.get(header::COOKIE).unwrap(), "sid=42");

        let other = context.headers_for(&Url::parse("https://elsewhere.net/a.mpd").unwrap());
        assert!(other.get(header::COOKIE).is_none());
        assert!(other.get("x-forwarded-for").is_some());
    }

    #[test]
    fn header_block_is_crlf_terminated() {
        let context = context_with_cookie();
        let block = context
            .header_block_for(&Url::parse("https://cdn.example.com/a.mpd").unwrap())
            .unwrap();
        assert!(block.contains("X-Forwarded-For: 10.1.1.1\r\n"));
        assert!(block.contains("Cookie: sid=42\r\n"));
    }

    #[test]
    fn empty_context_has_no_header_block() {
        let context = RequestContext::new("TestAgent/1.0");
        assert!(
            context
                .header_block_for(&Url::parse("https://a.b/").unwrap())
                .is_none()
        );
    }

    #[test]
    fn probe_request_shapes() {
        let url = Url::parse("http://a.example/x").unwrap();
        let reach = ProbeRequest::reachability(url.clone());
        assert_eq!(reach.route, Route::Direct);
        assert!(!reach.follow_redirects);
        assert!(reach.range.is_none());

        let ct = ProbeRequest::content_type(url, Route::Proxied);
        assert!(ct.follow_redirects);
        assert_eq!(ct.range, Some(PROBE_RANGE));
    }

    #[test]
    fn session_builds_with_and_without_proxy() {
        let context = Arc::new(RequestContext::new(DEFAULT_USER_AGENT));
        assert!(HttpSession::new(context.clone(), None, HttpSettings::default()).is_ok());

        let proxy = ProxyConfig::parse("http://proxy.lan:3128").unwrap();
        assert!(HttpSession::new(context, Some(&proxy), HttpSettings::default()).is_ok());
    }
}
