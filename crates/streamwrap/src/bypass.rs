//! Proxy bypass resolution.
//!
//! A URL whose host matches the bypass list is probed directly. When the
//! direct probe succeeds, or redirects somewhere outside the list, the stream
//! is fetched without the proxy. Every failure falls back to the proxy.

use reqwest::StatusCode;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::glob::GlobPattern;
use crate::http::{HttpTransport, ProbeRequest, Route};

/// Bound on the number of direct probes for a single resolution.
pub const MAX_REDIRECT_HOPS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyDecision {
    /// Fetch `url` through the proxy.
    UseProxy { url: Url },
    /// Fetch `url` directly, it was reachable as-is.
    Bypass { url: Url },
    /// Fetch the redirect target `url` directly.
    BypassRedirected { url: Url },
}

impl ProxyDecision {
    pub fn url(&self) -> &Url {
        match self {
            Self::UseProxy { url } | Self::Bypass { url } | Self::BypassRedirected { url } => url,
        }
    }

    pub fn route(&self) -> Route {
        match self {
            Self::UseProxy { .. } => Route::Proxied,
            Self::Bypass { .. } | Self::BypassRedirected { .. } => Route::Direct,
        }
    }

    pub fn uses_proxy(&self) -> bool {
        matches!(self, Self::UseProxy { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct HostPattern {
    glob: GlobPattern,
    /// `host:port` patterns match against the URL's effective port too.
    with_port: bool,
    /// NO_PROXY style `.example.com`, matching the domain and its subdomains.
    domain_suffix: Option<String>,
}

impl HostPattern {
    fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.contains(char::is_whitespace) || raw.contains('/') {
            return Err(Error::configuration(format!(
                "invalid proxy bypass pattern `{raw}`"
            )));
        }

        let with_port = raw
            .rsplit_once(':')
            .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()));

        let domain_suffix = raw
            .strip_prefix('.')
            .filter(|rest| !with_port && !rest.is_empty() && !rest.contains(['*', '?', '[']))
            .map(str::to_ascii_lowercase);

        let glob = GlobPattern::new(raw).map_err(|e| {
            Error::configuration(format!("invalid proxy bypass pattern `{raw}`: {e}"))
        })?;

        Ok(Self {
            glob,
            with_port,
            domain_suffix,
        })
    }

    fn matches(&self, host: &str, port: Option<u16>) -> bool {
        if self.with_port {
            return port.is_some_and(|port| self.glob.is_match(&format!("{host}:{port}")));
        }
        if self.glob.is_match(host) {
            return true;
        }
        self.domain_suffix.as_deref().is_some_and(|suffix| {
            let host = host.to_ascii_lowercase();
            host == suffix || host.ends_with(&format!(".{suffix}"))
        })
    }
}

/// Comma-separated list of host glob patterns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BypassList {
    patterns: Vec<HostPattern>,
}

impl BypassList {
    pub fn parse(raw: &str) -> Result<Self> {
        let patterns = raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(HostPattern::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the URL's host matches any pattern. URLs without a host never match.
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let port = url.port_or_known_default();
        self.patterns.iter().any(|p| p.matches(host, port))
    }
}

pub struct BypassResolver<'a, T: ?Sized> {
    list: &'a BypassList,
    transport: &'a T,
    max_hops: usize,
}

impl<'a, T> BypassResolver<'a, T>
where
    T: HttpTransport + ?Sized,
{
    pub fn new(list: &'a BypassList, transport: &'a T) -> Self {
        Self {
            list,
            transport,
            max_hops: MAX_REDIRECT_HOPS,
        }
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Decide how `url` should be fetched. Never fails.
    pub async fn resolve(&self, url: &Url) -> ProxyDecision {
        let use_proxy = || ProxyDecision::UseProxy { url: url.clone() };

        if !self.list.matches(url) {
            debug!(url = %url, "Host not in proxy bypass list");
            return use_proxy();
        }

        let mut candidate = url.clone();
        for hop in 0..self.max_hops {
            let response = match self
                .transport
                .probe(ProbeRequest::reachability(candidate.clone()))
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Direct probe failed, using proxy");
                    return use_proxy();
                }
            };

            match response.status {
                StatusCode::OK => {
                    info!(url = %url, "Bypassing proxy");
                    return ProxyDecision::Bypass { url: url.clone() };
                }
                StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
                    let Some(location) = response.location else {
                        warn!(url = %candidate, "Redirect without Location header, using proxy");
                        return use_proxy();
                    };
                    let target = match candidate.join(&location) {
                        Ok(target) => target,
                        Err(e) => {
                            warn!(location = %location, error = %e, "Unparseable redirect target, using proxy");
                            return use_proxy();
                        }
                    };

                    if self.list.matches(&target) {
                        debug!(hop, from = %candidate, to = %target, "Following redirect within bypass list");
                        candidate = target;
                        continue;
                    }

                    info!(url = %target, "Bypassing proxy for redirect target");
                    return ProxyDecision::BypassRedirected { url: target };
                }
                status => {
                    warn!(url = %candidate, %status, "Direct probe not usable, using proxy");
                    return use_proxy();
                }
            }
        }

        warn!(url = %url, hops = self.max_hops, "Too many redirects, using proxy");
        use_proxy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ProbeResponse;
    use crate::testing::RecordingTransport;
    use rstest::rstest;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[rstest]
    #[case("*.example.com", "https://cdn.example.com/a.mpd", true)]
    #[case("*.example.com", "https://example.com/a.mpd", false)]
    #[case(".example.com", "https://example.com/a.mpd", true)]
    #[case(".example.com", "https://a.b.example.com/a.mpd", true)]
    #[case("192.168.1.*", "http://192.168.1.20:8080/live.ts", true)]
    #[case("cdn.lan:8080", "http://cdn.lan:8080/live.ts", true)]
    #[case("cdn.lan:8080", "http://cdn.lan/live.ts", false)]
    #[case("cdn.lan:80", "http://cdn.lan/live.ts", true)]
    #[case("CDN.LAN", "http://cdn.lan/live.ts", true)]
    fn host_matching(#[case] patterns: &str, #[case] target: &str, #[case] expected: bool) {
        let list = BypassList::parse(patterns).unwrap();
        assert_eq!(list.matches(&url(target)), expected);
    }

    #[test]
    fn list_parsing_skips_blank_entries() {
        let list = BypassList::parse(" a.lan , ,*.b.lan,").unwrap();
        assert_eq!(list.len(), 2);
        assert!(BypassList::parse("bad pattern").is_err());
        assert!(BypassList::parse("http://a.lan/x").is_err());
    }

    #[tokio::test]
    async fn unmatched_host_makes_no_network_calls() {
        let list = BypassList::parse("*.lan").unwrap();
        let transport = RecordingTransport::default();
        let target = url("https://cdn.example.com/a.mpd");

        let decision = BypassResolver::new(&list, &transport).resolve(&target).await;
        assert_eq!(decision, ProxyDecision::UseProxy { url: target });
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn reachable_host_bypasses_with_original_url() {
        let list = BypassList::parse("*.lan").unwrap();
        let target = url("http://tv.lan/live.m3u8");
        let transport = RecordingTransport::default()
            .with_probe(target.as_str(), ProbeResponse::new(StatusCode::OK));

        let decision = BypassResolver::new(&list, &transport).resolve(&target).await;
        assert_eq!(decision, ProxyDecision::Bypass { url: target.clone() });

        let probes = transport.probes();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].route, Route::Direct);
        assert!(!probes[0].follow_redirects);
    }

    #[tokio::test]
    async fn redirect_chain_leaving_the_list_yields_final_location() {
        let list = BypassList::parse("*.lan").unwrap();
        let transport = RecordingTransport::default()
            .with_probe(
                "http://a.lan/live",
                ProbeResponse::new(StatusCode::MOVED_PERMANENTLY).with_location("http://b.lan/live"),
            )
            .with_probe(
                "http://b.lan/live",
                ProbeResponse::new(StatusCode::FOUND)
                    .with_location("https://cdn.example.com/live/index.m3u8"),
            );

        let decision = BypassResolver::new(&list, &transport)
            .resolve(&url("http://a.lan/live"))
            .await;
        assert_eq!(
            decision,
            ProxyDecision::BypassRedirected {
                url: url("https://cdn.example.com/live/index.m3u8")
            }
        );
        assert_eq!(transport.probes().len(), 2);
    }

    #[tokio::test]
    async fn relative_location_is_resolved_against_candidate() {
        let list = BypassList::parse("a.lan").unwrap();
        let transport = RecordingTransport::default().with_probe(
            "http://a.lan/dir/live",
            ProbeResponse::new(StatusCode::FOUND).with_location("//cdn.net/x.ts"),
        );

        let decision = BypassResolver::new(&list, &transport)
            .resolve(&url("http://a.lan/dir/live"))
            .await;
        assert_eq!(decision.url().as_str(), "http://cdn.net/x.ts");
        assert_eq!(decision.route(), Route::Direct);
    }

    #[rstest]
    #[case(ProbeResponse::new(StatusCode::FOUND))]
    #[case(ProbeResponse::new(StatusCode::FORBIDDEN))]
    #[case(ProbeResponse::new(StatusCode::TEMPORARY_REDIRECT).with_location("http://x.net/"))]
    #[tokio::test]
    async fn unusable_responses_fall_back_to_proxy(#[case] response: ProbeResponse) {
        let list = BypassList::parse("a.lan").unwrap();
        let target = url("http://a.lan/live");
        let transport = RecordingTransport::default().with_probe(target.as_str(), response);

        let decision = BypassResolver::new(&list, &transport).resolve(&target).await;
        assert_eq!(decision, ProxyDecision::UseProxy { url: target });
    }

    #[tokio::test]
    async fn probe_failure_falls_back_to_proxy() {
        let list = BypassList::parse("a.lan").unwrap();
        let target = url("http://a.lan/live");
        let transport =
            RecordingTransport::default().with_probe_failure(target.as_str(), "timed out");

        let decision = BypassResolver::new(&list, &transport).resolve(&target).await;
        assert!(decision.uses_proxy());
    }

    #[tokio::test]
    async fn redirect_loop_is_bounded() {
        let list = BypassList::parse("a.lan").unwrap();
        let target = url("http://a.lan/live");
        let transport = RecordingTransport::default().with_probe(
            target.as_str(),
            ProbeResponse::new(StatusCode::FOUND).with_location("/live"),
        );

        let decision = BypassResolver::new(&list, &transport)
            .with_max_hops(4)
            .resolve(&target)
            .await;
        assert_eq!(decision, ProxyDecision::UseProxy { url: target });
        assert_eq!(transport.probes().len(), 4);
    }
}
