use reqwest::Proxy;
use url::Url;

use crate::error::{Error, Result};

/// Proxy protocol, inferred from the proxy URL scheme.
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum ProxyType {
    Http,
    Https,
    Socks5,
}

impl ProxyType {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "socks5" | "socks5h" => Some(Self::Socks5),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Upstream proxy used for every non-bypassed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy URL without credentials, e.g. `http://proxy.lan:3128`.
    pub url: Url,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// Parse a proxy URL. Bare `host:port` values are treated as HTTP proxies.
    /// Credentials embedded in the URL are split out into [`ProxyAuth`].
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };

        let mut url = Url::parse(&with_scheme)
            .map_err(|e| Error::configuration(format!("invalid proxy URL `{raw}`: {e}")))?;

        let proxy_type = ProxyType::from_scheme(url.scheme()).ok_or_else(|| {
            Error::configuration(format!(
                "unsupported proxy scheme `{}` in `{raw}`",
                url.scheme()
            ))
        })?;

        if url.host_str().is_none() {
            return Err(Error::configuration(format!("proxy URL `{raw}` has no host")));
        }

        let auth = (!url.username().is_empty()).then(|| ProxyAuth {
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
        });
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(Self {
            url,
            proxy_type,
            auth,
        })
    }

    /// Proxy URL with credentials, as handed to the muxer's `-http_proxy`.
    pub fn url_with_auth(&self) -> String {
        let mut url = self.url.clone();
        if let Some(auth) = &self.auth {
            let _ = url.set_username(&auth.username);
            let _ = url.set_password(Some(&auth.password));
        }
        url.to_string()
    }
}

/// Build a reqwest Proxy from our proxy configuration.
///
/// Every scheme is proxied through it, the upstream proxy is not restricted
/// to plain-http targets.
pub fn build_proxy_from_config(config: &ProxyConfig) -> Result<Proxy> {
    let proxy_url = config.url.as_str();

    let mut proxy = Proxy::all(proxy_url).map_err(|e| {
        Error::configuration(format!(
            "invalid {:?} proxy URL {proxy_url}: {e}",
            config.proxy_type
        ))
    })?;

    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }

    Ok(proxy)
}
