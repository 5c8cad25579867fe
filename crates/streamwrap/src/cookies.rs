//! Mozilla/Netscape `cookies.txt` support.
//!
//! Each non-comment line holds seven tab-separated fields:
//! `domain  include_subdomains  path  secure  expires  name  value`.
//! Lines prefixed with `#HttpOnly_` are cookies, not comments.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    /// Unix timestamp, `None` for session cookies.
    pub expires: Option<u64>,
    pub name: String,
    pub value: String,
}

impl Cookie {
    fn matches(&self, url: &Url, now: u64) -> bool {
        if self.expires.is_some_and(|exp| exp < now) {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain = self.domain.trim_start_matches('.').to_ascii_lowercase();
        let domain_ok = host == domain
            || ((self.include_subdomains || self.domain.starts_with('.'))
                && host.ends_with(&format!(".{domain}")));
        domain_ok && url.path().starts_with(&self.path)
    }
}

/// Read-only cookie collection, safe to share between request paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn parse(content: &str) -> Result<Self> {
        let mut cookies = Vec::new();

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            let line = match line.strip_prefix(HTTP_ONLY_PREFIX) {
                Some(rest) => rest,
                None if line.starts_with('#') || line.trim().is_empty() => continue,
                None => line,
            };

            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 7 {
                return Err(Error::configuration(format!(
                    "cookies file line {}: expected 7 tab-separated fields, found {}",
                    lineno + 1,
                    fields.len()
                )));
            }

            // Zero, negative or empty expiry marks a session cookie.
            let expires = match fields[4].trim() {
                "" => None,
                value => {
                    let stamp = value.parse::<i64>().map_err(|_| {
                        Error::configuration(format!(
                            "cookies file line {}: invalid expiry `{value}`",
                            lineno + 1
                        ))
                    })?;
                    u64::try_from(stamp).ok().filter(|stamp| *stamp > 0)
                }
            };

            cookies.push(Cookie {
                domain: fields[0].to_string(),
                include_subdomains: fields[1].eq_ignore_ascii_case("TRUE"),
                path: fields[2].to_string(),
                secure: fields[3].eq_ignore_ascii_case("TRUE"),
                expires,
                name: fields[5].to_string(),
                value: fields[6].to_string(),
            });
        }

        debug!("Loaded {} cookies", cookies.len());
        Ok(Self { cookies })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::configuration(format!(
                "failed to read cookies file {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&content)
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// `Cookie` header value for a request to `url`, if any cookie applies.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches(url, now))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        (!pairs.is_empty()).then(|| pairs.join("; "))
    }
}
