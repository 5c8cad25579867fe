//! URL-pattern to key lookup table.
//!
//! The table is a JSON object whose keys are glob patterns matched against
//! the full stream URL and whose values are raw key strings, for example:
//!
//! ```json
//! { "*channel4*": "kid:5ce85f1aa5771900b952f0ba58857d7a" }
//! ```

use std::fmt;
use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::glob::GlobPattern;
use crate::http::{HttpTransport, Route};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearKeySource {
    File(PathBuf),
    Url(Url),
}

impl ClearKeySource {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::configuration("clearkeys source is empty"));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            let url = Url::parse(raw).map_err(|e| Error::invalid_url(raw, e.to_string()))?;
            return Ok(Self::Url(url));
        }
        Ok(Self::File(PathBuf::from(raw)))
    }
}

impl fmt::Display for ClearKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Url(url) => write!(f, "{url}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClearKeyTable {
    entries: Vec<(GlobPattern, String)>,
}

impl ClearKeyTable {
    pub fn from_json(content: &[u8]) -> Result<Self> {
        let map: Map<String, Value> = serde_json::from_slice(content)
            .map_err(|e| Error::configuration(format!("invalid clearkeys JSON: {e}")))?;

        let mut entries = Vec::with_capacity(map.len());
        for (pattern, value) in map {
            let Value::String(keys) = value else {
                return Err(Error::configuration(format!(
                    "clearkeys entry `{pattern}` must map to a string"
                )));
            };
            let glob = GlobPattern::new(&pattern).map_err(|e| {
                Error::configuration(format!("invalid clearkeys pattern `{pattern}`: {e}"))
            })?;
            entries.push((glob, keys));
        }

        Ok(Self { entries })
    }

    /// Load the table. Remote tables are fetched through the proxy route.
    pub async fn load<T>(source: &ClearKeySource, transport: &T) -> Result<Self>
    where
        T: HttpTransport + ?Sized,
    {
        let content = match source {
            ClearKeySource::File(path) => tokio::fs::read(path).await.map_err(|e| {
                Error::configuration(format!(
                    "failed to read clearkeys file {}: {e}",
                    path.display()
                ))
            })?,
            ClearKeySource::Url(url) => transport.fetch(url, Route::Proxied).await?.body.to_vec(),
        };

        let table = Self::from_json(&content)?;
        info!(source = %source, entries = table.len(), "Loaded clearkeys table");
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw key string of the first pattern, in document order, matching `url`.
    pub fn lookup(&self, url: &str) -> Option<&str> {
        let found = self
            .entries
            .iter()
            .find(|(pattern, _)| pattern.is_match(url));
        match found {
            Some((pattern, keys)) => {
                debug!(pattern = pattern.as_str(), "Clearkeys pattern matched");
                Some(keys.as_str())
            }
            None => {
                debug!("No clearkeys pattern matched");
                None
            }
        }
    }
}
