//! Scripted [`HttpTransport`] for driving the pipeline without a network.
//!
//! Every request is recorded, so callers can assert both what was asked and
//! that nothing was asked at all.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use url::Url;

use crate::error::{Error, Result};
use crate::http::{ByteStream, Document, HttpTransport, ProbeFailure, ProbeRequest, ProbeResponse, Route};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Probe(ProbeRequest),
    Fetch { url: Url, route: Route },
    Open { url: Url, route: Route },
}

#[derive(Debug, Default)]
pub struct RecordingTransport {
    probes: HashMap<String, Result<ProbeResponse, String>>,
    documents: HashMap<String, (Option<String>, Bytes)>,
    streams: HashMap<String, Bytes>,
    calls: Mutex<Vec<Call>>,
}

impl RecordingTransport {
    pub fn with_probe(mut self, url: &str, response: ProbeResponse) -> Self {
        self.probes.insert(url.to_string(), Ok(response));
        self
    }

    pub fn with_probe_failure(mut self, url: &str, reason: &str) -> Self {
        self.probes.insert(url.to_string(), Err(reason.to_string()));
        self
    }

    pub fn with_document(mut self, url: &str, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.documents
            .insert(url.to_string(), (Some(content_type.to_string()), body.into()));
        self
    }

    pub fn with_stream(mut self, url: &str, body: impl Into<Bytes>) -> Self {
        self.streams.insert(url.to_string(), body.into());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().len()
    }

    pub fn probes(&self) -> Vec<ProbeRequest> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                Call::Probe(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn fetches(&self) -> Vec<Url> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                Call::Fetch { url, .. } => Some(url.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn opens(&self) -> Vec<(Url, Route)> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                Call::Open { url, route } => Some((url.clone(), *route)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.lock().push(call);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Call>> {
        // A poisoned log is still a valid log.
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl HttpTransport for RecordingTransport {
    async fn probe(&self, request: ProbeRequest) -> Result<ProbeResponse, ProbeFailure> {
        let url = request.url.to_string();
        self.record(Call::Probe(request));
        match self.probes.get(&url) {
            Some(Ok(response)) => Ok(response.clone()),
            Some(Err(reason)) => Err(ProbeFailure {
                url,
                reason: reason.clone(),
            }),
            None => Err(ProbeFailure {
                url,
                reason: "connection refused".to_string(),
            }),
        }
    }

    async fn fetch(&self, url: &Url, route: Route) -> Result<Document> {
        self.record(Call::Fetch {
            url: url.clone(),
            route,
        });
        match self.documents.get(url.as_str()) {
            Some((content_type, body)) => Ok(Document {
                url: url.clone(),
                content_type: content_type.clone(),
                body: body.clone(),
            }),
            None => Err(Error::http_status(StatusCode::NOT_FOUND, url.as_str(), "fetch")),
        }
    }

    async fn open(&self, url: &Url, route: Route) -> Result<ByteStream> {
        self.record(Call::Open {
            url: url.clone(),
            route,
        });
        match self.streams.get(url.as_str()) {
            Some(body) => Ok(Box::pin(std::io::Cursor::new(body.clone()))),
            None => Err(Error::http_status(StatusCode::NOT_FOUND, url.as_str(), "open")),
        }
    }
}
