//! DASH manifest model.
//!
//! Only the parts needed to pick and name representations are kept. Segment
//! addressing is left to the muxer, which reads segmented representations
//! through the manifest itself.

mod parser;

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
}

impl MediaType {
    /// Classify from a MIME type, falling back to the `contentType` attribute.
    pub fn classify(mime_type: Option<&str>, content_type: Option<&str>) -> Option<Self> {
        let major = |s: &str| s.split('/').next().unwrap_or_default().to_ascii_lowercase();
        let by_mime = mime_type.map(major);
        let by_content = content_type.map(|s| s.to_ascii_lowercase());

        match (by_mime.as_deref(), by_content.as_deref()) {
            (Some("video"), _) | (None, Some("video")) => Some(Self::Video),
            (Some("audio"), _) | (None, Some("audio")) => Some(Self::Audio),
            (Some("application" | "text"), _) | (None, Some("text")) => Some(Self::Subtitle),
            (Some(_), Some("video")) => Some(Self::Video),
            (Some(_), Some("audio")) => Some(Self::Audio),
            (Some(_), Some("text")) => Some(Self::Subtitle),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
        })
    }
}

/// Locates a representation again after the manifest is reloaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepresentationId {
    pub period: usize,
    pub adaptation_set: usize,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub ident: RepresentationId,
    pub media_type: MediaType,
    pub mime_type: Option<String>,
    pub codecs: Option<String>,
    /// Bits per second.
    pub bandwidth: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<String>,
    pub lang: Option<String>,
    /// Set when the representation or its adaptation set declares content protection.
    pub protected: bool,
    /// Resolved media location. Only set when the representation carries its own BaseURL.
    pub base_url: Option<Url>,
    /// Whether the representation is addressed through segment templates or lists.
    pub segmented: bool,
    /// Position among the period's representations of the same media type.
    /// The muxer's DASH demuxer numbers its streams the same way.
    pub stream_index: usize,
}

impl Representation {
    /// Codec tags, one per comma-separated entry of `codecs`. Representations
    /// without a codecs attribute count as the common codec of their media type.
    pub fn codec_tags(&self) -> Vec<String> {
        match self.codecs.as_deref() {
            Some(codecs) if !codecs.trim().is_empty() => codecs
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            _ => match self.media_type {
                MediaType::Video => vec!["avc1".to_string()],
                MediaType::Audio => vec!["mp4a".to_string()],
                MediaType::Subtitle => Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationSet {
    pub index: usize,
    pub id: Option<String>,
    pub mime_type: Option<String>,
    pub content_type: Option<String>,
    pub lang: Option<String>,
    pub protected: bool,
    pub representations: Vec<Representation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub index: usize,
    pub id: Option<String>,
    pub adaptation_sets: Vec<AdaptationSet>,
}

impl Period {
    pub fn representations(&self) -> impl Iterator<Item = &Representation> {
        self.adaptation_sets
            .iter()
            .flat_map(|aset| aset.representations.iter())
    }

    /// Whether any adaptation set or representation declares content protection.
    pub fn is_protected(&self) -> bool {
        self.adaptation_sets
            .iter()
            .any(|aset| aset.protected || aset.representations.iter().any(|r| r.protected))
    }

    fn label(&self) -> String {
        match &self.id {
            Some(id) => format!("{} (id='{id}')", self.index),
            None => self.index.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentationType {
    #[default]
    Static,
    Dynamic,
}

/// Period choice, by position or by `id` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodSelector {
    Index(usize),
    Id(String),
}

impl Default for PeriodSelector {
    fn default() -> Self {
        Self::Index(0)
    }
}

impl FromStr for PeriodSelector {
    type Err = std::convert::Infallible;

    /// Numbers select by index, anything else by id.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<usize>() {
            Ok(index) => Self::Index(index),
            Err(_) => Self::Id(s.to_string()),
        })
    }
}

impl fmt::Display for PeriodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Id(id) => write!(f, "'{id}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub url: Url,
    pub presentation_type: PresentationType,
    /// Raw ISO 8601 durations, kept for diagnostics.
    pub minimum_update_period: Option<String>,
    pub suggested_presentation_delay: Option<String>,
    pub periods: Vec<Period>,
}

impl Manifest {
    /// Parse an MPD document. `url` is where it was fetched from, after redirects.
    pub fn parse(xml: &[u8], url: Url) -> Result<Self> {
        parser::parse_mpd(xml, url)
    }

    pub fn is_dynamic(&self) -> bool {
        self.presentation_type == PresentationType::Dynamic
    }

    pub fn period(&self, selector: &PeriodSelector) -> Result<&Period> {
        let found = match selector {
            PeriodSelector::Index(index) => self.periods.get(*index),
            PeriodSelector::Id(id) => self.periods.iter().find(|p| p.id.as_deref() == Some(id)),
        };

        found.ok_or_else(|| Error::PeriodNotFound {
            requested: selector.to_string(),
            available: self
                .periods
                .iter()
                .map(Period::label)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    pub fn representation(&self, ident: &RepresentationId) -> Option<&Representation> {
        self.periods
            .get(ident.period)?
            .adaptation_sets
            .get(ident.adaptation_set)?
            .representations
            .iter()
            .find(|r| r.ident.id == ident.id)
    }
}
