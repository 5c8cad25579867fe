use std::collections::HashMap;
use std::str::FromStr;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::debug;
use url::Url;

use super::{AdaptationSet, Manifest, MediaType, Period, PresentationType, Representation, RepresentationId};
use crate::error::{Error, Result};

struct Attrs(Vec<(String, String)>);

impl Attrs {
    fn read(e: &BytesStart<'_>) -> Result<Self> {
        e.attributes()
            .map(|attr| {
                let attr = attr.map_err(|e| Error::manifest_parse(e.to_string()))?;
                let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
                let value = attr
                    .unescape_value()
                    .map_err(|e| Error::manifest_parse(e.to_string()))?
                    .into_owned();
                Ok((key, value))
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn owned(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    fn number<T: FromStr>(&self, name: &str, element: &str) -> Result<Option<T>> {
        self.get(name)
            .map(|value| {
                value.trim().parse::<T>().map_err(|_| {
                    Error::manifest_parse(format!("{element} has invalid {name} `{value}`"))
                })
            })
            .transpose()
    }
}

struct PeriodBuilder {
    period: Period,
    base: Url,
    streams: HashMap<MediaType, usize>,
}

struct AdaptationSetBuilder {
    set: AdaptationSet,
    codecs: Option<String>,
    segmented: bool,
    base: Url,
}

struct RepresentationBuilder {
    id: String,
    media_type: Option<MediaType>,
    mime_type: Option<String>,
    codecs: Option<String>,
    bandwidth: u64,
    width: Option<u32>,
    height: Option<u32>,
    frame_rate: Option<String>,
    lang: Option<String>,
    protected: bool,
    segmented: bool,
    base: Url,
    has_base_url: bool,
}

#[derive(Default)]
struct MpdState {
    manifest: Option<Manifest>,
    mpd_base: Option<Url>,
    mpd_closed: bool,
    period: Option<PeriodBuilder>,
    aset: Option<AdaptationSetBuilder>,
    rep: Option<RepresentationBuilder>,
    base_url_text: Option<String>,
}

impl MpdState {
    fn open(&mut self, e: &BytesStart<'_>, url: &Url) -> Result<()> {
        match e.local_name().as_ref() {
            b"MPD" => {
                if self.manifest.is_some() {
                    return Err(Error::manifest_parse("nested MPD element"));
                }
                let attrs = Attrs::read(e)?;
                let presentation_type = match attrs.get("type") {
                    Some("dynamic") => PresentationType::Dynamic,
                    _ => PresentationType::Static,
                };
                self.manifest = Some(Manifest {
                    url: url.clone(),
                    presentation_type,
                    minimum_update_period: attrs.owned("minimumUpdatePeriod"),
                    suggested_presentation_delay: attrs.owned("suggestedPresentationDelay"),
                    periods: Vec::new(),
                });
                self.mpd_base = Some(url.clone());
            }
            b"Period" => {
                let (Some(manifest), Some(base)) = (&self.manifest, &self.mpd_base) else {
                    return Err(Error::manifest_parse("Period outside of MPD"));
                };
                let attrs = Attrs::read(e)?;
                self.period = Some(PeriodBuilder {
                    period: Period {
                        index: manifest.periods.len(),
                        id: attrs.owned("id"),
                        adaptation_sets: Vec::new(),
                    },
                    base: base.clone(),
                    streams: HashMap::new(),
                });
            }
            b"AdaptationSet" => {
                let Some(period) = &self.period else {
                    return Err(Error::manifest_parse("AdaptationSet outside of Period"));
                };
                let attrs = Attrs::read(e)?;
                self.aset = Some(AdaptationSetBuilder {
                    set: AdaptationSet {
                        index: period.period.adaptation_sets.len(),
                        id: attrs.owned("id"),
                        mime_type: attrs.owned("mimeType"),
                        content_type: attrs.owned("contentType"),
                        lang: attrs.owned("lang"),
                        protected: false,
                        representations: Vec::new(),
                    },
                    codecs: attrs.owned("codecs"),
                    segmented: false,
                    base: period.base.clone(),
                });
            }
            b"Representation" => {
                let Some(aset) = &self.aset else {
                    return Err(Error::manifest_parse("Representation outside of AdaptationSet"));
                };
                let attrs = Attrs::read(e)?;
                let id = attrs
                    .owned("id")
                    .unwrap_or_else(|| aset.set.representations.len().to_string());
                let element = format!("Representation {id}");
                let bandwidth = attrs.number::<u64>("bandwidth", &element)?.ok_or_else(|| {
                    Error::manifest_parse(format!("{element} has no bandwidth"))
                })?;
                let mime_type = attrs.owned("mimeType").or_else(|| aset.set.mime_type.clone());

                self.rep = Some(RepresentationBuilder {
                    media_type: MediaType::classify(
                        mime_type.as_deref(),
                        aset.set.content_type.as_deref(),
                    ),
                    mime_type,
                    codecs: attrs.owned("codecs").or_else(|| aset.codecs.clone()),
                    bandwidth,
                    width: attrs.number("width", &element)?,
                    height: attrs.number("height", &element)?,
                    frame_rate: attrs.owned("frameRate"),
                    lang: attrs.owned("lang").or_else(|| aset.set.lang.clone()),
                    protected: false,
                    segmented: false,
                    base: aset.base.clone(),
                    has_base_url: false,
                    id,
                });
            }
            b"ContentProtection" => {
                if let Some(rep) = self.rep.as_mut() {
                    rep.protected = true;
                } else if let Some(aset) = self.aset.as_mut() {
                    aset.set.protected = true;
                }
            }
            b"SegmentTemplate" | b"SegmentList" => {
                if let Some(rep) = self.rep.as_mut() {
                    rep.segmented = true;
                } else if let Some(aset) = self.aset.as_mut() {
                    aset.segmented = true;
                }
            }
            b"BaseURL" => self.base_url_text = Some(String::new()),
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &[u8]) -> Result<()> {
        match name {
            b"BaseURL" => {
                let text = self.base_url_text.take().unwrap_or_default();
                self.apply_base_url(text.trim())?;
            }
            b"Representation" => {
                let (Some(rep), Some(aset)) = (self.rep.take(), self.aset.as_mut()) else {
                    return Ok(());
                };
                let Some(media_type) = rep.media_type else {
                    debug!(representation = %rep.id, "Skipping representation of unknown media type");
                    return Ok(());
                };
                let (period, stream_index) = match self.period.as_mut() {
                    Some(builder) => {
                        let next = builder.streams.entry(media_type).or_default();
                        let index = *next;
                        *next += 1;
                        (builder.period.index, index)
                    }
                    None => (0, 0),
                };
                aset.set.representations.push(Representation {
                    ident: RepresentationId {
                        period,
                        adaptation_set: aset.set.index,
                        id: rep.id,
                    },
                    media_type,
                    mime_type: rep.mime_type,
                    codecs: rep.codecs,
                    bandwidth: rep.bandwidth,
                    width: rep.width,
                    height: rep.height,
                    frame_rate: rep.frame_rate,
                    lang: rep.lang,
                    protected: rep.protected,
                    base_url: rep.has_base_url.then_some(rep.base),
                    segmented: rep.segmented || aset.segmented,
                    stream_index,
                });
            }
            b"AdaptationSet" => {
                let (Some(mut aset), Some(period)) = (self.aset.take(), self.period.as_mut()) else {
                    return Ok(());
                };
                if aset.set.protected {
                    for rep in &mut aset.set.representations {
                        rep.protected = true;
                    }
                }
                period.period.adaptation_sets.push(aset.set);
            }
            b"Period" => {
                if let (Some(period), Some(manifest)) = (self.period.take(), self.manifest.as_mut()) {
                    manifest.periods.push(period.period);
                }
            }
            b"MPD" => self.mpd_closed = true,
            _ => {}
        }
        Ok(())
    }

    fn apply_base_url(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let slot = if let Some(rep) = self.rep.as_mut() {
            rep.has_base_url = true;
            &mut rep.base
        } else if let Some(aset) = self.aset.as_mut() {
            &mut aset.base
        } else if let Some(period) = self.period.as_mut() {
            &mut period.base
        } else if let Some(base) = self.mpd_base.as_mut() {
            base
        } else {
            return Ok(());
        };

        *slot = slot
            .join(text)
            .map_err(|e| Error::manifest_parse(format!("invalid BaseURL `{text}`: {e}")))?;
        Ok(())
    }

    fn finish(self) -> Result<Manifest> {
        let manifest = self
            .manifest
            .ok_or_else(|| Error::manifest_parse("document has no MPD element"))?;
        if !self.mpd_closed || self.period.is_some() || self.aset.is_some() || self.rep.is_some() {
            return Err(Error::manifest_parse("document is truncated"));
        }
        if manifest.periods.is_empty() {
            return Err(Error::manifest_parse("MPD has no Period"));
        }
        Ok(manifest)
    }
}

pub(super) fn parse_mpd(xml: &[u8], url: Url) -> Result<Manifest> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut state = MpdState::default();
    let mut buf = Vec::new();

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(e) => {
                return Err(Error::manifest_parse(format!(
                    "XML error at byte {}: {e}",
                    reader.error_position()
                )));
            }
        };

        match event {
            Event::Start(e) => state.open(&e, &url)?,
            Event::Empty(e) => {
                state.open(&e, &url)?;
                state.close(e.local_name().as_ref())?;
            }
            Event::End(e) => state.close(e.local_name().as_ref())?,
            Event::Text(t) => {
                if let Some(text) = state.base_url_text.as_mut() {
                    let unescaped = t.unescape().map_err(|e| Error::manifest_parse(e.to_string()))?;
                    text.push_str(&unescaped);
                }
            }
            Event::CData(c) => {
                if let Some(text) = state.base_url_text.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let manifest = state.finish()?;
    debug!(
        periods = manifest.periods.len(),
        dynamic = manifest.is_dynamic(),
        "Parsed MPD"
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PeriodSelector;

    const MANIFEST_URL: &str = "https://cdn.example.com/live/channel/manifest.mpd";

    const SIMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" minimumUpdatePeriod="PT2S" suggestedPresentationDelay="PT10S">
  <BaseURL>media/</BaseURL>
  <Period id="p0">
    <AdaptationSet mimeType="video/mp4" codecs="avc1.64001f">
      <Representation id="v1" bandwidth="3000000" width="1280" height="720" frameRate="25">
        <BaseURL>video_720.mp4</BaseURL>
      </Representation>
      <Representation id="v2" bandwidth="800000" height="360"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="en">
      <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc"/>
      <SegmentTemplate media="a_$Number$.m4s"/>
      <Representation id="a1" bandwidth="128000" codecs="mp4a.40.2"><BaseURL><![CDATA[audio_en.mp4]]></BaseURL></Representation>
    </AdaptationSet>
    <AdaptationSet mimeType="image/jpeg">
      <Representation id="thumbs" bandwidth="1000"/>
    </AdaptationSet>
  </Period>
  <Period id="p1"/>
</MPD>"#;

    fn parse(xml: &str) -> Result<Manifest> {
        Manifest::parse(xml.as_bytes(), Url::parse(MANIFEST_URL).unwrap())
    }

    #[test]
    fn parses_structure_and_attributes() {
        let manifest = parse(SIMPLE).unwrap();
        assert!(manifest.is_dynamic());
        assert_eq!(manifest.minimum_update_period.as_deref(), Some("PT2S"));
        assert_eq!(manifest.suggested_presentation_delay.as_deref(), Some("PT10S"));
        assert_eq!(manifest.periods.len(), 2);

        let period = &manifest.periods[0];
        assert_eq!(period.id.as_deref(), Some("p0"));
        assert_eq!(period.adaptation_sets.len(), 3);

        let v1 = &period.adaptation_sets[0].representations[0];
        assert_eq!(v1.media_type, MediaType::Video);
        assert_eq!(v1.codecs.as_deref(), Some("avc1.64001f"));
        assert_eq!(v1.height, Some(720));
        assert_eq!(v1.frame_rate.as_deref(), Some("25"));
        assert!(!v1.protected);
    }

    #[test]
    fn base_urls_resolve_through_the_hierarchy() {
        let manifest = parse(SIMPLE).unwrap();
        let period = &manifest.periods[0];

        let v1 = &period.adaptation_sets[0].representations[0];
        assert_eq!(
            v1.base_url.as_ref().unwrap().as_str(),
            "https://cdn.example.com/live/channel/media/video_720.mp4"
        );
        let v2 = &period.adaptation_sets[0].representations[1];
        assert!(v2.base_url.is_none());

        let a1 = &period.adaptation_sets[1].representations[0];
        assert_eq!(
            a1.base_url.as_ref().unwrap().as_str(),
            "https://cdn.example.com/live/channel/media/audio_en.mp4"
        );
    }

    #[test]
    fn adaptation_set_properties_are_inherited() {
        let manifest = parse(SIMPLE).unwrap();
        let a1 = &manifest.periods[0].adaptation_sets[1].representations[0];
        assert_eq!(a1.media_type, MediaType::Audio);
        assert_eq!(a1.lang.as_deref(), Some("en"));
        assert!(a1.protected);
        assert!(a1.segmented);
        assert!(manifest.periods[0].is_protected());
    }

    #[test]
    fn stream_positions_count_per_media_type() {
        let manifest = parse(SIMPLE).unwrap();
        let period = &manifest.periods[0];
        let positions: Vec<_> = period
            .representations()
            .map(|r| (r.ident.id.as_str(), r.media_type, r.stream_index))
            .collect();
        assert_eq!(
            positions,
            vec![
                ("v1", MediaType::Video, 0),
                ("v2", MediaType::Video, 1),
                ("a1", MediaType::Audio, 0),
            ]
        );
    }

    #[test]
    fn unknown_media_types_are_skipped() {
        let manifest = parse(SIMPLE).unwrap();
        assert!(manifest.periods[0].adaptation_sets[2].representations.is_empty());
    }

    #[test]
    fn representations_can_be_relocated() {
        let manifest = parse(SIMPLE).unwrap();
        let ident = manifest.periods[0].adaptation_sets[1].representations[0]
            .ident
            .clone();
        assert_eq!(manifest.representation(&ident).unwrap().bandwidth, 128000);
    }

    #[test]
    fn period_lookup_by_index_and_id() {
        let manifest = parse(SIMPLE).unwrap();
        assert_eq!(manifest.period(&PeriodSelector::Index(1)).unwrap().index, 1);
        assert_eq!(
            manifest
                .period(&PeriodSelector::Id("p0".into()))
                .unwrap()
                .index,
            0
        );

        let err = manifest.period(&PeriodSelector::Index(5)).unwrap_err();
        match err {
            Error::PeriodNotFound { requested, available } => {
                assert_eq!(requested, "5");
                assert_eq!(available, "0 (id='p0'), 1 (id='p1')");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn malformed_documents_are_rejected() {
        for xml in [
            "",
            "<NotAnMpd/>",
            "<MPD><Period>",
            "<MPD></MPD>",
            "<MPD><Period><AdaptationSet mimeType=\"video/mp4\"><Representation id=\"x\"/></AdaptationSet></Period></MPD>",
            "<MPD><Period><AdaptationSet><Representation bandwidth=\"fast\"/></AdaptationSet></Period></MPD>",
            "<MPD><Period></AdaptationSet></MPD>",
        ] {
            let err = parse(xml).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::ManifestParse, "input: {xml}");
        }
    }
}
