//! Builds the named variant set for one DASH period.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::manifest::{MediaType, Period, Representation};

/// Name that resolves to the highest-bandwidth variant.
pub const BEST: &str = "best";
/// Name that resolves to the lowest-bandwidth variant.
pub const WORST: &str = "worst";

#[derive(Debug, Clone, Default)]
pub struct SelectionPolicy {
    pub keys_available: bool,
    pub include_subtitles: bool,
    /// Preferred audio language, e.g. `en` or `en-GB`.
    pub language: Option<String>,
}

/// One playable combination. Never both `video` and `audio` absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant<'m> {
    pub video: Option<&'m Representation>,
    pub audio: Option<&'m Representation>,
    /// Every audio representation of the period, muxed alongside the primary one.
    pub audio_tracks: Vec<&'m Representation>,
    pub subtitle_tracks: Vec<&'m Representation>,
}

impl Variant<'_> {
    /// Video bandwidth, or audio bandwidth for audio-only variants.
    pub fn bandwidth(&self) -> u64 {
        match (self.video, self.audio) {
            (Some(video), _) => video.bandwidth,
            (None, Some(audio)) => audio.bandwidth,
            (None, None) => 0,
        }
    }

    fn stem(&self) -> String {
        match (self.video, self.audio) {
            (Some(video), _) => match video.height {
                Some(height) => format!("{height}p"),
                None => format!("{}k", rounded_kbps(video.bandwidth)),
            },
            (None, Some(audio)) => format!("{}k", rounded_kbps(audio.bandwidth)),
            (None, None) => String::new(),
        }
    }
}

/// Kilobits per second rounded to two significant digits, half to even.
fn rounded_kbps(bandwidth: u64) -> u64 {
    let kbps = bandwidth as f64 / 1000.0;
    if kbps <= 0.0 {
        return 0;
    }
    let digits = 1 - kbps.log10().trunc() as i32;
    let rounded = if digits >= 0 {
        let scale = 10f64.powi(digits);
        (kbps * scale).round_ties_even() / scale
    } else {
        let scale = 10f64.powi(-digits);
        (kbps / scale).round_ties_even() * scale
    };
    rounded.round_ties_even() as u64
}

/// Variants in a stable order, addressable by name.
#[derive(Debug, Clone, Default)]
pub struct VariantSet<'m> {
    entries: Vec<(String, Variant<'m>)>,
}

impl<'m> VariantSet<'m> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variant<'m>)> {
        self.entries.iter().map(|(name, v)| (name.as_str(), v))
    }

    /// Highest bandwidth, ties resolved in favour of the earlier entry.
    pub fn best(&self) -> Option<(&str, &Variant<'m>)> {
        self.iter().reduce(|best, candidate| {
            if candidate.1.bandwidth() > best.1.bandwidth() {
                candidate
            } else {
                best
            }
        })
    }

    /// Lowest bandwidth, ties resolved in favour of the earlier entry.
    pub fn worst(&self) -> Option<(&str, &Variant<'m>)> {
        self.iter().reduce(|worst, candidate| {
            if candidate.1.bandwidth() < worst.1.bandwidth() {
                candidate
            } else {
                worst
            }
        })
    }

    /// Resolve a variant name, including [`BEST`] and [`WORST`].
    pub fn get(&self, name: &str) -> Option<(&str, &Variant<'m>)> {
        match name {
            BEST => self.best(),
            WORST => self.worst(),
            _ => self.iter().find(|(n, _)| *n == name),
        }
    }

    /// Like [`VariantSet::get`], failing with the list of valid names.
    pub fn select(&self, name: &str) -> Result<(&str, &Variant<'m>)> {
        self.get(name).ok_or_else(|| Error::VariantNotFound {
            requested: name.to_string(),
            available: self
                .names()
                .chain([BEST, WORST])
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

/// Primary language subtag, with common ISO 639-2 codes folded to ISO 639-1.
fn primary_language(tag: &str) -> String {
    let primary = tag
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let folded = match primary.as_str() {
        "eng" => "en",
        "fra" | "fre" => "fr",
        "deu" | "ger" => "de",
        "spa" => "es",
        "ita" => "it",
        "por" => "pt",
        "nld" | "dut" => "nl",
        "jpn" => "ja",
        "zho" | "chi" => "zh",
        "kor" => "ko",
        "rus" => "ru",
        "ara" => "ar",
        "hin" => "hi",
        "swe" => "sv",
        "nor" => "no",
        "dan" => "da",
        "fin" => "fi",
        "pol" => "pl",
        "tur" => "tr",
        "ell" | "gre" => "el",
        "heb" => "he",
        "cym" | "wel" => "cy",
        "gle" => "ga",
        other => other,
    };
    folded.to_string()
}

pub fn languages_match(a: &str, b: &str) -> bool {
    primary_language(a) == primary_language(b)
}

pub struct RepresentationSelector {
    policy: SelectionPolicy,
}

impl RepresentationSelector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self { policy }
    }

    /// Build the variant set for `period`. `manifest_label` names the
    /// manifest in errors.
    pub fn select<'m>(&self, period: &'m Period, manifest_label: &str) -> Result<VariantSet<'m>> {
        if !self.policy.keys_available && period.is_protected() {
            return Err(Error::DrmKeyRequired {
                manifest: manifest_label.to_string(),
            });
        }

        let mut video: Vec<&Representation> = Vec::new();
        let mut audio: Vec<&Representation> = Vec::new();
        let mut subtitles: Vec<&Representation> = Vec::new();

        for rep in period.representations() {
            match rep.media_type {
                MediaType::Video => video.push(rep),
                MediaType::Audio => audio.push(rep),
                MediaType::Subtitle if self.policy.include_subtitles => subtitles.push(rep),
                MediaType::Subtitle => {}
            }
        }
        debug!(
            video = video.len(),
            audio = audio.len(),
            subtitles = subtitles.len(),
            "Collected representations"
        );

        let working_language = self.working_language(&audio);
        let languages: HashSet<&str> = audio.iter().filter_map(|rep| rep.lang.as_deref()).collect();

        let primary_audio: Vec<&Representation> = if languages.len() > 1 {
            info!(language = ?working_language, "Filtering audio by language");
            audio
                .iter()
                .copied()
                .filter(|rep| rep.lang.is_none() || rep.lang == working_language)
                .collect()
        } else {
            audio.clone()
        };

        let video_choices: Vec<Option<&Representation>> = if video.is_empty() {
            vec![None]
        } else {
            video.iter().copied().map(Some).collect()
        };
        let audio_choices: Vec<Option<&Representation>> = if primary_audio.is_empty() {
            vec![None]
        } else {
            primary_audio.iter().copied().map(Some).collect()
        };

        let mut variants = Vec::new();
        for v in &video_choices {
            for a in &audio_choices {
                if v.is_none() && a.is_none() {
                    continue;
                }
                variants.push(Variant {
                    video: *v,
                    audio: *a,
                    audio_tracks: audio.clone(),
                    subtitle_tracks: subtitles.clone(),
                });
            }
        }

        Ok(name_variants(variants))
    }

    fn working_language(&self, audio: &[&Representation]) -> Option<String> {
        if let Some(preferred) = self.policy.language.as_deref() {
            let matched = audio
                .iter()
                .filter_map(|rep| rep.lang.as_deref())
                .find(|lang| languages_match(lang, preferred));
            if let Some(lang) = matched {
                debug!(language = lang, "Preferred language available");
                return Some(lang.to_string());
            }
        }
        audio.first().and_then(|rep| rep.lang.clone())
    }
}

/// Group by stem, order each group by descending video bandwidth and
/// suffix the duplicates with `_alt`, `_alt2`, ...
fn name_variants(variants: Vec<Variant<'_>>) -> VariantSet<'_> {
    let mut groups: Vec<(String, Vec<Variant<'_>>)> = Vec::new();
    for variant in variants {
        let stem = variant.stem();
        match groups.iter_mut().find(|(name, _)| *name == stem) {
            Some((_, members)) => members.push(variant),
            None => groups.push((stem, vec![variant])),
        }
    }

    let mut entries = Vec::new();
    for (stem, mut members) in groups {
        members.sort_by_key(|v| std::cmp::Reverse(v.video.map_or(0, |r| r.bandwidth)));
        for (n, variant) in members.into_iter().enumerate() {
            let name = match n {
                0 => stem.clone(),
                1 => format!("{stem}_alt"),
                n => format!("{stem}_alt{n}"),
            };
            entries.push((name, variant));
        }
    }

    VariantSet { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{AdaptationSet, RepresentationId};
    use rstest::rstest;

    fn rep(id: &str, media_type: MediaType, bandwidth: u64) -> Representation {
        Representation {
            ident: RepresentationId {
                period: 0,
                adaptation_set: 0,
                id: id.to_string(),
            },
            media_type,
            mime_type: None,
            codecs: None,
            bandwidth,
            width: None,
            height: None,
            frame_rate: None,
            lang: None,
            protected: false,
            base_url: None,
            segmented: false,
            stream_index: 0,
        }
    }

    fn video(id: &str, bandwidth: u64, height: Option<u32>) -> Representation {
        Representation {
            height,
            ..rep(id, MediaType::Video, bandwidth)
        }
    }

    fn audio(id: &str, bandwidth: u64, lang: Option<&str>) -> Representation {
        Representation {
            lang: lang.map(str::to_string),
            ..rep(id, MediaType::Audio, bandwidth)
        }
    }

    fn period(sets: Vec<Vec<Representation>>) -> Period {
        Period {
            index: 0,
            id: None,
            adaptation_sets: sets
                .into_iter()
                .enumerate()
                .map(|(index, representations)| AdaptationSet {
                    index,
                    id: None,
                    mime_type: None,
                    content_type: None,
                    lang: None,
                    protected: false,
                    representations,
                })
                .collect(),
        }
    }

    fn select(period: &Period, policy: SelectionPolicy) -> VariantSet<'_> {
        RepresentationSelector::new(policy)
            .select(period, "test.mpd")
            .unwrap()
    }

    #[test]
    fn equal_bandwidth_videos_get_alt_suffix() {
        let period = period(vec![
            vec![
                video("v1", 500_000, None),
                video("v2", 1_000_000, None),
                video("v3", 1_000_000, None),
            ],
            vec![audio("a1", 128_000, None)],
        ]);
        let set = select(&period, SelectionPolicy::default());

        let names: Vec<_> = set.names().collect();
        assert_eq!(names, vec!["500k", "1000k", "1000k_alt"]);

        let (name, best) = set.get(BEST).unwrap();
        assert_eq!(name, "1000k");
        assert_eq!(best.video.unwrap().ident.id, "v2");
        assert_eq!(set.get(WORST).unwrap().0, "500k");
    }

    #[test]
    fn duplicate_heights_are_sorted_by_bandwidth() {
        let period = period(vec![vec![
            video("low", 1_500_000, Some(720)),
            video("high", 3_000_000, Some(720)),
            video("mid", 2_000_000, Some(720)),
        ]]);
        let set = select(&period, SelectionPolicy::default());

        let picked: Vec<_> = set
            .iter()
            .map(|(name, v)| (name.to_string(), v.video.unwrap().ident.id.clone()))
            .collect();
        assert_eq!(
            picked,
            vec![
                ("720p".to_string(), "high".to_string()),
                ("720p_alt".to_string(), "mid".to_string()),
                ("720p_alt2".to_string(), "low".to_string()),
            ]
        );
    }

    #[test]
    fn audio_only_period_is_named_by_audio_bandwidth() {
        let period = period(vec![vec![audio("a1", 128_000, None), audio("a2", 64_000, None)]]);
        let set = select(&period, SelectionPolicy::default());

        let names: Vec<_> = set.names().collect();
        assert_eq!(names, vec!["130k", "64k"]);
        let (_, best) = set.get(BEST).unwrap();
        assert!(best.video.is_none());
        assert_eq!(best.audio.unwrap().ident.id, "a1");
    }

    #[test]
    fn close_bandwidths_share_a_rounded_name() {
        let period = period(vec![vec![
            video("v1", 1_190_000, None),
            video("v2", 1_210_000, None),
        ]]);
        let set = select(&period, SelectionPolicy::default());

        let picked: Vec<_> = set
            .iter()
            .map(|(name, v)| (name.to_string(), v.video.unwrap().ident.id.clone()))
            .collect();
        assert_eq!(
            picked,
            vec![
                ("1200k".to_string(), "v2".to_string()),
                ("1200k_alt".to_string(), "v1".to_string()),
            ]
        );
    }

    #[rstest]
    #[case(0, 0)]
    #[case(800, 1)]
    #[case(64_000, 64)]
    #[case(128_000, 130)]
    #[case(999_000, 1000)]
    #[case(1_250_000, 1200)]
    #[case(3_456_000, 3500)]
    #[case(12_345_000, 12000)]
    fn bandwidth_rounds_to_two_significant_digits(#[case] bandwidth: u64, #[case] kbps: u64) {
        assert_eq!(rounded_kbps(bandwidth), kbps);
    }

    #[test]
    fn language_filter_compares_whole_tags() {
        let period = period(vec![
            vec![video("v1", 1_000_000, Some(720))],
            vec![
                audio("a_en", 128_000, Some("en")),
                audio("a_enus", 128_000, Some("en-US")),
                audio("a_fr", 128_000, Some("fr")),
            ],
        ]);
        let set = select(&period, SelectionPolicy::default());

        assert_eq!(set.names().collect::<Vec<_>>(), vec!["720p"]);
        let (_, best) = set.get(BEST).unwrap();
        assert_eq!(best.audio.unwrap().ident.id, "a_en");
        assert_eq!(best.audio_tracks.len(), 3);
    }

    #[test]
    fn untagged_audio_does_not_count_as_a_language() {
        let period = period(vec![
            vec![video("v1", 1_000_000, Some(720))],
            vec![
                audio("a_und", 96_000, None),
                audio("a_en_hi", 128_000, Some("en")),
                audio("a_en_lo", 64_000, Some("en")),
            ],
        ]);
        let set = select(&period, SelectionPolicy::default());
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn protected_period_without_keys_fails() {
        let mut period = period(vec![vec![video("v1", 1_000_000, Some(720))]]);
        period.adaptation_sets[0].protected = true;

        let err = RepresentationSelector::new(SelectionPolicy::default())
            .select(&period, "https://cdn/x.mpd")
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DrmKeyRequired);
        assert!(err.to_string().contains("https://cdn/x.mpd"));

        let policy = SelectionPolicy {
            keys_available: true,
            ..Default::default()
        };
        assert_eq!(select(&period, policy).len(), 1);
    }

    #[rstest]
    #[case(None, "a_en")]
    #[case(Some("fr"), "a_fr")]
    #[case(Some("fre"), "a_fr")]
    #[case(Some("de"), "a_en")]
    fn audio_is_filtered_to_working_language(
        #[case] preferred: Option<&str>,
        #[case] expected: &str,
    ) {
        let period = period(vec![
            vec![video("v1", 1_000_000, Some(720))],
            vec![
                audio("a_en", 128_000, Some("en")),
                audio("a_fr", 128_000, Some("fr-FR")),
                audio("a_und", 96_000, None),
            ],
        ]);
        let set = select(
            &period,
            SelectionPolicy {
                language: preferred.map(str::to_string),
                ..Default::default()
            },
        );

        // Working language plus the untagged track.
        assert_eq!(set.len(), 2);
        let (_, best) = set.get(BEST).unwrap();
        assert_eq!(best.audio.unwrap().ident.id, expected);
        // Ride-along tracks keep every audio representation.
        assert_eq!(best.audio_tracks.len(), 3);
    }

    #[test]
    fn subtitles_only_when_requested() {
        let period = period(vec![
            vec![video("v1", 1_000_000, Some(720))],
            vec![rep("s1", MediaType::Subtitle, 1_000)],
        ]);
        let without = select(&period, SelectionPolicy::default());
        assert!(without.get(BEST).unwrap().1.subtitle_tracks.is_empty());

        let with = select(
            &period,
            SelectionPolicy {
                include_subtitles: true,
                ..Default::default()
            },
        );
        assert_eq!(with.get(BEST).unwrap().1.subtitle_tracks.len(), 1);
    }

    #[test]
    fn unknown_variant_lists_alternatives() {
        let period = period(vec![vec![video("v1", 1_000_000, Some(720))]]);
        let set = select(&period, SelectionPolicy::default());

        let err = set.select("1080p").unwrap_err();
        assert_eq!(
            err.to_string(),
            "variant `1080p` not found, available variants: 720p, best, worst"
        );
        assert_eq!(set.select("720p").unwrap().0, "720p");
    }

    #[test]
    fn empty_period_yields_empty_set() {
        let period = period(vec![]);
        let set = select(&period, SelectionPolicy::default());
        assert!(set.is_empty());
        assert!(set.get(BEST).is_none());
    }

    #[rstest]
    #[case("en", "eng", true)]
    #[case("en-GB", "en_US", true)]
    #[case("pt-BR", "por", true)]
    #[case("en", "fr", false)]
    fn language_matching(#[case] a: &str, #[case] b: &str, #[case] expected: bool) {
        assert_eq!(languages_match(a, b), expected);
    }
}
