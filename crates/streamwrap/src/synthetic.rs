//! Placeholder tracks for streams missing video or audio.
//!
//! A synthetic track is a generator process producing a blank video or a
//! silent audio elementary stream as MPEG-TS on its stdout. The muxer reads
//! it as an extra input.

use std::process::Stdio;

use process_utils::{ScopedChild, tokio_command};
use tokio::process::ChildStdout;
use tracing::{info, warn};

use crate::detect::VariantKind;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticKind {
    BlankVideo,
    SilentAudio,
}

impl SyntheticKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::BlankVideo => "blank-video",
            Self::SilentAudio => "silent-audio",
        }
    }
}

/// Caller overrides of variant detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariantOverrides {
    pub force_no_video: bool,
    pub force_no_audio: bool,
    pub skip_variant_check: bool,
}

impl VariantOverrides {
    pub fn any(&self) -> bool {
        self.force_no_video || self.force_no_audio || self.skip_variant_check
    }

    /// More than one override set at once.
    pub fn conflicting(&self) -> bool {
        [self.force_no_video, self.force_no_audio, self.skip_variant_check]
            .iter()
            .filter(|set| **set)
            .count()
            > 1
    }

    /// Whether detection has to run at all.
    pub fn requires_detection(&self) -> bool {
        !self.any()
    }

    /// Which synthetic track, if any, completes the stream.
    pub fn synthetic_for(&self, detected: Option<VariantKind>) -> Option<SyntheticKind> {
        if self.force_no_video && self.force_no_audio {
            warn!("Both video and audio are forced off, no synthetic track generated");
            return None;
        }
        if self.force_no_video {
            return Some(SyntheticKind::BlankVideo);
        }
        if self.force_no_audio {
            return Some(SyntheticKind::SilentAudio);
        }
        if self.skip_variant_check {
            return None;
        }
        match detected {
            Some(VariantKind::AudioOnly) => Some(SyntheticKind::BlankVideo),
            Some(VariantKind::VideoOnly) => Some(SyntheticKind::SilentAudio),
            Some(VariantKind::Normal) | None => None,
        }
    }
}

/// Generator parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub color: String,
    pub video_codec: String,
    pub sample_rate: u32,
    pub channel_layout: String,
    pub audio_codec: String,
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 25,
            color: "black".to_string(),
            video_codec: "libx264".to_string(),
            sample_rate: 48_000,
            channel_layout: "stereo".to_string(),
            audio_codec: "aac".to_string(),
        }
    }
}

/// Arguments for the generator process, after the program name.
pub fn generator_args(kind: SyntheticKind, settings: &SyntheticSettings) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-re", "-f", "lavfi", "-i"]
        .into_iter()
        .map(String::from)
        .collect();

    match kind {
        SyntheticKind::BlankVideo => {
            args.push(format!(
                "color=c={}:s={}x{}:r={}",
                settings.color, settings.width, settings.height, settings.frame_rate
            ));
            args.extend(
                [
                    "-c:v",
                    settings.video_codec.as_str(),
                    "-preset",
                    "ultrafast",
                    "-tune",
                    "stillimage",
                    "-pix_fmt",
                    "yuv420p",
                ]
                .map(String::from),
            );
        }
        SyntheticKind::SilentAudio => {
            args.push(format!(
                "anullsrc=channel_layout={}:sample_rate={}",
                settings.channel_layout, settings.sample_rate
            ));
            args.extend(["-c:a", settings.audio_codec.as_str()].map(String::from));
        }
    }

    args.extend(["-f", "mpegts", "pipe:1"].map(String::from));
    args
}

/// A running generator. Terminated when dropped.
#[derive(Debug)]
pub struct SyntheticTrack {
    process: ScopedChild,
}

impl SyntheticTrack {
    pub fn spawn(kind: SyntheticKind, program: &str, settings: &SyntheticSettings) -> Result<Self> {
        let args = generator_args(kind, settings);
        info!(track = kind.label(), "Starting synthetic track generator");

        let child = tokio_command(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::process(format!("failed to start {program} for {}: {e}", kind.label())))?;

        let mut process = ScopedChild::new(kind.label(), child);
        if let Some(stderr) = process.take_stderr() {
            process_utils::forward_stderr(kind.label(), stderr);
        }

        Ok(Self { process })
    }

    pub fn take_output(&mut self) -> Option<ChildStdout> {
        self.process.take_stdout()
    }

    pub async fn close(mut self) {
        self.process.terminate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(VariantOverrides { force_no_video: true, ..Default::default() }, Some(VariantKind::VideoOnly), Some(SyntheticKind::BlankVideo))]
    #[case(VariantOverrides { force_no_audio: true, ..Default::default() }, None, Some(SyntheticKind::SilentAudio))]
    #[case(VariantOverrides { skip_variant_check: true, ..Default::default() }, Some(VariantKind::AudioOnly), None)]
    #[case(VariantOverrides { force_no_video: true, force_no_audio: true, skip_variant_check: false }, None, None)]
    #[case(VariantOverrides::default(), Some(VariantKind::AudioOnly), Some(SyntheticKind::BlankVideo))]
    #[case(VariantOverrides::default(), Some(VariantKind::VideoOnly), Some(SyntheticKind::SilentAudio))]
    #[case(VariantOverrides::default(), Some(VariantKind::Normal), None)]
    fn override_precedence(
        #[case] overrides: VariantOverrides,
        #[case] detected: Option<VariantKind>,
        #[case] expected: Option<SyntheticKind>,
    ) {
        assert_eq!(overrides.synthetic_for(detected), expected);
    }

    #[test]
    fn conflicting_overrides() {
        assert!(!VariantOverrides::default().conflicting());
        assert!(
            !VariantOverrides {
                force_no_audio: true,
                ..Default::default()
            }
            .conflicting()
        );
        assert!(
            VariantOverrides {
                force_no_audio: true,
                skip_variant_check: true,
                ..Default::default()
            }
            .conflicting()
        );
    }

    #[test]
    fn blank_video_generator_args() {
        let args = generator_args(SyntheticKind::BlankVideo, &SyntheticSettings::default());
        let joined = args.join(" ");
        assert!(joined.contains("-f lavfi -i color=c=black:s=1280x720:r=25"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.ends_with("-f mpegts pipe:1"));
    }

    #[test]
    fn silent_audio_generator_args() {
        let args = generator_args(SyntheticKind::SilentAudio, &SyntheticSettings::default());
        let joined = args.join(" ");
        assert!(joined.contains("-i anullsrc=channel_layout=stereo:sample_rate=48000"));
        assert!(joined.contains("-c:a aac"));
        assert!(!joined.contains("-c:v"));
    }
}
