//! Decryption key normalization.
//!
//! Raw key strings arrive as a comma-delimited list where each entry is either
//! a bare key or a `kid:key` pair. Keys may be given as 32 hex digits or as
//! URL-safe base64 of the 16 key bytes. Everything is normalized to 32 hex
//! digits before it reaches the muxer.

mod clearkeys;

pub use clearkeys::{ClearKeySource, ClearKeyTable};

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use tracing::debug;

use crate::error::{Error, Result};

/// Number of hex digits in a 128-bit key.
pub const KEY_HEX_LEN: usize = 32;

const BASE64_KEY_LEN: std::ops::RangeInclusive<usize> = 21..=24;

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Parse and validate a comma-delimited key list.
///
/// Order is preserved. The first invalid entry fails the whole list.
pub fn normalize_keys(raw: &str) -> Result<Vec<String>> {
    raw.split(',').map(|entry| normalize_key(entry.trim())).collect()
}

fn normalize_key(entry: &str) -> Result<String> {
    let candidate = entry.rsplit(':').next().unwrap_or(entry);
    debug!(
        "Decryption key candidate has {} characters",
        candidate.len()
    );

    let key = if BASE64_KEY_LEN.contains(&candidate.len()) {
        decode_base64_key(entry, candidate)?
    } else {
        candidate.to_string()
    };

    if key.len() != KEY_HEX_LEN {
        return Err(Error::invalid_key(
            entry,
            format!(
                "expected a 128-bit key in {KEY_HEX_LEN} hex digits, got {} characters",
                key.len()
            ),
        ));
    }

    if !key.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::invalid_key(entry, "key contains invalid hex digits"));
    }

    Ok(key)
}

fn decode_base64_key(entry: &str, candidate: &str) -> Result<String> {
    let mut padded: String = candidate
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let bytes = URL_SAFE_LENIENT
        .decode(padded.as_bytes())
        .map_err(|e| Error::invalid_key(entry, format!("base64 decode failed: {e}")))?;
    let key = hex::encode(bytes);
    debug!("Decryption key decoded from base64 to {} hex digits", key.len());
    Ok(key)
}

/// Ordered set of normalized keys, one conceptual slot per elementary stream.
///
/// Slot 0 belongs to the video stream. When there are more streams than
/// keys, assignment wraps back to slot 1 so the first non-video key is
/// reused. A single key is broadcast to every stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    keys: Vec<String>,
}

impl KeySet {
    /// Normalize a raw comma-delimited key string.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(Self {
            keys: normalize_keys(raw)?,
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Endless key assignment sequence, or an empty iterator for an empty set.
    pub fn slots(&self) -> KeySlots<'_> {
        KeySlots {
            keys: &self.keys,
            next: 0,
        }
    }
}

/// Iterator over key assignments, see [`KeySet`].
#[derive(Debug, Clone)]
pub struct KeySlots<'a> {
    keys: &'a [String],
    next: usize,
}

impl<'a> Iterator for KeySlots<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        match self.keys.len() {
            0 => None,
            1 => Some(self.keys[0].as_str()),
            len => {
                let key = self.keys[self.next].as_str();
                self.next += 1;
                if self.next == len {
                    self.next = 1;
                }
                Some(key)
            }
        }
    }
}
