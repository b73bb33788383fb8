//! Segment ranges and their object-key encoding.
//!
//! A sealed segment is identified by the closed range of [`SegmentId`]s it
//! holds. In cold storage that range doubles as the object name:
//!
//! ```text
//! 01F5YA5BHRMSAGN154K4000000-01F5YC8JST5JKMJXBB9R000000.gz
//! └──────── low ───────────┘ └──────── high ──────────┘└┬┘
//!                                                 compressed
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::SegmentId;

/// Suffix marking a gzip-compressed cold object.
pub const COMPRESSED_SUFFIX: &str = ".gz";

/// Separator between the low and high bound.
pub const KEY_SEPARATOR: char = '-';

/// State extensions the local segment store appends to file names.
pub const LOCAL_STATE_EXTENSIONS: &[&str] = &[".active", ".flushed", ".reading", ".trashed"];

/// Closed interval `[low, high]` of segment identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentRange {
    low: SegmentId,
    high: SegmentId,
}

impl SegmentRange {
    /// Creates a range, rejecting `low > high`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidRange` when the bounds are inverted.
    pub fn new(low: SegmentId, high: SegmentId) -> CoreResult<Self> {
        if low > high {
            return Err(CoreError::InvalidRange {
                low: low.to_string(),
                high: high.to_string(),
            });
        }
        Ok(Self { low, high })
    }

    /// Degenerate range holding a single identifier.
    #[must_use]
    pub const fn single(id: SegmentId) -> Self {
        Self { low: id, high: id }
    }

    #[must_use]
    pub const fn low(&self) -> SegmentId {
        self.low
    }

    #[must_use]
    pub const fn high(&self) -> SegmentId {
        self.high
    }

    /// True iff the two closed intervals share at least one point.
    #[must_use]
    pub fn overlaps(&self, other: &SegmentRange) -> bool {
        overlaps(self.low, self.high, other.low, other.high)
    }

    /// True iff `id` lies within the range.
    #[must_use]
    pub fn contains(&self, id: SegmentId) -> bool {
        self.low <= id && id <= self.high
    }
}

impl fmt::Display for SegmentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.low, KEY_SEPARATOR, self.high)
    }
}

/// Overlap of `[a, b]` and `[c, d]` without assuming either is well-ordered.
pub(crate) fn overlaps(a: SegmentId, b: SegmentId, c: SegmentId, d: SegmentId) -> bool {
    a <= d && c <= b
}

/// A segment range as stored in the blob store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    range: SegmentRange,
    compressed: bool,
}

impl SegmentKey {
    #[must_use]
    pub const fn new(range: SegmentRange, compressed: bool) -> Self {
        Self { range, compressed }
    }

    /// Formats `low-high`, appending `.gz` when `compressed`.
    #[must_use]
    pub fn encode(range: &SegmentRange, compressed: bool) -> String {
        Self::new(*range, compressed).to_string()
    }

    /// Parses an object key.
    ///
    /// The `.gz` suffix is optional and only sets [`SegmentKey::is_compressed`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::MalformedKey` unless the key is exactly two valid
    /// identifiers around the separator with `low <= high`.
    pub fn decode(key: &str) -> CoreResult<Self> {
        let (body, compressed) = match key.strip_suffix(COMPRESSED_SUFFIX) {
            Some(body) => (body, true),
            None => (key, false),
        };

        let tokens: Vec<&str> = body.split(KEY_SEPARATOR).collect();
        if tokens.len() != 2 {
            return Err(CoreError::malformed_key(
                key,
                format!("expected 2 identifiers, found {}", tokens.len()),
            ));
        }

        let low: SegmentId = tokens[0]
            .parse()
            .map_err(|e: CoreError| CoreError::malformed_key(key, e.to_string()))?;
        let high: SegmentId = tokens[1]
            .parse()
            .map_err(|e: CoreError| CoreError::malformed_key(key, e.to_string()))?;
        let range = SegmentRange::new(low, high)
            .map_err(|e| CoreError::malformed_key(key, e.to_string()))?;

        Ok(Self { range, compressed })
    }

    /// Parses a local segment file name, ignoring its state extension.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::MalformedKey` when the stem is not a valid key.
    pub fn from_file_name(name: &str) -> CoreResult<Self> {
        let stem = LOCAL_STATE_EXTENSIONS
            .iter()
            .find_map(|ext| name.strip_suffix(ext))
            .unwrap_or(name);
        Self::decode(stem)
    }

    #[must_use]
    pub const fn range(&self) -> SegmentRange {
        self.range
    }

    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Same range, marked as compressed cold storage.
    #[must_use]
    pub const fn compressed(self) -> Self {
        Self {
            range: self.range,
            compressed: true,
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.range)?;
        if self.compressed {
            f.write_str(COMPRESSED_SUFFIX)?;
        }
        Ok(())
    }
}

impl FromStr for SegmentKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOW: &str = "01F5YA5BHRMSAGN154K4000000";
    const HIGH: &str = "01F5YC8JST5JKMJXBB9R000000";

    fn range() -> SegmentRange {
        SegmentRange::new(LOW.parse().unwrap(), HIGH.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_encode() {
        assert_eq!(SegmentKey::encode(&range(), false), format!("{LOW}-{HIGH}"));
        assert_eq!(SegmentKey::encode(&range(), true), format!("{LOW}-{HIGH}.gz"));
    }

    #[test]
    fn test_decode_strips_suffix() {
        let plain = SegmentKey::decode(&format!("{LOW}-{HIGH}")).unwrap();
        let gz = SegmentKey::decode(&format!("{LOW}-{HIGH}.gz")).unwrap();
        assert_eq!(plain.range(), gz.range());
        assert!(!plain.is_compressed());
        assert!(gz.is_compressed());
    }

    #[test]
    fn test_decode_rejects_wrong_token_count() {
        for key in [
            LOW.to_string(),
            format!("{LOW}-{HIGH}-{HIGH}"),
            String::new(),
            ".gz".to_string(),
            format!("{LOW}-"),
        ] {
            assert!(
                matches!(SegmentKey::decode(&key), Err(CoreError::MalformedKey { .. })),
                "{key:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_decode_rejects_inverted_range() {
        let err = SegmentKey::decode(&format!("{HIGH}-{LOW}.gz")).unwrap_err();
        assert!(matches!(err, CoreError::MalformedKey { .. }));
    }

    #[test]
    fn test_from_file_name() {
        let key = SegmentKey::from_file_name(&format!("{LOW}-{HIGH}.trashed")).unwrap();
        assert_eq!(key.range(), range());
        assert!(!key.is_compressed());
        assert_eq!(key.compressed().to_string(), format!("{LOW}-{HIGH}.gz"));

        assert!(SegmentKey::from_file_name("testfile").is_err());
    }

    #[test]
    fn test_overlap_degenerate() {
        let id: SegmentId = LOW.parse().unwrap();
        let point = SegmentRange::single(id);
        assert!(point.overlaps(&point));
        assert!(point.overlaps(&range()));
        assert!(range().overlaps(&point));

        let after = SegmentRange::single(SegmentId::from(range().high().as_u128() + 1));
        assert!(!after.overlaps(&range()));
    }

    #[test]
    fn test_new_rejects_inverted() {
        let low: SegmentId = LOW.parse().unwrap();
        let high: SegmentId = HIGH.parse().unwrap();
        assert!(matches!(
            SegmentRange::new(high, low),
            Err(CoreError::InvalidRange { .. })
        ));
    }
}
