use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::CoreError;

/// Length of the canonical text form.
pub const ENCODED_LEN: usize = 26;

const ENTROPY_MASK: u128 = (1u128 << 80) - 1;

/// Sortable 128-bit segment boundary identifier.
///
/// The top 48 bits hold milliseconds since the Unix epoch and the low 80 bits
/// hold entropy, so identifiers minted later sort after earlier ones. The
/// canonical text form is 26 upper-case Crockford base32 characters whose
/// lexicographic order matches the numeric order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(Ulid);

impl SegmentId {
    /// Smallest representable identifier.
    pub const MIN: Self = Self(Ulid(0));

    /// Largest representable identifier.
    pub const MAX: Self = Self(Ulid(u128::MAX));

    /// Generates a new identifier for the current instant with random entropy.
    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Builds an identifier from a millisecond timestamp and entropy bits.
    ///
    /// Timestamps above 48 bits are truncated; entropy is masked to 80 bits.
    #[must_use]
    pub fn from_parts(timestamp_ms: u64, entropy: u128) -> Self {
        Self(Ulid::from_parts(timestamp_ms, entropy))
    }

    /// Lowest identifier that can be minted at `time` (zero entropy).
    #[must_use]
    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        Self::from_parts(clamp_millis(time), 0)
    }

    /// Highest identifier that can be minted at `time` (all entropy bits set).
    #[must_use]
    pub fn max_for_datetime(time: DateTime<Utc>) -> Self {
        Self::from_parts(clamp_millis(time), ENTROPY_MASK)
    }

    /// Milliseconds since the Unix epoch embedded in the identifier.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    /// Wall-clock instant embedded in the identifier.
    #[must_use]
    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.0.datetime())
    }

    /// Returns the inner ULID value.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the raw 128-bit value.
    #[must_use]
    pub const fn as_u128(&self) -> u128 {
        self.0 .0
    }
}

fn clamp_millis(time: DateTime<Utc>) -> u64 {
    u64::try_from(time.timestamp_millis()).unwrap_or(0)
}

impl From<u128> for SegmentId {
    fn from(value: u128) -> Self {
        Self(Ulid::from(value))
    }
}

impl From<Ulid> for SegmentId {
    fn from(value: Ulid) -> Self {
        Self(value)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SegmentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &'static str| CoreError::InvalidId {
            value: s.to_string(),
            reason,
        };

        // 26 * 5 = 130 bits, so the leading character carries only 3.
        if s.len() == ENCODED_LEN && !matches!(s.as_bytes()[0], b'0'..=b'7') {
            return Err(invalid("value overflows 128 bits"));
        }

        Ulid::from_string(&s.to_ascii_uppercase())
            .map(Self)
            .map_err(|e| match e {
                ulid::DecodeError::InvalidLength => invalid("expected 26 characters"),
                _ => invalid("invalid base32 character"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_and_display_canonical() {
        let text = "01F5YA5BHRMSAGN154K4000000";
        let id: SegmentId = text.parse().unwrap();
        assert_eq!(id.to_string(), text);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let upper: SegmentId = "01F5YA5BHRMSAGN154K4000000".parse().unwrap();
        let lower: SegmentId = "01f5ya5bhrmsagn154k4000000".parse().unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn test_embedded_timestamp() {
        let id: SegmentId = "01F5YA5BHRMSAGN154K4000000".parse().unwrap();
        let expected = Utc.with_ymd_and_hms(2021, 5, 17, 23, 21, 46).unwrap();
        assert_eq!(id.datetime().timestamp(), expected.timestamp());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            "short".parse::<SegmentId>(),
            Err(CoreError::InvalidId { .. })
        ));
        assert!("01F5YA5BHRMSAGN154K400000U".parse::<SegmentId>().is_err());
        assert!("81F5YA5BHRMSAGN154K4000000".parse::<SegmentId>().is_err());
        assert!("7ZZZZZZZZZZZZZZZZZZZZZZZZZ".parse::<SegmentId>().is_ok());
    }

    #[test]
    fn test_bounds_for_datetime() {
        let t = Utc.with_ymd_and_hms(2021, 5, 12, 0, 0, 0).unwrap();
        let low = SegmentId::from_datetime(t);
        let high = SegmentId::max_for_datetime(t);
        assert!(low < high);
        assert_eq!(low.timestamp_ms(), high.timestamp_ms());
        assert_eq!(low.datetime(), t);
    }

    #[test]
    fn test_text_order_matches_value_order() {
        let a = SegmentId::from_parts(1_000, 5);
        let b = SegmentId::from_parts(1_000, 6);
        let c = SegmentId::from_parts(2_000, 0);
        assert!(a < b && b < c);
        assert!(a.to_string() < b.to_string());
        assert!(b.to_string() < c.to_string());
    }

    #[test]
    fn test_extremes_round_trip_through_text() {
        assert_eq!(SegmentId::MIN.to_string(), "00000000000000000000000000");
        assert_eq!(SegmentId::MAX.to_string(), "7ZZZZZZZZZZZZZZZZZZZZZZZZZ");
        assert_eq!("7ZZZZZZZZZZZZZZZZZZZZZZZZZ".parse::<SegmentId>().unwrap(), SegmentId::MAX);
    }

    #[test]
    fn test_new_ids_are_increasing_in_time() {
        let a = SegmentId::new();
        let b = SegmentId::new();
        assert!(a.timestamp_ms() <= b.timestamp_ms());
    }

    #[test]
    fn test_serde_as_string() {
        let id: SegmentId = "01F5YC8JST5JKMJXBB9R000000".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"01F5YC8JST5JKMJXBB9R000000\"");
        let back: SegmentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
