use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::{SegmentId, ENCODED_LEN};
use crate::segment::{self, SegmentRange};

/// One end of a query: a wall-clock instant and the identifier it maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBound {
    pub time: DateTime<Utc>,
    pub id: SegmentId,
}

impl TimeBound {
    /// Lower bound at `time`: the smallest identifier mintable then.
    #[must_use]
    pub fn lower(time: DateTime<Utc>) -> Self {
        Self {
            time,
            id: SegmentId::from_datetime(time),
        }
    }

    /// Upper bound at `time`: the largest identifier mintable then.
    #[must_use]
    pub fn upper(time: DateTime<Utc>) -> Self {
        Self {
            time,
            id: SegmentId::max_for_datetime(time),
        }
    }

    /// Exact bound at a known identifier.
    #[must_use]
    pub fn from_id(id: SegmentId) -> Self {
        Self {
            time: id.datetime(),
            id,
        }
    }

    /// Parses a lower bound from a segment id or an RFC 3339 timestamp.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTime` when the text is neither.
    pub fn parse_lower(text: &str) -> CoreResult<Self> {
        parse_bound(text, Self::lower)
    }

    /// Parses an upper bound from a segment id or an RFC 3339 timestamp.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTime` when the text is neither.
    pub fn parse_upper(text: &str) -> CoreResult<Self> {
        parse_bound(text, Self::upper)
    }
}

fn parse_bound(text: &str, from_time: fn(DateTime<Utc>) -> TimeBound) -> CoreResult<TimeBound> {
    let text = text.trim();
    if text.len() == ENCODED_LEN {
        if let Ok(id) = text.parse::<SegmentId>() {
            return Ok(TimeBound::from_id(id));
        }
    }
    DateTime::parse_from_rfc3339(text)
        .map(|t| from_time(t.with_timezone(&Utc)))
        .map_err(|_| CoreError::InvalidTime {
            value: text.to_string(),
        })
}

/// Query over archived segments, expressed as a pair of time bounds.
///
/// `from` may sort after `to`; such a query simply matches nothing that
/// lies strictly between them and is never rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRange {
    pub from: TimeBound,
    pub to: TimeBound,
}

impl QueryRange {
    #[must_use]
    pub const fn new(from: TimeBound, to: TimeBound) -> Self {
        Self { from, to }
    }

    /// Query between two instants.
    #[must_use]
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self::new(TimeBound::lower(from), TimeBound::upper(to))
    }

    /// Query from `from` through the current instant.
    #[must_use]
    pub fn since(from: DateTime<Utc>) -> Self {
        Self::between(from, Utc::now())
    }

    /// Parses both bounds; see [`TimeBound::parse_lower`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTime` when either bound fails to parse.
    pub fn parse(from: &str, to: &str) -> CoreResult<Self> {
        Ok(Self::new(
            TimeBound::parse_lower(from)?,
            TimeBound::parse_upper(to)?,
        ))
    }

    /// True iff the identifier span of the query intersects `range`.
    #[must_use]
    pub fn overlaps(&self, range: &SegmentRange) -> bool {
        segment::overlaps(self.from.id, self.to.id, range.low(), range.high())
    }
}
