//! Human time expressions for query bounds
//!
//! Accepted forms:
//! - `now`
//! - a duration ago: `45s`, `90m`, `1h30m`, `2d`
//! - an RFC 3339 timestamp: `2021-05-12T07:15:36+12:00`
//! - a canonical segment id

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use segtier_core::{SegmentId, TimeBound};

/// A parsed time expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeExpr {
    At(DateTime<Utc>),
    Id(SegmentId),
}

impl TimeExpr {
    pub fn parse(text: &str, now: DateTime<Utc>) -> Result<Self> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("now") {
            return Ok(Self::At(now));
        }
        if let Some(ago) = parse_duration(text) {
            return Ok(Self::At(now - ago));
        }
        if let Ok(time) = DateTime::parse_from_rfc3339(text) {
            return Ok(Self::At(time.with_timezone(&Utc)));
        }
        if let Ok(id) = text.parse::<SegmentId>() {
            return Ok(Self::Id(id));
        }
        Err(anyhow!(
            "`{text}` is not `now`, a duration, an RFC 3339 timestamp or a segment id"
        ))
    }

    pub fn lower(self) -> TimeBound {
        match self {
            Self::At(time) => TimeBound::lower(time),
            Self::Id(id) => TimeBound::from_id(id),
        }
    }

    pub fn upper(self) -> TimeBound {
        match self {
            Self::At(time) => TimeBound::upper(time),
            Self::Id(id) => TimeBound::from_id(id),
        }
    }
}

/// Parse `<n><unit>` groups (units `d`, `h`, `m`, `s`), e.g. `1h30m`.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let mut total = Duration::zero();
    let mut digits = String::new();
    let mut groups = 0;

    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: i64 = digits.parse().ok()?;
        digits.clear();
        let part = match c {
            'd' => Duration::try_days(n)?,
            'h' => Duration::try_hours(n)?,
            'm' => Duration::try_minutes(n)?,
            's' => Duration::try_seconds(n)?,
            _ => return None,
        };
        total = total.checked_add(&part)?;
        groups += 1;
    }

    // Trailing digits without a unit
    if !digits.is_empty() || groups == 0 {
        return None;
    }
    Some(total)
}
