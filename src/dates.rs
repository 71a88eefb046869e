//! Date and datetime conversion between wire strings and chrono values.
//!
//! The server has emitted several formats over time: epoch seconds, `MM/DD/YYYY`,
//! ISO dates and ISO datetimes with or without a UTC designator. Everything is
//! normalized to [`DateValue`], and [`DateCodec::encode`] writes the canonical form
//! back out.

use chrono::{
  DateTime, Duration, FixedOffset, Local, LocalResult, NaiveDate, NaiveDateTime, Offset,
  TimeZone, Utc,
};
use serde_json::Value;

/// Which native representation an attribute expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateKind {
  Date,
  DateTime,
}

/// A decoded date attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateValue {
  Date(NaiveDate),
  DateTime(DateTime<Utc>),
}

impl DateValue {
  pub fn kind(&self) -> DateKind {
    match self {
      DateValue::Date(_) => DateKind::Date,
      DateValue::DateTime(_) => DateKind::DateTime,
    }
  }
}

/// Intermediate parse result: either a pure calendar date or a point in time.
enum Parsed {
  Calendar(NaiveDate),
  Instant(DateTime<Utc>),
}

/// Bidirectional date codec.
///
/// Wall-clock readings without a UTC designator are interpreted in the codec's
/// zone (the process local zone unless a fixed offset is configured) and then
/// shifted by the UTC offset that was in effect at that instant. The net result
/// reads the wall clock as UTC regardless of which DST period it falls in.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateCodec {
  zone: Option<FixedOffset>,
}

impl DateCodec {
  /// Codec that interprets unqualified readings in the local zone.
  pub fn local() -> Self {
    Self { zone: None }
  }

  /// Codec that interprets unqualified readings at a fixed UTC offset.
  pub fn with_fixed_offset(offset: FixedOffset) -> Self {
    Self { zone: Some(offset) }
  }

  /// Build from an optional offset in minutes east of UTC.
  pub fn from_offset_minutes(minutes: Option<i32>) -> Self {
    match minutes.and_then(|m| FixedOffset::east_opt(m * 60)) {
      Some(offset) => Self::with_fixed_offset(offset),
      None => Self::local(),
    }
  }

  /// Decode a raw wire value. Anything unparseable yields `None`.
  pub fn decode(&self, raw: &Value, kind: DateKind) -> Option<DateValue> {
    let parsed = match raw {
      Value::Number(n) => Parsed::Instant(from_epoch(n.as_f64()?)?),
      Value::String(s) => self.parse_str(s.trim())?,
      _ => return None,
    };

    Some(match (kind, parsed) {
      (DateKind::Date, Parsed::Calendar(d)) => DateValue::Date(d),
      (DateKind::Date, Parsed::Instant(t)) => DateValue::Date(t.date_naive()),
      (DateKind::DateTime, Parsed::Calendar(d)) => {
        DateValue::DateTime(d.and_hms_opt(0, 0, 0)?.and_utc())
      }
      (DateKind::DateTime, Parsed::Instant(t)) => DateValue::DateTime(t),
    })
  }

  /// Encode a value in the canonical wire form.
  pub fn encode(&self, value: &DateValue) -> String {
    match value {
      DateValue::Date(d) => d.format("%Y-%m-%d").to_string(),
      DateValue::DateTime(t) => t.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
    }
  }

  fn parse_str(&self, s: &str) -> Option<Parsed> {
    if s.is_empty() {
      return None;
    }

    if s.chars().all(|c| c.is_ascii_digit() || c == '.') {
      return from_epoch(s.parse().ok()?).map(Parsed::Instant);
    }

    for fmt in ["%m/%d/%Y", "%Y-%m-%d"] {
      if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
        return Some(Parsed::Calendar(d));
      }
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
      return Some(Parsed::Instant(t.with_timezone(&Utc)));
    }
    if let Ok(t) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
      return Some(Parsed::Instant(t.with_timezone(&Utc)));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
      if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
        return Some(Parsed::Instant(self.correct(naive)));
      }
    }

    None
  }

  fn correct(&self, naive: NaiveDateTime) -> DateTime<Utc> {
    match self.zone {
      Some(offset) => historical_correction(&offset, naive),
      None => historical_correction(&Local, naive),
    }
  }
}

/// Read `naive` in `zone`, then add back the offset active at that instant.
fn historical_correction<Tz: TimeZone>(zone: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
  let local = match zone.from_local_datetime(&naive) {
    LocalResult::Single(t) => t,
    LocalResult::Ambiguous(earliest, _) => earliest,
    // Skipped by a DST transition; there is no instant to correct from.
    LocalResult::None => return naive.and_utc(),
  };
  let offset = Duration::seconds(i64::from(local.offset().fix().local_minus_utc()));
  local.with_timezone(&Utc) + offset
}

fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
  if !secs.is_finite() {
    return None;
  }
  let whole = secs.floor();
  let nanos = ((secs - whole) * 1e9).round() as u32;
  DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}
