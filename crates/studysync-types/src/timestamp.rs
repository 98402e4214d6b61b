//! Timestamp encoding shared by the store and the feed.
//!
//! Timestamps are written as fixed-width RFC 3339 strings with microsecond
//! precision and a `Z` suffix, so lexical order in SQLite equals
//! chronological order. Parsing is lenient: the upstream feed is not
//! schema-guaranteed and may send offsets or omit the zone entirely.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Formats a timestamp in the canonical storage form.
pub fn format(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp, accepting RFC 3339 with any offset or a naive
/// `YYYY-MM-DD[T ]HH:MM:SS[.f]` string interpreted as UTC.
pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(rfc_err) => {
            for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(raw, pattern) {
                    return Ok(naive.and_utc());
                }
            }
            Err(rfc_err)
        }
    }
}

/// `serde(with = ...)` adapter for `DateTime<Utc>` fields.
pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(ts))
}

/// `serde(with = ...)` adapter for `DateTime<Utc>` fields.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(serde::de::Error::custom)
}
