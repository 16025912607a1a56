//! Normalization of loosely-typed activity records into the strict model.
//!
//! Timestamps are parsed exactly once, here. Everything past this boundary
//! works with `DateTime<Utc>`.

use crate::error::{CoreError, Result};
use crate::schema::Activity;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Integers below this are treated as seconds, anything larger as milliseconds.
const SECONDS_CUTOFF: i64 = 100_000_000_000;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Number(i64),
    Text(String),
}

impl RawTimestamp {
    pub fn parse(&self) -> Result<DateTime<Utc>> {
        match self {
            RawTimestamp::Number(n) => from_epoch(*n),
            RawTimestamp::Text(s) => parse_text(s),
        }
    }
}

fn from_epoch(n: i64) -> Result<DateTime<Utc>> {
    let parsed = if n.abs() < SECONDS_CUTOFF {
        DateTime::from_timestamp(n, 0)
    } else {
        DateTime::from_timestamp_millis(n)
    };
    parsed.ok_or_else(|| CoreError::InvalidTimestamp(n.to_string()))
}

fn parse_text(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CoreError::InvalidTimestamp("empty".to_string()));
    }
    if let Ok(n) = s.parse::<i64>() {
        return from_epoch(n);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(CoreError::InvalidTimestamp(s.to_string()))
}

/// Loosely-typed activity as produced by importers and external feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawActivity {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start_time: Option<RawTimestamp>,
    #[serde(default)]
    pub end_time: Option<RawTimestamp>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub source_event_ids: Vec<String>,
}

impl TryFrom<RawActivity> for Activity {
    type Error = CoreError;

    fn try_from(raw: RawActivity) -> Result<Self> {
        let id = raw.id.trim().to_string();
        if id.is_empty() {
            return Err(CoreError::Source("activity without id".to_string()));
        }

        let start_time = raw
            .start_time
            .as_ref()
            .ok_or_else(|| CoreError::InvalidTimestamp(format!("{id}: missing start_time")))?
            .parse()?;
        let end_time = match raw.end_time.as_ref() {
            Some(ts) => ts.parse()?,
            None => start_time,
        }
        .max(start_time);

        let name = non_blank(raw.name);
        let title = non_blank(raw.title)
            .or_else(|| name.clone())
            .unwrap_or_else(|| id.clone());

        Ok(Activity {
            id,
            title,
            description: non_blank(raw.description),
            name,
            start_time,
            end_time,
            version: raw.version.unwrap_or(0),
            source_event_ids: raw.source_event_ids.into_iter().collect::<BTreeSet<_>>(),
            event_summaries: Vec::new(),
        })
    }
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// `YYYY-MM-DD` of `ts` as seen from `offset`.
pub fn day_key(ts: &DateTime<Utc>, offset: &FixedOffset) -> String {
    ts.with_timezone(offset).format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_epoch_seconds_and_millis() {
        let expected = utc("2024-01-25T00:20:00Z");
        assert_eq!(RawTimestamp::Number(1706142000).parse().unwrap(), expected);
        assert_eq!(RawTimestamp::Number(1706142000000).parse().unwrap(), expected);
        assert_eq!(
            RawTimestamp::Text("1706142000000".to_string()).parse().unwrap(),
            expected
        );
    }

    #[test]
    fn test_parse_text_formats() {
        assert_eq!(
            RawTimestamp::Text("2024-01-02T10:00:00+09:00".to_string())
                .parse()
                .unwrap(),
            utc("2024-01-02T01:00:00Z")
        );
        assert_eq!(
            RawTimestamp::Text("2024-01-02 10:00:00".to_string())
                .parse()
                .unwrap(),
            utc("2024-01-02T10:00:00Z")
        );
        assert_eq!(
            RawTimestamp::Text("2024-01-02T10:00:00.250".to_string())
                .parse()
                .unwrap()
                .timestamp_millis(),
            utc("2024-01-02T10:00:00Z").timestamp_millis() + 250
        );
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "   ", "yesterday", "2024-13-01 00:00:00"] {
            assert!(matches!(
                RawTimestamp::Text(bad.to_string()).parse(),
                Err(CoreError::InvalidTimestamp(_))
            ));
        }
    }

    #[test]
    fn test_raw_activity_normalization() {
        let raw: RawActivity = serde_json::from_str(
            r#"{
                "id": "a1",
                "title": "  ",
                "name": "Writing",
                "start_time": "2024-01-01T10:00:00Z",
                "end_time": 1704099600,
                "source_event_ids": ["e2", "e1", "e2"]
            }"#,
        )
        .unwrap();
        let activity = Activity::try_from(raw).unwrap();
        assert_eq!(activity.title, "Writing");
        // end before start is clamped
        assert_eq!(activity.end_time, activity.start_time);
        assert_eq!(activity.source_event_ids.len(), 2);
        assert_eq!(activity.version, 0);
    }

    #[test]
    fn test_raw_activity_missing_start() {
        let raw: RawActivity = serde_json::from_str(r#"{"id": "a1", "title": "x"}"#).unwrap();
        assert!(matches!(
            Activity::try_from(raw),
            Err(CoreError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_day_key_respects_offset() {
        let ts = utc("2024-01-01T23:30:00Z");
        let utc_offset = FixedOffset::east_opt(0).unwrap();
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        assert_eq!(day_key(&ts, &utc_offset), "2024-01-01");
        assert_eq!(day_key(&ts, &tokyo), "2024-01-02");
    }
}
