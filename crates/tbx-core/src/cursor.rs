// SPDX-License-Identifier: MIT OR Apache-2.0
//! The advisory progress cursor.
//!
//! The cursor is best-effort: replay after a crash may re-deliver the last
//! event, so everything keyed on an event id must be idempotent. Timestamps
//! are canonically RFC-3339 strings; numeric ms-since-epoch is accepted on
//! read because older writers stored numbers.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A cursor timestamp with backward-compatible decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorTimestamp(pub DateTime<Utc>);

impl CursorTimestamp {
    /// The current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl From<DateTime<Utc>> for CursorTimestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl Serialize for CursorTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for CursorTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Text(String),
            Millis(i64),
            Float(f64),
        }

        let dt = match Wire::deserialize(deserializer)? {
            Wire::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map_err(|e| D::Error::custom(format!("invalid RFC-3339 timestamp: {e}")))?
                .with_timezone(&Utc),
            Wire::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| D::Error::custom("timestamp out of range"))?,
            Wire::Float(ms) => Utc
                .timestamp_millis_opt(ms as i64)
                .single()
                .ok_or_else(|| D::Error::custom("timestamp out of range"))?,
        };
        Ok(Self(dt))
    }
}

/// Persisted progress through the upstream event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Id of the last fully processed event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Creation time of that event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<CursorTimestamp>,
    /// When this cursor was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<CursorTimestamp>,
}
