//! Text encoding for backends without native uuid/timestamp types.
//!
//! # Invariants
//! - Uuids encode as lowercase hyphenated 36-character text.
//! - Timestamps encode as `YYYY-MM-DDTHH:MM:SS.ffffffZ`: UTC, fixed width,
//!   microsecond precision. Lexical order equals time order.

use crate::model::report::truncate_to_micros;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use uuid::Uuid;

pub fn encode_uuid(value: Uuid) -> String {
    value.as_hyphenated().to_string()
}

pub fn decode_uuid(value: &str) -> Option<Uuid> {
    if value.len() != 36 {
        return None;
    }
    Uuid::parse_str(value).ok()
}

pub fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Rounds up to the next whole microsecond. Used for inclusive lower
/// bounds, where truncation would admit earlier instants.
pub fn ceil_to_micros(value: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = truncate_to_micros(value);
    if truncated < value {
        truncated + TimeDelta::microseconds(1)
    } else {
        truncated
    }
}

/// Accepts any RFC 3339 offset and normalizes to UTC.
pub fn decode_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::{ceil_to_micros, decode_timestamp, decode_uuid, encode_timestamp, encode_uuid};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[test]
    fn timestamp_text_is_fixed_width_utc() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(encode_timestamp(ts), "2024-03-09T07:05:01.000000Z");
    }

    #[test]
    fn timestamp_text_orders_lexically() {
        let earlier = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let later = earlier + chrono::TimeDelta::microseconds(1);
        assert!(encode_timestamp(earlier) < encode_timestamp(later));
    }

    #[test]
    fn decode_normalizes_offsets_to_utc() {
        let decoded = decode_timestamp("2024-03-09T09:05:01.250000+02:00").unwrap();
        assert_eq!(encode_timestamp(decoded), "2024-03-09T07:05:01.250000Z");
    }

    #[test]
    fn ceil_only_moves_partial_microseconds() {
        let whole = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(ceil_to_micros(whole), whole);
        let partial = whole + chrono::TimeDelta::nanoseconds(1);
        assert_eq!(
            ceil_to_micros(partial),
            whole + chrono::TimeDelta::microseconds(1)
        );
    }

    #[test]
    fn uuid_text_is_lowercase_hyphenated() {
        let id = Uuid::parse_str("6F9619FF8B86D011B42D00C04FC964FF").unwrap();
        let text = encode_uuid(id);
        assert_eq!(text, "6f9619ff-8b86-d011-b42d-00c04fc964ff");
        assert_eq!(decode_uuid(&text), Some(id));
        assert_eq!(decode_uuid("6f9619ff8b86d011b42d00c04fc964ff"), None);
    }
}
