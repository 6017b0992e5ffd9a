//! Message codec for the order wire format.
//!
//! ```text
//! {"order_id": "...", "customer_id": "...", "items": ["..."], "timestamp": "<ISO-8601>"}
//! ```
//!
//! Timestamps are written as RFC 3339 UTC with full sub-second precision.
//! On decode both RFC 3339 (any offset) and naive ISO-8601 local
//! timestamps are accepted; naive values are taken as UTC.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::MessageEnvelope;
use super::error::{DomainError, Result};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Deserialize)]
struct WireEnvelope {
    order_id: Option<String>,
    customer_id: Option<String>,
    items: Option<Vec<String>>,
    timestamp: Option<String>,
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    order_id: &'a str,
    customer_id: &'a str,
    items: &'a [String],
    timestamp: String,
}

/// Encode an envelope into its UTF-8 JSON payload
pub fn encode(envelope: &MessageEnvelope) -> Result<Vec<u8>> {
    let wire = WireEnvelopeRef {
        order_id: &envelope.order_id,
        customer_id: &envelope.customer_id,
        items: &envelope.items,
        timestamp: envelope
            .timestamp
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
    };
    serde_json::to_vec(&wire).map_err(|e| DomainError::MalformedMessage(e.to_string()))
}

/// Decode and validate a payload.
///
/// Every field must be present (and non-null) and the timestamp must parse;
/// anything else is `DomainError::MalformedMessage`.
pub fn decode(payload: &[u8]) -> Result<MessageEnvelope> {
    let wire: WireEnvelope = serde_json::from_slice(payload)
        .map_err(|e| DomainError::MalformedMessage(e.to_string()))?;

    let order_id = required(wire.order_id, "order_id")?;
    let customer_id = required(wire.customer_id, "customer_id")?;
    let items = required(wire.items, "items")?;
    let raw_timestamp = required(wire.timestamp, "timestamp")?;
    let timestamp = parse_timestamp(&raw_timestamp)?;

    Ok(MessageEnvelope {
        order_id,
        customer_id,
        items,
        timestamp,
    })
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| DomainError::MalformedMessage(format!("missing field `{}`", field)))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| DomainError::MalformedMessage(format!("unparseable timestamp `{}`", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> MessageEnvelope {
        MessageEnvelope::new(
            "express_4821",
            "cust_512",
            vec!["item_2".into(), "item_5".into()],
            Utc.with_ymd_and_hms(2024, 11, 30, 1, 25, 37).unwrap()
                + chrono::TimeDelta::nanoseconds(123_456_789),
        )
    }

    #[test]
    fn round_trip_is_field_for_field_equal() {
        let original = sample();
        let bytes = encode(&original).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn accepts_naive_python_isoformat() {
        let payload = br#"{"order_id":"standard_1000","customer_id":"cust_100","items":["item_1"],"timestamp":"2024-11-30T01:25:37.123456"}"#;
        let env = decode(payload).unwrap();
        assert_eq!(
            env.timestamp,
            Utc.with_ymd_and_hms(2024, 11, 30, 1, 25, 37).unwrap()
                + chrono::TimeDelta::microseconds(123_456)
        );
    }

    #[test]
    fn accepts_offset_timestamps() {
        let payload = br#"{"order_id":"p","customer_id":"c","items":[],"timestamp":"2024-11-30T03:25:37+02:00"}"#;
        let env = decode(payload).unwrap();
        assert_eq!(
            env.timestamp,
            Utc.with_ymd_and_hms(2024, 11, 30, 1, 25, 37).unwrap()
        );
    }

    #[test]
    fn missing_field_is_malformed() {
        let payload = br#"{"order_id":"p","customer_id":"c","timestamp":"2024-11-30T01:25:37Z"}"#;
        let err = decode(payload).unwrap_err();
        assert_eq!(
            err,
            DomainError::MalformedMessage("missing field `items`".into())
        );
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let payload = br#"{"order_id":"p","customer_id":"c","items":[],"timestamp":"yesterday"}"#;
        assert!(matches!(
            decode(payload),
            Err(DomainError::MalformedMessage(msg)) if msg.contains("yesterday")
        ));
    }

    #[test]
    fn garbage_and_wrong_types_are_malformed() {
        assert!(decode(b"\xff\xfe not json").is_err());
        assert!(decode(br#"{"order_id":1,"customer_id":"c","items":[],"timestamp":"2024-11-30T01:25:37Z"}"#).is_err());
        assert!(decode(br#"{"order_id":"p","customer_id":"c","items":"item_1","timestamp":"2024-11-30T01:25:37Z"}"#).is_err());
    }
}
