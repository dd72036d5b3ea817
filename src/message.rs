use chrono::{DateTime, Utc};
use crc32c::crc32c;
use thiserror::Error;
use uuid::Uuid;

/// A decoded broker message, queued for the storage writer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub received_at: DateTime<Utc>,
    pub device_id: String,
    pub topic: String,
    pub payload: String,
    pub fingerprint: String,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("topic {0:?} has no device identifier segment")]
    MissingDeviceId(String),
    #[error("payload is not valid UTF-8: {0}")]
    Payload(#[from] std::str::Utf8Error),
}

/// Decode a raw publish into an [`InboundMessage`]. Runs on the broker
/// delivery task, so it never touches the store; a failure here drops the
/// single message and nothing else.
pub fn decode(
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<InboundMessage, DecodeError> {
    let device_id = device_id(topic)
        .ok_or_else(|| DecodeError::MissingDeviceId(topic.to_string()))?
        .to_string();
    let payload = std::str::from_utf8(payload)?.to_string();
    let fingerprint = fingerprint(topic, &payload, received_at);
    Ok(InboundMessage {
        received_at,
        device_id,
        topic: topic.to_string(),
        payload,
        fingerprint,
    })
}

/// Second path segment of the topic, e.g. `things/<device>/...`.
pub fn device_id(topic: &str) -> Option<&str> {
    topic.split('/').nth(1).filter(|segment| !segment.is_empty())
}

/// Trailing segment after the last `/`; the whole topic when it has none.
pub fn attribute(topic: &str) -> &str {
    match topic.rfind('/') {
        Some(idx) => &topic[idx + 1..],
        None => topic,
    }
}

/// Deterministic checksum component of the fingerprint.
pub fn checksum(topic: &str, payload: &str, serial: &str) -> String {
    let mut data = String::with_capacity(topic.len() + payload.len() + serial.len());
    data.push_str(topic);
    data.push_str(payload);
    data.push_str(serial);
    format!("{:08x}", crc32c(data.as_bytes()))
}

/// Per-message opaque token: content checksum plus a random suffix. The
/// suffix makes the token unique across redeliveries of the same payload,
/// which also means it is an integrity/debugging aid, not a dedup key.
pub fn fingerprint(topic: &str, payload: &str, received_at: DateTime<Utc>) -> String {
    let serial = received_at.format("%Y%m%d%H%M%S%6f").to_string();
    let token = Uuid::new_v4().simple().to_string();
    format!("{}{}", checksum(topic, payload, &serial), token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn device_id_is_second_segment() {
        assert_eq!(device_id("things/350081091492945/battlevel"), Some("350081091492945"));
        assert_eq!(device_id("a/b"), Some("b"));
        assert_eq!(device_id("a/b/c/d/e"), Some("b"));
    }

    #[test]
    fn device_id_missing_segment_is_none() {
        assert_eq!(device_id("noslash"), None);
        assert_eq!(device_id("trailing/"), None);
        assert_eq!(device_id("a//b"), None);
    }

    #[test]
    fn attribute_is_trailing_segment() {
        assert_eq!(attribute("things/350081091492945/battlevel"), "battlevel");
        assert_eq!(attribute("a/b/c/swd_pingrsp"), "swd_pingrsp");
        assert_eq!(attribute("bare"), "bare");
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = checksum("things/1/temp", "21.5", "20260807120000000001");
        let b = checksum("things/1/temp", "21.5", "20260807120000000001");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        let c = checksum("things/1/temp", "21.5", "20260807120000000002");
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprints_differ_for_identical_content() {
        let at = Utc.with_ymd_and_hms(2026, 8, 7, 12, 0, 0).unwrap();
        let a = fingerprint("things/1/temp", "21.5", at);
        let b = fingerprint("things/1/temp", "21.5", at);
        assert_eq!(a.len(), 8 + 32);
        assert_eq!(&a[..8], &b[..8]);
        assert_ne!(a, b);
    }

    #[test]
    fn decode_extracts_identity_and_payload() {
        let at = Utc::now();
        let msg = decode("things/350081091492945/battlevel", b"88", at).unwrap();
        assert_eq!(msg.device_id, "350081091492945");
        assert_eq!(msg.topic, "things/350081091492945/battlevel");
        assert_eq!(msg.payload, "88");
        assert_eq!(msg.received_at, at);
        assert_eq!(msg.fingerprint.len(), 40);
    }

    #[test]
    fn decode_rejects_bad_input() {
        let at = Utc::now();
        assert!(matches!(
            decode("noslash", b"x", at),
            Err(DecodeError::MissingDeviceId(_))
        ));
        assert!(matches!(
            decode("things/1/attr", &[0xff, 0xfe], at),
            Err(DecodeError::Payload(_))
        ));
    }
}
