// src/api/envelope.rs
//! Response envelope decoding.
//!
//! Most endpoints answer with `{"success": bool, "data": ..., "message": ...,
//! "error": ...}`; legacy and boolean endpoints answer with a bare value or an
//! empty body. [`classify`] makes the attempt sequence explicit: envelope
//! first, bare value second, and the envelope's own parse error is the one
//! surfaced when neither shape fits.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub pagination: Option<Value>,
    // Legacy top-level paging fields still sent by the events endpoints
    pub count: Option<u64>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub has_more: Option<bool>,
}

impl<T> ResponseEnvelope<T> {
    /// Failure reason reported by the server, `error` taking precedence.
    pub fn failure_reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "API error".to_string())
    }

    pub fn pagination(&self) -> Option<Pagination> {
        Pagination::from_parts(
            self.pagination.as_ref(),
            self.count,
            self.limit,
            self.offset,
            self.has_more,
        )
    }
}

/// Envelope header without the payload, used when `data` does not fit `T`.
#[derive(Debug, Deserialize)]
struct EnvelopeStatus {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Loose view of an error body; every field is optional.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Which shape a payload turned out to have.
#[derive(Debug)]
pub enum PayloadShape<T> {
    Envelope(ResponseEnvelope<T>),
    /// Envelope with `success: false` whose `data` did not fit `T`.
    Rejected { reason: String },
    Bare(T),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Pagination {
    pub has_more: bool,
    pub total: Option<u64>,
    pub count: Option<u64>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// The server's `pagination` object as sent.
    pub raw: Option<Value>,
}

impl Pagination {
    fn from_parts(
        raw: Option<&Value>,
        count: Option<u64>,
        limit: Option<u64>,
        offset: Option<u64>,
        has_more: Option<bool>,
    ) -> Option<Self> {
        if raw.is_none() && count.is_none() && limit.is_none() && offset.is_none() && has_more.is_none()
        {
            return None;
        }

        let field = |name: &str| raw.and_then(|r| r.get(name));
        let number = |name: &str| field(name).and_then(lenient_u64);

        Some(Pagination {
            has_more: field("has_more")
                .and_then(Value::as_bool)
                .or(has_more)
                .unwrap_or(false),
            total: number("total"),
            count: number("count").or(count),
            limit: number("limit").or(limit),
            offset: number("offset").or(offset),
            raw: raw.cloned(),
        })
    }
}

// PHP backends send numbers as strings often enough to matter.
fn lenient_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// A decoded value together with any paging metadata the envelope carried.
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    pub value: T,
    pub pagination: Option<Pagination>,
}

/// Determines the payload shape: envelope, then bare `T`, then a rejected
/// envelope header. Fails with the envelope parse error otherwise.
pub fn classify<T: DeserializeOwned>(bytes: &[u8]) -> Result<PayloadShape<T>, ApiError> {
    let envelope_error = match serde_json::from_slice::<ResponseEnvelope<T>>(bytes) {
        Ok(envelope) => return Ok(PayloadShape::Envelope(envelope)),
        Err(err) => err,
    };

    if let Ok(bare) = serde_json::from_slice::<T>(bytes) {
        return Ok(PayloadShape::Bare(bare));
    }

    if let Ok(status) = serde_json::from_slice::<EnvelopeStatus>(bytes) {
        if !status.success {
            return Ok(PayloadShape::Rejected {
                reason: status
                    .error
                    .or(status.message)
                    .unwrap_or_else(|| "API error".to_string()),
            });
        }
    }

    Err(ApiError::Decoding(envelope_error.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ApiError> {
    decode_with_meta(bytes).map(|decoded| decoded.value)
}

pub fn decode_with_meta<T: DeserializeOwned>(bytes: &[u8]) -> Result<Decoded<T>, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        // A bare 2xx with no body means "ok" for boolean and void calls
        return empty_value::<T>(&[Value::Bool(true), Value::Null])
            .map(|value| Decoded {
                value,
                pagination: None,
            })
            .ok_or_else(|| ApiError::Decoding("empty response body".to_string()));
    }

    match classify::<T>(bytes)? {
        PayloadShape::Envelope(envelope) => {
            if !envelope.success {
                return Err(ApiError::Application(envelope.failure_reason()));
            }
            let pagination = envelope.pagination();
            let value = match envelope.data {
                Some(data) => data,
                None => missing_data::<T>(bytes)?,
            };
            Ok(Decoded { value, pagination })
        }
        PayloadShape::Rejected { reason } => Err(ApiError::Application(reason)),
        PayloadShape::Bare(value) => Ok(Decoded {
            value,
            pagination: None,
        }),
    }
}

/// `success: true` without `data`: collections become empty, optionals
/// become `None`, flags become `true`, and anything else gets one bare
/// decode of the whole payload before giving up.
fn missing_data<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ApiError> {
    if let Some(value) = empty_value::<T>(&[Value::Null, Value::Array(Vec::new()), Value::Bool(true)]) {
        return Ok(value);
    }
    serde_json::from_slice::<T>(bytes)
        .map_err(|_| ApiError::Decoding("response reported success but carried no data".to_string()))
}

fn empty_value<T: DeserializeOwned>(candidates: &[Value]) -> Option<T> {
    candidates
        .iter()
        .find_map(|candidate| serde_json::from_value::<T>(candidate.clone()).ok())
}

/// Pulls a human-readable reason out of a non-2xx body, if there is one.
pub fn extract_error_message(bytes: &[u8]) -> Option<String> {
    let body: ErrorBody = serde_json::from_slice(bytes).ok()?;
    [body.error, body.message]
        .into_iter()
        .flatten()
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Event {
        id: u64,
        title: String,
    }

    #[test]
    fn envelope_with_data_is_unwrapped() {
        let body = br#"{"success":true,"data":[{"id":1,"title":"Hackathon"}],"message":null}"#;
        let events: Vec<Event> = decode(body).unwrap();
        assert_eq!(
            events,
            vec![Event {
                id: 1,
                title: "Hackathon".to_string()
            }]
        );
    }

    #[test]
    fn rejected_envelope_surfaces_error_verbatim() {
        let body = br#"{"success":false,"error":"Invalid credentials"}"#;
        let err = decode::<Value>(body).unwrap_err();
        assert!(matches!(err, ApiError::Application(ref m) if m == "Invalid credentials"));

        // message is used when error is absent
        let body = r#"{"success":false,"message":"Kulüp bulunamadı"}"#.as_bytes();
        let err = decode::<Vec<Event>>(body).unwrap_err();
        assert_eq!(err.to_string(), "Kulüp bulunamadı");
    }

    #[test]
    fn rejected_envelope_with_mismatched_data_is_still_rejected() {
        let body = br#"{"success":false,"error":"Not allowed","data":{"unexpected":true}}"#;
        let err = decode::<Vec<Event>>(body).unwrap_err();
        assert!(matches!(err, ApiError::Application(ref m) if m == "Not allowed"));
    }

    #[test]
    fn bare_payload_is_accepted() {
        let body = br#"[{"id":7,"title":"Concert"}]"#;
        let events: Vec<Event> = decode(body).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 7);
    }

    #[test]
    fn original_envelope_error_is_reported() {
        let body = br#"{"unexpected":"shape"}"#;
        let err = decode::<Vec<Event>>(body).unwrap_err();
        match err {
            ApiError::Decoding(message) => assert!(message.contains("success"), "{}", message),
            other => panic!("expected decoding error, got {:?}", other),
        }
    }

    #[test]
    fn serialized_envelope_decodes_to_its_data() {
        let events = vec![
            Event {
                id: 3,
                title: "Bahar Şenliği".to_string(),
            },
            Event {
                id: 4,
                title: "Career Fair".to_string(),
            },
        ];
        let envelope = ResponseEnvelope {
            success: true,
            data: Some(events.clone()),
            message: None,
            error: None,
            pagination: None,
            count: None,
            limit: None,
            offset: None,
            has_more: None,
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert_eq!(decode::<Vec<Event>>(&bytes).unwrap(), events);

        let bare = serde_json::to_vec(&events).unwrap();
        assert_eq!(decode::<Vec<Event>>(&bare).unwrap(), events);

        let single = serde_json::to_vec(&events[0]).unwrap();
        assert_eq!(decode::<Event>(&single).unwrap(), events[0]);
    }

    #[test]
    fn empty_body_means_true_for_flags() {
        assert!(decode::<bool>(b"").unwrap());
        assert!(decode::<bool>(b"  \n").unwrap());
        decode::<()>(b"").unwrap();
        assert!(decode::<Vec<Event>>(b"").is_err());
    }

    #[test]
    fn missing_data_yields_empty_collection() {
        let body = br#"{"success":true,"message":"no events"}"#;
        let events: Vec<Event> = decode(body).unwrap();
        assert!(events.is_empty());

        let flag: bool = decode(br#"{"success":true}"#).unwrap();
        assert!(flag);

        let err = decode::<Event>(br#"{"success":true}"#).unwrap_err();
        assert!(matches!(err, ApiError::Decoding(_)));
    }

    #[test]
    fn pagination_merges_object_and_legacy_fields() {
        let body = br#"{"success":true,"data":[],"pagination":{"has_more":true,"total":"42","limit":10},"count":10,"offset":20}"#;
        let decoded = decode_with_meta::<Vec<Event>>(body).unwrap();
        let pagination = decoded.pagination.unwrap();
        assert!(pagination.has_more);
        assert_eq!(pagination.total, Some(42));
        assert_eq!(pagination.limit, Some(10));
        assert_eq!(pagination.count, Some(10));
        assert_eq!(pagination.offset, Some(20));

        let plain = decode_with_meta::<Vec<Event>>(br#"{"success":true,"data":[]}"#).unwrap();
        assert!(plain.pagination.is_none());
    }

    #[test]
    fn error_message_extraction() {
        assert_eq!(
            extract_error_message(br#"{"success":false,"error":"Invalid credentials"}"#),
            Some("Invalid credentials".to_string())
        );
        assert_eq!(
            extract_error_message(br#"{"message":"Token expired"}"#),
            Some("Token expired".to_string())
        );
        assert_eq!(extract_error_message(br#"{"error":""}"#), None);
        assert_eq!(extract_error_message(b"<html>502 Bad Gateway</html>"), None);
    }
}
