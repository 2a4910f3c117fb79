//! Message serialization with a fixed content-type allow-list.
//!
//! Two formats are supported: JSON as the plain structured-text format and
//! MessagePack as the compact binary object format. A body whose content type
//! is not on the accept list is rejected before any parsing happens.

use std::fmt;
use std::str::FromStr;

use crate::domain::{SpoolError, TaskMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Json,
    MessagePack,
}

impl ContentType {
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::MessagePack => "application/x-msgpack",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/json" => Some(ContentType::Json),
            "application/x-msgpack" => Some(ContentType::MessagePack),
            _ => None,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown content type '{0}': expected json or msgpack")]
pub struct ParseContentTypeError(String);

/// Accepts the short names used in configuration as well as MIME types.
impl FromStr for ContentType {
    type Err = ParseContentTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "json" => Ok(ContentType::Json),
            "msgpack" | "messagepack" => Ok(ContentType::MessagePack),
            other => {
                ContentType::from_mime(other).ok_or_else(|| ParseContentTypeError(other.to_string()))
            }
        }
    }
}

/// A serialized task message as it sits on the broker.
///
/// The content type is kept as a raw string so that bodies produced by
/// foreign publishers can still be carried and rejected cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub content_type: String,
    pub body: Vec<u8>,
}

impl EncodedMessage {
    pub fn new(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Codec {
    serializer: ContentType,
    accept: Vec<ContentType>,
}

impl Codec {
    pub fn new(serializer: ContentType, accept: Vec<ContentType>) -> Self {
        Self { serializer, accept }
    }

    pub fn serializer(&self) -> ContentType {
        self.serializer
    }

    pub fn accepts(&self, content_type: ContentType) -> bool {
        self.accept.contains(&content_type)
    }

    pub fn encode(&self, message: &TaskMessage) -> Result<EncodedMessage, SpoolError> {
        let body = match self.serializer {
            ContentType::Json => serde_json::to_vec(message)
                .map_err(|e| SpoolError::MalformedMessage(format!("json encode: {e}")))?,
            ContentType::MessagePack => rmp_serde::to_vec_named(message)
                .map_err(|e| SpoolError::MalformedMessage(format!("msgpack encode: {e}")))?,
        };
        Ok(EncodedMessage::new(self.serializer.mime(), body))
    }

    pub fn decode(&self, encoded: &EncodedMessage) -> Result<TaskMessage, SpoolError> {
        let content_type = ContentType::from_mime(&encoded.content_type)
            .filter(|ct| self.accepts(*ct))
            .ok_or_else(|| SpoolError::UnsupportedContentType(encoded.content_type.clone()))?;

        match content_type {
            ContentType::Json => serde_json::from_slice(&encoded.body)
                .map_err(|e| SpoolError::MalformedMessage(format!("json decode: {e}"))),
            ContentType::MessagePack => rmp_serde::from_slice(&encoded.body)
                .map_err(|e| SpoolError::MalformedMessage(format!("msgpack decode: {e}"))),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(
            ContentType::Json,
            vec![ContentType::Json, ContentType::MessagePack],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageId, QueueName, TaskArgs, TaskName};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use serde_json::json;

    fn sample_message() -> TaskMessage {
        TaskMessage::new(
            MessageId::generate(),
            TaskName::new("compute"),
            TaskArgs::positional(vec![json!(-3), json!(1.5), json!(null), json!([1, "two"])])
                .kwarg("random_number", 1234)
                .kwarg("now_timestamp", "2024-01-01T00:00:00")
                .kwarg("nested", json!({"a": {"b": [true, false]}})),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            QueueName::new("compute"),
        )
    }

    #[rstest]
    #[case::json(ContentType::Json)]
    #[case::msgpack(ContentType::MessagePack)]
    fn message_survives_each_format(#[case] format: ContentType) {
        let codec = Codec::new(format, vec![ContentType::Json, ContentType::MessagePack]);
        let msg = sample_message();

        let encoded = codec.encode(&msg).unwrap();
        assert_eq!(encoded.content_type, format.mime());
        assert_eq!(codec.decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn rejects_content_type_outside_accept_list() {
        let producer = Codec::new(ContentType::MessagePack, vec![ContentType::MessagePack]);
        let consumer = Codec::new(ContentType::Json, vec![ContentType::Json]);

        let encoded = producer.encode(&sample_message()).unwrap();
        let err = consumer.decode(&encoded).unwrap_err();
        assert!(matches!(err, SpoolError::UnsupportedContentType(ct) if ct == "application/x-msgpack"));
    }

    #[test]
    fn rejects_foreign_content_type() {
        let encoded = EncodedMessage::new("application/x-python-serialize", b"\x80\x04".to_vec());
        let err = Codec::default().decode(&encoded).unwrap_err();
        assert!(matches!(err, SpoolError::UnsupportedContentType(_)));
    }

    #[test]
    fn garbage_body_is_malformed() {
        let encoded = EncodedMessage::new("application/json", b"{\"task_name\":".to_vec());
        let err = Codec::default().decode(&encoded).unwrap_err();
        assert!(matches!(err, SpoolError::MalformedMessage(_)));
    }

    #[test]
    fn well_formed_json_missing_fields_is_malformed() {
        let encoded = EncodedMessage::new("application/json", br#"{"task_name":"compute"}"#.to_vec());
        let err = Codec::default().decode(&encoded).unwrap_err();
        assert!(matches!(err, SpoolError::MalformedMessage(_)));
    }

    #[rstest]
    #[case("json", ContentType::Json)]
    #[case("msgpack", ContentType::MessagePack)]
    #[case("application/x-msgpack", ContentType::MessagePack)]
    fn parses_config_names(#[case] raw: &str, #[case] expected: ContentType) {
        assert_eq!(raw.parse::<ContentType>().unwrap(), expected);
    }

    #[test]
    fn pickle_is_not_a_content_type() {
        assert!("pickle".parse::<ContentType>().is_err());
    }
}
