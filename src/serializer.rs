// Copyright (c) 2026, The amqp-messenger Authors
// MIT License
// All rights reserved.

//! # Payload Serialization
//!
//! The [`Serializer`] trait turns a raw `{body, headers}` pair into a domain
//! [`Envelope`] and back. [`JsonSerializer`] is the default implementation:
//! JSON bodies with a `type` header naming the message type.

use crate::{envelope::Envelope, errors::DecodeError};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, marker::PhantomData};

/// Transport headers projected to strings, keyed by header name.
pub type Headers = HashMap<String, String>;

/// Header carrying the message type name.
pub const TYPE_HEADER: &str = "type";

/// Encodes and decodes envelopes for a given message type.
///
/// Decoding failures must propagate as [`DecodeError`]; a receiver never drops
/// an undecodable message silently, since that would break at-least-once
/// accounting.
pub trait Serializer<M>: Send + Sync {
    fn decode(&self, body: &[u8], headers: &Headers) -> Result<Envelope<M>, DecodeError>;

    fn encode(&self, envelope: &Envelope<M>) -> Result<(Vec<u8>, Headers), DecodeError>;
}

/// JSON serializer for a single message type.
///
/// On decode, a `type` header that names a different type is rejected with
/// [`DecodeError::UnsupportedType`]; an absent header is accepted. On encode,
/// the `type` header is always written.
pub struct JsonSerializer<M> {
    type_name: String,
    _message: PhantomData<fn() -> M>,
}

impl<M> JsonSerializer<M> {
    pub fn new(type_name: impl Into<String>) -> Self {
        JsonSerializer {
            type_name: type_name.into(),
            _message: PhantomData,
        }
    }
}

impl<M> Serializer<M> for JsonSerializer<M>
where
    M: Serialize + DeserializeOwned + Send + Sync,
{
    fn decode(&self, body: &[u8], headers: &Headers) -> Result<Envelope<M>, DecodeError> {
        if let Some(kind) = headers.get(TYPE_HEADER) {
            if kind != &self.type_name {
                return Err(DecodeError::UnsupportedType(kind.clone()));
            }
        }

        let message = serde_json::from_slice(body).map_err(DecodeError::Payload)?;

        Ok(Envelope::new(message))
    }

    fn encode(&self, envelope: &Envelope<M>) -> Result<(Vec<u8>, Headers), DecodeError> {
        let body = serde_json::to_vec(envelope.message()).map_err(DecodeError::Payload)?;

        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER.to_owned(), self.type_name.clone());

        Ok((body, headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct DummyMessage {
        message: String,
    }

    fn serializer() -> JsonSerializer<DummyMessage> {
        JsonSerializer::new("DummyMessage")
    }

    #[test]
    fn decodes_a_typed_payload() {
        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER.to_owned(), "DummyMessage".to_owned());

        let envelope = serializer()
            .decode(br#"{"message": "Hi"}"#, &headers)
            .unwrap();

        assert_eq!(
            envelope.message(),
            &DummyMessage {
                message: "Hi".to_owned()
            }
        );
    }

    #[test]
    fn round_trips_body_and_headers() {
        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER.to_owned(), "DummyMessage".to_owned());

        let serializer = serializer();
        let envelope = serializer.decode(br#"{"message":"Hi"}"#, &headers).unwrap();
        let (body, encoded_headers) = serializer.encode(&envelope).unwrap();

        assert_eq!(body, br#"{"message":"Hi"}"#.to_vec());
        assert_eq!(encoded_headers, headers);
    }

    #[test]
    fn rejects_an_unknown_message_type() {
        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER.to_owned(), "SomethingElse".to_owned());

        let result = serializer().decode(br#"{"message": "Hi"}"#, &headers);

        assert!(matches!(result, Err(DecodeError::UnsupportedType(kind)) if kind == "SomethingElse"));
    }

    #[test]
    fn rejects_a_malformed_body() {
        let result = serializer().decode(b"not json", &Headers::new());

        assert!(matches!(result, Err(DecodeError::Payload(_))));
    }
}
