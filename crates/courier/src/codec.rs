use std::string::FromUtf8Error;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Payload encoding or decoding failed.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization error.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is not valid UTF-8.
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] FromUtf8Error),
}

/// A value that can travel as a message payload.
///
/// Raw bytes and strings pass through untouched; structured values go through [`Json`].
pub trait Payload
where
    Self: Sized + Send + Sync + 'static,
{
    /// Encodes the value into payload bytes.
    ///
    /// # Errors
    ///
    /// Fails when the value cannot be represented.
    fn encode(self) -> Result<Bytes, CodecError>;

    /// Decodes a value from payload bytes.
    ///
    /// # Errors
    ///
    /// Fails when the bytes are not a valid encoding.
    fn decode(bytes: Bytes) -> Result<Self, CodecError>;
}

impl Payload for Bytes {
    fn encode(self) -> Result<Bytes, CodecError> {
        Ok(self)
    }

    fn decode(bytes: Bytes) -> Result<Self, CodecError> {
        Ok(bytes)
    }
}

impl Payload for Vec<u8> {
    fn encode(self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(self))
    }

    fn decode(bytes: Bytes) -> Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }
}

impl Payload for String {
    fn encode(self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(self))
    }

    fn decode(bytes: Bytes) -> Result<Self, CodecError> {
        Ok(Self::from_utf8(bytes.to_vec())?)
    }
}

/// Wraps any serde type so it travels as a JSON document.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    /// Unwraps the inner value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Payload for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }

    fn decode(bytes: Bytes) -> Result<Self, CodecError> {
        Ok(Self(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Order {
        content: String,
    }

    #[test]
    fn test_raw_payloads_pass_through() {
        let bytes = Bytes::from_static(b"\x00\xffraw");
        assert_eq!(bytes.clone().encode().unwrap(), bytes);

        let text = "héllo".to_string();
        assert_eq!(text.encode().unwrap(), Bytes::from("héllo"));
    }

    #[test]
    fn test_json_document() {
        let encoded = Json(Order {
            content: "123".to_string(),
        })
        .encode()
        .unwrap();

        assert_eq!(encoded, Bytes::from_static(br#"{"content":"123"}"#));
        assert_eq!(
            Json::<Order>::decode(encoded).unwrap().into_inner().content,
            "123"
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_matches!(
            String::decode(Bytes::from_static(b"\xff\xfe")),
            Err(CodecError::Utf8(_))
        );
        assert_matches!(
            Json::<Order>::decode(Bytes::from_static(b"not json")),
            Err(CodecError::Json(_))
        );
    }
}
