//! Pluggable Message Decoding
//!
//! The engine delivers raw payload bytes; consumers decode them against the
//! channel's schema. A handful of encodings are well known and handled by
//! consumers directly. Anything else needs a decoder registered by an
//! external extension before playback, keyed by the channel's
//! `message_encoding` field.
//!
//! A channel whose encoding is neither well known nor registered is dropped
//! at initialization with a one-time schema problem; its messages never
//! enter the pipeline. Other channels are unaffected.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rewind_core::Schema;

use crate::error::{Error, Result};

/// Encodings consumers are expected to decode themselves.
pub const WELL_KNOWN_ENCODINGS: &[&str] = &["json", "protobuf", "ros1", "cdr"];

/// Decodes one payload against its schema.
pub trait MessageDecoder: Send + Sync {
    fn decode(&self, data: &[u8], schema: &Schema) -> Result<serde_json::Value>;
}

/// Registry of custom decoders, keyed by message encoding.
#[derive(Default, Clone)]
pub struct DecoderRegistry {
    decoders: Arc<RwLock<HashMap<String, Arc<dyn MessageDecoder>>>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for a custom encoding. A later registration for
    /// the same encoding replaces the earlier one.
    pub fn register(&self, encoding: impl Into<String>, decoder: Arc<dyn MessageDecoder>) {
        self.decoders
            .write()
            .expect("decoder registry poisoned")
            .insert(encoding.into(), decoder);
    }

    /// Whether messages with this encoding can flow through playback.
    pub fn supports(&self, encoding: &str) -> bool {
        WELL_KNOWN_ENCODINGS.contains(&encoding)
            || self
                .decoders
                .read()
                .expect("decoder registry poisoned")
                .contains_key(encoding)
    }

    /// Decode a payload with a registered custom decoder. Returns `None`
    /// when the encoding has no registered decoder (well-known encodings
    /// are decoded by the consumer, not here).
    pub fn decode(
        &self,
        encoding: &str,
        data: &[u8],
        schema: &Schema,
    ) -> Option<Result<serde_json::Value>> {
        let decoder = self
            .decoders
            .read()
            .expect("decoder registry poisoned")
            .get(encoding)
            .cloned()?;
        Some(decoder.decode(data, schema).map_err(|err| match err {
            Error::Decode { .. } => err,
            other => Error::Decode {
                encoding: encoding.to_string(),
                message: other.to_string(),
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct Utf8Decoder;

    impl MessageDecoder for Utf8Decoder {
        fn decode(&self, data: &[u8], _schema: &Schema) -> Result<serde_json::Value> {
            let text = std::str::from_utf8(data).map_err(|e| Error::Decode {
                encoding: "utf8".to_string(),
                message: e.to_string(),
            })?;
            Ok(serde_json::Value::String(text.to_string()))
        }
    }

    fn schema() -> Schema {
        Schema {
            id: 1,
            name: "Text".to_string(),
            encoding: "none".to_string(),
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_well_known_supported_without_registration() {
        let registry = DecoderRegistry::new();
        assert!(registry.supports("json"));
        assert!(registry.supports("protobuf"));
        assert!(!registry.supports("my-custom-encoding"));
    }

    #[test]
    fn test_registered_decoder_used() {
        let registry = DecoderRegistry::new();
        registry.register("utf8", Arc::new(Utf8Decoder));
        assert!(registry.supports("utf8"));

        let value = registry
            .decode("utf8", b"hello", &schema())
            .unwrap()
            .unwrap();
        assert_eq!(value, serde_json::Value::String("hello".to_string()));
    }

    #[test]
    fn test_decode_failure_is_decode_error() {
        let registry = DecoderRegistry::new();
        registry.register("utf8", Arc::new(Utf8Decoder));

        let result = registry.decode("utf8", &[0xFF, 0xFE], &schema()).unwrap();
        assert!(matches!(result, Err(Error::Decode { .. })));
    }

    #[test]
    fn test_unregistered_encoding_returns_none() {
        let registry = DecoderRegistry::new();
        assert!(registry.decode("json", b"{}", &schema()).is_none());
    }
}
