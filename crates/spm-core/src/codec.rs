//! JSON envelope codec for bus messages.
//!
//! Inbound messages are JSON arrays of event objects; outbound messages
//! are compact JSON arrays of command objects. Decoding never panics: a
//! malformed message comes back as a [`CodecError`] carrying the offending
//! text so the caller can log it and carry on with an empty tick.

use serde_json::Value;
use spm_types::CommandBatch;

/// Encoded form of a batch with no commands.
pub const EMPTY_BATCH: &str = "[]";

/// Longest slice of an offending message kept in an error.
const MAX_RAW_IN_ERROR: usize = 512;

/// Errors produced by the codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The message is not valid JSON.
    #[error("malformed JSON message ({source}): {raw}")]
    Malformed {
        /// The offending text (possibly truncated).
        raw: String,
        /// The parser diagnostic.
        source: serde_json::Error,
    },

    /// The message is valid JSON but not an array.
    #[error("expected a JSON array of events: {raw}")]
    NotAnArray {
        /// The offending text (possibly truncated).
        raw: String,
    },

    /// A command batch could not be serialized.
    #[error("failed to encode command batch: {source}")]
    Encode {
        /// The serializer diagnostic.
        #[from]
        source: serde_json::Error,
    },
}

/// Whether a raw message carries no content at all.
///
/// Empty and whitespace-only messages are a normal "no work this tick"
/// signal, distinct from malformed input.
pub fn is_blank(raw: &str) -> bool {
    raw.trim().is_empty()
}

/// Decode an inbound message into its array elements.
///
/// A blank message decodes to an empty array.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the text is not JSON, or
/// [`CodecError::NotAnArray`] if it is JSON of another shape.
pub fn decode(raw: &str) -> Result<Vec<Value>, CodecError> {
    if is_blank(raw) {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(_) => Err(CodecError::NotAnArray {
            raw: truncate(raw),
        }),
        Err(source) => Err(CodecError::Malformed {
            raw: truncate(raw),
            source,
        }),
    }
}

/// Encode a command batch as a compact JSON array.
///
/// An empty batch encodes to `[]`.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode(batch: &CommandBatch) -> Result<String, CodecError> {
    Ok(serde_json::to_string(batch)?)
}

fn truncate(raw: &str) -> String {
    if raw.len() <= MAX_RAW_IN_ERROR {
        return raw.to_owned();
    }
    let mut end = MAX_RAW_IN_ERROR;
    while !raw.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = raw.get(..end).unwrap_or_default().to_owned();
    out.push_str("...");
    out
}
