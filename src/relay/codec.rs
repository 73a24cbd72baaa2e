//! Encoding of CRDT bytes in the backend's `doc_uint8` column.
//!
//! The backend stores document bytes double-encoded: a JSON string whose
//! content is itself the JSON object `{"bytes": [..]}`. The outer string layer
//! is handled by the request/response JSON bodies; this module handles the
//! inner wrapper.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the backend column holding the serialized document
pub const DOC_COLUMN: &str = "doc_uint8";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed doc_uint8 payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Serialize)]
struct ByteWrapper<'a> {
    bytes: &'a [u8],
}

/// Wrap raw CRDT bytes into the `doc_uint8` string form
pub fn encode_doc_bytes(bytes: &[u8]) -> CodecResult<String> {
    Ok(serde_json::to_string(&ByteWrapper { bytes })?)
}

/// Unwrap a `doc_uint8` string into raw CRDT bytes
pub fn decode_doc_bytes(encoded: &str) -> CodecResult<Vec<u8>> {
    #[derive(Deserialize)]
    struct Owned {
        bytes: Vec<u8>,
    }
    let wrapper: Owned = serde_json::from_str(encoded)?;
    Ok(wrapper.bytes)
}

/// Treat null, missing and blank column values as "no snapshot"
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
