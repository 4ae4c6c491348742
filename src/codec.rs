//! Marshalling of opaque clinical documents.
//!
//! The vault treats `details`/`other_details` payloads as opaque documents;
//! the codec is the seam where a service layer plugs in its own format.

use crate::error::Result;
use crate::types::Document;

/// Marshals opaque documents to and from their textual form.
pub trait DocumentCodec: Send + Sync {
    fn marshal(&self, document: &Document) -> Result<String>;
    fn unmarshal(&self, raw: &str) -> Result<Document>;
}

/// JSON codec used by default.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl DocumentCodec for JsonCodec {
    fn marshal(&self, document: &Document) -> Result<String> {
        Ok(serde_json::to_string(document)?)
    }

    fn unmarshal(&self, raw: &str) -> Result<Document> {
        Ok(serde_json::from_str(raw)?)
    }
}
