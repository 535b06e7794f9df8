//! Identifiers used on the link: client-generated message ids and
//! server-assigned stream ids.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-generated id of an outbound message.  Retries reuse it so the
/// server can discard duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// A fresh random (v4) id.
    pub fn generate() -> Self { MessageId(Uuid::new_v4().to_string()) }

    pub fn new(s: impl Into<String>) -> Self { MessageId(s.into()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned id of one streamed response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl StreamId {
    pub fn new(s: impl Into<String>) -> Self { StreamId(s.into()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&StreamId::new("s-1")).unwrap();
        assert_eq!(json, "\"s-1\"");
    }
}
