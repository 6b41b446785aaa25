//! Stream metadata and retention policy
//!
//! Metadata for stream `s` is written as ordinary events to the metadata
//! stream `$$s`. The payload is a JSON document:
//!
//! ```text
//! {"$maxCount": 100, "$maxAge": 86400, "$tb": 12}
//! ```
//!
//! `$maxAge` is expressed in seconds. Unknown keys are ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::position::EventNumber;

const METADATA_PREFIX: &str = "$$";

/// Name of the metadata stream for `stream`
pub fn metadata_stream_of(stream: &str) -> String {
    format!("{}{}", METADATA_PREFIX, stream)
}

pub fn is_metadata_stream(stream: &str) -> bool {
    stream.starts_with(METADATA_PREFIX)
}

/// Stream the metadata stream `stream` describes, if it is one
pub fn original_stream_of(stream: &str) -> Option<&str> {
    stream.strip_prefix(METADATA_PREFIX)
}

/// Retention policy for a single stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamMetadata {
    pub max_count: Option<u64>,
    pub max_age: Option<Duration>,
    pub truncate_before: Option<EventNumber>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataDocument {
    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    max_count: Option<u64>,
    #[serde(rename = "$maxAge", default, skip_serializing_if = "Option::is_none")]
    max_age: Option<u64>,
    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    truncate_before: Option<u64>,
}

impl StreamMetadata {
    /// Policy applied to metadata streams themselves: only the current
    /// metadata event is needed.
    pub fn for_metadata_stream() -> Self {
        Self {
            max_count: Some(1),
            ..Default::default()
        }
    }

    pub fn with_max_count(mut self, max_count: u64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_truncate_before(mut self, event_number: EventNumber) -> Self {
        self.truncate_before = Some(event_number);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.max_count.is_none() && self.max_age.is_none() && self.truncate_before.is_none()
    }

    /// Parse a metadata event payload
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let doc: MetadataDocument = serde_json::from_slice(bytes)?;
        Ok(Self {
            max_count: doc.max_count,
            max_age: doc.max_age.map(Duration::from_secs),
            truncate_before: doc.truncate_before,
        })
    }

    /// Encode as a metadata event payload
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&MetadataDocument {
            max_count: self.max_count,
            max_age: self.max_age.map(|d| d.as_secs()),
            truncate_before: self.truncate_before,
        })
    }

    /// Whether the event survives this policy.
    ///
    /// `now_millis` is the evaluation time (read or scavenge time, never
    /// write time).
    pub fn retains(
        &self,
        event_number: EventNumber,
        last_event_number: EventNumber,
        timestamp_millis: i64,
        now_millis: i64,
    ) -> bool {
        if let Some(tb) = self.truncate_before {
            if event_number < tb {
                return false;
            }
        }
        if let Some(max_count) = self.max_count {
            if max_count == 0 || event_number.saturating_add(max_count) <= last_event_number {
                return false;
            }
        }
        if let Some(max_age) = self.max_age {
            let age = now_millis.saturating_sub(timestamp_millis);
            if age > max_age.as_millis() as i64 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_stream_names() {
        assert_eq!(metadata_stream_of("orders"), "$$orders");
        assert!(is_metadata_stream("$$orders"));
        assert!(!is_metadata_stream("orders"));
        assert_eq!(original_stream_of("$$orders"), Some("orders"));
        assert_eq!(original_stream_of("orders"), None);
    }

    #[test]
    fn test_json_roundtrip_and_unknown_keys() {
        let parsed =
            StreamMetadata::from_json(br#"{"$maxCount":3,"$maxAge":60,"$acl":{"r":"*"}}"#).unwrap();
        assert_eq!(parsed.max_count, Some(3));
        assert_eq!(parsed.max_age, Some(Duration::from_secs(60)));
        assert_eq!(parsed.truncate_before, None);

        let again = StreamMetadata::from_json(&parsed.to_json().unwrap()).unwrap();
        assert_eq!(again, parsed);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(StreamMetadata::from_json(b"not json").is_err());
    }

    #[test]
    fn test_max_count_retention() {
        let meta = StreamMetadata::default().with_max_count(2);
        // Stream at event 4: only 3 and 4 survive.
        assert!(!meta.retains(2, 4, 0, 0));
        assert!(meta.retains(3, 4, 0, 0));
        assert!(meta.retains(4, 4, 0, 0));
    }

    #[test]
    fn test_truncate_before_retention() {
        let meta = StreamMetadata::default().with_truncate_before(5);
        assert!(!meta.retains(4, 10, 0, 0));
        assert!(meta.retains(5, 10, 0, 0));
    }

    #[test]
    fn test_max_age_retention() {
        let meta = StreamMetadata::default().with_max_age(Duration::from_secs(10));
        let now = 100_000;
        assert!(meta.retains(0, 0, now - 10_000, now));
        assert!(!meta.retains(0, 0, now - 10_001, now));
    }
}
