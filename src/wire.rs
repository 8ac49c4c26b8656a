//! Request/response model of the bidi read and append streams.
//!
//! Plain data; only the fields the protocol engine reads or writes are
//! modelled. Optional fields use `Option` where the wire distinguishes
//! "absent" from a zero value.

use bytes::Bytes;

/// Request header carrying routing parameters.
pub const REQUEST_PARAMS_HEADER: &str = "x-goog-request-params";

/// Per-call metadata attached when a stream is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub headers: Vec<(String, String)>,
}

impl CallContext {
    pub fn with_extra_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Everything needed to (re)open a physical stream.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenArguments<Req> {
    pub ctx: CallContext,
    pub request: Req,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksummedData {
    pub content: Bytes,
    pub crc32c: Option<u32>,
}

/// Object identity as returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub bucket: String,
    pub name: String,
    pub generation: u64,
    pub size: u64,
    pub crc32c: Option<u32>,
    /// Set once the object can no longer be appended to
    pub finalized: bool,
}

// ---------------------------------------------------------------------------
// Read stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadObjectSpec {
    pub bucket: String,
    pub object: String,
    pub generation: Option<u64>,
    pub read_handle: Option<Bytes>,
    pub routing_token: Option<String>,
}

/// One requested byte range. `read_length == 0` reads to the end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadRange {
    pub read_offset: u64,
    pub read_length: u64,
    pub read_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadObjectRequest {
    pub read_object_spec: Option<ReadObjectSpec>,
    pub read_ranges: Vec<ReadRange>,
}

impl ReadObjectRequest {
    /// Overlay `other` on `self`: spec replaced if set, ranges appended.
    pub fn merge_from(&mut self, other: ReadObjectRequest) {
        if other.read_object_spec.is_some() {
            self.read_object_spec = other.read_object_spec;
        }
        self.read_ranges.extend(other.read_ranges);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectRangeData {
    pub checksummed_data: ChecksummedData,
    pub read_range: ReadRange,
    /// Last chunk of this range
    pub range_end: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadObjectResponse {
    pub metadata: Option<ObjectMetadata>,
    pub read_handle: Option<Bytes>,
    pub object_data_ranges: Vec<ObjectRangeData>,
}

// ---------------------------------------------------------------------------
// Append stream
// ---------------------------------------------------------------------------

/// Creates a new appendable object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteObjectSpec {
    pub bucket: String,
    pub object: String,
    /// Only create if the object does not exist
    pub if_generation_match: Option<u64>,
    pub appendable: bool,
}

/// Resumes appending to an existing object generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendObjectSpec {
    pub bucket: String,
    pub object: String,
    pub generation: u64,
    pub write_handle: Option<Bytes>,
    pub routing_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstMessage {
    Write(WriteObjectSpec),
    Append(AppendObjectSpec),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteObjectRequest {
    pub first_message: Option<FirstMessage>,
    pub write_offset: u64,
    pub checksummed_data: Option<ChecksummedData>,
    pub flush: bool,
    pub state_lookup: bool,
    pub finish_write: bool,
    /// Whole-object CRC32C, sent with `finish_write`
    pub object_checksums: Option<u32>,
}

impl WriteObjectRequest {
    pub fn data_len(&self) -> u64 {
        self.checksummed_data
            .as_ref()
            .map(|d| d.content.len() as u64)
            .unwrap_or(0)
    }

    /// Offset one past the last data byte; `write_offset` when no data.
    pub fn data_end(&self) -> u64 {
        self.write_offset + self.data_len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteObjectResponse {
    pub persisted_size: Option<u64>,
    pub resource: Option<ObjectMetadata>,
    pub write_handle: Option<Bytes>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_context_headers() {
        let ctx = CallContext::default().with_extra_header(REQUEST_PARAMS_HEADER, "bucket=b");
        assert_eq!(ctx.header(REQUEST_PARAMS_HEADER), Some("bucket=b"));
        assert_eq!(ctx.header("missing"), None);
    }

    #[test]
    fn test_merge_appends_ranges() {
        let mut base = ReadObjectRequest {
            read_object_spec: Some(ReadObjectSpec {
                bucket: "b".into(),
                object: "o".into(),
                ..Default::default()
            }),
            read_ranges: vec![ReadRange {
                read_offset: 0,
                read_length: 10,
                read_id: 1,
            }],
        };
        base.merge_from(ReadObjectRequest {
            read_object_spec: None,
            read_ranges: vec![ReadRange {
                read_offset: 5,
                read_length: 0,
                read_id: 2,
            }],
        });
        assert_eq!(base.read_ranges.len(), 2);
        assert_eq!(base.read_object_spec.unwrap().object, "o");
    }

    #[test]
    fn test_write_request_data_end() {
        let req = WriteObjectRequest {
            write_offset: 100,
            checksummed_data: Some(ChecksummedData {
                content: Bytes::from_static(b"abcd"),
                crc32c: None,
            }),
            ..Default::default()
        };
        assert_eq!(req.data_end(), 104);
        assert_eq!(WriteObjectRequest::default().data_end(), 0);
    }
}
