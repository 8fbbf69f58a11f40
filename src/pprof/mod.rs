//! Minimal pprof protobuf data model.
//!
//! The sampler hands the probe opaque byte blobs in the pprof wire format
//! (possibly gzip-compressed, as most runtimes emit them). Only the message
//! fields the call-graph builder consumes are modeled here; unknown fields
//! are skipped by prost.

use std::collections::HashMap;
use std::io::Read;

use prost::Message;

use crate::error::ProbeError;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Profile {
    /// The type and unit of each sample value, by index.
    #[prost(message, repeated, tag = "1")]
    pub sample_type: Vec<ValueType>,
    #[prost(message, repeated, tag = "2")]
    pub sample: Vec<Sample>,
    #[prost(message, repeated, tag = "4")]
    pub location: Vec<Location>,
    #[prost(message, repeated, tag = "5")]
    pub function: Vec<Function>,
    /// Index 0 is always the empty string.
    #[prost(string, repeated, tag = "6")]
    pub string_table: Vec<String>,
    #[prost(int64, tag = "9")]
    pub time_nanos: i64,
    #[prost(int64, tag = "10")]
    pub duration_nanos: i64,
    #[prost(message, optional, tag = "11")]
    pub period_type: Option<ValueType>,
    #[prost(int64, tag = "12")]
    pub period: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValueType {
    /// Index into the string table.
    #[prost(int64, tag = "1")]
    pub r#type: i64,
    /// Index into the string table.
    #[prost(int64, tag = "2")]
    pub unit: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Sample {
    /// Location ids, leaf first.
    #[prost(uint64, repeated, tag = "1")]
    pub location_id: Vec<u64>,
    /// One value per entry in `Profile.sample_type`.
    #[prost(int64, repeated, tag = "2")]
    pub value: Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Location {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "3")]
    pub address: u64,
    /// Multiple lines mean inlined frames; line 0 is the innermost.
    #[prost(message, repeated, tag = "4")]
    pub line: Vec<Line>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Line {
    #[prost(uint64, tag = "1")]
    pub function_id: u64,
    #[prost(int64, tag = "2")]
    pub line: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Function {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Index into the string table.
    #[prost(int64, tag = "2")]
    pub name: i64,
    #[prost(int64, tag = "3")]
    pub system_name: i64,
    #[prost(int64, tag = "4")]
    pub filename: i64,
}

impl Profile {
    /// Decode a raw or gzip-compressed pprof blob.
    pub fn parse(data: &[u8]) -> Result<Self, ProbeError> {
        let decoded;
        let raw = if data.starts_with(&[0x1f, 0x8b]) {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| ProbeError::Sampler(format!("decompressing pprof data: {e}")))?;
            decoded = out;
            &decoded[..]
        } else {
            data
        };

        Self::decode(raw).map_err(|e| ProbeError::Sampler(format!("decoding pprof data: {e}")))
    }

    /// Encode back to raw pprof bytes. Used by samplers that synthesize
    /// profiles and by tests feeding canned data through the pipeline.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Resolve a string-table index; out-of-range indexes resolve to "".
    pub fn string(&self, index: i64) -> &str {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.string_table.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Build an id → location lookup table.
    pub fn locations_by_id(&self) -> HashMap<u64, &Location> {
        self.location.iter().map(|l| (l.id, l)).collect()
    }

    /// Build an id → function lookup table.
    pub fn functions_by_id(&self) -> HashMap<u64, &Function> {
        self.function.iter().map(|f| (f.id, f)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let profile = Profile {
            string_table: vec!["".into(), "main".into()],
            function: vec![Function {
                id: 1,
                name: 1,
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut raw = Vec::new();
        profile.encode(&mut raw).expect("encode");

        let parsed = Profile::parse(&raw).expect("parse");
        assert_eq!(parsed.string(parsed.function[0].name), "main");
    }

    #[test]
    fn test_parse_gzip_blob() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let profile = Profile {
            string_table: vec!["".into(), "worker".into()],
            ..Default::default()
        };
        let mut raw = Vec::new();
        profile.encode(&mut raw).expect("encode");

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&raw).expect("compress");
        let compressed = enc.finish().expect("finish");

        let parsed = Profile::parse(&compressed).expect("parse gzip");
        assert_eq!(parsed.string_table[1], "worker");
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(Profile::parse(&[0xde, 0xad, 0xbe, 0xef, 0x01]).is_err());
    }

    #[test]
    fn test_string_index_out_of_range() {
        let profile = Profile::default();
        assert_eq!(profile.string(7), "");
        assert_eq!(profile.string(-1), "");
    }
}
