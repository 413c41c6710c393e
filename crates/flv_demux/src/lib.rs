pub mod amf;
pub mod demuxer;
pub mod header;
pub mod tag;
pub mod writer;

use bytes::Bytes;
use thiserror::Error;

// Re-export main types
pub use amf::{AmfValue, Keyframes, Metadata};
pub use demuxer::{FlvDemuxer, InitInfo};
pub use header::FlvHeader;
pub use tag::{TagHeader, TagType};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DemuxError {
    #[error("Header too short: {len} bytes")]
    HeaderTooShort { len: usize },
    #[error("Invalid signature: {signature:?}")]
    InvalidSignature { signature: [u8; 3] },
    #[error("Unsupported version: {version}")]
    UnsupportedVersion { version: u8 },
    #[error("Invalid data offset: {offset}")]
    InvalidDataOffset { offset: u32 },
    #[error("Empty range")]
    EmptyRange,
    #[error("Truncated tag at byte {offset}: {needed} more bytes needed")]
    Truncated { offset: u64, needed: usize },
    #[error("Invalid tag type {tag_type} at byte {offset}")]
    InvalidTag { offset: u64, tag_type: u8 },
    #[error("AMF error: {err}")]
    Amf { err: String },
}

impl DemuxError {
    /// Whether the error means the byte stream itself is broken.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, DemuxError::EmptyRange)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Init,
    Audio,
    Video,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Init => "init",
            SegmentKind::Audio => "audio",
            SegmentKind::Video => "video",
        }
    }
}

/// A demuxed unit ready for the rendering buffer.
///
/// `payload` holds complete FLV bytes: for an init segment the file header,
/// script tags and codec configuration tags; for media segments one whole tag
/// including its trailing previous-tag-size field.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub kind: SegmentKind,
    /// Presentation timestamp in seconds
    pub timestamp: f64,
    /// Nominal duration in seconds, 0 when unknown
    pub duration: f64,
    pub keyframe: bool,
    pub payload: Bytes,
}

impl MediaSegment {
    pub fn end(&self) -> f64 {
        self.timestamp + self.duration
    }

    /// Shift the segment by `offset` seconds, rewriting the tag timestamp so
    /// the payload stays consistent with `timestamp`.
    pub fn rebased(mut self, offset: f64) -> Self {
        if offset == 0.0 {
            return self;
        }
        self.timestamp += offset;
        if self.kind != SegmentKind::Init && self.payload.len() >= tag::TAG_HEADER_SIZE {
            let millis = (self.timestamp * 1000.0).round().max(0.0) as u32;
            let mut payload = self.payload.to_vec();
            writer::write_timestamp(&mut payload, millis);
            self.payload = Bytes::from(payload);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Demuxed {
    Segment(MediaSegment),
    EndOfStream,
}

impl Demuxed {
    pub fn into_segment(self) -> Option<MediaSegment> {
        match self {
            Demuxed::Segment(segment) => Some(segment),
            Demuxed::EndOfStream => None,
        }
    }
}
