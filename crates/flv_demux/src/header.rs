use scroll::Pread;
use scroll_derive::Pread;

use crate::DemuxError;

pub const HEADER_SIZE: usize = 9;
pub const PREVIOUS_TAG_SIZE_LEN: usize = 4;
const SIGNATURE: [u8; 3] = *b"FLV";

#[derive(Debug, Pread, Clone)]
struct RawHeader {
    signature: [u8; 3],
    version: u8,
    flags: u8,
    data_offset: u32,
}

/// The fixed FLV file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlvHeader {
    pub version: u8,
    pub has_audio: bool,
    pub has_video: bool,
    /// Offset of the first `PreviousTagSize0` field, normally 9
    pub data_offset: u32,
}

impl FlvHeader {
    pub fn parse(buffer: &[u8]) -> Result<Self, DemuxError> {
        if buffer.len() < HEADER_SIZE {
            return Err(DemuxError::HeaderTooShort { len: buffer.len() });
        }
        let raw: RawHeader = buffer
            .pread_with(0, scroll::BE)
            .map_err(|_| DemuxError::HeaderTooShort { len: buffer.len() })?;

        if raw.signature != SIGNATURE {
            return Err(DemuxError::InvalidSignature {
                signature: raw.signature,
            });
        }
        if raw.version != 1 {
            return Err(DemuxError::UnsupportedVersion {
                version: raw.version,
            });
        }
        if (raw.data_offset as usize) < HEADER_SIZE {
            return Err(DemuxError::InvalidDataOffset {
                offset: raw.data_offset,
            });
        }

        Ok(Self {
            version: raw.version,
            has_audio: raw.flags & 0x04 != 0,
            has_video: raw.flags & 0x01 != 0,
            data_offset: raw.data_offset,
        })
    }

    /// Offset of the first tag
    pub fn first_tag_offset(&self) -> u64 {
        self.data_offset as u64 + PREVIOUS_TAG_SIZE_LEN as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_header() {
        let header = FlvHeader::parse(&[b'F', b'L', b'V', 1, 0x05, 0, 0, 0, 9]).unwrap();
        assert!(header.has_audio);
        assert!(header.has_video);
        assert_eq!(header.data_offset, 9);
        assert_eq!(header.first_tag_offset(), 13);
    }

    #[test]
    fn reject_short_header() {
        assert_eq!(
            FlvHeader::parse(b"FLV\x01"),
            Err(DemuxError::HeaderTooShort { len: 4 })
        );
    }

    #[test]
    fn reject_bad_signature_and_version() {
        assert!(matches!(
            FlvHeader::parse(&[b'F', b'L', b'X', 1, 5, 0, 0, 0, 9]),
            Err(DemuxError::InvalidSignature { .. })
        ));
        assert_eq!(
            FlvHeader::parse(&[b'F', b'L', b'V', 2, 5, 0, 0, 0, 9]),
            Err(DemuxError::UnsupportedVersion { version: 2 })
        );
        assert_eq!(
            FlvHeader::parse(&[b'F', b'L', b'V', 1, 5, 0, 0, 0, 3]),
            Err(DemuxError::InvalidDataOffset { offset: 3 })
        );
    }
}
