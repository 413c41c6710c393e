use scroll::Pread;

use crate::DemuxError;

pub const TAG_HEADER_SIZE: usize = 11;
pub const TAG_TRAILER_SIZE: usize = 4;

const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];
const LEGACY_SAMPLE_RATES: [u32; 4] = [5512, 11025, 22050, 44100];

const SOUND_FORMAT_MP3: u8 = 2;
const SOUND_FORMAT_AAC: u8 = 10;
const CODEC_AVC: u8 = 7;
const CODEC_HEVC: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    Audio,
    Video,
    Script,
}

impl TagType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            8 => Some(TagType::Audio),
            9 => Some(TagType::Video),
            18 => Some(TagType::Script),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            TagType::Audio => 8,
            TagType::Video => 9,
            TagType::Script => 18,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHeader {
    pub tag_type: TagType,
    pub data_size: u32,
    /// Timestamp in milliseconds, extended byte already applied
    pub timestamp: u32,
    pub stream_id: u32,
}

pub(crate) fn read_u24(buffer: &[u8], offset: usize) -> Result<u32, scroll::Error> {
    let hi: u8 = buffer.pread_with(offset, scroll::BE)?;
    let lo: u16 = buffer.pread_with(offset + 1, scroll::BE)?;
    Ok(((hi as u32) << 16) | lo as u32)
}

impl TagHeader {
    /// Parse a tag header. `offset` is only used for error reporting.
    pub fn parse(buffer: &[u8], offset: u64) -> Result<Self, DemuxError> {
        let truncated = |_| DemuxError::Truncated {
            offset,
            needed: TAG_HEADER_SIZE.saturating_sub(buffer.len()),
        };
        let raw_type: u8 = buffer.pread_with(0, scroll::BE).map_err(truncated)?;
        let tag_type = TagType::from_u8(raw_type).ok_or(DemuxError::InvalidTag {
            offset,
            tag_type: raw_type,
        })?;
        let data_size = read_u24(buffer, 1).map_err(truncated)?;
        let timestamp_low = read_u24(buffer, 4).map_err(truncated)?;
        let timestamp_ext: u8 = buffer.pread_with(7, scroll::BE).map_err(truncated)?;
        let stream_id = read_u24(buffer, 8).map_err(truncated)?;

        Ok(Self {
            tag_type,
            data_size,
            timestamp: ((timestamp_ext as u32) << 24) | timestamp_low,
            stream_id,
        })
    }

    /// Total size of the tag including the trailing previous-tag-size field
    pub fn total_size(&self) -> usize {
        TAG_HEADER_SIZE + self.data_size as usize + TAG_TRAILER_SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoPacket {
    Config,
    Frame { keyframe: bool },
    EndOfSequence,
    /// Video info / command frames carry no picture
    Command,
}

pub fn inspect_video(body: &[u8]) -> Option<VideoPacket> {
    let first = *body.first()?;
    let frame_type = (first >> 4) & 0x07;
    let codec_id = first & 0x0F;
    if frame_type == 5 {
        return Some(VideoPacket::Command);
    }
    if codec_id == CODEC_AVC || codec_id == CODEC_HEVC {
        match body.get(1) {
            Some(0) => return Some(VideoPacket::Config),
            Some(2) => return Some(VideoPacket::EndOfSequence),
            None => return None,
            _ => {}
        }
    }
    Some(VideoPacket::Frame {
        keyframe: frame_type == 1,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioPacket {
    Config {
        sample_rate: Option<u32>,
    },
    Frame {
        /// Rate signalled by the tag flags; AAC always signals 44100 here
        sample_rate: Option<u32>,
        samples_per_frame: Option<u32>,
    },
}

pub fn inspect_audio(body: &[u8]) -> Option<AudioPacket> {
    let first = *body.first()?;
    let sound_format = first >> 4;
    let legacy_rate = LEGACY_SAMPLE_RATES[((first >> 2) & 0x03) as usize];
    match sound_format {
        SOUND_FORMAT_AAC => match body.get(1) {
            Some(0) => Some(AudioPacket::Config {
                sample_rate: aac_sample_rate(&body[2..]),
            }),
            Some(_) => Some(AudioPacket::Frame {
                sample_rate: None,
                samples_per_frame: Some(1024),
            }),
            None => None,
        },
        SOUND_FORMAT_MP3 => Some(AudioPacket::Frame {
            sample_rate: Some(legacy_rate),
            samples_per_frame: Some(1152),
        }),
        _ => Some(AudioPacket::Frame {
            sample_rate: Some(legacy_rate),
            samples_per_frame: None,
        }),
    }
}

/// Sampling frequency from an AudioSpecificConfig
fn aac_sample_rate(config: &[u8]) -> Option<u32> {
    if config.len() < 2 {
        return None;
    }
    let index = ((config[0] & 0x07) << 1) | (config[1] >> 7);
    if index == 0x0F {
        // explicit 24-bit frequency follows the index
        if config.len() < 5 {
            return None;
        }
        let rate = ((config[1] as u32 & 0x7F) << 17)
            | ((config[2] as u32) << 9)
            | ((config[3] as u32) << 1)
            | ((config[4] as u32) >> 7);
        return Some(rate);
    }
    AAC_SAMPLE_RATES.get(index as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tag_header_with_extended_timestamp() {
        let raw = [9u8, 0x00, 0x01, 0x00, 0x12, 0x34, 0x56, 0x01, 0, 0, 0];
        let header = TagHeader::parse(&raw, 0).unwrap();
        assert_eq!(header.tag_type, TagType::Video);
        assert_eq!(header.data_size, 256);
        assert_eq!(header.timestamp, 0x0112_3456);
        assert_eq!(header.total_size(), 11 + 256 + 4);
    }

    #[test]
    fn reject_unknown_tag_type() {
        let raw = [7u8, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            TagHeader::parse(&raw, 42),
            Err(DemuxError::InvalidTag {
                offset: 42,
                tag_type: 7
            })
        );
    }

    #[test]
    fn classify_video_packets() {
        assert_eq!(inspect_video(&[0x17, 0x00]), Some(VideoPacket::Config));
        assert_eq!(
            inspect_video(&[0x17, 0x01, 0, 0, 0]),
            Some(VideoPacket::Frame { keyframe: true })
        );
        assert_eq!(
            inspect_video(&[0x27, 0x01, 0, 0, 0]),
            Some(VideoPacket::Frame { keyframe: false })
        );
        assert_eq!(inspect_video(&[0x17, 0x02]), Some(VideoPacket::EndOfSequence));
        assert_eq!(inspect_video(&[]), None);
    }

    #[test]
    fn aac_config_sample_rate() {
        // AAC LC, 44100 Hz, stereo
        assert_eq!(
            inspect_audio(&[0xAF, 0x00, 0x12, 0x10]),
            Some(AudioPacket::Config {
                sample_rate: Some(44100)
            })
        );
        // AAC LC, 48000 Hz
        assert_eq!(
            inspect_audio(&[0xAF, 0x00, 0x11, 0x90]),
            Some(AudioPacket::Config {
                sample_rate: Some(48000)
            })
        );
    }

    #[test]
    fn mp3_frame_uses_flag_rate() {
        assert_eq!(
            inspect_audio(&[0x2E, 0xFF]),
            Some(AudioPacket::Frame {
                sample_rate: Some(44100),
                samples_per_frame: Some(1152)
            })
        );
    }
}
