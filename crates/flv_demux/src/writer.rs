//! Tag encoders, used for timestamp rewriting and for building synthetic
//! streams.

use crate::amf::{AmfValue, Keyframes, Metadata};
use crate::header::{HEADER_SIZE, PREVIOUS_TAG_SIZE_LEN};
use crate::tag::{TagType, TAG_HEADER_SIZE};

/// Overwrite the timestamp of the tag starting at `buffer[0]`.
pub fn write_timestamp(buffer: &mut [u8], millis: u32) {
    if buffer.len() < TAG_HEADER_SIZE {
        return;
    }
    buffer[4] = (millis >> 16) as u8;
    buffer[5] = (millis >> 8) as u8;
    buffer[6] = millis as u8;
    buffer[7] = (millis >> 24) as u8;
}

/// File header followed by `PreviousTagSize0`
pub fn header(has_audio: bool, has_video: bool) -> Vec<u8> {
    let mut flags = 0u8;
    if has_audio {
        flags |= 0x04;
    }
    if has_video {
        flags |= 0x01;
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + PREVIOUS_TAG_SIZE_LEN);
    out.extend_from_slice(b"FLV");
    out.push(1);
    out.push(flags);
    out.extend_from_slice(&(HEADER_SIZE as u32).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out
}

/// A complete tag: header, body and trailing previous-tag-size.
pub fn tag(tag_type: TagType, millis: u32, body: &[u8]) -> Vec<u8> {
    let size = body.len() as u32;
    let mut out = Vec::with_capacity(TAG_HEADER_SIZE + body.len() + 4);
    out.push(tag_type.as_u8());
    out.extend_from_slice(&size.to_be_bytes()[1..]);
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&[0; 3]);
    write_timestamp(&mut out, millis);
    out.extend_from_slice(body);
    out.extend_from_slice(&(TAG_HEADER_SIZE as u32 + size).to_be_bytes());
    out
}

pub fn metadata_tag(metadata: &Metadata) -> Vec<u8> {
    let mut body = Vec::new();
    AmfValue::String("onMetaData".to_string()).encode_into(&mut body);
    metadata.to_value().encode_into(&mut body);
    tag(TagType::Script, 0, &body)
}

pub fn avc_sequence_header(millis: u32) -> Vec<u8> {
    let body = [
        0x17, 0x00, 0x00, 0x00, 0x00, // keyframe, AVC, sequence header
        0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1F, 0x01, 0x00, 0x04,
        0x68, 0xEE, 0x3C, 0x80,
    ];
    tag(TagType::Video, millis, &body)
}

pub fn avc_frame(millis: u32, keyframe: bool, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(5 + payload.len());
    body.push(if keyframe { 0x17 } else { 0x27 });
    body.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
    body.extend_from_slice(payload);
    tag(TagType::Video, millis, &body)
}

/// AAC AudioSpecificConfig for LC at 44100 Hz stereo
pub fn aac_sequence_header(millis: u32) -> Vec<u8> {
    tag(TagType::Audio, millis, &[0xAF, 0x00, 0x12, 0x10])
}

pub fn aac_frame(millis: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + payload.len());
    body.extend_from_slice(&[0xAF, 0x01]);
    body.extend_from_slice(payload);
    tag(TagType::Audio, millis, &body)
}

/// Describes a generated H.264 (+ optional AAC) stream with a regular GOP.
#[derive(Debug, Clone)]
pub struct SyntheticStream {
    pub duration: f64,
    pub framerate: f64,
    /// Seconds between keyframes
    pub keyframe_interval: f64,
    pub audio: bool,
    /// Write `onMetaData.keyframes`
    pub keyframe_table: bool,
    /// Write `onMetaData.duration`
    pub duration_in_metadata: bool,
    pub frame_size: usize,
}

const AAC_SAMPLES: f64 = 1024.0;
const AAC_RATE: f64 = 44100.0;

impl SyntheticStream {
    pub fn video(duration: f64, framerate: f64) -> Self {
        Self {
            duration,
            framerate,
            keyframe_interval: 10.0,
            audio: false,
            keyframe_table: true,
            duration_in_metadata: true,
            frame_size: 64,
        }
    }

    fn frame_count(&self) -> usize {
        (self.duration * self.framerate).round() as usize
    }

    fn gop(&self) -> usize {
        ((self.keyframe_interval * self.framerate).round() as usize).max(1)
    }

    fn metadata(&self, keyframes: Option<Keyframes>) -> Metadata {
        Metadata {
            duration: self.duration_in_metadata.then_some(self.duration),
            width: Some(640.0),
            height: Some(360.0),
            framerate: Some(self.framerate),
            audio_sample_rate: self.audio.then_some(AAC_RATE),
            keyframes,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let frames = self.frame_count();
        let gop = self.gop();
        let keyframe_count = frames.div_ceil(gop);

        // f64 fields make the metadata size independent of the values
        let placeholder = self.keyframe_table.then(|| Keyframes {
            filepositions: vec![0; keyframe_count],
            times: vec![0.0; keyframe_count],
        });
        let metadata_len = metadata_tag(&self.metadata(placeholder)).len();

        let prefix_len = HEADER_SIZE + PREVIOUS_TAG_SIZE_LEN + metadata_len;
        let mut body = Vec::new();
        body.extend(avc_sequence_header(0));
        if self.audio {
            body.extend(aac_sequence_header(0));
        }

        let mut keyframes = Keyframes::default();
        let audio_frames = if self.audio {
            (self.duration * AAC_RATE / AAC_SAMPLES).floor() as usize
        } else {
            0
        };
        let mut audio_index = 0;
        for index in 0..frames {
            let millis = (index as f64 * 1000.0 / self.framerate).round() as u32;
            while audio_index < audio_frames {
                let audio_millis = (audio_index as f64 * AAC_SAMPLES * 1000.0 / AAC_RATE).round() as u32;
                if audio_millis > millis {
                    break;
                }
                body.extend(aac_frame(audio_millis, &[audio_index as u8; 16]));
                audio_index += 1;
            }
            let keyframe = index % gop == 0;
            if keyframe {
                keyframes.filepositions.push((prefix_len + body.len()) as u64);
                keyframes.times.push(millis as f64 / 1000.0);
            }
            body.extend(avc_frame(millis, keyframe, &vec![index as u8; self.frame_size]));
        }
        while audio_index < audio_frames {
            let audio_millis = (audio_index as f64 * AAC_SAMPLES * 1000.0 / AAC_RATE).round() as u32;
            body.extend(aac_frame(audio_millis, &[audio_index as u8; 16]));
            audio_index += 1;
        }

        let mut out = header(self.audio, true);
        out.extend(metadata_tag(
            &self.metadata(self.keyframe_table.then_some(keyframes)),
        ));
        debug_assert_eq!(out.len(), prefix_len);
        out.extend(body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TagHeader;

    #[test]
    fn tag_layout() {
        let bytes = tag(TagType::Audio, 0x0102_0304, &[1, 2, 3]);
        assert_eq!(bytes.len(), 11 + 3 + 4);
        let header = TagHeader::parse(&bytes, 0).unwrap();
        assert_eq!(header.data_size, 3);
        assert_eq!(header.timestamp, 0x0102_0304);
        assert_eq!(&bytes[14..], &14u32.to_be_bytes());
    }

    #[test]
    fn keyframe_positions_point_at_tags() {
        let stream = SyntheticStream::video(30.0, 2.0);
        let bytes = stream.build();
        let metadata_start = HEADER_SIZE + PREVIOUS_TAG_SIZE_LEN;
        let header = TagHeader::parse(&bytes[metadata_start..], 0).unwrap();
        let body = &bytes[metadata_start + 11..metadata_start + 11 + header.data_size as usize];
        let metadata = Metadata::from_script(body).unwrap().unwrap();
        let table = metadata.keyframes.unwrap();
        assert_eq!(table.times, vec![0.0, 10.0, 20.0]);
        for (position, time) in table.iter() {
            let tag = TagHeader::parse(&bytes[position as usize..], position).unwrap();
            assert_eq!(tag.tag_type, TagType::Video);
            assert_eq!(tag.timestamp as f64, time * 1000.0);
            assert_eq!(bytes[position as usize + 11], 0x17);
        }
    }
}
