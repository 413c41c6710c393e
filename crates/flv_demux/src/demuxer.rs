use bytes::{Bytes, BytesMut};

use crate::amf::Metadata;
use crate::header::{FlvHeader, HEADER_SIZE};
use crate::tag::{
    inspect_audio, inspect_video, AudioPacket, TagHeader, TagType, VideoPacket, TAG_HEADER_SIZE,
};
use crate::{DemuxError, Demuxed, MediaSegment, SegmentKind};

/// Everything a decoder needs before the first coded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InitInfo {
    pub header: FlvHeader,
    pub metadata: Option<Metadata>,
    /// AAC sampling rate from the AudioSpecificConfig
    pub sample_rate: Option<u32>,
    /// Header, `PreviousTagSize0`, script tags and codec configuration tags
    pub payload: Bytes,
    prefix: Bytes,
    scripts: Bytes,
    video_config: Option<Bytes>,
    audio_config: Option<Bytes>,
}

impl InitInfo {
    fn build(
        header: FlvHeader,
        metadata: Option<Metadata>,
        sample_rate: Option<u32>,
        prefix: Bytes,
        scripts: Bytes,
        video_config: Option<Bytes>,
        audio_config: Option<Bytes>,
    ) -> Self {
        let mut payload = BytesMut::with_capacity(
            prefix.len()
                + scripts.len()
                + video_config.as_ref().map_or(0, Bytes::len)
                + audio_config.as_ref().map_or(0, Bytes::len),
        );
        payload.extend_from_slice(&prefix);
        payload.extend_from_slice(&scripts);
        if let Some(config) = &video_config {
            payload.extend_from_slice(config);
        }
        if let Some(config) = &audio_config {
            payload.extend_from_slice(config);
        }
        Self {
            header,
            metadata,
            sample_rate,
            payload: payload.freeze(),
            prefix,
            scripts,
            video_config,
            audio_config,
        }
    }

    pub fn framerate(&self) -> Option<f64> {
        self.metadata.as_ref().and_then(|m| m.framerate)
    }

    pub fn duration(&self) -> Option<f64> {
        self.metadata.as_ref().and_then(|m| m.duration)
    }

    pub fn first_tag_offset(&self) -> u64 {
        self.header.first_tag_offset()
    }

    pub fn has_video_config(&self) -> bool {
        self.video_config.is_some()
    }

    pub fn has_audio_config(&self) -> bool {
        self.audio_config.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Tags,
}

/// Incremental FLV demuxer.
///
/// Bytes may arrive in chunks of any size; incomplete units stay buffered until
/// the next `push`. The emitted sequence only depends on the bytes, never on
/// how they were split.
pub struct FlvDemuxer {
    phase: Phase,
    buffer: BytesMut,
    /// Stream offset of `buffer[0]`
    position: u64,
    seen: u64,
    header: Option<FlvHeader>,
    prefix: Bytes,
    scripts: BytesMut,
    metadata: Option<Metadata>,
    video_config: Option<Bytes>,
    audio_config: Option<Bytes>,
    sample_rate: Option<u32>,
    init: Option<InitInfo>,
    init_dirty: bool,
    last_timestamp: f64,
    finished: bool,
}

impl Default for FlvDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvDemuxer {
    /// Demuxer expecting the stream to start with the file header.
    pub fn new() -> Self {
        Self {
            phase: Phase::Header,
            buffer: BytesMut::new(),
            position: 0,
            seen: 0,
            header: None,
            prefix: Bytes::new(),
            scripts: BytesMut::new(),
            metadata: None,
            video_config: None,
            audio_config: None,
            sample_rate: None,
            init: None,
            init_dirty: false,
            last_timestamp: 0.0,
            finished: false,
        }
    }

    /// Demuxer starting at a tag boundary `offset` of a stream whose init unit
    /// is already known. The known init is not emitted again.
    pub fn resume(init: &InitInfo, offset: u64) -> Self {
        let mut demuxer = Self::new();
        demuxer.phase = Phase::Tags;
        demuxer.position = offset;
        demuxer.header = Some(init.header);
        demuxer.prefix = init.prefix.clone();
        demuxer.scripts = BytesMut::from(&init.scripts[..]);
        demuxer.metadata = init.metadata.clone();
        demuxer.video_config = init.video_config.clone();
        demuxer.audio_config = init.audio_config.clone();
        demuxer.sample_rate = init.sample_rate;
        demuxer.init = Some(init.clone());
        demuxer
    }

    pub fn header(&self) -> Option<&FlvHeader> {
        self.header.as_ref()
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// The last init unit emitted (or seeded by `resume`).
    pub fn init(&self) -> Option<&InitInfo> {
        self.init.as_ref()
    }

    /// True once an init unit has been emitted and no configuration change is pending.
    pub fn init_complete(&self) -> bool {
        self.init.is_some() && !self.init_dirty
    }

    /// Stream offset of the first byte not yet consumed.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn bytes_seen(&self) -> u64 {
        self.seen
    }

    /// Bytes still missing to complete the unit under construction.
    pub fn needed(&self) -> usize {
        let buffered = self.buffer.len();
        match self.phase {
            Phase::Header => {
                if buffered < HEADER_SIZE {
                    return HEADER_SIZE - buffered;
                }
                match FlvHeader::parse(&self.buffer[..HEADER_SIZE]) {
                    Ok(header) => (header.first_tag_offset() as usize).saturating_sub(buffered),
                    Err(_) => 0,
                }
            }
            Phase::Tags => {
                if buffered < TAG_HEADER_SIZE {
                    return TAG_HEADER_SIZE - buffered;
                }
                match TagHeader::parse(&self.buffer[..TAG_HEADER_SIZE], self.position) {
                    Ok(tag) => tag.total_size().saturating_sub(buffered),
                    Err(_) => 0,
                }
            }
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Demuxed>, DemuxError> {
        let mut out = Vec::new();
        if chunk.is_empty() {
            return Ok(out);
        }
        self.seen += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        loop {
            match self.phase {
                Phase::Header => {
                    if self.buffer.len() < HEADER_SIZE {
                        break;
                    }
                    let header = FlvHeader::parse(&self.buffer[..HEADER_SIZE])?;
                    let prefix_len = header.first_tag_offset() as usize;
                    if self.buffer.len() < prefix_len {
                        break;
                    }
                    self.prefix = self.buffer.split_to(prefix_len).freeze();
                    self.position += prefix_len as u64;
                    self.header = Some(header);
                    self.phase = Phase::Tags;
                }
                Phase::Tags => {
                    if self.buffer.len() < TAG_HEADER_SIZE {
                        break;
                    }
                    let tag = TagHeader::parse(&self.buffer[..TAG_HEADER_SIZE], self.position)?;
                    let total = tag.total_size();
                    if self.buffer.len() < total {
                        break;
                    }
                    let bytes = self.buffer.split_to(total).freeze();
                    let offset = self.position;
                    self.position += total as u64;
                    self.handle_tag(tag, bytes, offset, &mut out);
                }
            }
        }
        Ok(out)
    }

    /// Signal end of input.
    pub fn finish(&mut self) -> Result<Vec<Demuxed>, DemuxError> {
        if self.seen == 0 {
            return Err(DemuxError::EmptyRange);
        }
        if !self.buffer.is_empty() {
            if self.phase == Phase::Header && self.buffer.len() < HEADER_SIZE {
                return Err(DemuxError::HeaderTooShort {
                    len: self.buffer.len(),
                });
            }
            return Err(DemuxError::Truncated {
                offset: self.position,
                needed: self.needed(),
            });
        }
        let mut out = Vec::new();
        if !self.finished {
            self.flush_init(self.last_timestamp, &mut out);
            out.push(Demuxed::EndOfStream);
            self.finished = true;
        }
        Ok(out)
    }

    fn handle_tag(&mut self, tag: TagHeader, bytes: Bytes, offset: u64, out: &mut Vec<Demuxed>) {
        let body_end = TAG_HEADER_SIZE + tag.data_size as usize;
        let trailer = &bytes[body_end..];
        let declared = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if declared as usize != body_end {
            log::warn!(
                "Previous tag size mismatch at {}: declared {}, actual {}",
                offset,
                declared,
                body_end
            );
        }
        let body = bytes.slice(TAG_HEADER_SIZE..body_end);
        let timestamp = tag.timestamp as f64 / 1000.0;

        match tag.tag_type {
            TagType::Script => self.handle_script(&body, bytes, offset),
            TagType::Video => match inspect_video(&body) {
                Some(VideoPacket::Config) => {
                    if self.video_config.as_ref().map(|c| c.slice(TAG_HEADER_SIZE..c.len() - 4))
                        != Some(body.clone())
                    {
                        self.video_config = Some(bytes);
                        self.init_dirty = true;
                    }
                }
                Some(VideoPacket::Frame { keyframe }) => {
                    let duration = self
                        .metadata
                        .as_ref()
                        .and_then(|m| m.framerate)
                        .map_or(0.0, |fps| 1.0 / fps);
                    self.emit(SegmentKind::Video, timestamp, duration, keyframe, bytes, out);
                }
                Some(VideoPacket::EndOfSequence) | Some(VideoPacket::Command) | None => {
                    log::trace!("Skip video tag without picture at {}", offset);
                }
            },
            TagType::Audio => match inspect_audio(&body) {
                Some(AudioPacket::Config { sample_rate }) => {
                    if sample_rate.is_some() {
                        self.sample_rate = sample_rate;
                    }
                    if self.audio_config.as_ref().map(|c| c.slice(TAG_HEADER_SIZE..c.len() - 4))
                        != Some(body.clone())
                    {
                        self.audio_config = Some(bytes);
                        self.init_dirty = true;
                    }
                }
                Some(AudioPacket::Frame {
                    sample_rate,
                    samples_per_frame,
                }) => {
                    let rate = sample_rate.or(self.sample_rate).or_else(|| {
                        self.metadata
                            .as_ref()
                            .and_then(|m| m.audio_sample_rate)
                            .map(|r| r as u32)
                    });
                    let duration = match (samples_per_frame, rate) {
                        (Some(samples), Some(rate)) if rate > 0 => samples as f64 / rate as f64,
                        _ => 0.0,
                    };
                    self.emit(SegmentKind::Audio, timestamp, duration, true, bytes, out);
                }
                None => log::trace!("Skip empty audio tag at {}", offset),
            },
        }
    }

    fn handle_script(&mut self, body: &[u8], bytes: Bytes, offset: u64) {
        match Metadata::from_script(body) {
            Ok(Some(metadata)) => {
                if self.metadata.is_none() || self.init.is_none() {
                    self.metadata = Some(metadata);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Skip unreadable script tag at {}: {}", offset, e),
        }
        if self.init.is_none() {
            self.scripts.extend_from_slice(&bytes);
        }
    }

    fn emit(
        &mut self,
        kind: SegmentKind,
        timestamp: f64,
        duration: f64,
        keyframe: bool,
        payload: Bytes,
        out: &mut Vec<Demuxed>,
    ) {
        self.flush_init(timestamp, out);
        self.last_timestamp = timestamp;
        out.push(Demuxed::Segment(MediaSegment {
            kind,
            timestamp,
            duration,
            keyframe,
            payload,
        }));
    }

    fn flush_init(&mut self, timestamp: f64, out: &mut Vec<Demuxed>) {
        if self.init.is_some() && !self.init_dirty {
            return;
        }
        let Some(header) = self.header else {
            return;
        };
        let init = InitInfo::build(
            header,
            self.metadata.clone(),
            self.sample_rate,
            self.prefix.clone(),
            Bytes::copy_from_slice(&self.scripts),
            self.video_config.clone(),
            self.audio_config.clone(),
        );
        out.push(Demuxed::Segment(MediaSegment {
            kind: SegmentKind::Init,
            timestamp,
            duration: 0.0,
            keyframe: false,
            payload: init.payload.clone(),
        }));
        self.init = Some(init);
        self.init_dirty = false;
    }
}
