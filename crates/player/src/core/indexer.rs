use std::future::Future;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use flv_demux::tag::{inspect_video, VideoPacket, TAG_HEADER_SIZE};
use flv_demux::{DemuxError, FlvDemuxer, InitInfo, TagHeader, TagType};

use crate::config::PlayerConfig;
use crate::core::fetcher::{read_range, ByteRange, RangeFetch};
use crate::errors::{FetchError, PlayerError};
use crate::Source;

/// Tag header plus the two body bytes needed to classify a video tag
const SCAN_READ: u64 = TAG_HEADER_SIZE as u64 + 2;

/// Where one source sits inside the logical concatenation.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLayout {
    pub url: String,
    pub byte_len: Option<u64>,
    /// Global offset of the source's first byte
    pub base_offset: u64,
    /// Global time of the source's zero timestamp
    pub base_time: f64,
    pub duration: f64,
    /// Local offset of the first tag, right after the file header
    pub first_tag_offset: u64,
    pub init: InitInfo,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentIndexEntry {
    pub index: usize,
    pub source: usize,
    /// Offset in the logical concatenation of all sources
    pub byte_offset: u64,
    /// Offset inside the entry's own source
    pub local_offset: u64,
    /// Global presentation time in seconds
    pub timestamp: f64,
    pub duration: f64,
}

/// Byte range covering consecutive index entries of one source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchWindow {
    pub source: usize,
    pub first: usize,
    pub range: ByteRange,
    /// Entry the following window starts at, if the index knows it
    pub next: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentIndex {
    pub sources: Vec<SourceLayout>,
    pub entries: Vec<SegmentIndexEntry>,
    /// False while only a prefix of the sources has been probed
    pub complete: bool,
}

impl SegmentIndex {
    pub fn entry_at_or_before(&self, time: f64) -> Option<&SegmentIndexEntry> {
        let after = self.entries.partition_point(|e| e.timestamp <= time);
        self.entries.get(after.saturating_sub(1))
    }

    pub fn first_entry_of(&self, source: usize) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.source == source)
            .map(|e| e.index)
    }

    pub fn total_duration(&self) -> f64 {
        self.sources.iter().map(|s| s.duration).sum()
    }

    /// Whether `time` lies inside the probed sources.
    pub fn covers(&self, time: f64) -> bool {
        self.complete || time < self.total_duration()
    }

    pub fn window(&self, first: usize, count: usize) -> Option<FetchWindow> {
        let entry = self.entries.get(first)?;
        let boundary = self.first_entry_of(entry.source + 1);
        let limit = first + count.max(1);
        let end_entry = match boundary {
            Some(b) if b <= limit => None,
            _ => self.entries.get(limit).filter(|e| e.source == entry.source),
        };
        Some(match end_entry {
            Some(end) => FetchWindow {
                source: entry.source,
                first,
                range: ByteRange::new(entry.local_offset, Some(end.local_offset - 1)),
                next: Some(end.index),
            },
            None => FetchWindow {
                source: entry.source,
                first,
                range: ByteRange::from_start(entry.local_offset),
                next: boundary,
            },
        })
    }
}

#[derive(Debug, Clone)]
struct SourceProbe {
    url: String,
    byte_len: Option<u64>,
    init: InitInfo,
    /// (local offset, local time) of every seek point
    points: Vec<(u64, f64)>,
    duration: f64,
    /// Highest offset known to belong to the source
    end_offset: u64,
}

/// Result of probing only the first source.
#[derive(Debug, Clone)]
pub struct FastStart {
    pub index: SegmentIndex,
    pub init: InitInfo,
    /// Estimated duration of the whole source list
    pub duration: f64,
    first: SourceProbe,
}

fn assemble(probes: &[SourceProbe], complete: bool) -> SegmentIndex {
    let mut sources = Vec::with_capacity(probes.len());
    let mut entries = Vec::new();
    let mut base_time = 0.0;
    let mut base_offset = 0;

    for (source, probe) in probes.iter().enumerate() {
        for (k, &(offset, time)) in probe.points.iter().enumerate() {
            let end = probe
                .points
                .get(k + 1)
                .map_or(probe.duration, |&(_, next)| next);
            entries.push(SegmentIndexEntry {
                index: entries.len(),
                source,
                byte_offset: base_offset + offset,
                local_offset: offset,
                timestamp: base_time + time,
                duration: (end - time).max(0.0),
            });
        }
        sources.push(SourceLayout {
            url: probe.url.clone(),
            byte_len: probe.byte_len,
            base_offset,
            base_time,
            duration: probe.duration,
            first_tag_offset: probe.init.first_tag_offset(),
            init: probe.init.clone(),
        });
        base_time += probe.duration;
        base_offset += probe.byte_len.unwrap_or(probe.end_offset);
    }

    SegmentIndex {
        sources,
        entries,
        complete,
    }
}

/// Builds seek indexes from bounded prefix reads and small targeted reads.
pub struct SegmentIndexer {
    fetch: Arc<dyn RangeFetch>,
    config: PlayerConfig,
    session: String,
}

impl SegmentIndexer {
    pub fn new(fetch: Arc<dyn RangeFetch>, config: PlayerConfig, session: &str) -> Self {
        Self {
            fetch,
            config,
            session: session.to_string(),
        }
    }

    /// Probe every source.
    pub async fn probe(&self, source: &Source) -> Result<SegmentIndex, PlayerError> {
        if source.urls.is_empty() {
            return Err(PlayerError::NoSources);
        }
        let mut probes = Vec::with_capacity(source.urls.len());
        for url in &source.urls {
            probes.push(self.probe_source(url).await?);
        }
        Ok(assemble(&probes, true))
    }

    /// Probe the first source only, enough to start playback.
    pub async fn probe_first(&self, source: &Source) -> Result<FastStart, PlayerError> {
        let url = source.urls.first().ok_or(PlayerError::NoSources)?;
        let first = self.probe_source(url).await?;
        let complete = source.urls.len() == 1;
        let index = assemble(std::slice::from_ref(&first), complete);
        let duration = match source.duration {
            Some(hint) if hint > 0.0 => hint,
            _ if complete => first.duration,
            _ => first.duration * source.urls.len() as f64,
        };
        Ok(FastStart {
            init: first.init.clone(),
            index,
            duration,
            first,
        })
    }

    /// Probe the remaining sources after `probe_first`.
    pub async fn probe_continue(
        &self,
        source: &Source,
        fast: &FastStart,
    ) -> Result<SegmentIndex, PlayerError> {
        let mut probes = Vec::with_capacity(source.urls.len());
        probes.push(fast.first.clone());
        for url in source.urls.iter().skip(1) {
            probes.push(self.probe_source(url).await?);
        }
        Ok(assemble(&probes, true))
    }

    pub async fn probe_with_retry(&self, source: &Source) -> Result<SegmentIndex, PlayerError> {
        self.with_retry("probe", || self.probe(source)).await
    }

    pub async fn probe_first_with_retry(&self, source: &Source) -> Result<FastStart, PlayerError> {
        self.with_retry("probe first", || self.probe_first(source))
            .await
    }

    pub async fn probe_continue_with_retry(
        &self,
        source: &Source,
        fast: &FastStart,
    ) -> Result<SegmentIndex, PlayerError> {
        self.with_retry("probe rest", || self.probe_continue(source, fast))
            .await
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut attempt_fn: F) -> Result<T, PlayerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlayerError>>,
    {
        let mut attempt = 0;
        loop {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_fatal() && attempt < self.config.probe_retries => {
                    attempt += 1;
                    let delay = self.config.retry_delay(attempt);
                    log::warn!(
                        "[{}]{} failed: {}, retry {}/{} in {:?}",
                        self.session,
                        what,
                        e,
                        attempt,
                        self.config.probe_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn probe_source(&self, url: &str) -> Result<SourceProbe, PlayerError> {
        let fetch = &*self.fetch;
        let (first, byte_len) =
            read_range(fetch, url, ByteRange::sized(0, self.config.probe_bytes)).await?;
        let mut prefix = BytesMut::from(&first[..]);
        let mut demuxer = FlvDemuxer::new();
        demuxer.push(&prefix)?;

        let mut eof = byte_len.is_some_and(|len| prefix.len() as u64 >= len)
            || (prefix.len() as u64) < self.config.probe_bytes;
        while !demuxer.init_complete() {
            if eof {
                demuxer.finish()?;
                break;
            }
            let have = prefix.len() as u64;
            if have >= self.config.max_probe_bytes {
                return Err(DemuxError::Truncated {
                    offset: demuxer.position(),
                    needed: demuxer.needed(),
                }
                .into());
            }
            let want = (demuxer.needed() as u64)
                .max(self.config.probe_bytes)
                .min(self.config.max_probe_bytes - have);
            match read_range(fetch, url, ByteRange::sized(have, want)).await {
                Ok((more, _)) => {
                    eof = (more.len() as u64) < want;
                    demuxer.push(&more)?;
                    prefix.extend_from_slice(&more);
                }
                Err(FetchError::EmptyRange) => eof = true,
                Err(e) => return Err(e.into()),
            }
        }
        let prefix = prefix.freeze();
        let init = demuxer.init().cloned().ok_or(PlayerError::Malformed(
            DemuxError::HeaderTooShort { len: prefix.len() },
        ))?;
        let metadata = init.metadata.clone().unwrap_or_default();
        let first_tag = init.first_tag_offset();

        let mut points = vec![(first_tag, 0.0)];
        let mut end_offset = prefix.len() as u64;
        let mut scanned_end = None;
        let from_table = match &metadata.keyframes {
            Some(keyframes) => {
                for (position, time) in keyframes.iter() {
                    let (last_position, last_time) = points[points.len() - 1];
                    if position > last_position
                        && time > last_time
                        && byte_len.map_or(true, |len| position < len)
                    {
                        points.push((position, time));
                    }
                }
                points.len() == 1 || self.is_keyframe_at(url, &prefix, points[1].0).await?
            }
            None => false,
        };
        if !from_table {
            if metadata.keyframes.is_some() {
                log::warn!(
                    "[{}]Keyframe table of {} does not match the stream, scanning",
                    self.session,
                    url
                );
            }
            points.truncate(1);
            let scan = self.scan(url, &prefix, first_tag, byte_len, &mut points).await?;
            end_offset = end_offset.max(scan.0);
            scanned_end = scan.1;
        }
        end_offset = end_offset.max(points[points.len() - 1].0);

        let duration = match metadata.duration {
            Some(duration) => duration,
            None => match scanned_end {
                Some(last) => last,
                None => match self.tail_timestamp(url, byte_len).await {
                    Some(last) => last,
                    None => points[points.len() - 1].1,
                },
            },
        };

        log::info!(
            "[{}]Probed {}: {} seek points, {:.3}s, {} bytes",
            self.session,
            url,
            points.len(),
            duration,
            byte_len.map_or("unknown".to_string(), |l| l.to_string())
        );

        Ok(SourceProbe {
            url: url.to_string(),
            byte_len,
            init,
            points,
            duration,
            end_offset,
        })
    }

    /// Tag header plus a couple of body bytes at `offset`, from the prefix when
    /// it is already there.
    async fn read_tag_head(
        &self,
        url: &str,
        prefix: &Bytes,
        offset: u64,
    ) -> Result<Option<Bytes>, PlayerError> {
        if offset + SCAN_READ <= prefix.len() as u64 {
            let start = offset as usize;
            return Ok(Some(prefix.slice(start..start + SCAN_READ as usize)));
        }
        match read_range(&*self.fetch, url, ByteRange::sized(offset, SCAN_READ)).await {
            Ok((head, _)) => Ok(Some(head)),
            Err(FetchError::EmptyRange) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_keyframe_at(
        &self,
        url: &str,
        prefix: &Bytes,
        offset: u64,
    ) -> Result<bool, PlayerError> {
        let Some(head) = self.read_tag_head(url, prefix, offset).await? else {
            return Ok(false);
        };
        let Ok(tag) = TagHeader::parse(&head, offset) else {
            return Ok(false);
        };
        Ok(tag.tag_type == TagType::Video
            && head.len() > TAG_HEADER_SIZE
            && matches!(
                inspect_video(&head[TAG_HEADER_SIZE..]),
                Some(VideoPacket::Frame { keyframe: true })
            ))
    }

    /// Walk tag headers collecting video keyframes. Returns the offset reached
    /// and, when the end of the source was reached, the last timestamp seen.
    async fn scan(
        &self,
        url: &str,
        prefix: &Bytes,
        first_tag: u64,
        byte_len: Option<u64>,
        points: &mut Vec<(u64, f64)>,
    ) -> Result<(u64, Option<f64>), PlayerError> {
        let mut offset = first_tag;
        let mut requests = 0;
        let mut last_time = 0.0;
        loop {
            if byte_len.is_some_and(|len| offset + TAG_HEADER_SIZE as u64 > len) {
                return Ok((offset, Some(last_time)));
            }
            if offset + SCAN_READ > prefix.len() as u64 {
                if requests >= self.config.max_scan_requests {
                    log::warn!(
                        "[{}]Scan of {} stopped at byte {} after {} requests",
                        self.session,
                        url,
                        offset,
                        requests
                    );
                    return Ok((offset, None));
                }
                requests += 1;
            }
            let Some(head) = self.read_tag_head(url, prefix, offset).await? else {
                return Ok((offset, Some(last_time)));
            };
            if head.len() < TAG_HEADER_SIZE {
                // trailing bytes too short for a tag
                return Ok((offset, Some(last_time)));
            }
            let tag = TagHeader::parse(&head, offset)?;
            let time = tag.timestamp as f64 / 1000.0;
            last_time = time;
            let body_end = (TAG_HEADER_SIZE + tag.data_size as usize).min(head.len());
            if tag.tag_type == TagType::Video
                && matches!(
                    inspect_video(&head[TAG_HEADER_SIZE..body_end]),
                    Some(VideoPacket::Frame { keyframe: true })
                )
                && time > points[points.len() - 1].1
            {
                points.push((offset, time));
            }
            offset += tag.total_size() as u64;
        }
    }

    /// Timestamp of the last tag, located through the trailing previous-tag-size.
    async fn tail_timestamp(&self, url: &str, byte_len: Option<u64>) -> Option<f64> {
        let len = byte_len?;
        if len < 4 + TAG_HEADER_SIZE as u64 {
            return None;
        }
        let fetch = &*self.fetch;
        let (tail, _) = read_range(fetch, url, ByteRange::sized(len - 4, 4)).await.ok()?;
        if tail.len() < 4 {
            return None;
        }
        let size = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]) as u64;
        if size < TAG_HEADER_SIZE as u64 || size + 4 > len {
            return None;
        }
        let start = len - 4 - size;
        let (head, _) = read_range(fetch, url, ByteRange::sized(start, TAG_HEADER_SIZE as u64))
            .await
            .ok()?;
        let tag = TagHeader::parse(&head, start).ok()?;
        Some(tag.timestamp as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fetcher::MemoryFetch;
    use flv_demux::writer::{self, SyntheticStream};
    use flv_demux::Metadata;

    fn indexer(fetch: &MemoryFetch, config: PlayerConfig) -> SegmentIndexer {
        SegmentIndexer::new(Arc::new(fetch.clone()), config, "test")
    }

    fn small_config() -> PlayerConfig {
        PlayerConfig {
            probe_bytes: 512,
            probe_retry_delay_ms: 1,
            ..PlayerConfig::default()
        }
    }

    #[tokio::test]
    async fn index_from_keyframe_table() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", SyntheticStream::video(710.0, 2.0).build());
        fetch.insert("mem://1", SyntheticStream::video(710.0, 2.0).build());
        let source = Source::new(vec!["mem://0".into(), "mem://1".into()], Some(1420.0));

        let index = indexer(&fetch, small_config()).probe(&source).await.unwrap();
        assert!(index.complete);
        assert_eq!(index.sources.len(), 2);
        assert_eq!(index.total_duration(), 1420.0);
        // entry 0 plus keyframes at 10, 20, ... 700 per source
        assert_eq!(index.entries.len(), 2 * 71);
        assert_eq!(index.entries[0].timestamp, 0.0);
        assert_eq!(index.entries[0].local_offset, 13);
        assert_eq!(index.entries[71].source, 1);
        assert_eq!(index.entries[71].timestamp, 710.0);
        assert_eq!(
            index.entries[71].byte_offset,
            index.sources[0].byte_len.unwrap() + 13
        );
        for pair in index.entries.windows(2) {
            assert!(pair[0].byte_offset < pair[1].byte_offset);
            assert!(pair[0].timestamp < pair[1].timestamp);
        }

        let entry = index.entry_at_or_before(700.0).unwrap();
        assert_eq!(entry.timestamp, 700.0);
        let entry = index.entry_at_or_before(715.0).unwrap();
        assert_eq!(entry.timestamp, 710.0);
        assert_eq!(index.entry_at_or_before(-1.0).unwrap().index, 0);
    }

    #[tokio::test]
    async fn windows_stay_inside_a_source() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", SyntheticStream::video(60.0, 2.0).build());
        fetch.insert("mem://1", SyntheticStream::video(60.0, 2.0).build());
        let source = Source::new(vec!["mem://0".into(), "mem://1".into()], None);
        let index = indexer(&fetch, small_config()).probe(&source).await.unwrap();
        // six entries per source: 0, 10, ... 50
        assert_eq!(index.entries.len(), 12);

        let window = index.window(0, 4).unwrap();
        assert_eq!(window.source, 0);
        assert_eq!(window.next, Some(4));
        assert_eq!(
            window.range,
            ByteRange::new(13, Some(index.entries[4].local_offset - 1))
        );

        let window = index.window(4, 4).unwrap();
        assert_eq!(window.range, ByteRange::from_start(index.entries[4].local_offset));
        assert_eq!(window.next, Some(6));

        let window = index.window(10, 4).unwrap();
        assert_eq!(window.source, 1);
        assert_eq!(window.next, None);
        assert!(index.window(12, 4).is_none());
    }

    #[tokio::test]
    async fn tiny_first_segment() {
        let mut bytes = writer::header(false, true);
        bytes.extend(writer::metadata_tag(&Metadata {
            duration: Some(20.0),
            framerate: Some(4.0),
            ..Metadata::default()
        }));
        bytes.extend(writer::avc_sequence_header(0));
        for frame in 0..80u32 {
            let millis = frame * 250;
            let keyframe = matches!(millis, 0 | 250 | 10_000);
            bytes.extend(writer::avc_frame(millis, keyframe, &[0; 8]));
        }
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", bytes);
        let source = Source::new(vec!["mem://0".into()], None);
        let index = indexer(&fetch, small_config()).probe(&source).await.unwrap();

        let entries: Vec<(f64, f64)> = index
            .entries
            .iter()
            .map(|e| (e.timestamp, e.duration))
            .collect();
        assert_eq!(entries, vec![(0.0, 0.25), (0.25, 9.75), (10.0, 10.0)]);
    }

    #[tokio::test]
    async fn scan_without_keyframe_table() {
        let fetch = MemoryFetch::new();
        let stream = SyntheticStream {
            keyframe_table: false,
            duration_in_metadata: false,
            ..SyntheticStream::video(60.0, 2.0)
        };
        fetch.insert("mem://0", stream.build());
        let source = Source::new(vec!["mem://0".into()], None);
        let index = indexer(&fetch, small_config()).probe(&source).await.unwrap();
        let times: Vec<f64> = index.entries.iter().map(|e| e.timestamp).collect();
        assert_eq!(times, vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0]);
        // last frame at 59.5s
        assert_eq!(index.total_duration(), 59.5);
    }

    #[tokio::test]
    async fn scan_is_bounded() {
        let fetch = MemoryFetch::new().with_hidden_length();
        let stream = SyntheticStream {
            keyframe_table: false,
            ..SyntheticStream::video(60.0, 2.0)
        };
        fetch.insert("mem://0", stream.build());
        let config = PlayerConfig {
            max_scan_requests: 10,
            ..small_config()
        };
        let source = Source::new(vec!["mem://0".into()], None);
        let index = indexer(&fetch, config).probe(&source).await.unwrap();
        assert_eq!(index.entries.len(), 1);
        assert_eq!(index.total_duration(), 60.0);
    }

    #[tokio::test]
    async fn prefix_is_extended_until_init_is_complete() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", SyntheticStream::video(710.0, 2.0).build());
        let config = PlayerConfig {
            probe_bytes: 64,
            ..small_config()
        };
        let source = Source::new(vec!["mem://0".into()], None);
        let fast = indexer(&fetch, config).probe_first(&source).await.unwrap();
        assert!(fast.init.has_video_config());
        assert_eq!(fast.duration, 710.0);
        assert!(fast.index.complete);
        assert!(fetch.requests().len() > 1);
    }

    #[tokio::test]
    async fn probe_first_then_continue() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", SyntheticStream::video(60.0, 2.0).build());
        fetch.insert("mem://1", SyntheticStream::video(30.0, 2.0).build());
        let source = Source::new(vec!["mem://0".into(), "mem://1".into()], None);
        let indexer = indexer(&fetch, small_config());

        let fast = indexer.probe_first(&source).await.unwrap();
        assert!(!fast.index.complete);
        assert_eq!(fast.index.sources.len(), 1);
        assert_eq!(fast.duration, 120.0);
        assert!(fast.index.covers(59.0));
        assert!(!fast.index.covers(61.0));

        let full = indexer.probe_continue(&source, &fast).await.unwrap();
        assert!(full.complete);
        assert_eq!(full.total_duration(), 90.0);
        assert_eq!(full.entries.len(), 6 + 3);
        assert_eq!(full.entries[6].timestamp, 60.0);
    }

    #[tokio::test]
    async fn network_error_is_not_a_parse_error() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", SyntheticStream::video(10.0, 2.0).build());
        fetch.set_failing("mem://0", true);
        let source = Source::new(vec!["mem://0".into()], None);
        let config = PlayerConfig {
            probe_retries: 2,
            ..small_config()
        };
        let err = indexer(&fetch, config)
            .probe_with_retry(&source)
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::Network(_)));
        assert_eq!(fetch.requests().len(), 3);
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", vec![0x47u8; 2048]);
        let source = Source::new(vec!["mem://0".into()], None);
        let err = indexer(&fetch, small_config())
            .probe_with_retry(&source)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PlayerError::Malformed(DemuxError::InvalidSignature { .. })
        ));
        assert_eq!(fetch.requests().len(), 1);
    }

    #[tokio::test]
    async fn short_file_is_header_too_short() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", b"FLV".to_vec());
        let source = Source::new(vec!["mem://0".into()], None);
        let err = indexer(&fetch, small_config()).probe(&source).await.unwrap_err();
        assert_eq!(
            err,
            PlayerError::Malformed(DemuxError::HeaderTooShort { len: 3 })
        );
    }
}
