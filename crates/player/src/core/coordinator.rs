use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use flv_demux::{Demuxed, FlvDemuxer, MediaSegment, SegmentKind};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;

use crate::config::PlayerConfig;
use crate::core::buffered::{BufferedRange, BufferedRanges};
use crate::core::fetcher::{ByteRangeFetcher, FetchEvent, FetchMessage, RangeFetch};
use crate::core::indexer::{FastStart, FetchWindow, SegmentIndex, SegmentIndexer};
use crate::errors::{PlayerError, SinkError};
use crate::events::{Milestone, PlaybackState, PlayerEvent, ProgressTracker};
use crate::traits::RenderingSink;
use crate::Source;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Seek(f64),
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    /// Bumped on every seek
    pub generation: u64,
    pub position: f64,
    pub buffered: Vec<BufferedRange>,
    pub duration: Option<f64>,
    /// Set once the first frames were ready to play
    pub started: bool,
    pub error: Option<PlayerError>,
}

impl Default for PlaybackStatus {
    fn default() -> Self {
        Self {
            state: PlaybackState::Idle,
            generation: 0,
            position: 0.0,
            buffered: Vec::new(),
            duration: None,
            started: false,
            error: None,
        }
    }
}

enum ProbeOutcome {
    First(Result<FastStart, PlayerError>),
    Full(Result<SegmentIndex, PlayerError>),
}

async fn join_probe(
    task: &mut Option<JoinHandle<ProbeOutcome>>,
) -> Result<ProbeOutcome, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

/// Channels connecting a coordinator to its session handle.
pub struct CoordinatorChannels {
    pub commands: mpsc::Receiver<Command>,
    pub status: watch::Sender<PlaybackStatus>,
    pub index: watch::Sender<Option<Arc<SegmentIndex>>>,
    pub events: broadcast::Sender<PlayerEvent>,
}

/// Drives fetch, demux and append for one session.
///
/// Runs as a single task: commands, probe results, fetched chunks and the
/// housekeeping tick are handled one at a time, so the sink only ever sees
/// one append in flight.
pub struct BufferCoordinator {
    session: String,
    config: PlayerConfig,
    source: Source,
    sink: Arc<dyn RenderingSink>,
    fetcher: ByteRangeFetcher,
    indexer: Arc<SegmentIndexer>,
    commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<PlaybackStatus>,
    index_tx: watch::Sender<Option<Arc<SegmentIndex>>>,
    events: broadcast::Sender<PlayerEvent>,

    state: PlaybackState,
    generation: u64,
    index: Option<Arc<SegmentIndex>>,
    index_error: Option<PlayerError>,
    probe_task: Option<JoinHandle<ProbeOutcome>>,
    duration: Option<f64>,
    /// Window being fetched and its parser
    window: Option<FetchWindow>,
    demuxer: Option<FlvDemuxer>,
    base_time: f64,
    /// Entry the next window starts at
    next_entry: Option<usize>,
    /// Source whose entries are not indexed yet but needed next
    waiting_source: Option<usize>,
    pending_seek: Option<f64>,
    /// Timestamp and end of the last segment appended per kind
    last: HashMap<SegmentKind, (f64, f64)>,
    last_init: Option<Bytes>,
    ranges: BufferedRanges,
    started: bool,
    progress: ProgressTracker,
    error: Option<PlayerError>,
}

impl BufferCoordinator {
    pub fn new(
        session: &str,
        config: PlayerConfig,
        source: Source,
        sink: Arc<dyn RenderingSink>,
        fetch: Arc<dyn RangeFetch>,
        channels: CoordinatorChannels,
    ) -> Self {
        let fetcher = ByteRangeFetcher::new(fetch.clone(), &config);
        let indexer = Arc::new(SegmentIndexer::new(fetch, config.clone(), session));
        let ranges = BufferedRanges::new(config.discontinuity_tolerance);
        Self {
            session: session.to_string(),
            config,
            source,
            sink,
            fetcher,
            indexer,
            commands: channels.commands,
            status_tx: channels.status,
            index_tx: channels.index,
            events: channels.events,
            state: PlaybackState::Idle,
            generation: 0,
            index: None,
            index_error: None,
            probe_task: None,
            duration: None,
            window: None,
            demuxer: None,
            base_time: 0.0,
            next_entry: None,
            waiting_source: None,
            pending_seek: None,
            last: HashMap::new(),
            last_init: None,
            ranges,
            started: false,
            progress: ProgressTracker::new(),
            error: None,
        }
    }

    pub async fn run(mut self) -> Result<(), PlayerError> {
        log::info!(
            "[{}]Start playback of {} source(s)",
            self.session,
            self.source.urls.len()
        );
        self.emit_progress(Milestone::SourceSelected);
        self.set_state(PlaybackState::Probing);
        self.spawn_probe_first();

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Seek(time)) => self.seek(time).await,
                    Some(Command::Stop) | None => break,
                },
                outcome = join_probe(&mut self.probe_task) => {
                    self.probe_task = None;
                    match outcome {
                        Ok(ProbeOutcome::First(result)) => self.on_fast_start(result).await,
                        Ok(ProbeOutcome::Full(result)) => self.on_full_index(result).await,
                        Err(e) => {
                            log::error!("[{}]Probe task failed: {}", self.session, e);
                            self.fail(PlayerError::Stopped);
                        }
                    }
                }
                message = self.fetcher.next(), if self.fetcher.is_active() => {
                    if let Some(message) = message {
                        self.on_fetch(message).await;
                    }
                }
                _ = ticker.tick() => self.housekeeping().await,
            }
            if self.state == PlaybackState::Error {
                break;
            }
        }

        self.fetcher.cancel();
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        log::info!("[{}]Playback session finished", self.session);
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn spawn_probe_first(&mut self) {
        let indexer = self.indexer.clone();
        let source = self.source.clone();
        self.probe_task = Some(tokio::spawn(async move {
            ProbeOutcome::First(indexer.probe_first_with_retry(&source).await)
        }));
    }

    async fn on_fast_start(&mut self, result: Result<FastStart, PlayerError>) {
        let fast = match result {
            Ok(fast) => fast,
            Err(e) => return self.fail(e),
        };
        log::info!(
            "[{}]Fast start: {} entries in first source, duration {:.3}s",
            self.session,
            fast.index.entries.len(),
            fast.duration
        );
        if let Err(e) = self.sink.set_duration(fast.duration).await {
            return self.fail(e.into());
        }
        self.duration = Some(fast.duration);
        let complete = fast.index.complete;
        self.set_index(fast.index.clone());

        if !complete {
            let indexer = self.indexer.clone();
            let source = self.source.clone();
            self.probe_task = Some(tokio::spawn(async move {
                ProbeOutcome::Full(indexer.probe_continue_with_retry(&source, &fast).await)
            }));
        }

        self.set_state(PlaybackState::Buffering);
        match self.pending_seek.take() {
            Some(time) => self.seek(time).await,
            None => self.start_at(0).await,
        }
    }

    async fn on_full_index(&mut self, result: Result<SegmentIndex, PlayerError>) {
        let index = match result {
            Ok(index) => index,
            Err(e) => {
                if self.waiting_source.is_some() || self.pending_seek.is_some() {
                    return self.fail(e);
                }
                log::warn!("[{}]Background probe failed: {}", self.session, e);
                self.index_error = Some(e);
                return;
            }
        };
        let total = index.total_duration();
        log::info!(
            "[{}]Index complete: {} entries, {:.3}s",
            self.session,
            index.entries.len(),
            total
        );
        self.set_index(index);
        if self.duration != Some(total) {
            if let Err(e) = self.sink.set_duration(total).await {
                return self.fail(e.into());
            }
            self.duration = Some(total);
        }

        if let Some(time) = self.pending_seek.take() {
            return self.seek(time).await;
        }
        if let Some(source) = self.waiting_source.take() {
            self.source_exhausted(source - 1).await;
        }
        self.pump().await;
    }

    async fn seek(&mut self, time: f64) {
        let time = if time.is_finite() { time.max(0.0) } else { 0.0 };
        let Some(index) = self.index.clone() else {
            log::info!("[{}]Seek to {:.3}s queued until probed", self.session, time);
            self.pending_seek = Some(time);
            return;
        };
        if self.state == PlaybackState::Error {
            return;
        }
        if !index.covers(time) && self.probe_task.is_none() {
            // the rest of the index will never arrive
            if let Some(e) = self.index_error.clone() {
                log::warn!(
                    "[{}]Seek to {:.3}s needs sources that failed to index",
                    self.session,
                    time
                );
                return self.fail(e);
            }
        }

        self.generation += 1;
        self.fetcher.cancel();
        self.window = None;
        self.demuxer = None;
        self.next_entry = None;
        self.waiting_source = None;
        self.set_state(PlaybackState::Seeking);
        if let Err(e) = self.sink.remove(0.0, f64::INFINITY).await {
            return self.fail(e.into());
        }
        self.ranges.clear();
        self.last.clear();

        if !index.covers(time) {
            log::info!(
                "[{}]Seek to {:.3}s queued until the index covers it",
                self.session,
                time
            );
            self.pending_seek = Some(time);
            self.publish_status();
            return;
        }
        let Some(entry) = index.entry_at_or_before(time).copied() else {
            return self.finish_stream().await;
        };
        log::info!(
            "[{}]Seek to {:.3}s from entry {} at {:.3}s (generation {})",
            self.session,
            time,
            entry.index,
            entry.timestamp,
            self.generation
        );
        self.set_state(PlaybackState::Buffering);
        self.start_at(entry.index).await;
    }

    async fn start_at(&mut self, entry: usize) {
        let Some(index) = self.index.clone() else {
            return;
        };
        let Some(window) = index.window(entry, self.config.fetch_window) else {
            return self.finish_stream().await;
        };
        let layout = &index.sources[window.source];
        let timestamp = index.entries[window.first].timestamp;
        if !self.append_init(layout.init.payload.clone(), timestamp).await {
            return;
        }

        log::log!(
            self.config.verbose_level(),
            "[{}]Fetch entry {} of source {}, bytes {:?} (generation {})",
            self.session,
            window.first,
            window.source,
            window.range,
            self.generation
        );
        self.demuxer = Some(FlvDemuxer::resume(&layout.init, window.range.start));
        self.base_time = layout.base_time;
        self.fetcher
            .fetch_range(&layout.url, window.range, self.generation);
        self.window = Some(window);
        self.emit_progress(Milestone::FetchStarted);
    }

    async fn on_fetch(&mut self, message: FetchMessage) {
        if message.generation != self.generation {
            log::debug!(
                "[{}]Drop message of generation {}",
                self.session,
                message.generation
            );
            return;
        }
        match message.event {
            FetchEvent::Chunk(chunk) => {
                let Some(demuxer) = self.demuxer.as_mut() else {
                    return;
                };
                match demuxer.push(&chunk) {
                    Ok(units) => self.append_units(units).await,
                    Err(e) => self.fail(e.into()),
                }
            }
            FetchEvent::Done => {
                let result = match self.demuxer.as_mut() {
                    Some(demuxer) => demuxer.finish(),
                    None => Ok(Vec::new()),
                };
                match result {
                    Ok(units) => {
                        self.append_units(units).await;
                        if self.state != PlaybackState::Error {
                            self.window_done().await;
                        }
                    }
                    Err(e) => self.fail(e.into()),
                }
            }
            FetchEvent::EmptyRange => self.on_empty_range().await,
            FetchEvent::Failed(err) => {
                log::error!("[{}]Fetch failed: {}", self.session, err);
                self.fail(PlayerError::Stalled { err });
            }
        }
    }

    async fn append_units(&mut self, units: Vec<Demuxed>) {
        for unit in units {
            if self.state == PlaybackState::Error {
                return;
            }
            let Demuxed::Segment(segment) = unit else {
                continue;
            };
            if segment.kind == SegmentKind::Init {
                let timestamp = segment.timestamp + self.base_time;
                if !self.append_init(segment.payload, timestamp).await {
                    return;
                }
                continue;
            }
            let segment = segment.rebased(self.base_time);
            self.accept(segment).await;
        }
        self.update_state();
        self.publish_status();
    }

    /// Append an init unit unless it equals the last one appended.
    async fn append_init(&mut self, payload: Bytes, timestamp: f64) -> bool {
        if self.last_init.as_ref() == Some(&payload) {
            return true;
        }
        let segment = MediaSegment {
            kind: SegmentKind::Init,
            timestamp,
            duration: 0.0,
            keyframe: false,
            payload: payload.clone(),
        };
        match self.append_with_quota(segment).await {
            Ok(()) => {
                self.last_init = Some(payload);
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    async fn accept(&mut self, segment: MediaSegment) {
        let kind = segment.kind;
        if let Some(&(last_timestamp, last_end)) = self.last.get(&kind) {
            if segment.timestamp <= last_timestamp {
                log::log!(
                    self.config.verbose_level(),
                    "[{}]Drop duplicate {} at {:.3}s",
                    self.session,
                    kind.as_str(),
                    segment.timestamp
                );
                return;
            }
            if segment.timestamp - last_end > self.config.discontinuity_tolerance {
                log::warn!(
                    "[{}]Discontinuity in {}: expected {:.3}s, got {:.3}s",
                    self.session,
                    kind.as_str(),
                    last_end,
                    segment.timestamp
                );
                let _ = self.events.send(PlayerEvent::Discontinuity {
                    session: self.session.clone(),
                    kind: kind.as_str(),
                    expected: last_end,
                    actual: segment.timestamp,
                });
                if let Err(e) = self.sink.flush().await {
                    return self.fail(e.into());
                }
            }
        }

        let (timestamp, end) = (segment.timestamp, segment.end());
        log::log!(
            self.config.verbose_level(),
            "[{}]Append {} at {:.3}s ({} bytes)",
            self.session,
            kind.as_str(),
            timestamp,
            segment.payload.len()
        );
        if let Err(e) = self.append_with_quota(segment).await {
            return self.fail(e);
        }
        self.last.insert(kind, (timestamp, end));
        self.ranges.add(timestamp, end);
    }

    async fn append_with_quota(&mut self, segment: MediaSegment) -> Result<(), PlayerError> {
        match self.sink.append(segment.clone()).await {
            Err(SinkError::QuotaExceeded) => {
                log::warn!("[{}]Sink quota exceeded, evicting", self.session);
                self.evict(true).await?;
                self.sink.append(segment).await.map_err(PlayerError::from)
            }
            other => other.map_err(PlayerError::from),
        }
    }

    /// Remove media behind the playback position. `force` evicts everything
    /// already played instead of keeping `max_buffer_behind`.
    async fn evict(&mut self, force: bool) -> Result<(), PlayerError> {
        let position = self.sink.position();
        let cutoff = if force {
            position
        } else {
            position - self.config.max_buffer_behind
        };
        match self.ranges.start() {
            Some(start) if start < cutoff => {}
            _ => return Ok(()),
        }
        log::debug!("[{}]Evict media before {:.3}s", self.session, cutoff);
        self.sink.remove(0.0, cutoff).await?;
        self.ranges.remove(0.0, cutoff);
        Ok(())
    }

    async fn window_done(&mut self) {
        let Some(window) = self.window.take() else {
            return;
        };
        self.demuxer = None;
        match window.next {
            Some(next) => self.next_entry = Some(next),
            None => self.source_exhausted(window.source).await,
        }
        self.pump().await;
    }

    async fn on_empty_range(&mut self) {
        let Some(window) = self.window.take() else {
            return;
        };
        self.demuxer = None;
        log::info!(
            "[{}]Empty range at byte {} of source {}",
            self.session,
            window.range.start,
            window.source
        );
        self.source_exhausted(window.source).await;
        self.pump().await;
    }

    /// Continue after the last byte of `source`.
    async fn source_exhausted(&mut self, source: usize) {
        if source + 1 >= self.source.urls.len() {
            return self.finish_stream().await;
        }
        if let Some(next) = self
            .index
            .as_ref()
            .and_then(|index| index.first_entry_of(source + 1))
        {
            self.next_entry = Some(next);
            return;
        }
        if let Some(e) = self.index_error.clone() {
            return self.fail(e);
        }
        log::info!(
            "[{}]Waiting for source {} to be probed",
            self.session,
            source + 1
        );
        self.waiting_source = Some(source + 1);
    }

    /// Start the next window unless enough is buffered ahead.
    async fn pump(&mut self) {
        if self.window.is_some() || self.state.is_terminal() {
            return;
        }
        let Some(next) = self.next_entry else {
            return;
        };
        let ahead = self.ranges.ahead_of(self.sink.position());
        if ahead >= self.config.max_buffer_ahead {
            return;
        }
        self.next_entry = None;
        self.start_at(next).await;
    }

    async fn finish_stream(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.next_entry = None;
        if let Err(e) = self.sink.end_of_stream().await {
            return self.fail(e.into());
        }
        self.mark_started();
        self.set_state(PlaybackState::Ended);
    }

    fn update_state(&mut self) {
        let ahead = self.ranges.ahead_of(self.sink.position());
        match self.state {
            PlaybackState::Buffering if ahead >= self.config.min_buffer_ahead => {
                self.mark_started();
                self.set_state(PlaybackState::Playing);
            }
            PlaybackState::Playing
                if ahead <= 0.0 && (self.window.is_some() || self.next_entry.is_some()) =>
            {
                log::info!("[{}]Buffer ran dry", self.session);
                self.set_state(PlaybackState::Buffering);
            }
            _ => {}
        }
    }

    async fn housekeeping(&mut self) {
        if !matches!(
            self.state,
            PlaybackState::Buffering | PlaybackState::Playing
        ) {
            self.publish_status();
            return;
        }
        if let Err(e) = self.evict(false).await {
            return self.fail(e);
        }
        self.update_state();
        self.pump().await;
        self.publish_status();
    }

    fn mark_started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        log::info!("[{}]Playback started", self.session);
        self.emit_progress(Milestone::FirstFrameReady);
        let _ = self.events.send(PlayerEvent::Started {
            session: self.session.clone(),
        });
    }

    fn emit_progress(&mut self, milestone: Milestone) {
        if let Some(percent) = self.progress.advance(milestone) {
            let _ = self.events.send(PlayerEvent::Progress {
                session: self.session.clone(),
                percent,
            });
        }
    }

    fn set_index(&mut self, index: SegmentIndex) {
        let index = Arc::new(index);
        self.index = Some(index.clone());
        self.index_tx.send_replace(Some(index));
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state == state {
            return;
        }
        log::info!(
            "[{}]State {} -> {}",
            self.session,
            self.state.as_str(),
            state.as_str()
        );
        let _ = self.events.send(PlayerEvent::StateChanged {
            session: self.session.clone(),
            from: self.state,
            to: state,
        });
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(PlaybackStatus {
            state: self.state,
            generation: self.generation,
            position: self.sink.position(),
            buffered: self.ranges.ranges().to_vec(),
            duration: self.duration,
            started: self.started,
            error: self.error.clone(),
        });
    }

    fn fail(&mut self, err: PlayerError) {
        if self.state == PlaybackState::Error {
            return;
        }
        log::error!("[{}]Playback failed: {}", self.session, err);
        self.fetcher.cancel();
        self.window = None;
        self.demuxer = None;
        self.error = Some(err.clone());
        if let Some(percent) = self.progress.complete() {
            let _ = self.events.send(PlayerEvent::Progress {
                session: self.session.clone(),
                percent,
            });
        }
        let _ = self.events.send(PlayerEvent::Error {
            session: self.session.clone(),
            error: err,
        });
        self.set_state(PlaybackState::Error);
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use flv_demux::amf::Metadata;
    use flv_demux::writer::{self, SyntheticStream};
    use flv_demux::{DemuxError, TagHeader, TagType};

    use super::*;
    use crate::core::fetcher::MemoryFetch;
    use crate::errors::NetworkError;
    use crate::sink::{MemorySink, SinkOp};
    use crate::{BindOptions, Player, Session};

    fn config() -> PlayerConfig {
        PlayerConfig {
            probe_bytes: 512,
            probe_retry_delay_ms: 1,
            tick_interval_ms: 10,
            ..PlayerConfig::default()
        }
    }

    async fn within<T>(fut: impl Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(10), fut)
            .await
            .expect("timed out")
    }

    fn bind(player: &Player, urls: &[&str], duration: Option<f64>) -> (Session, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let source = Source::new(urls.iter().map(|u| u.to_string()).collect(), duration);
        let session = player
            .bind_video(BindOptions {
                sink: sink.clone(),
                source,
            })
            .unwrap();
        (session, sink)
    }

    fn video_appends(ops: &[SinkOp]) -> Vec<f64> {
        ops.iter()
            .filter_map(|op| match op {
                SinkOp::Append {
                    kind: SegmentKind::Video,
                    timestamp,
                    ..
                } => Some(*timestamp),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn seek_into_the_middle_of_two_sources() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", SyntheticStream::video(710.0, 2.0).build());
        fetch.insert("mem://1", SyntheticStream::video(710.0, 2.0).build());
        let player = Player::new(config(), Arc::new(fetch.clone()));
        let (session, sink) = bind(&player, &["mem://0", "mem://1"], Some(1420.0));

        within(session.wait_started()).await.unwrap();
        let index = within(session.wait_index_complete()).await.unwrap();
        assert_eq!(index.entries.len(), 142);
        assert_eq!(index.total_duration(), 1420.0);

        sink.set_position(700.0);
        session.seek(700.0).await.unwrap();
        let status = within(session.wait_for(|s| {
            s.generation == 1
                && s.state == PlaybackState::Playing
                && s.buffered.last().is_some_and(|r| r.end >= 760.0)
        }))
        .await
        .unwrap();

        // one contiguous range crossing into the second source
        assert_eq!(status.buffered.len(), 1);
        assert_eq!(status.buffered[0].start, 700.0);

        let ops = sink.ops();
        let reset = ops
            .iter()
            .rposition(|op| matches!(op, SinkOp::Remove { end, .. } if end.is_infinite()))
            .unwrap();
        let after_seek = video_appends(&ops[reset..]);
        assert!((after_seek[0] - 700.0).abs() < 0.1);
        assert!(after_seek.windows(2).all(|w| w[0] < w[1]));
        assert!(after_seek.contains(&710.0));
        assert!(!ops.contains(&SinkOp::Flush));
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn second_bind_returns_the_running_session() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", SyntheticStream::video(60.0, 2.0).build());
        let player = Player::new(config(), Arc::new(fetch));

        let (first, _) = bind(&player, &["mem://0"], None);
        let (second, _) = bind(&player, &["mem://0"], None);
        assert_eq!(first.id(), second.id());
        within(first.wait_started()).await.unwrap();

        within(second.stop()).await.unwrap();
        assert!(!first.is_alive());
        assert_eq!(first.seek(1.0).await, Err(PlayerError::Stopped));

        let (third, _) = bind(&player, &["mem://0"], None);
        assert_ne!(third.id(), first.id());
        third.stop().await.unwrap();
    }

    #[tokio::test]
    async fn seek_before_probe_is_applied_once_indexed() {
        let fetch = MemoryFetch::new()
            .with_chunk_size(256)
            .with_delay(Duration::from_millis(5));
        fetch.insert("mem://0", SyntheticStream::video(60.0, 2.0).build());
        let player = Player::new(config(), Arc::new(fetch));
        let (session, sink) = bind(&player, &["mem://0"], None);

        sink.set_position(30.0);
        session.seek(30.0).await.unwrap();
        let status = within(session.wait_for(|s| s.started)).await.unwrap();
        assert_eq!(status.generation, 1);

        let ops = sink.ops();
        let reset = ops
            .iter()
            .rposition(|op| matches!(op, SinkOp::Remove { end, .. } if end.is_infinite()))
            .unwrap();
        assert_eq!(video_appends(&ops[reset..])[0], 30.0);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn duplicates_are_dropped_and_gaps_flushed() {
        let mut bytes = writer::header(false, true);
        bytes.extend(writer::metadata_tag(&Metadata {
            duration: Some(30.0),
            framerate: Some(2.0),
            ..Metadata::default()
        }));
        bytes.extend(writer::avc_sequence_header(0));
        let mut times: Vec<u32> = (0..20).map(|f| f * 500).collect();
        // repeated tail of the first run, then a jump to 20s
        times.extend([9000, 9500]);
        times.extend((40..60).map(|f| f * 500));
        for millis in times {
            bytes.extend(writer::avc_frame(millis, millis % 5000 == 0, &[0; 8]));
        }

        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", bytes);
        let player = Player::new(config(), Arc::new(fetch));
        let mut events = player.subscribe();
        let (session, sink) = bind(&player, &["mem://0"], None);

        within(session.wait_for(|s| s.state == PlaybackState::Ended))
            .await
            .unwrap();
        let ops = sink.ops();
        assert_eq!(video_appends(&ops).len(), 40);
        assert_eq!(ops.iter().filter(|op| **op == SinkOp::Flush).count(), 1);
        assert_eq!(
            sink.buffered(),
            vec![
                BufferedRange {
                    start: 0.0,
                    end: 10.0
                },
                BufferedRange {
                    start: 20.0,
                    end: 30.0
                }
            ]
        );
        assert!(sink.is_ended());

        let mut gaps = Vec::new();
        let mut started = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                PlayerEvent::Discontinuity {
                    expected, actual, ..
                } => gaps.push((expected, actual)),
                PlayerEvent::Started { .. } => started += 1,
                _ => {}
            }
        }
        assert_eq!(gaps, vec![(10.0, 20.0)]);
        assert_eq!(started, 1);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn network_error_while_playing_stalls() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", SyntheticStream::video(60.0, 2.0).build());
        let config = PlayerConfig {
            fetch_window: 1,
            max_buffer_ahead: 10.0,
            ..config()
        };
        let player = Player::new(config, Arc::new(fetch.clone()));
        let (session, sink) = bind(&player, &["mem://0"], None);
        within(session.wait_started()).await.unwrap();

        fetch.set_failing("mem://0", true);
        sink.set_position(15.0);
        let result = within(session.join()).await;
        assert!(matches!(result, Err(PlayerError::Stalled { .. })));
        assert_eq!(session.status().state, PlaybackState::Error);
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn corrupt_tag_ends_in_error() {
        let mut bytes = SyntheticStream::video(60.0, 2.0).build();
        let mut offset = 13usize;
        loop {
            let header = TagHeader::parse(&bytes[offset..], offset as u64).unwrap();
            if header.tag_type == TagType::Video && header.timestamp == 2_000 {
                break;
            }
            offset += header.total_size();
        }
        bytes[offset] = 0x42;

        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", bytes);
        let player = Player::new(config(), Arc::new(fetch));
        let mut events = player.subscribe();
        let (session, _sink) = bind(&player, &["mem://0"], None);

        let result = within(session.join()).await;
        assert!(matches!(
            result,
            Err(PlayerError::Malformed(DemuxError::InvalidTag { tag_type: 0x42, .. }))
        ));
        assert_eq!(session.status().state, PlaybackState::Error);
        assert!(matches!(
            session.wait_started().await,
            Err(PlayerError::Malformed(_))
        ));

        // the loading bar still closes
        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PlayerEvent::Progress { percent, .. } = event {
                progress.push(percent);
            }
        }
        assert_eq!(progress.last(), Some(&100));
        assert_eq!(progress.iter().filter(|p| **p == 100).count(), 1);
    }

    #[tokio::test]
    async fn empty_range_at_the_end_finishes_playback() {
        let full = SyntheticStream::video(60.0, 2.0).build();
        let mut demuxer = FlvDemuxer::new();
        demuxer.push(&full).unwrap();
        let last_keyframe = *demuxer
            .metadata()
            .unwrap()
            .keyframes
            .as_ref()
            .unwrap()
            .filepositions
            .last()
            .unwrap();
        // cut right before the last keyframe the table still points at
        let bytes = full[..last_keyframe as usize].to_vec();
        let len = bytes.len() as u64;

        let fetch = MemoryFetch::new().with_hidden_length();
        fetch.insert("mem://0", bytes);
        let config = PlayerConfig {
            fetch_window: 1,
            max_buffer_ahead: 120.0,
            ..config()
        };
        let player = Player::new(config, Arc::new(fetch.clone()));
        let (session, sink) = bind(&player, &["mem://0"], None);

        within(session.wait_for(|s| s.state == PlaybackState::Ended))
            .await
            .unwrap();
        assert!(sink.is_ended());
        assert_eq!(sink.ops().last(), Some(&SinkOp::EndOfStream));
        let (_, range) = fetch.requests().last().cloned().unwrap();
        assert_eq!(range.start, len);
        assert_eq!(
            video_appends(&sink.ops()).last().copied(),
            Some(49.5)
        );
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn seek_into_a_source_that_failed_to_index_is_an_error() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", SyntheticStream::video(300.0, 2.0).build());
        fetch.insert("mem://1", SyntheticStream::video(300.0, 2.0).build());
        fetch.set_failing("mem://1", true);
        let config = PlayerConfig {
            probe_retries: 0,
            ..config()
        };
        let player = Player::new(config, Arc::new(fetch.clone()));
        let (session, sink) = bind(&player, &["mem://0", "mem://1"], Some(600.0));
        within(session.wait_started()).await.unwrap();

        // let indexing of the second source fail first
        within(async {
            while !fetch.requests().iter().any(|(url, _)| url == "mem://1") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.status().error.is_none());

        sink.set_position(400.0);
        session.seek(400.0).await.unwrap();
        let result = within(session.join()).await;
        assert!(matches!(
            result,
            Err(PlayerError::Network(NetworkError::Unavailable { .. }))
        ));
        assert_eq!(session.status().state, PlaybackState::Error);
    }

    #[tokio::test]
    async fn seeks_during_a_fetch_only_append_the_last_target() {
        let fetch = MemoryFetch::new()
            .with_chunk_size(64)
            .with_delay(Duration::from_millis(5));
        fetch.insert("mem://0", SyntheticStream::video(120.0, 2.0).build());
        let player = Player::new(config(), Arc::new(fetch));
        let (session, sink) = bind(&player, &["mem://0"], None);
        within(session.wait_started()).await.unwrap();

        for target in [80.0, 20.0, 60.0] {
            sink.set_position(target);
            session.seek(target).await.unwrap();
        }
        let status = within(session.wait_for(|s| {
            s.generation == 3
                && s.state == PlaybackState::Playing
                && s.buffered.last().is_some_and(|r| r.end >= 65.0)
        }))
        .await
        .unwrap();
        assert_eq!(status.buffered[0].start, 60.0);

        let ops = sink.ops();
        let reset = ops
            .iter()
            .rposition(|op| matches!(op, SinkOp::Remove { end, .. } if end.is_infinite()))
            .unwrap();
        let after_seek = video_appends(&ops[reset..]);
        assert_eq!(after_seek[0], 60.0);
        assert!(after_seek.windows(2).all(|w| w[0] < w[1]));

        let buffered = sink.buffered();
        assert_eq!(buffered[0].start, 60.0);
        assert!(buffered.windows(2).all(|w| w[0].end < w[1].start));
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn fetching_pauses_at_max_buffer_ahead() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", SyntheticStream::video(60.0, 2.0).build());
        let config = PlayerConfig {
            fetch_window: 1,
            max_buffer_ahead: 10.0,
            ..config()
        };
        let player = Player::new(config, Arc::new(fetch.clone()));
        let (session, sink) = bind(&player, &["mem://0"], None);

        within(session.wait_for(|s| s.buffered.last().is_some_and(|r| r.end >= 10.0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let paused = fetch.requests().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetch.requests().len(), paused);
        assert!(sink.buffered().last().unwrap().end <= 12.0);

        sink.set_position(10.0);
        within(session.wait_for(|s| s.buffered.last().is_some_and(|r| r.end >= 20.0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fetch.requests().len() > paused);
        assert!(sink.buffered().last().unwrap().end <= 22.0);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn full_sink_evicts_played_media_and_retries() {
        let fetch = MemoryFetch::new();
        fetch.insert("mem://0", SyntheticStream::video(60.0, 2.0).build());
        let config = PlayerConfig {
            fetch_window: 1,
            max_buffer_ahead: 10.0,
            max_buffer_behind: 30.0,
            ..config()
        };
        let player = Player::new(config, Arc::new(fetch));
        let sink = Arc::new(MemorySink::new().with_capacity(20.0));
        let session = player
            .bind_video(BindOptions {
                sink: sink.clone(),
                source: Source::single("mem://0"),
            })
            .unwrap();

        // play through, never past what is buffered
        within(async {
            loop {
                let status = session.status();
                assert_ne!(status.state, PlaybackState::Error, "{:?}", status.error);
                if status.state == PlaybackState::Ended {
                    break;
                }
                if let Some(end) = sink.buffered().last().map(|r| r.end) {
                    let position = sink.position();
                    sink.set_position((position + 1.0).min(end));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        let ops = sink.ops();
        assert_eq!(video_appends(&ops).len(), 120);
        assert!(ops
            .iter()
            .any(|op| matches!(op, SinkOp::Remove { end, .. } if end.is_finite() && *end > 0.0)));
        assert!(sink.is_ended());
        session.stop().await.unwrap();
    }
}
