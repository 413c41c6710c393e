pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod platforms;
pub mod sink;
pub mod traits;
pub mod utils;

use std::sync::{Arc, Mutex};

use flv_demux::{Demuxed, FlvDemuxer, MediaSegment};
use reqwest::header::HeaderMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::PlayerConfig;
use crate::core::coordinator::{BufferCoordinator, Command, CoordinatorChannels};
use crate::core::fetcher::{read_range, ByteRange, HttpFetch, RangeFetch};
use crate::core::indexer::{FastStart, SegmentIndex, SegmentIndexer};
use crate::errors::{FetchError, PlayerError};
use crate::events::{PlaybackState, PlayerEvent};
use crate::traits::RenderingSink;

pub use crate::core::coordinator::PlaybackStatus;

/// Ordered list of FLV files played as one continuous video.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub urls: Vec<String>,
    /// Total duration in seconds if the resolver knows it
    pub duration: Option<f64>,
}

impl Source {
    pub fn new(urls: Vec<String>, duration: Option<f64>) -> Self {
        Self { urls, duration }
    }

    pub fn single(url: &str) -> Self {
        Self::new(vec![url.to_string()], None)
    }
}

pub struct BindOptions {
    pub sink: Arc<dyn RenderingSink>,
    pub source: Source,
}

pub struct Player {
    config: PlayerConfig,
    fetch: Arc<dyn RangeFetch>,
    events: broadcast::Sender<PlayerEvent>,
    active: Mutex<Option<Session>>,
}

impl Player {
    pub fn new(config: PlayerConfig, fetch: Arc<dyn RangeFetch>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            fetch,
            events,
            active: Mutex::new(None),
        }
    }

    /// Player fetching over HTTP, sending `headers` with every request.
    pub fn with_http(config: PlayerConfig, headers: HeaderMap) -> Result<Self, PlayerError> {
        let fetch = HttpFetch::new(&config, headers)?;
        Ok(Self::new(config, Arc::new(fetch)))
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Events of every session bound to this player.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Start a playback session. While one is still running, that session is
    /// returned instead and `options` are ignored.
    pub fn bind_video(&self, options: BindOptions) -> Result<Session, PlayerError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = active.as_ref().filter(|s| s.is_alive()) {
            log::warn!(
                "[{}]Session already bound, ignoring new bind request",
                session.id()
            );
            return Ok(session.clone());
        }
        if options.source.urls.is_empty() {
            return Err(PlayerError::NoSources);
        }

        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let (commands_tx, commands_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(PlaybackStatus::default());
        let (index_tx, index_rx) = watch::channel(None);
        let coordinator = BufferCoordinator::new(
            &id,
            self.config.clone(),
            options.source,
            options.sink,
            self.fetch.clone(),
            CoordinatorChannels {
                commands: commands_rx,
                status: status_tx,
                index: index_tx,
                events: self.events.clone(),
            },
        );
        let task = tokio::spawn(coordinator.run());

        let session = Session {
            id,
            commands: commands_tx,
            status: status_rx,
            index: index_rx,
            events: self.events.clone(),
            task: Arc::new(Mutex::new(Some(task))),
        };
        *active = Some(session.clone());
        Ok(session)
    }

    pub fn session(&self) -> Option<Session> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|s| s.is_alive())
    }

    /// Index and segment access without a sink, mostly for inspection tools.
    pub fn streams(&self, source: Source) -> Streams {
        Streams::new(self.fetch.clone(), self.config.clone(), source)
    }
}

/// Handle to a running playback session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    id: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<PlaybackStatus>,
    index: watch::Receiver<Option<Arc<SegmentIndex>>>,
    events: broadcast::Sender<PlayerEvent>,
    task: Arc<Mutex<Option<JoinHandle<Result<(), PlayerError>>>>>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the session still accepts commands.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Move playback to `time` seconds. The sink's position is expected to
    /// follow, as it does when the user drags the seek bar.
    pub async fn seek(&self, time: f64) -> Result<(), PlayerError> {
        self.commands
            .send(Command::Seek(time))
            .await
            .map_err(|_| PlayerError::Stopped)
    }

    pub async fn stop(&self) -> Result<(), PlayerError> {
        let _ = self.commands.send(Command::Stop).await;
        self.join().await
    }

    /// Wait for the session task to exit and return its outcome.
    pub async fn join(&self) -> Result<(), PlayerError> {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        match task {
            Some(task) => task.await.unwrap_or(Err(PlayerError::Stopped)),
            None => self.status().error.map_or(Ok(()), Err),
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    pub fn index(&self) -> Option<Arc<SegmentIndex>> {
        self.index.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Wait until `pred` holds for the published status.
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(&PlaybackStatus) -> bool,
    ) -> Result<PlaybackStatus, PlayerError> {
        let mut status = self.status.clone();
        let result = status.wait_for(|s| pred(s)).await.map(|s| s.clone());
        result.map_err(|_| PlayerError::Stopped)
    }

    /// Resolves once the first frames are ready, or with the error that
    /// ended the session before that.
    pub async fn wait_started(&self) -> Result<(), PlayerError> {
        let status = self
            .wait_for(|s| s.started || s.state == PlaybackState::Error)
            .await?;
        match status.error {
            Some(e) if !status.started => Err(e),
            _ => Ok(()),
        }
    }

    /// Wait for the index to cover every source.
    pub async fn wait_index_complete(&self) -> Result<Arc<SegmentIndex>, PlayerError> {
        let mut index = self.index.clone();
        let result = index
            .wait_for(|i| i.as_ref().is_some_and(|i| i.complete))
            .await
            .map(|i| i.clone());
        result
            .ok()
            .flatten()
            .ok_or(PlayerError::Stopped)
    }
}

/// Probing and segment reads over a source list.
pub struct Streams {
    fetch: Arc<dyn RangeFetch>,
    indexer: SegmentIndexer,
    source: Source,
    index: Option<SegmentIndex>,
}

impl Streams {
    pub fn new(fetch: Arc<dyn RangeFetch>, config: PlayerConfig, source: Source) -> Self {
        let indexer = SegmentIndexer::new(fetch.clone(), config, "streams");
        Self {
            fetch,
            indexer,
            source,
            index: None,
        }
    }

    pub fn index(&self) -> Option<&SegmentIndex> {
        self.index.as_ref()
    }

    pub async fn probe(&mut self) -> Result<&SegmentIndex, PlayerError> {
        let index = self.indexer.probe_with_retry(&self.source).await?;
        Ok(self.index.insert(index))
    }

    pub async fn probe_first(&mut self) -> Result<FastStart, PlayerError> {
        let fast = self.indexer.probe_first_with_retry(&self.source).await?;
        self.index = Some(fast.index.clone());
        Ok(fast)
    }

    /// Demuxed media of index entries `[from, to)`, on the global timeline.
    /// Probes every source first if nothing was probed yet.
    pub async fn fetch_segments_by_index(
        &mut self,
        from: usize,
        to: usize,
    ) -> Result<Vec<MediaSegment>, PlayerError> {
        if self.index.is_none() {
            self.probe().await?;
        }
        let Some(index) = self.index.as_ref() else {
            return Err(PlayerError::NoSources);
        };
        let to = to.min(index.entries.len());
        let mut segments = Vec::new();
        let mut current = from;

        while current < to {
            let entry = index.entries[current];
            let layout = &index.sources[entry.source];
            let end = current
                + index.entries[current..to]
                    .iter()
                    .take_while(|e| e.source == entry.source)
                    .count();
            let range = match index.entries.get(end).filter(|e| e.source == entry.source) {
                Some(next) => ByteRange::new(entry.local_offset, Some(next.local_offset - 1)),
                None => ByteRange::from_start(entry.local_offset),
            };

            let bytes = match read_range(self.fetch.as_ref(), &layout.url, range).await {
                Ok((bytes, _)) => bytes,
                Err(FetchError::EmptyRange) => {
                    current = end;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let mut demuxer = FlvDemuxer::resume(&layout.init, range.start);
            let mut units = demuxer.push(&bytes)?;
            units.extend(demuxer.finish()?);
            segments.extend(
                units
                    .into_iter()
                    .filter_map(Demuxed::into_segment)
                    .map(|s| s.rebased(layout.base_time)),
            );
            current = end;
        }
        Ok(segments)
    }
}
