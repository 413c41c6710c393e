use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, RANGE, USER_AGENT,
};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::PlayerConfig;
use crate::errors::{FetchError, NetworkError, PlayerError};
use crate::utils::user_agent_generator::UserAgentGenerator;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, NetworkError>> + Send>>;

/// Byte range with an inclusive end, `None` meaning "to the end of the resource".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    /// `len` bytes from `start`
    pub fn sized(start: u64, len: u64) -> Self {
        Self {
            start,
            end: Some(start + len.max(1) - 1),
        }
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }

    pub fn to_header_value(&self) -> String {
        if let Some(end) = self.end {
            format!("bytes={}-{}", self.start, end)
        } else {
            format!("bytes={}-", self.start)
        }
    }
}

pub struct RangeResponse {
    /// Length of the whole resource when the server reports it
    pub total_len: Option<u64>,
    pub body: ByteStream,
}

/// Transport able to open a byte range of a resource.
#[async_trait]
pub trait RangeFetch: Send + Sync {
    async fn open(&self, url: &str, range: ByteRange) -> Result<RangeResponse, FetchError>;
}

/// Parse the total from `Content-Range: bytes 0-99/1000`
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

/// Drop the first `skip` bytes and stop after `limit` bytes.
fn trim_body(body: ByteStream, skip: u64, limit: Option<u64>) -> ByteStream {
    Box::pin(stream::unfold(
        (body, skip, limit),
        |(mut body, mut skip, mut limit)| async move {
            loop {
                if limit == Some(0) {
                    return None;
                }
                let mut chunk = match body.next().await? {
                    Ok(chunk) => chunk,
                    Err(e) => return Some((Err(e), (body, skip, Some(0)))),
                };
                if skip > 0 {
                    if chunk.len() as u64 <= skip {
                        skip -= chunk.len() as u64;
                        continue;
                    }
                    chunk = chunk.slice(skip as usize..);
                    skip = 0;
                }
                if let Some(left) = limit {
                    if chunk.len() as u64 > left {
                        chunk.truncate(left as usize);
                    }
                    limit = Some(left - chunk.len() as u64);
                }
                return Some((Ok(chunk), (body, skip, limit)));
            }
        },
    ))
}

#[derive(Clone)]
pub struct HttpFetch {
    client: reqwest::Client,
    headers: HeaderMap,
}

impl HttpFetch {
    /// `headers` are sent with every request; a browser user agent is added
    /// when none is given.
    pub fn new(config: &PlayerConfig, mut headers: HeaderMap) -> Result<Self, PlayerError> {
        if !headers.contains_key(USER_AGENT) {
            let user_agent = UserAgentGenerator::new().generate();
            if let Ok(value) = HeaderValue::from_str(&user_agent) {
                headers.insert(USER_AGENT, value);
            }
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self { client, headers })
    }
}

#[async_trait]
impl RangeFetch for HttpFetch {
    async fn open(&self, url: &str, range: ByteRange) -> Result<RangeResponse, FetchError> {
        let mut req = self.client.get(url).headers(self.headers.clone());
        if !range.is_full() {
            req = req.header(RANGE, range.to_header_value());
        }
        let resp = req.send().await.map_err(NetworkError::from)?;
        let status = resp.status();
        let header = |name: HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        match status {
            StatusCode::NO_CONTENT | StatusCode::RANGE_NOT_SATISFIABLE => {
                Err(FetchError::EmptyRange)
            }
            StatusCode::PARTIAL_CONTENT => {
                let total_len = header(CONTENT_RANGE).and_then(|v| content_range_total(&v));
                let body = resp.bytes_stream().map(|r| r.map_err(NetworkError::from));
                Ok(RangeResponse {
                    total_len,
                    body: Box::pin(body),
                })
            }
            StatusCode::OK => {
                // the server ignored the range header
                let total_len = header(CONTENT_LENGTH).and_then(|v| v.parse().ok());
                if total_len.is_some_and(|len| range.start >= len) {
                    return Err(FetchError::EmptyRange);
                }
                let body: ByteStream =
                    Box::pin(resp.bytes_stream().map(|r| r.map_err(NetworkError::from)));
                let body = if range.is_full() {
                    body
                } else {
                    log::debug!("Range ignored by {}, trimming full body", url);
                    trim_body(body, range.start, range.len())
                };
                Ok(RangeResponse { total_len, body })
            }
            other => Err(FetchError::Network(NetworkError::Status {
                status: other.as_u16(),
            })),
        }
    }
}

/// Open `range` and collect the whole body.
pub async fn read_range(
    fetch: &dyn RangeFetch,
    url: &str,
    range: ByteRange,
) -> Result<(Bytes, Option<u64>), FetchError> {
    let mut resp = fetch.open(url, range).await?;
    let mut data = BytesMut::new();
    while let Some(chunk) = resp.body.next().await {
        data.extend_from_slice(&chunk?);
        if range.len().is_some_and(|len| data.len() as u64 >= len) {
            break;
        }
    }
    if data.is_empty() {
        return Err(FetchError::EmptyRange);
    }
    if let Some(len) = range.len() {
        data.truncate(len as usize);
    }
    Ok((data.freeze(), resp.total_len))
}

#[derive(Default)]
struct MemoryState {
    files: HashMap<String, Bytes>,
    failing: HashSet<String>,
    stalled: HashSet<String>,
    requests: Vec<(String, ByteRange)>,
}

/// In-memory transport with knobs for chunking, latency and failures.
#[derive(Clone)]
pub struct MemoryFetch {
    state: Arc<Mutex<MemoryState>>,
    chunk_size: usize,
    delay: Option<Duration>,
    hide_length: bool,
}

impl Default for MemoryFetch {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFetch {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            chunk_size: 4096,
            delay: None,
            hide_length: false,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Sleep before every chunk
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Do not report the resource length
    pub fn with_hidden_length(mut self) -> Self {
        self.hide_length = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, url: &str, data: impl Into<Bytes>) {
        self.lock().files.insert(url.to_string(), data.into());
    }

    /// Make every following request to `url` fail.
    pub fn set_failing(&self, url: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(url.to_string());
        } else {
            state.failing.remove(url);
        }
    }

    /// Bodies for `url` never yield a chunk.
    pub fn set_stalled(&self, url: &str, stalled: bool) {
        let mut state = self.lock();
        if stalled {
            state.stalled.insert(url.to_string());
        } else {
            state.stalled.remove(url);
        }
    }

    pub fn requests(&self) -> Vec<(String, ByteRange)> {
        self.lock().requests.clone()
    }
}

#[async_trait]
impl RangeFetch for MemoryFetch {
    async fn open(&self, url: &str, range: ByteRange) -> Result<RangeResponse, FetchError> {
        let (data, stalled) = {
            let mut state = self.lock();
            state.requests.push((url.to_string(), range));
            if state.failing.contains(url) {
                return Err(FetchError::Network(NetworkError::Unavailable {
                    url: url.to_string(),
                }));
            }
            let data = state
                .files
                .get(url)
                .cloned()
                .ok_or(FetchError::Network(NetworkError::Status { status: 404 }))?;
            (data, state.stalled.contains(url))
        };

        let total = data.len() as u64;
        if range.start >= total {
            return Err(FetchError::EmptyRange);
        }
        let end = range.end.map_or(total, |end| (end + 1).min(total));
        let slice = data.slice(range.start as usize..end as usize);
        let total_len = (!self.hide_length).then_some(total);

        if stalled {
            return Ok(RangeResponse {
                total_len,
                body: Box::pin(stream::pending()),
            });
        }

        let chunk_size = self.chunk_size;
        let delay = self.delay;
        let body = stream::unfold(slice, move |mut rest| async move {
            if rest.is_empty() {
                return None;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let chunk = rest.split_to(chunk_size.min(rest.len()));
            Some((Ok(chunk), rest))
        });
        Ok(RangeResponse {
            total_len,
            body: Box::pin(body),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Chunk(Bytes),
    Done,
    /// The range holds no bytes at all
    EmptyRange,
    Failed(NetworkError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchMessage {
    pub generation: u64,
    ticket: u64,
    pub event: FetchEvent,
}

/// One outstanding range fetch at a time, pumped by a background task into a
/// bounded channel. Starting a fetch cancels the previous one and nothing the
/// cancelled task sends is ever returned by `next`.
pub struct ByteRangeFetcher {
    fetch: Arc<dyn RangeFetch>,
    tx: mpsc::Sender<FetchMessage>,
    rx: mpsc::Receiver<FetchMessage>,
    task: Option<JoinHandle<()>>,
    ticket: u64,
    active: bool,
    read_timeout: Duration,
}

impl ByteRangeFetcher {
    pub fn new(fetch: Arc<dyn RangeFetch>, config: &PlayerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            fetch,
            tx,
            rx,
            task: None,
            ticket: 0,
            active: false,
            read_timeout: config.read_timeout(),
        }
    }

    /// True until the current fetch reported its final event.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn fetch_range(&mut self, url: &str, range: ByteRange, generation: u64) {
        self.cancel();
        let ticket = self.ticket;
        let fetch = self.fetch.clone();
        let tx = self.tx.clone();
        let url = url.to_string();
        let read_timeout = self.read_timeout;
        self.active = true;

        self.task = Some(tokio::spawn(async move {
            let send = |event| {
                tx.send(FetchMessage {
                    generation,
                    ticket,
                    event,
                })
            };
            let timed_out = || {
                FetchEvent::Failed(NetworkError::Timeout {
                    secs: read_timeout.as_secs(),
                })
            };

            let resp = match tokio::time::timeout(read_timeout, fetch.open(&url, range)).await {
                Err(_) => {
                    let _ = send(timed_out()).await;
                    return;
                }
                Ok(Err(FetchError::EmptyRange)) => {
                    let _ = send(FetchEvent::EmptyRange).await;
                    return;
                }
                Ok(Err(FetchError::Network(e))) => {
                    let _ = send(FetchEvent::Failed(e)).await;
                    return;
                }
                Ok(Ok(resp)) => resp,
            };

            let mut body = resp.body;
            let mut received = 0u64;
            loop {
                match tokio::time::timeout(read_timeout, body.next()).await {
                    Err(_) => {
                        let _ = send(timed_out()).await;
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        let _ = send(FetchEvent::Failed(e)).await;
                        return;
                    }
                    Ok(Some(Ok(chunk))) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        received += chunk.len() as u64;
                        if send(FetchEvent::Chunk(chunk)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let last = if received == 0 {
                FetchEvent::EmptyRange
            } else {
                FetchEvent::Done
            };
            let _ = send(last).await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.ticket += 1;
        self.active = false;
    }

    /// Next message of the current fetch. Pending forever when idle.
    pub async fn next(&mut self) -> Option<FetchMessage> {
        loop {
            let msg = self.rx.recv().await?;
            if msg.ticket != self.ticket {
                continue;
            }
            if !matches!(msg.event, FetchEvent::Chunk(_)) {
                self.active = false;
                self.task = None;
            }
            return Some(msg);
        }
    }
}

impl Drop for ByteRangeFetcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
