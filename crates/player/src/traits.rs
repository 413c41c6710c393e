use async_trait::async_trait;
use flv_demux::MediaSegment;

use crate::errors::SinkError;

/// Consumer of demuxed segments, e.g. a decoder feeding a video surface.
///
/// Segments arrive one at a time, in order, and never overlap what is already
/// buffered unless that part was removed first.
#[async_trait]
pub trait RenderingSink: Send + Sync {
    async fn append(&self, segment: MediaSegment) -> Result<(), SinkError>;
    /// Drop buffered media in `[start, end)`
    async fn remove(&self, start: f64, end: f64) -> Result<(), SinkError>;
    /// Reset decoder state so the next append starts a new contiguous range.
    async fn flush(&self) -> Result<(), SinkError>;
    async fn end_of_stream(&self) -> Result<(), SinkError>;
    async fn set_duration(&self, duration: f64) -> Result<(), SinkError>;
    /// Current playback position in seconds
    fn position(&self) -> f64;
}
