use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use flv_demux::{MediaSegment, SegmentKind};

use crate::core::buffered::{BufferedRange, BufferedRanges};
use crate::errors::SinkError;
use crate::traits::RenderingSink;

#[derive(Debug, Clone, PartialEq)]
pub enum SinkOp {
    Append {
        kind: SegmentKind,
        timestamp: f64,
        duration: f64,
    },
    Remove {
        start: f64,
        end: f64,
    },
    Flush,
    EndOfStream,
    SetDuration(f64),
}

struct SinkState {
    ops: Vec<SinkOp>,
    segments: Vec<MediaSegment>,
    ranges: BufferedRanges,
    last: HashMap<SegmentKind, f64>,
    ended: bool,
}

/// Sink that keeps everything in memory and records every call.
///
/// Appends that would overlap earlier media of the same kind are rejected, so
/// tests catch ordering mistakes.
pub struct MemorySink {
    state: Mutex<SinkState>,
    position: AtomicU64,
    /// Max seconds of media held at once
    capacity: Option<f64>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SinkState {
                ops: Vec::new(),
                segments: Vec::new(),
                ranges: BufferedRanges::new(0.1),
                last: HashMap::new(),
                ended: false,
            }),
            position: AtomicU64::new(0f64.to_bits()),
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, seconds: f64) -> Self {
        self.capacity = Some(seconds);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_position(&self, position: f64) {
        self.position.store(position.to_bits(), Ordering::Relaxed);
    }

    pub fn ops(&self) -> Vec<SinkOp> {
        self.lock().ops.clone()
    }

    /// Segments currently held, in append order
    pub fn segments(&self) -> Vec<MediaSegment> {
        self.lock().segments.clone()
    }

    pub fn buffered(&self) -> Vec<BufferedRange> {
        self.lock().ranges.ranges().to_vec()
    }

    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }
}

#[async_trait]
impl RenderingSink for MemorySink {
    async fn append(&self, segment: MediaSegment) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.ended {
            return Err(SinkError::Closed);
        }
        if segment.kind != SegmentKind::Init {
            if let Some(&last) = state.last.get(&segment.kind) {
                if segment.timestamp <= last {
                    return Err(SinkError::Rejected {
                        reason: format!(
                            "{} at {:.3} overlaps {:.3}",
                            segment.kind.as_str(),
                            segment.timestamp,
                            last
                        ),
                    });
                }
            }
            if let Some(capacity) = self.capacity {
                if state.ranges.total() + segment.duration > capacity {
                    return Err(SinkError::QuotaExceeded);
                }
            }
            state.last.insert(segment.kind, segment.timestamp);
            state.ranges.add(segment.timestamp, segment.end());
        }
        state.ops.push(SinkOp::Append {
            kind: segment.kind,
            timestamp: segment.timestamp,
            duration: segment.duration,
        });
        state.segments.push(segment);
        Ok(())
    }

    async fn remove(&self, start: f64, end: f64) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.ops.push(SinkOp::Remove { start, end });
        state.ranges.remove(start, end);
        state
            .segments
            .retain(|s| s.kind == SegmentKind::Init || s.timestamp < start || s.timestamp >= end);
        let mut last = HashMap::new();
        for segment in state.segments.iter().filter(|s| s.kind != SegmentKind::Init) {
            let entry = last.entry(segment.kind).or_insert(segment.timestamp);
            *entry = segment.timestamp.max(*entry);
        }
        state.last = last;
        state.ended = false;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.lock().ops.push(SinkOp::Flush);
        Ok(())
    }

    async fn end_of_stream(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.ops.push(SinkOp::EndOfStream);
        state.ended = true;
        Ok(())
    }

    async fn set_duration(&self, duration: f64) -> Result<(), SinkError> {
        self.lock().ops.push(SinkOp::SetDuration(duration));
        Ok(())
    }

    fn position(&self) -> f64 {
        f64::from_bits(self.position.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video(timestamp: f64) -> MediaSegment {
        MediaSegment {
            kind: SegmentKind::Video,
            timestamp,
            duration: 0.5,
            keyframe: false,
            payload: Bytes::from_static(b"tag"),
        }
    }

    #[tokio::test]
    async fn rejects_overlapping_appends() {
        let sink = MemorySink::new();
        sink.append(video(0.0)).await.unwrap();
        sink.append(video(0.5)).await.unwrap();
        assert!(matches!(
            sink.append(video(0.5)).await,
            Err(SinkError::Rejected { .. })
        ));
        sink.remove(0.0, f64::INFINITY).await.unwrap();
        sink.append(video(0.5)).await.unwrap();
        assert_eq!(sink.buffered(), vec![BufferedRange { start: 0.5, end: 1.0 }]);
    }

    #[tokio::test]
    async fn quota_and_end_of_stream() {
        let sink = MemorySink::new().with_capacity(1.0);
        sink.append(video(0.0)).await.unwrap();
        sink.append(video(0.5)).await.unwrap();
        assert_eq!(sink.append(video(1.0)).await, Err(SinkError::QuotaExceeded));
        sink.remove(0.0, 0.5).await.unwrap();
        sink.append(video(1.0)).await.unwrap();

        sink.end_of_stream().await.unwrap();
        assert!(sink.is_ended());
        assert_eq!(sink.append(video(1.5)).await, Err(SinkError::Closed));
    }

    #[test]
    fn position_is_shared() {
        let sink = MemorySink::new();
        sink.set_position(12.5);
        assert_eq!(sink.position(), 12.5);
    }
}
