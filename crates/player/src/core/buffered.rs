#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Sorted, non-overlapping time ranges held by the rendering buffer.
///
/// Ranges closer than `tolerance` are merged into one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferedRanges {
    ranges: Vec<BufferedRange>,
    tolerance: f64,
}

impl BufferedRanges {
    pub fn new(tolerance: f64) -> Self {
        Self {
            ranges: Vec::new(),
            tolerance,
        }
    }

    pub fn ranges(&self) -> &[BufferedRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn start(&self) -> Option<f64> {
        self.ranges.first().map(|r| r.start)
    }

    pub fn end(&self) -> Option<f64> {
        self.ranges.last().map(|r| r.end)
    }

    pub fn total(&self) -> f64 {
        self.ranges.iter().map(BufferedRange::duration).sum()
    }

    pub fn add(&mut self, start: f64, end: f64) {
        if !(end >= start) {
            return;
        }
        let mut merged = BufferedRange { start, end };
        let tolerance = self.tolerance;
        self.ranges.retain(|r| {
            let touches = r.start <= merged.end + tolerance && merged.start <= r.end + tolerance;
            if touches {
                merged.start = merged.start.min(r.start);
                merged.end = merged.end.max(r.end);
            }
            !touches
        });
        let at = self
            .ranges
            .iter()
            .position(|r| r.start > merged.start)
            .unwrap_or(self.ranges.len());
        self.ranges.insert(at, merged);
    }

    pub fn remove(&mut self, start: f64, end: f64) {
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end <= start || r.start >= end {
                kept.push(r);
                continue;
            }
            if r.start < start {
                kept.push(BufferedRange {
                    start: r.start,
                    end: start,
                });
            }
            if r.end > end {
                kept.push(BufferedRange { start: end, end: r.end });
            }
        }
        self.ranges = kept;
    }

    /// The range holding `position`, allowing `tolerance` slack at its start.
    pub fn containing(&self, position: f64) -> Option<BufferedRange> {
        self.ranges
            .iter()
            .find(|r| r.start - self.tolerance <= position && position <= r.end)
            .copied()
    }

    /// Seconds buffered contiguously after `position`
    pub fn ahead_of(&self, position: f64) -> f64 {
        self.containing(position)
            .map_or(0.0, |r| (r.end - position).max(0.0))
    }
}
