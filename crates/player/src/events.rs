use crate::errors::PlayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Probing,
    Buffering,
    Playing,
    Seeking,
    Ended,
    Error,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Probing => "probing",
            PlaybackState::Buffering => "buffering",
            PlaybackState::Playing => "playing",
            PlaybackState::Seeking => "seeking",
            PlaybackState::Ended => "ended",
            PlaybackState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PlaybackState::Ended | PlaybackState::Error)
    }
}

/// Start-up milestones, reported as percentages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Milestone {
    SourceSelected,
    FetchStarted,
    FirstFrameReady,
}

impl Milestone {
    pub fn percent(&self) -> u8 {
        match self {
            Milestone::SourceSelected => 30,
            Milestone::FetchStarted => 60,
            Milestone::FirstFrameReady => 100,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Progress {
        session: String,
        percent: u8,
    },
    StateChanged {
        session: String,
        from: PlaybackState,
        to: PlaybackState,
    },
    Discontinuity {
        session: String,
        kind: &'static str,
        expected: f64,
        actual: f64,
    },
    Started {
        session: String,
    },
    Error {
        session: String,
        error: PlayerError,
    },
}

/// Keeps reported progress non-decreasing.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    reached: Option<Milestone>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the percentage to report, or `None` if the milestone is not ahead
    /// of what was already reported.
    pub fn advance(&mut self, milestone: Milestone) -> Option<u8> {
        if self.reached.is_some_and(|reached| reached >= milestone) {
            return None;
        }
        self.reached = Some(milestone);
        Some(milestone.percent())
    }

    /// Jump to completion, e.g. when start-up failed and the bar must close.
    pub fn complete(&mut self) -> Option<u8> {
        self.advance(Milestone::FirstFrameReady)
    }

    pub fn percent(&self) -> u8 {
        self.reached.map_or(0, |m| m.percent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotonic() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.percent(), 0);
        assert_eq!(tracker.advance(Milestone::SourceSelected), Some(30));
        assert_eq!(tracker.advance(Milestone::FirstFrameReady), Some(100));
        // the fetch-started milestone arriving late is not reported
        assert_eq!(tracker.advance(Milestone::FetchStarted), None);
        assert_eq!(tracker.advance(Milestone::FirstFrameReady), None);
        assert_eq!(tracker.percent(), 100);
    }

    #[test]
    fn complete_closes_the_bar_once() {
        let mut tracker = ProgressTracker::new();
        tracker.advance(Milestone::SourceSelected);
        assert_eq!(tracker.complete(), Some(100));
        assert_eq!(tracker.complete(), None);
    }
}
