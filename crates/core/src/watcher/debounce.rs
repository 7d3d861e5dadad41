//! Sliding-deadline debounce for batches of changed paths.
//!
//! Every recorded event re-arms the deadline to `last_event + window`, so a
//! burst of edits collapses into one batch that is released only after the
//! tree has been quiet for the whole window.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Pending changed paths and the time of the most recent contributing event.
#[derive(Debug)]
pub struct ChangeSet {
    window: Duration,
    paths: BTreeSet<PathBuf>,
    last_event: Option<Instant>,
}

impl ChangeSet {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            paths: BTreeSet::new(),
            last_event: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a changed path and re-arm the deadline.
    pub fn push(&mut self, path: PathBuf) {
        self.push_at(path, Instant::now());
    }

    /// Like `push` but with a specific timestamp.
    pub fn push_at(&mut self, path: PathBuf, now: Instant) {
        self.paths.insert(path);
        self.last_event = Some(now);
    }

    /// Take the whole batch if the deadline has passed.
    pub fn drain_ready(&mut self) -> Option<Vec<PathBuf>> {
        self.drain_ready_at(Instant::now())
    }

    /// Like `drain_ready` but with a specific timestamp.
    pub fn drain_ready_at(&mut self, now: Instant) -> Option<Vec<PathBuf>> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.last_event = None;
        Some(std::mem::take(&mut self.paths).into_iter().collect())
    }

    /// When the current batch becomes ready, or `None` when nothing is pending.
    pub fn deadline(&self) -> Option<Instant> {
        if self.paths.is_empty() {
            return None;
        }
        self.last_event.map(|t| t + self.window)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.paths.clear();
        self.last_event = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);

    #[test]
    fn test_burst_collapses_into_one_batch() {
        let mut set = ChangeSet::new(WINDOW);
        let t0 = Instant::now();
        set.push_at(PathBuf::from("/w/a.rs"), t0);
        set.push_at(PathBuf::from("/w/b.rs"), t0 + Duration::from_millis(500));
        set.push_at(PathBuf::from("/w/a.rs"), t0 + Duration::from_millis(1500));

        // Quiet for less than the window since the last event.
        assert!(set.drain_ready_at(t0 + Duration::from_millis(3000)).is_none());

        let batch = set
            .drain_ready_at(t0 + Duration::from_millis(3500))
            .unwrap();
        assert_eq!(
            batch,
            vec![PathBuf::from("/w/a.rs"), PathBuf::from("/w/b.rs")]
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_later_event_forms_second_batch() {
        let mut set = ChangeSet::new(WINDOW);
        let t0 = Instant::now();
        set.push_at(PathBuf::from("/w/a.rs"), t0);
        assert_eq!(set.drain_ready_at(t0 + WINDOW).unwrap().len(), 1);

        let t1 = t0 + Duration::from_secs(10);
        set.push_at(PathBuf::from("/w/c.rs"), t1);
        assert!(set.drain_ready_at(t1 + Duration::from_secs(1)).is_none());
        assert_eq!(
            set.drain_ready_at(t1 + WINDOW).unwrap(),
            vec![PathBuf::from("/w/c.rs")]
        );
    }

    #[test]
    fn test_empty_set_never_fires() {
        let mut set = ChangeSet::new(WINDOW);
        assert!(set.deadline().is_none());
        assert!(set
            .drain_ready_at(Instant::now() + Duration::from_secs(60))
            .is_none());
    }

    #[test]
    fn test_deadline_tracks_last_event() {
        let mut set = ChangeSet::new(WINDOW);
        let t0 = Instant::now();
        set.push_at(PathBuf::from("/w/a.rs"), t0);
        set.push_at(PathBuf::from("/w/a.rs"), t0 + Duration::from_secs(1));
        assert_eq!(set.deadline(), Some(t0 + Duration::from_secs(3)));
        assert_eq!(set.len(), 1);
        set.clear();
        assert!(set.deadline().is_none());
    }
}
