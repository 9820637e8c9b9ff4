//! Novelty detection between consecutive snapshots.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::model::{Identity, Snapshot};

/// Identities present in the newest snapshot but absent from the one before.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoveltySet {
    /// Sequence of the snapshot this set was computed for.
    pub sequence: u64,
    identities: HashSet<Identity>,
}

impl NoveltySet {
    pub fn contains(&self, identity: &Identity) -> bool {
        self.identities.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }
}

/// Compute which identities in `current` were not in `previous`.
///
/// With no previous snapshot nothing is new, so the first page is never
/// flashed as a whole. An identity that left and came back counts as new.
pub fn diff(previous: Option<&Snapshot>, current: &Snapshot) -> NoveltySet {
    let Some(previous) = previous else {
        return NoveltySet {
            sequence: current.sequence,
            identities: HashSet::new(),
        };
    };

    let seen: HashSet<&Identity> = previous.identities().collect();
    let identities = current
        .identities()
        .filter(|id| !seen.contains(id))
        .cloned()
        .collect();

    NoveltySet {
        sequence: current.sequence,
        identities,
    }
}

// ---------------------------------------------------------------------------
// HighlightTracker
// ---------------------------------------------------------------------------

/// Holds the latest novelty set for a bounded highlight window.
///
/// Each recorded set replaces the previous one; highlights never accumulate
/// across polls.
#[derive(Debug)]
pub struct HighlightTracker {
    window: Duration,
    active: Option<(NoveltySet, Instant)>,
}

impl HighlightTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            active: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Start a new highlight window for `novelty`. An empty set clears.
    pub fn record(&mut self, novelty: NoveltySet, now: Instant) {
        self.active = if novelty.is_empty() {
            None
        } else {
            Some((novelty, now + self.window))
        };
    }

    /// The set still inside its window, if any.
    pub fn active(&self, now: Instant) -> Option<&NoveltySet> {
        match &self.active {
            Some((set, deadline)) if now < *deadline => Some(set),
            _ => None,
        }
    }

    pub fn is_highlighted(&self, identity: &Identity, now: Instant) -> bool {
        self.active(now).is_some_and(|set| set.contains(identity))
    }

    /// When the current window closes.
    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().map(|(_, deadline)| *deadline)
    }

    /// Drop the set once its window has elapsed. Returns true if cleared.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.active = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IdentityKey;
    use chrono::Utc;
    use serde_json::json;

    fn snapshot(sequence: u64, ids: &[u64]) -> Snapshot {
        let records = ids.iter().map(|id| json!({"id": id})).collect();
        Snapshot::from_records(sequence, records, &IdentityKey::default(), None, Utc::now())
            .unwrap()
    }

    fn ids(set: &NoveltySet) -> Vec<String> {
        let mut out: Vec<String> = set.iter().map(|i| i.to_string()).collect();
        out.sort();
        out
    }

    #[test]
    fn test_first_poll_has_no_novelty() {
        let first = snapshot(1, &[1, 2, 3]);
        let novelty = diff(None, &first);
        assert!(novelty.is_empty());
        assert_eq!(novelty.sequence, 1);
    }

    #[test]
    fn test_diff_reports_only_new_identity() {
        let previous = snapshot(1, &[1, 2, 3]);
        let current = snapshot(2, &[2, 3, 4]);
        assert_eq!(ids(&diff(Some(&previous), &current)), vec!["4"]);
    }

    #[test]
    fn test_reorder_is_not_novel() {
        let previous = snapshot(1, &[1, 2, 3]);
        let current = snapshot(2, &[3, 1, 2]);
        assert!(diff(Some(&previous), &current).is_empty());
    }

    #[test]
    fn test_reappearing_identity_is_new_again() {
        let s1 = snapshot(1, &[1, 2]);
        let s2 = snapshot(2, &[2]);
        let s3 = snapshot(3, &[1, 2]);
        assert!(diff(Some(&s1), &s2).is_empty());
        assert_eq!(ids(&diff(Some(&s2), &s3)), vec!["1"]);
    }

    #[test]
    fn test_diff_over_sequence_matches_set_difference() {
        let runs: [&[u64]; 5] = [&[1, 2, 3], &[2, 3, 4, 5], &[5], &[], &[5, 6, 1]];
        let snapshots: Vec<Snapshot> = runs
            .iter()
            .enumerate()
            .map(|(i, ids)| snapshot(i as u64 + 1, ids))
            .collect();

        for pair in snapshots.windows(2) {
            let (prev, cur) = (&pair[0], &pair[1]);
            let novelty = diff(Some(prev), cur);
            for entity in cur.entities.iter() {
                let was_there = prev.get(&entity.identity).is_some();
                assert_eq!(novelty.contains(&entity.identity), !was_there);
            }
            for entity in prev.entities.iter() {
                assert!(!novelty.contains(&entity.identity));
            }
        }
    }

    #[test]
    fn test_highlight_window_expires() {
        let mut tracker = HighlightTracker::new(Duration::from_secs(3));
        let t0 = Instant::now();
        let novelty = diff(Some(&snapshot(1, &[1])), &snapshot(2, &[1, 2]));

        tracker.record(novelty, t0);
        let two = Identity::from(2u64);
        assert!(tracker.is_highlighted(&two, t0 + Duration::from_secs(2)));
        assert!(!tracker.is_highlighted(&two, t0 + Duration::from_secs(3)));

        assert!(!tracker.expire(t0 + Duration::from_secs(1)));
        assert!(tracker.expire(t0 + Duration::from_secs(3)));
        assert!(tracker.deadline().is_none());
    }

    #[test]
    fn test_highlights_do_not_accumulate() {
        let mut tracker = HighlightTracker::new(Duration::from_secs(3));
        let t0 = Instant::now();

        tracker.record(diff(Some(&snapshot(1, &[1])), &snapshot(2, &[1, 2])), t0);
        tracker.record(
            diff(Some(&snapshot(2, &[1, 2])), &snapshot(3, &[1, 2, 3])),
            t0 + Duration::from_secs(1),
        );

        let now = t0 + Duration::from_secs(2);
        assert!(!tracker.is_highlighted(&Identity::from(2u64), now));
        assert!(tracker.is_highlighted(&Identity::from(3u64), now));
    }

    #[test]
    fn test_empty_novelty_clears_highlight() {
        let mut tracker = HighlightTracker::new(Duration::from_secs(3));
        let t0 = Instant::now();
        tracker.record(diff(Some(&snapshot(1, &[1])), &snapshot(2, &[1, 2])), t0);
        tracker.record(NoveltySet::default(), t0);
        assert!(tracker.active(t0).is_none());
    }
}
