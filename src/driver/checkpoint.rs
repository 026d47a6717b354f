use crate::prelude::*;
use std::collections::BTreeSet;

/// Tracks the highest height below which a pass has no holes
///
/// Heights commit out of order; the checkpoint only moves up to just below
/// the lowest height of the worklist that hasn't committed yet.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    start: BlockHeight,
    outstanding: BTreeSet<BlockHeight>,
    /// What the checkpoint becomes once nothing is outstanding
    ceiling: Option<BlockHeight>,
}

impl CheckpointTracker {
    /// `ceiling` is the highest height known complete if the whole worklist
    /// commits; it's raised to the top of the worklist if needed.
    pub fn new(
        start: BlockHeight,
        worklist: &[BlockHeight],
        ceiling: Option<BlockHeight>,
    ) -> Self {
        let outstanding: BTreeSet<_> = worklist.iter().copied().collect();
        let ceiling = ceiling.max(outstanding.last().copied());
        Self {
            start,
            outstanding,
            ceiling,
        }
    }

    pub fn complete(&mut self, height: BlockHeight) {
        self.outstanding.remove(&height);
    }

    pub fn checkpoint(&self) -> Option<BlockHeight> {
        match self.outstanding.first() {
            None => self.ceiling,
            Some(&lowest) => lowest.checked_sub(1).filter(|&h| h >= self.start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_skips_a_hole() {
        let mut t = CheckpointTracker::new(0, &[501, 502, 503, 504], Some(500));
        assert_eq!(t.checkpoint(), Some(500));
        t.complete(502);
        t.complete(503);
        assert_eq!(t.checkpoint(), Some(500));
        t.complete(501);
        assert_eq!(t.checkpoint(), Some(503));
        t.complete(504);
        assert_eq!(t.checkpoint(), Some(504));
    }

    #[test]
    fn nothing_below_start() {
        let mut t = CheckpointTracker::new(1, &[1, 2, 3], None);
        assert_eq!(t.checkpoint(), None);
        t.complete(2);
        assert_eq!(t.checkpoint(), None);
        t.complete(1);
        assert_eq!(t.checkpoint(), Some(2));
    }

    #[test]
    fn empty_worklist_keeps_ceiling() {
        let t = CheckpointTracker::new(0, &[], Some(42));
        assert_eq!(t.checkpoint(), Some(42));
        let t = CheckpointTracker::new(0, &[], None);
        assert_eq!(t.checkpoint(), None);
    }

    #[test]
    fn gap_below_ceiling_holds_it_back() {
        let mut t = CheckpointTracker::new(0, &[7], Some(100));
        assert_eq!(t.checkpoint(), Some(6));
        t.complete(7);
        assert_eq!(t.checkpoint(), Some(100));
    }
}
