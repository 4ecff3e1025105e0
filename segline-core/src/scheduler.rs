//! Pipeline scheduling helpers: which segment goes next and how many fit.

use crate::segments::SegmentState;

/// Lowest `Unsent` segment at or after `from`.
pub fn next_unsent(segments: &[SegmentState], from: usize) -> Option<usize> {
    segments
        .get(from..)?
        .iter()
        .position(|s| *s == SegmentState::Unsent)
        .map(|i| from + i)
}

/// Number of requests that may still be issued with `outstanding` in flight.
pub fn free_slots(outstanding: u32, pipeline_depth: u32) -> u32 {
    pipeline_depth.max(1).saturating_sub(outstanding)
}

pub fn count(segments: &[SegmentState], state: SegmentState) -> usize {
    segments.iter().filter(|s| **s == state).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use SegmentState::{Complete as C, Outgoing as O, Unsent as U};

    #[test]
    fn next_unsent_skips_outgoing_and_complete() {
        let table = [C, O, U, C, U];
        assert_eq!(next_unsent(&table, 0), Some(2));
        assert_eq!(next_unsent(&table, 3), Some(4));
        assert_eq!(next_unsent(&table, 5), None);
        assert_eq!(next_unsent(&table, 9), None);
        assert_eq!(next_unsent(&[C, O], 0), None);
    }

    #[test]
    fn free_slots_bounds() {
        assert_eq!(free_slots(0, 5), 5);
        assert_eq!(free_slots(5, 5), 0);
        assert_eq!(free_slots(7, 5), 0);
        assert_eq!(free_slots(0, 0), 1);
    }

    #[test]
    fn count_by_state() {
        assert_eq!(count(&[C, O, U, C], C), 2);
        assert_eq!(count(&[], U), 0);
    }
}
