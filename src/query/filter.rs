//! Offset/filter engine.
//!
//! Maps logical bounds (1-based sequence numbers, exclusive offsets) onto
//! store cursors (0-based positions) and trims a physical scan to a logical
//! window record by record.

use crate::types::{Direction, Offset, ReadFrom, StreamPosition};

/// Per-record verdict while scanning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Not yet inside the window.
    Skip,
    Include,
    /// Last record of the window in the direction of travel.
    IncludeThenStop,
    /// Past the window; nothing further can match.
    Stop,
}

impl Decision {
    /// Whether the record belongs to the result.
    pub fn includes(self) -> bool {
        matches!(self, Decision::Include | Decision::IncludeThenStop)
    }

    /// Whether the scan ends after this record.
    pub fn stops(self) -> bool {
        matches!(self, Decision::IncludeThenStop | Decision::Stop)
    }
}

/// Decide what to do with a record carrying `sequence_nr` when scanning in
/// `direction` for the inclusive window `[min, max]`.
pub fn decide(direction: Direction, min: u64, max: u64, sequence_nr: u64) -> Decision {
    if sequence_nr < min {
        return match direction {
            Direction::Forwards => Decision::Skip,
            Direction::Backwards => Decision::Stop,
        };
    }
    if sequence_nr > max {
        return match direction {
            Direction::Forwards => Decision::Stop,
            Direction::Backwards => Decision::Skip,
        };
    }
    let boundary = match direction {
        Direction::Forwards => max,
        Direction::Backwards => min,
    };
    if sequence_nr == boundary {
        Decision::IncludeThenStop
    } else {
        Decision::Include
    }
}

/// Cursor for "from sequence number `n`, inclusive".
pub fn from_sequence_inclusive(n: u64) -> ReadFrom {
    if n <= 1 {
        ReadFrom::Start
    } else {
        ReadFrom::Position(StreamPosition(n - 1))
    }
}

/// Cursor for "from sequence number `n`, exclusive".
pub fn from_sequence_exclusive(n: u64) -> ReadFrom {
    ReadFrom::Position(StreamPosition(n))
}

/// Cursor for "after the opaque offset". The largest offset maps onto the
/// last position, which no stream reaches.
pub fn from_offset(offset: Offset) -> ReadFrom {
    match offset {
        Offset::NoOffset => ReadFrom::Start,
        Offset::Sequence(n) => ReadFrom::Position(StreamPosition(n).next()),
    }
}

/// Last position already seen at an offset, as a catch-up subscription start.
pub fn subscription_start(offset: Offset) -> Option<StreamPosition> {
    match offset {
        Offset::NoOffset => None,
        Offset::Sequence(n) => Some(StreamPosition(n)),
    }
}

/// An immutable logical read request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryFilter {
    pub from: ReadFrom,
    pub min_sequence_nr: u64,
    pub max_sequence_nr: u64,
    pub direction: Direction,
}

impl QueryFilter {
    /// Forward read of the inclusive sequence window `[from_seq, to_seq]`.
    pub fn forwards(from_seq: u64, to_seq: u64) -> Self {
        Self {
            from: from_sequence_inclusive(from_seq),
            min_sequence_nr: from_seq,
            max_sequence_nr: to_seq,
            direction: Direction::Forwards,
        }
    }

    /// Backward read from the end of the stream down to `min_seq`.
    pub fn backwards(min_seq: u64, max_seq: u64) -> Self {
        Self {
            from: ReadFrom::End,
            min_sequence_nr: min_seq,
            max_sequence_nr: max_seq,
            direction: Direction::Backwards,
        }
    }

    /// Forward read after an offset, unbounded in sequence numbers.
    pub fn after_offset(offset: Offset) -> Self {
        Self {
            from: from_offset(offset),
            min_sequence_nr: 0,
            max_sequence_nr: u64::MAX,
            direction: Direction::Forwards,
        }
    }

    /// Verdict for one record of this filter's scan.
    pub fn decide(&self, sequence_nr: u64) -> Decision {
        decide(
            self.direction,
            self.min_sequence_nr,
            self.max_sequence_nr,
            sequence_nr,
        )
    }

    /// True when the window cannot contain anything.
    pub fn is_empty(&self) -> bool {
        self.min_sequence_nr > self.max_sequence_nr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwards_table() {
        let d = Direction::Forwards;
        assert_eq!(decide(d, 3, 5, 2), Decision::Skip);
        assert_eq!(decide(d, 3, 5, 3), Decision::Include);
        assert_eq!(decide(d, 3, 5, 4), Decision::Include);
        assert_eq!(decide(d, 3, 5, 5), Decision::IncludeThenStop);
        assert_eq!(decide(d, 3, 5, 6), Decision::Stop);
    }

    #[test]
    fn test_backwards_table() {
        let d = Direction::Backwards;
        assert_eq!(decide(d, 3, 5, 6), Decision::Skip);
        assert_eq!(decide(d, 3, 5, 5), Decision::Include);
        assert_eq!(decide(d, 3, 5, 4), Decision::Include);
        assert_eq!(decide(d, 3, 5, 3), Decision::IncludeThenStop);
        assert_eq!(decide(d, 3, 5, 2), Decision::Stop);
    }

    #[test]
    fn test_single_element_window() {
        assert_eq!(
            decide(Direction::Forwards, 4, 4, 4),
            Decision::IncludeThenStop
        );
        assert_eq!(
            decide(Direction::Backwards, 4, 4, 4),
            Decision::IncludeThenStop
        );
    }

    #[test]
    fn test_cursor_construction() {
        assert_eq!(from_sequence_inclusive(0), ReadFrom::Start);
        assert_eq!(from_sequence_inclusive(1), ReadFrom::Start);
        assert_eq!(
            from_sequence_inclusive(5),
            ReadFrom::Position(StreamPosition(4))
        );
        assert_eq!(
            from_sequence_exclusive(5),
            ReadFrom::Position(StreamPosition(5))
        );
        assert_eq!(from_offset(Offset::NoOffset), ReadFrom::Start);
        assert_eq!(
            from_offset(Offset::Sequence(0)),
            ReadFrom::Position(StreamPosition(1))
        );
        assert_eq!(subscription_start(Offset::NoOffset), None);
        assert_eq!(
            subscription_start(Offset::Sequence(9)),
            Some(StreamPosition(9))
        );
    }

    #[test]
    fn test_largest_offset_does_not_overflow() {
        assert_eq!(
            from_offset(Offset::Sequence(u64::MAX)),
            ReadFrom::Position(StreamPosition(u64::MAX))
        );
        assert_eq!(
            QueryFilter::after_offset(Offset::Sequence(u64::MAX - 1)).from,
            ReadFrom::Position(StreamPosition(u64::MAX))
        );
    }

    #[test]
    fn test_filter_constructors() {
        let filter = QueryFilter::forwards(2, 10);
        assert_eq!(filter.from, ReadFrom::Position(StreamPosition(1)));
        assert_eq!(filter.decide(10), Decision::IncludeThenStop);
        assert!(!filter.is_empty());
        assert!(QueryFilter::forwards(5, 4).is_empty());
        assert_eq!(QueryFilter::after_offset(Offset::NoOffset).decide(123), Decision::Include);
    }
}
