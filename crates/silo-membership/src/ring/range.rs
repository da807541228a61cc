//! Ranges over the 32-bit hash ring.
//!
//! A segment `(begin, end]` excludes its begin and includes its end, and
//! wraps past `u32::MAX` when `begin > end`. `begin == end` is the full
//! ring.

use std::fmt;

/// Number of points on the ring.
pub const RING_SIZE: u64 = 1 << 32;

/// One contiguous arc of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SingleRange {
    begin: u32,
    end: u32,
}

impl SingleRange {
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    pub fn full() -> Self {
        Self { begin: 0, end: 0 }
    }

    pub fn begin(&self) -> u32 {
        self.begin
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn is_full(&self) -> bool {
        self.begin == self.end
    }

    pub fn wraps(&self) -> bool {
        self.begin > self.end
    }

    pub fn in_range(&self, key: u32) -> bool {
        if self.is_full() {
            true
        } else if self.wraps() {
            key > self.begin || key <= self.end
        } else {
            key > self.begin && key <= self.end
        }
    }

    pub fn size(&self) -> u64 {
        if self.is_full() {
            RING_SIZE
        } else {
            u64::from(self.end.wrapping_sub(self.begin))
        }
    }
}

impl fmt::Display for SingleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full() {
            return f.write_str("<full>");
        }
        write!(f, "(0x{:08x}, 0x{:08x}]", self.begin, self.end)
    }
}

/// A silo's share of the ring: nothing, one arc, or several disjoint arcs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RingRange {
    #[default]
    Empty,
    Single(SingleRange),
    /// Disjoint, non-adjacent arcs sorted by begin.
    Multi(Vec<SingleRange>),
}

impl RingRange {
    pub fn full() -> Self {
        RingRange::Single(SingleRange::full())
    }

    /// Builds a normalized range from arbitrary disjoint segments: adjacent
    /// arcs are merged, including across the wrap point.
    pub fn from_segments(mut segments: Vec<SingleRange>) -> Self {
        if segments.iter().any(SingleRange::is_full) {
            return Self::full();
        }
        segments.sort_by_key(|s| (s.begin, s.end));

        let mut merged: Vec<SingleRange> = Vec::with_capacity(segments.len());
        for segment in segments {
            match merged.last_mut() {
                Some(last) if last.end == segment.begin => last.end = segment.end,
                _ => merged.push(segment),
            }
        }
        if merged.len() > 1 {
            let first = merged[0];
            let last = merged[merged.len() - 1];
            if last.end == first.begin {
                merged.remove(0);
                let len = merged.len();
                merged[len - 1].end = first.end;
            }
        }

        match merged.len() {
            0 => RingRange::Empty,
            1 => RingRange::Single(merged[0]),
            _ => {
                merged.sort_by_key(|s| s.begin);
                RingRange::Multi(merged)
            }
        }
    }

    pub fn segments(&self) -> &[SingleRange] {
        match self {
            RingRange::Empty => &[],
            RingRange::Single(s) => std::slice::from_ref(s),
            RingRange::Multi(v) => v,
        }
    }

    pub fn in_range(&self, key: u32) -> bool {
        self.segments().iter().any(|s| s.in_range(key))
    }

    pub fn size(&self) -> u64 {
        self.segments().iter().map(SingleRange::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RingRange::Empty)
    }

    pub fn is_full(&self) -> bool {
        self.size() == RING_SIZE
    }

    /// Share of the ring covered, in percent.
    pub fn percentage(&self) -> f64 {
        self.size() as f64 * 100.0 / RING_SIZE as f64
    }
}

impl fmt::Display for RingRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingRange::Empty => f.write_str("<empty>"),
            RingRange::Single(s) => write!(f, "{s} {:.3}%", self.percentage()),
            RingRange::Multi(v) => {
                write!(f, "{} segments {:.3}% [", v.len(), self.percentage())?;
                for (i, s) in v.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{s}")?;
                }
                f.write_str("]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_range_bounds() {
        let r = SingleRange::new(10, 20);
        assert!(!r.in_range(10));
        assert!(r.in_range(11));
        assert!(r.in_range(20));
        assert!(!r.in_range(21));
        assert_eq!(r.size(), 10);
    }

    #[test]
    fn wrapping_range() {
        let r = SingleRange::new(u32::MAX - 1, 1);
        assert!(r.wraps());
        assert!(r.in_range(u32::MAX));
        assert!(r.in_range(0));
        assert!(r.in_range(1));
        assert!(!r.in_range(u32::MAX - 1));
        assert!(!r.in_range(2));
        assert_eq!(r.size(), 3);
    }

    #[test]
    fn full_range_covers_everything() {
        let r = SingleRange::new(77, 77);
        assert!(r.is_full());
        assert!(r.in_range(0) && r.in_range(77) && r.in_range(u32::MAX));
        assert_eq!(r.size(), RING_SIZE);
        assert_eq!(RingRange::full().percentage(), 100.0);
    }

    #[test]
    fn from_segments_merges_adjacent_and_wrap() {
        let range = RingRange::from_segments(vec![
            SingleRange::new(100, 200),
            SingleRange::new(u32::MAX - 5, 10),
            SingleRange::new(200, 300),
            SingleRange::new(10, 20),
        ]);
        assert_eq!(
            range,
            RingRange::Multi(vec![
                SingleRange::new(100, 300),
                SingleRange::new(u32::MAX - 5, 20),
            ])
        );
        assert_eq!(range.size(), 200 + 26);
        assert!(range.in_range(0));
        assert!(!range.in_range(50));
    }

    #[test]
    fn from_segments_that_tile_the_ring_is_full() {
        let range = RingRange::from_segments(vec![
            SingleRange::new(5, 1000),
            SingleRange::new(1000, 5),
        ]);
        assert!(range.is_full());
        assert_eq!(range.segments().len(), 1);
        assert_eq!(RingRange::from_segments(Vec::new()), RingRange::Empty);
    }
}
