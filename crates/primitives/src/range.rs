//! Inclusive height ranges and a normalized set of them.

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct HeightRange {
    pub start: u32,
    pub end: u32,
}

impl HeightRange {
    /// `None` when `start > end`.
    pub fn new(start: u32, end: u32) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(height: u32) -> Self {
        Self {
            start: height,
            end: height,
        }
    }

    pub fn height_count(&self) -> u64 {
        u64::from(self.end - self.start) + 1
    }

    pub fn contains(&self, height: u32) -> bool {
        (self.start..=self.end).contains(&height)
    }

    pub fn overlaps(&self, other: &HeightRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Splits into consecutive pieces of at most `size` heights.
    pub fn chunks(&self, size: u32) -> Vec<HeightRange> {
        let size = size.max(1);
        let mut out = Vec::new();
        let mut start = self.start;
        loop {
            let end = start.saturating_add(size - 1).min(self.end);
            out.push(HeightRange { start, end });
            if end == self.end {
                break;
            }
            start = end + 1;
        }
        out
    }
}

impl std::fmt::Display for HeightRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl Encodable for HeightRange {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.start);
        encoder.write_u32_le(self.end);
    }
}

impl Decodable for HeightRange {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let start = decoder.read_u32_le()?;
        let end = decoder.read_u32_le()?;
        HeightRange::new(start, end).ok_or(DecodeError::InvalidData("inverted height range"))
    }
}

/// Sorted, disjoint, non-adjacent ranges.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RangeSet {
    ranges: Vec<HeightRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = HeightRange>) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.insert(range);
        }
        set
    }

    pub fn from_heights(heights: impl IntoIterator<Item = u32>) -> Self {
        Self::from_ranges(heights.into_iter().map(HeightRange::single))
    }

    pub fn ranges(&self) -> &[HeightRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn height_count(&self) -> u64 {
        self.ranges.iter().map(HeightRange::height_count).sum()
    }

    pub fn contains(&self, height: u32) -> bool {
        let idx = self.ranges.partition_point(|range| range.end < height);
        self.ranges
            .get(idx)
            .is_some_and(|range| range.contains(height))
    }

    pub fn insert(&mut self, range: HeightRange) {
        let mut merged = range;
        // First range that ends at or after merged.start - 1 may touch us.
        let first = self
            .ranges
            .partition_point(|existing| existing.end.saturating_add(1) < merged.start);
        let mut last = first;
        while last < self.ranges.len()
            && self.ranges[last].start <= merged.end.saturating_add(1)
        {
            merged.start = merged.start.min(self.ranges[last].start);
            merged.end = merged.end.max(self.ranges[last].end);
            last += 1;
        }
        self.ranges.splice(first..last, std::iter::once(merged));
    }

    pub fn union(&mut self, other: &RangeSet) {
        for range in &other.ranges {
            self.insert(*range);
        }
    }

    /// Heights of `domain` not covered by this set.
    pub fn missing_within(&self, domain: HeightRange) -> RangeSet {
        let mut out = RangeSet::new();
        let mut cursor = Some(domain.start);
        for range in &self.ranges {
            let Some(next) = cursor else {
                break;
            };
            if range.end < next {
                continue;
            }
            if range.start > domain.end {
                break;
            }
            if range.start > next {
                out.ranges.push(HeightRange {
                    start: next,
                    end: range.start - 1,
                });
            }
            cursor = range.end.checked_add(1);
        }
        if let Some(next) = cursor {
            if next <= domain.end {
                out.ranges.push(HeightRange {
                    start: next,
                    end: domain.end,
                });
            }
        }
        out
    }

    pub fn subtract(&self, other: &RangeSet) -> RangeSet {
        let mut out = RangeSet::new();
        for range in &self.ranges {
            for piece in other.missing_within(*range).ranges {
                out.ranges.push(piece);
            }
        }
        out
    }
}
