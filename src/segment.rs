use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    #[default]
    Queued,
    Downloading,
    Done,
    Failed,
}

/// One inclusive byte range of the remote resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub range_start: u64,
    pub range_end: u64,
    pub received: u64,
    #[serde(default)]
    pub state: SegmentState,
}

impl Segment {
    pub fn new(index: usize, range_start: u64, range_end: u64) -> Self {
        Self {
            index,
            range_start,
            range_end,
            received: 0,
            state: SegmentState::Queued,
        }
    }

    pub fn len(&self) -> u64 {
        self.range_end - self.range_start + 1
    }

    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.received)
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.len()
    }

    /// Absolute offset of the next byte this segment needs.
    pub fn next_offset(&self) -> u64 {
        self.range_start + self.received
    }
}

/// Number of segments for a resource of `total_bytes`.
pub fn decide_segment_count(total_bytes: u64) -> usize {
    match total_bytes {
        n if n < 20 * MIB => 2,
        n if n < 100 * MIB => 4,
        n if n < 500 * MIB => 6,
        _ => 8,
    }
}

/// Splits `[0, total_bytes)` into `count` contiguous inclusive ranges.
/// The last segment absorbs the remainder.
pub fn make_segments(total_bytes: u64, count: usize) -> Vec<Segment> {
    if total_bytes == 0 {
        return vec![];
    }
    // Never hand out empty ranges for tiny resources.
    let count = (count.max(1) as u64).min(total_bytes);
    let part_size = total_bytes / count;

    (0..count)
        .map(|i| {
            let start = i * part_size;
            let end = if i == count - 1 {
                total_bytes - 1
            } else {
                (i + 1) * part_size - 1
            };
            Segment::new(i as usize, start, end)
        })
        .collect()
}

/// True when `segments` are ordered, disjoint and exactly cover `[0, total_bytes)`,
/// with every `received` inside its range length.
pub fn validate_tiling(segments: &[Segment], total_bytes: u64) -> bool {
    if segments.is_empty() || total_bytes == 0 {
        return false;
    }
    let mut expected_start = 0;
    for (i, seg) in segments.iter().enumerate() {
        if seg.index != i || seg.range_start != expected_start || seg.range_end < seg.range_start {
            return false;
        }
        if seg.received > seg.len() {
            return false;
        }
        expected_start = seg.range_end + 1;
    }
    expected_start == total_bytes
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub segments: Vec<Segment>,
    pub reused: bool,
}

/// Reuses durable segment boundaries when the recorded size is unknown or still
/// matches the probed size; otherwise computes a fresh layout.
pub fn plan_segments(
    existing: &[Segment],
    recorded_total: u64,
    probed_total: u64,
    count_override: Option<usize>,
) -> SegmentPlan {
    let size_matches = recorded_total == 0 || recorded_total == probed_total;
    if !existing.is_empty() && size_matches && validate_tiling(existing, probed_total) {
        let segments = existing
            .iter()
            .cloned()
            .map(|mut seg| {
                seg.state = if seg.is_complete() {
                    SegmentState::Done
                } else {
                    SegmentState::Queued
                };
                seg
            })
            .collect();
        return SegmentPlan {
            segments,
            reused: true,
        };
    }

    let count = count_override.unwrap_or_else(|| decide_segment_count(probed_total));
    SegmentPlan {
        segments: make_segments(probed_total, count),
        reused: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_count_follows_size_tiers() {
        assert_eq!(decide_segment_count(1), 2);
        assert_eq!(decide_segment_count(20 * MIB - 1), 2);
        assert_eq!(decide_segment_count(20 * MIB), 4);
        assert_eq!(decide_segment_count(99 * MIB), 4);
        assert_eq!(decide_segment_count(100 * MIB), 6);
        assert_eq!(decide_segment_count(499 * MIB), 6);
        assert_eq!(decide_segment_count(500 * MIB), 8);
        assert_eq!(decide_segment_count(40 * 1024 * MIB), 8);
    }

    #[test]
    fn segments_tile_the_resource_exactly() {
        let sizes = [1, 2, 3, 7, 1000, 1023, 4096, 20 * MIB + 3, 157_286_400, 999_999_937];
        for &total in &sizes {
            for count in [2, 4, 6, 8] {
                let segments = make_segments(total, count);
                assert!(validate_tiling(&segments, total), "total={total} count={count}");
                let covered: u64 = segments.iter().map(Segment::len).sum();
                assert_eq!(covered, total);
                assert!(segments.len() <= count);
            }
        }
    }

    #[test]
    fn last_segment_absorbs_remainder() {
        let segments = make_segments(10, 3);
        assert_eq!(
            segments.iter().map(|s| (s.range_start, s.range_end)).collect::<Vec<_>>(),
            vec![(0, 2), (3, 5), (6, 9)]
        );
    }

    #[test]
    fn scenario_150mb_uses_six_segments() {
        let total = 157_286_400;
        let plan = plan_segments(&[], 0, total, None);
        assert!(!plan.reused);
        assert_eq!(plan.segments.len(), 6);
        assert_eq!(plan.segments[0].range_start, 0);
        assert_eq!(plan.segments[5].range_end, total - 1);
        assert!(validate_tiling(&plan.segments, total));
    }

    #[test]
    fn plan_reuses_matching_segments_with_progress() {
        let mut existing = make_segments(1000, 2);
        existing[0].received = 400;
        existing[1].received = 500;

        let plan = plan_segments(&existing, 1000, 1000, None);
        assert!(plan.reused);
        assert_eq!(plan.segments[0].received, 400);
        assert_eq!(plan.segments[0].state, SegmentState::Queued);
        assert_eq!(plan.segments[1].state, SegmentState::Done);

        let unknown_total = plan_segments(&existing, 0, 1000, None);
        assert!(unknown_total.reused);
    }

    #[test]
    fn plan_recomputes_when_size_changed() {
        let mut existing = make_segments(1000, 2);
        existing[0].received = 400;

        let plan = plan_segments(&existing, 1000, 2000, None);
        assert!(!plan.reused);
        assert!(plan.segments.iter().all(|s| s.received == 0));
        assert!(validate_tiling(&plan.segments, 2000));
    }

    #[test]
    fn tiling_rejects_gaps_and_overruns() {
        let mut segments = make_segments(100, 2);
        segments[1].range_start += 1;
        assert!(!validate_tiling(&segments, 100));

        let mut segments = make_segments(100, 2);
        segments[0].received = segments[0].len() + 1;
        assert!(!validate_tiling(&segments, 100));
    }
}
