//! Segment planner - partitions a resource into byte ranges

use shetab_types::{Segment, TransferMode};

/// Ordered segments plus the mode they are fetched in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub mode: TransferMode,
    pub segments: Vec<Segment>,
}

impl SegmentPlan {
    fn stream(size: Option<u64>) -> Self {
        let segment = match size {
            Some(size) if size > 0 => Segment::new(0, 0, size - 1),
            _ => Segment::unbounded(),
        };

        Self {
            mode: TransferMode::Stream,
            segments: vec![segment],
        }
    }
}

/// Calculate segments for a download
///
/// Falls back to a single stream when the server cannot serve ranges, the
/// size is unknown or zero, or the resource is too small to split. Otherwise
/// uses `min(max_segments, size / min_segment_size)` equal segments with the
/// last one taking the remainder.
pub fn plan_segments(
    size: Option<u64>,
    range_supported: bool,
    max_segments: u32,
    min_segment_size: u64,
) -> SegmentPlan {
    let min_segment_size = min_segment_size.max(1);

    let total_size = match size {
        Some(size) if size > 0 && range_supported && size >= min_segment_size => size,
        _ => return SegmentPlan::stream(size),
    };

    let num_segments = (total_size / min_segment_size)
        .min(u64::from(max_segments))
        .max(1);
    if num_segments == 1 {
        return SegmentPlan::stream(size);
    }

    let segment_size = total_size / num_segments;
    let segments = (0..num_segments)
        .map(|i| {
            let start = i * segment_size;
            let end = if i == num_segments - 1 {
                total_size - 1
            } else {
                (i + 1) * segment_size - 1
            };
            Segment::new(i as u32, start, end)
        })
        .collect();

    SegmentPlan {
        mode: TransferMode::Segmented,
        segments,
    }
}
