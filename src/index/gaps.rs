//! Height range primitives shared by the retriever and the orchestrator.

use crate::index::error::{IndexError, IndexResult};
use std::fmt;

/// Inclusive block-height range that requires (re)ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gap {
    pub start: u64,
    pub stop: u64,
}

impl Gap {
    pub fn new(start: u64, stop: u64) -> Self {
        Self { start, stop }
    }

    /// Number of heights covered by the range.
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (self.stop - self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.stop < self.start
    }

    pub fn contains(&self, height: u64) -> bool {
        height >= self.start && height <= self.stop
    }

    pub fn overlaps(&self, other: &Gap) -> bool {
        self.start <= other.stop && other.start <= self.stop
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.stop)
    }
}

/// Collapses a strictly ascending height list into maximal contiguous ranges.
pub fn compress_to_gaps(sorted_heights: &[u64]) -> Vec<Gap> {
    let mut gaps = Vec::new();
    let Some((&first, rest)) = sorted_heights.split_first() else {
        return gaps;
    };

    let mut current = Gap::new(first, first);
    for &height in rest {
        debug_assert!(height > current.stop, "heights must be strictly ascending");
        if current.stop.checked_add(1) == Some(height) {
            current.stop = height;
        } else {
            gaps.push(current);
            current = Gap::new(height, height);
        }
    }
    gaps.push(current);

    gaps
}

/// Splits an inclusive range into contiguous bins of at most `batch_size` heights.
pub fn height_bins(start: u64, stop: u64, batch_size: usize) -> IndexResult<Vec<Vec<u64>>> {
    if stop < start {
        return Err(IndexError::InvalidRange { start, stop });
    }
    if batch_size == 0 {
        return Err(IndexError::InvalidBatchSize);
    }
    let batch_size = u64::try_from(batch_size).unwrap_or(u64::MAX);

    let mut bins = Vec::new();
    let mut bin_start = start;
    loop {
        let bin_stop = bin_start.saturating_add(batch_size - 1).min(stop);
        bins.push((bin_start..=bin_stop).collect());
        if bin_stop == stop {
            break;
        }
        bin_start = bin_stop + 1;
    }

    Ok(bins)
}

/// Bins every gap in order, skipping (and logging) malformed ranges.
pub fn gaps_to_bins(gaps: &[Gap], batch_size: usize) -> Vec<Vec<u64>> {
    let mut bins = Vec::new();
    for gap in gaps {
        match height_bins(gap.start, gap.stop, batch_size) {
            Ok(mut gap_bins) => bins.append(&mut gap_bins),
            Err(err) => {
                tracing::error!(
                    start = gap.start,
                    stop = gap.stop,
                    error = %err,
                    "skipping malformed height range"
                );
            }
        }
    }
    bins
}
