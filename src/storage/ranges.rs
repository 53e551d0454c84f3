// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt::Write;

/// Sorted, non-overlapping, non-adjacent half-open byte intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }

    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }

    /// Adds `[start, end)`, merging with any interval it touches.
    pub fn add(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut merged = (start, end);
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        let mut inserted = false;

        for &(s, e) in &self.ranges {
            if e < merged.0 {
                result.push((s, e));
            } else if s > merged.1 {
                if !inserted {
                    result.push(merged);
                    inserted = true;
                }
                result.push((s, e));
            } else {
                merged = (merged.0.min(s), merged.1.max(e));
            }
        }
        if !inserted {
            result.push(merged);
        }
        self.ranges = result;
    }

    /// True if every byte of `[start, end)` is present.
    pub fn contains(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        self.ranges.iter().any(|&(s, e)| s <= start && end <= e)
    }

    /// The lowest part of `[start, end)` that is present, if any.
    pub fn first_overlap(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        self.ranges
            .iter()
            .find(|&&(s, e)| s < end && start < e)
            .map(|&(s, e)| (s.max(start), e.min(end)))
    }

    /// Value for `X-Available-Ranges`, e.g. `bytes 0-499, 1000-1999`.
    pub fn to_header_value(&self) -> String {
        let mut value = String::from("bytes");
        for (i, (start, end)) in self.ranges.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            let _ = write!(value, "{}{}-{}", sep, start, end - 1);
        }
        value
    }
}
