// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::ops::Range;

/// A set of disjoint, non-adjacent `[start, end)` sequence ranges.
///
/// When the set would exceed its capacity, the lowest range is dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeSet {
    /// Map from range start to range end.
    set: BTreeMap<u64, u64>,

    /// The maximum number of ranges kept.
    capacity: usize,
}

impl RangeSet {
    /// Create a new `RangeSet` with the given capacity.
    pub fn new(capacity: usize) -> Self {
        RangeSet {
            set: BTreeMap::new(),
            capacity,
        }
    }

    /// Insert `range`, merging it with overlapping or adjacent ranges.
    pub fn insert(&mut self, mut range: Range<u64>) {
        if range.is_empty() {
            return;
        }

        if let Some((&s, &e)) = self.set.range(..=range.start).next_back() {
            if e >= range.end {
                return;
            }
            if e >= range.start {
                self.set.remove(&s);
                range.start = s;
            }
        }

        loop {
            let next = self
                .set
                .range(range.start..=range.end)
                .next()
                .map(|(&s, &e)| (s, e));
            match next {
                Some((s, e)) => {
                    self.set.remove(&s);
                    range.end = range.end.max(e);
                }
                None => break,
            }
        }

        if self.set.len() >= self.capacity {
            self.set.pop_first();
        }
        self.set.insert(range.start, range.end);
    }

    /// Remove everything below `seq`.
    pub fn remove_until(&mut self, seq: u64) {
        let mut tail = self.set.split_off(&seq);
        if let Some((_, &e)) = self.set.iter().next_back() {
            if e > seq {
                tail.insert(seq, e);
            }
        }
        self.set = tail;
    }

    /// Check whether `range` is fully covered by a single range of the set.
    pub fn covers(&self, range: &Range<u64>) -> bool {
        if range.is_empty() {
            return true;
        }
        match self.set.range(..=range.start).next_back() {
            Some((_, &e)) => e >= range.end,
            None => false,
        }
    }

    /// Return the smallest value in the set.
    pub fn min(&self) -> Option<u64> {
        self.set.iter().next().map(|(&s, _)| s)
    }

    /// Return the largest value in the set.
    pub fn max(&self) -> Option<u64> {
        self.set.iter().next_back().map(|(_, &e)| e - 1)
    }

    /// Return the number of ranges.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Check whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Total number of values covered.
    pub fn covered(&self) -> u64 {
        self.set.iter().map(|(s, e)| e - s).sum()
    }

    /// Iterate the ranges in ascending order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.set.iter().map(|(&s, &e)| s..e)
    }

    /// Remove all ranges.
    pub fn clear(&mut self) {
        self.set.clear();
    }
}
