// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded min/max-in-window filter
//!
//! Tracks the extremum of a signal over a sliding window of "time" (any
//! monotonically increasing u64 works; BBR feeds round-trip counts). The
//! deque keeps candidate extrema in monotonic order: entries dominated by a
//! newer sample are dropped from the back, entries older than the window are
//! expired from the front.

use alloc::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    pub value: u64,
    pub time: u64,
}

#[derive(Clone, Debug)]
pub struct SlidingWindowExtremum {
    entries: VecDeque<Entry>,
    capacity: usize,
    window: u64,
}

impl SlidingWindowExtremum {
    /// Creates a filter covering `window` time units with at most
    /// `capacity` candidate entries
    #[inline]
    pub fn new(window: u64, capacity: usize) -> Self {
        debug_assert!(capacity >= 1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            window,
        }
    }

    /// Returns the current extremum, oldest entry first
    #[inline]
    pub fn get(&self) -> Option<Entry> {
        self.entries.front().copied()
    }

    /// Clears all recorded samples
    #[inline]
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Records a sample into a minimum filter
    #[inline]
    pub fn update_min(&mut self, value: u64, time: u64) {
        self.update(value, time, |candidate, existing| candidate <= existing);
    }

    /// Records a sample into a maximum filter
    #[inline]
    pub fn update_max(&mut self, value: u64, time: u64) {
        self.update(value, time, |candidate, existing| candidate >= existing);
    }

    #[inline]
    fn update(&mut self, value: u64, time: u64, supersedes: impl Fn(u64, u64) -> bool) {
        if let Some(newest) = self.entries.back() {
            // samples older than the newest entry are noise
            ensure!(time >= newest.time);
        }

        // drop dominated entries from the back
        while let Some(newest) = self.entries.back() {
            ensure!(supersedes(value, newest.value), break);
            self.entries.pop_back();
        }

        // expire entries that have aged out of the window
        while let Some(oldest) = self.entries.front() {
            ensure!(oldest.time + self.window < time, break);
            self.entries.pop_front();
        }

        if self.entries.len() < self.capacity {
            self.entries.push_back(Entry { value, time });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window() {
        let mut window = SlidingWindowExtremum::new(100, 3);
        assert_eq!(window.get(), None);

        window.update_min(100, 100);
        assert!(window.get().is_some());

        window.reset();
        assert_eq!(window.get(), None);
    }

    #[test]
    fn sliding_minima() {
        let mut window = SlidingWindowExtremum::new(100, 3);

        // [(200, 200)]
        window.update_min(200, 200);
        assert_eq!(window.get(), Some(Entry { value: 200, time: 200 }));

        // stale samples are ignored
        window.update_min(0, 0);
        window.update_min(1000, 0);
        assert_eq!(window.get(), Some(Entry { value: 200, time: 200 }));

        // [(200, 200), (201, 200), (202, 201)]
        window.update_min(201, 200);
        window.update_min(202, 201);
        assert_eq!(window.get(), Some(Entry { value: 200, time: 200 }));

        // window is full, non-dominating sample is dropped
        window.update_min(1000, 202);
        assert_eq!(window.get(), Some(Entry { value: 200, time: 200 }));

        // same sample later expires the old entries
        // [(202, 201), (1000, 301)]
        window.update_min(1000, 301);
        assert_eq!(window.get(), Some(Entry { value: 202, time: 201 }));

        // a new minimum sweeps out everything
        window.update_min(1, 302);
        assert_eq!(window.get(), Some(Entry { value: 1, time: 302 }));

        // duplicates collapse
        window.update_min(1, 302);
        assert_eq!(window.get(), Some(Entry { value: 1, time: 302 }));
    }

    #[test]
    fn sliding_maxima() {
        let mut window = SlidingWindowExtremum::new(100, 3);

        window.update_max(200, 200);
        assert_eq!(window.get(), Some(Entry { value: 200, time: 200 }));

        window.update_max(0, 0);
        window.update_max(1000, 0);
        assert_eq!(window.get(), Some(Entry { value: 200, time: 200 }));

        // [(200, 200), (199, 200), (198, 201)]
        window.update_max(199, 200);
        window.update_max(198, 201);
        assert_eq!(window.get(), Some(Entry { value: 200, time: 200 }));

        window.update_max(0, 202);
        assert_eq!(window.get(), Some(Entry { value: 200, time: 200 }));

        // [(198, 201), (0, 301)]
        window.update_max(0, 301);
        assert_eq!(window.get(), Some(Entry { value: 198, time: 201 }));

        window.update_max(1000, 302);
        assert_eq!(window.get(), Some(Entry { value: 1000, time: 302 }));

        window.update_max(1000, 302);
        assert_eq!(window.get(), Some(Entry { value: 1000, time: 302 }));
    }
}
