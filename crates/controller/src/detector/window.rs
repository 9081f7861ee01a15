//! Sliding probe window

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Last `capacity` probe results of one node, newest at the back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeWindow {
    capacity: usize,
    results: VecDeque<bool>,
    /// Wall clock of the last successful probe
    last_success_ms: Option<i64>,
}

impl ProbeWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            results: VecDeque::with_capacity(capacity),
            last_success_ms: None,
        }
    }

    /// Append a probe result, evicting the oldest one when full
    pub fn record(&mut self, reachable: bool, now_ms: i64) {
        if self.results.len() == self.capacity {
            self.results.pop_front();
        }
        self.results.push_back(reachable);
        if reachable {
            self.last_success_ms = Some(now_ms);
        }
    }

    /// Adopt a new capacity, keeping the newest results
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.results.len() > self.capacity {
            self.results.pop_front();
        }
    }

    /// Unreachable probes at the tail of the window
    pub fn consecutive_failures(&self) -> usize {
        self.results.iter().rev().take_while(|ok| !**ok).count()
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|ok| !**ok).count()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// True after `threshold` consecutive unreachable probes
    pub fn is_candidate(&self, threshold: usize) -> bool {
        threshold > 0 && self.consecutive_failures() >= threshold
    }

    pub fn last_success_ms(&self) -> Option<i64> {
        self.last_success_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_needs_consecutive_failures() {
        let mut window = ProbeWindow::new(5);
        for reachable in [false, false, true, false, false] {
            window.record(reachable, 1);
        }
        assert_eq!(window.failures(), 4);
        assert_eq!(window.consecutive_failures(), 2);
        assert!(!window.is_candidate(3));

        window.record(false, 2);
        assert!(window.is_candidate(3));
        assert_eq!(window.len(), 5);
    }

    #[test]
    fn test_success_resets_streak() {
        let mut window = ProbeWindow::new(3);
        window.record(false, 1);
        window.record(false, 2);
        window.record(true, 3);
        assert_eq!(window.consecutive_failures(), 0);
        assert_eq!(window.last_success_ms(), Some(3));
    }

    #[test]
    fn test_resize_keeps_newest() {
        let mut window = ProbeWindow::new(4);
        for reachable in [true, false, false, false] {
            window.record(reachable, 1);
        }
        window.resize(2);
        assert_eq!(window.len(), 2);
        assert_eq!(window.consecutive_failures(), 2);
    }
}
