//! Fixed-capacity line history.

use std::collections::VecDeque;

/// Most recent `capacity` lines, oldest first.
///
/// Pushing into a full ring evicts the oldest line.
#[derive(Debug, Clone)]
pub struct LineRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LineRing {
    /// Create an empty ring. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { lines: VecDeque::with_capacity(capacity), capacity }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Maximum number of retained lines.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lines oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// All lines concatenated, each terminated by `\n`.
    pub fn join(&self) -> String {
        let size = self.lines.iter().map(|line| line.len() + 1).sum();
        let mut out = String::with_capacity(size);
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn empty_ring_joins_to_empty_string() {
        let ring = LineRing::new(4);
        assert!(ring.is_empty());
        assert_eq!(ring.join(), "");
    }

    #[test]
    fn zero_capacity_keeps_one_line() {
        let mut ring = LineRing::new(0);
        ring.push("a".to_string());
        ring.push("b".to_string());
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.join(), "b\n");
    }

    #[test]
    fn wraps_and_keeps_newest() {
        let mut ring = LineRing::new(3);
        for line in ["one", "two", "three", "four", "five"] {
            ring.push(line.to_string());
        }

        let lines: Vec<_> = ring.iter().collect();
        assert_eq!(lines, vec!["three", "four", "five"]);
        assert_eq!(ring.join(), "three\nfour\nfive\n");
    }

    proptest! {
        #[test]
        fn prop_ring_returns_most_recent_lines_in_order(
            capacity in 1usize..32,
            count in 0usize..100,
        ) {
            let mut ring = LineRing::new(capacity);
            for i in 0..count {
                ring.push(format!("line {i}"));
            }

            let expected: Vec<String> =
                (count.saturating_sub(capacity)..count).map(|i| format!("line {i}")).collect();
            let actual: Vec<String> = ring.iter().map(str::to_string).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
