//! Fuzz target for [`LineRing`]
//!
//! # Strategy
//!
//! - Arbitrary capacities, including zero
//! - Arbitrary push sequences with arbitrary line contents
//!
//! # Invariants
//!
//! - Length never exceeds capacity
//! - Contents are always the most recent pushes, oldest first
//! - `join` is the lines, each followed by `\n`

#![no_main]

use std::collections::VecDeque;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use retrace_log::LineRing;

#[derive(Debug, Arbitrary)]
struct Input {
    capacity: u8,
    lines: Vec<String>,
}

fuzz_target!(|input: Input| {
    let mut ring = LineRing::new(usize::from(input.capacity));
    let capacity = ring.capacity();
    assert!(capacity >= 1, "capacity must be at least one");

    let mut model: VecDeque<String> = VecDeque::new();
    for line in input.lines {
        if model.len() == capacity {
            model.pop_front();
        }
        model.push_back(line.clone());
        ring.push(line);

        assert!(ring.len() <= capacity, "ring grew past capacity");
    }

    let actual: Vec<&str> = ring.iter().collect();
    let expected: Vec<&str> = model.iter().map(String::as_str).collect();
    assert_eq!(actual, expected, "ring diverged from model");

    let joined: String = model.iter().map(|line| format!("{line}\n")).collect();
    assert_eq!(ring.join(), joined);
});
