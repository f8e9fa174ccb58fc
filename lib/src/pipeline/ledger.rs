//! Assignment of timestamps to decoded pictures.
//!
//! The decoder may return pictures in a different order than their access units were submitted
//! (B-frames). Timestamps are therefore not matched to pictures in FIFO order: every picture
//! takes the smallest pending PTS and the smallest pending DTS. This is only correct as long as
//! the number of pictures in flight stays below the stream's reordering depth, which the small
//! buffer counts of the engines guarantee.
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    /// `None` if no timestamp was pending.
    pub pts: Option<i64>,
    pub dts: Option<i64>,
}

#[derive(Debug, Default)]
pub struct TimestampLedger {
    pts: BinaryHeap<Reverse<i64>>,
    dts: BinaryHeap<Reverse<i64>>,
}

impl TimestampLedger {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record the timestamps of a submitted access unit.
    pub fn push(&mut self, dts: i64, pts: i64) {
        self.pts.push(Reverse(pts));
        self.dts.push(Reverse(dts));
    }

    /// Take the smallest pending timestamps for a picture that just came out.
    pub fn pop(&mut self) -> Timestamps {
        let pts = self.pts.pop().map(|Reverse(t)| t);
        let dts = self.dts.pop().map(|Reverse(t)| t);
        if pts.is_none() || dts.is_none() {
            warn!("Picture decoded with no pending timestamp");
        }

        Timestamps { pts, dts }
    }

    /// Number of submitted access units whose picture has not come out yet.
    pub fn len(&self) -> usize {
        self.pts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pts.is_empty()
    }

    pub fn clear(&mut self) {
        self.pts.clear();
        self.dts.clear();
    }
}
