//! Portable unwinding through the `backtrace` crate
//!
//! The platform unwinder starts inside `backtrace` itself, so the frames up to
//! and including the anchor function are dropped before the cursor is handed
//! to [`walk`](super::walk).

/// Upper bound on frames inside `backtrace` and the anchor itself
const MAX_INTERNAL_FRAMES: usize = 16;

use super::RawFrame;

/// Pre-collected caller frames
pub struct TraceCursor {
    frames: std::vec::IntoIter<RawFrame>,
}

impl TraceCursor {
    /// Collect up to `limit` frames above the frame of `anchor`.
    ///
    /// If the anchor never shows up (stripped unwind tables, inlining) the
    /// whole walk is kept.
    #[inline(always)]
    pub fn capture(anchor: usize, limit: usize) -> Self {
        let mut frames: Vec<RawFrame> = Vec::with_capacity(limit + MAX_INTERNAL_FRAMES);
        let mut anchor_at: Option<usize> = None;

        backtrace::trace(|frame| {
            let function = frame.symbol_address() as usize;
            frames.push(RawFrame::new(frame.ip() as u64, function as u64));
            match anchor_at {
                Some(at) => frames.len() - at <= limit,
                None => {
                    if function == anchor {
                        anchor_at = Some(frames.len() - 1);
                    }
                    frames.len() < limit + MAX_INTERNAL_FRAMES
                }
            }
        });

        let start = anchor_at.map_or(0, |at| at + 1);
        Self { frames: frames.split_off(start.min(frames.len())).into_iter() }
    }
}

impl Iterator for TraceCursor {
    type Item = RawFrame;

    fn next(&mut self) -> Option<RawFrame> {
        self.frames.next()
    }
}
