//! # Metadata-Driven Stack Unwinding
//!
//! Captures the return addresses of the current call chain without relying
//! on frame pointers. Each step looks up the unwind metadata that covers the
//! current instruction pointer and applies it to recover the caller's
//! instruction pointer, stack pointer and non-volatile registers.
//!
//! ## Stop Conditions
//!
//! The walk ends when either:
//! - no unwind metadata covers the current address (an OS trampoline, or
//!   JIT-generated code that has no static tables), or
//! - `max_depth` frames (at most [`MAX_STACK_DEPTH`]) have been recorded.
//!
//! ## Platform Cursors
//!
//! - **Windows x86-64** (`context`): `RtlCaptureContext`, then
//!   `RtlLookupFunctionEntry` + `RtlVirtualUnwind` per frame (`.pdata`/`.xdata`)
//! - **Everything else** (`trace`): the platform unwinder via the `backtrace`
//!   crate (`.eh_frame` on ELF targets)
//!
//! Both are iterators over [`RawFrame`]s, one unwind step per item; [`walk`]
//! applies the skip/depth rules uniformly so they can be exercised with a
//! synthetic cursor.
//!
//! ## Hiding the Dispatcher
//!
//! A capture taken inside a load notification starts with the unwinder, the
//! tracker and the hook's dispatch function. [`FrameSkip`] names the entry
//! points of that dispatcher by address and everything up to the outermost
//! of them is dropped, whatever inlining did to the frames in between.

#[cfg(all(windows, target_arch = "x86_64"))]
mod context;
#[cfg(not(all(windows, target_arch = "x86_64")))]
mod trace;

use loadtrace_common::MAX_STACK_DEPTH;

use crate::domain::StackFrame;

/// Frames searched for a dispatcher entry before giving up on it
pub const ANCHOR_WINDOW: usize = 32;

/// One unwind step: the caller's instruction pointer and the start of the
/// function containing it (`0` when no metadata names one)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub ip: u64,
    pub function: u64,
}

impl RawFrame {
    #[must_use]
    pub fn new(ip: u64, function: u64) -> Self {
        Self { ip, function }
    }
}

/// Which leading frames a capture hides
///
/// Every frame up to and including the outermost of a contiguous run of
/// `anchors` functions is hidden (the notification dispatcher and whatever
/// it called), then `extra` more. The anchor is matched by function start,
/// so it survives inlining of everything below it. If none shows up within
/// [`ANCHOR_WINDOW`] frames only `extra` frames are hidden.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSkip {
    pub anchors: Vec<u64>,
    pub extra: usize,
}

impl FrameSkip {
    /// Hide a fixed number of frames
    #[must_use]
    pub fn count(frames: usize) -> Self {
        Self { anchors: Vec::new(), extra: frames }
    }

    /// Hide everything through the dispatcher entered at `anchors`, then `extra`
    #[must_use]
    pub fn through(anchors: Vec<u64>, extra: usize) -> Self {
        Self { anchors, extra }
    }

    fn is_anchor(&self, frame: &RawFrame) -> bool {
        frame.function != 0 && self.anchors.contains(&frame.function)
    }

    /// Number of frames of `head` (and beyond) to drop
    #[must_use]
    pub fn hidden(&self, head: &[RawFrame]) -> usize {
        let through = head.iter().position(|f| self.is_anchor(f)).map_or(0, |first| {
            first + head[first..].iter().take_while(|f| self.is_anchor(f)).count()
        });
        through + self.extra
    }
}

/// Source of raw backtraces for the notification pipeline
pub trait StackSource: Send + Sync {
    /// Capture the caller's stack, innermost first, hiding the frames
    /// `skip` selects above the caller of `capture`.
    fn capture(&self, skip: &FrameSkip) -> Vec<StackFrame>;
}

/// Walk `cursor`, discarding the leading frames `skip` selects and recording
/// at most `max_depth` (clamped to [`MAX_STACK_DEPTH`]).
///
/// The cursor yields one caller frame per unwind step and ends when no
/// unwind metadata covers the current frame.
pub fn walk<C>(cursor: C, skip: &FrameSkip, max_depth: usize) -> Vec<StackFrame>
where
    C: Iterator<Item = RawFrame>,
{
    let mut cursor = cursor.fuse();
    let head: Vec<RawFrame> = if skip.anchors.is_empty() {
        Vec::new()
    } else {
        cursor.by_ref().take(ANCHOR_WINDOW).collect()
    };
    let hidden = skip.hidden(&head);

    head.into_iter()
        .chain(cursor)
        .skip(hidden)
        .take(max_depth.min(MAX_STACK_DEPTH))
        .map(|f| StackFrame(f.ip))
        .collect()
}

/// Capture the current call chain, innermost first.
///
/// Frame 0 is the return address into the caller of `capture_stack`.
#[inline(never)]
#[must_use]
pub fn capture_stack(skip: &FrameSkip, max_depth: usize) -> Vec<StackFrame> {
    // kept out of tail position so this frame exists to be hidden
    let frames = capture_below(1, skip, max_depth);
    std::hint::black_box(frames)
}

/// Unwind from the caller of this function, dropping `own_frames` of the
/// crate's own frames before `skip` applies.
#[inline(never)]
fn capture_below(own_frames: usize, skip: &FrameSkip, max_depth: usize) -> Vec<StackFrame> {
    #[cfg(all(windows, target_arch = "x86_64"))]
    let cursor = context::ContextCursor::capture();
    #[cfg(not(all(windows, target_arch = "x86_64")))]
    let cursor = trace::TraceCursor::capture(
        capture_below as usize,
        own_frames + ANCHOR_WINDOW + skip.extra + max_depth,
    );

    walk(cursor.skip(own_frames), skip, max_depth)
}

/// The unwinder of the running platform
#[derive(Debug, Clone, Copy)]
pub struct NativeUnwinder {
    max_depth: usize,
}

impl NativeUnwinder {
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth: max_depth.min(MAX_STACK_DEPTH) }
    }
}

impl Default for NativeUnwinder {
    fn default() -> Self {
        Self::new(MAX_STACK_DEPTH)
    }
}

impl StackSource for NativeUnwinder {
    #[inline(never)]
    fn capture(&self, skip: &FrameSkip) -> Vec<StackFrame> {
        // 1 hides this frame
        let frames = capture_below(1, skip, self.max_depth);
        std::hint::black_box(frames)
    }
}

/// A fixed, pre-recorded stack (hosts replaying captured stacks, and tests)
///
/// Recorded frames carry no function starts, so only counted skips apply.
#[derive(Debug, Clone, Default)]
pub struct FixedStack(pub Vec<StackFrame>);

impl StackSource for FixedStack {
    fn capture(&self, skip: &FrameSkip) -> Vec<StackFrame> {
        walk(self.0.iter().map(|f| RawFrame::new(f.0, 0)), skip, MAX_STACK_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthetic call chain: 0x1000 is innermost, 0x1000 + depth - 1 outermost.
    /// Each frame is its own function, starting 0x10 below its ip.
    fn chain(depth: u64) -> impl Iterator<Item = RawFrame> {
        (0..depth).map(|i| RawFrame::new(0x1000 + i, 0x1000 + i - 0x10))
    }

    fn ips(frames: &[StackFrame]) -> Vec<u64> {
        frames.iter().map(|f| f.0).collect()
    }

    #[test]
    fn test_walk_records_whole_chain_innermost_first() {
        let frames = walk(chain(5), &FrameSkip::default(), MAX_STACK_DEPTH);
        assert_eq!(ips(&frames), vec![0x1000, 0x1001, 0x1002, 0x1003, 0x1004]);
    }

    #[test]
    fn test_walk_skips_innermost_frames() {
        for k in 1..7 {
            let frames = walk(chain(7), &FrameSkip::count(k), MAX_STACK_DEPTH);
            assert_eq!(frames.len(), 7 - k);
            assert_eq!(frames[0].0, 0x1000 + k as u64);
        }
    }

    #[test]
    fn test_walk_skipping_everything_yields_nothing() {
        assert!(walk(chain(3), &FrameSkip::count(3), MAX_STACK_DEPTH).is_empty());
        assert!(walk(chain(3), &FrameSkip::count(10), MAX_STACK_DEPTH).is_empty());
    }

    #[test]
    fn test_walk_stops_at_max_depth() {
        let endless = || (0u64..).map(|ip| RawFrame::new(ip, 0));
        let frames = walk(endless(), &FrameSkip::default(), 1000);
        assert_eq!(frames.len(), MAX_STACK_DEPTH);

        let frames = walk(endless(), &FrameSkip::count(2), 10);
        assert_eq!(frames.len(), 10);
        assert_eq!(frames[0].0, 2);
    }

    #[test]
    fn test_fixed_stack_applies_skip() {
        let stack = FixedStack(vec![StackFrame(1), StackFrame(2), StackFrame(3)]);
        assert_eq!(stack.capture(&FrameSkip::count(1)), vec![StackFrame(2), StackFrame(3)]);
        assert_eq!(stack.capture(&FrameSkip::through(vec![1], 0)).len(), 3);
    }

    #[test]
    fn test_walk_hides_through_dispatcher_run() {
        // 0x1002 and 0x1003 are the dispatcher; 0x1004 is its caller
        let skip = FrameSkip::through(vec![0x1003 - 0x10, 0x1002 - 0x10], 0);
        assert_eq!(ips(&walk(chain(6), &skip, MAX_STACK_DEPTH)), vec![0x1004, 0x1005]);

        let skip = FrameSkip::through(vec![0x1002 - 0x10], 1);
        assert_eq!(ips(&walk(chain(6), &skip, MAX_STACK_DEPTH)), vec![0x1004, 0x1005]);
    }

    #[test]
    fn test_walk_stops_at_first_dispatcher_run() {
        // A nested dispatch further out is part of the cause and is kept
        let skip = FrameSkip::through(vec![0x1001 - 0x10, 0x1004 - 0x10], 0);
        let frames = walk(chain(6), &skip, MAX_STACK_DEPTH);
        assert_eq!(ips(&frames), vec![0x1002, 0x1003, 0x1004, 0x1005]);
    }

    #[test]
    fn test_walk_without_anchor_hides_only_extra() {
        let skip = FrameSkip::through(vec![0xdead], 2);
        assert_eq!(ips(&walk(chain(4), &skip, MAX_STACK_DEPTH)), vec![0x1002, 0x1003]);

        let unknown = (0..4).map(|i| RawFrame::new(0x1000 + i, 0));
        assert_eq!(walk(unknown, &FrameSkip::through(vec![0], 0), MAX_STACK_DEPTH).len(), 4);
    }

    #[test]
    fn test_anchor_beyond_window_is_not_searched() {
        let far = ANCHOR_WINDOW as u64 + 2;
        let skip = FrameSkip::through(vec![0x1000 + far - 0x10], 0);
        assert_eq!(walk(chain(far + 4), &skip, MAX_STACK_DEPTH).len(), (far + 4) as usize);
    }

    #[inline(never)]
    fn dispatcher(skip: &FrameSkip) -> Vec<StackFrame> {
        let frames = handler(skip);
        std::hint::black_box(frames)
    }

    #[inline(never)]
    fn handler(skip: &FrameSkip) -> Vec<StackFrame> {
        let frames = NativeUnwinder::default().capture(skip);
        std::hint::black_box(frames)
    }

    #[test]
    #[cfg(not(windows))]
    fn test_native_unwinder_hides_through_dispatcher() {
        let plain = dispatcher(&FrameSkip::default());
        let anchored = dispatcher(&FrameSkip::through(vec![dispatcher as usize as u64], 0));
        if plain.len() < MAX_STACK_DEPTH {
            // `handler` and `dispatcher` are gone
            assert_eq!(anchored.len() + 2, plain.len());
        }
    }

    #[inline(never)]
    fn nested_capture(depth: usize) -> Vec<StackFrame> {
        if depth == 0 {
            NativeUnwinder::default().capture(&FrameSkip::default())
        } else {
            let frames = nested_capture(depth - 1);
            std::hint::black_box(frames)
        }
    }

    #[test]
    fn test_native_unwinder_sees_recursion() {
        let shallow = nested_capture(0);
        let deep = nested_capture(8);
        assert!(!shallow.is_empty());
        assert!(deep.len() <= MAX_STACK_DEPTH);
        if shallow.len() < MAX_STACK_DEPTH {
            assert!(deep.len() > shallow.len());
        }
    }
}
