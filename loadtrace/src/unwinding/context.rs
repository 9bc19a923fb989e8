//! Table-driven x86-64 unwinding on Windows
//!
//! Every non-leaf function in a PE image has a `RUNTIME_FUNCTION` entry in
//! `.pdata`; `RtlVirtualUnwind` replays its prologue backwards on a captured
//! `CONTEXT` to recover the caller's registers.

#![allow(unsafe_code)] // RtlCaptureContext / RtlVirtualUnwind are FFI

use std::ffi::c_void;
use std::ptr;

use windows_sys::Win32::System::Diagnostics::Debug::{
    RtlCaptureContext, RtlLookupFunctionEntry, RtlVirtualUnwind, CONTEXT,
    IMAGE_RUNTIME_FUNCTION_ENTRY, UNW_FLAG_NHANDLER,
};

use super::RawFrame;

/// The `.pdata` entry covering `pc` and the base of its image
fn function_entry(pc: u64) -> Option<(u64, *mut IMAGE_RUNTIME_FUNCTION_ENTRY)> {
    let mut image_base = 0u64;
    // SAFETY: image_base is writable; a null history table is permitted
    let entry = unsafe { RtlLookupFunctionEntry(pc, &mut image_base, ptr::null_mut()) };
    (!entry.is_null()).then_some((image_base, entry))
}

/// Register state of the frame being unwound
pub struct ContextCursor {
    context: CONTEXT,
}

impl ContextCursor {
    /// Snapshot the registers of the calling function.
    ///
    /// Always inlined so the snapshot belongs to the caller's frame.
    #[inline(always)]
    pub fn capture() -> Self {
        // SAFETY: CONTEXT is plain data; all-zero is a valid bit pattern
        let mut context: CONTEXT = unsafe { std::mem::zeroed() };
        // SAFETY: `context` is a properly aligned, writable CONTEXT
        unsafe { RtlCaptureContext(&mut context) };
        Self { context }
    }
}

impl Iterator for ContextCursor {
    type Item = RawFrame;

    fn next(&mut self) -> Option<RawFrame> {
        let control_pc = self.context.Rip;
        if control_pc == 0 {
            return None;
        }

        let (image_base, entry) = function_entry(control_pc)?;

        let mut handler_data: *mut c_void = ptr::null_mut();
        let mut establisher_frame = 0u64;
        // SAFETY: entry was returned for control_pc inside image_base, and the
        // context describes a live frame on this thread's stack
        unsafe {
            RtlVirtualUnwind(
                UNW_FLAG_NHANDLER,
                image_base,
                control_pc,
                entry,
                &mut self.context,
                &mut handler_data,
                &mut establisher_frame,
                ptr::null_mut(),
            );
        }

        let rip = self.context.Rip;
        if rip == 0 {
            return None;
        }

        // SAFETY: a non-null entry points into the image's mapped .pdata
        let function = function_entry(rip)
            .map_or(0, |(base, entry)| base + u64::from(unsafe { (*entry).BeginAddress }));
        Some(RawFrame::new(rip, function))
    }
}
