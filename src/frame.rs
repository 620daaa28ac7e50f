//! Walking the interleaved frames of a suspended coroutine stack.
//!
//! Between bytecodes the interpreter spills its registers onto the stack:
//! the slot at `top` holds the current frame pointer and the current
//! bytecode pointer sits in the frame's bcp slot. Every frame stores the
//! caller's frame pointer, with the frame's bcp slot one word above it
//! (one slot index lower); the bottom frame's link is null.

use crate::object::{Function, Stack, WORD_SIZE};
use crate::tagged::Value;

/// Iterator over the frames of a suspended stack, from the innermost
/// frame outward.
pub struct Frame {
    stack: Stack,
    fp: usize,
}

impl Frame {
    pub fn new(stack: Stack) -> Frame {
        Frame { stack, fp: 0 }
    }

    /// Step to the previous (caller-ward) frame. The first call lands on
    /// the innermost frame. Returns false when there is no frame left.
    pub fn move_previous(&mut self) -> bool {
        let link = if self.fp == 0 {
            self.stack.word_at(self.stack.top())
        } else {
            // SAFETY: fp is a live slot address inside the stack.
            unsafe { *(self.fp as *const usize) }
        };
        if link == 0 {
            return false;
        }
        self.fp = link;
        true
    }

    /// Address of the slot holding the caller link.
    pub fn frame_pointer(&self) -> usize {
        debug_assert_ne!(self.fp, 0, "walker not positioned on a frame");
        self.fp
    }

    pub fn frame_pointer_index(&self) -> usize {
        self.stack.index_of_pointer(self.frame_pointer())
    }

    #[inline]
    fn bcp_slot(&self) -> *mut usize {
        (self.frame_pointer() - WORD_SIZE) as *mut usize
    }

    pub fn byte_code_pointer(&self) -> *const u8 {
        // SAFETY: the bcp slot is one word above the fp slot by layout.
        (unsafe { *self.bcp_slot() }) as *const u8
    }

    pub fn set_byte_code_pointer(&mut self, bcp: *const u8) {
        // SAFETY: the bcp slot is one word above the fp slot by layout.
        unsafe { *self.bcp_slot() = bcp as usize };
    }

    /// Read the bcp slot of a cooked frame: a function reference.
    pub fn cooked_function(&self) -> Function {
        // SAFETY: between cooking and uncooking every bcp slot holds a
        // tagged function reference.
        let value = Value::from_raw(unsafe { *self.bcp_slot() });
        Function::from_value(value)
    }

    /// Replace the bcp slot with a function reference (cooking).
    pub fn set_cooked_function(&mut self, function: Function) {
        // SAFETY: the bcp slot is one word above the fp slot by layout.
        unsafe { *self.bcp_slot() = function.to_value().raw() };
    }

    pub fn function_from_byte_code_pointer(&self) -> Function {
        Function::from_bytecode_pointer(self.byte_code_pointer())
    }
}

/// Shift every frame-pointer link of `stack` by `delta` bytes. Used after
/// the stack's contents moved as one block (a scavenged stack, or a grown
/// stack where the delta also accounts for the length change).
pub fn rebase_frame_pointers(stack: Stack, delta: isize) {
    let mut slot = stack.pointer(stack.top()) as *mut usize;
    loop {
        // SAFETY: the chain only traverses fp slots inside this stack.
        let link = unsafe { *slot };
        if link == 0 {
            break;
        }
        let moved = (link as isize + delta) as usize;
        // SAFETY: same slot as read above.
        unsafe { *slot = moved };
        slot = moved as *mut usize;
    }
}

/// Rewrite the frame-pointer links of `new_stack` (a copy of the live
/// suffix of `old_stack`) so they point into `new_stack`.
pub fn update_frame_pointers(new_stack: Stack, old_stack: Stack) {
    let grown_words = new_stack.length() - old_stack.length();
    let delta = (new_stack.pointer(0) as isize
        - old_stack.pointer(0) as isize)
        + (grown_words * WORD_SIZE) as isize;
    rebase_frame_pointers(new_stack, delta);
}
