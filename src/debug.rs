//! Debugger state attached lazily to a process: breakpoints and the
//! stepping flag. The stepping preparation itself lives on the process,
//! next to the frame machinery it reads.

use ahash::AHashMap;

use crate::object::Function;
use crate::tagged::Value;
use crate::visitor::PointerVisitor;

pub const NO_BREAKPOINT_ID: i32 = -1;

pub struct Breakpoint {
    function: Value,
    bytecode_index: usize,
    is_one_shot: bool,
    /// Only fire on this coroutine, and only at this operand-stack
    /// height, so a step-over breakpoint ignores recursive re-entries.
    coroutine: Value,
    stack_height: usize,
}

impl Breakpoint {
    pub fn function(&self) -> Function {
        Function::from_value(self.function)
    }

    pub fn bytecode_index(&self) -> usize {
        self.bytecode_index
    }

    pub fn is_one_shot(&self) -> bool {
        self.is_one_shot
    }

    pub fn coroutine(&self) -> Value {
        self.coroutine
    }

    pub fn stack_height(&self) -> usize {
        self.stack_height
    }
}

#[derive(Default)]
pub struct DebugInfo {
    breakpoints: AHashMap<i32, Breakpoint>,
    next_breakpoint_id: i32,
    is_stepping: bool,
}

impl DebugInfo {
    pub fn new() -> DebugInfo {
        DebugInfo::default()
    }

    pub fn set_stepping(&mut self) {
        self.is_stepping = true;
    }

    pub fn clear_stepping(&mut self) {
        self.is_stepping = false;
    }

    pub fn is_stepping(&self) -> bool {
        self.is_stepping
    }

    pub fn set_breakpoint(
        &mut self,
        function: Function,
        bytecode_index: usize,
        one_shot: bool,
        coroutine: Value,
        stack_height: usize,
    ) -> i32 {
        let id = self.next_breakpoint_id;
        self.next_breakpoint_id += 1;
        self.breakpoints.insert(
            id,
            Breakpoint {
                function: function.to_value(),
                bytecode_index,
                is_one_shot: one_shot,
                coroutine,
                stack_height,
            },
        );
        id
    }

    pub fn delete_breakpoint(&mut self, id: i32) -> bool {
        self.breakpoints.remove(&id).is_some()
    }

    pub fn breakpoint(&self, id: i32) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    pub fn number_of_breakpoints(&self) -> usize {
        self.breakpoints.len()
    }

    /// Find a breakpoint matching a bytecode position.
    pub fn breakpoint_at(
        &self,
        function: Function,
        bytecode_index: usize,
    ) -> Option<i32> {
        self.breakpoints.iter().find_map(|(&id, breakpoint)| {
            (breakpoint.function == function.to_value()
                && breakpoint.bytecode_index == bytecode_index)
                .then_some(id)
        })
    }

    /// Roots held by the debugger: qualifying coroutines and the
    /// breakpoints' functions.
    pub fn visit_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        for breakpoint in self.breakpoints.values_mut() {
            visitor.visit(&mut breakpoint.coroutine as *mut Value);
            visitor.visit(&mut breakpoint.function as *mut Value);
        }
    }

    /// The subset of debugger roots living in the program heap.
    pub fn visit_program_pointers(
        &mut self,
        visitor: &mut dyn PointerVisitor,
    ) {
        for breakpoint in self.breakpoints.values_mut() {
            visitor.visit(&mut breakpoint.function as *mut Value);
        }
    }

    /// Re-check breakpoint state after a moving collection rewrote the
    /// function references in place.
    pub fn update_breakpoints(&mut self) {
        debug_assert!(self
            .breakpoints
            .values()
            .all(|breakpoint| breakpoint.function.is_heap_object()));
    }
}
