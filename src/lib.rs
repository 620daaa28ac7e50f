//! glut: the process-and-heap runtime core of a small managed-language
//! virtual machine. Per-process bump-allocated heaps with copying or
//! mark-sweep collection, a program-wide immutable heap collected
//! stop-the-world, growing coroutine stacks that survive moving
//! collections, a remembered set, a two-level dispatch cache, and
//! lock-free interrupt delivery through the stack-limit word.

mod bytecode;
mod debug;
mod flags;
mod frame;
mod gc;
mod heap;
mod links;
mod lookup;
mod mailbox;
mod object;
mod platform;
mod process;
mod program;
mod scheduler;
mod space;
mod store_buffer;
mod system;
mod tagged;
mod visitor;

pub use bytecode::{
    names, IntrinsicsTable, Opcode, Selector, SelectorKind,
    GUARANTEED_FRAME_SIZE,
};
pub use debug::{Breakpoint, DebugInfo, NO_BREAKPOINT_ID};
pub use flags::Flags;
pub use frame::{rebase_frame_pointers, update_frame_pointers, Frame};
pub use gc::{
    GcStrategy, HeapPointerValidator, MarkAndChainStacksVisitor,
    MarkingStack, MarkingVisitor, ScavengeAndChainStacksVisitor,
    ScavengeVisitor, SweepingVisitor,
};
pub use heap::{Heap, SharedHeap, WeakPointerCallback};
pub use links::{Links, Port, ProcessHandle, Signal, SignalKind};
pub use lookup::{
    Entry, LookupCache, ThreadState, PRIMARY_SIZE, SECONDARY_SIZE,
};
pub use mailbox::{
    process_queue_get_channel, process_queue_get_message, Mailbox, Message,
    MessagePayload,
};
pub use object::{
    Array, Boxed, ByteArray, Class, Coroutine, Double, Function, HeapObject,
    Instance, InstanceKind, LargeInteger, OneByteString, Stack,
    TwoByteString, WORD_SIZE,
};
pub use platform::{
    abort_scheduled, get_microseconds, immediate_abort,
    max_stack_size_in_words, schedule_abort, Monitor,
};
pub use process::{
    HeapUsage, Process, ProcessState, StackCheckResult, StackMarker,
    MAX_STACK_MARKER,
};
pub use program::{EventHandler, Program, ProgramState};
pub use scheduler::Scheduler;
pub use space::{
    total_allocated, Chunk, FreeList, NoAllocationFailureScope, Space,
    DEFAULT_MAXIMUM_CHUNK_SIZE, DEFAULT_MINIMUM_CHUNK_SIZE,
};
pub use store_buffer::StoreBuffer;
pub use system::{map_memory, unmap_memory, PAGE_SIZE};
pub use tagged::{Failure, FailureKind, Value, ValueTag};
pub use visitor::{
    HeapObjectPointerVisitor, HeapObjectVisitor, PointerVisitor,
};
