//! The mailbox: a multiple-producer, single-consumer queue of messages in
//! arrival order, and the two natives the interpreter calls to drain it.
//!
//! A message is only advanced past once its payload has been materialized
//! into a mutator-visible value; an allocation failure leaves it at the
//! front so the native can be re-entered after a collection.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::heap::Heap;
use crate::links::{Port, ProcessHandle, Signal};
use crate::object::Instance;
use crate::process::Process;
use crate::tagged::{Failure, Value};
use crate::visitor::PointerVisitor;

pub enum MessagePayload {
    /// A tagged value that needs no materialization.
    Immediate(Value),
    /// A reference to a shared-heap object.
    ImmutableObject(Value),
    /// A raw buffer; the finalized variant transfers ownership and
    /// registers a finalizer on materialization.
    Foreign { address: usize, length: usize, finalized: bool },
    /// A 64-bit value, reboxed on the receiving side.
    LargeInteger(i64),
    /// A terminating process's result, together with the heap it lives in.
    Exit { object: Value, heap: Option<Heap> },
    /// A linked process died.
    ProcessDeath(*mut Signal),
}

pub struct Message {
    port: *mut Port,
    payload: MessagePayload,
}

unsafe impl Send for Message {}

impl Message {
    pub fn new(port: *mut Port, payload: MessagePayload) -> Message {
        if !port.is_null() {
            // SAFETY: the sender guarantees the port is alive.
            unsafe { &*port }.increment_ref();
        }
        Message { port, payload }
    }

    fn take_payload(&mut self) -> MessagePayload {
        std::mem::replace(
            &mut self.payload,
            MessagePayload::Immediate(Value::zero()),
        )
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        match self.payload {
            // An unconsumed finalized buffer is owned by the message.
            MessagePayload::Foreign { address, finalized: true, .. } => {
                // SAFETY: ownership was transferred with the message.
                unsafe { libc::free(address as *mut libc::c_void) };
            }
            MessagePayload::ProcessDeath(signal) => {
                // SAFETY: the message holds one signal reference.
                unsafe { Signal::decrement_ref(signal) };
            }
            _ => {}
        }
        if !self.port.is_null() {
            // SAFETY: new() took one port reference.
            unsafe { Port::decrement_ref(self.port) };
        }
    }
}

#[derive(Default)]
pub struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox::default()
    }

    pub fn enqueue(&self, message: Message) {
        self.queue.lock().push_back(message);
    }

    pub fn enqueue_process_death(&self, signal: *mut Signal) {
        self.enqueue(Message::new(
            std::ptr::null_mut(),
            MessagePayload::ProcessDeath(signal),
        ));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Visit the tagged values queued messages carry.
    pub fn iterate_pointers(&self, visitor: &mut dyn PointerVisitor) {
        let mut queue = self.queue.lock();
        for message in queue.iter_mut() {
            match &mut message.payload {
                MessagePayload::Immediate(value)
                | MessagePayload::ImmutableObject(value)
                | MessagePayload::Exit { object: value, .. } => {
                    visitor.visit(value as *mut Value);
                }
                _ => {}
            }
        }
    }

    /// Merge the child heap of every queued exit message into the
    /// receiver's heap, so its objects become collectable as part of it.
    pub fn merge_all_child_heaps(&self, receiver: &mut Heap) {
        let mut queue = self.queue.lock();
        for message in queue.iter_mut() {
            if let MessagePayload::Exit { heap, .. } = &mut message.payload {
                if let Some(mut child) = heap.take() {
                    receiver
                        .space_mut()
                        .prepend_space(child.take_space());
                }
            }
        }
    }
}

/// Pop one message and materialize its payload. Only on successful
/// materialization is the message advanced past; a retry-after-gc failure
/// leaves it queued.
pub fn process_queue_get_message(process: &mut Process) -> Value {
    enum Plan {
        Ready(Value),
        Foreign { address: usize, length: usize, finalized: bool },
        LargeInteger(i64),
        Exit,
        ProcessDeath(*mut Signal),
    }

    let plan = {
        let queue = process.mailbox().queue.lock();
        let Some(message) = queue.front() else {
            return Failure::illegal_state();
        };
        match &message.payload {
            MessagePayload::Immediate(value)
            | MessagePayload::ImmutableObject(value) => Plan::Ready(*value),
            MessagePayload::Foreign { address, length, finalized } => {
                Plan::Foreign {
                    address: *address,
                    length: *length,
                    finalized: *finalized,
                }
            }
            MessagePayload::LargeInteger(value) => {
                Plan::LargeInteger(*value)
            }
            MessagePayload::Exit { .. } => Plan::Exit,
            MessagePayload::ProcessDeath(signal) => {
                Plan::ProcessDeath(*signal)
            }
        }
    };

    let result = match plan {
        Plan::Ready(value) => value,
        Plan::Foreign { address, length, finalized } => {
            let class = process.program().foreign_memory_class();
            debug_assert_eq!(class.number_of_instance_fields(), 4);
            let object = process.new_instance(class, false);
            if object.is_failure() {
                return object;
            }
            let foreign = Instance::from_value(object);
            foreign.set_consecutive_smis(0, address);
            foreign.set_instance_field(
                2,
                Value::from_smi(length as isize),
            );
            if finalized {
                process.register_finalizer(
                    foreign.object(),
                    Process::finalize_foreign,
                );
                process.heap_mut().allocated_foreign_memory(length);
            }
            foreign.to_value()
        }
        Plan::LargeInteger(value) => {
            let result = process.to_integer(value);
            if result.is_failure() {
                return result;
            }
            result
        }
        Plan::Exit => {
            // The child heap may not have been merged by a collection yet;
            // merge now so the carried object is part of this process.
            let mut queue = process.mailbox().queue.lock();
            let message = queue.front_mut().expect("peeked above");
            if let MessagePayload::Exit { object, heap } =
                &mut message.payload
            {
                let object = *object;
                let child = heap.take();
                drop(queue);
                if let Some(mut child) = child {
                    process
                        .heap_mut()
                        .space_mut()
                        .prepend_space(child.take_space());
                }
                object
            } else {
                unreachable!("front changed under the consumer")
            }
        }
        Plan::ProcessDeath(signal) => {
            let process_class = process.program().process_class();
            let death_class = process.program().process_death_class();
            // SAFETY: the queued message holds a signal reference.
            let (handle, kind) =
                unsafe { ((*signal).handle(), (*signal).kind()) };

            let dart_process = process.new_instance(process_class, true);
            if dart_process.is_failure() {
                return dart_process;
            }
            let process_death = process.new_instance(death_class, true);
            if process_death.is_failure() {
                return process_death;
            }

            // SAFETY: the signal's reference keeps the handle alive.
            unsafe { &*handle }.increment_ref();
            let dart_process = Instance::from_value(dart_process);
            // SAFETY: the reference taken just above is owned by the
            // finalizer registered below.
            unsafe {
                ProcessHandle::initialize_dart_object(handle, dart_process)
            };
            let death = Instance::from_value(process_death);
            death.set_instance_field(0, dart_process.to_value());
            death.set_instance_field(1, Value::from_smi(kind as isize));
            process.register_finalizer(
                dart_process.object(),
                Process::finalize_process,
            );
            death.to_value()
        }
    };

    let mut queue = process.mailbox().queue.lock();
    let mut message = queue.pop_front().expect("peeked above");
    // The payload was materialized; its resources now belong to the
    // mutator, so the message must not release them again. The signal of
    // a death message is consumed by the materialization itself.
    if let MessagePayload::ProcessDeath(signal) = message.take_payload() {
        // SAFETY: the message held one signal reference.
        unsafe { Signal::decrement_ref(signal) };
    }
    result
}

/// Peek at the current message's channel, silently dropping messages whose
/// channel has been collected.
pub fn process_queue_get_channel(process: &mut Process) -> Value {
    let null_object = process.program().null_object();
    let mut queue = process.mailbox().queue.lock();
    while let Some(message) = queue.front() {
        if !message.port.is_null() {
            // SAFETY: the message holds a port reference.
            let channel = unsafe { &*message.port }.channel();
            if channel.is_heap_object() {
                return channel;
            }
        }
        queue.pop_front();
    }
    null_object
}
