//! Inter-process identity and death propagation.
//!
//! A [`ProcessHandle`] is the refcounted external identity of a process,
//! decoupled from its lifetime so linking and observation may dangle past
//! termination. A [`Signal`] carries a death notification, holding one
//! reference on the dying process's handle. Ports keep a weak back
//! reference to their owner that termination clears.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::object::Instance;
use crate::process::Process;
use crate::space::Space;
use crate::tagged::Value;

#[repr(isize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalKind {
    Terminated = 0,
    CompileTimeError = 1,
    UncaughtException = 2,
    KilledDueToLink = 3,
}

/// Refcounted external identity of a process.
pub struct ProcessHandle {
    process: Mutex<*mut Process>,
    ref_count: AtomicUsize,
}

// Handles are shared across threads by design; the process pointer is
// only touched under the lock.
unsafe impl Send for ProcessHandle {}
unsafe impl Sync for ProcessHandle {}

impl ProcessHandle {
    pub fn new(process: *mut Process) -> *mut ProcessHandle {
        Box::into_raw(Box::new(ProcessHandle {
            process: Mutex::new(process),
            ref_count: AtomicUsize::new(1),
        }))
    }

    pub fn increment_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference, freeing the handle when it was the last.
    ///
    /// # Safety
    /// `handle` must hold a reference the caller owns.
    pub unsafe fn decrement_ref(handle: *mut ProcessHandle) {
        // SAFETY: the caller's reference keeps the handle alive here.
        let last = unsafe { &*handle }
            .ref_count
            .fetch_sub(1, Ordering::AcqRel)
            == 1;
        if last {
            // SAFETY: refcount reached zero, nobody else observes it.
            drop(unsafe { Box::from_raw(handle) });
        }
    }

    /// After this, linking and sending through the handle fail.
    pub fn owner_process_terminating(&self) {
        *self.process.lock() = std::ptr::null_mut();
    }

    /// Run `action` with the owning process, if it is still alive, while
    /// holding the handle lock so it cannot die concurrently.
    pub fn with_process<R>(
        &self,
        action: impl FnOnce(Option<&mut Process>) -> R,
    ) -> R {
        let guard = self.process.lock();
        // SAFETY: non-null means the process has not terminated, and the
        // lock blocks termination for the duration.
        let process = unsafe { guard.as_mut() };
        action(process)
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Bind this handle into a language-side process object by storing
    /// the pointer as two consecutive smis.
    ///
    /// # Safety
    /// `handle` must stay referenced for as long as the object lives; the
    /// caller registers a finalizer that drops the reference.
    pub unsafe fn initialize_dart_object(
        handle: *mut ProcessHandle,
        object: Instance,
    ) {
        object.set_consecutive_smis(0, handle as usize);
    }

    /// Recover the handle stored by [`ProcessHandle::initialize_dart_object`].
    pub fn from_dart_object(object: Instance) -> *mut ProcessHandle {
        object.get_consecutive_smis(0) as *mut ProcessHandle
    }
}

/// A death notification: which process died and why. Manually refcounted
/// because one signal may be delivered to many mailboxes.
pub struct Signal {
    handle: *mut ProcessHandle,
    kind: SignalKind,
    ref_count: AtomicUsize,
}

unsafe impl Send for Signal {}
unsafe impl Sync for Signal {}

impl Signal {
    /// Create a signal holding one fresh reference on `handle`.
    pub fn new(handle: *mut ProcessHandle, kind: SignalKind) -> *mut Signal {
        // SAFETY: the caller guarantees `handle` is alive.
        unsafe { &*handle }.increment_ref();
        Box::into_raw(Box::new(Signal {
            handle,
            kind,
            ref_count: AtomicUsize::new(1),
        }))
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn handle(&self) -> *mut ProcessHandle {
        self.handle
    }

    pub fn increment_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; the last one releases the handle reference and
    /// frees the signal.
    ///
    /// # Safety
    /// `signal` must hold a reference the caller owns.
    pub unsafe fn decrement_ref(signal: *mut Signal) {
        // SAFETY: the caller's reference keeps the signal alive here.
        let last = unsafe { &*signal }
            .ref_count
            .fetch_sub(1, Ordering::AcqRel)
            == 1;
        if last {
            // SAFETY: refcount reached zero, nobody else observes it.
            let signal = unsafe { Box::from_raw(signal) };
            unsafe { ProcessHandle::decrement_ref(signal.handle) };
        }
    }
}

/// A message endpoint owned by a process. The owner link is weak: process
/// termination clears it, but the port object may outlive the process.
pub struct Port {
    process: Mutex<*mut Process>,
    channel: AtomicUsize,
    ref_count: AtomicUsize,
    next: *mut Port,
}

unsafe impl Send for Port {}
unsafe impl Sync for Port {}

impl Port {
    pub fn new(
        process: *mut Process,
        channel: Value,
        next: *mut Port,
    ) -> *mut Port {
        Box::into_raw(Box::new(Port {
            process: Mutex::new(process),
            channel: AtomicUsize::new(channel.raw()),
            ref_count: AtomicUsize::new(1),
            next,
        }))
    }

    pub fn next(&self) -> *mut Port {
        self.next
    }

    /// The channel object messages on this port are received through, or
    /// the smi zero when the channel was collected.
    pub fn channel(&self) -> Value {
        Value::from_raw(self.channel.load(Ordering::Acquire))
    }

    pub fn set_channel(&self, channel: Value) {
        self.channel.store(channel.raw(), Ordering::Release);
    }

    pub fn owner_process_terminating(&self) {
        *self.process.lock() = std::ptr::null_mut();
    }

    pub fn increment_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// # Safety
    /// `port` must hold a reference the caller owns.
    pub unsafe fn decrement_ref(port: *mut Port) {
        // SAFETY: the caller's reference keeps the port alive here.
        let last = unsafe { &*port }
            .ref_count
            .fetch_sub(1, Ordering::AcqRel)
            == 1;
        if last {
            // SAFETY: refcount reached zero, nobody else observes it.
            drop(unsafe { Box::from_raw(port) });
        }
    }

    /// Mark-sweep variant of [`Port::cleanup_ports`]: nothing moved, so a
    /// channel is dead exactly when it stayed unmarked.
    pub fn cleanup_ports_marked(space: &Space, head: *mut Port) -> *mut Port {
        let mut current = head;
        while !current.is_null() {
            // SAFETY: the owning process keeps the list alive.
            let port = unsafe { &*current };
            let channel = port.channel();
            if channel.is_heap_object() && space.includes(channel.address()) {
                let object = crate::object::HeapObject::from_value(channel);
                if !object.is_marked() {
                    port.set_channel(Value::zero());
                }
            }
            current = port.next;
        }
        head
    }

    /// After a collection, rewrite every port channel that moved and drop
    /// the ones whose channel died. Returns the (unchanged) list head.
    pub fn cleanup_ports(collected: &Space, head: *mut Port) -> *mut Port {
        let mut current = head;
        while !current.is_null() {
            // SAFETY: the owning process keeps the list alive.
            let port = unsafe { &*current };
            let channel = port.channel();
            if channel.is_heap_object()
                && collected.includes(channel.address())
            {
                let object = crate::object::HeapObject::from_value(channel);
                match object.forwarding_address() {
                    Some(forwarded) => {
                        port.set_channel(forwarded.to_value())
                    }
                    None => port.set_channel(Value::zero()),
                }
            }
            current = port.next;
        }
        head
    }
}

/// The processes linked to this one, to be signalled when it dies.
#[derive(Default)]
pub struct Links {
    handles: Vec<*mut ProcessHandle>,
}

unsafe impl Send for Links {}

impl Links {
    /// Link `handle`, taking one reference on it.
    pub fn insert(&mut self, handle: *mut ProcessHandle) {
        if self.handles.contains(&handle) {
            return;
        }
        // SAFETY: the caller guarantees `handle` is alive.
        unsafe { &*handle }.increment_ref();
        self.handles.push(handle);
    }

    pub fn remove(&mut self, handle: *mut ProcessHandle) {
        if let Some(index) = self.handles.iter().position(|&h| h == handle) {
            self.handles.swap_remove(index);
            // SAFETY: insert took a reference that we now return.
            unsafe { ProcessHandle::decrement_ref(handle) };
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Deliver a death signal for `dying` to every linked process, then
    /// drop the links. Nobody can link anymore at this point.
    pub fn notify_linked_processes(
        &mut self,
        dying: *mut ProcessHandle,
        kind: SignalKind,
    ) {
        for handle in self.handles.drain(..) {
            // SAFETY: the list holds a reference on each handle.
            let target = unsafe { &*handle };
            target.with_process(|process| {
                if let Some(process) = process {
                    let signal = Signal::new(dying, kind);
                    process.mailbox().enqueue_process_death(signal);
                }
            });
            // SAFETY: insert took a reference that we now return.
            unsafe { ProcessHandle::decrement_ref(handle) };
        }
    }
}
