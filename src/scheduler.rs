//! A minimal cooperating scheduler: a ready queue of processes, preempt
//! ticks delivered through the stack-limit word, and the stop/resume
//! handshake the shared-heap collection depends on.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::platform::Monitor;
use crate::process::{Process, ProcessState};
use crate::program::Program;

pub struct Scheduler {
    ready: Mutex<VecDeque<*mut Process>>,
    pause_monitor: Monitor,
}

unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler { ready: Mutex::new(VecDeque::new()), pause_monitor: Monitor::new() }
    }

    pub fn enqueue(&self, process: *mut Process) {
        // SAFETY: the caller owns the process while handing it over.
        unsafe { (*process).set_state(ProcessState::Ready) };
        self.ready.lock().push_back(process);
    }

    /// Hand the next ready process to a worker.
    pub fn dequeue(&self) -> Option<*mut Process> {
        let process = self.ready.lock().pop_front()?;
        // SAFETY: popped from the queue; the worker now owns it.
        unsafe { (*process).set_state(ProcessState::Running) };
        Some(process)
    }

    pub fn has_ready_processes(&self) -> bool {
        !self.ready.lock().is_empty()
    }

    /// Deliver a preempt tick: the process observes it at its next stack
    /// check.
    pub fn preempt(&self, process: *mut Process) {
        // SAFETY: markers are the cross-thread surface of a process.
        unsafe { (*process).preempt() };
    }

    pub fn pause_monitor(&self) -> &Monitor {
        &self.pause_monitor
    }

    /// Park every ready process and mark the program paused. Workers must
    /// have drained (this runtime core is driven cooperatively, so the
    /// ready queue is the only place a schedulable process can be).
    pub fn stop_program(&self, program: &mut Program) {
        let state = program.program_state();
        debug_assert!(!state.is_paused());
        let mut ready = self.ready.lock();
        while let Some(process) = ready.pop_front() {
            // SAFETY: queued processes are owned by the scheduler.
            unsafe { (*process).set_state(ProcessState::Sleeping) };
            state.add_paused_process(process);
        }
        state.set_is_paused(true);
    }

    /// Undo [`Scheduler::stop_program`]: requeue the paused processes and
    /// wake anyone waiting on the pause monitor.
    pub fn resume_program(&self, program: &mut Program) {
        let state = program.program_state();
        debug_assert!(state.is_paused());
        let paused = state.take_paused_processes();
        state.set_is_paused(false);
        for process in paused {
            self.enqueue(process);
        }
        self.pause_monitor.notify_all();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::SignalKind;

    #[test]
    fn ready_queue_is_fifo_and_updates_state() {
        let mut program = Program::new(Default::default());
        let scheduler = Scheduler::new();
        let first = program.spawn_process(std::ptr::null_mut());
        let second = program.spawn_process(std::ptr::null_mut());
        scheduler.enqueue(first);
        scheduler.enqueue(second);
        // SAFETY: single-threaded test.
        unsafe {
            assert_eq!((*first).state(), ProcessState::Ready);
            assert_eq!(scheduler.dequeue(), Some(first));
            assert_eq!((*first).state(), ProcessState::Running);
            assert_eq!(scheduler.dequeue(), Some(second));
            assert_eq!(scheduler.dequeue(), None);
        }
        program.schedule_process_for_deletion(first, SignalKind::Terminated);
        program.schedule_process_for_deletion(second, SignalKind::Terminated);
    }

    #[test]
    fn stop_program_parks_ready_processes_and_resume_requeues_them() {
        let mut program = Program::new(Default::default());
        let scheduler = Scheduler::new();
        let process = program.spawn_process(std::ptr::null_mut());
        scheduler.enqueue(process);

        scheduler.stop_program(&mut program);
        assert!(program.program_state().is_paused());
        assert!(!scheduler.has_ready_processes());

        scheduler.resume_program(&mut program);
        assert!(!program.program_state().is_paused());
        assert_eq!(scheduler.dequeue(), Some(process));
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
    }

    #[test]
    fn shared_collection_runs_under_a_stopped_program() {
        let mut program = Program::new(Default::default());
        let mut scheduler = Scheduler::new();
        program.set_scheduler(&mut scheduler);
        let process = program.spawn_process(std::ptr::null_mut());
        scheduler.enqueue(process);

        program.collect_shared_garbage(false);

        assert!(!program.program_state().is_paused());
        assert!(scheduler.has_ready_processes(), "processes were requeued");
        let _ = scheduler.dequeue();
        program.schedule_process_for_deletion(process, SignalKind::Terminated);
        program.set_scheduler(std::ptr::null_mut());
    }
}
