//! A small cooperative task/event loop.
//!
//! Two kinds of work flow through a [`Reactor`]: *tasks*, polled at least once
//! per loop iteration as long as they report themselves runnable, and
//! *events*, one-shot closures drained after a pass over the tasks (or waited
//! for, blocking, when no task ran). Every CPU core in the machine is wrapped
//! in a task; I/O callbacks and deferred work ride in as events.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Something the reactor polls every iteration. `runnable` is checked before
/// each `run`; a task that goes permanently non-runnable (a halted core, a
/// closed fd) should be unregistered with [`Reactor::remove_task`].
pub trait Task {
    fn runnable(&mut self) -> bool;
    fn run(&mut self);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(usize);

/// Readiness reported by an [`FdSource`] poll. The reactor has no real
/// platform `select`; it trusts whatever the registrant's `poll` reports.
#[derive(Debug, Copy, Clone, Default)]
pub struct FdReadiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// The caller-supplied readiness check for one registered file descriptor.
/// Concrete device backends (serial lines, block storage) live above this
/// crate; this trait is the only contract the reactor needs from them.
pub trait FdSource {
    fn poll(&mut self) -> FdReadiness;
}

struct FdEntry {
    fd: i32,
    source: Box<dyn FdSource>,
    on_read: Option<Box<dyn FnMut()>>,
    on_write: Option<Box<dyn FnMut()>>,
    on_error: Option<Box<dyn FnMut()>>,
}

/// Polls every registered fd once per run and fires whichever callbacks its
/// readiness allows. An error callback suppresses read/write for that fd on
/// this pass, mirroring the teacher's `SelectTask`.
struct FdPollTask {
    fds: Vec<FdEntry>,
}

impl FdPollTask {
    fn poll_all(&mut self) {
        for entry in self.fds.iter_mut() {
            let readiness = entry.source.poll();
            if readiness.error {
                if let Some(cb) = entry.on_error.as_mut() {
                    cb();
                }
                continue;
            }
            if readiness.readable {
                if let Some(cb) = entry.on_read.as_mut() {
                    cb();
                }
            }
            if readiness.writable {
                if let Some(cb) = entry.on_write.as_mut() {
                    cb();
                }
            }
        }
    }
}

/// The [`Task`] registered with the reactor for fd polling; a thin handle so
/// `add_fd`/`remove_fd` can keep mutating the shared [`FdPollTask`] directly.
struct FdPollTaskHandle(Rc<RefCell<FdPollTask>>);

impl Task for FdPollTaskHandle {
    fn runnable(&mut self) -> bool {
        true
    }

    fn run(&mut self) {
        self.0.borrow_mut().poll_all();
    }
}

enum Slot {
    Empty,
    Task(Box<dyn Task>),
}

pub struct Reactor {
    tasks: Vec<Slot>,
    events: VecDeque<Box<dyn FnOnce()>>,
    fd_task: Option<(TaskId, Rc<RefCell<FdPollTask>>)>,
}

impl Default for Reactor {
    fn default() -> Reactor {
        Reactor::new()
    }
}

impl Reactor {
    pub fn new() -> Reactor {
        Reactor {
            tasks: Vec::new(),
            events: VecDeque::new(),
            fd_task: None,
        }
    }

    pub fn add_task(&mut self, task: Box<dyn Task>) -> TaskId {
        self.tasks.push(Slot::Task(task));
        TaskId(self.tasks.len() - 1)
    }

    pub fn remove_task(&mut self, id: TaskId) {
        if let Some(slot) = self.tasks.get_mut(id.0) {
            *slot = Slot::Empty;
        }
    }

    pub fn add_event(&mut self, event: Box<dyn FnOnce()>) {
        self.events.push_back(event);
    }

    pub fn add_call(&mut self, f: impl FnOnce() + 'static) {
        self.add_event(Box::new(f));
    }

    /// Register one fd with up to three readiness callbacks. The first
    /// registered fd spins up the shared polling task; later ones reuse it.
    pub fn add_fd(
        &mut self,
        fd: i32,
        source: Box<dyn FdSource>,
        on_read: Option<Box<dyn FnMut()>>,
        on_write: Option<Box<dyn FnMut()>>,
        on_error: Option<Box<dyn FnMut()>>,
    ) {
        let entry = FdEntry { fd, source, on_read, on_write, on_error };
        match self.fd_task.as_ref() {
            Some((_, shared)) => shared.borrow_mut().fds.push(entry),
            None => {
                let shared = Rc::new(RefCell::new(FdPollTask { fds: vec![entry] }));
                let id = self.add_task(Box::new(FdPollTaskHandle(shared.clone())));
                self.fd_task = Some((id, shared));
            }
        }
    }

    pub fn remove_fd(&mut self, fd: i32) {
        let (id, empty) = match self.fd_task.as_ref() {
            Some((id, shared)) => {
                shared.borrow_mut().fds.retain(|e| e.fd != fd);
                (*id, shared.borrow().fds.is_empty())
            }
            None => return,
        };
        if empty {
            self.remove_task(id);
            self.fd_task = None;
        }
    }

    fn live_task_count(&self) -> usize {
        self.tasks.iter().filter(|s| matches!(s, Slot::Task(_))).count()
    }

    pub fn has_tasks(&self) -> bool {
        self.live_task_count() > 0
    }

    /// Run every runnable task once, then drain whatever events are
    /// immediately available (or, if nothing ran, block for exactly one).
    /// Returns `false` when there was nothing left to do at all, the signal
    /// callers use to stop looping.
    pub fn run_once(&mut self) -> bool {
        if !self.has_tasks() {
            return false;
        }

        let mut ran = 0usize;
        for slot in self.tasks.iter_mut() {
            if let Slot::Task(task) = slot {
                if task.runnable() {
                    task.run();
                    ran += 1;
                }
            }
        }

        if ran > 0 {
            while let Some(event) = self.events.pop_front() {
                event();
            }
            true
        } else if let Some(event) = self.events.pop_front() {
            event();
            true
        } else {
            log::warn!(target: "duckyvm::reactor", "no runnable task and no pending event, stopping");
            false
        }
    }

    /// Run the loop until no tasks remain registered.
    pub fn run(&mut self) {
        while self.run_once() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct CountingTask {
        calls: Rc<RefCell<u32>>,
        limit: u32,
    }

    impl Task for CountingTask {
        fn runnable(&mut self) -> bool {
            *self.calls.borrow() < self.limit
        }
        fn run(&mut self) {
            *self.calls.borrow_mut() += 1;
        }
    }

    #[test]
    fn runs_task_until_not_runnable() {
        let calls = Rc::new(RefCell::new(0));
        let mut reactor = Reactor::new();
        reactor.add_task(Box::new(CountingTask { calls: calls.clone(), limit: 3 }));
        reactor.run();
        assert_eq!(*calls.borrow(), 3);
    }

    #[test]
    fn drains_events_after_a_runnable_pass() {
        let fired = Rc::new(RefCell::new(false));
        let fired_clone = fired.clone();
        let calls = Rc::new(RefCell::new(0));
        let mut reactor = Reactor::new();
        reactor.add_task(Box::new(CountingTask { calls: calls.clone(), limit: 1 }));
        reactor.add_call(move || *fired_clone.borrow_mut() = true);
        reactor.run();
        assert!(*fired.borrow());
    }

    #[test]
    fn removed_task_never_runs_again() {
        let calls = Rc::new(RefCell::new(0));
        let mut reactor = Reactor::new();
        let id = reactor.add_task(Box::new(CountingTask { calls: calls.clone(), limit: 100 }));
        reactor.remove_task(id);
        reactor.run();
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn empty_reactor_returns_immediately() {
        let mut reactor = Reactor::new();
        reactor.run();
    }
}
