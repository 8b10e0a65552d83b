use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::Error;

use crate::atomic::AtomicEnum;
use crate::error_box::{ErrorBox, InvalidState};

/// A render task, run repeatedly by the worker thread at the configured
/// refresh interval. Panics inside the task are caught and treated as
/// failures.
pub(crate) type Task = Box<dyn FnMut() -> crate::Result<()> + Send + 'static>;

/// States of a worker, from the worker thread's perspective.
///
/// The thread parks on a condvar while `Dormant` and otherwise only ever
/// observes transitions requested by foreground calls through the atomic
/// state. Foreground calls never wait on the condvar themselves; they
/// spin on the state until the requested transition is visible, bounded
/// by one refresh interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    /// Parked, waiting for activation.
    Dormant,
    /// Activation requested; the first frame has not been produced yet.
    Awake,
    /// Cycling: run the task, sleep one interval, repeat.
    Active,
    /// Stop requested; the task runs exactly once more (final frame).
    Suspend,
    /// Stop requested; the task does not run again.
    Halt,
    /// The thread has terminated. Terminal state.
    Dead,
}

impl From<u8> for State {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Dormant,
            1 => Self::Awake,
            2 => Self::Active,
            3 => Self::Suspend,
            4 => Self::Halt,
            _ => Self::Dead,
        }
    }
}
impl From<State> for u8 {
    fn from(value: State) -> Self {
        value as Self
    }
}

struct Shared {
    state: AtomicEnum<State>,
    /// The appointed task. The condvar is paired with this mutex; the
    /// worker thread holds the lock only while checking for dormancy or
    /// running the task, never while sleeping the refresh interval.
    task: Mutex<Option<Task>>,
    wake: Condvar,
    errors: ErrorBox,
}

/// A reusable background execution unit.
///
/// The OS thread is spawned once, when the worker is constructed, and is
/// never recreated while the worker is recycled through the pool; only
/// the task and the state are swapped between assignments. The thread
/// terminates only when the worker itself is dropped.
pub(crate) struct Worker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: AtomicEnum::new(State::Dormant as u8),
            task: Mutex::new(None),
            wake: Condvar::new(),
            errors: ErrorBox::new(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || run(shared))
        };
        log::trace!("render worker thread spawned");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn state(&self) -> State {
        self.shared.state.get()
    }

    /// Whether the thread is currently driving (or winding down) a task.
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            State::Awake | State::Active | State::Suspend | State::Halt
        )
    }

    /// Replace the assigned task. Any running task is halted first, and
    /// the error slot is cleared so stale failures cannot leak into the
    /// new assignment. Fails only by propagating an error the previous
    /// task raised on its way out.
    pub fn appoint(&self, task: Task) -> crate::Result<()> {
        self.halt()?;
        {
            let mut cell = self.shared.task.lock().unwrap_or_else(PoisonError::into_inner);
            *cell = Some(task);
        }
        self.shared.errors.clear();
        Ok(())
    }

    /// Start cycling the task. Synchronous: by the time this returns, the
    /// task has run at least once (the first frame is on screen), or the
    /// failure it raised is returned here.
    pub fn activate(&self) -> crate::Result<()> {
        if self.shared.state.cas(State::Dormant, State::Awake).is_err() {
            return Err(Error::new(InvalidState("worker is not dormant")));
        }
        self.notify();
        self.wait_until(State::Active)
    }

    /// Stop cycling after one final run of the task. No-op on a dormant
    /// worker. Rethrows a failure the task captured in the background.
    pub fn suspend(&self) -> crate::Result<()> {
        loop {
            if let Some(error) = self.shared.errors.take() {
                return Err(error);
            }
            match self.shared.state.get() {
                State::Dormant => return Ok(()),
                State::Dead => {
                    return Err(Error::new(InvalidState("worker thread terminated")));
                }
                s @ (State::Awake | State::Active) => {
                    let _ = self.shared.state.cas(s, State::Suspend);
                }
                State::Suspend | State::Halt => {}
            }
            std::thread::yield_now();
        }
    }

    /// Stop cycling without running the task again. No-op on a dormant
    /// worker. Rethrows a failure the task captured in the background.
    pub fn halt(&self) -> crate::Result<()> {
        loop {
            if let Some(error) = self.shared.errors.take() {
                return Err(error);
            }
            match self.shared.state.get() {
                State::Dormant => return Ok(()),
                State::Dead => {
                    return Err(Error::new(InvalidState("worker thread terminated")));
                }
                s @ (State::Awake | State::Active | State::Suspend) => {
                    let _ = self.shared.state.cas(s, State::Halt);
                }
                State::Halt => {}
            }
            std::thread::yield_now();
        }
    }

    fn wait_until(&self, target: State) -> crate::Result<()> {
        loop {
            if let Some(error) = self.shared.errors.take() {
                return Err(error);
            }
            let state = self.shared.state.get();
            if state == target {
                return Ok(());
            }
            if state == State::Dead {
                return Err(Error::new(InvalidState("worker thread terminated")));
            }
            std::thread::yield_now();
        }
    }

    /// Wake the thread if it is parked. The notification is sent while
    /// holding the task mutex, which serializes with the dormancy check
    /// in the worker loop so the wakeup cannot be lost.
    fn notify(&self) {
        let _cell = self.shared.task.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.wake.notify_all();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shared.state.set(State::Dead);
        self.notify();
        if let Some(thread) = self.thread.take() {
            let _: Result<(), _> = thread.join();
        }
        log::trace!("render worker thread joined");
    }
}

/// The worker thread's loop.
fn run(shared: Arc<Shared>) {
    loop {
        // park while dormant; the condvar only guards this state
        {
            let mut cell = shared.task.lock().unwrap_or_else(PoisonError::into_inner);
            while shared.state.get() == State::Dormant {
                cell = match shared.wake.wait(cell) {
                    Ok(x) => x,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        }
        match shared.state.get() {
            State::Dead => break,
            State::Dormant => {}
            State::Halt => {
                let _ = shared.state.cas(State::Halt, State::Dormant);
            }
            State::Awake => {
                // first frame, then report Active to the waiting caller
                if run_task_once(&shared) {
                    let _ = shared.state.cas(State::Awake, State::Active);
                }
            }
            State::Active => {
                if run_task_once(&shared) {
                    std::thread::sleep(crate::config::refresh_interval());
                }
            }
            State::Suspend => {
                // one final frame before going back to sleep
                run_task_once(&shared);
                let _ = shared.state.cas(State::Suspend, State::Dormant);
            }
        }
    }
    log::trace!("render worker thread exiting");
}

/// Run the task once. Returns `false` if it failed, in which case the
/// state has already been adjusted: back to `Dormant` for a first fault
/// (the thread self-heals and the next foreground call rethrows), or
/// `Dead` for a double fault.
fn run_task_once(shared: &Arc<Shared>) -> bool {
    let result = {
        let mut cell = shared.task.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(task) = cell.as_mut() else {
            // jobless worker; nothing to do
            return true;
        };
        std::panic::catch_unwind(AssertUnwindSafe(task))
    };
    let error = match result {
        Ok(Ok(())) => return true,
        Ok(Err(e)) => e,
        Err(payload) => panic_to_error(payload),
    };
    match shared.errors.put(error) {
        Ok(()) => {
            log::warn!("render task failed, worker going dormant until the error is consumed");
            set_unless_dead(shared, State::Dormant);
        }
        Err(second) => {
            // double fault: the previous failure was never consumed. This
            // is a logic error, not a recoverable condition; the thread
            // terminates and later foreground calls observe Dead.
            log::error!("render task failed again before recovery, worker terminating: {second:#}");
            shared.state.set(State::Dead);
        }
    }
    false
}

/// Store a state from the worker side without ever resurrecting a worker
/// that was ordered to die.
fn set_unless_dead(shared: &Arc<Shared>, new: State) {
    loop {
        let current = shared.state.get();
        if current == State::Dead {
            return;
        }
        if shared.state.cas(current, new).is_ok() {
            return;
        }
    }
}

fn panic_to_error(payload: Box<dyn std::any::Any + Send>) -> Error {
    if let Some(s) = payload.downcast_ref::<&str>() {
        anyhow::anyhow!("render task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        anyhow::anyhow!("render task panicked: {s}")
    } else {
        anyhow::anyhow!("render task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn counting_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn spin_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::yield_now();
        }
        false
    }

    #[test]
    fn state_machine_sequence() {
        let worker = Worker::new();
        assert_eq!(worker.state(), State::Dormant);

        let runs = Arc::new(AtomicUsize::new(0));
        worker.appoint(counting_task(&runs)).unwrap();
        assert_eq!(worker.state(), State::Dormant);

        worker.activate().unwrap();
        // activation is synchronous: the first frame already happened
        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert_eq!(worker.state(), State::Active);

        let before = runs.load(Ordering::SeqCst);
        worker.suspend().unwrap();
        assert_eq!(worker.state(), State::Dormant);
        // suspension runs the task once more for the final frame
        assert!(runs.load(Ordering::SeqCst) > before);

        worker.activate().unwrap();
        assert_eq!(worker.state(), State::Active);
        worker.halt().unwrap();
        assert_eq!(worker.state(), State::Dormant);
        // drop joins the thread
    }

    #[test]
    fn activate_requires_dormancy() {
        let worker = Worker::new();
        let runs = Arc::new(AtomicUsize::new(0));
        worker.appoint(counting_task(&runs)).unwrap();
        worker.activate().unwrap();
        let err = worker.activate().unwrap_err();
        assert!(err.downcast_ref::<InvalidState>().is_some());
        worker.halt().unwrap();
    }

    #[test]
    fn error_rethrown_exactly_once() {
        let worker = Worker::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let task = {
            let attempts = Arc::clone(&attempts);
            Box::new(move || {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("boom");
                }
                Ok(())
            })
        };
        worker.appoint(task).unwrap();

        let err = worker.activate().unwrap_err();
        assert_eq!(err.to_string(), "boom");
        // the thread self-healed: the same worker can run again, and no
        // stale error resurfaces
        worker.activate().unwrap();
        worker.suspend().unwrap();
    }

    #[test]
    fn panic_is_captured_as_error() {
        let worker = Worker::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let task = {
            let attempts = Arc::clone(&attempts);
            Box::new(move || {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("kaboom");
                }
                Ok(())
            })
        };
        worker.appoint(task).unwrap();
        let err = worker.activate().unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        worker.halt().unwrap();
    }

    #[test]
    fn double_fault_terminates_the_thread() {
        let worker = Worker::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let task = {
            let attempts = Arc::clone(&attempts);
            Box::new(move || {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(())
                } else {
                    anyhow::bail!("late failure")
                }
            })
        };
        worker.appoint(task).unwrap();
        worker.activate().unwrap();

        // an unconsumed earlier failure is sitting in the box when the
        // task fails on its next cycle
        worker
            .shared
            .errors
            .put(anyhow::anyhow!("unconsumed"))
            .unwrap();
        assert!(spin_until(Duration::from_secs(5), || {
            worker.state() == State::Dead
        }));

        // the first error is still surfaced, afterwards the worker is gone
        let err = worker.halt().unwrap_err();
        assert_eq!(err.to_string(), "unconsumed");
        let err = worker.halt().unwrap_err();
        assert!(err.downcast_ref::<InvalidState>().is_some());
    }

    #[test]
    fn appoint_replaces_the_task() {
        let worker = Worker::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        worker.appoint(counting_task(&first)).unwrap();
        worker.activate().unwrap();
        worker.appoint(counting_task(&second)).unwrap();
        let stale = first.load(Ordering::SeqCst);
        worker.activate().unwrap();
        worker.suspend().unwrap();
        assert!(second.load(Ordering::SeqCst) >= 1);
        assert_eq!(first.load(Ordering::SeqCst), stale);
    }
}
