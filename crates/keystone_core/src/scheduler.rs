//! The authoritative thread.
//!
//! Consumers of protocol events must run where game state may be touched.
//! [`MainThreadScheduler`] is the seam hosts implement to provide that
//! thread; [`TickLoop`] is the built-in implementation, a dedicated OS
//! thread that executes submitted tasks in FIFO order between fixed-rate
//! ticks and also runs delayed and repeating timers.
//!
//! Tasks are isolated from one another: a panicking task is logged and the
//! loop moves on to the next one.

use crate::error::SchedulerError;
use crate::lookup::panic_message;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Work submitted to the authoritative thread.
pub type MainTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs work on the host's authoritative thread.
pub trait MainThreadScheduler: Send + Sync {
    /// Queues `task` behind everything already submitted.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShutDown`] once the thread no longer accepts work.
    /// A task accepted shortly before shutdown may still be dropped unrun.
    fn run_on_main(&self, task: MainTask) -> Result<(), SchedulerError>;

    /// Whether the calling thread is the authoritative thread.
    fn is_main_thread(&self) -> bool;
}

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

enum Command {
    Run(MainTask),
    Schedule(Timer),
    Cancel(TaskId),
    Shutdown,
}

struct Timer {
    id: TaskId,
    due: u64,
    period: Option<u64>,
    task: Box<dyn FnMut() + Send + 'static>,
}

/// Fixed-rate loop on a dedicated thread.
pub struct TickLoop {
    sender: Sender<Command>,
    thread_id: ThreadId,
    current_tick: Arc<AtomicU64>,
    next_task_id: AtomicU64,
    accepting: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TickLoop {
    /// Starts the loop thread.
    ///
    /// # Arguments
    ///
    /// * `tick_interval` - Time between ticks. Timers count in ticks.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Spawn`] if the OS refuses to create the thread.
    pub fn spawn(tick_interval: Duration) -> Result<Self, SchedulerError> {
        let tick_interval = tick_interval.max(Duration::from_millis(1));
        let (sender, receiver) = channel::unbounded();
        let current_tick = Arc::new(AtomicU64::new(0));
        let loop_tick = current_tick.clone();

        let handle = std::thread::Builder::new()
            .name("keystone-main".to_string())
            .spawn(move || run_loop(receiver, tick_interval, loop_tick))
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;

        info!("🕒 Main thread started with tick interval {:?}", tick_interval);

        Ok(Self {
            sender,
            thread_id: handle.thread().id(),
            current_tick,
            next_task_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Number of ticks completed so far.
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::Acquire)
    }

    /// Runs `task` once after `delay_ticks` ticks.
    pub fn run_later<F>(&self, delay_ticks: u64, task: F) -> Result<TaskId, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = Some(task);
        self.schedule(delay_ticks, None, move || {
            if let Some(task) = task.take() {
                task();
            }
        })
    }

    /// Runs `task` after `delay_ticks` ticks and then every `period_ticks`.
    ///
    /// A period of zero is treated as one.
    pub fn run_repeating<F>(
        &self,
        delay_ticks: u64,
        period_ticks: u64,
        task: F,
    ) -> Result<TaskId, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(delay_ticks, Some(period_ticks.max(1)), task)
    }

    /// Cancels a timer. Unknown or finished ids are ignored.
    pub fn cancel(&self, id: TaskId) -> Result<(), SchedulerError> {
        self.send(Command::Cancel(id))
    }

    /// Stops the loop and waits for it to exit.
    ///
    /// Queued tasks that have not started are dropped. Safe to call more
    /// than once and from the loop thread itself, in which case it does not
    /// wait.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(Command::Shutdown);

        if self.is_main_thread() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("Main thread terminated abnormally");
            }
        }
        info!("🛑 Main thread stopped at tick {}", self.current_tick());
    }

    fn schedule<F>(&self, delay: u64, period: Option<u64>, task: F) -> Result<TaskId, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let due = self.current_tick() + delay.max(1);
        self.send(Command::Schedule(Timer {
            id,
            due,
            period,
            task: Box::new(task),
        }))?;
        Ok(id)
    }

    fn send(&self, command: Command) -> Result<(), SchedulerError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        self.sender
            .send(command)
            .map_err(|_| SchedulerError::ShutDown)
    }
}

impl MainThreadScheduler for TickLoop {
    fn run_on_main(&self, task: MainTask) -> Result<(), SchedulerError> {
        self.send(Command::Run(task))
    }

    fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }
}

impl Drop for TickLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TickLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickLoop")
            .field("current_tick", &self.current_tick())
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish()
    }
}

fn run_loop(receiver: Receiver<Command>, tick_interval: Duration, current_tick: Arc<AtomicU64>) {
    let mut timers: Vec<Timer> = Vec::new();
    let mut next_tick = Instant::now() + tick_interval;

    loop {
        let now = Instant::now();
        if now >= next_tick {
            let tick = current_tick.fetch_add(1, Ordering::AcqRel) + 1;
            run_due_timers(&mut timers, tick);
            next_tick += tick_interval;
            if next_tick < now {
                // Fell behind; skip the missed ticks instead of bursting.
                warn!("Main thread fell behind at tick {}", tick);
                next_tick = now + tick_interval;
            }
            continue;
        }

        match receiver.recv_timeout(next_tick - now) {
            Ok(Command::Run(task)) => run_guarded(task),
            Ok(Command::Schedule(timer)) => timers.push(timer),
            Ok(Command::Cancel(id)) => timers.retain(|timer| timer.id != id),
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    debug!("Main loop exiting with {} pending timers", timers.len());
}

fn run_due_timers(timers: &mut Vec<Timer>, tick: u64) {
    let mut index = 0;
    while index < timers.len() {
        if timers[index].due > tick {
            index += 1;
            continue;
        }
        let timer = &mut timers[index];
        let id = timer.id;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (timer.task)())) {
            error!("Timer {:?} panicked: {}", id, panic_message(panic.as_ref()));
        }
        match timer.period {
            Some(period) => {
                timer.due = tick + period;
                index += 1;
            }
            None => {
                timers.swap_remove(index);
            }
        }
    }
}

fn run_guarded(task: MainTask) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
        error!("Main-thread task panicked: {}", panic_message(panic.as_ref()));
    }
}
