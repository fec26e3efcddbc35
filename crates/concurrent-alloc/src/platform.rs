//! Background task execution.
//!
//! [`Platform`] is the seam the stress task schedules itself through.
//! [`WorkerPool`] is a small thread-pool implementation: immediate tasks go
//! over a `crossbeam` channel to the workers, delayed tasks wait in a timer
//! thread's queue until they are due.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

/// A unit of background work.
pub trait Task: Send {
    fn run(self: Box<Self>);
}

pub trait Platform: Send + Sync {
    fn call_on_worker_thread(&self, task: Box<dyn Task>);

    fn call_delayed_on_worker_thread(&self, task: Box<dyn Task>, delay: Duration);
}

struct DelayedTask {
    due: Instant,
    seq: u64,
    task: Box<dyn Task>,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    // Reversed: `BinaryHeap` is a max-heap and the earliest task goes first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    queue: BinaryHeap<DelayedTask>,
    next_seq: u64,
    shutdown: bool,
}

struct PoolInner {
    sender: Mutex<Option<Sender<Box<dyn Task>>>>,
    timer: Mutex<TimerState>,
    timer_cond: Condvar,
}

impl Platform for PoolInner {
    fn call_on_worker_thread(&self, task: Box<dyn Task>) {
        if let Some(sender) = self.sender.lock().as_ref() {
            // Workers only exit after every sender is gone.
            let _ = sender.send(task);
        }
    }

    fn call_delayed_on_worker_thread(&self, task: Box<dyn Task>, delay: Duration) {
        let mut timer = self.timer.lock();
        if timer.shutdown {
            return;
        }
        let seq = timer.next_seq;
        timer.next_seq += 1;
        timer.queue.push(DelayedTask {
            due: Instant::now() + delay,
            seq,
            task,
        });
        self.timer_cond.notify_one();
    }
}

/// A fixed set of worker threads plus one timer thread.
///
/// Dropping the pool runs every task already handed to the workers,
/// discards delayed tasks that are not yet due, and joins all threads.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` worker threads (at least one).
    ///
    /// # Errors
    ///
    /// Fails if a thread cannot be spawned.
    pub fn new(workers: usize) -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded::<Box<dyn Task>>();
        let inner = Arc::new(PoolInner {
            sender: Mutex::new(Some(sender.clone())),
            timer: Mutex::new(TimerState::default()),
            timer_cond: Condvar::new(),
        });

        let workers = (0..workers.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("alloc-worker-{i}"))
                    .spawn(move || worker_loop(&receiver))
            })
            .collect::<io::Result<Vec<_>>>()?;

        let timer_inner = Arc::clone(&inner);
        let timer = thread::Builder::new()
            .name("alloc-timer".to_owned())
            .spawn(move || timer_loop(&timer_inner, &sender))?;

        Ok(Self {
            inner,
            workers,
            timer: Some(timer),
        })
    }

    /// A shareable handle for scheduling onto this pool.
    ///
    /// Tasks scheduled through the handle after the pool is dropped are
    /// discarded.
    #[must_use]
    pub fn handle(&self) -> Arc<dyn Platform> {
        Arc::clone(&self.inner) as Arc<dyn Platform>
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Platform for WorkerPool {
    fn call_on_worker_thread(&self, task: Box<dyn Task>) {
        self.inner.call_on_worker_thread(task);
    }

    fn call_delayed_on_worker_thread(&self, task: Box<dyn Task>, delay: Duration) {
        self.inner.call_delayed_on_worker_thread(task, delay);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let pending = {
            let mut timer = self.inner.timer.lock();
            timer.shutdown = true;
            self.inner.timer_cond.notify_all();
            std::mem::take(&mut timer.queue)
        };
        // Delayed tasks may hold handles to this pool; drop them unlocked.
        drop(pending);

        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        self.inner.sender.lock().take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(receiver: &Receiver<Box<dyn Task>>) {
    while let Ok(task) = receiver.recv() {
        task.run();
    }
}

fn timer_loop(inner: &PoolInner, sender: &Sender<Box<dyn Task>>) {
    let mut timer = inner.timer.lock();
    loop {
        if timer.shutdown {
            return;
        }
        let Some(due) = timer.queue.peek().map(|next| next.due) else {
            inner.timer_cond.wait(&mut timer);
            continue;
        };
        if due > Instant::now() {
            inner.timer_cond.wait_until(&mut timer, due);
            continue;
        }
        if let Some(next) = timer.queue.pop() {
            let _ = sender.send(next.task);
        }
    }
}
