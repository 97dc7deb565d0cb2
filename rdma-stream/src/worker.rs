//! Worker pool and scheduler: a bounded set of OS threads, each owning two
//! independently mutexed halves of session slots.
//!
//! Demand-driven: [`WorkerPool::assign`] tries existing workers first
//! (most recently created first, mirroring the source's reverse scan so a
//! warm worker is reused before a cold one is woken), then spawns a fresh
//! worker, up to [`W_MAX`]. A worker whose halves are both empty sleeps on
//! its own condvar rather than spinning, and is woken either by a new
//! assignment or by [`WorkerPool::join_all`] at shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::outcome::LoopOutcome;
use crate::session::Session;

/// Maximum number of worker threads a pool will allocate.
pub const W_MAX: usize = 128;
/// Maximum sessions one worker may hold, split evenly across its two halves.
pub const SESSIONS_PER_WORKER: usize = 64;
const HALF_CAPACITY: usize = SESSIONS_PER_WORKER / 2;

struct Half {
    sessions: Mutex<Vec<Session>>,
}

impl Half {
    fn new() -> Self {
        Half { sessions: Mutex::new(Vec::with_capacity(HALF_CAPACITY)) }
    }
}

struct WorkerState {
    halves: [Half; 2],
    nsessions: [AtomicUsize; 2],
    cancelled: AtomicBool,
    draining: AtomicBool,
    failed: AtomicBool,
    wake_mutex: Mutex<()>,
    wake: Condvar,
}

impl WorkerState {
    fn new() -> Self {
        WorkerState {
            halves: [Half::new(), Half::new()],
            nsessions: [AtomicUsize::new(0), AtomicUsize::new(0)],
            cancelled: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            wake_mutex: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    fn total_sessions(&self) -> usize {
        self.nsessions[0].load(Ordering::Relaxed) + self.nsessions[1].load(Ordering::Relaxed)
    }

    /// Adds `session` to whichever half has room, waking the worker if it
    /// was sleeping. Returns the session back if both halves are full.
    fn try_assign(&self, session: Session) -> Option<Session> {
        for (index, half) in self.halves.iter().enumerate() {
            let mut guard = half.sessions.lock().expect("half mutex poisoned");
            if guard.len() < HALF_CAPACITY {
                guard.push(session);
                self.nsessions[index].store(guard.len(), Ordering::Relaxed);
                drop(guard);
                let _lock = self.wake_mutex.lock().expect("wake mutex poisoned");
                self.wake.notify_one();
                return None;
            }
        }
        Some(session)
    }

    fn run(&self) {
        log::debug!("worker thread starting");
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                log::debug!("worker thread cancelled");
                return;
            }
            let draining = self.draining.load(Ordering::SeqCst);
            let mut did_work = false;
            for (index, half) in self.halves.iter().enumerate() {
                let Ok(mut guard) = half.sessions.try_lock() else { continue };
                did_work |= !guard.is_empty();
                if draining {
                    for session in guard.iter_mut() {
                        session.cancel();
                    }
                }
                let mut slot = 0;
                while slot < guard.len() {
                    match guard[slot].step() {
                        LoopOutcome::Continue => slot += 1,
                        LoopOutcome::End => {
                            guard.remove(slot);
                        }
                        LoopOutcome::Error(error) => {
                            log::error!("session failed: {error}");
                            self.failed.store(true, Ordering::SeqCst);
                            guard.remove(slot);
                        }
                    }
                }
                self.nsessions[index].store(guard.len(), Ordering::Relaxed);
            }
            if self.total_sessions() == 0 {
                let guard = self.wake_mutex.lock().expect("wake mutex poisoned");
                let _ = self
                    .wake
                    .wait_timeout_while(guard, Duration::from_millis(200), |_| {
                        self.total_sessions() == 0 && !self.cancelled.load(Ordering::SeqCst)
                    })
                    .expect("wake mutex poisoned");
            } else if !did_work {
                thread::yield_now();
            }
        }
    }
}

/// Owns every worker thread spawned for this process.
pub struct WorkerPool {
    workers: Mutex<Vec<Arc<WorkerState>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates an empty pool; workers are allocated on demand by [`assign`](Self::assign).
    pub fn new() -> Self {
        WorkerPool { workers: Mutex::new(Vec::new()), handles: Mutex::new(Vec::new()) }
    }

    /// Assigns `session` to a worker with room, trying running workers
    /// most-recently-created first before spawning a fresh one.
    ///
    /// # Panics
    ///
    /// Panics if every worker is full and the pool has already reached
    /// [`W_MAX`] workers.
    pub fn assign(&self, mut session: Session) {
        let mut workers = self.workers.lock().expect("workers mutex poisoned");
        for worker in workers.iter().rev() {
            match worker.try_assign(session) {
                None => return,
                Some(returned) => session = returned,
            }
        }
        assert!(workers.len() < W_MAX, "worker pool exhausted at {W_MAX} workers");
        let state = Arc::new(WorkerState::new());
        state.try_assign(session);
        let run_state = state.clone();
        let name = format!("rdma-worker-{}", workers.len());
        let handle = thread::Builder::new().name(name).spawn(move || run_state.run()).expect("failed to spawn worker thread");
        self.handles.lock().expect("handles mutex poisoned").push(handle);
        workers.push(state);
        log::info!("worker pool now has {} worker(s)", workers.len());
    }

    /// `true` once every worker has drained all its sessions.
    pub fn is_idle(&self) -> bool {
        let workers = self.workers.lock().expect("workers mutex poisoned");
        workers.iter().all(|w| w.total_sessions() == 0)
    }

    /// Requests every current session cancel gracefully. Unlike
    /// [`join_all`](Self::join_all), this does not stop the worker threads
    /// — callers should poll [`is_idle`](Self::is_idle) and only call
    /// `join_all` once sessions have actually drained (or a timeout
    /// elapses).
    pub fn request_drain(&self) {
        let workers = self.workers.lock().expect("workers mutex poisoned");
        for worker in workers.iter() {
            worker.draining.store(true, Ordering::SeqCst);
            let _lock = worker.wake_mutex.lock().expect("wake mutex poisoned");
            worker.wake.notify_all();
        }
    }

    /// Cancels every worker, joins all threads, and reports whether any
    /// worker observed a session failure.
    pub fn join_all(self) -> bool {
        let workers = self.workers.into_inner().expect("workers mutex poisoned");
        for worker in &workers {
            worker.cancelled.store(true, Ordering::SeqCst);
            let _lock = worker.wake_mutex.lock().expect("wake mutex poisoned");
            worker.wake.notify_all();
        }
        let handles = self.handles.into_inner().expect("handles mutex poisoned");
        for handle in handles {
            let _ = handle.join();
        }
        let failed = workers.iter().any(|w| w.failed.load(Ordering::SeqCst));
        log::info!("worker pool joined, failed={failed}");
        failed
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
