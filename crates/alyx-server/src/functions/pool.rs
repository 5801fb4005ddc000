use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::functions::discovery::Runtime;
use crate::functions::worker::Worker;

/// How a pool spawns its workers.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub runtime: Runtime,
    /// Source pinned at spawn time (Go); `None` for late-loading
    /// runtimes.
    pub preload: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub memory_limit_mb: u64,
}

/// Why an acquire failed.
#[derive(Debug, PartialEq, Eq)]
pub enum AcquireError {
    /// No worker became free within the caller's deadline.
    Exhausted,
    /// The runtime binary could not be started at all.
    Spawn(String),
}

struct PoolState {
    ready: Vec<Worker>,
    /// ready + busy + starting; bounded by `max_instances`.
    total: usize,
    waiters: VecDeque<oneshot::Sender<Worker>>,
}

/// A bounded set of warm workers with FIFO waiters.
///
/// Acquisition pops a ready worker, spawns a new one while under
/// `max_instances`, or queues. Every release hands the worker to the
/// head waiter first, so starvation under burst load is impossible.
pub struct WorkerPool {
    spec: SpawnSpec,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(spec: SpawnSpec, config: PoolConfig) -> Self {
        Self {
            spec,
            config,
            state: Mutex::new(PoolState {
                ready: Vec::new(),
                total: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Brings the pool up to `min_warm`. Called at startup and after
    /// workers are killed; spawn failures are logged and retried on
    /// the next cycle, never fatal.
    pub async fn refill(&self) {
        loop {
            {
                let state = self.state.lock().await;
                if state.total >= self.config.min_warm {
                    return;
                }
            }
            match self.spawn_worker().await {
                Ok(worker) => {
                    let mut state = self.state.lock().await;
                    state.total += 1;
                    Self::hand_over(&mut state, worker);
                }
                Err(e) => {
                    warn!(runtime = %self.spec.runtime, error = %e, "pool refill failed");
                    return;
                }
            }
        }
    }

    /// Acquires a worker within `deadline`.
    pub async fn acquire(&self, deadline: Duration) -> Result<Worker, AcquireError> {
        let receiver = {
            let mut state = self.state.lock().await;
            if let Some(worker) = state.ready.pop() {
                return Ok(worker);
            }
            if state.total < self.config.max_instances {
                state.total += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        match receiver {
            // We reserved a slot; spawn into it.
            None => match self.spawn_worker().await {
                Ok(worker) => Ok(worker),
                Err(e) => {
                    self.state.lock().await.total -= 1;
                    Err(AcquireError::Spawn(e))
                }
            },
            // Wait in line for a release.
            Some(rx) => match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(worker)) => Ok(worker),
                Ok(Err(_)) => Err(AcquireError::Exhausted),
                Err(_) => Err(AcquireError::Exhausted),
            },
        }
    }

    /// Returns a healthy worker after an invocation.
    pub async fn release(&self, mut worker: Worker) {
        worker.idle_since = std::time::Instant::now();
        let mut state = self.state.lock().await;
        Self::hand_over(&mut state, worker);
    }

    /// Removes a dead slot (timeout kill, crash). The worker itself
    /// was consumed by `Worker::kill`; only the accounting remains.
    pub async fn discard(&self) {
        let mut state = self.state.lock().await;
        state.total = state.total.saturating_sub(1);
    }

    /// Drains workers idle past `idle_timeout`, keeping `min_warm`.
    pub async fn reap_idle(&self) {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout);
        let drained: Vec<Worker> = {
            let mut state = self.state.lock().await;
            let mut drained = Vec::new();
            while state.total > self.config.min_warm {
                let Some(pos) = state
                    .ready
                    .iter()
                    .position(|w| w.idle_since.elapsed() > idle_timeout)
                else {
                    break;
                };
                drained.push(state.ready.remove(pos));
                state.total -= 1;
            }
            drained
        };
        for worker in drained {
            debug!(worker = %worker.id, "draining idle worker");
            worker.kill().await;
        }
    }

    /// Kills everything; used at shutdown.
    pub async fn drain(&self) {
        let workers: Vec<Worker> = {
            let mut state = self.state.lock().await;
            state.total = state.total.saturating_sub(state.ready.len());
            state.waiters.clear();
            state.ready.drain(..).collect()
        };
        for worker in workers {
            worker.kill().await;
        }
    }

    /// (ready, total) worker counts.
    pub async fn stats(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.ready.len(), state.total)
    }

    fn hand_over(state: &mut PoolState, worker: Worker) {
        // Head-of-line waiter first; fall back to the ready list when
        // a waiter already gave up.
        let mut worker = worker;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(worker) {
                Ok(()) => return,
                Err(returned) => worker = returned,
            }
        }
        state.ready.push(worker);
    }

    async fn spawn_worker(&self) -> Result<Worker, String> {
        Worker::spawn(
            self.spec.runtime,
            self.spec.preload.as_deref(),
            &self.spec.env,
            self.spec.memory_limit_mb,
        )
        .await
        .map_err(|e| e.to_string())
    }
}
