//! One long-lived worker thread per collection path. Every operation that
//! touches a collection is funneled through its worker, which is what
//! makes the handlers lock-free and gives the sync protocol its ordering
//! guarantee: jobs run strictly in enqueue order.

use crate::collection::Collection;
use crate::error::{Result, SyncError};
use crate::sync::SyncOutput;
use crate::utils::int_time;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// How often the monitor wakes up.
pub const MONITOR_FREQUENCY_SECS: u64 = 15;
/// How long a collection may sit idle before its worker closes it.
pub const MONITOR_INACTIVITY_SECS: i64 = 90;

type Job = Box<dyn FnOnce(&mut WorkerContext) -> Result<SyncOutput> + Send + 'static>;

enum Command {
    Run {
        job: Job,
        reply: Option<oneshot::Sender<Result<SyncOutput>>>,
    },
    /// Close the collection but keep the thread alive.
    Close,
    /// Terminate the thread.
    Stop,
}

/// What a job runs against: the worker's collection slot. The collection
/// opens on first use and may be closed (by the inactivity monitor or a
/// full upload) without stopping the thread.
pub struct WorkerContext {
    path: PathBuf,
    col: Option<Collection>,
}

impl WorkerContext {
    pub fn collection(&mut self) -> Result<&mut Collection> {
        if self.col.is_none() {
            self.col = Some(Collection::open(&self.path)?);
        }
        Ok(self.col.as_mut().expect("collection just opened"))
    }

    pub fn collection_path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.col.is_some()
    }

    /// Saves and drops the open collection, if any. The next
    /// `collection()` call reopens it.
    pub fn close_collection(&mut self) -> Result<()> {
        if let Some(col) = self.col.take() {
            col.close()?;
        }
        Ok(())
    }
}

struct WorkerHandle {
    tx: mpsc::Sender<Command>,
    thread: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    opened: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
    last_activity: Arc<AtomicI64>,
}

struct PoolInner {
    workers: Mutex<HashMap<PathBuf, WorkerHandle>>,
    inactivity_secs: i64,
}

/// Parallel over users, single-threaded per collection.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::with_monitor(
            Duration::from_secs(MONITOR_FREQUENCY_SECS),
            MONITOR_INACTIVITY_SECS,
        )
    }

    pub fn with_monitor(frequency: Duration, inactivity_secs: i64) -> Self {
        let inner = Arc::new(PoolInner {
            workers: Mutex::new(HashMap::new()),
            inactivity_secs,
        });
        spawn_monitor(Arc::downgrade(&inner), frequency);
        Self { inner }
    }

    /// Runs `job` on the worker owning `path` and waits for its result.
    /// Errors raised by the job come back verbatim.
    pub async fn execute<F>(&self, path: impl Into<PathBuf>, job: F) -> Result<SyncOutput>
    where
        F: FnOnce(&mut WorkerContext) -> Result<SyncOutput> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(path.into(), Box::new(job), Some(tx))?;
        rx.await
            .map_err(|_| SyncError::internal("collection worker dropped the request"))?
    }

    /// Fire-and-forget variant; the worker logs and swallows job errors.
    pub fn execute_detached<F>(&self, path: impl Into<PathBuf>, job: F) -> Result<()>
    where
        F: FnOnce(&mut WorkerContext) -> Result<SyncOutput> + Send + 'static,
    {
        self.submit(path.into(), Box::new(job), None)
    }

    fn submit(
        &self,
        path: PathBuf,
        job: Job,
        reply: Option<oneshot::Sender<Result<SyncOutput>>>,
    ) -> Result<()> {
        let mut workers = self
            .inner
            .workers
            .lock()
            .map_err(|_| SyncError::internal("worker map lock poisoned"))?;

        let stale = workers
            .get(&path)
            .map(|w| !w.running.load(Ordering::Acquire))
            .unwrap_or(true);
        if stale {
            // Joining a crashed predecessor here is cheap: its thread has
            // already ended.
            if let Some(mut old) = workers.remove(&path) {
                if let Some(handle) = old.thread.take() {
                    let _ = handle.join();
                }
            }
            workers.insert(path.clone(), spawn_worker(path.clone()));
        }

        let worker = workers.get(&path).expect("worker just ensured");
        worker.queued.fetch_add(1, Ordering::AcqRel);
        worker
            .tx
            .send(Command::Run { job, reply })
            .map_err(|_| SyncError::internal("collection worker is gone"))
    }

    /// Number of live workers, one per collection path.
    pub fn worker_count(&self) -> usize {
        self.inner
            .workers
            .lock()
            .map(|w| w.len())
            .unwrap_or_default()
    }

    /// Stops every worker and waits for the threads to finish.
    pub fn shutdown(&self) {
        let drained: Vec<(PathBuf, WorkerHandle)> = match self.inner.workers.lock() {
            Ok(mut workers) => workers.drain().collect(),
            Err(_) => return,
        };
        for (path, mut worker) in drained {
            let _ = worker.tx.send(Command::Stop);
            if let Some(handle) = worker.thread.take() {
                if handle.join().is_err() {
                    warn!(path = %path.display(), "collection worker panicked during shutdown");
                }
            }
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_worker(path: PathBuf) -> WorkerHandle {
    let (tx, rx) = mpsc::channel::<Command>();
    let running = Arc::new(AtomicBool::new(true));
    let opened = Arc::new(AtomicBool::new(false));
    let queued = Arc::new(AtomicUsize::new(0));
    let last_activity = Arc::new(AtomicI64::new(int_time(1)));

    let thread = {
        let running = Arc::clone(&running);
        let opened = Arc::clone(&opened);
        let queued = Arc::clone(&queued);
        let last_activity = Arc::clone(&last_activity);
        let path = path.clone();
        thread::spawn(move || {
            worker_loop(path, rx, &running, &opened, &queued, &last_activity);
        })
    };

    WorkerHandle {
        tx,
        thread: Some(thread),
        running,
        opened,
        queued,
        last_activity,
    }
}

fn worker_loop(
    path: PathBuf,
    rx: mpsc::Receiver<Command>,
    running: &AtomicBool,
    opened: &AtomicBool,
    queued: &AtomicUsize,
    last_activity: &AtomicI64,
) {
    let mut ctx = WorkerContext {
        path: path.clone(),
        col: None,
    };
    while let Ok(command) = rx.recv() {
        match command {
            Command::Stop => break,
            Command::Close => {
                if let Err(err) = ctx.close_collection() {
                    warn!(path = %path.display(), error = %err, "error closing idle collection");
                }
                opened.store(false, Ordering::Release);
            }
            Command::Run { job, reply } => {
                queued.fetch_sub(1, Ordering::AcqRel);
                last_activity.store(int_time(1), Ordering::Release);

                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| run_job(&mut ctx, job)));
                match outcome {
                    Ok(result) => {
                        opened.store(ctx.is_open(), Ordering::Release);
                        match reply {
                            Some(tx) => {
                                let _ = tx.send(result);
                            }
                            None => {
                                if let Err(err) = result {
                                    error!(path = %path.display(), error = %err,
                                           "detached collection job failed");
                                }
                            }
                        }
                    }
                    Err(_) => {
                        // A panicking job poisons nothing outside this
                        // thread; close up and let the next request get a
                        // fresh worker.
                        error!(path = %path.display(), "collection job panicked; stopping worker");
                        if let Some(tx) = reply {
                            let _ = tx.send(Err(SyncError::internal("collection job panicked")));
                        }
                        let _ = ctx.close_collection();
                        running.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }
    if let Err(err) = ctx.close_collection() {
        warn!(path = %path.display(), error = %err, "error closing collection on stop");
    }
    running.store(false, Ordering::Release);
}

fn run_job(ctx: &mut WorkerContext, job: Job) -> Result<SyncOutput> {
    let output = job(ctx)?;
    if let Some(col) = ctx.col.as_mut() {
        col.save()?;
    }
    Ok(output)
}

/// Closes collections that have sat idle past the inactivity threshold,
/// leaving their threads running. Holds only a weak handle so an
/// abandoned pool can drop cleanly.
fn spawn_monitor(pool: Weak<PoolInner>, frequency: Duration) {
    thread::spawn(move || {
        loop {
            thread::sleep(frequency);
            let Some(inner) = pool.upgrade() else { break };
            let now = int_time(1);
            let Ok(workers) = inner.workers.lock() else { break };
            for (path, worker) in workers.iter() {
                let idle = now - worker.last_activity.load(Ordering::Acquire);
                if worker.running.load(Ordering::Acquire)
                    && worker.opened.load(Ordering::Acquire)
                    && worker.queued.load(Ordering::Acquire) == 0
                    && idle >= inner.inactivity_secs
                {
                    info!(path = %path.display(), idle, "closing inactive collection");
                    let _ = worker.tx.send(Command::Close);
                }
            }
        }
    });
}
