//! Worker pool for asynchronous tile data jobs
//!
//! A fixed set of worker threads drains a channel of boxed closures. Each
//! submitted job gets a shared [`JobHandle`] carrying a unique id, a
//! cooperative cancellation flag and an atomic status. Cancellation is
//! best-effort: a job cancelled before a worker picks it up never runs, a
//! job cancelled mid-run finishes but reports `Cancelled`. Consumers must
//! treat the handle identity check, not cancellation, as the authoritative
//! guard against stale results.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use crate::error::EngineResult;

/// Lifecycle of a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Cancelled,
    Failed,
}

impl JobStatus {
    fn from_u8(value: u8) -> JobStatus {
        match value {
            0 => JobStatus::Queued,
            1 => JobStatus::Running,
            2 => JobStatus::Finished,
            3 => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Finished => 2,
            JobStatus::Cancelled => 3,
            JobStatus::Failed => 4,
        }
    }
}

/// Shared handle to a submitted job
#[derive(Debug)]
pub struct JobHandle {
    id: u64,
    cancelled: AtomicBool,
    status: AtomicU8,
}

impl JobHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            cancelled: AtomicBool::new(false),
            status: AtomicU8::new(JobStatus::Queued.as_u8()),
        }
    }

    /// Unique id; consumers compare it to detect stale completions.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request cancellation. Queued jobs will not run; running jobs finish
    /// but report `Cancelled`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// True once the job can never touch shared state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status(),
            JobStatus::Finished | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    fn set_status(&self, status: JobStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    #[allow(dead_code)]
    id: usize,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Worker {
        let handle = thread::spawn(move || loop {
            let receiver = receiver.lock().unwrap();
            match receiver.recv() {
                Ok(job) => {
                    drop(receiver); // Release lock before executing
                    job();
                }
                Err(_) => break, // Channel closed
            }
        });

        Worker {
            id,
            handle: Some(handle),
        }
    }
}

/// Fixed-size worker pool executing tile data jobs
pub struct JobManager {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
    next_id: AtomicU64,
}

impl JobManager {
    /// Spawn `size` worker threads (0 = one per available core).
    pub fn new(size: usize) -> Self {
        let size = if size == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            size
        };

        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            workers.push(Worker::new(id, Arc::clone(&receiver)));
        }
        log::debug!("job manager started with {} workers", size);

        Self {
            workers,
            sender: Some(sender),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Submit a job. The closure receives its own handle so it can poll the
    /// cancellation flag at safe points. A fetch error marks the handle
    /// `Failed`; the error itself is the job's to log, the pool only records
    /// the outcome.
    pub fn submit<F>(&self, job: F) -> Arc<JobHandle>
    where
        F: FnOnce(&JobHandle) -> EngineResult<()> + Send + 'static,
    {
        let handle = Arc::new(JobHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst)));
        let worker_handle = Arc::clone(&handle);

        let wrapped: Job = Box::new(move || {
            if worker_handle.is_cancelled() {
                worker_handle.set_status(JobStatus::Cancelled);
                return;
            }
            worker_handle.set_status(JobStatus::Running);
            let result = job(&worker_handle);
            let status = if worker_handle.is_cancelled() {
                JobStatus::Cancelled
            } else {
                match result {
                    Ok(()) => JobStatus::Finished,
                    Err(err) => {
                        log::warn!("job {} failed: {}", worker_handle.id(), err);
                        JobStatus::Failed
                    }
                }
            };
            worker_handle.set_status(status);
        });

        if let Some(sender) = self.sender.as_ref() {
            if sender.send(wrapped).is_err() {
                // Workers are gone; nothing will ever run this job.
                handle.set_status(JobStatus::Cancelled);
            }
        }
        handle
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        // Close the channel so workers drain and exit.
        drop(self.sender.take());

        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                handle
                    .join()
                    .unwrap_or_else(|_| log::error!("worker thread panicked"));
            }
        }
    }
}
