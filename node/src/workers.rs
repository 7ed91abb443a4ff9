//! Verification worker pool.
//!
//! CPU-heavy checks run off the reactor on a small pool of dedicated
//! threads. Workers only see immutable inputs and a shared stop flag
//! consulted at checkpoints; results come back through a completion queue
//! the reactor drains as [`crate::events::NodeEvent::WorkerDone`] events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use veil_types::BlockHeader;

/// Structural validation of a header run: consecutive heights, matching
/// parent hashes, strictly increasing chain work. Used inline when no pool
/// is configured and by workers otherwise.
pub fn check_header_chain(headers: &[BlockHeader]) -> bool {
    headers.windows(2).all(|w| w[0].is_extended_by(&w[1]))
}

/// Work shipped to the pool.
#[derive(Clone, Debug)]
pub enum JobKind {
    CheckHeaders(Vec<BlockHeader>),
}

/// Completion posted back to the reactor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobDone {
    pub job_id: u64,
    pub outcome: JobOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    HeadersChecked { ok: bool },
    /// The job observed its stop flag and quit early.
    Cancelled,
}

struct Job {
    id: u64,
    stop: Arc<AtomicBool>,
    kind: JobKind,
}

/// Bounded pool of verification threads.
pub struct WorkerPool {
    job_tx: Option<mpsc::Sender<Job>>,
    done_rx: mpsc::Receiver<JobDone>,
    handles: Vec<thread::JoinHandle<()>>,
    next_job_id: u64,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (done_tx, done_rx) = mpsc::channel::<JobDone>();
        let job_rx = Arc::new(std::sync::Mutex::new(job_rx));

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let job_rx = Arc::clone(&job_rx);
            let done_tx = done_tx.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("veil-verify-{i}"))
                    .spawn(move || loop {
                        let job = {
                            let rx = job_rx.lock().expect("worker queue poisoned");
                            rx.recv()
                        };
                        let Ok(job) = job else {
                            return; // pool dropped
                        };
                        let done = run_job(&job);
                        if done_tx.send(done).is_err() {
                            return;
                        }
                    })
                    .expect("spawn verification worker"),
            );
        }

        Self {
            job_tx: Some(job_tx),
            done_rx,
            handles,
            next_job_id: 1,
        }
    }

    /// Submit a job. Returns the job id and its stop flag.
    pub fn submit(&mut self, kind: JobKind) -> (u64, Arc<AtomicBool>) {
        let id = self.next_job_id;
        self.next_job_id += 1;
        let stop = Arc::new(AtomicBool::new(false));
        if let Some(tx) = &self.job_tx {
            let _ = tx.send(Job {
                id,
                stop: Arc::clone(&stop),
                kind,
            });
        }
        (id, stop)
    }

    /// Drain finished jobs without blocking.
    pub fn try_drain(&self) -> Vec<JobDone> {
        let mut done = Vec::new();
        while let Ok(d) = self.done_rx.try_recv() {
            done.push(d);
        }
        done
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the job channel lets every worker's recv() fail and exit.
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_job(job: &Job) -> JobDone {
    match &job.kind {
        JobKind::CheckHeaders(headers) => {
            for window in headers.windows(2) {
                if job.stop.load(Ordering::Relaxed) {
                    return JobDone {
                        job_id: job.id,
                        outcome: JobOutcome::Cancelled,
                    };
                }
                if !window[0].is_extended_by(&window[1]) {
                    return JobDone {
                        job_id: job.id,
                        outcome: JobOutcome::HeadersChecked { ok: false },
                    };
                }
            }
            JobDone {
                job_id: job.id,
                outcome: JobOutcome::HeadersChecked { ok: true },
            }
        }
    }
}
