//! Offloaded computation for the stanza-processing loop
//!
//! Heavy derived work (today: avatar digest verification) must not run
//! inline in the processing loop. Jobs are handed to a small thread pool
//! and their outcomes are drained back on the core thread, where the
//! connection turns them into events. Workers never touch core state.

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::types::Jid;

// ----------------------------------------------------------------------------
// Work Items
// ----------------------------------------------------------------------------

/// A unit of work submitted to the pool
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// Decode a base64 avatar payload and compute its SHA-1 digest
    VerifyAvatar { jid: Jid, data_b64: String },
}

/// The outcome of a completed work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Digest result; `sha1_hex` is `None` when the payload failed to decode
    AvatarDigest { jid: Jid, sha1_hex: Option<String> },
}

fn run(item: WorkItem) -> WorkOutcome {
    match item {
        WorkItem::VerifyAvatar { jid, data_b64 } => {
            let sha1_hex = BASE64
                .decode(data_b64.as_bytes())
                .ok()
                .map(|decoded| hex::encode(Sha1::digest(&decoded)));
            WorkOutcome::AvatarDigest { jid, sha1_hex }
        }
    }
}

// ----------------------------------------------------------------------------
// Worker Pool
// ----------------------------------------------------------------------------

/// Fixed-size thread pool with a drain-style result path.
///
/// Dropping the pool closes the job queue and joins the workers.
#[derive(Debug)]
pub struct WorkerPool {
    jobs: Option<Sender<WorkItem>>,
    outcomes: Receiver<WorkOutcome>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn a pool with the given number of worker threads (at least one)
    pub fn new(threads: usize) -> Self {
        let (job_tx, job_rx) = channel::<WorkItem>();
        let (outcome_tx, outcome_rx) = channel::<WorkOutcome>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let workers = (0..threads.max(1))
            .map(|index| {
                let job_rx = Arc::clone(&job_rx);
                let outcome_tx = outcome_tx.clone();
                std::thread::Builder::new()
                    .name(format!("warbler-worker-{index}"))
                    .spawn(move || loop {
                        let item = match job_rx.lock() {
                            Ok(rx) => rx.recv(),
                            Err(_) => break,
                        };
                        match item {
                            Ok(item) => {
                                // A closed outcome channel means the pool is gone
                                if outcome_tx.send(run(item)).is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();

        Self {
            jobs: Some(job_tx),
            outcomes: outcome_rx,
            workers,
        }
    }

    /// Submit a job. Returns whether the pool accepted it.
    pub fn submit(&self, item: WorkItem) -> bool {
        match &self.jobs {
            Some(jobs) => jobs.send(item).is_ok(),
            None => false,
        }
    }

    /// Collect every outcome completed so far without blocking
    pub fn drain_completed(&mut self) -> Vec<WorkOutcome> {
        let mut out = Vec::new();
        loop {
            match self.outcomes.try_recv() {
                Ok(outcome) => out.push(outcome),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Block until one outcome arrives. Test helper; the core itself only
    /// ever drains.
    pub fn wait_one(&mut self) -> Option<WorkOutcome> {
        self.outcomes.recv().ok()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avatar_digest() {
        let mut pool = WorkerPool::new(1);
        let jid = Jid::bare("user", "example.com");

        // "hello" in base64; its SHA-1 is well known
        assert!(pool.submit(WorkItem::VerifyAvatar {
            jid: jid.clone(),
            data_b64: "aGVsbG8=".into(),
        }));

        let outcome = pool.wait_one().unwrap();
        assert_eq!(
            outcome,
            WorkOutcome::AvatarDigest {
                jid,
                sha1_hex: Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d".into()),
            }
        );
    }

    #[test]
    fn test_bad_base64_reports_none() {
        let mut pool = WorkerPool::new(1);
        let jid = Jid::bare("user", "example.com");
        pool.submit(WorkItem::VerifyAvatar {
            jid: jid.clone(),
            data_b64: "not base64 at all!".into(),
        });

        match pool.wait_one().unwrap() {
            WorkOutcome::AvatarDigest { sha1_hex, .. } => assert!(sha1_hex.is_none()),
        }
    }

    #[test]
    fn test_drain_is_nonblocking_when_idle() {
        let mut pool = WorkerPool::new(2);
        assert!(pool.drain_completed().is_empty());
    }
}
