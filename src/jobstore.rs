//!
//! tundra job store
//! ----------------
//! Durable FIFO of reconciliation Jobs with lifecycle enforcement and
//! per-tenant live watching. The store owns three invariants:
//!
//! - at most one Job per CID is in Queued or Executing at any instant;
//!   a newer Queued push supersedes (cancels) an older Queued one, and an
//!   Executing holder rejects new enqueues with a precondition error;
//! - a Job that was Executing reaches exactly one terminal status, and a
//!   terminal Job never changes again;
//! - queue order survives restarts: the FIFO index and the executing set
//!   are persisted, so recovery can re-adopt in-flight work.
//!
//! It also carries the started-deals side table the cold pipeline uses to
//! survive crashes between deal submission and deal watching.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::datastore::{BatchOp, Datastore};
use crate::error::AppError;
use crate::types::{ApiId, Cid, DealError, DealInfo, FilStorage, Job, JobId, JobStatus};

const WATCHER_BUFFER: usize = 256;

/// Error cause recorded on a Queued job canceled by a newer push.
pub const SUPERSEDED_CAUSE: &str = "superseded";

fn job_key(jid: &JobId) -> String {
    format!("job/{jid}")
}

fn queue_key(seq: u64) -> String {
    format!("queue/{seq:020}")
}

fn queued_cid_key(cid: &Cid) -> String {
    format!("queued-cid/{cid}")
}

fn executing_key(cid: &Cid) -> String {
    format!("executing/{cid}")
}

fn started_deals_key(cid: &Cid) -> String {
    format!("started-deals/{cid}")
}

#[derive(Serialize, Deserialize)]
struct QueuedMarker {
    jid: JobId,
    seq: u64,
}

struct WatcherEntry {
    id: u64,
    api_id: ApiId,
    tx: mpsc::Sender<Job>,
}

/// Datastore-backed job store. All mutations run under one mutex so the
/// queue/lifecycle indices can never diverge from the job records.
pub struct JobStore {
    ds: Arc<dyn Datastore>,
    write_lock: Mutex<()>,
    next_seq: AtomicU64,
    next_watcher_id: AtomicU64,
    watchers: Arc<Mutex<Vec<WatcherEntry>>>,
}

impl JobStore {
    pub fn new(ds: Arc<dyn Datastore>) -> Result<Self> {
        // Recover the FIFO counter from the highest persisted queue key.
        let mut max_seq = 0u64;
        for (key, _) in ds.query_prefix("queue/")? {
            if let Some(seq) = key.strip_prefix("queue/").and_then(|s| s.parse::<u64>().ok()) {
                max_seq = max_seq.max(seq + 1);
            }
        }
        Ok(JobStore {
            ds,
            write_lock: Mutex::new(()),
            next_seq: AtomicU64::new(max_seq),
            next_watcher_id: AtomicU64::new(0),
            watchers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Enqueue a freshly-created Queued job. If another Queued job exists
    /// for the same CID it is canceled as superseded; if an Executing job
    /// holds the CID the enqueue is rejected.
    pub fn enqueue(&self, job: Job) -> Result<()> {
        if job.status != JobStatus::Queued {
            return Err(anyhow!("can't enqueue job {} with status {}", job.id, job.status));
        }
        let _g = self.write_lock.lock();

        if self.ds.has(&executing_key(&job.cid))? {
            return Err(anyhow!(AppError::precondition(format!(
                "cid {} has an executing job, retry when it finalizes",
                job.cid
            ))));
        }

        let mut ops = Vec::new();
        let mut superseded: Option<Job> = None;
        if let Some(buf) = self.ds.get(&queued_cid_key(&job.cid))? {
            let marker: QueuedMarker =
                serde_json::from_slice(&buf).context("decoding queued-cid marker")?;
            let mut prior = self
                .get(&marker.jid)?
                .ok_or_else(|| anyhow!("queued-cid marker points at missing job {}", marker.jid))?;
            debug!(target: "tundra::jobstore", "job {} for {} superseded by {}", prior.id, job.cid, job.id);
            prior.status = JobStatus::Canceled;
            prior.err_cause = Some(SUPERSEDED_CAUSE.to_string());
            ops.push(BatchOp::Put {
                key: job_key(&prior.id),
                value: serde_json::to_vec(&prior).context("encoding superseded job")?,
            });
            ops.push(BatchOp::Delete { key: queue_key(marker.seq) });
            superseded = Some(prior);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        ops.push(BatchOp::Put {
            key: job_key(&job.id),
            value: serde_json::to_vec(&job).context("encoding job")?,
        });
        ops.push(BatchOp::Put {
            key: queue_key(seq),
            value: job.id.as_str().as_bytes().to_vec(),
        });
        ops.push(BatchOp::Put {
            key: queued_cid_key(&job.cid),
            value: serde_json::to_vec(&QueuedMarker { jid: job.id.clone(), seq })
                .context("encoding queued-cid marker")?,
        });
        self.ds.batch(ops).context("persisting enqueue")?;

        if let Some(prior) = superseded {
            self.notify(&prior);
        }
        self.notify(&job);
        Ok(())
    }

    /// Promote the oldest Queued job whose CID has no Executing peer.
    /// Returns None when no job is eligible.
    pub fn dequeue(&self) -> Result<Option<Job>> {
        let _g = self.write_lock.lock();
        for (key, val) in self.ds.query_prefix("queue/")? {
            let jid = JobId(String::from_utf8_lossy(&val).to_string());
            let Some(mut job) = self.get(&jid)? else {
                warn!(target: "tundra::jobstore", "queue entry {} points at missing job {}", key, jid);
                self.ds.delete(&key)?;
                continue;
            };
            if self.ds.has(&executing_key(&job.cid))? {
                // Another job holds this CID; look further down the queue.
                continue;
            }
            job.status = JobStatus::Executing;
            self.ds
                .batch(vec![
                    BatchOp::Put {
                        key: job_key(&job.id),
                        value: serde_json::to_vec(&job).context("encoding job")?,
                    },
                    BatchOp::Delete { key },
                    BatchOp::Delete { key: queued_cid_key(&job.cid) },
                    BatchOp::Put {
                        key: executing_key(&job.cid),
                        value: job.id.as_str().as_bytes().to_vec(),
                    },
                ])
                .context("persisting dequeue")?;
            self.notify(&job);
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// Move an Executing job to a terminal status, recording the error
    /// cause, per-miner deal errors, and the terminal state of the deals
    /// the job drove.
    pub fn finalize(
        &self,
        jid: &JobId,
        status: JobStatus,
        err_cause: Option<String>,
        deal_errors: Vec<DealError>,
        deal_info: Vec<DealInfo>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(anyhow!("finalize requires a terminal status, got {status}"));
        }
        let _g = self.write_lock.lock();
        let mut job = self
            .get(jid)?
            .ok_or_else(|| anyhow!(AppError::not_found(format!("job {jid} not found"))))?;
        if job.status != JobStatus::Executing {
            return Err(anyhow!(
                "job {} is {}, only executing jobs can be finalized",
                jid,
                job.status
            ));
        }
        job.status = status;
        job.err_cause = err_cause;
        job.deal_errors = deal_errors;
        job.deal_info = deal_info;
        self.ds
            .batch(vec![
                BatchOp::Put {
                    key: job_key(&job.id),
                    value: serde_json::to_vec(&job).context("encoding job")?,
                },
                BatchOp::Delete { key: executing_key(&job.cid) },
            ])
            .context("persisting finalize")?;
        self.notify(&job);
        Ok(())
    }

    /// Cancel a job that is still Queued: removes it from the queue and
    /// finalizes it as Canceled without it ever executing.
    pub fn cancel_queued(&self, jid: &JobId, cause: &str) -> Result<()> {
        let _g = self.write_lock.lock();
        let mut job = self
            .get(jid)?
            .ok_or_else(|| anyhow!(AppError::not_found(format!("job {jid} not found"))))?;
        if job.status != JobStatus::Queued {
            return Err(anyhow!(AppError::precondition(format!(
                "job {} is {}, only queued jobs can be canceled here",
                jid, job.status
            ))));
        }
        let marker: QueuedMarker = self
            .ds
            .get(&queued_cid_key(&job.cid))?
            .map(|buf| serde_json::from_slice(&buf))
            .transpose()
            .context("decoding queued-cid marker")?
            .ok_or_else(|| anyhow!("queued job {} has no queue marker", jid))?;
        job.status = JobStatus::Canceled;
        job.err_cause = Some(cause.to_string());
        self.ds
            .batch(vec![
                BatchOp::Put {
                    key: job_key(&job.id),
                    value: serde_json::to_vec(&job).context("encoding job")?,
                },
                BatchOp::Delete { key: queue_key(marker.seq) },
                BatchOp::Delete { key: queued_cid_key(&job.cid) },
            ])
            .context("persisting queued cancel")?;
        self.notify(&job);
        Ok(())
    }

    pub fn get(&self, jid: &JobId) -> Result<Option<Job>> {
        let Some(buf) = self.ds.get(&job_key(jid))? else { return Ok(None) };
        let job = serde_json::from_slice(&buf).with_context(|| format!("decoding job {jid}"))?;
        Ok(Some(job))
    }

    /// Every persisted job, unordered. Callers filter and sort.
    pub fn list(&self) -> Result<Vec<Job>> {
        let mut out = Vec::new();
        for (key, buf) in self.ds.query_prefix("job/")? {
            let job: Job =
                serde_json::from_slice(&buf).with_context(|| format!("decoding job at {key}"))?;
            out.push(job);
        }
        Ok(out)
    }

    /// Jobs left Executing by a previous process run, for recovery.
    pub fn get_executing_jobs(&self) -> Result<Vec<Job>> {
        let mut out = Vec::new();
        for (key, val) in self.ds.query_prefix("executing/")? {
            let jid = JobId(String::from_utf8_lossy(&val).to_string());
            match self.get(&jid)? {
                Some(job) => out.push(job),
                None => warn!(target: "tundra::jobstore", "executing marker {} points at missing job", key),
            }
        }
        Ok(out)
    }

    /// Subscribe to job updates of one tenant. The current state of all its
    /// jobs is pushed first, then every subsequent update. Slow receivers
    /// miss updates rather than blocking the store.
    pub fn watch(&self, api_id: &ApiId) -> Result<JobWatcher> {
        let (tx, rx) = mpsc::channel(WATCHER_BUFFER);
        // Snapshot before registering so no update is both snapshotted and dropped.
        let snapshot: Vec<Job> = self
            .list()?
            .into_iter()
            .filter(|j| &j.api_id == api_id)
            .collect();
        for job in snapshot {
            if tx.try_send(job).is_err() {
                warn!(target: "tundra::jobstore", "dropping job snapshot on slow receiver for {}", api_id);
            }
        }
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().push(WatcherEntry { id, api_id: api_id.clone(), tx });
        Ok(JobWatcher { id, rx, registry: Arc::downgrade(&self.watchers) })
    }

    fn notify(&self, job: &Job) {
        let watchers = self.watchers.lock();
        for w in watchers.iter() {
            if w.api_id != job.api_id {
                continue;
            }
            if w.tx.try_send(job.clone()).is_err() {
                warn!(target: "tundra::jobstore", "slow job watcher for {}, dropping update", w.api_id);
            }
        }
    }

    // --- started-deals side table ---------------------------------------

    /// Record proposals whose deals were submitted but not yet watched to a
    /// terminal state, so a crash can resume watching them.
    pub fn add_started_deals(&self, cid: &Cid, proposals: &[FilStorage]) -> Result<()> {
        let buf = serde_json::to_vec(proposals).context("encoding started deals")?;
        self.ds.put(&started_deals_key(cid), buf).context("persisting started deals")
    }

    pub fn get_started_deals(&self, cid: &Cid) -> Result<Vec<FilStorage>> {
        let Some(buf) = self.ds.get(&started_deals_key(cid))? else { return Ok(Vec::new()) };
        serde_json::from_slice(&buf).context("decoding started deals")
    }

    pub fn remove_started_deals(&self, cid: &Cid) -> Result<()> {
        self.ds.delete(&started_deals_key(cid)).context("removing started deals")
    }
}

/// Live job subscription. Dropping it unregisters the watcher.
pub struct JobWatcher {
    id: u64,
    rx: mpsc::Receiver<Job>,
    registry: std::sync::Weak<Mutex<Vec<WatcherEntry>>>,
}

impl JobWatcher {
    pub async fn recv(&mut self) -> Option<Job> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Job> {
        self.rx.try_recv().ok()
    }
}

impl Drop for JobWatcher {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().retain(|w| w.id != self.id);
        }
    }
}
