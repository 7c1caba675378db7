//!
//! tundra scheduler
//! ----------------
//! The reconciliation core. Push-config intents become Queued Jobs; a
//! single driver task drains the queue into rate-limited workers, each of
//! which runs the hot pipeline then the cold pipeline for one CID and
//! finalizes the Job. The driver also owns the renewal and repair crons
//! and re-adopts Jobs left Executing by a previous process run.
//!
//! Concurrency model: one driver task, up to `max_parallel` workers, all
//! children of a daemon cancellation token. Per-CID exclusion is enforced
//! by the job store, so two workers never reconcile the same CID.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::actionstore::ActionStore;
use crate::cold::ColdStorage;
use crate::datastore::{Datastore, Namespaced};
use crate::error::AppError;
use crate::hot::HotStorage;
use crate::infostore::InfoStore;
use crate::joblog::{JobLogger, LogWatcher};
use crate::jobstore::{JobStore, JobWatcher};
use crate::types::{
    Action, ApiId, Cid, ColdConfig, ColdInfo, DealError, DealInfo, DealState, FilInfo, HotConfig,
    HotInfo, IpfsHotInfo, Job, JobId, JobStatus, StorageConfig, StorageInfo,
};
use crate::util::AVG_BLOCK_TIME;

const DEFAULT_MAX_PARALLEL: usize = 50;

/// Tuning knobs. Defaults match mainnet pacing; tests shrink them.
#[derive(Debug, Clone)]
pub struct SchedulerOpts {
    pub max_parallel: usize,
    /// Interval of the renewal/repair cron tick.
    pub cron_interval: Duration,
}

impl Default for SchedulerOpts {
    fn default() -> Self {
        SchedulerOpts { max_parallel: DEFAULT_MAX_PARALLEL, cron_interval: AVG_BLOCK_TIME }
    }
}

pub struct Scheduler {
    inner: Arc<Inner>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct Inner {
    hs: Arc<dyn HotStorage>,
    cs: Arc<dyn ColdStorage>,
    js: JobStore,
    astore: ActionStore,
    cis: InfoStore,
    logger: Arc<JobLogger>,

    sem: Arc<Semaphore>,
    evaluate: Notify,
    daemon: CancellationToken,
    workers: TaskTracker,
    /// Cancellation token per currently-executing job.
    running: Mutex<HashMap<JobId, CancellationToken>>,
    opts: SchedulerOpts,
}

impl Scheduler {
    /// Build a scheduler over a namespaced datastore and start its driver.
    /// Jobs left Executing by a previous run are re-adopted immediately.
    pub fn new(
        ds: Arc<dyn Datastore>,
        logger: Arc<JobLogger>,
        hs: Arc<dyn HotStorage>,
        cs: Arc<dyn ColdStorage>,
        opts: SchedulerOpts,
    ) -> Result<Arc<Self>> {
        let js = JobStore::new(Namespaced::wrap(ds.clone(), "jstore"))
            .context("loading scheduler jobstore")?;
        let astore = ActionStore::new(Namespaced::wrap(ds.clone(), "astore"));
        let cis = InfoStore::new(Namespaced::wrap(ds, "cistore"));

        let inner = Arc::new(Inner {
            hs,
            cs,
            js,
            astore,
            cis,
            logger,
            sem: Arc::new(Semaphore::new(opts.max_parallel)),
            evaluate: Notify::new(),
            daemon: CancellationToken::new(),
            workers: TaskTracker::new(),
            running: Mutex::new(HashMap::new()),
            opts,
        });

        let sched = Arc::new(Scheduler { inner: inner.clone(), driver: Mutex::new(None) });
        let handle = tokio::spawn(async move { Inner::run(inner).await });
        *sched.driver.lock() = Some(handle);
        Ok(sched)
    }

    /// Queue a new desired configuration for a CID. Returns the JobID that
    /// tracks its reconciliation.
    pub fn push_config(&self, api_id: &ApiId, cid: &Cid, cfg: StorageConfig) -> Result<JobId> {
        self.inner.push(api_id, cid, cfg, None)
    }

    /// Like `push_config`, and also untracks `old_cid` so it stops being
    /// considered by the renewal/repair crons.
    pub fn push_replace(
        &self,
        api_id: &ApiId,
        cid: &Cid,
        cfg: StorageConfig,
        old_cid: &Cid,
    ) -> Result<JobId> {
        self.inner.push(api_id, cid, cfg, Some(old_cid.clone()))
    }

    /// Drop a CID from the renewal/repair crons.
    pub fn untrack(&self, cid: &Cid) -> Result<()> {
        self.inner.astore.remove(cid).context("removing cid from action store")
    }

    /// Last observed storage state of a CID.
    pub fn get_storage_info(&self, api_id: &ApiId, cid: &Cid) -> Result<StorageInfo> {
        self.inner.cis.get(api_id, cid)
    }

    /// All storage-info records of a tenant.
    pub fn get_all_storage_info(&self, api_id: &ApiId) -> Result<Vec<StorageInfo>> {
        self.inner.cis.get_all(api_id)
    }

    pub fn get_job(&self, jid: &JobId) -> Result<Job> {
        self.inner
            .js
            .get(jid)?
            .ok_or_else(|| anyhow!(AppError::not_found(format!("job {jid} not found"))))
    }

    /// Every persisted job; callers filter by tenant/status.
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.inner.js.list()
    }

    /// Subscribe to job updates of one tenant.
    pub fn watch_jobs(&self, api_id: &ApiId) -> Result<JobWatcher> {
        self.inner.js.watch(api_id)
    }

    /// Subscribe to all new per-CID log entries.
    pub fn watch_logs(&self) -> LogWatcher {
        self.inner.logger.watch()
    }

    /// Full log history of a CID.
    pub fn get_logs(&self, cid: &Cid) -> Result<Vec<crate::types::LogEntry>> {
        self.inner.logger.get(cid)
    }

    /// Read a CID's data from the hot tier.
    pub async fn get_cid_from_hot(&self, cid: &Cid) -> Result<Vec<u8>> {
        self.inner.hs.get(cid).await.with_context(|| format!("getting {cid} from hot layer"))
    }

    /// Cooperatively cancel a job. An Executing job observes the signal at
    /// its next suspension point and finalizes as Canceled; a Queued job is
    /// canceled in place.
    pub fn cancel_job(&self, jid: &JobId) -> Result<()> {
        if let Some(token) = self.inner.running.lock().get(jid) {
            token.cancel();
            return Ok(());
        }
        let job = self.get_job(jid)?;
        match job.status {
            JobStatus::Queued => self.inner.js.cancel_queued(jid, "canceled"),
            JobStatus::Executing => {
                // Executing but not in the running map: adopted by another
                // process or already finishing. Nothing to signal here.
                Err(anyhow!(AppError::precondition(format!(
                    "job {jid} isn't executing in this process"
                ))))
            }
            _ => Err(anyhow!(AppError::precondition(format!(
                "job {jid} already finalized as {}",
                job.status
            )))),
        }
    }

    /// Stop the driver and wait for in-flight workers to finalize.
    pub async fn close(&self) {
        self.inner.daemon.cancel();
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(target: "tundra::scheduler", "driver task ended abnormally: {e}");
            }
        }
        self.inner.workers.close();
        self.inner.workers.wait().await;
    }
}

impl Inner {
    fn push(
        &self,
        api_id: &ApiId,
        cid: &Cid,
        cfg: StorageConfig,
        replaced_cid: Option<Cid>,
    ) -> Result<JobId> {
        if !api_id.is_valid() {
            return Err(anyhow!(AppError::invalid("instance id can't be empty")));
        }
        cfg.validate()
            .map_err(|e| anyhow!(AppError::invalid(format!("validating storage config: {e:#}"))))?;

        let job = Job::queued(api_id.clone(), cid.clone());
        let jid = job.id.clone();
        self.js.enqueue(job).context("enqueuing job")?;
        self.logger.log(cid, Some(&jid), "Pushing new configuration...");

        let action = Action {
            api_id: api_id.clone(),
            cid: cid.clone(),
            cfg,
            replaced_cid: replaced_cid.clone(),
        };
        self.astore.put(&jid, &action).context("saving new config in store")?;

        if let Some(old) = replaced_cid {
            self.astore.remove(&old).context("untracking replaced cid")?;
        }
        self.evaluate.notify_one();
        self.logger.log(cid, Some(&jid), "Configuration saved successfully");
        Ok(jid)
    }

    async fn run(this: Arc<Self>) {
        Self::resume_executing_jobs(&this);
        // Work queued before this process started.
        Self::execute_queued_jobs(&this).await;
        loop {
            tokio::select! {
                _ = this.daemon.cancelled() => {
                    debug!(target: "tundra::scheduler", "terminating scheduler daemon");
                    return;
                }
                _ = tokio::time::sleep(this.opts.cron_interval) => {
                    debug!(target: "tundra::scheduler", "running renewal checks");
                    this.exec_renew_cron().await;
                    debug!(target: "tundra::scheduler", "running repair checks");
                    this.exec_repair_cron().await;
                }
                _ = this.evaluate.notified() => {
                    debug!(target: "tundra::scheduler", "evaluating job queue");
                    Self::execute_queued_jobs(&this).await;
                }
            }
        }
    }

    /// Re-adopt jobs a previous process left Executing. Both pipelines are
    /// resume-safe: re-pinning is a no-op and the cold pipeline rejoins the
    /// started-deals side table.
    fn resume_executing_jobs(this: &Arc<Self>) {
        let jobs = match this.js.get_executing_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(target: "tundra::scheduler", "getting executing jobs for resume: {e:#}");
                return;
            }
        };
        for job in jobs {
            debug!(target: "tundra::scheduler", "resuming executing job {}", job.id);
            Self::spawn_worker(this, job, None);
        }
    }

    async fn execute_queued_jobs(this: &Arc<Self>) {
        loop {
            if this.daemon.is_cancelled() {
                return;
            }
            // A full pipeline means nothing new becomes Executing.
            let Ok(permit) = this.sem.clone().try_acquire_owned() else { return };
            let job = match this.js.dequeue() {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    error!(target: "tundra::scheduler", "dequeuing job: {e:#}");
                    return;
                }
            };
            Self::spawn_worker(this, job, Some(permit));
        }
    }

    fn spawn_worker(this: &Arc<Self>, job: Job, permit: Option<tokio::sync::OwnedSemaphorePermit>) {
        let inner = this.clone();
        let token = this.daemon.child_token();
        this.running.lock().insert(job.id.clone(), token.clone());
        this.workers.spawn(async move {
            inner.execute_job(&job, &token).await;
            inner.running.lock().remove(&job.id);
            drop(permit);
            // A finished worker may have unblocked a queued job for the
            // same CID.
            inner.evaluate.notify_one();
        });
    }

    async fn execute_job(&self, job: &Job, cancel: &CancellationToken) {
        let action = match self.astore.get(&job.id) {
            Ok(Some(action)) => action,
            Ok(None) => {
                error!(target: "tundra::scheduler", "no action found for job {}", job.id);
                let _ = self.js.finalize(
                    &job.id,
                    JobStatus::Failed,
                    Some("push config action not found".to_string()),
                    vec![],
                    vec![],
                );
                return;
            }
            Err(e) => {
                error!(target: "tundra::scheduler", "getting action of job {}: {e:#}", job.id);
                return;
            }
        };

        self.logger.log(&action.cid, Some(&job.id), format!("Executing job {}...", job.id));
        let (result, deal_errors) = self.execute(&action, job, cancel).await;
        match result {
            Ok(info) => {
                if let Err(e) = self.cis.put(&info) {
                    error!(target: "tundra::scheduler", "saving storage info: {e:#}");
                }
                let deal_info = deal_info_of(&info);
                if let Err(e) =
                    self.js.finalize(&job.id, JobStatus::Success, None, deal_errors, deal_info)
                {
                    error!(target: "tundra::scheduler", "finalizing job {} as success: {e:#}", job.id);
                }
                self.logger.log(
                    &action.cid,
                    Some(&job.id),
                    format!("Job {} execution finished successfully.", job.id),
                );
            }
            Err(e) => {
                let msg = format!("{e:#}");
                let canceled = cancel.is_cancelled() || msg.contains("canceled");
                let (status, cause) = if canceled {
                    (JobStatus::Canceled, "canceled".to_string())
                } else {
                    (JobStatus::Failed, format!("{e:#}"))
                };
                if let Err(fe) = self.js.finalize(&job.id, status, Some(cause), deal_errors, vec![]) {
                    error!(target: "tundra::scheduler", "finalizing job {}: {fe:#}", job.id);
                }
                self.logger.log(
                    &action.cid,
                    Some(&job.id),
                    format!("Job {} execution failed: {e:#}", job.id),
                );
            }
        }
    }

    async fn execute(
        &self,
        action: &Action,
        job: &Job,
        cancel: &CancellationToken,
    ) -> (Result<StorageInfo>, Vec<DealError>) {
        let ci = match self.get_refreshed_info(&action.api_id, &action.cid).await {
            Ok(ci) => ci,
            Err(e) => return (Err(e.context("getting current storage info")), vec![]),
        };

        self.logger.log(&action.cid, Some(&job.id), "Ensuring Hot-Storage satisfies the configuration...");
        let hot = match self
            .execute_hot_storage(&ci, &action.cfg.hot, &action.cfg.cold.filecoin.addr, action.replaced_cid.as_ref(), &job.id, cancel)
            .await
        {
            Ok(hot) => hot,
            Err(e) => {
                self.logger.log(&action.cid, Some(&job.id), "Hot-Storage execution failed.");
                return (Err(e.context("executing hot-storage config")), vec![]);
            }
        };
        self.logger.log(&action.cid, Some(&job.id), "Hot-Storage execution ran successfully.");

        self.logger.log(&action.cid, Some(&job.id), "Ensuring Cold-Storage satisfies the configuration...");
        let (cold_res, deal_errors) =
            self.execute_cold_storage(&ci, &action.cfg.cold, &job.id, cancel).await;
        let cold = match cold_res {
            Ok(cold) => cold,
            Err(e) => {
                self.logger.log(&action.cid, Some(&job.id), "Cold-Storage execution failed.");
                return (Err(e.context("executing cold-storage config")), deal_errors);
            }
        };
        self.logger.log(&action.cid, Some(&job.id), "Cold-Storage execution ran successfully.");

        let info = StorageInfo {
            job_id: job.id.clone(),
            api_id: action.api_id.clone(),
            cid: action.cid.clone(),
            created: Utc::now(),
            hot,
            cold,
        };
        (Ok(info), deal_errors)
    }

    /// Load stored info and re-verify it against the hot and cold layers:
    /// pin state from the pinset, proposals against on-chain deal state.
    async fn get_refreshed_info(&self, api_id: &ApiId, cid: &Cid) -> Result<StorageInfo> {
        let mut ci = match self.cis.try_get(api_id, cid)? {
            Some(ci) => ci,
            // Default value has both storages disabled.
            None => return Ok(StorageInfo::empty(api_id.clone(), cid.clone())),
        };

        ci.hot.enabled = self.hs.is_stored(cid).await.context("getting refreshed hot info")?;

        let mut active = Vec::with_capacity(ci.cold.filecoin.proposals.len());
        for p in ci.cold.filecoin.proposals.drain(..) {
            let is_active = self
                .cs
                .is_fil_deal_active(&p.proposal_cid)
                .await
                .with_context(|| format!("getting deal state of proposal {}", p.proposal_cid))?;
            if is_active {
                active.push(p);
            }
        }
        ci.cold.filecoin.proposals = active;
        Ok(ci)
    }

    async fn execute_hot_storage(
        &self,
        curr: &StorageInfo,
        cfg: &HotConfig,
        waddr: &str,
        replace_cid: Option<&Cid>,
        jid: &JobId,
        cancel: &CancellationToken,
    ) -> Result<HotInfo> {
        let cid = &curr.cid;
        if cfg.enabled == curr.hot.enabled {
            self.logger.log(cid, Some(jid), "Current Cid state is healthy in Hot-Storage.");
            return Ok(curr.hot.clone());
        }

        if !cfg.enabled {
            self.hs.remove(cid).await.context("removing from hot storage")?;
            self.logger.log(cid, Some(jid), "Cid successfully removed from Hot-Storage.");
            return Ok(HotInfo { enabled: false, ..Default::default() });
        }

        let timeout = Duration::from_secs(cfg.ipfs.add_timeout);
        let attempt = async {
            match replace_cid {
                None => self.hs.store(cid).await,
                Some(old) => {
                    self.logger.log(cid, Some(jid), format!("Replacing previous pin {old}"));
                    self.hs.replace(old, cid).await
                }
            }
        };
        let pinned: Result<u64> = tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!(AppError::canceled("hot-storage pin canceled"))),
            res = tokio::time::timeout(timeout, attempt) => match res {
                Ok(inner) => inner,
                Err(_) => Err(anyhow!(AppError::deadline(format!(
                    "pinning {cid} in hot storage timed out after {}s", cfg.ipfs.add_timeout
                )))),
            },
        };

        let size = match pinned {
            Ok(size) => size,
            Err(e) => {
                self.logger.log(cid, Some(jid), "Direct fetching from IPFS wasn't possible.");
                if cancel.is_cancelled() {
                    return Err(e);
                }
                if !cfg.allow_unfreeze || curr.cold.filecoin.proposals.is_empty() {
                    self.logger.log(cid, Some(jid), "Unfreeze is disabled or active Filecoin deals are unavailable.");
                    return Err(e.context("pinning cid in hot storage"));
                }
                self.logger.log(cid, Some(jid), "Unfreezing from Filecoin...");
                // The payload identifier recorded at deal time is the
                // canonical id for retrieval.
                let data_cid = curr.cold.filecoin.data_cid.clone().unwrap_or_else(|| cid.clone());
                self.cs
                    .fetch(&data_cid, waddr, cfg.unfreeze_max_price)
                    .await
                    .context("unfreezing from cold storage")?;
                self.logger.log(cid, Some(jid), "Unfrozen successfully, saving in Hot-Storage...");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(anyhow!(AppError::canceled("hot-storage pin canceled"))),
                    res = self.hs.store(&data_cid) => res.context("pinning unfrozen cid")?,
                }
            }
        };

        Ok(HotInfo { enabled: true, size, ipfs: IpfsHotInfo { created: Some(Utc::now()) } })
    }

    async fn execute_cold_storage(
        &self,
        curr: &StorageInfo,
        cfg: &ColdConfig,
        jid: &JobId,
        cancel: &CancellationToken,
    ) -> (Result<ColdInfo>, Vec<DealError>) {
        let cid = &curr.cid;
        if !cfg.enabled {
            self.logger.log(cid, Some(jid), "Cold-Storage was disabled, Filecoin deals will eventually expire.");
            return (Ok(curr.cold.clone()), vec![]);
        }

        let mut all_errors = Vec::new();
        let mut proposals = curr.cold.filecoin.proposals.clone();
        let mut size = curr.cold.filecoin.size;

        // Deals submitted before a crash are rejoined, never resubmitted.
        let started = match self.js.get_started_deals(cid) {
            Ok(sds) => sds,
            Err(e) => return (Err(e.context("checking for started deals")), all_errors),
        };
        if !started.is_empty() {
            self.logger.log(cid, Some(jid), format!("Resuming {} detached executing deals...", started.len()));
            match self.cs.wait_for_deals(cid, Some(jid), &started, cancel).await {
                Ok((ok, failed)) => {
                    self.logger.log(cid, Some(jid), format!("A total of {} resumed deals finished successfully", ok.len()));
                    all_errors.extend(failed);
                    let mut merged = ok;
                    merged.extend(proposals);
                    proposals = merged;
                    if let Err(e) = self.js.remove_started_deals(cid) {
                        return (Err(e.context("removing resumed started deals")), all_errors);
                    }
                }
                Err(e) => return (Err(e.context("finish tracking reattached deals")), all_errors),
            }
        }

        if cfg.filecoin.rep_factor <= proposals.len() {
            self.logger.log(cid, Some(jid), "The current replication factor is equal or higher than desired, avoiding making new deals.");
            let info = ColdInfo {
                enabled: true,
                filecoin: FilInfo { data_cid: Some(cid.clone()), size, proposals },
            };
            return (Ok(info), all_errors);
        }

        // New deals only for the missing share, avoiding miners that
        // already hold a proposal.
        let mut delta = cfg.filecoin.clone();
        delta.rep_factor = cfg.filecoin.rep_factor - proposals.len();
        delta.excluded_miners.extend(proposals.iter().map(|p| p.miner.clone()));
        self.logger.log(
            cid,
            Some(jid),
            format!("Current replication factor is lower than desired, making {} new deals...", delta.rep_factor),
        );

        let outcome = match self.cs.store(cid, Some(jid), &delta).await {
            Ok(outcome) => outcome,
            Err(e) => return (Err(e), all_errors),
        };
        all_errors.extend(outcome.rejected);
        if outcome.started.is_empty() {
            return (
                Err(anyhow!("couldn't start any new deal, replication factor can't be met")),
                all_errors,
            );
        }
        size = outcome.size;
        if let Err(e) = self.js.add_started_deals(cid, &outcome.started) {
            return (Err(e), all_errors);
        }

        let (ok_deals, failed) = match self.cs.wait_for_deals(cid, Some(jid), &outcome.started, cancel).await {
            Ok(res) => res,
            Err(e) => return (Err(e.context("watching deals unfold")), all_errors),
        };
        all_errors.extend(failed);
        if let Err(e) = self.js.remove_started_deals(cid) {
            return (Err(e.context("removing started deals record")), all_errors);
        }
        if ok_deals.is_empty() {
            return (
                Err(anyhow!("all started deals failed, replication factor can't be met")),
                all_errors,
            );
        }

        let mut merged = ok_deals;
        merged.extend(proposals);
        let info = ColdInfo {
            enabled: true,
            filecoin: FilInfo { data_cid: Some(cid.clone()), size, proposals: merged },
        };
        (Ok(info), all_errors)
    }

    async fn exec_renew_cron(&self) {
        let actions = match self.astore.get_renewable() {
            Ok(actions) => actions,
            Err(e) => {
                error!(target: "tundra::scheduler", "getting renewable actions: {e:#}");
                return;
            }
        };
        for action in actions {
            if self.daemon.is_cancelled() {
                return;
            }
            debug!(target: "tundra::scheduler", "evaluating deal renewal for {}", action.cid);
            if let Err(e) = self.evaluate_renewal(&action).await {
                error!(target: "tundra::scheduler", "renewal of {}: {e:#}", action.cid);
            }
        }
    }

    async fn evaluate_renewal(&self, action: &Action) -> Result<()> {
        if self.cis.try_get(&action.api_id, &action.cid)?.is_none() {
            debug!(target: "tundra::scheduler", "skip renewal of {}, cid isn't stored yet", action.cid);
            return Ok(());
        }
        let mut info = self.get_refreshed_info(&action.api_id, &action.cid).await?;
        self.logger.log(&action.cid, None, "Evaluating deal renewal...");

        let (new_fil, errors) = self
            .cs
            .ensure_renewals(&action.cid, info.cold.filecoin.clone(), &action.cfg.cold.filecoin, &self.daemon)
            .await
            .context("evaluating renewal in cold storage")?;
        for e in &errors {
            warn!(target: "tundra::scheduler", "renew deal error: {:?} {} {}", e.proposal_cid, e.miner, e.message);
        }
        info.cold.filecoin = new_fil;
        self.cis.put(&info).context("saving renewed storage info")?;
        self.logger.log(&action.cid, None, "Deal renewal evaluated successfully");
        Ok(())
    }

    async fn exec_repair_cron(&self) {
        let actions = match self.astore.get_repairable() {
            Ok(actions) => actions,
            Err(e) => {
                error!(target: "tundra::scheduler", "getting repairable actions: {e:#}");
                return;
            }
        };
        for action in actions {
            if self.daemon.is_cancelled() {
                return;
            }
            if let Err(e) = self.evaluate_repair(&action).await {
                error!(target: "tundra::scheduler", "repair of {}: {e:#}", action.cid);
            }
        }
    }

    async fn evaluate_repair(&self, action: &Action) -> Result<()> {
        let Some(_) = self.cis.try_get(&action.api_id, &action.cid)? else {
            return Ok(());
        };
        let refreshed = self.get_refreshed_info(&action.api_id, &action.cid).await?;
        let active = refreshed.cold.filecoin.proposals.len();
        let desired = action.cfg.cold.filecoin.rep_factor;
        if !action.cfg.cold.enabled || active >= desired {
            return Ok(());
        }
        self.logger.log(&action.cid, None, "Scheduling deal repair...");
        // The pushed config clears the repairable flag so the repair job
        // can't re-trigger before it finishes.
        let mut cfg = action.cfg.clone();
        cfg.repairable = false;
        let jid = self.push(&action.api_id, &action.cid, cfg, None).context("scheduling repair job")?;
        self.logger.log(&action.cid, None, format!("Job {jid} was queued for repair evaluation."));
        Ok(())
    }
}

/// Terminal deal view recorded on a successful job: every proposal the
/// reconciliation left active.
fn deal_info_of(info: &StorageInfo) -> Vec<DealInfo> {
    info.cold
        .filecoin
        .proposals
        .iter()
        .map(|p| DealInfo {
            proposal_cid: p.proposal_cid.clone(),
            state: DealState::Active,
            state_name: DealState::Active.name().to_string(),
            miner: p.miner.clone(),
            piece_cid: p.piece_cid.clone(),
            size: info.cold.filecoin.size,
            price_per_epoch: p.epoch_price,
            start_epoch: p.start_epoch,
            duration: p.duration,
            deal_id: p.deal_id,
            activation_epoch: p.activation_epoch,
            message: String::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cold::{ColdStorage as _, FilCold};
    use crate::datastore::MemDatastore;
    use crate::deals;
    use crate::jobstore::SUPERSEDED_CAUSE;
    use crate::miners::{FixedMiner, FixedMinerSelector};
    use crate::testutil::{default_config, FakeHot, FakeMarket};

    struct Harness {
        sched: Arc<Scheduler>,
        hot: Arc<FakeHot>,
        market: Arc<FakeMarket>,
        api_id: ApiId,
    }

    fn build_cold(ds: &Arc<dyn Datastore>, market: &Arc<FakeMarket>, logger: &Arc<JobLogger>) -> Arc<FilCold> {
        let module = Arc::new(deals::Module::new(
            Namespaced::wrap(ds.clone(), "deals"),
            market.clone(),
            Duration::from_millis(5),
        ));
        let selector = Arc::new(FixedMinerSelector::new(vec![
            FixedMiner { addr: "f0100".into(), country: "US".into(), epoch_price: 10 },
            FixedMiner { addr: "f0200".into(), country: "DE".into(), epoch_price: 20 },
            FixedMiner { addr: "f0301".into(), country: "CN".into(), epoch_price: 5 },
        ]));
        Arc::new(FilCold::new(selector, module, logger.clone()))
    }

    async fn harness() -> Harness {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let hot = Arc::new(FakeHot::new());
        let market = Arc::new(FakeMarket::new());
        market.auto_activate_after(1);
        harness_with(ds, hot, market)
    }

    fn harness_with(ds: Arc<dyn Datastore>, hot: Arc<FakeHot>, market: Arc<FakeMarket>) -> Harness {
        let logger = Arc::new(JobLogger::new(Namespaced::wrap(ds.clone(), "ffs/joblogger")));
        let cold = build_cold(&ds, &market, &logger);
        let opts = SchedulerOpts { max_parallel: 8, cron_interval: Duration::from_secs(3600) };
        let sched = Scheduler::new(ds, logger, hot.clone(), cold, opts).unwrap();
        Harness { sched, hot, market, api_id: ApiId("tenant-test".into()) }
    }

    async fn wait_terminal(sched: &Scheduler, jid: &JobId) -> Job {
        for _ in 0..500 {
            let job = sched.get_job(jid).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {jid} never reached a terminal status");
    }

    #[tokio::test]
    async fn push_validates_inputs() {
        let h = harness().await;
        let cid = Cid::from_trusted("QmPushVal1");
        let mut cfg = default_config("f3wallet");
        cfg.hot.enabled = false;
        cfg.cold.enabled = false;
        assert!(h.sched.push_config(&h.api_id, &cid, cfg).is_err());

        let err = h
            .sched
            .push_config(&ApiId(String::new()), &cid, default_config("f3wallet"))
            .unwrap_err();
        let app: AppError = err.into();
        assert_eq!(app.code_str(), "invalid_argument");
        h.sched.close().await;
    }

    #[tokio::test]
    async fn full_pipeline_reaches_success() {
        let h = harness().await;
        let data = b"some bytes worth storing".to_vec();
        let cid = h.hot.add(&data).await.unwrap();

        let jid = h.sched.push_config(&h.api_id, &cid, default_config("f3wallet")).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Success, "cause: {:?}", job.err_cause);

        let info = h.sched.get_storage_info(&h.api_id, &cid).unwrap();
        assert!(info.hot.enabled);
        assert_eq!(info.cold.filecoin.proposals.len(), 1);
        assert!(info.cold.filecoin.proposals[0].activation_epoch > 0);
        assert!(h.hot.is_pinned(&cid));
        // The finalized job carries the terminal deal view.
        assert_eq!(job.deal_info.len(), 1);
        assert!(job.deal_info[0].state.is_active());

        // The job history carries the execution trail.
        let logs = h.sched.get_logs(&cid).unwrap();
        assert!(logs.iter().any(|l| l.message.contains("Pushing new configuration")));
        h.sched.close().await;
    }

    #[tokio::test]
    async fn second_push_supersedes_queued_job() {
        let h = harness().await;
        let cid = h.hot.add(b"superseded payload").await.unwrap();
        let jid1 = h.sched.push_config(&h.api_id, &cid, default_config("f3wallet")).unwrap();
        let jid2 = match h.sched.push_config(&h.api_id, &cid, default_config("f3wallet")) {
            Ok(jid2) => jid2,
            // The first job may already be Executing; rejection with a
            // conflict is the documented behavior for that window.
            Err(_) => {
                let j1 = wait_terminal(&h.sched, &jid1).await;
                assert!(j1.status.is_terminal());
                h.sched.close().await;
                return;
            }
        };
        let j1 = wait_terminal(&h.sched, &jid1).await;
        if j1.status == JobStatus::Canceled {
            assert_eq!(j1.err_cause.as_deref(), Some(SUPERSEDED_CAUSE));
        }
        let j2 = wait_terminal(&h.sched, &jid2).await;
        assert_eq!(j2.status, JobStatus::Success, "cause: {:?}", j2.err_cause);
        h.sched.close().await;
    }

    #[tokio::test]
    async fn hot_timeout_without_unfreeze_fails_job() {
        let h = harness().await;
        // A CID nobody can resolve and with no cold deals to unfreeze from.
        let cid = Cid::from_trusted("QmNowhere1");
        let mut cfg = default_config("f3wallet");
        cfg.hot.ipfs.add_timeout = 1;
        cfg.cold.enabled = false;

        let jid = h.sched.push_config(&h.api_id, &cid, cfg).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Failed);
        let cause = job.err_cause.unwrap();
        assert!(cause.contains("hot storage"), "unexpected cause: {cause}");
        h.sched.close().await;
    }

    #[tokio::test]
    async fn hot_store_error_fails_job_immediately() {
        let h = harness().await;
        let cid = Cid::from_trusted("QmBrokenPin");
        h.hot.fail_store_with(&cid, "node rejected the pin");
        let mut cfg = default_config("f3wallet");
        cfg.cold.enabled = false;
        let jid = h.sched.push_config(&h.api_id, &cid, cfg).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.err_cause.unwrap().contains("node rejected the pin"));
        h.sched.close().await;
    }

    #[tokio::test]
    async fn unfreeze_restores_hot_from_cold() {
        let h = harness().await;
        let data = b"cold-only payload".to_vec();
        let cid = h.hot.add(&data).await.unwrap();

        // First push: cold only.
        let mut cfg = default_config("f3wallet");
        cfg.hot.enabled = false;
        let jid = h.sched.push_config(&h.api_id, &cid, cfg).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Success, "cause: {:?}", job.err_cause);

        // Data falls out of the hot network; cold retrieval brings it back.
        h.hot.make_unreachable(&cid);
        h.market.add_retrieval_offer(&cid, "f0100", 3, data.clone());
        let hot = h.hot.clone();
        h.market.set_on_retrieve(move |c| hot.make_reachable(c, data.clone()));

        let mut cfg = default_config("f3wallet");
        cfg.hot.allow_unfreeze = true;
        cfg.hot.ipfs.add_timeout = 1;
        let jid = h.sched.push_config(&h.api_id, &cid, cfg).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Success, "cause: {:?}", job.err_cause);
        assert!(h.hot.is_pinned(&cid));
        h.sched.close().await;
    }

    #[tokio::test]
    async fn cancel_job_finalizes_as_canceled() {
        let h = harness().await;
        // Deals never activate, so the worker parks in deal watching.
        h.market.disable_auto_activate();
        let cid = h.hot.add(b"cancel me").await.unwrap();
        let jid = h.sched.push_config(&h.api_id, &cid, default_config("f3wallet")).unwrap();

        for _ in 0..200 {
            if h.sched.get_job(&jid).unwrap().status == JobStatus::Executing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.sched.cancel_job(&jid).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Canceled);
        h.sched.close().await;
    }

    #[tokio::test]
    async fn excluded_miner_is_never_used() {
        let h = harness().await;
        let cid = h.hot.add(b"exclusive payload").await.unwrap();
        let mut cfg = default_config("f3wallet");
        // f0301 is the cheapest; excluding it must route elsewhere.
        cfg.cold.filecoin.excluded_miners = vec!["f0301".into()];
        let jid = h.sched.push_config(&h.api_id, &cid, cfg).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Success, "cause: {:?}", job.err_cause);
        let info = h.sched.get_storage_info(&h.api_id, &cid).unwrap();
        assert!(info.cold.filecoin.proposals.iter().all(|p| p.miner != "f0301"));
        h.sched.close().await;
    }

    #[tokio::test]
    async fn rep_factor_two_preserves_existing_proposal() {
        let h = harness().await;
        let cid = h.hot.add(b"grow replication").await.unwrap();
        let jid = h.sched.push_config(&h.api_id, &cid, default_config("f3wallet")).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Success, "cause: {:?}", job.err_cause);
        let first = h.sched.get_storage_info(&h.api_id, &cid).unwrap();
        assert_eq!(first.cold.filecoin.proposals.len(), 1);
        let original = first.cold.filecoin.proposals[0].proposal_cid.clone();

        let mut cfg = default_config("f3wallet");
        cfg.cold.filecoin.rep_factor = 2;
        let jid = h.sched.push_config(&h.api_id, &cid, cfg).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Success, "cause: {:?}", job.err_cause);

        let info = h.sched.get_storage_info(&h.api_id, &cid).unwrap();
        assert_eq!(info.cold.filecoin.proposals.len(), 2);
        assert!(info.cold.filecoin.proposals.iter().any(|p| p.proposal_cid == original));
        // Two distinct miners hold the data.
        let m0 = &info.cold.filecoin.proposals[0].miner;
        let m1 = &info.cold.filecoin.proposals[1].miner;
        assert_ne!(m0, m1);
        h.sched.close().await;
    }

    #[tokio::test]
    async fn replace_untracks_old_cid() {
        let h = harness().await;
        let a = h.hot.add(b"old payload").await.unwrap();
        let b = h.hot.add(b"new payload").await.unwrap();

        let mut cfg = default_config("f3wallet");
        cfg.cold.filecoin.renew.enabled = true;
        let jid = h.sched.push_config(&h.api_id, &a, cfg.clone()).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Success, "cause: {:?}", job.err_cause);

        let jid = h.sched.push_replace(&h.api_id, &b, cfg, &a).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Success, "cause: {:?}", job.err_cause);
        assert!(h.hot.is_pinned(&b));
        // Replace swaps the pin instead of duplicating it.
        assert!(!h.hot.is_pinned(&a));
        h.sched.close().await;
    }

    // The S7 shape: the process dies after deals were submitted and
    // recorded in the started-deals side table, but before deal watching
    // finished. A fresh scheduler over the same datastore must adopt the
    // Executing job and drive it to a terminal state on the recorded
    // proposals.
    #[tokio::test]
    async fn restart_resumes_executing_job_mid_deal_watch() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let hot = Arc::new(FakeHot::new());
        let market = Arc::new(FakeMarket::new());
        let api_id = ApiId("tenant-test".into());
        let payload = b"restart payload".to_vec();
        let cid = FakeHot::cid_of(&payload);
        hot.make_reachable(&cid, payload.clone());

        let jid;
        {
            // Recreate on-disk state of a crash mid-execution, using the
            // same stores a live scheduler would have written.
            let logger = Arc::new(JobLogger::new(Namespaced::wrap(ds.clone(), "ffs/joblogger")));
            let cold = build_cold(&ds, &market, &logger);
            let js = JobStore::new(Namespaced::wrap(ds.clone(), "jstore")).unwrap();
            let astore = ActionStore::new(Namespaced::wrap(ds.clone(), "astore"));

            let job = Job::queued(api_id.clone(), cid.clone());
            jid = job.id.clone();
            js.enqueue(job).unwrap();
            astore
                .put(
                    &jid,
                    &Action {
                        api_id: api_id.clone(),
                        cid: cid.clone(),
                        cfg: default_config("f3wallet"),
                        replaced_cid: None,
                    },
                )
                .unwrap();
            let job = js.dequeue().unwrap().unwrap();
            assert_eq!(job.id, jid);

            // Deals submitted and recorded; the crash happens before
            // wait_for_deals completes.
            let outcome = cold
                .store(&cid, Some(&jid), &default_config("f3wallet").cold.filecoin)
                .await
                .unwrap();
            assert_eq!(outcome.started.len(), 1);
            js.add_started_deals(&cid, &outcome.started).unwrap();
        }

        // "Restart": same datastore and market, fresh scheduler.
        market.auto_activate_after(1);
        let h = harness_with(ds, hot, market);
        let job = wait_terminal(&h.sched, &jid).await;
        assert_eq!(job.status, JobStatus::Success, "cause: {:?}", job.err_cause);
        let info = h.sched.get_storage_info(&h.api_id, &cid).unwrap();
        assert_eq!(info.cold.filecoin.proposals.len(), 1);
        assert!(info.cold.filecoin.proposals[0].activation_epoch > 0);
        h.sched.close().await;
    }

    #[tokio::test]
    async fn rejected_miner_shows_up_in_deal_errors() {
        let h = harness().await;
        h.market.reject_miner("f0301", "miner is out of space");
        let cid = h.hot.add(b"partially rejected").await.unwrap();
        let mut cfg = default_config("f3wallet");
        cfg.cold.filecoin.rep_factor = 2;
        let jid = h.sched.push_config(&h.api_id, &cid, cfg).unwrap();
        let job = wait_terminal(&h.sched, &jid).await;
        // One of the two deals (the cheapest miner, f0301) was rejected at
        // submission; the other activates, so the job still succeeds with
        // the rejection recorded.
        assert_eq!(job.status, JobStatus::Success, "cause: {:?}", job.err_cause);
        assert_eq!(job.deal_errors.len(), 1);
        assert_eq!(job.deal_errors[0].miner, "f0301");
        assert!(job.deal_errors[0].message.contains("out of space"));
        h.sched.close().await;
    }

    #[tokio::test]
    async fn watch_jobs_emits_transitions() {
        let h = harness().await;
        let cid = h.hot.add(b"watched payload").await.unwrap();
        let mut watcher = h.sched.watch_jobs(&h.api_id).unwrap();
        let jid = h.sched.push_config(&h.api_id, &cid, default_config("f3wallet")).unwrap();

        let mut seen_terminal = false;
        for _ in 0..50 {
            match tokio::time::timeout(Duration::from_secs(2), watcher.recv()).await {
                Ok(Some(job)) if job.id == jid && job.status.is_terminal() => {
                    seen_terminal = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(seen_terminal, "watcher never saw the job reach a terminal state");
        h.sched.close().await;
    }

    #[tokio::test]
    async fn repair_cron_restores_replication() {
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let hot = Arc::new(FakeHot::new());
        let market = Arc::new(FakeMarket::new());
        market.auto_activate_after(1);
        let logger = Arc::new(JobLogger::new(Namespaced::wrap(ds.clone(), "ffs/joblogger")));
        let cold = build_cold(&ds, &market, &logger);
        let opts = SchedulerOpts { max_parallel: 8, cron_interval: Duration::from_millis(50) };
        let sched = Scheduler::new(ds, logger, hot.clone(), cold, opts).unwrap();
        let api_id = ApiId("tenant-test".into());

        let cid = hot.add(b"repairable payload").await.unwrap();
        let mut cfg = default_config("f3wallet");
        cfg.repairable = true;
        let jid = sched.push_config(&api_id, &cid, cfg).unwrap();
        let job = wait_terminal(&sched, &jid).await;
        assert_eq!(job.status, JobStatus::Success, "cause: {:?}", job.err_cause);
        let info = sched.get_storage_info(&api_id, &cid).unwrap();
        let original = info.cold.filecoin.proposals[0].proposal_cid.clone();

        // The only deal dies on-chain; the repair cron must notice the
        // missing replication and push a new job.
        market.slash_deal(&original);
        let mut repaired = false;
        for _ in 0..600 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let info = sched.get_storage_info(&api_id, &cid).unwrap();
            if info.cold.filecoin.proposals.iter().any(|p| p.proposal_cid != original) {
                repaired = true;
                break;
            }
        }
        assert!(repaired, "repair cron never restored replication");
        sched.close().await;
    }
}
