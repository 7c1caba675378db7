//!
//! Tenant instance API
//! -------------------
//! One `Instance` per tenant: it owns the tenant's wallet address and
//! default storage config, remembers the desired config pushed per CID,
//! and fronts the scheduler for pushes, watches, job queries and deal
//! records. Instances hold a reference to the scheduler; the scheduler
//! never references instances (job events flow out keyed by ApiId).

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::datastore::Datastore;
use crate::deals::{self, DealRecordsFilter};
use crate::error::AppError;
use crate::hot::HotStorage;
use crate::joblog::LogWatcher;
use crate::jobstore::JobWatcher;
use crate::scheduler::Scheduler;
use crate::types::{
    ApiId, Cid, DealRecord, Job, JobId, JobStatus, LogEntry, RetrievalRecord, StorageConfig,
    StorageInfo,
};
use crate::wallet::WalletManager;

/// Persisted per-instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: ApiId,
    pub wallet_addr: String,
    pub default_storage_config: StorageConfig,
}

/// Datastore-backed store for one instance's config and per-CID desired
/// configs.
pub struct InstanceStore {
    ds: Arc<dyn Datastore>,
}

impl InstanceStore {
    pub fn new(ds: Arc<dyn Datastore>) -> Self {
        InstanceStore { ds }
    }

    pub fn put_config(&self, cfg: &InstanceConfig) -> Result<()> {
        let buf = serde_json::to_vec(cfg).context("encoding instance config")?;
        self.ds.put("config", buf).context("persisting instance config")
    }

    pub fn get_config(&self) -> Result<Option<InstanceConfig>> {
        let Some(buf) = self.ds.get("config")? else { return Ok(None) };
        let cfg = serde_json::from_slice(&buf).context("decoding instance config")?;
        Ok(Some(cfg))
    }

    pub fn put_cid_config(&self, cid: &Cid, cfg: &StorageConfig) -> Result<()> {
        let buf = serde_json::to_vec(cfg).context("encoding cid config")?;
        self.ds.put(&format!("cfg/{cid}"), buf).context("persisting cid config")
    }

    pub fn get_cid_config(&self, cid: &Cid) -> Result<Option<StorageConfig>> {
        let Some(buf) = self.ds.get(&format!("cfg/{cid}"))? else { return Ok(None) };
        let cfg = serde_json::from_slice(&buf)
            .with_context(|| format!("decoding cid config of {cid}"))?;
        Ok(Some(cfg))
    }

    pub fn remove_cid_config(&self, cid: &Cid) -> Result<()> {
        self.ds.delete(&format!("cfg/{cid}")).context("removing cid config")
    }

    /// CIDs this instance pushed a config for.
    pub fn get_cids(&self) -> Result<Vec<Cid>> {
        let mut out = Vec::new();
        for (key, _) in self.ds.query_prefix("cfg/")? {
            if let Some(c) = key.strip_prefix("cfg/") {
                out.push(Cid::from_trusted(c));
            }
        }
        Ok(out)
    }
}

/// Options for one push.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Desired config; falls back to the instance default.
    pub config: Option<StorageConfig>,
    /// Required to push over an existing config for the CID.
    pub override_config: bool,
}

/// Instance description returned by `info`.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: ApiId,
    pub default_storage_config: StorageConfig,
    pub wallet_addr: String,
    pub balance: u64,
    pub pins: Vec<Cid>,
}

/// Summary counts over an instance's jobs.
#[derive(Debug, Clone, Default)]
pub struct JobsSummary {
    pub queued: Vec<Job>,
    pub executing: Vec<Job>,
    pub latest_final: Vec<Job>,
    pub latest_successful: Vec<Job>,
}

pub struct Instance {
    config: Mutex<InstanceConfig>,
    store: InstanceStore,
    sched: Arc<Scheduler>,
    hot: Arc<dyn HotStorage>,
    market: Arc<deals::Module>,
    wallet: Arc<dyn WalletManager>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").field("id", &self.config.lock().id).finish()
    }
}

impl Instance {
    pub fn new(
        config: InstanceConfig,
        store: InstanceStore,
        sched: Arc<Scheduler>,
        hot: Arc<dyn HotStorage>,
        market: Arc<deals::Module>,
        wallet: Arc<dyn WalletManager>,
    ) -> Self {
        Instance { config: Mutex::new(config), store, sched, hot, market, wallet }
    }

    pub fn id(&self) -> ApiId {
        self.config.lock().id.clone()
    }

    pub fn wallet_addr(&self) -> String {
        self.config.lock().wallet_addr.clone()
    }

    pub fn default_storage_config(&self) -> StorageConfig {
        self.config.lock().default_storage_config.clone()
    }

    /// Change the default config used by subsequent pushes. Already-pushed
    /// configs are unaffected.
    pub fn set_default_storage_config(&self, cfg: StorageConfig) -> Result<()> {
        cfg.validate()
            .map_err(|e| anyhow!(AppError::invalid(format!("default storage config is invalid: {e:#}"))))?;
        let mut config = self.config.lock();
        config.default_storage_config = cfg;
        self.store.put_config(&config)
    }

    /// Stage raw data into the hot tier; returns its CID. Staged data is
    /// not pinned until a config for it is pushed.
    pub async fn stage(&self, data: &[u8]) -> Result<Cid> {
        self.hot.add(data).await.context("staging data in hot storage")
    }

    /// Push a desired storage config for a CID. Pushing over an existing
    /// config requires the override flag.
    pub fn push_storage_config(&self, cid: &Cid, opts: PushOptions) -> Result<JobId> {
        if !opts.override_config && self.store.get_cid_config(cid)?.is_some() {
            return Err(anyhow!(AppError::precondition(
                "cid already has a config, consider using the override flag"
            )));
        }
        let cfg = opts.config.unwrap_or_else(|| self.default_storage_config());
        let jid = self
            .sched
            .push_config(&self.id(), cid, cfg.clone())
            .with_context(|| format!("scheduling {cid}"))?;
        self.store.put_cid_config(cid, &cfg)?;
        Ok(jid)
    }

    /// Store `new_cid` under the config of `old_cid`, untracking the old
    /// one. The hot pin is swapped, not duplicated.
    pub fn replace(&self, old_cid: &Cid, new_cid: &Cid) -> Result<JobId> {
        let cfg = self
            .store
            .get_cid_config(old_cid)?
            .ok_or_else(|| anyhow!(AppError::not_found(format!("no storage config for {old_cid}"))))?;
        let jid = self
            .sched
            .push_replace(&self.id(), new_cid, cfg.clone(), old_cid)
            .with_context(|| format!("replacing {old_cid} with {new_cid}"))?;
        self.store.put_cid_config(new_cid, &cfg)?;
        self.store.remove_cid_config(old_cid)?;
        Ok(jid)
    }

    /// Forget a CID entirely. Only allowed once its config disables both
    /// tiers, so no storage is silently left behind.
    pub fn remove(&self, cid: &Cid) -> Result<()> {
        let cfg = self
            .store
            .get_cid_config(cid)?
            .ok_or_else(|| anyhow!(AppError::not_found(format!("no storage config for {cid}"))))?;
        if cfg.hot.enabled || cfg.cold.enabled {
            return Err(anyhow!(AppError::precondition(
                "can't remove a cid while hot or cold storage is enabled, push a disabled config first"
            )));
        }
        self.sched.untrack(cid)?;
        self.store.remove_cid_config(cid)?;
        Ok(())
    }

    /// Read a CID's data from the hot tier. Requires the pushed config to
    /// have hot storage enabled; cold-only CIDs must be unfrozen first.
    pub async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        let cfg = self
            .store
            .get_cid_config(cid)?
            .ok_or_else(|| anyhow!(AppError::not_found(format!("no storage config for {cid}"))))?;
        if !cfg.hot.enabled {
            return Err(anyhow!(AppError::precondition(
                "cid is disabled in hot storage, enable it (unfreeze) to retrieve"
            )));
        }
        self.sched.get_cid_from_hot(cid).await
    }

    pub fn storage_config(&self, cid: &Cid) -> Result<StorageConfig> {
        self.store
            .get_cid_config(cid)?
            .ok_or_else(|| anyhow!(AppError::not_found(format!("no storage config for {cid}"))))
    }

    /// Last observed storage state of a CID.
    pub fn storage_info(&self, cid: &Cid) -> Result<StorageInfo> {
        self.sched.get_storage_info(&self.id(), cid)
    }

    /// Storage info for many CIDs; missing ones are skipped.
    pub fn storage_info_many(&self, cids: &[Cid]) -> Result<Vec<StorageInfo>> {
        let mut out = Vec::new();
        for cid in cids {
            match self.sched.get_storage_info(&self.id(), cid) {
                Ok(info) => out.push(info),
                Err(e) => {
                    let app: AppError = e.into();
                    if !matches!(app, AppError::NotFound { .. }) {
                        return Err(anyhow!(app));
                    }
                }
            }
        }
        Ok(out)
    }

    pub async fn info(&self) -> Result<InstanceInfo> {
        let (id, cfg, addr) = {
            let config = self.config.lock();
            (config.id.clone(), config.default_storage_config.clone(), config.wallet_addr.clone())
        };
        let balance = self.wallet.balance(&addr).await.context("getting wallet balance")?;
        let pins = self.store.get_cids()?;
        Ok(InstanceInfo {
            id,
            default_storage_config: cfg,
            wallet_addr: addr,
            balance,
            pins,
        })
    }

    pub fn job(&self, jid: &JobId) -> Result<Job> {
        let job = self.sched.get_job(jid)?;
        self.assert_owns(&job)?;
        Ok(job)
    }

    pub fn cancel_job(&self, jid: &JobId) -> Result<()> {
        let job = self.sched.get_job(jid)?;
        self.assert_owns(&job)?;
        self.sched.cancel_job(jid)
    }

    /// Queued jobs, oldest first, optionally restricted to some CIDs.
    pub fn queued_jobs(&self, cids: &[Cid]) -> Result<Vec<Job>> {
        let mut jobs = self.jobs_matching(cids, |j| j.status == JobStatus::Queued)?;
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    pub fn executing_jobs(&self, cids: &[Cid]) -> Result<Vec<Job>> {
        let mut jobs = self.jobs_matching(cids, |j| j.status == JobStatus::Executing)?;
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    /// The newest terminal job per CID.
    pub fn latest_final_jobs(&self, cids: &[Cid]) -> Result<Vec<Job>> {
        self.latest_per_cid(cids, |j| j.status.is_terminal())
    }

    /// The newest successful job per CID.
    pub fn latest_successful_jobs(&self, cids: &[Cid]) -> Result<Vec<Job>> {
        self.latest_per_cid(cids, |j| j.status == JobStatus::Success)
    }

    pub fn jobs_summary(&self, cids: &[Cid]) -> Result<JobsSummary> {
        Ok(JobsSummary {
            queued: self.queued_jobs(cids)?,
            executing: self.executing_jobs(cids)?,
            latest_final: self.latest_final_jobs(cids)?,
            latest_successful: self.latest_successful_jobs(cids)?,
        })
    }

    /// Subscribe to all job updates of this instance.
    pub fn watch_jobs(&self) -> Result<JobWatcher> {
        self.sched.watch_jobs(&self.id())
    }

    /// Subscribe to all new log entries (filter by CID on the consumer side).
    pub fn watch_logs(&self) -> LogWatcher {
        self.sched.watch_logs()
    }

    /// Log history of a CID, optionally restricted to one job.
    pub fn logs(&self, cid: &Cid, jid: Option<&JobId>) -> Result<Vec<LogEntry>> {
        let mut entries = self.sched.get_logs(cid)?;
        if let Some(jid) = jid {
            entries.retain(|e| e.job_id.as_ref() == Some(jid));
        }
        Ok(entries)
    }

    /// Storage deal records paid from this instance's wallet.
    pub fn storage_deal_records(&self, mut filter: DealRecordsFilter) -> Result<Vec<DealRecord>> {
        if filter.addrs.is_empty() {
            filter.addrs = vec![self.wallet_addr()];
        }
        self.market.storage_deal_records(&filter)
    }

    /// Retrieval records paid from this instance's wallet.
    pub fn retrieval_records(&self, mut filter: DealRecordsFilter) -> Result<Vec<RetrievalRecord>> {
        if filter.addrs.is_empty() {
            filter.addrs = vec![self.wallet_addr()];
        }
        self.market.retrieval_records(&filter)
    }

    fn assert_owns(&self, job: &Job) -> Result<()> {
        if job.api_id != self.id() {
            return Err(anyhow!(AppError::not_found(format!("job {} not found", job.id))));
        }
        Ok(())
    }

    fn jobs_matching(&self, cids: &[Cid], keep: impl Fn(&Job) -> bool) -> Result<Vec<Job>> {
        let id = self.id();
        Ok(self
            .sched
            .list_jobs()?
            .into_iter()
            .filter(|j| j.api_id == id)
            .filter(|j| cids.is_empty() || cids.contains(&j.cid))
            .filter(|j| keep(j))
            .collect())
    }

    fn latest_per_cid(&self, cids: &[Cid], keep: impl Fn(&Job) -> bool) -> Result<Vec<Job>> {
        let mut jobs = self.jobs_matching(cids, keep)?;
        jobs.sort_by_key(|j| j.created_at);
        let mut latest: std::collections::HashMap<Cid, Job> = std::collections::HashMap::new();
        for job in jobs {
            latest.insert(job.cid.clone(), job);
        }
        let mut out: Vec<Job> = latest.into_values().collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }
}
