//!
//! tundra core data model
//! ----------------------
//! Shared types for the whole crate: opaque identifiers, the desired-state
//! `StorageConfig` family, reconciliation `Job`s, the last-observed
//! `StorageInfo` per CID, deal errors/records, and per-CID log entries.
//! Every persisted record in the datastore is one of these types encoded
//! as JSON.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::MIN_DEAL_DURATION;

/// Tenant/instance identifier. Must be non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiId(pub String);

impl ApiId {
    pub fn new() -> Self {
        ApiId(uuid::Uuid::new_v4().to_string())
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ApiId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ApiId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally-unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one retrieval attempt, used in retrieval records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetrievalId(pub String);

impl RetrievalId {
    pub fn new() -> Self {
        RetrievalId(uuid::Uuid::new_v4().to_string())
    }
}

/// Content identifier. Opaque to this crate beyond basic well-formedness;
/// the hot and cold layers interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    /// Parse an externally-provided CID string. Rejects empty, padded and
    /// obviously-truncated values; anything else is accepted as opaque.
    pub fn parse(s: &str) -> Result<Self> {
        let t = s.trim();
        if t.is_empty() {
            bail!("cid can't be empty");
        }
        if t != s {
            bail!("cid has surrounding whitespace");
        }
        if t.len() < 8 {
            bail!("cid {t:?} is too short");
        }
        Ok(Cid(t.to_string()))
    }

    /// Wrap a string produced by a trusted layer (hot storage add, tests).
    pub fn from_trusted(s: impl Into<String>) -> Self {
        Cid(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Desired hot-tier state for a CID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotConfig {
    pub enabled: bool,
    /// If the data isn't reachable in the hot network, allow retrieving it
    /// from an active cold deal and re-pinning.
    pub allow_unfreeze: bool,
    /// Max attoFIL accepted for an unfreeze retrieval. Zero means no cap.
    pub unfreeze_max_price: u64,
    pub ipfs: IpfsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpfsConfig {
    /// Seconds allowed for the initial pin attempt.
    pub add_timeout: u64,
}

/// Desired cold-tier state for a CID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdConfig {
    pub enabled: bool,
    pub filecoin: FilConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilConfig {
    /// Desired number of distinct active deals.
    pub rep_factor: usize,
    /// Minimum deal duration in epochs.
    pub deal_min_duration: u64,
    #[serde(default)]
    pub excluded_miners: Vec<String>,
    #[serde(default)]
    pub trusted_miners: Vec<String>,
    #[serde(default)]
    pub country_codes: Vec<String>,
    #[serde(default)]
    pub renew: RenewConfig,
    /// Wallet address deals are paid from.
    pub addr: String,
    /// Max attoFIL-per-epoch-per-GiB accepted from a miner. Zero means no cap.
    #[serde(default)]
    pub max_price: u64,
    #[serde(default)]
    pub fast_retrieval: bool,
    /// Epochs into the future a new deal proposes to start.
    #[serde(default)]
    pub deal_start_offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenewConfig {
    pub enabled: bool,
    /// Remaining-lifetime threshold, in epochs, below which a deal gets a
    /// replacement started.
    pub threshold: u64,
}

/// Desired storage state for one CID across both tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub hot: HotConfig,
    pub cold: ColdConfig,
    #[serde(default)]
    pub repairable: bool,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.hot.enabled && !self.cold.enabled {
            bail!("hot and cold storage can't both be disabled");
        }
        if self.cold.enabled {
            if self.cold.filecoin.rep_factor < 1 {
                bail!("replication factor should be greater than zero, got {}", self.cold.filecoin.rep_factor);
            }
            if self.cold.filecoin.deal_min_duration < MIN_DEAL_DURATION {
                bail!(
                    "deal duration {} is lower than the network minimum {}",
                    self.cold.filecoin.deal_min_duration,
                    MIN_DEAL_DURATION
                );
            }
        }
        Ok(())
    }
}

/// A queued intent: the desired config a Job materializes, plus the CID it
/// targets and, for replaces, the CID being superseded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub api_id: ApiId,
    pub cid: Cid,
    pub cfg: StorageConfig,
    #[serde(default)]
    pub replaced_cid: Option<Cid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Unspecified,
    Queued,
    Executing,
    Failed,
    Canceled,
    Success,
}

impl JobStatus {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Canceled | JobStatus::Success)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Unspecified => "unspecified",
            JobStatus::Queued => "queued",
            JobStatus::Executing => "executing",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Success => "success",
        };
        f.write_str(s)
    }
}

/// One reconciliation attempt driving actual state toward desired state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub api_id: ApiId,
    pub cid: Cid,
    pub status: JobStatus,
    #[serde(default)]
    pub err_cause: Option<String>,
    #[serde(default)]
    pub deal_errors: Vec<DealError>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deal_info: Vec<DealInfo>,
}

impl Job {
    pub fn queued(api_id: ApiId, cid: Cid) -> Self {
        Job {
            id: JobId::new(),
            api_id,
            cid,
            status: JobStatus::Queued,
            err_cause: None,
            deal_errors: Vec::new(),
            created_at: Utc::now(),
            deal_info: Vec::new(),
        }
    }
}

/// A failure making or keeping a deal with one miner. Collected on the Job
/// without necessarily failing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealError {
    #[serde(default)]
    pub proposal_cid: Option<Cid>,
    pub miner: String,
    pub message: String,
}

/// On-chain storage deal lifecycle states the watcher distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DealState {
    Unknown,
    ProposalAccepted,
    Staged,
    Sealing,
    Active,
    ProposalNotFound,
    ProposalRejected,
    Failing,
    NotFound,
    Error,
    Slashed,
    Expired,
}

impl DealState {
    pub fn name(self) -> &'static str {
        match self {
            DealState::Unknown => "StorageDealUnknown",
            DealState::ProposalAccepted => "StorageDealProposalAccepted",
            DealState::Staged => "StorageDealStaged",
            DealState::Sealing => "StorageDealSealing",
            DealState::Active => "StorageDealActive",
            DealState::ProposalNotFound => "StorageDealProposalNotFound",
            DealState::ProposalRejected => "StorageDealProposalRejected",
            DealState::Failing => "StorageDealFailing",
            DealState::NotFound => "StorageDealNotFound",
            DealState::Error => "StorageDealError",
            DealState::Slashed => "StorageDealSlashed",
            DealState::Expired => "StorageDealExpired",
        }
    }

    /// The single terminal-success state.
    pub fn is_active(self) -> bool {
        matches!(self, DealState::Active)
    }

    /// Terminal failure states. Everything not listed here and not Active
    /// is in-flight and keeps being polled.
    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            DealState::ProposalNotFound
                | DealState::ProposalRejected
                | DealState::Failing
                | DealState::NotFound
                | DealState::Error
                | DealState::Slashed
        )
    }
}

/// Point-in-time view of one deal proposal, as reported by the market layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealInfo {
    pub proposal_cid: Cid,
    pub state: DealState,
    pub state_name: String,
    pub miner: String,
    pub piece_cid: Cid,
    pub size: u64,
    pub price_per_epoch: u64,
    pub start_epoch: u64,
    pub duration: u64,
    pub deal_id: u64,
    pub activation_epoch: i64,
    #[serde(default)]
    pub message: String,
}

/// One active (or once-active) storage deal recorded on a CID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilStorage {
    pub proposal_cid: Cid,
    pub piece_cid: Cid,
    pub deal_id: u64,
    pub miner: String,
    pub epoch_price: u64,
    pub start_epoch: u64,
    pub duration: u64,
    pub activation_epoch: i64,
    #[serde(default)]
    pub renewed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpfsHotInfo {
    pub created: Option<DateTime<Utc>>,
}

/// Observed hot-tier state for a CID.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotInfo {
    pub enabled: bool,
    pub size: u64,
    #[serde(default)]
    pub ipfs: IpfsHotInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilInfo {
    pub data_cid: Option<Cid>,
    pub size: u64,
    #[serde(default)]
    pub proposals: Vec<FilStorage>,
}

/// Observed cold-tier state for a CID.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColdInfo {
    pub enabled: bool,
    #[serde(default)]
    pub filecoin: FilInfo,
}

/// Last materialized storage state observed for a CID. Not a source of
/// truth for deals: readers re-verify proposals against the cold layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub job_id: JobId,
    pub api_id: ApiId,
    pub cid: Cid,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub hot: HotInfo,
    #[serde(default)]
    pub cold: ColdInfo,
}

impl StorageInfo {
    /// Default view for a CID never stored: both tiers disabled.
    pub fn empty(api_id: ApiId, cid: Cid) -> Self {
        StorageInfo {
            job_id: JobId(String::new()),
            api_id,
            cid,
            created: Utc::now(),
            hot: HotInfo::default(),
            cold: ColdInfo::default(),
        }
    }
}

/// One human-readable message about a CID, optionally tied to a Job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub cid: Cid,
    #[serde(default)]
    pub job_id: Option<JobId>,
    /// Nanoseconds since the Unix epoch; unique and monotonic per CID.
    pub timestamp: i64,
    pub message: String,
}

/// Storage deal bookkeeping entry, kept from submission until the deal
/// reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealRecord {
    pub addr: String,
    pub time: i64,
    pub deal_info: DealInfo,
    pub pending: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalInfo {
    pub piece_cid: Cid,
    pub size: u64,
    pub min_price: u64,
    pub miner: String,
    #[serde(default)]
    pub miner_peer_id: String,
}

/// One completed retrieval from the cold tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRecord {
    pub id: RetrievalId,
    pub addr: String,
    pub time: i64,
    pub retrieval_info: RetrievalInfo,
}

/// A miner candidate returned by a selector: address plus its current
/// storage ask. `epoch_price` is attoFIL-per-epoch-per-GiB; deal submission
/// multiplies it by piece size in GiB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerProposal {
    pub addr: String,
    pub epoch_price: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> StorageConfig {
        StorageConfig {
            hot: HotConfig {
                enabled: true,
                allow_unfreeze: false,
                unfreeze_max_price: 0,
                ipfs: IpfsConfig { add_timeout: 10 },
            },
            cold: ColdConfig {
                enabled: true,
                filecoin: FilConfig {
                    rep_factor: 1,
                    deal_min_duration: MIN_DEAL_DURATION,
                    excluded_miners: vec![],
                    trusted_miners: vec![],
                    country_codes: vec![],
                    renew: RenewConfig::default(),
                    addr: "f3abcd".to_string(),
                    max_price: 0,
                    fast_retrieval: true,
                    deal_start_offset: 0,
                },
            },
            repairable: false,
        }
    }

    #[test]
    fn validate_accepts_default_shape() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_both_disabled() {
        let mut cfg = base_config();
        cfg.hot.enabled = false;
        cfg.cold.enabled = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_rep_factor() {
        let mut cfg = base_config();
        cfg.cold.filecoin.rep_factor = 0;
        assert!(cfg.validate().is_err());
        // but not when cold is disabled entirely
        cfg.cold.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_short_deal_duration() {
        let mut cfg = base_config();
        cfg.cold.filecoin.deal_min_duration = MIN_DEAL_DURATION - 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cid_parse_rejects_malformed() {
        assert!(Cid::parse("").is_err());
        assert!(Cid::parse("  ").is_err());
        assert!(Cid::parse("Qm").is_err());
        assert!(Cid::parse(" QmValidLooking").is_err());
        assert!(Cid::parse("QmValidLooking").is_ok());
    }

    #[test]
    fn deal_state_terminal_table() {
        use DealState::*;
        for s in [ProposalNotFound, ProposalRejected, Failing, NotFound, Error, Slashed] {
            assert!(s.is_terminal_failure(), "{} should be terminal", s.name());
            assert!(!s.is_active());
        }
        for s in [Unknown, ProposalAccepted, Staged, Sealing, Expired] {
            assert!(!s.is_terminal_failure(), "{} should not be terminal", s.name());
        }
        assert!(Active.is_active());
        assert!(!Active.is_terminal_failure());
    }

    #[test]
    fn job_status_terminal() {
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Executing.is_terminal());
    }
}
