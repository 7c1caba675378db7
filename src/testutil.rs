//!
//! Test support: in-memory fakes for every capability the scheduler
//! consumes. Unit tests and the integration suite script these instead of
//! talking to real IPFS/Filecoin nodes. Not compiled out of non-test
//! builds on purpose: downstream crates reuse the fakes for their own
//! integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::deals::{DealParams, ImportedPiece, MarketApi, RetrievalOffer};
use crate::hot::HotStorage;
use crate::types::{Cid, ColdConfig, DealInfo, DealState, FilConfig, HotConfig, IpfsConfig, RenewConfig, StorageConfig};
use crate::util::MIN_DEAL_DURATION;

/// Initialize tracing for tests; safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// A valid default storage config for tests: hot enabled, cold enabled
/// with replication factor 1.
pub fn default_config(wallet_addr: &str) -> StorageConfig {
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
                addr: wallet_addr.to_string(),
                max_price: 0,
                fast_retrieval: true,
                deal_start_offset: 0,
            },
        },
        repairable: false,
    }
}

// ---------------------------------------------------------------------------
// FakeHot
// ---------------------------------------------------------------------------

struct HotInner {
    blobs: HashMap<String, Vec<u8>>,
    pinned: HashSet<String>,
    fail_store: HashMap<String, String>,
}

/// In-memory hot tier. A CID whose content is unknown behaves like an
/// unreachable IPFS path: `store` keeps searching until the caller's
/// timeout fires.
pub struct FakeHot {
    inner: Mutex<HotInner>,
}

impl FakeHot {
    pub fn new() -> Self {
        FakeHot {
            inner: Mutex::new(HotInner {
                blobs: HashMap::new(),
                pinned: HashSet::new(),
                fail_store: HashMap::new(),
            }),
        }
    }

    /// Content-address bytes the way the fake network would.
    pub fn cid_of(data: &[u8]) -> Cid {
        let digest = Sha256::digest(data);
        Cid::from_trusted(format!("bafy{}", hex_prefix(&digest, 20)))
    }

    /// Make a CID's content resolvable so `store` can pin it.
    pub fn make_reachable(&self, cid: &Cid, data: Vec<u8>) {
        self.inner.lock().blobs.insert(cid.as_str().to_string(), data);
    }

    /// Forget a CID's content: further `store` calls block until timeout.
    pub fn make_unreachable(&self, cid: &Cid) {
        self.inner.lock().blobs.remove(cid.as_str());
    }

    /// Make `store` fail immediately instead of searching the network.
    pub fn fail_store_with(&self, cid: &Cid, msg: &str) {
        self.inner.lock().fail_store.insert(cid.as_str().to_string(), msg.to_string());
    }

    pub fn is_pinned(&self, cid: &Cid) -> bool {
        self.inner.lock().pinned.contains(cid.as_str())
    }
}

impl Default for FakeHot {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().take(n).map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl HotStorage for FakeHot {
    async fn add(&self, data: &[u8]) -> Result<Cid> {
        let cid = Self::cid_of(data);
        self.make_reachable(&cid, data.to_vec());
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .blobs
            .get(cid.as_str())
            .cloned()
            .ok_or_else(|| anyhow!("cid {cid} not available in hot storage"))
    }

    async fn store(&self, cid: &Cid) -> Result<u64> {
        let (fail, reachable, size) = {
            let inner = self.inner.lock();
            (
                inner.fail_store.get(cid.as_str()).cloned(),
                inner.blobs.contains_key(cid.as_str()),
                inner.blobs.get(cid.as_str()).map(|b| b.len() as u64).unwrap_or(0),
            )
        };
        if let Some(msg) = fail {
            return Err(anyhow!("{msg}"));
        }
        if !reachable {
            // Unreachable content: an IPFS pin would search the network
            // indefinitely. Only the caller's timeout ends this.
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
        self.inner.lock().pinned.insert(cid.as_str().to_string());
        Ok(size)
    }

    async fn replace(&self, old: &Cid, new: &Cid) -> Result<u64> {
        let size = self.store(new).await?;
        self.inner.lock().pinned.remove(old.as_str());
        Ok(size)
    }

    async fn remove(&self, cid: &Cid) -> Result<()> {
        self.inner.lock().pinned.remove(cid.as_str());
        Ok(())
    }

    async fn is_stored(&self, cid: &Cid) -> Result<bool> {
        Ok(self.is_pinned(cid))
    }
}

// ---------------------------------------------------------------------------
// FakeMarket
// ---------------------------------------------------------------------------

type RetrieveHook = Box<dyn Fn(&Cid) + Send + Sync>;

struct MarketInner {
    piece_size: u64,
    chain_head: u64,
    next_proposal: u64,
    next_deal_id: u64,
    reject: HashMap<String, String>,
    deals: HashMap<String, DealInfo>,
    poll_counts: HashMap<String, u32>,
    auto_activate_after: Option<u32>,
    submitted: Vec<DealParams>,
    offers: HashMap<String, Vec<(RetrievalOffer, Vec<u8>)>>,
    fail_retrieval: HashSet<String>,
}

/// Scripted Filecoin market. Deal state machines advance either manually
/// (`activate_deal`/`fail_deal`) or automatically after a configured
/// number of polls.
pub struct FakeMarket {
    inner: Mutex<MarketInner>,
    on_retrieve: Mutex<Option<RetrieveHook>>,
}

impl FakeMarket {
    pub fn new() -> Self {
        FakeMarket {
            inner: Mutex::new(MarketInner {
                piece_size: 1024,
                chain_head: 10_000,
                next_proposal: 0,
                next_deal_id: 1,
                reject: HashMap::new(),
                deals: HashMap::new(),
                poll_counts: HashMap::new(),
                auto_activate_after: None,
                submitted: Vec::new(),
                offers: HashMap::new(),
                fail_retrieval: HashSet::new(),
            }),
            on_retrieve: Mutex::new(None),
        }
    }

    pub fn set_piece_size(&self, size: u64) {
        self.inner.lock().piece_size = size;
    }

    pub fn set_chain_head(&self, head: u64) {
        self.inner.lock().chain_head = head;
    }

    /// Every deal transitions to Active after its state is polled `n` times.
    pub fn auto_activate_after(&self, n: u32) {
        self.inner.lock().auto_activate_after = Some(n);
    }

    /// Deals stay in flight until advanced manually.
    pub fn disable_auto_activate(&self) {
        self.inner.lock().auto_activate_after = None;
    }

    /// All proposals to this miner fail at submission.
    pub fn reject_miner(&self, miner: &str, msg: &str) {
        self.inner.lock().reject.insert(miner.to_string(), msg.to_string());
    }

    pub fn activate_deal(&self, proposal_cid: &Cid, activation_epoch: i64, deal_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(info) = inner.deals.get_mut(proposal_cid.as_str()) {
            info.state = DealState::Active;
            info.state_name = DealState::Active.name().to_string();
            info.activation_epoch = activation_epoch;
            info.deal_id = deal_id;
        }
    }

    pub fn fail_deal(&self, proposal_cid: &Cid, state: DealState, msg: &str) {
        let mut inner = self.inner.lock();
        if let Some(info) = inner.deals.get_mut(proposal_cid.as_str()) {
            info.state = state;
            info.state_name = state.name().to_string();
            info.message = msg.to_string();
        }
    }

    /// Mark an active deal slashed.
    pub fn slash_deal(&self, proposal_cid: &Cid) {
        self.fail_deal(proposal_cid, DealState::Slashed, "deal slashed");
    }

    pub fn deal_info_sync(&self, proposal_cid: &Cid) -> DealInfo {
        self.inner.lock().deals.get(proposal_cid.as_str()).cloned().expect("unknown proposal")
    }

    pub fn submitted_deals(&self) -> Vec<DealParams> {
        self.inner.lock().submitted.clone()
    }

    pub fn add_retrieval_offer(&self, data_cid: &Cid, miner: &str, min_price: u64, data: Vec<u8>) {
        let size = data.len() as u64;
        let offer = RetrievalOffer {
            miner: miner.to_string(),
            miner_peer_id: format!("peer-{miner}"),
            min_price,
            size,
        };
        self.inner
            .lock()
            .offers
            .entry(data_cid.as_str().to_string())
            .or_default()
            .push((offer, data));
    }

    pub fn fail_retrieval_from(&self, miner: &str) {
        self.inner.lock().fail_retrieval.insert(miner.to_string());
    }

    /// Hook invoked after every successful retrieval; lets a test mark the
    /// payload reachable in a `FakeHot` (unfreeze wiring).
    pub fn set_on_retrieve(&self, hook: impl Fn(&Cid) + Send + Sync + 'static) {
        *self.on_retrieve.lock() = Some(Box::new(hook));
    }
}

impl Default for FakeMarket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketApi for FakeMarket {
    async fn import_data(&self, data_cid: &Cid) -> Result<ImportedPiece> {
        let inner = self.inner.lock();
        Ok(ImportedPiece {
            piece_cid: Cid::from_trusted(format!("bafypiece{data_cid}")),
            piece_size: inner.piece_size,
        })
    }

    async fn start_deal(&self, params: &DealParams) -> Result<Cid> {
        let mut inner = self.inner.lock();
        if let Some(msg) = inner.reject.get(&params.miner) {
            let msg = msg.clone();
            inner.submitted.push(params.clone());
            return Err(anyhow!("{msg}"));
        }
        inner.next_proposal += 1;
        let pcid = format!("bafyprop{:08}", inner.next_proposal);
        let info = DealInfo {
            proposal_cid: Cid::from_trusted(pcid.clone()),
            state: DealState::Sealing,
            state_name: DealState::Sealing.name().to_string(),
            miner: params.miner.clone(),
            piece_cid: Cid::from_trusted(format!("bafypiece{}", params.data_cid)),
            size: inner.piece_size,
            price_per_epoch: params.epoch_price,
            start_epoch: params.start_epoch,
            duration: params.min_duration,
            deal_id: 0,
            activation_epoch: -1,
            message: String::new(),
        };
        inner.deals.insert(pcid.clone(), info);
        inner.submitted.push(params.clone());
        Ok(Cid::from_trusted(pcid))
    }

    async fn deal_info(&self, proposal_cid: &Cid) -> Result<DealInfo> {
        let mut inner = self.inner.lock();
        let head = inner.chain_head;
        let auto = inner.auto_activate_after;
        let count = {
            let c = inner.poll_counts.entry(proposal_cid.as_str().to_string()).or_insert(0);
            *c += 1;
            *c
        };
        let next_deal_id = inner.next_deal_id;
        let Some(info) = inner.deals.get_mut(proposal_cid.as_str()) else {
            return Err(anyhow!("deal not found on-chain"));
        };
        if let Some(after) = auto {
            if count >= after && !info.state.is_active() && !info.state.is_terminal_failure() {
                info.state = DealState::Active;
                info.state_name = DealState::Active.name().to_string();
                info.activation_epoch = head as i64;
                info.deal_id = next_deal_id;
            }
        }
        let out = info.clone();
        if out.state.is_active() && out.deal_id == next_deal_id {
            inner.next_deal_id += 1;
        }
        Ok(out)
    }

    async fn chain_head(&self) -> Result<u64> {
        Ok(self.inner.lock().chain_head)
    }

    async fn find_data(&self, data_cid: &Cid) -> Result<Vec<RetrievalOffer>> {
        let inner = self.inner.lock();
        Ok(inner
            .offers
            .get(data_cid.as_str())
            .map(|v| v.iter().map(|(o, _)| o.clone()).collect())
            .unwrap_or_default())
    }

    async fn retrieve(&self, _wallet: &str, data_cid: &Cid, offer: &RetrievalOffer) -> Result<Vec<u8>> {
        let bytes = {
            let inner = self.inner.lock();
            if inner.fail_retrieval.contains(&offer.miner) {
                return Err(anyhow!("miner {} refused retrieval", offer.miner));
            }
            inner
                .offers
                .get(data_cid.as_str())
                .and_then(|v| v.iter().find(|(o, _)| o.miner == offer.miner))
                .map(|(_, data)| data.clone())
                .ok_or_else(|| anyhow!("no offer from {} for {}", offer.miner, data_cid))?
        };
        if let Some(hook) = self.on_retrieve.lock().as_ref() {
            hook(data_cid);
        }
        Ok(bytes)
    }
}
