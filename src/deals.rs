//!
//! Market module
//! -------------
//! Storage-deal plumbing against a narrow Filecoin client capability
//! (`MarketApi`): per-miner deal submission with epoch-price
//! normalization, poll-based deal watching, durable deal/retrieval
//! records, and data retrieval over discovered offers.
//!
//! Record layout under the `deals/` namespace: `storage-pending/`,
//! `storage-final/`, `retrieval/`. A deal record is pending from
//! submission until the watcher sees a terminal state, then it either
//! becomes final (active) or is dropped (failed).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::datastore::Datastore;
use crate::types::{
    Cid, DealInfo, DealRecord, DealState, MinerProposal, RetrievalId, RetrievalInfo,
    RetrievalRecord,
};
use crate::util::deal_epoch_price;

const CHAN_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Returned when no provider has the requested data available.
pub fn err_no_retrieval_providers() -> anyhow::Error {
    anyhow!("no providers to retrieve the data")
}

/// Everything needed to submit one storage deal.
#[derive(Debug, Clone)]
pub struct DealParams {
    pub data_cid: Cid,
    pub miner: String,
    /// Total attoFIL per epoch for this piece (already scaled by size).
    pub epoch_price: u64,
    pub min_duration: u64,
    pub start_epoch: u64,
    pub wallet: String,
    pub fast_retrieval: bool,
}

/// Piece information produced by importing a payload into the market client.
#[derive(Debug, Clone)]
pub struct ImportedPiece {
    pub piece_cid: Cid,
    pub piece_size: u64,
}

/// One provider offer for retrieving a payload.
#[derive(Debug, Clone)]
pub struct RetrievalOffer {
    pub miner: String,
    pub miner_peer_id: String,
    pub min_price: u64,
    pub size: u64,
}

/// Narrow Filecoin client contract the market module consumes. The real
/// node lives outside this crate; tests script this trait.
#[async_trait]
pub trait MarketApi: Send + Sync {
    /// Import the payload identified by `data_cid` and report piece info.
    async fn import_data(&self, data_cid: &Cid) -> Result<ImportedPiece>;
    /// Submit a deal proposal; returns its proposal CID.
    async fn start_deal(&self, params: &DealParams) -> Result<Cid>;
    /// Current state of a proposal. A slashed deal reports
    /// `DealState::Slashed` regardless of its market-level state.
    async fn deal_info(&self, proposal_cid: &Cid) -> Result<DealInfo>;
    /// Current chain height in epochs.
    async fn chain_head(&self) -> Result<u64>;
    /// Providers able to serve `data_cid`.
    async fn find_data(&self, data_cid: &Cid) -> Result<Vec<RetrievalOffer>>;
    /// Retrieve the payload from one provider, paying up to the offer price.
    async fn retrieve(&self, wallet: &str, data_cid: &Cid, offer: &RetrievalOffer) -> Result<Vec<u8>>;
}

/// Outcome of one per-miner submission attempt.
#[derive(Debug, Clone)]
pub struct StoreResult {
    pub config: MinerProposal,
    pub proposal_cid: Option<Cid>,
    pub message: String,
    pub success: bool,
}

/// Options for listing deal records.
#[derive(Debug, Clone)]
pub struct DealRecordsFilter {
    pub include_pending: bool,
    pub include_final: bool,
    /// When non-empty, only records paid from these wallet addresses.
    pub addrs: Vec<String>,
    pub ascending: bool,
}

impl Default for DealRecordsFilter {
    fn default() -> Self {
        DealRecordsFilter { include_pending: true, include_final: true, addrs: Vec::new(), ascending: true }
    }
}

pub struct Module {
    ds: Arc<dyn Datastore>,
    api: Arc<dyn MarketApi>,
    poll_interval: Duration,
    record_lock: Mutex<()>,
}

impl Module {
    pub fn new(ds: Arc<dyn Datastore>, api: Arc<dyn MarketApi>, poll_interval: Duration) -> Self {
        Module { ds, api, poll_interval, record_lock: Mutex::new(()) }
    }

    pub fn api(&self) -> &Arc<dyn MarketApi> {
        &self.api
    }

    /// Import the payload and submit one deal per miner config. The price
    /// sent to each miner is its quoted attoFIL-per-epoch-per-GiB scaled by
    /// the piece size. Per-miner failures are reported in the result list,
    /// never as an error.
    pub async fn store(
        &self,
        wallet: &str,
        data_cid: &Cid,
        configs: &[MinerProposal],
        min_duration: u64,
        start_epoch: u64,
        fast_retrieval: bool,
    ) -> Result<(ImportedPiece, Vec<StoreResult>)> {
        let piece = self
            .api
            .import_data(data_cid)
            .await
            .with_context(|| format!("importing {data_cid} into the market client"))?;

        let mut results = Vec::with_capacity(configs.len());
        for cfg in configs {
            let params = DealParams {
                data_cid: data_cid.clone(),
                miner: cfg.addr.clone(),
                epoch_price: deal_epoch_price(cfg.epoch_price, piece.piece_size),
                min_duration,
                start_epoch,
                wallet: wallet.to_string(),
                fast_retrieval,
            };
            match self.api.start_deal(&params).await {
                Ok(proposal_cid) => {
                    debug!(target: "tundra::deals", "deal with {} started: {}", cfg.addr, proposal_cid);
                    self.record_started(&params, &piece, &proposal_cid)?;
                    results.push(StoreResult {
                        config: cfg.clone(),
                        proposal_cid: Some(proposal_cid),
                        message: String::new(),
                        success: true,
                    });
                }
                Err(e) => {
                    warn!(target: "tundra::deals", "starting deal with {}: {:#}", cfg.addr, e);
                    results.push(StoreResult {
                        config: cfg.clone(),
                        proposal_cid: None,
                        message: format!("{e:#}"),
                        success: false,
                    });
                }
            }
        }
        Ok((piece, results))
    }

    /// Poll the given proposals and emit a `DealInfo` every time one
    /// changes state, until the token is cancelled or the receiver is
    /// dropped. A blocked receiver drops updates after a short timeout
    /// instead of stalling the poller.
    pub fn watch(&self, proposals: Vec<Cid>, cancel: CancellationToken) -> mpsc::Receiver<DealInfo> {
        let (tx, rx) = mpsc::channel(proposals.len().max(1) * 4);
        let api = self.api.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut last_state: std::collections::HashMap<Cid, DealState> =
                std::collections::HashMap::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                for pcid in &proposals {
                    let info = match api.deal_info(pcid).await {
                        Ok(info) => info,
                        Err(e) => {
                            warn!(target: "tundra::deals", "getting deal info of {}: {:#}", pcid, e);
                            continue;
                        }
                    };
                    if last_state.get(pcid) == Some(&info.state) {
                        continue;
                    }
                    last_state.insert(pcid.clone(), info.state);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        res = tokio::time::timeout(CHAN_WRITE_TIMEOUT, tx.send(info)) => {
                            match res {
                                Ok(Ok(())) => {}
                                Ok(Err(_)) => return, // receiver gone
                                Err(_) => warn!(target: "tundra::deals", "dropping deal update on blocked receiver"),
                            }
                        }
                    }
                }
            }
        });
        rx
    }

    /// True iff the proposal's on-chain deal is active and not slashed.
    pub async fn is_deal_active(&self, proposal_cid: &Cid) -> Result<bool> {
        match self.api.deal_info(proposal_cid).await {
            Ok(info) => Ok(info.state.is_active()),
            Err(e) => {
                // An expired or never-published deal is simply not active.
                if is_not_found(&e) {
                    return Ok(false);
                }
                Err(e)
            }
        }
    }

    /// Fold a terminal deal outcome into the records: pending becomes
    /// final when the deal activated, or disappears when it failed.
    pub fn settle_deal(&self, info: &DealInfo) -> Result<()> {
        let _g = self.record_lock.lock();
        let pending_key = pending_key(&info.proposal_cid);
        let Some(buf) = self.ds.get(&pending_key)? else {
            return Ok(());
        };
        let pending: DealRecord = serde_json::from_slice(&buf).context("decoding pending deal record")?;
        self.ds.delete(&pending_key)?;
        if info.state.is_active() {
            let record = DealRecord {
                addr: pending.addr,
                time: chrono::Utc::now().timestamp(),
                deal_info: info.clone(),
                pending: false,
            };
            let buf = serde_json::to_vec(&record).context("encoding final deal record")?;
            self.ds.put(&final_key(&info.proposal_cid), buf)?;
        }
        Ok(())
    }

    /// Fetch the payload into the local node without materializing it for
    /// the caller; used by unfreeze. `max_price` of zero means no cap.
    pub async fn fetch(&self, wallet: &str, data_cid: &Cid, max_price: u64) -> Result<()> {
        self.retrieve_inner(wallet, data_cid, max_price).await.map(|_| ())
    }

    /// Retrieve the payload bytes for a client download.
    pub async fn retrieve(&self, wallet: &str, data_cid: &Cid, max_price: u64) -> Result<Vec<u8>> {
        self.retrieve_inner(wallet, data_cid, max_price).await
    }

    async fn retrieve_inner(&self, wallet: &str, data_cid: &Cid, max_price: u64) -> Result<Vec<u8>> {
        let offers = self
            .api
            .find_data(data_cid)
            .await
            .with_context(|| format!("finding providers for {data_cid}"))?;
        let offers: Vec<RetrievalOffer> = offers
            .into_iter()
            .filter(|o| max_price == 0 || o.min_price <= max_price)
            .collect();
        if offers.is_empty() {
            return Err(err_no_retrieval_providers());
        }
        let mut last_err = None;
        for offer in &offers {
            match self.api.retrieve(wallet, data_cid, offer).await {
                Ok(bytes) => {
                    self.record_retrieval(wallet, data_cid, offer)?;
                    return Ok(bytes);
                }
                Err(e) => {
                    debug!(target: "tundra::deals", "retrieving {} from {}: {:#}", data_cid, offer.miner, e);
                    last_err = Some(e);
                }
            }
        }
        Err(anyhow!(
            "couldn't retrieve data from any miner, last err: {:#}",
            last_err.unwrap_or_else(|| anyhow!("none"))
        ))
    }

    /// Deal records matching the filter. Pending records sort by
    /// submission time; final records by activation epoch, then time.
    pub fn storage_deal_records(&self, filter: &DealRecordsFilter) -> Result<Vec<DealRecord>> {
        let mut out = Vec::new();
        if filter.include_pending {
            let mut pending = self.load_records::<DealRecord>("storage-pending/")?;
            pending.sort_by_key(|r| r.time);
            out.extend(pending);
        }
        if filter.include_final {
            let mut fin = self.load_records::<DealRecord>("storage-final/")?;
            fin.sort_by(|a, b| {
                a.deal_info
                    .activation_epoch
                    .cmp(&b.deal_info.activation_epoch)
                    .then(a.time.cmp(&b.time))
            });
            out.extend(fin);
        }
        if !filter.addrs.is_empty() {
            out.retain(|r| filter.addrs.iter().any(|a| a == &r.addr));
        }
        if !filter.ascending {
            out.reverse();
        }
        Ok(out)
    }

    /// Retrieval records, sorted by time.
    pub fn retrieval_records(&self, filter: &DealRecordsFilter) -> Result<Vec<RetrievalRecord>> {
        let mut out = self.load_records::<RetrievalRecord>("retrieval/")?;
        out.sort_by_key(|r| r.time);
        if !filter.addrs.is_empty() {
            out.retain(|r| filter.addrs.iter().any(|a| a == &r.addr));
        }
        if !filter.ascending {
            out.reverse();
        }
        Ok(out)
    }

    fn record_started(&self, params: &DealParams, piece: &ImportedPiece, proposal_cid: &Cid) -> Result<()> {
        let _g = self.record_lock.lock();
        let record = DealRecord {
            addr: params.wallet.clone(),
            time: chrono::Utc::now().timestamp(),
            deal_info: DealInfo {
                proposal_cid: proposal_cid.clone(),
                state: DealState::Unknown,
                state_name: DealState::Unknown.name().to_string(),
                miner: params.miner.clone(),
                piece_cid: piece.piece_cid.clone(),
                size: piece.piece_size,
                price_per_epoch: params.epoch_price,
                start_epoch: params.start_epoch,
                duration: params.min_duration,
                deal_id: 0,
                activation_epoch: -1,
                message: String::new(),
            },
            pending: true,
        };
        let buf = serde_json::to_vec(&record).context("encoding pending deal record")?;
        self.ds.put(&pending_key(proposal_cid), buf).context("persisting pending deal record")
    }

    fn record_retrieval(&self, wallet: &str, data_cid: &Cid, offer: &RetrievalOffer) -> Result<()> {
        let _g = self.record_lock.lock();
        let id = RetrievalId::new();
        let record = RetrievalRecord {
            id: id.clone(),
            addr: wallet.to_string(),
            time: chrono::Utc::now().timestamp(),
            retrieval_info: RetrievalInfo {
                piece_cid: data_cid.clone(),
                size: offer.size,
                min_price: offer.min_price,
                miner: offer.miner.clone(),
                miner_peer_id: offer.miner_peer_id.clone(),
            },
        };
        let buf = serde_json::to_vec(&record).context("encoding retrieval record")?;
        self.ds
            .put(&format!("retrieval/{}", id.0), buf)
            .context("persisting retrieval record")
    }

    fn load_records<T: serde::de::DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for (key, buf) in self.ds.query_prefix(prefix)? {
            let rec: T = serde_json::from_slice(&buf)
                .with_context(|| format!("decoding deal record at {key}"))?;
            out.push(rec);
        }
        Ok(out)
    }
}

fn pending_key(proposal_cid: &Cid) -> String {
    format!("storage-pending/{proposal_cid}")
}

fn final_key(proposal_cid: &Cid) -> String {
    format!("storage-final/{proposal_cid}")
}

fn is_not_found(err: &anyhow::Error) -> bool {
    format!("{err:#}").contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemDatastore;
    use crate::testutil::FakeMarket;
    use crate::util::GIB;

    fn module(api: Arc<FakeMarket>) -> Module {
        Module::new(Arc::new(MemDatastore::new()), api, Duration::from_millis(10))
    }

    fn props(addrs: &[(&str, u64)]) -> Vec<MinerProposal> {
        addrs
            .iter()
            .map(|(a, p)| MinerProposal { addr: a.to_string(), epoch_price: *p })
            .collect()
    }

    #[tokio::test]
    async fn store_submits_one_deal_per_miner_with_scaled_price() {
        let api = Arc::new(FakeMarket::new());
        api.set_piece_size(GIB / 2);
        let m = module(api.clone());
        let data = Cid::from_trusted("QmPayload1");

        let (piece, results) = m
            .store("f3wallet", &data, &props(&[("f0100", 100), ("f0200", 40)]), 600_000, 5000, true)
            .await
            .unwrap();
        assert_eq!(piece.piece_size, GIB / 2);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));

        let submitted = api.submitted_deals();
        assert_eq!(submitted.len(), 2);
        // 100 attoFIL/epoch/GiB on half a GiB piece.
        assert_eq!(submitted[0].epoch_price, 50);
        assert_eq!(submitted[1].epoch_price, 20);
    }

    #[tokio::test]
    async fn store_collects_per_miner_failures() {
        let api = Arc::new(FakeMarket::new());
        api.reject_miner("f0666", "miner rejected the proposal");
        let m = module(api);
        let data = Cid::from_trusted("QmPayload2");

        let (_, results) = m
            .store("f3wallet", &data, &props(&[("f0100", 10), ("f0666", 10)]), 600_000, 5000, false)
            .await
            .unwrap();
        let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].config.addr, "f0666");
        assert!(failed[0].message.contains("rejected"));
    }

    #[tokio::test]
    async fn pending_records_settle_to_final_on_active() {
        let api = Arc::new(FakeMarket::new());
        let m = module(api.clone());
        let data = Cid::from_trusted("QmPayload3");
        let (_, results) = m
            .store("f3wallet", &data, &props(&[("f0100", 10)]), 600_000, 5000, false)
            .await
            .unwrap();
        let pcid = results[0].proposal_cid.clone().unwrap();

        let recs = m.storage_deal_records(&DealRecordsFilter::default()).unwrap();
        assert_eq!(recs.len(), 1);
        assert!(recs[0].pending);

        api.activate_deal(&pcid, 7, 42);
        let info = api.deal_info_sync(&pcid);
        m.settle_deal(&info).unwrap();

        let recs = m.storage_deal_records(&DealRecordsFilter::default()).unwrap();
        assert_eq!(recs.len(), 1);
        assert!(!recs[0].pending);
        assert_eq!(recs[0].deal_info.deal_id, 42);
    }

    #[tokio::test]
    async fn failed_deals_drop_their_pending_record() {
        let api = Arc::new(FakeMarket::new());
        let m = module(api.clone());
        let data = Cid::from_trusted("QmPayload4");
        let (_, results) = m
            .store("f3wallet", &data, &props(&[("f0100", 10)]), 600_000, 5000, false)
            .await
            .unwrap();
        let pcid = results[0].proposal_cid.clone().unwrap();

        api.fail_deal(&pcid, DealState::ProposalRejected, "no space");
        let info = api.deal_info_sync(&pcid);
        m.settle_deal(&info).unwrap();
        assert!(m.storage_deal_records(&DealRecordsFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn watch_emits_on_state_change_and_stops_on_cancel() {
        let api = Arc::new(FakeMarket::new());
        let m = module(api.clone());
        let data = Cid::from_trusted("QmPayload5");
        let (_, results) = m
            .store("f3wallet", &data, &props(&[("f0100", 10)]), 600_000, 5000, false)
            .await
            .unwrap();
        let pcid = results[0].proposal_cid.clone().unwrap();

        let cancel = CancellationToken::new();
        let mut rx = m.watch(vec![pcid.clone()], cancel.clone());

        // First poll reports the current (in-flight) state.
        let first = rx.recv().await.unwrap();
        assert!(!first.state.is_active());

        api.activate_deal(&pcid, 9, 1);
        let upd = rx.recv().await.unwrap();
        assert!(upd.state.is_active());
        assert_eq!(upd.activation_epoch, 9);

        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn retrieval_filters_offers_by_price_and_records() {
        let api = Arc::new(FakeMarket::new());
        let data = Cid::from_trusted("QmPayload6");
        api.add_retrieval_offer(&data, "f0100", 500, b"hello".to_vec());
        api.add_retrieval_offer(&data, "f0200", 5, b"hello".to_vec());
        let m = module(api);

        // Cap excludes the expensive offer; cheap one serves the bytes.
        let bytes = m.retrieve("f3wallet", &data, 10).await.unwrap();
        assert_eq!(bytes, b"hello");
        let recs = m.retrieval_records(&DealRecordsFilter::default()).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].retrieval_info.miner, "f0200");

        // A cap below every offer yields the no-providers error.
        let err = m.retrieve("f3wallet", &data, 1).await.unwrap_err();
        assert!(format!("{err:#}").contains("no providers"));
    }

    #[tokio::test]
    async fn retrieval_falls_through_to_next_offer() {
        let api = Arc::new(FakeMarket::new());
        let data = Cid::from_trusted("QmPayload8");
        api.add_retrieval_offer(&data, "f0100", 1, b"payload".to_vec());
        api.add_retrieval_offer(&data, "f0200", 2, b"payload".to_vec());
        api.fail_retrieval_from("f0100");
        let m = module(api);

        let bytes = m.retrieve("f3wallet", &data, 0).await.unwrap();
        assert_eq!(bytes, b"payload");
        let recs = m.retrieval_records(&DealRecordsFilter::default()).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].retrieval_info.miner, "f0200");
    }

    #[tokio::test]
    async fn record_listing_respects_filter() {
        let api = Arc::new(FakeMarket::new());
        let m = module(api.clone());
        let data = Cid::from_trusted("QmPayload7");
        m.store("f3aaa", &data, &props(&[("f0100", 10)]), 600_000, 5000, false).await.unwrap();
        m.store("f3bbb", &data, &props(&[("f0200", 10)]), 600_000, 5000, false).await.unwrap();

        let only_a = DealRecordsFilter { addrs: vec!["f3aaa".into()], ..Default::default() };
        let recs = m.storage_deal_records(&only_a).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].addr, "f3aaa");

        let no_pending = DealRecordsFilter { include_pending: false, ..Default::default() };
        assert!(m.storage_deal_records(&no_pending).unwrap().is_empty());
    }
}
