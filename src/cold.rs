//!
//! Cold storage
//! ------------
//! Filecoin-backed durable tier. `FilCold` drives the deal lifecycle over
//! the market module: miner selection, per-miner proposal submission,
//! watching proposals to a terminal state, proactive renewal, and
//! retrieval back out of the network (unfreeze).
//!
//! Terminal-state table: `Active` is the only success. `ProposalNotFound`,
//! `ProposalRejected`, `Failing`, `NotFound`, `Error` and `Slashed` are
//! terminal failures. Every other state keeps being polled.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::deals;
use crate::error::AppError;
use crate::joblog::JobLogger;
use crate::miners::{MinerFilter, MinerSelector};
use crate::types::{Cid, DealError, DealInfo, FilConfig, FilInfo, FilStorage, JobId};
use crate::util::{deal_duration, deal_epoch_price, deal_start_epoch};

/// Result of submitting new deals for a CID.
#[derive(Debug, Clone, Default)]
pub struct ColdStoreOutcome {
    /// Proposals accepted for submission, still in flight.
    pub started: Vec<FilStorage>,
    /// Per-miner submission failures.
    pub rejected: Vec<DealError>,
    /// Piece size of the imported payload.
    pub size: u64,
}

#[async_trait]
pub trait ColdStorage: Send + Sync {
    /// Select miners and submit one deal per miner for `cid`. Per-miner
    /// rejections are collected, not raised.
    async fn store(
        &self,
        cid: &Cid,
        jid: Option<&JobId>,
        cfg: &FilConfig,
    ) -> Result<ColdStoreOutcome>;

    /// Drive each started proposal to a terminal state. Returns activated
    /// proposals and per-proposal failures. Reacts to cancellation within
    /// one poll interval.
    async fn wait_for_deals(
        &self,
        cid: &Cid,
        jid: Option<&JobId>,
        started: &[FilStorage],
        cancel: &CancellationToken,
    ) -> Result<(Vec<FilStorage>, Vec<DealError>)>;

    /// True iff the proposal's deal is on-chain, active, and not slashed.
    async fn is_fil_deal_active(&self, proposal_cid: &Cid) -> Result<bool>;

    /// Start replacement deals for proposals whose remaining lifetime fell
    /// below the renew threshold. Returns the updated FilInfo and renewal
    /// failures.
    async fn ensure_renewals(
        &self,
        cid: &Cid,
        info: FilInfo,
        cfg: &FilConfig,
        cancel: &CancellationToken,
    ) -> Result<(FilInfo, Vec<DealError>)>;

    /// Retrieve the payload into the local hot node (unfreeze).
    async fn fetch(&self, data_cid: &Cid, wallet: &str, max_price: u64) -> Result<()>;

    /// Retrieve the payload bytes for a client.
    async fn retrieve(&self, data_cid: &Cid, wallet: &str, max_price: u64) -> Result<Vec<u8>>;
}

pub struct FilCold {
    selector: Arc<dyn MinerSelector>,
    market: Arc<deals::Module>,
    logger: Arc<JobLogger>,
}

impl FilCold {
    pub fn new(selector: Arc<dyn MinerSelector>, market: Arc<deals::Module>, logger: Arc<JobLogger>) -> Self {
        FilCold { selector, market, logger }
    }

    fn filter_for(cfg: &FilConfig) -> MinerFilter {
        MinerFilter {
            excluded: cfg.excluded_miners.clone(),
            trusted: cfg.trusted_miners.clone(),
            country_codes: cfg.country_codes.clone(),
            max_price: cfg.max_price,
        }
    }
}

#[async_trait]
impl ColdStorage for FilCold {
    async fn store(&self, cid: &Cid, jid: Option<&JobId>, cfg: &FilConfig) -> Result<ColdStoreOutcome> {
        let miners = self
            .selector
            .get_miners(cfg.rep_factor, &Self::filter_for(cfg))
            .await
            .context("selecting miners to make deals")?;
        self.logger.log(cid, jid, format!("Selected {} miners for new deals.", miners.len()));

        let head = self.market.api().chain_head().await.context("getting chain head")?;
        let start_epoch = deal_start_epoch(head, cfg.deal_start_offset);
        let duration = deal_duration(cfg.deal_min_duration);

        let (piece, results) = self
            .market
            .store(&cfg.addr, cid, &miners, duration, start_epoch, cfg.fast_retrieval)
            .await
            .context("submitting deals to the market")?;

        let mut outcome = ColdStoreOutcome { size: piece.piece_size, ..Default::default() };
        for res in results {
            match res.proposal_cid {
                Some(proposal_cid) if res.success => {
                    outcome.started.push(FilStorage {
                        proposal_cid,
                        piece_cid: piece.piece_cid.clone(),
                        deal_id: 0,
                        miner: res.config.addr,
                        epoch_price: deal_epoch_price(res.config.epoch_price, piece.piece_size),
                        start_epoch,
                        duration,
                        activation_epoch: -1,
                        renewed: false,
                    });
                }
                _ => {
                    self.logger.log(
                        cid,
                        jid,
                        format!("Deal proposal with miner {} was rejected: {}", res.config.addr, res.message),
                    );
                    outcome.rejected.push(DealError {
                        proposal_cid: None,
                        miner: res.config.addr,
                        message: res.message,
                    });
                }
            }
        }
        Ok(outcome)
    }

    async fn wait_for_deals(
        &self,
        cid: &Cid,
        jid: Option<&JobId>,
        started: &[FilStorage],
        cancel: &CancellationToken,
    ) -> Result<(Vec<FilStorage>, Vec<DealError>)> {
        if started.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let mut pending: HashSet<String> =
            started.iter().map(|p| p.proposal_cid.as_str().to_string()).collect();
        let by_proposal: std::collections::HashMap<String, &FilStorage> =
            started.iter().map(|p| (p.proposal_cid.as_str().to_string(), p)).collect();

        let watch_cancel = cancel.child_token();
        let mut updates = self
            .market
            .watch(started.iter().map(|p| p.proposal_cid.clone()).collect(), watch_cancel.clone());

        let mut active = Vec::new();
        let mut failed = Vec::new();
        while !pending.is_empty() {
            let info: DealInfo = tokio::select! {
                _ = cancel.cancelled() => {
                    watch_cancel.cancel();
                    return Err(anyhow!(AppError::canceled("deal watching canceled")));
                }
                upd = updates.recv() => match upd {
                    Some(info) => info,
                    None => return Err(anyhow!("deal watch channel closed unexpectedly")),
                },
            };
            if !pending.contains(info.proposal_cid.as_str()) {
                continue;
            }
            if info.state.is_active() {
                debug!(target: "tundra::cold", "deal {} with {} is active", info.proposal_cid, info.miner);
                self.logger.log(cid, jid, format!("Deal with miner {} is active on-chain.", info.miner));
                self.market.settle_deal(&info)?;
                let started_entry = by_proposal.get(info.proposal_cid.as_str());
                active.push(FilStorage {
                    proposal_cid: info.proposal_cid.clone(),
                    piece_cid: info.piece_cid.clone(),
                    deal_id: info.deal_id,
                    miner: info.miner.clone(),
                    epoch_price: info.price_per_epoch,
                    start_epoch: info.start_epoch,
                    duration: info.duration,
                    activation_epoch: info.activation_epoch,
                    renewed: started_entry.map(|p| p.renewed).unwrap_or(false),
                });
                pending.remove(info.proposal_cid.as_str());
            } else if info.state.is_terminal_failure() {
                self.logger.log(
                    cid,
                    jid,
                    format!("Deal with miner {} failed with state {}.", info.miner, info.state.name()),
                );
                self.market.settle_deal(&info)?;
                failed.push(DealError {
                    proposal_cid: Some(info.proposal_cid.clone()),
                    miner: info.miner.clone(),
                    message: if info.message.is_empty() {
                        info.state.name().to_string()
                    } else {
                        format!("{}: {}", info.state.name(), info.message)
                    },
                });
                pending.remove(info.proposal_cid.as_str());
            }
        }
        watch_cancel.cancel();
        Ok((active, failed))
    }

    async fn is_fil_deal_active(&self, proposal_cid: &Cid) -> Result<bool> {
        self.market.is_deal_active(proposal_cid).await
    }

    async fn ensure_renewals(
        &self,
        cid: &Cid,
        mut info: FilInfo,
        cfg: &FilConfig,
        cancel: &CancellationToken,
    ) -> Result<(FilInfo, Vec<DealError>)> {
        let head = self.market.api().chain_head().await.context("getting chain head")?;
        let mut errors = Vec::new();
        let mut renewed_proposals: Vec<FilStorage> = Vec::new();

        let holding: Vec<String> = info.proposals.iter().map(|p| p.miner.clone()).collect();
        for p in info.proposals.iter_mut() {
            if p.renewed {
                continue;
            }
            let expiry = p.start_epoch.saturating_add(p.duration);
            let remaining = expiry.saturating_sub(head);
            if remaining >= cfg.renew.threshold {
                continue;
            }
            debug!(target: "tundra::cold", "deal {} of {} has {} epochs left, renewing", p.proposal_cid, cid, remaining);
            self.logger.log(
                cid,
                None,
                format!("Deal with miner {} expires in {} epochs, starting renewal.", p.miner, remaining),
            );

            // The replacement deal avoids miners already holding this CID;
            // losing replication to a single miner defeats the renewal.
            let mut renew_cfg = cfg.clone();
            renew_cfg.rep_factor = 1;
            renew_cfg.excluded_miners.extend(holding.iter().cloned());
            let outcome = match self.store(cid, None, &renew_cfg).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    errors.push(DealError {
                        proposal_cid: Some(p.proposal_cid.clone()),
                        miner: p.miner.clone(),
                        message: format!("starting renewal deal: {e:#}"),
                    });
                    continue;
                }
            };
            errors.extend(outcome.rejected);
            if outcome.started.is_empty() {
                continue;
            }
            let (active, failed) = self.wait_for_deals(cid, None, &outcome.started, cancel).await?;
            errors.extend(failed);
            if active.is_empty() {
                continue;
            }
            p.renewed = true;
            renewed_proposals.extend(active);
        }
        info.proposals.extend(renewed_proposals);
        Ok((info, errors))
    }

    async fn fetch(&self, data_cid: &Cid, wallet: &str, max_price: u64) -> Result<()> {
        self.market.fetch(wallet, data_cid, max_price).await
    }

    async fn retrieve(&self, data_cid: &Cid, wallet: &str, max_price: u64) -> Result<Vec<u8>> {
        self.market.retrieve(wallet, data_cid, max_price).await
    }
}
