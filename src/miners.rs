//!
//! Miner selection
//! ---------------
//! Strategy contract for choosing Filecoin deal counterparties, plus the
//! fixed-list selector used by tests and single-operator deployments.
//! Selection is deterministic: trusted miners first, then ascending ask
//! price, ties broken lexicographically on address.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::MinerProposal;

/// Constraints applied when picking miners for new deals.
#[derive(Debug, Clone, Default)]
pub struct MinerFilter {
    /// Miners never to select: config exclusions plus miners already
    /// holding a proposal for the CID being stored.
    pub excluded: Vec<String>,
    /// Miners to prefer over any price ordering.
    pub trusted: Vec<String>,
    /// When non-empty, only miners in these countries are considered.
    pub country_codes: Vec<String>,
    /// Max attoFIL-per-epoch-per-GiB. Zero means no cap.
    pub max_price: u64,
}

/// Strategy returning up to `n` miner candidates under a filter.
#[async_trait]
pub trait MinerSelector: Send + Sync {
    async fn get_miners(&self, n: usize, filter: &MinerFilter) -> Result<Vec<MinerProposal>>;
}

/// One statically-configured miner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedMiner {
    pub addr: String,
    pub country: String,
    pub epoch_price: u64,
}

/// Selector over a fixed miner list.
pub struct FixedMinerSelector {
    miners: Vec<FixedMiner>,
}

impl FixedMinerSelector {
    pub fn new(miners: Vec<FixedMiner>) -> Self {
        FixedMinerSelector { miners }
    }
}

#[async_trait]
impl MinerSelector for FixedMinerSelector {
    async fn get_miners(&self, n: usize, filter: &MinerFilter) -> Result<Vec<MinerProposal>> {
        let mut eligible: Vec<&FixedMiner> = self
            .miners
            .iter()
            .filter(|m| !filter.excluded.iter().any(|e| e == &m.addr))
            .filter(|m| {
                filter.country_codes.is_empty()
                    || filter.country_codes.iter().any(|c| c.eq_ignore_ascii_case(&m.country))
            })
            .filter(|m| filter.max_price == 0 || m.epoch_price <= filter.max_price)
            .collect();

        let is_trusted = |addr: &str| filter.trusted.iter().any(|t| t == addr);
        eligible.sort_by(|a, b| {
            is_trusted(&b.addr)
                .cmp(&is_trusted(&a.addr))
                .then(a.epoch_price.cmp(&b.epoch_price))
                .then(a.addr.cmp(&b.addr))
        });

        if eligible.is_empty() {
            return Err(anyhow!("no miners satisfy the selection filter"));
        }
        Ok(eligible
            .into_iter()
            .take(n)
            .map(|m| MinerProposal { addr: m.addr.clone(), epoch_price: m.epoch_price })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn miner(addr: &str, country: &str, price: u64) -> FixedMiner {
        FixedMiner { addr: addr.into(), country: country.into(), epoch_price: price }
    }

    fn selector() -> FixedMinerSelector {
        FixedMinerSelector::new(vec![
            miner("f0300", "US", 40),
            miner("f0100", "CN", 10),
            miner("f0200", "CN", 10),
            miner("f0400", "DE", 5),
        ])
    }

    #[tokio::test]
    async fn orders_by_price_then_address() {
        let got = selector().get_miners(4, &MinerFilter::default()).await.unwrap();
        let addrs: Vec<_> = got.iter().map(|m| m.addr.as_str()).collect();
        // f0400 is cheapest; f0100/f0200 tie on price and break on address.
        assert_eq!(addrs, vec!["f0400", "f0100", "f0200", "f0300"]);
    }

    #[tokio::test]
    async fn trusted_miners_come_first() {
        let filter = MinerFilter { trusted: vec!["f0300".into()], ..Default::default() };
        let got = selector().get_miners(2, &filter).await.unwrap();
        assert_eq!(got[0].addr, "f0300");
        assert_eq!(got[1].addr, "f0400");
    }

    #[tokio::test]
    async fn excluded_miners_never_selected() {
        let filter = MinerFilter { excluded: vec!["f0400".into(), "f0100".into()], ..Default::default() };
        let got = selector().get_miners(4, &filter).await.unwrap();
        assert!(got.iter().all(|m| m.addr != "f0400" && m.addr != "f0100"));
    }

    #[tokio::test]
    async fn country_filter_limits_candidates() {
        let filter = MinerFilter { country_codes: vec!["cn".into()], ..Default::default() };
        let got = selector().get_miners(4, &filter).await.unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|m| m.addr.starts_with("f01") || m.addr.starts_with("f02")));
    }

    #[tokio::test]
    async fn max_price_rejects_expensive_asks() {
        let filter = MinerFilter { max_price: 10, ..Default::default() };
        let got = selector().get_miners(4, &filter).await.unwrap();
        assert!(got.iter().all(|m| m.epoch_price <= 10));
        assert_eq!(got.len(), 3);
    }

    #[tokio::test]
    async fn empty_result_is_an_error() {
        let filter = MinerFilter { max_price: 1, ..Default::default() };
        assert!(selector().get_miners(1, &filter).await.is_err());
    }

    #[tokio::test]
    async fn returns_at_most_n() {
        let got = selector().get_miners(2, &MinerFilter::default()).await.unwrap();
        assert_eq!(got.len(), 2);
    }
}
