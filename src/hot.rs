//!
//! Hot storage
//! -----------
//! Fast IPFS-backed tier: staging raw data, pinning/unpinning CIDs and
//! answering "is this pinned" from a cached pinset. `IpfsHot` speaks the
//! go-ipfs HTTP API of a remote node; the scheduler only sees the
//! `HotStorage` trait.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::joblog::JobLogger;
use crate::types::Cid;

#[async_trait]
pub trait HotStorage: Send + Sync {
    /// Stage raw data into the hot tier without pinning it; returns the
    /// CID the network assigned to it.
    async fn add(&self, data: &[u8]) -> Result<Cid>;
    /// Read staged/pinned data back.
    async fn get(&self, cid: &Cid) -> Result<Vec<u8>>;
    /// Fetch and pin a CID; returns its cumulative size. Pinning an
    /// already-pinned CID is a no-op reporting the current size.
    async fn store(&self, cid: &Cid) -> Result<u64>;
    /// Atomically swap a pin from `old` to `new`; returns the new size.
    async fn replace(&self, old: &Cid, new: &Cid) -> Result<u64>;
    /// Unpin a CID.
    async fn remove(&self, cid: &Cid) -> Result<()>;
    async fn is_stored(&self, cid: &Cid) -> Result<bool>;
}

/// HotStorage implementation over the IPFS HTTP API.
pub struct IpfsHot {
    base_url: String,
    client: reqwest::Client,
    logger: Arc<JobLogger>,
    pinset: Mutex<Option<HashSet<String>>>,
}

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Deserialize)]
struct StatResponse {
    #[serde(rename = "CumulativeSize")]
    cumulative_size: u64,
}

#[derive(Deserialize)]
struct PinLsResponse {
    #[serde(rename = "Keys", default)]
    keys: std::collections::HashMap<String, serde_json::Value>,
}

impl IpfsHot {
    pub fn new(api_addr: impl Into<String>, logger: Arc<JobLogger>) -> Self {
        let base = api_addr.into();
        IpfsHot {
            base_url: base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            logger,
            pinset: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v0/{}", self.base_url, path)
    }

    async fn api_call(&self, path: &str, args: &[(&str, &str)]) -> Result<reqwest::Response> {
        let resp = self
            .client
            .post(self.url(path))
            .query(args)
            .send()
            .await
            .with_context(|| format!("calling ipfs api {path}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ipfs api {path} returned {status}: {body}"));
        }
        Ok(resp)
    }

    async fn stat_size(&self, cid: &Cid) -> Result<u64> {
        let resp = self.api_call("object/stat", &[("arg", cid.as_str())]).await?;
        let stat: StatResponse = resp.json().await.context("decoding object/stat response")?;
        Ok(stat.cumulative_size)
    }

    async fn ensure_pinset_cache(&self) -> Result<()> {
        if self.pinset.lock().is_some() {
            return Ok(());
        }
        let resp = self.api_call("pin/ls", &[("type", "recursive")]).await?;
        let ls: PinLsResponse = resp.json().await.context("decoding pin/ls response")?;
        let mut guard = self.pinset.lock();
        if guard.is_none() {
            *guard = Some(ls.keys.into_keys().collect());
        }
        Ok(())
    }

    fn pinset_insert(&self, cid: &Cid) {
        if let Some(set) = self.pinset.lock().as_mut() {
            set.insert(cid.as_str().to_string());
        }
    }

    fn pinset_remove(&self, cid: &Cid) {
        if let Some(set) = self.pinset.lock().as_mut() {
            set.remove(cid.as_str());
        }
    }
}

#[async_trait]
impl HotStorage for IpfsHot {
    async fn add(&self, data: &[u8]) -> Result<Cid> {
        debug!(target: "tundra::hot", "adding data-stream of {} bytes", data.len());
        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name("data");
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .client
            .post(self.url("add"))
            .query(&[("pin", "false")])
            .multipart(form)
            .send()
            .await
            .context("calling ipfs api add")?;
        if !resp.status().is_success() {
            return Err(anyhow!("ipfs add returned {}", resp.status()));
        }
        let added: AddResponse = resp.json().await.context("decoding add response")?;
        debug!(target: "tundra::hot", "data-stream added with cid {}", added.hash);
        Ok(Cid::from_trusted(added.hash))
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        debug!(target: "tundra::hot", "getting cid {}", cid);
        let resp = self.api_call("cat", &[("arg", cid.as_str())]).await?;
        let bytes = resp.bytes().await.with_context(|| format!("reading {cid} body"))?;
        Ok(bytes.to_vec())
    }

    async fn store(&self, cid: &Cid) -> Result<u64> {
        debug!(target: "tundra::hot", "fetching and pinning cid {}", cid);
        self.api_call("pin/add", &[("arg", cid.as_str()), ("recursive", "true")])
            .await
            .with_context(|| format!("pinning {cid}"))?;
        let size = self.stat_size(cid).await?;
        self.ensure_pinset_cache().await?;
        self.pinset_insert(cid);
        self.logger.log(cid, None, "Cid data was pinned in IPFS node.");
        Ok(size)
    }

    async fn replace(&self, old: &Cid, new: &Cid) -> Result<u64> {
        debug!(target: "tundra::hot", "updating pin from {} to {}", old, new);
        self.api_call("pin/update", &[("arg", old.as_str()), ("arg", new.as_str())])
            .await
            .with_context(|| format!("updating pin {old} to {new}"))?;
        let size = self.stat_size(new).await?;
        self.ensure_pinset_cache().await?;
        self.pinset_remove(old);
        self.pinset_insert(new);
        Ok(size)
    }

    async fn remove(&self, cid: &Cid) -> Result<()> {
        debug!(target: "tundra::hot", "removing cid {}", cid);
        self.api_call("pin/rm", &[("arg", cid.as_str()), ("recursive", "true")])
            .await
            .with_context(|| format!("unpinning {cid}"))?;
        self.pinset_remove(cid);
        self.logger.log(cid, None, "Cid data was unpinned from IPFS node.");
        Ok(())
    }

    async fn is_stored(&self, cid: &Cid) -> Result<bool> {
        self.ensure_pinset_cache().await?;
        let guard = self.pinset.lock();
        Ok(guard.as_ref().map(|s| s.contains(cid.as_str())).unwrap_or(false))
    }
}
