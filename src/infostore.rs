//! Storage-info store: the last materialized storage state observed for a
//! CID, keyed by (tenant, cid). Written only by the reconciliation
//! pipeline; readers that care about deal liveness re-verify proposals
//! against the cold layer instead of trusting this record.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use crate::datastore::Datastore;
use crate::error::AppError;
use crate::types::{ApiId, Cid, StorageInfo};

fn make_key(api_id: &ApiId, cid: &Cid) -> String {
    format!("{api_id}/{cid}")
}

pub struct InfoStore {
    ds: Arc<dyn Datastore>,
}

impl InfoStore {
    pub fn new(ds: Arc<dyn Datastore>) -> Self {
        InfoStore { ds }
    }

    pub fn put(&self, info: &StorageInfo) -> Result<()> {
        if !info.api_id.is_valid() {
            bail!("instance id is invalid");
        }
        let buf = serde_json::to_vec(info).context("encoding storage info")?;
        self.ds
            .put(&make_key(&info.api_id, &info.cid), buf)
            .context("persisting storage info")
    }

    pub fn get(&self, api_id: &ApiId, cid: &Cid) -> Result<StorageInfo> {
        let buf = self
            .ds
            .get(&make_key(api_id, cid))?
            .ok_or_else(|| anyhow!(AppError::not_found(format!("no storage info for {cid}"))))?;
        serde_json::from_slice(&buf).with_context(|| format!("decoding storage info of {cid}"))
    }

    pub fn try_get(&self, api_id: &ApiId, cid: &Cid) -> Result<Option<StorageInfo>> {
        let Some(buf) = self.ds.get(&make_key(api_id, cid))? else { return Ok(None) };
        let info = serde_json::from_slice(&buf)
            .with_context(|| format!("decoding storage info of {cid}"))?;
        Ok(Some(info))
    }

    /// All records of one tenant, for admin tooling.
    pub fn get_all(&self, api_id: &ApiId) -> Result<Vec<StorageInfo>> {
        let mut out = Vec::new();
        for (key, buf) in self.ds.query_prefix(&format!("{api_id}/"))? {
            let info: StorageInfo = serde_json::from_slice(&buf)
                .with_context(|| format!("decoding storage info at {key}"))?;
            out.push(info);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemDatastore;
    use crate::types::JobId;

    #[test]
    fn put_get_roundtrip() {
        let s = InfoStore::new(Arc::new(MemDatastore::new()));
        let api = ApiId("tenant".into());
        let cid = Cid::from_trusted("QmInfo0001");
        let mut info = StorageInfo::empty(api.clone(), cid.clone());
        info.job_id = JobId::new();
        info.hot.enabled = true;
        info.hot.size = 512;
        s.put(&info).unwrap();

        let got = s.get(&api, &cid).unwrap();
        assert!(got.hot.enabled);
        assert_eq!(got.hot.size, 512);
    }

    #[test]
    fn get_missing_maps_to_not_found() {
        let s = InfoStore::new(Arc::new(MemDatastore::new()));
        let err = s.get(&ApiId("t".into()), &Cid::from_trusted("QmMissing1")).unwrap_err();
        let app: AppError = err.into();
        assert_eq!(app.code_str(), "not_found");
        assert!(s.try_get(&ApiId("t".into()), &Cid::from_trusted("QmMissing1")).unwrap().is_none());
    }

    #[test]
    fn get_all_is_scoped_to_tenant() {
        let s = InfoStore::new(Arc::new(MemDatastore::new()));
        let a = ApiId("tenant-a".into());
        let b = ApiId("tenant-b".into());
        s.put(&StorageInfo::empty(a.clone(), Cid::from_trusted("QmOne00001"))).unwrap();
        s.put(&StorageInfo::empty(a.clone(), Cid::from_trusted("QmTwo00002"))).unwrap();
        s.put(&StorageInfo::empty(b.clone(), Cid::from_trusted("QmOther001"))).unwrap();
        assert_eq!(s.get_all(&a).unwrap().len(), 2);
        assert_eq!(s.get_all(&b).unwrap().len(), 1);
    }

    #[test]
    fn put_rejects_empty_api_id() {
        let s = InfoStore::new(Arc::new(MemDatastore::new()));
        let info = StorageInfo::empty(ApiId(String::new()), Cid::from_trusted("QmNoTenant"));
        assert!(s.put(&info).is_err());
    }
}
