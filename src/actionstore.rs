//!
//! Action store: the most recent desired configuration per Job, plus the
//! CID index the renewal/repair crons and `untrack` work from. An Action
//! is owned by its Job until the Job is terminal; afterwards the cron
//! loops own it until a newer push or an `untrack` removes it.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::datastore::{BatchOp, Datastore};
use crate::types::{Action, Cid, JobId};

fn action_key(jid: &JobId) -> String {
    format!("job/{jid}")
}

fn cid_index_key(cid: &Cid, jid: &JobId) -> String {
    format!("cid/{cid}/{jid}")
}

pub struct ActionStore {
    ds: Arc<dyn Datastore>,
}

impl ActionStore {
    pub fn new(ds: Arc<dyn Datastore>) -> Self {
        ActionStore { ds }
    }

    pub fn put(&self, jid: &JobId, action: &Action) -> Result<()> {
        let buf = serde_json::to_vec(action).context("encoding action")?;
        self.ds
            .batch(vec![
                BatchOp::Put { key: action_key(jid), value: buf },
                BatchOp::Put {
                    key: cid_index_key(&action.cid, jid),
                    value: Vec::new(),
                },
            ])
            .context("persisting action")
    }

    pub fn get(&self, jid: &JobId) -> Result<Option<Action>> {
        let Some(buf) = self.ds.get(&action_key(jid))? else { return Ok(None) };
        let action =
            serde_json::from_slice(&buf).with_context(|| format!("decoding action of {jid}"))?;
        Ok(Some(action))
    }

    /// Drop every Action targeting `cid`. Used by `untrack` so a replaced
    /// CID stops being considered by the renewal/repair crons.
    pub fn remove(&self, cid: &Cid) -> Result<()> {
        let mut ops = Vec::new();
        let prefix = format!("cid/{cid}/");
        for (key, _) in self.ds.query_prefix(&prefix)? {
            if let Some(jid) = key.strip_prefix(&prefix) {
                ops.push(BatchOp::Delete { key: action_key(&JobId(jid.to_string())) });
            }
            ops.push(BatchOp::Delete { key });
        }
        if ops.is_empty() {
            return Ok(());
        }
        self.ds.batch(ops).context("removing actions by cid")
    }

    /// Actions whose config asks for deal renewal.
    pub fn get_renewable(&self) -> Result<Vec<Action>> {
        self.scan(|a| a.cfg.cold.enabled && a.cfg.cold.filecoin.renew.enabled)
    }

    /// Actions whose config asks for automatic repair.
    pub fn get_repairable(&self) -> Result<Vec<Action>> {
        self.scan(|a| a.cfg.repairable)
    }

    fn scan(&self, keep: impl Fn(&Action) -> bool) -> Result<Vec<Action>> {
        let mut out = Vec::new();
        for (key, buf) in self.ds.query_prefix("job/")? {
            let action: Action = serde_json::from_slice(&buf)
                .with_context(|| format!("decoding action at {key}"))?;
            if keep(&action) {
                out.push(action);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemDatastore;
    use crate::types::*;
    use crate::util::MIN_DEAL_DURATION;

    fn cfg(renew: bool, repairable: bool) -> StorageConfig {
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
                    renew: RenewConfig { enabled: renew, threshold: 100 },
                    addr: "f3wallet".into(),
                    max_price: 0,
                    fast_retrieval: false,
                    deal_start_offset: 0,
                },
            },
            repairable,
        }
    }

    fn action(cid: &str, renew: bool, repairable: bool) -> Action {
        Action {
            api_id: ApiId("tenant".into()),
            cid: Cid::from_trusted(cid),
            cfg: cfg(renew, repairable),
            replaced_cid: None,
        }
    }

    #[test]
    fn put_get_roundtrip() {
        let s = ActionStore::new(Arc::new(MemDatastore::new()));
        let jid = JobId::new();
        let a = action("QmAction01", false, false);
        s.put(&jid, &a).unwrap();
        let got = s.get(&jid).unwrap().unwrap();
        assert_eq!(got.cid, a.cid);
        assert!(s.get(&JobId::new()).unwrap().is_none());
    }

    #[test]
    fn renewable_and_repairable_indices() {
        let s = ActionStore::new(Arc::new(MemDatastore::new()));
        s.put(&JobId::new(), &action("QmRenew001", true, false)).unwrap();
        s.put(&JobId::new(), &action("QmRepair01", false, true)).unwrap();
        s.put(&JobId::new(), &action("QmPlain001", false, false)).unwrap();

        let renewable = s.get_renewable().unwrap();
        assert_eq!(renewable.len(), 1);
        assert_eq!(renewable[0].cid.as_str(), "QmRenew001");

        let repairable = s.get_repairable().unwrap();
        assert_eq!(repairable.len(), 1);
        assert_eq!(repairable[0].cid.as_str(), "QmRepair01");
    }

    #[test]
    fn renew_flag_ignored_when_cold_disabled() {
        let s = ActionStore::new(Arc::new(MemDatastore::new()));
        let mut a = action("QmColdOff1", true, false);
        a.cfg.cold.enabled = false;
        s.put(&JobId::new(), &a).unwrap();
        assert!(s.get_renewable().unwrap().is_empty());
    }

    #[test]
    fn remove_drops_all_actions_for_cid() {
        let s = ActionStore::new(Arc::new(MemDatastore::new()));
        let jid1 = JobId::new();
        let jid2 = JobId::new();
        s.put(&jid1, &action("QmGone0001", true, true)).unwrap();
        s.put(&jid2, &action("QmGone0001", true, true)).unwrap();
        s.put(&JobId::new(), &action("QmStays001", true, true)).unwrap();

        s.remove(&Cid::from_trusted("QmGone0001")).unwrap();
        assert!(s.get(&jid1).unwrap().is_none());
        assert!(s.get(&jid2).unwrap().is_none());
        assert_eq!(s.get_renewable().unwrap().len(), 1);
        assert_eq!(s.get_repairable().unwrap().len(), 1);

        // Removing a CID with no actions is a no-op.
        s.remove(&Cid::from_trusted("QmMissing1")).unwrap();
    }
}
