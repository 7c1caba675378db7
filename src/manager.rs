//!
//! Tenant manager
//! --------------
//! Owns instance lifecycle: `create` allocates an ApiId, mints an opaque
//! bearer token, creates and funds the instance wallet from the master
//! address, and persists everything under `ffs/manager/`. The transport
//! layer authenticates requests by calling `get_by_auth_token`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{Instance, InstanceConfig, InstanceStore};
use crate::datastore::{Datastore, Namespaced};
use crate::deals;
use crate::error::AppError;
use crate::hot::HotStorage;
use crate::scheduler::Scheduler;
use crate::types::{ApiId, StorageConfig};
use crate::wallet::WalletManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthEntry {
    token: String,
    api_id: ApiId,
}

/// Credentials returned to a freshly-created tenant.
#[derive(Debug, Clone)]
pub struct CreateResponse {
    pub id: ApiId,
    pub token: String,
}

#[derive(Clone)]
pub struct ManagerOpts {
    pub master_addr: String,
    /// AttoFIL sent to each new instance wallet. Zero disables funding.
    pub funding_amount: u64,
    pub default_storage_config: StorageConfig,
}

pub struct Manager {
    ds: Arc<dyn Datastore>,
    wallet: Arc<dyn WalletManager>,
    sched: Arc<Scheduler>,
    hot: Arc<dyn HotStorage>,
    market: Arc<deals::Module>,
    opts: Mutex<ManagerOpts>,
    instances: Mutex<HashMap<ApiId, Arc<Instance>>>,
}

impl Manager {
    /// `ds` must already be namespaced for the manager (`ffs/manager/`).
    pub fn new(
        ds: Arc<dyn Datastore>,
        wallet: Arc<dyn WalletManager>,
        sched: Arc<Scheduler>,
        hot: Arc<dyn HotStorage>,
        market: Arc<deals::Module>,
        opts: ManagerOpts,
    ) -> Result<Arc<Self>> {
        opts.default_storage_config
            .validate()
            .map_err(|e| anyhow!(AppError::invalid(format!("default storage config is invalid: {e:#}"))))?;
        Ok(Arc::new(Manager {
            ds,
            wallet,
            sched,
            hot,
            market,
            opts: Mutex::new(opts),
            instances: Mutex::new(HashMap::new()),
        }))
    }

    /// Create a new tenant: ApiId, bearer token, funded wallet address.
    pub async fn create(&self) -> Result<CreateResponse> {
        let id = ApiId::new();
        info!(target: "tundra::manager", "creating instance {}", id);

        let addr = self.wallet.new_address().await.context("creating instance wallet address")?;
        let (master, amount) = {
            let opts = self.opts.lock();
            (opts.master_addr.clone(), opts.funding_amount)
        };
        if amount > 0 {
            self.wallet
                .send_fil(&master, &addr, amount)
                .await
                .context("funding instance wallet from master address")?;
        }

        let mut default_cfg = self.opts.lock().default_storage_config.clone();
        // The tenant pays for its own deals.
        default_cfg.cold.filecoin.addr = addr.clone();

        let config = InstanceConfig {
            id: id.clone(),
            wallet_addr: addr,
            default_storage_config: default_cfg,
        };
        let istore = self.instance_store(&id);
        istore.put_config(&config).context("saving new instance")?;

        let token = gen_token();
        let entry = AuthEntry { token: token.clone(), api_id: id.clone() };
        let buf = serde_json::to_vec(&entry).context("encoding auth entry")?;
        self.ds.put(&auth_key(&token), buf).context("persisting auth entry")?;

        let instance = Arc::new(Instance::new(
            config,
            istore,
            self.sched.clone(),
            self.hot.clone(),
            self.market.clone(),
            self.wallet.clone(),
        ));
        self.instances.lock().insert(id.clone(), instance);
        Ok(CreateResponse { id, token })
    }

    /// Resolve a bearer token to its instance. Unknown tokens are a
    /// permission error, not a not-found, so probing is uninformative.
    pub fn get_by_auth_token(&self, token: &str) -> Result<Arc<Instance>> {
        let Some(buf) = self.ds.get(&auth_key(token))? else {
            return Err(anyhow!(AppError::permission("invalid auth token")));
        };
        let entry: AuthEntry = serde_json::from_slice(&buf).context("decoding auth entry")?;
        self.get_instance(&entry.api_id)
    }

    pub fn get_instance(&self, id: &ApiId) -> Result<Arc<Instance>> {
        if let Some(instance) = self.instances.lock().get(id) {
            return Ok(instance.clone());
        }
        // Cache miss: load a previously-persisted instance.
        let istore = self.instance_store(id);
        let config = istore
            .get_config()?
            .ok_or_else(|| anyhow!(AppError::not_found(format!("instance {id} not found"))))?;
        let instance = Arc::new(Instance::new(
            config,
            istore,
            self.sched.clone(),
            self.hot.clone(),
            self.market.clone(),
            self.wallet.clone(),
        ));
        self.instances.lock().insert(id.clone(), instance.clone());
        Ok(instance)
    }

    /// Every known tenant id.
    pub fn list(&self) -> Result<Vec<ApiId>> {
        let mut out = Vec::new();
        for (key, buf) in self.ds.query_prefix("auth/")? {
            let entry: AuthEntry = serde_json::from_slice(&buf)
                .with_context(|| format!("decoding auth entry at {key}"))?;
            out.push(entry.api_id);
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Default storage config applied to instances created from now on.
    pub fn default_storage_config(&self) -> StorageConfig {
        self.opts.lock().default_storage_config.clone()
    }

    pub fn set_default_storage_config(&self, cfg: StorageConfig) -> Result<()> {
        cfg.validate()
            .map_err(|e| anyhow!(AppError::invalid(format!("default storage config is invalid: {e:#}"))))?;
        self.opts.lock().default_storage_config = cfg;
        Ok(())
    }

    fn instance_store(&self, id: &ApiId) -> InstanceStore {
        InstanceStore::new(Namespaced::wrap(self.ds.clone(), &format!("instance/{id}")))
    }
}

fn auth_key(token: &str) -> String {
    format!("auth/{token}")
}

/// 256-bit random bearer token, base64url without padding.
fn gen_token() -> String {
    let mut buf = [0u8; 32];
    let _ = getrandom::getrandom(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}
