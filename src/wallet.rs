//! Wallet capability consumed by the manager when creating tenant
//! instances. Custody itself lives outside this crate; the in-memory
//! implementation exists for tests and for deployments that fund
//! instances out-of-band.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[async_trait]
pub trait WalletManager: Send + Sync {
    /// Create a new address owned by the backing wallet.
    async fn new_address(&self) -> Result<String>;
    /// Current balance of an address, in attoFIL.
    async fn balance(&self, addr: &str) -> Result<u64>;
    /// Transfer funds between owned addresses.
    async fn send_fil(&self, from: &str, to: &str, amount: u64) -> Result<()>;
}

/// In-memory wallet with a funded master address.
pub struct MemWallet {
    master: String,
    balances: Mutex<HashMap<String, u64>>,
}

impl MemWallet {
    pub fn new(master_addr: impl Into<String>, master_balance: u64) -> Self {
        let master = master_addr.into();
        let mut balances = HashMap::new();
        balances.insert(master.clone(), master_balance);
        MemWallet { master, balances: Mutex::new(balances) }
    }

    pub fn master_addr(&self) -> &str {
        &self.master
    }
}

#[async_trait]
impl WalletManager for MemWallet {
    async fn new_address(&self) -> Result<String> {
        let addr = format!("f3{}", uuid::Uuid::new_v4().simple());
        self.balances.lock().insert(addr.clone(), 0);
        Ok(addr)
    }

    async fn balance(&self, addr: &str) -> Result<u64> {
        self.balances
            .lock()
            .get(addr)
            .copied()
            .ok_or_else(|| anyhow!("unknown address {addr}"))
    }

    async fn send_fil(&self, from: &str, to: &str, amount: u64) -> Result<()> {
        let mut balances = self.balances.lock();
        let from_bal = balances.get(from).copied().ok_or_else(|| anyhow!("unknown address {from}"))?;
        if from_bal < amount {
            return Err(anyhow!("insufficient balance in {from}: {from_bal} < {amount}"));
        }
        if !balances.contains_key(to) {
            return Err(anyhow!("unknown address {to}"));
        }
        if let Some(b) = balances.get_mut(from) {
            *b -= amount;
        }
        if let Some(b) = balances.get_mut(to) {
            *b += amount;
        }
        Ok(())
    }
}
