//!
//! tundra
//! ------
//! Tiered content storage daemon core. Data is addressed by CID and kept
//! in two tiers: a fast IPFS-backed hot tier and a durable Filecoin-backed
//! cold tier. Tenants push a desired `StorageConfig` per CID; the
//! scheduler asynchronously reconciles actual state toward desired state
//! through observable Jobs, renews expiring deals, and repairs lost
//! replication.
//!
//! Layering, leaves first: `datastore` (transactional KV) carries every
//! store; `joblog`, `jobstore`, `actionstore` and `infostore` persist the
//! scheduler's state; `hot`, `cold`, `deals`, `miners` and `wallet` are
//! the capability seams to the outside world; `scheduler` drives
//! reconciliation; `manager` and `api` expose the multi-tenant surface.

pub mod actionstore;
pub mod api;
pub mod cold;
pub mod datastore;
pub mod deals;
pub mod error;
pub mod hot;
pub mod infostore;
pub mod joblog;
pub mod jobstore;
pub mod manager;
pub mod miners;
pub mod scheduler;
pub mod testutil;
pub mod types;
pub mod util;
pub mod wallet;
