//! Chain-Tip Sources for Quaxis
//!
//! The ingestion side of the coordinator: a shared-memory seqlock region
//! (with its adaptive spin/yield/sleep waiter), a pool-protocol client, and
//! the failover manager that keeps exactly one source feeding the template
//! cache. The relay source lives in `quaxis-relay`; its events run through
//! the same failover manager.

pub mod fallback;
pub mod pool;
pub mod shm;
pub mod waiter;

pub use fallback::{FallbackConfig, FallbackManager, SourceState, SourceStatus};
pub use pool::{PoolClient, PoolClientConfig, PoolError};
pub use shm::{
    BlockSubmitter, ShmError, ShmSubscriber, SubmitRegionReader, TipRegionReader,
    TipRegionWriter, TipSnapshot, MAX_SUBMIT_COINBASE, SUBMIT_REGION_SIZE, TIP_REGION_SIZE,
};
pub use waiter::{AdaptiveWaiter, WaiterConfig};
