#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod core;
pub mod error;
pub mod http;
pub mod pool;
pub mod stats;
pub mod storage;

#[cfg(test)]
mod testing;

pub use crate::config::Config;
pub use crate::core::{SnapshotEngine, SourceId};
pub use crate::error::{PoolError, PoolState};
pub use crate::pool::{
    CompositeView, LatestSnapshotTracker, PerRequestProvider, ProviderKind, SharedViewPool,
    SnapshotHandle, ViewLease, ViewProvider,
};
pub use crate::stats::{PoolStats, ShutdownReport};
