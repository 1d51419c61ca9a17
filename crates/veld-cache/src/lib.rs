pub mod disk;
pub mod memory;
pub mod policy;
pub mod range;
pub mod remote;
pub mod tier;
pub mod uri;

pub use disk::DiskTier;
pub use memory::MemoryTier;
pub use policy::{make_policy, CachePolicy, LfuPolicy, LruPolicy};
pub use range::{DenseData, Range, RangeList, SparseData};
pub use remote::{BlobFetcher, FetchFuture, FetchedBlob, RemoteTier};
pub use tier::{CacheChain, CacheTier, TierStats, TransferCallback};
pub use uri::{ResourceUri, Scheme, UriError};

use std::sync::Arc;
use std::time::Duration;

use veld_core::config::CacheConfig;

/// Assemble the standard memory → disk → remote chain from configuration.
pub fn chain_from_config(
    config: &CacheConfig,
    fetcher: Arc<dyn BlobFetcher>,
) -> std::io::Result<CacheChain> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let memory = MemoryTier::new(
        make_policy(&config.policy, config.memory_budget_bytes),
        timeout,
    );
    let disk = DiskTier::open(
        config.disk_root.clone(),
        make_policy(&config.policy, config.disk_budget_bytes),
        timeout,
    )?;
    let remote = RemoteTier::new(fetcher, timeout);
    Ok(CacheChain::new(vec![
        memory as Arc<dyn CacheTier>,
        disk,
        remote,
    ]))
}
