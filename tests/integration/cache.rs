//! Cache chain scenarios: promotion through the tiers, request
//! coalescing, and end-to-end content integrity.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use veld_cache::{
    BlobFetcher, CacheChain, CacheTier, DenseData, DiskTier, FetchFuture, FetchedBlob, LruPolicy,
    MemoryTier, Range, RemoteTier, ResourceUri, SparseData,
};
use veld_core::{Chunk, Error, Fingerprint};

use crate::init_tracing;

static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_root() -> PathBuf {
    let id = DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("veld-chain-test-{}-{}", std::process::id(), id))
}

/// Serves blobs from a map after an optional delay, counting fetches.
struct ScriptedFetcher {
    blobs: Mutex<HashMap<Fingerprint, Vec<u8>>>,
    fetches: AtomicUsize,
    delay: Duration,
}

impl ScriptedFetcher {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(ScriptedFetcher {
            blobs: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            delay,
        })
    }

    fn put(&self, bytes: Vec<u8>) -> Fingerprint {
        let fingerprint = Fingerprint::of(&bytes);
        self.blobs.lock().unwrap().insert(fingerprint, bytes);
        fingerprint
    }
}

impl BlobFetcher for ScriptedFetcher {
    fn fetch(&self, uri: &ResourceUri, _range: Range) -> FetchFuture {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let blob = self.blobs.lock().unwrap().get(&uri.fingerprint).cloned();
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match blob {
                Some(bytes) => {
                    let total_len = bytes.len() as u64;
                    Ok(FetchedBlob {
                        data: DenseData::new(0, Chunk::from_vec(bytes)),
                        total_len,
                    })
                }
                None => Err(Error::NotFound),
            }
        })
    }
}

struct Tiers {
    chain: CacheChain,
    memory: Arc<MemoryTier>,
    disk: Arc<DiskTier>,
    root: PathBuf,
}

fn three_tiers(fetcher: Arc<ScriptedFetcher>, memory_budget: u64) -> Tiers {
    let root = temp_root();
    let memory = MemoryTier::new(
        Box::new(LruPolicy::new(memory_budget)),
        Duration::from_secs(5),
    );
    let disk = DiskTier::open(
        root.clone(),
        Box::new(LruPolicy::new(1024 * 1024)),
        Duration::from_secs(5),
    )
    .unwrap();
    let remote = RemoteTier::new(fetcher, Duration::from_secs(5));
    let chain = CacheChain::new(vec![
        Arc::clone(&memory) as Arc<dyn CacheTier>,
        Arc::clone(&disk) as Arc<dyn CacheTier>,
        remote,
    ]);
    Tiers {
        chain,
        memory,
        disk,
        root,
    }
}

async fn get(chain: &CacheChain, fingerprint: Fingerprint, range: Range) -> (bool, Option<SparseData>) {
    let (tx, rx) = oneshot::channel();
    let later = chain.get_data(
        &ResourceUri::mhash(fingerprint).with_range(range),
        range,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    let result = tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("cache request timed out")
        .expect("callback dropped without firing");
    (later, result)
}

#[tokio::test(flavor = "multi_thread")]
async fn promotion_fills_every_tier_on_the_way_up() {
    // Tiers [mem(1KB), disk(1MB), net]. A miss for [0, 512) falls
    // through to the network, which returns the whole 4096-byte blob.
    // Disk keeps all of it, memory keeps its budget's worth, and a
    // second read inside the retained prefix answers synchronously.
    init_tracing();
    let fetcher = ScriptedFetcher::new(Duration::ZERO);
    let blob: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
    let fingerprint = fetcher.put(blob.clone());
    let tiers = three_tiers(Arc::clone(&fetcher), 1024);

    let (later, result) = get(&tiers.chain, fingerprint, Range::to(0, 512)).await;
    assert!(later, "a miss resolves asynchronously");
    let sparse = result.expect("network tier must satisfy the miss");
    assert!(sparse.covers(&Range::to(0, 512)));
    // content integrity: the bytes equal what the origin holds
    assert_eq!(
        sparse.read(&Range::to(0, 512)).unwrap().as_ref(),
        &blob[..512]
    );

    assert_eq!(tiers.disk.stats().stored_bytes, 4096, "disk keeps the whole blob");
    assert_eq!(
        tiers.memory.stats().stored_bytes,
        1024,
        "memory keeps the leading budget's worth"
    );

    // the second, smaller read never leaves the memory tier
    let (later, result) = get(&tiers.chain, fingerprint, Range::to(0, 256)).await;
    assert!(!later, "memory hit answers synchronously");
    assert_eq!(
        result.unwrap().read(&Range::to(0, 256)).unwrap().as_ref(),
        &blob[..256]
    );
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

    let _ = std::fs::remove_dir_all(&tiers.root);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_overlapping_requests_share_one_fetch() {
    init_tracing();
    let fetcher = ScriptedFetcher::new(Duration::from_millis(50));
    let blob = vec![0xab; 2048];
    let fingerprint = fetcher.put(blob);
    let tiers = three_tiers(Arc::clone(&fetcher), 64 * 1024);

    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    tiers.chain.get_data(
        &ResourceUri::mhash(fingerprint),
        Range::to(0, 1024),
        Box::new(move |result| {
            let _ = tx1.send(result.is_some());
        }),
    );
    tiers.chain.get_data(
        &ResourceUri::mhash(fingerprint),
        Range::to(256, 512),
        Box::new(move |result| {
            let _ = tx2.send(result.is_some());
        }),
    );

    assert!(rx1.await.unwrap());
    assert!(rx2.await.unwrap());
    assert_eq!(
        fetcher.fetches.load(Ordering::SeqCst),
        1,
        "the overlapping request rides the first fetch"
    );

    let _ = std::fs::remove_dir_all(&tiers.root);
}

#[tokio::test(flavor = "multi_thread")]
async fn miss_through_every_tier_is_not_found() {
    init_tracing();
    let fetcher = ScriptedFetcher::new(Duration::ZERO);
    let tiers = three_tiers(Arc::clone(&fetcher), 1024);

    let missing = Fingerprint::of(b"nobody has this");
    let (_, result) = get(&tiers.chain, missing, Range::to(0, 64)).await;
    assert!(result.is_none());

    let _ = std::fs::remove_dir_all(&tiers.root);
}

#[tokio::test(flavor = "multi_thread")]
async fn purge_empties_the_whole_chain() {
    init_tracing();
    let fetcher = ScriptedFetcher::new(Duration::ZERO);
    let blob = vec![0x3c; 512];
    let fingerprint = fetcher.put(blob);
    let tiers = three_tiers(Arc::clone(&fetcher), 64 * 1024);

    let (_, result) = get(&tiers.chain, fingerprint, Range::to(0, 512)).await;
    assert!(result.is_some());
    assert_eq!(tiers.memory.stats().entries, 1);
    assert_eq!(tiers.disk.stats().entries, 1);

    tiers.chain.purge(&fingerprint);
    assert_eq!(tiers.memory.stats().entries, 0);
    assert_eq!(tiers.disk.stats().entries, 0);

    // the next read goes all the way to the network again
    let (_, result) = get(&tiers.chain, fingerprint, Range::to(0, 512)).await;
    assert!(result.is_some());
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);

    let _ = std::fs::remove_dir_all(&tiers.root);
}

#[tokio::test(flavor = "multi_thread")]
async fn open_ended_range_resolves_once_the_length_is_known() {
    init_tracing();
    let fetcher = ScriptedFetcher::new(Duration::ZERO);
    let blob: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
    let fingerprint = fetcher.put(blob.clone());
    let tiers = three_tiers(Arc::clone(&fetcher), 64 * 1024);

    let (_, result) = get(&tiers.chain, fingerprint, Range::open(100)).await;
    let sparse = result.expect("open range resolves through the fetch");
    assert_eq!(sparse.total_len(), Some(300));
    assert_eq!(
        sparse.read(&Range::open(100)).unwrap().as_ref(),
        &blob[100..]
    );

    let _ = std::fs::remove_dir_all(&tiers.root);
}
