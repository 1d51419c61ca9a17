//! Terminal tier: fetches blob bytes from their origin.
//!
//! The network dependency enters through the `BlobFetcher` capability;
//! the tier itself stores nothing. A successful fetch populates every
//! tier above it, which is what answers the callbacks parked along the
//! chain. A failed or timed-out fetch propagates not-found.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use veld_core::{Error, Fingerprint};

use crate::range::{DenseData, Range, SparseData};
use crate::tier::{with_fired_flag, CacheTier, PendingTable, TierLink, TransferCallback};
use crate::uri::ResourceUri;

/// A fetch result. `data` must cover the requested range (and may carry
/// more, typically the whole blob); `total_len` is the blob's full size.
pub struct FetchedBlob {
    pub data: DenseData,
    pub total_len: u64,
}

pub type FetchFuture = Pin<Box<dyn Future<Output = Result<FetchedBlob, Error>> + Send + 'static>>;

/// Where remote bytes actually come from. The host application supplies
/// an implementation per origin scheme; tests supply a scripted one.
pub trait BlobFetcher: Send + Sync {
    fn fetch(&self, uri: &ResourceUri, range: Range) -> FetchFuture;
}

pub struct RemoteTier {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    link: TierLink,
    fetcher: Arc<dyn BlobFetcher>,
    pending: PendingTable,
    fetch_timeout: Duration,
}

impl RemoteTier {
    pub fn new(fetcher: Arc<dyn BlobFetcher>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(RemoteTier {
            inner: Arc::new(RemoteInner {
                link: TierLink::new(),
                fetcher,
                pending: PendingTable::new(request_timeout),
                fetch_timeout: request_timeout,
            }),
        })
    }
}

impl CacheTier for RemoteTier {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn link(&self) -> &TierLink {
        &self.inner.link
    }

    fn get_data(&self, uri: &ResourceUri, range: Range, callback: TransferCallback) -> bool {
        let fingerprint = uri.fingerprint;
        let (callback, fired) = with_fired_flag(callback);
        let shares_in_flight = self.inner.pending.park(fingerprint, range, callback);
        if !shares_in_flight {
            let inner = Arc::clone(&self.inner);
            let uri = uri.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let fut = inner.fetcher.fetch(&uri, range);
                        let outcome = if inner.fetch_timeout.is_zero() {
                            fut.await
                        } else {
                            match tokio::time::timeout(inner.fetch_timeout, fut).await {
                                Ok(result) => result,
                                Err(_) => Err(Error::NotFound),
                            }
                        };
                        match outcome {
                            Ok(blob) => {
                                let total_len = blob.total_len;
                                inner.link.populate_parent(
                                    &fingerprint,
                                    blob.data.clone(),
                                    Some(total_len),
                                );
                                let mut view = SparseData::from_dense(blob.data);
                                view.set_total_len(total_len);
                                inner.pending.complete(
                                    &fingerprint,
                                    |r| view.covers(r),
                                    |r| view.clipped(r),
                                );
                                // waiters the fetch result failed to reach
                                inner.pending.fail_within(&fingerprint, &range);
                            }
                            Err(e) => {
                                tracing::debug!(
                                    error = %e,
                                    fingerprint = %fingerprint,
                                    "remote fetch missed"
                                );
                                inner.pending.fail_within(&fingerprint, &range);
                            }
                        }
                    });
                }
                Err(_) => {
                    // no runtime to drive a fetch on
                    self.inner.pending.fail_within(&fingerprint, &range);
                }
            }
        }
        !fired.load(Ordering::Acquire)
    }

    fn populate(&self, fingerprint: &Fingerprint, data: DenseData, total_len: Option<u64>) {
        // nothing stored here; keep the recursion moving upward
        self.inner.link.populate_parent(fingerprint, data, total_len);
    }

    fn purge(&self, _fingerprint: &Fingerprint) {
        // nothing stored, and nothing below to forward to
    }
}
