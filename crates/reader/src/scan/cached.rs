use super::{ScanEvent, ScanOptions, ScanSummary, checkpoint};
use crate::error::Result;
use folio_cache::DirectorySnapshot;
use futures::Stream;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deliver a stored listing with the same batching, filtering and
/// checkpoints as a live walk.
pub(super) fn replay(
    snapshot: DirectorySnapshot,
    options: ScanOptions,
    token: CancellationToken,
    started: Instant,
) -> impl Stream<Item = Result<ScanEvent>> + Send {
    async_stream::stream! {
        let entries: Vec<_> = snapshot.entries.into_iter().filter(|entry| options.accepts(entry)).collect();
        let mut delivered = 0u64;
        for batch in entries.chunks(options.batch_size()) {
            if !checkpoint(&token).await {
                yield Ok(ScanEvent::Cancelled { delivered });
                return;
            }
            delivered += batch.len() as u64;
            yield Ok(ScanEvent::Batch(batch.to_vec()));
        }
        yield Ok(ScanEvent::Completed(ScanSummary { total: delivered, skipped: 0, elapsed: started.elapsed(), from_cache: true }));
    }
}
