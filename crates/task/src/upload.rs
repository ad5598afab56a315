//! Uploader: archive the output tree back to the store

use crate::signal::TerminationSignal;
use isorun_cache::{archive, StoreClient};
use isorun_core::{Error, OutputRef, Result, ResultExt, TransferStats};
use isorun_utils::fs::has_entries;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Archive `out_dir` into `store`. Nothing is uploaded for an empty tree.
///
/// A termination request during the upload aborts it with
/// [`Error::Cancelled`]; the archive itself runs on the blocking pool.
pub async fn upload_outputs(
    store: Arc<dyn StoreClient>,
    out_dir: &Path,
    signal: &TerminationSignal,
) -> Result<Option<(OutputRef, TransferStats)>> {
    if !has_entries(out_dir).fs_context(out_dir, "list output directory")? {
        tracing::debug!(out_dir = %out_dir.display(), "no outputs to upload");
        return Ok(None);
    }

    let start = Instant::now();
    let token = signal.arm();
    let root = out_dir.to_path_buf();
    let archiver = Arc::clone(&store);
    let task = tokio::task::spawn_blocking(move || archive(archiver.as_ref(), &root));

    let archived = tokio::select! {
        joined = task => {
            joined.map_err(|e| Error::store("outputs", format!("upload task failed: {e}")))?
        }
        _ = token.cancelled() => {
            signal.disarm();
            return Err(Error::cancelled("upload"));
        }
    };
    signal.disarm();
    let archived = archived?;

    let stats = TransferStats {
        duration: start.elapsed(),
        items_cold: archived.items_cold,
        items_hot: archived.items_hot,
        bytes_cold: archived.bytes_cold,
        bytes_hot: archived.bytes_hot,
    };
    isorun_utils::tracing::phase_completed("upload", stats.duration.as_millis() as u64);
    tracing::info!(
        hash = %archived.hash,
        items_cold = stats.items_cold,
        items_hot = stats.items_hot,
        "outputs uploaded"
    );

    let output_ref = OutputRef {
        hash: archived.hash,
        location: store.location().to_string(),
        namespace: store.namespace().to_string(),
    };
    Ok(Some((output_ref, stats)))
}
