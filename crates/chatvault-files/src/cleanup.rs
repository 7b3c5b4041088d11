use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use chatvault_db::Database;
use chatvault_types::{SyncEvent, SyncLog, SyncLogger};

use crate::storage::Storage;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    /// Orphan rows whose bytes are still used by a live row.
    pub shared_kept: usize,
    pub dirs_removed: usize,
    pub failed: usize,
}

/// Reclaim attachments whose owning message is gone.
///
/// For each orphan: delete its bytes (unless another live row points at the
/// same path), prune the emptied directories up to the storage root, and only
/// then drop the row. A row whose bytes could not be removed is kept so the
/// next sweep retries it.
pub async fn sweep_orphans(db: &Database, storage: &Storage, logger: &dyn SyncLogger) -> Result<SweepReport> {
    let orphans = db.orphaned_files()?;
    let mut report = SweepReport::default();

    for file in &orphans {
        let path = Path::new(&file.local_path);

        if db.path_shared_with_live_file(file)? {
            report.shared_kept += 1;
        } else {
            if let Err(e) = storage.delete_file(path).await {
                warn!("Sweep: cannot delete {}: {:#}", path.display(), e);
                report.failed += 1;
                continue;
            }
            if let Some(parent) = path.parent() {
                match storage.prune_empty_dirs(parent).await {
                    Ok(n) => report.dirs_removed += n,
                    Err(e) => warn!("Sweep: cannot prune {}: {:#}", parent.display(), e),
                }
            }
        }

        db.delete_file(file)?;
        report.reclaimed += 1;
        logger.log(SyncLog::new(
            "sweep",
            Some(&file.channel_id),
            SyncEvent::OrphanReclaimed {
                file_id: file.id.clone(),
                path: file.local_path.clone(),
            },
        ));
    }

    if report.reclaimed > 0 || report.failed > 0 {
        info!(
            "Sweep: reclaimed {} orphaned files ({} shared, {} dirs removed, {} failed)",
            report.reclaimed, report.shared_kept, report.dirs_removed, report.failed
        );
    }

    Ok(report)
}
