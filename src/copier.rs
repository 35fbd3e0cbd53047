//! Snapshot page copy: stage one of the backup worker.

use crc32fast::Hasher;
use tracing::{debug, trace};

use crate::host::DataSource;
use crate::io::FileIo;
use crate::manager::BackupInner;
use crate::types::{PageId, Result};

/// Share of total progress the page copy stage accounts for.
pub(crate) const PROGRESS_DATA_DONE: f64 = 0.70;

/// The worker yields the CPU after this many pages so host threads are not
/// starved on constrained schedulers.
const YIELD_EVERY_PAGES: u64 = 1024;

pub(crate) struct CopyOutcome {
    /// CRC32 over the full backup data file, in page order.
    pub crc32: u32,
    /// Pages served from the shadow store rather than the live file.
    pub shadow_reads: u64,
}

/// Copies pages `0..page_count` of the live data file into `dest`, taking
/// each page's snapshot image from the shadow store when one exists.
///
/// The unshadowed path re-checks the shadow store after the live read: a
/// writer that raced us must have preserved the page *before* mutating it,
/// so either our live read saw the snapshot bytes or the shadow store now
/// holds them.
pub(crate) fn copy_pages(
    data: &dyn DataSource,
    dest: &dyn FileIo,
    inner: &BackupInner,
    page_count: u64,
) -> Result<CopyOutcome> {
    let page_size = data.page_size();
    let mut buf = vec![0u8; page_size as usize];
    let mut hasher = Hasher::new();
    let mut shadow_reads = 0u64;

    for idx in 0..page_count {
        inner.check_cancelled()?;
        let page = PageId(idx);
        if inner.shadow.contains(page) {
            inner.shadow.read(page, &mut buf)?;
            shadow_reads += 1;
            trace!(page = idx, "backup.copier.shadow_read");
        } else {
            data.read_page(page, &mut buf)?;
            if inner.shadow.contains(page) {
                inner.shadow.read(page, &mut buf)?;
                shadow_reads += 1;
                trace!(page = idx, "backup.copier.shadow_read_after_race");
            }
        }
        dest.write_at(idx * page_size, &buf)?;
        hasher.update(&buf);
        inner.mark_captured(idx + 1);
        inner.set_progress(PROGRESS_DATA_DONE * (idx + 1) as f64 / page_count as f64);
        if (idx + 1) % YIELD_EVERY_PAGES == 0 {
            std::thread::yield_now();
        }
    }

    dest.sync_all()?;
    inner.set_progress(PROGRESS_DATA_DONE);
    debug!(
        pages = page_count,
        shadow_reads, "backup.copier.stage_complete"
    );
    Ok(CopyOutcome {
        crc32: hasher.finalize(),
        shadow_reads,
    })
}
