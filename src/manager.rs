//! Backup coordinator: owns the backup lifecycle and the background worker.
//!
//! `start_backup` is non-blocking: it pins the snapshot timestamp, resets
//! the shared backup state, and hands the rest to a worker thread. Host
//! writer threads keep running and report imminent page mutations through
//! [`BackupManager::notify_page_modification`] (usually via the installed
//! [`PageWriteObserver`] hook); the worker and those writers coordinate
//! only through the shadow store and the captured-page watermark.
//!
//! The captured set is a watermark rather than a set: the copier captures
//! pages in strictly ascending index order, so "page `p` already captured"
//! is exactly `p < watermark`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::{info, trace, warn};

use crate::copier;
use crate::host::{DataSource, HostInfo, PageWriteObserver, TimestampSource};
use crate::io;
use crate::manifest::{Manifest, MANIFEST_FILE_NAME};
use crate::shadow::ShadowStore;
use crate::types::{BackupError, BackupState, PageId, Result};
use crate::verify;
use crate::wal;

const PROGRESS_WAL_DONE: f64 = 0.90;
const PROGRESS_MANIFEST_DONE: f64 = 0.99;

/// State shared between the coordinator, the worker thread, and the host's
/// writer threads.
pub(crate) struct BackupInner {
    state: AtomicU8,
    progress_bits: AtomicU64,
    cancel: AtomicBool,
    /// Pages `[0, captured)` have been written to the backup data file.
    captured: AtomicU64,
    /// Page count pinned at the snapshot instant; later file growth is
    /// invisible to the backup.
    page_count: AtomicU64,
    pub(crate) shadow: ShadowStore,
    failure: Mutex<Option<BackupError>>,
    done: Mutex<bool>,
    done_cv: Condvar,
}

impl BackupInner {
    pub(crate) fn new(page_size: u64) -> Self {
        Self {
            state: AtomicU8::new(BackupState::Idle.as_u8()),
            progress_bits: AtomicU64::new(0f64.to_bits()),
            cancel: AtomicBool::new(false),
            captured: AtomicU64::new(0),
            page_count: AtomicU64::new(0),
            shadow: ShadowStore::new(page_size),
            failure: Mutex::new(None),
            done: Mutex::new(true),
            done_cv: Condvar::new(),
        }
    }

    /// Resets shared state for a new backup and enters `InProgress`.
    pub(crate) fn begin(&self, page_count: u64) {
        self.cancel.store(false, Ordering::Release);
        self.captured.store(0, Ordering::Release);
        self.page_count.store(page_count, Ordering::Release);
        self.progress_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.shadow.clear();
        *self.failure.lock() = None;
        *self.done.lock() = false;
        self.set_state(BackupState::InProgress);
    }

    pub(crate) fn state(&self) -> BackupState {
        BackupState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: BackupState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn progress(&self) -> f64 {
        f64::from_bits(self.progress_bits.load(Ordering::Relaxed))
    }

    /// Monotonic: a stale writer can never move progress backwards, because
    /// the bit patterns of non-negative floats order the same way the
    /// values do.
    pub(crate) fn set_progress(&self, progress: f64) {
        self.progress_bits
            .fetch_max(progress.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Acquire) {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Publishes that pages `[0, next)` now live in the backup data file.
    /// Must only be called after the bytes of page `next - 1` are staged.
    pub(crate) fn mark_captured(&self, next: u64) {
        self.captured.store(next, Ordering::Release);
    }

    pub(crate) fn captured_watermark(&self) -> u64 {
        self.captured.load(Ordering::Acquire)
    }

    fn page_count(&self) -> u64 {
        self.page_count.load(Ordering::Acquire)
    }

    fn record_failure(&self, err: BackupError) {
        *self.failure.lock() = Some(err);
    }

    fn finish(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.done_cv.notify_all();
    }

    fn wait_done(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.done_cv.wait(&mut done);
        }
    }
}

/// Coordinates zero-downtime backups of one host database.
///
/// At most one backup is active at a time; a manager whose previous backup
/// reached a terminal state can start another.
pub struct BackupManager {
    host: HostInfo,
    clock: Arc<dyn TimestampSource>,
    data: Arc<dyn DataSource>,
    inner: Arc<BackupInner>,
    start_lock: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackupManager {
    pub fn new(
        host: HostInfo,
        clock: Arc<dyn TimestampSource>,
        data: Arc<dyn DataSource>,
    ) -> Self {
        let inner = Arc::new(BackupInner::new(data.page_size()));
        Self {
            host,
            clock,
            data,
            inner,
            start_lock: Mutex::new(()),
            worker: Mutex::new(None),
        }
    }

    /// Starts a backup into `dest`, creating the directory if needed, and
    /// returns once the background worker is launched.
    ///
    /// Fails with [`BackupError::AlreadyActive`] while a backup is running
    /// and with [`BackupError::InvalidPath`] / [`BackupError::Io`] when the
    /// destination cannot be prepared.
    pub fn start_backup(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        let _guard = self.start_lock.lock();

        let state = self.inner.state();
        if state == BackupState::InProgress || state == BackupState::Finalizing {
            return Err(BackupError::AlreadyActive);
        }
        if dest.as_os_str().is_empty() {
            return Err(BackupError::InvalidPath("empty backup destination".into()));
        }
        io::create_dir_all(dest)?;

        // Reap the worker of the previous, terminated backup.
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }

        let snapshot_ts = self.clock.current_snapshot_timestamp();
        let page_count = self.data.num_pages()?;
        let page_size = self.data.page_size();
        let manifest = Manifest {
            snapshot_ts,
            db_id: self.host.db_id.clone(),
            db_path: self.host.db_path.display().to_string(),
            backup_ts: unix_time_secs(),
            page_count,
            size_bytes: page_count * page_size,
            engine_version: self.host.engine_version.clone(),
            data_crc32: None,
        };

        self.inner.begin(page_count);
        info!(
            snapshot_ts,
            page_count,
            dest = %dest.display(),
            "backup.started"
        );

        let inner = Arc::clone(&self.inner);
        let data = Arc::clone(&self.data);
        let host = self.host.clone();
        let dest = dest.to_path_buf();
        let handle = thread::spawn(move || run_worker(&inner, data.as_ref(), &host, &dest, manifest));
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Blocks until the current backup reaches `Completed` or `Failed`.
    /// Returns immediately when no backup is running. Safe to call from
    /// any number of threads.
    pub fn wait_for_completion(&self) {
        self.inner.wait_done();
    }

    pub fn state(&self) -> BackupState {
        self.inner.state()
    }

    /// Fractional completion in `[0.0, 1.0]`, non-decreasing while a single
    /// backup runs. Reaches `1.0` only on `Completed`.
    pub fn progress(&self) -> f64 {
        self.inner.progress()
    }

    /// Requests cancellation of the running backup. Idempotent; a no-op
    /// after termination. The worker observes the request between pages
    /// and between stages, then terminates as `Failed` with a cancellation
    /// reason and discards the partially written data and WAL files.
    pub fn cancel(&self) {
        self.inner.request_cancel();
    }

    /// Hook for the host's page-write path: call before mutating any byte
    /// of `page`. Preserves the page's pre-mutation image if the running
    /// backup still needs it. Never fails and never touches the backup
    /// destination; cheap when no backup is active.
    pub fn notify_page_modification(&self, page: PageId) {
        let inner = &self.inner;
        if inner.state() != BackupState::InProgress {
            return;
        }
        if page.0 >= inner.page_count() {
            // The page was allocated after the snapshot; the backup never
            // reads it.
            return;
        }
        if page.0 < inner.captured_watermark() {
            return;
        }
        if inner.shadow.contains(page) {
            return;
        }
        let mut buf = vec![0u8; inner.shadow.page_size() as usize];
        match self.data.read_page(page, &mut buf) {
            Ok(()) => {
                inner.shadow.preserve(page, &buf);
                trace!(page = page.0, "backup.shadow.preserved");
            }
            Err(err) => {
                // The host write path must not fail because of the backup.
                warn!(page = page.0, error = %err, "backup.shadow.preserve_failed");
            }
        }
    }

    /// Failure description of the most recent backup, if it failed.
    pub fn failure_reason(&self) -> Option<String> {
        self.inner.failure.lock().as_ref().map(ToString::to_string)
    }

    /// Pages currently preserved in the shadow store.
    pub fn shadow_page_count(&self) -> u64 {
        self.inner.shadow.count()
    }

    /// Pages written to the backup data file so far.
    pub fn captured_page_count(&self) -> u64 {
        self.inner.captured_watermark()
    }
}

impl PageWriteObserver for BackupManager {
    fn before_page_write(&self, page: PageId) {
        self.notify_page_modification(page);
    }
}

impl Drop for BackupManager {
    fn drop(&mut self) {
        self.inner.request_cancel();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(
    inner: &BackupInner,
    data: &dyn DataSource,
    host: &HostInfo,
    dest: &Path,
    mut manifest: Manifest,
) {
    let result = run_stages(inner, data, host, dest, &mut manifest);
    match result {
        Ok(()) => {
            inner.set_state(BackupState::Completed);
            inner.set_progress(1.0);
            info!(
                pages = manifest.page_count,
                snapshot_ts = manifest.snapshot_ts,
                "backup.completed"
            );
        }
        Err(err) => {
            if matches!(err, BackupError::Cancelled) {
                discard_partial_output(dest, host);
                info!("backup.cancelled");
            } else {
                warn!(error = %err, "backup.failed");
            }
            // A failed backup must never look consumable; the rest of the
            // directory may stay behind for diagnosis.
            remove_manifest(dest);
            inner.record_failure(err);
            inner.set_state(BackupState::Failed);
        }
    }
    inner.shadow.clear();
    inner.finish();
}

fn remove_manifest(dest: &Path) {
    let manifest_path = dest.join(MANIFEST_FILE_NAME);
    if io::exists(&manifest_path) {
        if let Err(err) = io::remove_file(&manifest_path) {
            warn!(error = %err, "backup.cleanup.manifest_removal_failed");
        }
    }
}

fn run_stages(
    inner: &BackupInner,
    data: &dyn DataSource,
    host: &HostInfo,
    dest: &Path,
    manifest: &mut Manifest,
) -> Result<()> {
    let data_name = host.db_basename()?;
    let page_size = data.page_size();

    let backup_data = io::StdFileIo::create(dest.join(&data_name))?;
    let outcome = copier::copy_pages(data, &backup_data, inner, manifest.page_count)?;
    manifest.data_crc32 = Some(outcome.crc32);
    inner.check_cancelled()?;

    let wal_captured = wal::capture_wal(&host.wal_path(), dest)?.is_some();
    inner.set_progress(PROGRESS_WAL_DONE);
    inner.check_cancelled()?;

    wal::capture_aux_files(host, dest)?;
    inner.check_cancelled()?;

    inner.set_state(BackupState::Finalizing);
    manifest.write_to(dest.join(MANIFEST_FILE_NAME))?;
    inner.set_progress(PROGRESS_MANIFEST_DONE);

    verify::verify_backup(dest, manifest, &data_name, page_size, wal_captured)
}

/// A cancelled backup must not look consumable: the manifest was never
/// written, and the partial data and WAL copies are removed.
fn discard_partial_output(dest: &Path, host: &HostInfo) {
    let Ok(data_name) = host.db_basename() else {
        return;
    };
    let data_path = dest.join(&data_name);
    if io::exists(&data_path) {
        if let Err(err) = io::remove_file(&data_path) {
            warn!(error = %err, "backup.cancel.cleanup_failed");
        }
    }
    let mut wal_name = data_name;
    wal_name.push(".wal");
    let wal_path = dest.join(wal_name);
    if io::exists(&wal_path) {
        if let Err(err) = io::remove_file(&wal_path) {
            warn!(error = %err, "backup.cancel.cleanup_failed");
        }
    }
}

fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
