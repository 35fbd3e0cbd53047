//! Shadow store: pre-mutation page images kept alive for the duration of a
//! backup.
//!
//! When a writer is about to touch a page the copier has not reached yet,
//! the page's current bytes are preserved here. First-writer-wins is the
//! load-bearing rule: only the bytes as they stood at the snapshot instant
//! may ever be stored for a given page, so a second preservation of the
//! same page must be a no-op.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{BackupError, PageId, Result};

pub struct ShadowStore {
    page_size: usize,
    pages: RwLock<HashMap<PageId, Box<[u8]>>>,
}

impl ShadowStore {
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size: page_size as usize,
            pages: RwLock::new(HashMap::new()),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size as u64
    }

    /// Records the original bytes of `page` unless an entry already exists.
    ///
    /// Callers pass the page's bytes as they stand *before* the pending
    /// mutation; the host write path guarantees the mutation has not begun.
    pub fn preserve(&self, page: PageId, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.page_size);
        let mut pages = self.pages.write();
        pages.entry(page).or_insert_with(|| Box::from(bytes));
    }

    /// Copies the preserved bytes of `page` into `dst`.
    pub fn read(&self, page: PageId, dst: &mut [u8]) -> Result<()> {
        let pages = self.pages.read();
        let bytes = pages.get(&page).ok_or(BackupError::NotPreserved(page))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    pub fn contains(&self, page: PageId) -> bool {
        self.pages.read().contains_key(&page)
    }

    pub fn count(&self) -> u64 {
        self.pages.read().len() as u64
    }

    /// Drops every preserved page.
    pub fn clear(&self) {
        let mut pages = self.pages.write();
        pages.clear();
        pages.shrink_to_fit();
    }
}
