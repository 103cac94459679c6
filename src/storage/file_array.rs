//! # File-Backed Page Array
//!
//! Memory-maps a single backing file and serves page reads and writes out
//! of the map. Growing the array extends the file and remaps; the write
//! lock over the map makes remapping safe against concurrent readers.
//!
//! Reads copy out of the map under a shared lock. Writes take the
//! exclusive lock: page writes are already serialized per page id by the
//! owning node's latch, so the map lock is not the bottleneck it appears
//! to be.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{ensure, Context, Result};
use memmap2::MmapMut;
use parking_lot::RwLock;

use super::PageArray;
use crate::error::WriteFailure;

struct Mapping {
    file: File,
    map: Option<MmapMut>,
    page_count: u64,
}

pub struct FilePageArray {
    page_size: u32,
    mapping: RwLock<Mapping>,
    closed: AtomicBool,
}

impl FilePageArray {
    /// Opens or creates the backing file, sized to at least `min_pages`.
    pub fn open(path: &Path, page_size: u32, min_pages: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open page file at {:?}", path))?;

        let len = file
            .metadata()
            .wrap_err("failed to stat page file")?
            .len();
        let mut page_count = len / page_size as u64;
        if page_count < min_pages {
            page_count = min_pages;
            file.set_len(page_count * page_size as u64)
                .wrap_err("failed to size page file")?;
        }

        let map = if page_count == 0 {
            None
        } else {
            // SAFETY: the file is exclusively owned by this process for the
            // lifetime of the database; the map is remapped under the write
            // lock whenever the length changes.
            Some(unsafe { MmapMut::map_mut(&file) }.wrap_err("failed to map page file")?)
        };

        Ok(Self {
            page_size,
            mapping: RwLock::new(Mapping {
                file,
                map,
                page_count,
            }),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        ensure!(!self.closed.load(Ordering::Acquire), "page array is closed");
        Ok(())
    }
}

impl PageArray for FilePageArray {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.mapping.read().page_count
    }

    fn set_page_count(&self, count: u64) -> Result<()> {
        self.check_open()?;
        let mut mapping = self.mapping.write();
        if count == mapping.page_count {
            return Ok(());
        }
        // Unmap before resizing; some platforms refuse to truncate a mapped
        // file.
        mapping.map = None;
        mapping
            .file
            .set_len(count * self.page_size as u64)
            .wrap_err("failed to resize page file")?;
        mapping.page_count = count;
        if count > 0 {
            // SAFETY: same ownership argument as in `open`.
            mapping.map =
                Some(unsafe { MmapMut::map_mut(&mapping.file) }.wrap_err("failed to remap")?);
        }
        Ok(())
    }

    fn read_page(&self, index: u64, buf: &mut [u8], offset: usize, length: usize) -> Result<()> {
        self.check_open()?;
        let mapping = self.mapping.read();
        ensure!(
            index < mapping.page_count,
            "page {} out of bounds (count {})",
            index,
            mapping.page_count,
        );
        ensure!(
            length <= self.page_size as usize && offset + length <= buf.len(),
            "read of {} bytes at offset {} overflows buffer of {}",
            length,
            offset,
            buf.len(),
        );
        let map = mapping.map.as_ref().expect("non-empty array has a map");
        let start = index as usize * self.page_size as usize;
        buf[offset..offset + length].copy_from_slice(&map[start..start + length]);
        Ok(())
    }

    fn write_page(&self, index: u64, buf: &[u8], offset: usize) -> Result<()> {
        self.check_open()?;
        let mut mapping = self.mapping.write();
        let page_size = self.page_size as usize;
        if index >= mapping.page_count || offset + page_size > buf.len() {
            return Err(WriteFailure {
                page_id: index,
                detail: format!(
                    "write out of bounds: index {}, count {}, buffer {}",
                    index,
                    mapping.page_count,
                    buf.len(),
                ),
            }
            .into());
        }
        let start = index as usize * page_size;
        let map = mapping.map.as_mut().expect("non-empty array has a map");
        map[start..start + page_size].copy_from_slice(&buf[offset..offset + page_size]);
        Ok(())
    }

    fn sync(&self, _metadata: bool) -> Result<()> {
        self.check_open()?;
        let mapping = self.mapping.read();
        if let Some(map) = mapping.map.as_ref() {
            map.flush().wrap_err("failed to flush page file")?;
        }
        mapping
            .file
            .sync_all()
            .wrap_err("failed to sync page file")?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut mapping = self.mapping.write();
        if let Some(map) = mapping.map.take() {
            map.flush().wrap_err("failed to flush page file on close")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_array(pages: u64) -> (tempfile::TempDir, FilePageArray) {
        let dir = tempdir().unwrap();
        let array = FilePageArray::open(&dir.path().join("pages.db"), 512, pages).unwrap();
        (dir, array)
    }

    #[test]
    fn round_trips_a_page() {
        let (_dir, array) = open_array(4);
        let page = vec![0xCDu8; 512];
        array.write_page(2, &page, 0).unwrap();

        let mut out = vec![0u8; 512];
        array.read_page(2, &mut out, 0, 512).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn grows_and_zero_fills() {
        let (_dir, array) = open_array(2);
        array.set_page_count(8).unwrap();
        assert_eq!(array.page_count(), 8);

        let mut out = vec![0xFFu8; 512];
        array.read_page(7, &mut out, 0, 512).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_bounds_read_errors() {
        let (_dir, array) = open_array(2);
        let mut out = vec![0u8; 512];
        assert!(array.read_page(5, &mut out, 0, 512).is_err());
    }

    #[test]
    fn out_of_bounds_write_is_write_failure() {
        let (_dir, array) = open_array(2);
        let page = vec![0u8; 512];
        let err = array.write_page(9, &page, 0).unwrap_err();
        assert!(err.downcast_ref::<WriteFailure>().is_some());
    }

    #[test]
    fn close_is_idempotent_and_fails_io() {
        let (_dir, array) = open_array(2);
        array.close().unwrap();
        array.close().unwrap();
        let mut out = vec![0u8; 512];
        assert!(array.read_page(0, &mut out, 0, 512).is_err());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");
        {
            let array = FilePageArray::open(&path, 512, 2).unwrap();
            let page = vec![0x5Au8; 512];
            array.write_page(1, &page, 0).unwrap();
            array.sync(true).unwrap();
            array.close().unwrap();
        }
        let array = FilePageArray::open(&path, 512, 2).unwrap();
        let mut out = vec![0u8; 512];
        array.read_page(1, &mut out, 0, 512).unwrap();
        assert!(out.iter().all(|&b| b == 0x5A));
    }
}
