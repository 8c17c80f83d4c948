//! Marker semaphore control. Each backend maps a small shared-memory
//! table of per-marker counters; attaching bumps every counter so the
//! marker bodies start materializing payloads, detaching decrements them
//! back to the no-op state. The handle detaches on drop, so a panicking
//! coordinator still releases the markers it can.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, Context, Result};
use memmap2::MmapMut;

use planscout_common::{NUM_MARKERS, SEMAPHORE_TABLE_BYTES, SEMAPHORE_TABLE_MAGIC};

const HEADER_BYTES: usize = 8;

pub struct SemaphoreHandle {
    mmap: MmapMut,
    attached: bool,
}

impl SemaphoreHandle {
    pub fn table_path(pid: u32) -> PathBuf {
        PathBuf::from(format!("/dev/shm/planscout.{pid}.sem"))
    }

    /// Open the semaphore table a backend published for its pid.
    pub fn open(pid: u32) -> Result<Self> {
        let path = Self::table_path(pid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open semaphore table {}", path.display()))?;
        if file.metadata()?.len() < SEMAPHORE_TABLE_BYTES as u64 {
            bail!("semaphore table {} is truncated", path.display());
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let handle = Self {
            mmap,
            attached: false,
        };
        if handle.word(0).load(Ordering::Acquire) != SEMAPHORE_TABLE_MAGIC {
            bail!("semaphore table {} has a bad magic word", path.display());
        }
        Ok(handle)
    }

    fn word(&self, byte_offset: usize) -> &AtomicU32 {
        unsafe { &*(self.mmap.as_ptr().add(byte_offset) as *const AtomicU32) }
    }

    fn slot(&self, index: usize) -> &AtomicU32 {
        debug_assert!(index < NUM_MARKERS);
        self.word(HEADER_BYTES + index * 4)
    }

    pub fn attach(&mut self) {
        self.word(4)
            .store(std::process::id(), Ordering::Release);
        for index in 0..NUM_MARKERS {
            self.slot(index).fetch_add(1, Ordering::AcqRel);
        }
        self.attached = true;
    }

    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        for index in 0..NUM_MARKERS {
            let _ = self
                .slot(index)
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        }
        self.word(4).store(0, Ordering::Release);
        self.attached = false;
    }

    pub fn count(&self, index: usize) -> u32 {
        self.slot(index).load(Ordering::Relaxed)
    }
}

impl Drop for SemaphoreHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fake_table(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("table.sem");
        let mut bytes = vec![0u8; SEMAPHORE_TABLE_BYTES];
        bytes[0..4].copy_from_slice(&SEMAPHORE_TABLE_MAGIC.to_ne_bytes());
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();
        path
    }

    fn open_path(path: &std::path::Path) -> SemaphoreHandle {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .unwrap();
        let mmap = unsafe { MmapMut::map_mut(&file).unwrap() };
        SemaphoreHandle {
            mmap,
            attached: false,
        }
    }

    #[test]
    fn attach_and_detach_roundtrip_every_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = open_path(&fake_table(dir.path()));
        handle.attach();
        assert_eq!(handle.count(0), 1);
        assert_eq!(handle.count(NUM_MARKERS - 1), 1);
        handle.detach();
        assert_eq!(handle.count(0), 0);
        // Detaching twice never underflows.
        handle.detach();
        assert_eq!(handle.count(NUM_MARKERS - 1), 0);
    }

    #[test]
    fn drop_releases_held_semaphores() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_table(dir.path());
        {
            let mut handle = open_path(&path);
            handle.attach();
        }
        let handle = open_path(&path);
        assert_eq!(handle.count(0), 0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.sem");
        std::fs::write(&path, vec![0u8; SEMAPHORE_TABLE_BYTES]).unwrap();
        // Route through open() by pid is not possible for an arbitrary
        // path, so check the magic validation directly.
        let handle = open_path(&path);
        assert_ne!(
            handle.word(0).load(Ordering::Acquire),
            SEMAPHORE_TABLE_MAGIC
        );
    }
}
