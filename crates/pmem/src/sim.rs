//! Simulated persistent memory for crash-injection tests.
//!
//! The arena keeps two byte images: `cache` (what the CPU observes) and
//! `media` (what survives power loss). Writes land in the cache; a line
//! flush copies that line to the media. Every durable-relevant operation is
//! journaled so a test can replay any prefix and ask "what would the media
//! hold had the power failed here?".

use alloc::vec;
use alloc::vec::Vec;

use crate::CACHE_LINE_SIZE;
use crate::device::PersistentMemory;

#[derive(Clone)]
enum Op {
    Write { at: u64, bytes: Vec<u8> },
    FlushLine { line: u64 },
    Fence,
}

pub struct SimPmem {
    base: u64,
    media: Vec<u8>,
    cache: Vec<u8>,
    /// Cache and media images at the point `journal` started recording.
    journal_base_cache: Vec<u8>,
    journal_base_media: Vec<u8>,
    journal: Vec<Op>,
}

impl SimPmem {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            media: vec![0; size],
            cache: vec![0; size],
            journal_base_cache: vec![0; size],
            journal_base_media: vec![0; size],
            journal: Vec::new(),
        }
    }

    fn offset(&self, paddr: u64, len: usize) -> usize {
        assert!(
            paddr >= self.base && paddr + len as u64 <= self.base + self.media.len() as u64,
            "access [{paddr:#x}; {len}) outside the simulated region"
        );
        (paddr - self.base) as usize
    }

    /// Number of journaled durable operations since the last reset.
    pub fn durable_ops(&self) -> usize {
        self.journal.len()
    }

    /// Forget the journal and treat the current cache/media images as the
    /// replay base. Call this after test setup so crash injection covers
    /// only the operations under test.
    pub fn reset_journal(&mut self) {
        self.journal_base_cache = self.cache.clone();
        self.journal_base_media = self.media.clone();
        self.journal.clear();
    }

    /// The arena as it would be found after a power loss following the first
    /// `k` journaled operations: unflushed cache contents are gone.
    pub fn media_after(&self, k: usize) -> SimPmem {
        assert!(k <= self.journal.len());
        let mut media = self.journal_base_media.clone();
        let mut cache = self.journal_base_cache.clone();
        for op in &self.journal[..k] {
            match op {
                Op::Write { at, bytes } => {
                    let offset = (*at - self.base) as usize;
                    cache[offset..offset + bytes.len()].copy_from_slice(bytes);
                }
                Op::FlushLine { line } => {
                    let offset = (*line - self.base) as usize;
                    let end = (offset + CACHE_LINE_SIZE as usize).min(cache.len());
                    media[offset..end].copy_from_slice(&cache[offset..end]);
                }
                Op::Fence => {}
            }
        }
        // After reboot the CPU observes only what the media held.
        SimPmem {
            base: self.base,
            cache: media.clone(),
            journal_base_cache: media.clone(),
            journal_base_media: media.clone(),
            media,
            journal: Vec::new(),
        }
    }

    /// The arena after a power loss right now.
    pub fn crashed(&self) -> SimPmem {
        self.media_after(self.journal.len())
    }
}

impl PersistentMemory for SimPmem {
    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        self.media.len() as u64
    }

    fn read_bytes(&self, paddr: u64, buf: &mut [u8]) {
        let offset = self.offset(paddr, buf.len());
        buf.copy_from_slice(&self.cache[offset..offset + buf.len()]);
    }

    fn write_bytes(&mut self, paddr: u64, bytes: &[u8]) {
        let offset = self.offset(paddr, bytes.len());
        self.cache[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.journal.push(Op::Write {
            at: paddr,
            bytes: bytes.to_vec(),
        });
    }

    fn flush_line(&mut self, paddr: u64) {
        let line = paddr & !(CACHE_LINE_SIZE - 1);
        let offset = self.offset(line, 1);
        let end = (offset + CACHE_LINE_SIZE as usize).min(self.media.len());
        self.media[offset..end].copy_from_slice(&self.cache[offset..end]);
        self.journal.push(Op::FlushLine { line });
    }

    fn fence(&mut self) {
        self.journal.push(Op::Fence);
    }
}
