//! Access to persistent memory through typed, flush-paired helpers.

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

use crate::CACHE_LINE_SIZE;

/// Byte-addressable persistent memory.
///
/// Addresses are physical. A store becomes durable only once [`flush_line`]
/// has covered its cache line and a [`fence`] has ordered the write-back;
/// this is the only durability primitive the core assumes.
///
/// [`flush_line`]: PersistentMemory::flush_line
/// [`fence`]: PersistentMemory::fence
pub trait PersistentMemory {
    /// Physical address of the first byte of the region.
    fn base(&self) -> u64;

    /// Region size in bytes.
    fn size(&self) -> u64;

    fn read_bytes(&self, paddr: u64, buf: &mut [u8]);

    /// Store bytes. Not durable until flushed.
    fn write_bytes(&mut self, paddr: u64, bytes: &[u8]);

    /// Write back the cache line containing `paddr`.
    fn flush_line(&mut self, paddr: u64);

    /// Order previously issued write-backs before subsequent stores.
    fn fence(&mut self);
}

/// Typed record access over any [`PersistentMemory`].
///
/// Record types are `#[repr(C)]` with `zerocopy` layouts, so a record is read
/// and written as its exact byte image; `persist_record` pairs the store with
/// a write-back of every line it touches.
pub trait PersistentMemoryExt: PersistentMemory {
    fn read_record<T: FromBytes + IntoBytes>(&self, paddr: u64) -> T {
        let mut value = T::new_zeroed();
        self.read_bytes(paddr, value.as_mut_bytes());
        value
    }

    /// Store a record without making it durable.
    fn write_record<T: IntoBytes + Immutable + ?Sized>(&mut self, paddr: u64, value: &T) {
        self.write_bytes(paddr, value.as_bytes());
    }

    /// Store a record and write back every cache line it touches.
    fn persist_record<T: IntoBytes + Immutable + ?Sized>(&mut self, paddr: u64, value: &T) {
        self.write_record(paddr, value);
        self.flush_range(paddr, value.as_bytes().len() as u64);
        self.fence();
    }

    /// Write back every cache line of `[paddr, paddr + len)`.
    /// Returns the number of lines flushed.
    fn flush_range(&mut self, paddr: u64, len: u64) -> u64 {
        if len == 0 {
            return 0;
        }
        let first = paddr & !(CACHE_LINE_SIZE - 1);
        let last = (paddr + len - 1) & !(CACHE_LINE_SIZE - 1);
        let mut line = first;
        let mut count = 0;
        while line <= last {
            self.flush_line(line);
            count += 1;
            line += CACHE_LINE_SIZE;
        }
        count
    }

    /// Copy `len` bytes between two ranges of the region, writing back each
    /// destination chunk as it is filled.
    fn copy_flushed(&mut self, dst: u64, src: u64, len: u64) {
        const CHUNK: usize = 512;
        let mut buf = [0u8; CHUNK];
        let mut offset = 0u64;
        while offset < len {
            let n = CHUNK.min((len - offset) as usize);
            self.read_bytes(src + offset, &mut buf[..n]);
            self.write_bytes(dst + offset, &buf[..n]);
            self.flush_range(dst + offset, n as u64);
            offset += n as u64;
        }
        self.fence();
    }

    /// Zero `[paddr, paddr + len)` and write it back. Backing pages may hold
    /// stale bytes from a previous boot; fresh segments must not.
    fn zero_flushed(&mut self, paddr: u64, len: u64) {
        const CHUNK: usize = 512;
        let zeroes = [0u8; CHUNK];
        let mut offset = 0u64;
        while offset < len {
            let n = CHUNK.min((len - offset) as usize);
            self.write_bytes(paddr + offset, &zeroes[..n]);
            self.flush_range(paddr + offset, n as u64);
            offset += n as u64;
        }
        self.fence();
    }
}

impl<P: PersistentMemory + ?Sized> PersistentMemoryExt for P {}
