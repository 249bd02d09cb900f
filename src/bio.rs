//! Buffer cache.
//!
//! A fixed table of buffer heads holds cached copies of disk blocks and
//! is the synchronization point for all block I/O. Two structures index
//! the table: a hash chain keyed by block number and an LRU list
//! threaded through every head.
//!
//! Interface:
//! * `bread` returns a referenced buffer with the block's contents.
//! * `mark_dirty` after changing buffer data.
//! * `brelse` when done; a dirty buffer is written back there.
//! * `sync_all` flushes every dirty buffer, in LRU order.
//!
//! At most one head exists for a given (device, block) pair. A head
//! with a positive reference count is never reused; a dirty head is
//! never discarded without a successful write. List and hash edits
//! happen under the cache lock, the moral equivalent of the interrupt-
//! disabled sections on the single CPU.

use alloc::{boxed::Box, vec::Vec};

use spin::Mutex;

use crate::{
    dev::DevT,
    error::{KernelError, Result},
    hal::DiskTable,
    kprintln,
    param::{BLOCK_SIZE, BUFFER_HASH_SIZE, NR_BUFFER},
};

const NIL: usize = usize::MAX;

/// Index handle to a buffer head. Obtained from `bread`/`getblk`,
/// returned with `brelse`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufRef(usize);

struct BufHead {
    dev: DevT,
    block: u32,
    refcnt: u32,
    dirty: bool,
    uptodate: bool,
    data: Box<[u8; BLOCK_SIZE]>,

    /// LRU links; head of the list is least recently used.
    lru_prev: usize,
    lru_next: usize,
    /// Hash chain link.
    hash_next: usize,
}

struct BcacheInner {
    bufs: Vec<BufHead>,
    lru_head: usize,
    lru_tail: usize,
    hash: [usize; BUFFER_HASH_SIZE],
}

pub struct Bcache {
    inner: Mutex<BcacheInner>,
}

fn hash_of(block: u32) -> usize {
    block as usize & (BUFFER_HASH_SIZE - 1)
}

impl BcacheInner {
    fn new() -> Self {
        let mut bufs = Vec::with_capacity(NR_BUFFER);
        for i in 0..NR_BUFFER {
            bufs.push(BufHead {
                dev: DevT(0),
                block: 0,
                refcnt: 0,
                dirty: false,
                uptodate: false,
                data: Box::new([0; BLOCK_SIZE]),
                lru_prev: if i == 0 { NIL } else { i - 1 },
                lru_next: if i == NR_BUFFER - 1 { NIL } else { i + 1 },
                hash_next: NIL,
            });
        }
        Self {
            bufs,
            lru_head: 0,
            lru_tail: NR_BUFFER - 1,
            hash: [NIL; BUFFER_HASH_SIZE],
        }
    }

    fn lru_unlink(&mut self, i: usize) {
        let (prev, next) = (self.bufs[i].lru_prev, self.bufs[i].lru_next);
        match prev {
            NIL => self.lru_head = next,
            p => self.bufs[p].lru_next = next,
        }
        match next {
            NIL => self.lru_tail = prev,
            n => self.bufs[n].lru_prev = prev,
        }
        self.bufs[i].lru_prev = NIL;
        self.bufs[i].lru_next = NIL;
    }

    /// Most recently used position.
    fn lru_push_tail(&mut self, i: usize) {
        self.bufs[i].lru_prev = self.lru_tail;
        self.bufs[i].lru_next = NIL;
        match self.lru_tail {
            NIL => self.lru_head = i,
            t => self.bufs[t].lru_next = i,
        }
        self.lru_tail = i;
    }

    fn hash_unlink(&mut self, i: usize) {
        let bucket = hash_of(self.bufs[i].block);
        let mut cur = self.hash[bucket];
        if cur == i {
            self.hash[bucket] = self.bufs[i].hash_next;
        } else {
            while cur != NIL {
                let next = self.bufs[cur].hash_next;
                if next == i {
                    self.bufs[cur].hash_next = self.bufs[i].hash_next;
                    break;
                }
                cur = next;
            }
        }
        self.bufs[i].hash_next = NIL;
    }

    fn hash_insert(&mut self, i: usize) {
        let bucket = hash_of(self.bufs[i].block);
        self.bufs[i].hash_next = self.hash[bucket];
        self.hash[bucket] = i;
    }

    fn lookup(&self, dev: DevT, block: u32) -> Option<usize> {
        let mut cur = self.hash[hash_of(block)];
        while cur != NIL {
            let bh = &self.bufs[cur];
            if bh.block == block && bh.dev == dev {
                return Some(cur);
            }
            cur = bh.hash_next;
        }
        None
    }

    /// First reusable head from the LRU end, written back if dirty.
    fn get_empty(&mut self, disks: &DiskTable) -> Result<usize> {
        let mut cur = self.lru_head;
        while cur != NIL {
            if self.bufs[cur].refcnt == 0 {
                break;
            }
            cur = self.bufs[cur].lru_next;
        }
        if cur == NIL {
            return Err(KernelError::NoMemory);
        }

        if self.bufs[cur].dirty && self.write_head(disks, cur).is_err() {
            kprintln!("bio : can't write block {} on disk", self.bufs[cur].block);
        }

        self.bufs[cur].refcnt = 1;
        self.bufs[cur].dirty = false;
        self.bufs[cur].uptodate = false;
        Ok(cur)
    }

    fn write_head(&mut self, disks: &DiskTable, i: usize) -> Result<()> {
        let bh = &mut self.bufs[i];
        disks.write_block(bh.dev, bh.block, &bh.data)?;
        bh.dirty = false;
        Ok(())
    }
}

impl Bcache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BcacheInner::new()),
        }
    }

    /// Return a referenced buffer for the named block, from the cache or
    /// by reusing the least recently used free head. The contents are
    /// unspecified until `bread` or the caller marks them up to date.
    pub fn getblk(&self, disks: &DiskTable, dev: DevT, block: u32) -> Result<BufRef> {
        let mut inner = self.inner.lock();

        let i = match inner.lookup(dev, block) {
            Some(i) => {
                inner.bufs[i].refcnt += 1;
                i
            }
            None => {
                let i = inner.get_empty(disks)?;
                inner.hash_unlink(i);
                inner.bufs[i].dev = dev;
                inner.bufs[i].block = block;
                inner.hash_insert(i);
                i
            }
        };

        // Freshly touched: most recently used.
        inner.lru_unlink(i);
        inner.lru_push_tail(i);
        Ok(BufRef(i))
    }

    /// Read a block through the cache.
    pub fn bread(&self, disks: &DiskTable, dev: DevT, block: u32) -> Result<BufRef> {
        let buf = self.getblk(disks, dev, block)?;
        let mut inner = self.inner.lock();
        let i = buf.0;
        if !inner.bufs[i].uptodate {
            let bh = &mut inner.bufs[i];
            if disks.read_block(bh.dev, bh.block, &mut bh.data).is_err() {
                drop(inner);
                self.brelse(disks, buf);
                return Err(KernelError::Io);
            }
            bh.uptodate = true;
        }
        Ok(buf)
    }

    /// Write a buffer to disk and clear its dirty bit.
    pub fn bwrite(&self, disks: &DiskTable, buf: BufRef) -> Result<()> {
        self.inner.lock().write_head(disks, buf.0)
    }

    /// Drop one reference; dirty contents are written back first.
    pub fn brelse(&self, disks: &DiskTable, buf: BufRef) {
        let mut inner = self.inner.lock();
        let i = buf.0;
        if inner.bufs[i].dirty && inner.write_head(disks, i).is_err() {
            kprintln!("bio : can't write block {} on disk", inner.bufs[i].block);
        }
        assert!(inner.bufs[i].refcnt > 0, "brelse: refcnt underflow");
        inner.bufs[i].refcnt -= 1;
    }

    /// Flush every dirty buffer. Storage loss here is fatal: there is no
    /// journal to replay.
    pub fn sync_all(&self, disks: &DiskTable) {
        let mut inner = self.inner.lock();
        let mut cur = inner.lru_head;
        while cur != NIL {
            let next = inner.bufs[cur].lru_next;
            if inner.bufs[cur].dirty && inner.write_head(disks, cur).is_err() {
                kprintln!("bio : can't write block {} on disk", inner.bufs[cur].block);
                panic!("disk error");
            }
            cur = next;
        }
    }

    pub fn with_data<R>(&self, buf: BufRef, f: impl FnOnce(&[u8; BLOCK_SIZE]) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner.bufs[buf.0].data)
    }

    pub fn with_data_mut<R>(&self, buf: BufRef, f: impl FnOnce(&mut [u8; BLOCK_SIZE]) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner.bufs[buf.0].data)
    }

    pub fn mark_dirty(&self, buf: BufRef) {
        self.inner.lock().bufs[buf.0].dirty = true;
    }

    pub fn mark_uptodate(&self, buf: BufRef) {
        self.inner.lock().bufs[buf.0].uptodate = true;
    }

    /// Zero a buffer and mark it dirty and valid; used when a freshly
    /// allocated block must not leak stale contents.
    pub fn bzero(&self, buf: BufRef) {
        let mut inner = self.inner.lock();
        let bh = &mut inner.bufs[buf.0];
        bh.data.fill(0);
        bh.dirty = true;
        bh.uptodate = true;
    }

    /// Reference count of a head; debug and test inspection.
    pub fn refcnt(&self, buf: BufRef) -> u32 {
        self.inner.lock().bufs[buf.0].refcnt
    }

    /// Whether a block currently has a cached head.
    pub fn resident(&self, dev: DevT, block: u32) -> bool {
        self.inner.lock().lookup(dev, block).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::RamDisk;

    fn setup() -> (Bcache, DiskTable, DevT) {
        let disks = DiskTable::new();
        let dev = DevT::new(3, 0);
        disks.register(dev, Box::new(RamDisk::new(4 * NR_BUFFER as u32)));
        (Bcache::new(), disks, dev)
    }

    #[test]
    fn same_block_returns_same_head() {
        let (bc, disks, dev) = setup();
        let a = bc.bread(&disks, dev, 7).unwrap();
        let b = bc.bread(&disks, dev, 7).unwrap();
        assert_eq!(a, b);
        assert_eq!(bc.refcnt(a), 2);
        bc.brelse(&disks, a);
        bc.brelse(&disks, b);
        assert_eq!(bc.refcnt(a), 0);
    }

    #[test]
    fn write_read_round_trip() {
        let (bc, disks, dev) = setup();
        let buf = bc.bread(&disks, dev, 3).unwrap();
        bc.with_data_mut(buf, |d| d[..5].copy_from_slice(b"hello"));
        bc.mark_dirty(buf);
        bc.brelse(&disks, buf);

        // Push the block out of the cache, then read it again.
        for blk in 100..100 + NR_BUFFER as u32 {
            let b = bc.bread(&disks, dev, blk).unwrap();
            bc.brelse(&disks, b);
        }
        assert!(!bc.resident(dev, 3));

        let buf = bc.bread(&disks, dev, 3).unwrap();
        bc.with_data(buf, |d| assert_eq!(&d[..5], b"hello"));
        bc.brelse(&disks, buf);
    }

    #[test]
    fn least_recently_used_is_evicted_first() {
        let (bc, disks, dev) = setup();
        for blk in 0..NR_BUFFER as u32 {
            let b = bc.bread(&disks, dev, blk).unwrap();
            bc.brelse(&disks, b);
        }
        // Touch block 0 so block 1 becomes the LRU victim.
        let b = bc.bread(&disks, dev, 0).unwrap();
        bc.brelse(&disks, b);

        let b = bc.bread(&disks, dev, 500).unwrap();
        bc.brelse(&disks, b);
        assert!(bc.resident(dev, 0));
        assert!(!bc.resident(dev, 1));
    }

    #[test]
    fn referenced_buffers_are_never_evicted() {
        let (bc, disks, dev) = setup();
        let pinned = bc.bread(&disks, dev, 1).unwrap();
        for blk in 200..200 + 2 * NR_BUFFER as u32 {
            let b = bc.bread(&disks, dev, blk).unwrap();
            bc.brelse(&disks, b);
        }
        assert!(bc.resident(dev, 1));
        assert_eq!(bc.refcnt(pinned), 1);
        bc.brelse(&disks, pinned);
    }

    #[test]
    fn cache_full_of_pinned_buffers_reports_no_memory() {
        let (bc, disks, dev) = setup();
        let mut held = alloc::vec::Vec::new();
        for blk in 0..NR_BUFFER as u32 {
            held.push(bc.bread(&disks, dev, blk).unwrap());
        }
        assert_eq!(
            bc.getblk(&disks, dev, 999).unwrap_err(),
            KernelError::NoMemory
        );
        for b in held {
            bc.brelse(&disks, b);
        }
    }

    #[test]
    fn sync_all_flushes_dirty_buffers() {
        let (bc, disks, dev) = setup();
        let buf = bc.bread(&disks, dev, 9).unwrap();
        bc.with_data_mut(buf, |d| d[0] = 0x42);
        bc.mark_dirty(buf);
        bc.sync_all(&disks);

        let mut raw = [0u8; BLOCK_SIZE];
        disks.read_block(dev, 9, &mut raw).unwrap();
        assert_eq!(raw[0], 0x42);
        bc.brelse(&disks, buf);
    }
}
