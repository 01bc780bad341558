#![forbid(unsafe_code)]
//! Inode management.
//!
//! On-disk inode record codec, inode table I/O, and the fixed-capacity
//! in-core inode cache.
//!
//! ## Cache model
//!
//! The cache is an arena of slots, each holding at most one inode record and
//! a reference count that is never persisted. [`InodeCache::acquire`] and
//! [`InodeCache::allocate`] hand out [`InodeHandle`] guards; dropping a guard
//! is the release. A slot whose count reaches zero keeps its record, so a
//! later acquire of the same number is served without touching the disk.
//! Record changes reach the disk only through [`InodeHandle::persist`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_alloc::{BitmapAllocator, allocate_inode_slot};
use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_types::{
    BlockNumber, DIRECTORY_FLAG, INODE_BITMAP_BLOCK, INODE_COUNT, INODE_PTR_COUNT, INODE_SIZE,
    InodeNumber, ParseError, block_index_to_offset, ensure_slice, ensure_slice_mut,
    offset_to_block_index, read_le_u16, read_le_u32, write_le_u16, write_le_u32,
};
use tracing::{trace, warn};

// ── On-disk record ──────────────────────────────────────────────────────────

const OFF_NUMBER: usize = 0;
const OFF_SIZE: usize = 4;
const OFF_OWNER: usize = 8;
const OFF_PERMISSIONS: usize = 10;
const OFF_FLAGS: usize = 12;
const OFF_LINK_COUNT: usize = 13;
const OFF_BLOCKS: usize = 16;

/// One 64-byte inode table record.
///
/// Block pointers are held as block numbers; the byte-offset form only
/// exists on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInode {
    pub number: InodeNumber,
    /// Content size in bytes.
    pub size: u32,
    pub owner_id: u16,
    pub permissions: u16,
    pub flags: u8,
    pub link_count: u8,
    pub blocks: [Option<BlockNumber>; INODE_PTR_COUNT],
}

impl DiskInode {
    /// A blank record for a freshly claimed inode number.
    #[must_use]
    pub fn new(number: InodeNumber) -> Self {
        Self {
            number,
            size: 0,
            owner_id: 0,
            permissions: 0,
            flags: 0,
            link_count: 0,
            blocks: [None; INODE_PTR_COUNT],
        }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        let record = ensure_slice(bytes, 0, INODE_SIZE)?;
        let mut blocks = [None; INODE_PTR_COUNT];
        for (i, slot) in blocks.iter_mut().enumerate() {
            *slot = offset_to_block_index(read_le_u32(record, OFF_BLOCKS + i * 4)?);
        }
        Ok(Self {
            number: InodeNumber(read_le_u32(record, OFF_NUMBER)?),
            size: read_le_u32(record, OFF_SIZE)?,
            owner_id: read_le_u16(record, OFF_OWNER)?,
            permissions: read_le_u16(record, OFF_PERMISSIONS)?,
            flags: record[OFF_FLAGS],
            link_count: record[OFF_LINK_COUNT],
            blocks,
        })
    }

    /// Serialize into the first `INODE_SIZE` bytes of `out`.
    pub fn write_to_bytes(&self, out: &mut [u8]) -> std::result::Result<(), ParseError> {
        let record = ensure_slice_mut(out, 0, INODE_SIZE)?;
        record.fill(0);
        write_le_u32(record, OFF_NUMBER, self.number.0)?;
        write_le_u32(record, OFF_SIZE, self.size)?;
        write_le_u16(record, OFF_OWNER, self.owner_id)?;
        write_le_u16(record, OFF_PERMISSIONS, self.permissions)?;
        record[OFF_FLAGS] = self.flags;
        record[OFF_LINK_COUNT] = self.link_count;
        for (i, block) in self.blocks.iter().enumerate() {
            let raw = match block {
                Some(block) => block_index_to_offset(*block)?,
                None => 0,
            };
            write_le_u32(record, OFF_BLOCKS + i * 4, raw)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.flags & DIRECTORY_FLAG != 0
    }

    /// Direct pointer `index`, or `None` when unmapped or out of range.
    #[must_use]
    pub fn block(&self, index: usize) -> Option<BlockNumber> {
        self.blocks.get(index).copied().flatten()
    }

    pub fn set_block(&mut self, index: usize, block: BlockNumber) -> Result<()> {
        let slot = self.blocks.get_mut(index).ok_or_else(|| {
            SfsError::Format(format!(
                "block pointer index {index} out of range (max {INODE_PTR_COUNT})"
            ))
        })?;
        *slot = Some(block);
        Ok(())
    }
}

fn parse_err(err: &ParseError) -> SfsError {
    SfsError::Parse(err.to_string())
}

fn check_inode_number(ino: InodeNumber) -> Result<()> {
    if ino.0 >= INODE_COUNT {
        return Err(SfsError::NotFound(format!(
            "inode {ino} outside inode table (count {INODE_COUNT})"
        )));
    }
    Ok(())
}

// ── Inode table I/O ─────────────────────────────────────────────────────────

/// Read inode `ino` from its fixed inode table location.
///
/// The table position is authoritative for the number: the returned record
/// always carries `ino`, even when the slot on disk was never written.
pub fn read_inode(dev: &dyn BlockDevice, ino: InodeNumber) -> Result<DiskInode> {
    check_inode_number(ino)?;
    let (block, offset) = ino.table_location();
    let buf = dev.read_block(block)?;
    let bytes = ensure_slice(buf.as_slice(), offset, INODE_SIZE).map_err(|e| parse_err(&e))?;
    let mut inode = DiskInode::parse_from_bytes(bytes).map_err(|e| parse_err(&e))?;
    inode.number = ino;
    Ok(inode)
}

/// Write `inode` into its inode table block (read-modify-write).
pub fn write_inode(dev: &dyn BlockDevice, inode: &DiskInode) -> Result<()> {
    check_inode_number(inode.number)?;
    let (block, offset) = inode.number.table_location();
    let mut buf = dev.read_block(block)?;
    let record =
        ensure_slice_mut(buf.as_mut_slice(), offset, INODE_SIZE).map_err(|e| parse_err(&e))?;
    inode.write_to_bytes(record).map_err(|e| parse_err(&e))?;
    dev.write_block(block, buf.as_slice())
}

// ── In-core cache ───────────────────────────────────────────────────────────

/// Index of a cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub usize);

#[derive(Debug)]
struct Slot {
    inode: DiskInode,
    /// False until the slot first holds an inode, and again after a purge.
    resident: bool,
    ref_count: u32,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            inode: DiskInode::new(InodeNumber::ROOT),
            resident: false,
            ref_count: 0,
        }
    }
}

impl Slot {
    fn loaded(inode: DiskInode) -> Self {
        Self {
            inode,
            resident: true,
            ref_count: 1,
        }
    }

    fn holds(&self, ino: InodeNumber) -> bool {
        self.resident && self.inode.number == ino
    }
}

#[derive(Debug)]
pub struct InodeCache {
    slots: Mutex<Vec<Slot>>,
}

impl InodeCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Self {
            slots: Mutex::new(slots),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// First slot with no outstanding handles.
    #[must_use]
    pub fn find_free_slot(&self) -> Option<SlotId> {
        first_free(&self.slots.lock())
    }

    /// Slots currently holding an inode record, referenced or not.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.resident).count()
    }

    /// Slots with zero references.
    #[must_use]
    pub fn free_slot_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.ref_count == 0).count()
    }

    /// Reference count of `ino` if it is resident.
    #[must_use]
    pub fn ref_count_of(&self, ino: InodeNumber) -> Option<u32> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.holds(ino))
            .map(|s| s.ref_count)
    }

    /// Obtain a handle to `ino`, loading it from disk on a miss.
    ///
    /// A resident copy is reused whatever its count. On a miss the record is
    /// loaded into the first free slot; when every slot is referenced this
    /// fails with `NotFound`.
    pub fn acquire(&self, dev: &dyn BlockDevice, ino: InodeNumber) -> Result<InodeHandle<'_>> {
        let mut slots = self.slots.lock();
        if let Some(idx) = slots.iter().position(|s| s.holds(ino)) {
            slots[idx].ref_count += 1;
            trace!(ino = ino.0, slot = idx, ref_count = slots[idx].ref_count, "inode cache hit");
            return Ok(self.handle(SlotId(idx), ino));
        }

        let Some(slot) = first_free(&slots) else {
            warn!(ino = ino.0, capacity = slots.len(), "inode cache exhausted");
            return Err(SfsError::NotFound(format!(
                "inode {ino}: inode cache exhausted"
            )));
        };
        let inode = read_inode(dev, ino)?;
        slots[slot.0] = Slot::loaded(inode);
        trace!(ino = ino.0, slot = slot.0, "inode cache miss, loaded");
        Ok(self.handle(slot, ino))
    }

    /// Claim a new inode number and return a handle to a blank record.
    ///
    /// The slot is reserved before the bitmap is touched, so a full cache
    /// never leaks an inode bit. A claimed number that is still referenced
    /// in the cache is handed back to the bitmap and reported as
    /// `Corruption`. Nothing is written to the inode table.
    pub fn allocate(&self, dev: &dyn BlockDevice) -> Result<InodeHandle<'_>> {
        let mut slots = self.slots.lock();
        let Some(free) = first_free(&slots) else {
            warn!(capacity = slots.len(), "inode cache exhausted, cannot allocate");
            return Err(SfsError::NotFound(
                "inode cache exhausted, cannot allocate".to_owned(),
            ));
        };
        let ino = allocate_inode_slot(dev)?;

        // A stale copy of a previously used number must not stay resident
        // next to the fresh one.
        let slot = match slots.iter().position(|s| s.holds(ino)) {
            Some(idx) if slots[idx].ref_count > 0 => {
                BitmapAllocator::inode_map().free(dev, ino.0)?;
                warn!(ino = ino.0, ref_count = slots[idx].ref_count, "inode claim released");
                return Err(SfsError::Corruption {
                    block: INODE_BITMAP_BLOCK.0,
                    detail: format!("inode {ino} is free in the bitmap but has open handles"),
                });
            }
            Some(idx) => SlotId(idx),
            None => free,
        };
        slots[slot.0] = Slot::loaded(DiskInode::new(ino));
        trace!(ino = ino.0, slot = slot.0, "inode allocated");
        Ok(self.handle(slot, ino))
    }

    /// Forget every unreferenced resident record.
    ///
    /// Used after the image is reformatted underneath the cache.
    pub fn purge(&self) {
        for slot in self.slots.lock().iter_mut().filter(|s| s.ref_count == 0) {
            slot.resident = false;
        }
    }

    fn handle(&self, slot: SlotId, ino: InodeNumber) -> InodeHandle<'_> {
        InodeHandle {
            cache: self,
            slot,
            ino,
        }
    }

    fn release_slot(&self, slot: SlotId) {
        let mut slots = self.slots.lock();
        let entry = &mut slots[slot.0];
        entry.ref_count = entry.ref_count.saturating_sub(1);
    }
}

fn first_free(slots: &[Slot]) -> Option<SlotId> {
    slots.iter().position(|s| s.ref_count == 0).map(SlotId)
}

// ── Handles ─────────────────────────────────────────────────────────────────

/// A counted reference to a resident inode. Dropping it releases the slot.
#[derive(Debug)]
pub struct InodeHandle<'c> {
    cache: &'c InodeCache,
    slot: SlotId,
    ino: InodeNumber,
}

impl InodeHandle<'_> {
    #[must_use]
    pub fn number(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Copy of the in-core record.
    #[must_use]
    pub fn get(&self) -> DiskInode {
        let slots = self.cache.slots.lock();
        let slot = &slots[self.slot.0];
        debug_assert!(slot.holds(self.ino), "slot {} lost inode {}", self.slot.0, self.ino);
        slot.inode
    }

    /// Mutate the in-core record. Call [`persist`](Self::persist) to write it.
    pub fn update<R>(&self, f: impl FnOnce(&mut DiskInode) -> R) -> R {
        let mut slots = self.cache.slots.lock();
        let slot = &mut slots[self.slot.0];
        debug_assert!(slot.holds(self.ino), "slot {} lost inode {}", self.slot.0, self.ino);
        f(&mut slot.inode)
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.cache.slots.lock()[self.slot.0].ref_count
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.get().is_dir()
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.get().size
    }

    #[must_use]
    pub fn block(&self, index: usize) -> Option<BlockNumber> {
        self.get().block(index)
    }

    /// Write the in-core record to the inode table.
    pub fn persist(&self, dev: &dyn BlockDevice) -> Result<()> {
        write_inode(dev, &self.get())
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for InodeHandle<'_> {
    fn drop(&mut self) {
        self.cache.release_slot(self.slot);
        trace!(ino = self.ino.0, slot = self.slot.0, "inode released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_block::{ByteBlockDevice, MemByteDevice};
    use sfs_types::BLOCK_SIZE;

    fn test_dev() -> ByteBlockDevice<MemByteDevice> {
        ByteBlockDevice::in_memory(16).expect("device")
    }

    fn sample_inode() -> DiskInode {
        let mut inode = DiskInode::new(InodeNumber(70));
        inode.size = 4160;
        inode.owner_id = 1000;
        inode.permissions = 0o755;
        inode.flags = DIRECTORY_FLAG;
        inode.link_count = 3;
        inode.set_block(0, BlockNumber(9)).unwrap();
        inode.set_block(1, BlockNumber(12)).unwrap();
        inode.set_block(11, BlockNumber(15)).unwrap();
        inode
    }

    #[test]
    fn record_round_trip_reproduces_every_field() {
        let inode = sample_inode();
        let mut bytes = [0xAA_u8; INODE_SIZE];
        inode.write_to_bytes(&mut bytes).unwrap();
        assert_eq!(DiskInode::parse_from_bytes(&bytes).unwrap(), inode);
    }

    #[test]
    fn record_layout_is_little_endian_with_offset_pointers() {
        let inode = sample_inode();
        let mut bytes = [0_u8; INODE_SIZE];
        inode.write_to_bytes(&mut bytes).unwrap();
        assert_eq!(&bytes[0..4], &70_u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &4160_u32.to_le_bytes());
        assert_eq!(&bytes[8..10], &1000_u16.to_le_bytes());
        assert_eq!(&bytes[10..12], &0o755_u16.to_le_bytes());
        assert_eq!(bytes[12], DIRECTORY_FLAG);
        assert_eq!(bytes[13], 3);
        assert_eq!(&bytes[14..16], &[0, 0]);
        let ptr0 = u32::try_from(9 * BLOCK_SIZE).unwrap();
        assert_eq!(&bytes[16..20], &ptr0.to_le_bytes());
        // Unmapped pointer stays zero.
        assert_eq!(&bytes[24..28], &[0, 0, 0, 0]);
    }

    #[test]
    fn short_record_is_rejected() {
        let err = DiskInode::parse_from_bytes(&[0_u8; 10]).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }

    #[test]
    fn set_block_out_of_range_fails() {
        let mut inode = DiskInode::new(InodeNumber(1));
        assert!(inode.set_block(INODE_PTR_COUNT, BlockNumber(8)).is_err());
        assert_eq!(inode.block(INODE_PTR_COUNT), None);
    }

    #[test]
    fn table_io_round_trip_keeps_neighbours() {
        let dev = test_dev();
        let mut a = sample_inode();
        a.number = InodeNumber(64);
        let mut b = DiskInode::new(InodeNumber(65));
        b.size = 32;
        write_inode(&dev, &a).unwrap();
        write_inode(&dev, &b).unwrap();

        assert_eq!(read_inode(&dev, InodeNumber(64)).unwrap(), a);
        assert_eq!(read_inode(&dev, InodeNumber(65)).unwrap(), b);
        // Inode 64 is the first record in the second table block.
        let raw = dev.read_block(BlockNumber(4)).unwrap();
        assert_eq!(&raw.as_slice()[0..4], &64_u32.to_le_bytes());
    }

    #[test]
    fn out_of_range_inode_is_not_found() {
        let dev = test_dev();
        let err = read_inode(&dev, InodeNumber(INODE_COUNT)).unwrap_err();
        assert!(matches!(err, SfsError::NotFound(_)));
        let err = write_inode(&dev, &DiskInode::new(InodeNumber(9999))).unwrap_err();
        assert!(matches!(err, SfsError::NotFound(_)));
    }

    #[test]
    fn unwritten_slot_reads_with_requested_number() {
        let dev = test_dev();
        let inode = read_inode(&dev, InodeNumber(5)).unwrap();
        assert_eq!(inode.number, InodeNumber(5));
        assert_eq!(inode.size, 0);
    }

    #[test]
    fn acquire_counts_references() {
        let dev = test_dev();
        let cache = InodeCache::new(4);
        let first = cache.acquire(&dev, InodeNumber(3)).unwrap();
        assert_eq!(first.ref_count(), 1);
        let second = cache.acquire(&dev, InodeNumber(3)).unwrap();
        assert_eq!(second.ref_count(), 2);
        assert_eq!(first.slot(), second.slot());

        drop(second);
        assert_eq!(first.ref_count(), 1);
        first.release();
        assert_eq!(cache.ref_count_of(InodeNumber(3)), Some(0));
        assert_eq!(cache.free_slot_count(), 4);
    }

    #[test]
    fn released_inode_is_served_from_cache() {
        let dev = test_dev();
        let cache = InodeCache::new(2);
        let handle = cache.acquire(&dev, InodeNumber(7)).unwrap();
        handle.update(|inode| inode.size = 96);
        handle.release();

        // Overwrite the on-disk record behind the cache's back.
        let mut on_disk = DiskInode::new(InodeNumber(7));
        on_disk.size = 1;
        write_inode(&dev, &on_disk).unwrap();

        let again = cache.acquire(&dev, InodeNumber(7)).unwrap();
        assert_eq!(again.size(), 96, "resident copy must be reused");
        assert_eq!(again.ref_count(), 1);
        assert_eq!(cache.resident_count(), 1);
    }

    #[test]
    fn full_cache_is_not_found() {
        let dev = test_dev();
        let cache = InodeCache::new(2);
        let _a = cache.acquire(&dev, InodeNumber(1)).unwrap();
        let _b = cache.acquire(&dev, InodeNumber(2)).unwrap();
        assert_eq!(cache.find_free_slot(), None);

        let err = cache.acquire(&dev, InodeNumber(3)).unwrap_err();
        assert!(matches!(err, SfsError::NotFound(_)));
        // A resident number is still reachable.
        assert_eq!(cache.acquire(&dev, InodeNumber(1)).unwrap().ref_count(), 2);
    }

    #[test]
    fn fresh_cache_never_aliases_inode_zero() {
        let dev = test_dev();
        let cache = InodeCache::new(3);
        assert_eq!(cache.resident_count(), 0);
        let root = cache.acquire(&dev, InodeNumber::ROOT).unwrap();
        assert_eq!(root.ref_count(), 1);
        assert_eq!(cache.resident_count(), 1);
    }

    #[test]
    fn allocate_claims_lowest_number_without_writing() {
        let dev = test_dev();
        let cache = InodeCache::new(4);
        let handle = cache.allocate(&dev).unwrap();
        assert_eq!(handle.number(), InodeNumber(0));
        assert_eq!(handle.ref_count(), 1);
        assert_eq!(handle.get(), DiskInode::new(InodeNumber(0)));
        assert!(BitmapAllocator::inode_map().is_allocated(&dev, 0).unwrap());

        let next = cache.allocate(&dev).unwrap();
        assert_eq!(next.number(), InodeNumber(1));
        // Table block untouched.
        assert_eq!(dev.read_block(BlockNumber(3)).unwrap().as_slice(), &[0_u8; BLOCK_SIZE]);
    }

    #[test]
    fn allocate_with_full_cache_leaves_bitmap_unchanged() {
        let dev = test_dev();
        let cache = InodeCache::new(1);
        let _held = cache.acquire(&dev, InodeNumber(10)).unwrap();
        let err = cache.allocate(&dev).unwrap_err();
        assert!(matches!(err, SfsError::NotFound(_)));
        assert_eq!(
            BitmapAllocator::inode_map().count_free(&dev).unwrap(),
            INODE_COUNT
        );
    }

    #[test]
    fn allocate_reuses_slot_holding_same_number() {
        let dev = test_dev();
        let cache = InodeCache::new(3);
        // Make inode 0 resident with stale content, then free slots before it.
        let stale = cache.acquire(&dev, InodeNumber(50)).unwrap();
        let zero = cache.acquire(&dev, InodeNumber(0)).unwrap();
        zero.update(|inode| inode.size = 999);
        drop(stale);
        drop(zero);

        let fresh = cache.allocate(&dev).unwrap();
        assert_eq!(fresh.number(), InodeNumber(0));
        assert_eq!(fresh.size(), 0);
        assert_eq!(fresh.slot(), SlotId(1));
        assert_eq!(cache.ref_count_of(InodeNumber(0)), Some(1));
    }

    #[test]
    fn allocate_over_referenced_number_releases_the_bit() {
        let dev = test_dev();
        let cache = InodeCache::new(4);
        // Inode 0 is free in the bitmap but held in the cache.
        let held = cache.acquire(&dev, InodeNumber(0)).unwrap();
        let err = cache.allocate(&dev).unwrap_err();
        assert!(matches!(err, SfsError::Corruption { .. }), "{err:?}");
        assert!(!BitmapAllocator::inode_map().is_allocated(&dev, 0).unwrap());
        assert_eq!(held.ref_count(), 1);

        drop(held);
        assert_eq!(cache.allocate(&dev).unwrap().number(), InodeNumber(0));
    }

    #[test]
    fn purge_keeps_referenced_records() {
        let dev = test_dev();
        let cache = InodeCache::new(3);
        let held = cache.acquire(&dev, InodeNumber(1)).unwrap();
        cache.acquire(&dev, InodeNumber(2)).unwrap().release();
        assert_eq!(cache.resident_count(), 2);

        cache.purge();
        assert_eq!(cache.resident_count(), 1);
        assert_eq!(cache.ref_count_of(InodeNumber(2)), None);
        assert_eq!(held.ref_count(), 1);
    }

    #[test]
    fn persist_writes_in_core_record() {
        let dev = test_dev();
        let cache = InodeCache::new(2);
        let handle = cache.acquire(&dev, InodeNumber(2)).unwrap();
        handle.update(|inode| {
            inode.flags = DIRECTORY_FLAG;
            inode.link_count = 2;
        });
        assert!(handle.is_dir());
        handle.persist(&dev).unwrap();
        let on_disk = read_inode(&dev, InodeNumber(2)).unwrap();
        assert!(on_disk.is_dir());
        assert_eq!(on_disk.link_count, 2);
    }
}
