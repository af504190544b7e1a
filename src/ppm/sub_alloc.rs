//! Sub-allocator for PPMd model memory management.
//!
//! Based on Dmitry Shkarin's implementation. The whole model lives in one
//! byte buffer addressed by `u32` offsets; offset 0 is never handed out and
//! serves as the null reference.
//!
//! ```text
//! 0          text_ptr      units_start   lo_unit       hi_unit     heap_end
//! |  text ->    |   (free)      |  stats ->   |  (free)  |  <- contexts  | guard
//! ```
//!
//! Stats arrays are carved from `lo_unit` upward, contexts from `hi_unit`
//! downward. When both meet, free lists are consulted, then adjacent free
//! blocks are glued, and as a last resort the unused tail of the text area
//! is turned into units.

/// Number of unit size classes.
const N1: usize = 4;
const N2: usize = 4;
const N3: usize = 4;
const N4: usize = (128 + 3 - N1 - 2 * N2 - 3 * N3) / 4;
const N_INDEXES: usize = N1 + N2 + N3 + N4;

/// Unit size in bytes (12 bytes - size of a context).
pub const UNIT_SIZE: usize = 12;

/// Largest block handed out by `alloc_units`, in units.
pub const MAX_UNITS: usize = 128;

/// Free block stamp used while gluing.
const FREE_STAMP: u16 = 0xFFFF;

/// Sub-allocator for PPMd contexts.
pub struct SubAllocator {
    /// Heap memory (text area, units area, guard unit, glue list head).
    heap: Vec<u8>,
    /// Requested size in bytes, 0 when stopped.
    sub_allocator_size: usize,
    /// End of usable heap.
    heap_end: usize,
    /// Text area write position (grows up).
    text_ptr: usize,
    /// Start of units area.
    units_start: usize,
    /// Text area limit, tracked in fixed unit size.
    fake_units_start: usize,
    /// Low unit pointer (grows up).
    lo_unit: usize,
    /// High unit pointer (grows down).
    hi_unit: usize,
    /// Free lists for each size class.
    free_list: [u32; N_INDEXES],
    /// Index to number of units mapping.
    indx2units: [u8; N_INDEXES],
    /// Number of units (minus one) to index mapping.
    units2indx: [u8; MAX_UNITS],
    /// Countdown to the next glue pass.
    glue_count: u8,
}

impl SubAllocator {
    /// Create a stopped sub-allocator.
    pub fn new() -> Self {
        let mut sa = Self {
            heap: Vec::new(),
            sub_allocator_size: 0,
            heap_end: 0,
            text_ptr: 0,
            units_start: 0,
            fake_units_start: 0,
            lo_unit: 0,
            hi_unit: 0,
            free_list: [0; N_INDEXES],
            indx2units: [0; N_INDEXES],
            units2indx: [0; MAX_UNITS],
            glue_count: 0,
        };
        sa.init_tables();
        sa
    }

    /// Initialize the index/units mapping tables.
    fn init_tables(&mut self) {
        let mut i = 0usize;
        let mut k = 1usize;
        for _ in 0..N1 {
            self.indx2units[i] = k as u8;
            i += 1;
            k += 1;
        }
        k += 1;
        for _ in 0..N2 {
            self.indx2units[i] = k as u8;
            i += 1;
            k += 2;
        }
        k += 1;
        for _ in 0..N3 {
            self.indx2units[i] = k as u8;
            i += 1;
            k += 3;
        }
        k += 1;
        for _ in 0..N4 {
            self.indx2units[i] = k as u8;
            i += 1;
            k += 4;
        }

        let mut idx = 0usize;
        for units in 0..MAX_UNITS {
            if (self.indx2units[idx] as usize) < units + 1 {
                idx += 1;
            }
            self.units2indx[units] = idx as u8;
        }
    }

    /// Allocate the heap for `size_mb` megabytes.
    ///
    /// Keeps the existing buffer when the size is unchanged.
    pub fn start(&mut self, size_mb: usize) {
        self.start_bytes(size_mb << 20);
    }

    fn start_bytes(&mut self, size: usize) {
        if self.sub_allocator_size == size {
            return;
        }
        self.stop();
        // One extra unit past heap_end guards block merging, one more holds
        // the glue list head.
        let alloc_size = size / UNIT_SIZE * UNIT_SIZE + 2 * UNIT_SIZE;
        self.heap = vec![0u8; alloc_size + UNIT_SIZE];
        self.heap_end = alloc_size - UNIT_SIZE;
        self.sub_allocator_size = size;
    }

    /// Release the heap.
    pub fn stop(&mut self) {
        if self.sub_allocator_size != 0 {
            self.sub_allocator_size = 0;
            self.heap = Vec::new();
            self.heap_end = 0;
        }
    }

    /// Size of the allocated heap in bytes, 0 when stopped.
    pub fn allocated_size(&self) -> usize {
        self.sub_allocator_size
    }

    /// Initialize/reset the allocator, discarding every allocation.
    pub fn init(&mut self) {
        self.free_list = [0; N_INDEXES];
        self.glue_count = 0;
        self.text_ptr = 0;

        // 7/8 of the memory for units, the rest for text.
        let size2 = UNIT_SIZE * (self.sub_allocator_size / 8 / UNIT_SIZE * 7);
        let size1 = self.sub_allocator_size - size2;

        self.units_start = size1;
        self.lo_unit = size1;
        self.fake_units_start = size1;
        self.hi_unit = self.lo_unit + size2;
    }

    /// Get heap end offset.
    pub fn heap_end(&self) -> usize {
        self.heap_end
    }

    /// Get text pointer.
    pub fn text_ptr(&self) -> usize {
        self.text_ptr
    }

    /// Get units start.
    pub fn units_start(&self) -> usize {
        self.units_start
    }

    /// Append a byte to the text area.
    ///
    /// Returns `false` once the text area is exhausted.
    pub fn push_text(&mut self, byte: u8) -> bool {
        if self.text_ptr >= self.heap.len() {
            return false;
        }
        self.heap[self.text_ptr] = byte;
        self.text_ptr += 1;
        self.text_ptr < self.fake_units_start
    }

    /// Step the text pointer back by one byte.
    pub fn retreat_text(&mut self) {
        self.text_ptr = self.text_ptr.saturating_sub(1);
    }

    /// Number of units in size class `idx`.
    #[inline]
    pub fn units_of_class(&self, idx: usize) -> usize {
        self.indx2units[idx] as usize
    }

    /// Size class used for a block of `nu` units.
    #[inline]
    pub fn class_of(&self, nu: usize) -> usize {
        self.units2indx[nu - 1] as usize
    }

    /// Allocate a context (1 unit). Returns 0 on failure.
    pub fn alloc_context(&mut self) -> u32 {
        if self.hi_unit != self.lo_unit {
            self.hi_unit -= UNIT_SIZE;
            return self.hi_unit as u32;
        }
        if self.free_list[0] != 0 {
            return self.remove_node(0);
        }
        self.alloc_units_rare(0)
    }

    /// Allocate `nu` units (1..=128). Returns 0 on failure.
    pub fn alloc_units(&mut self, nu: usize) -> u32 {
        if nu == 0 || nu > MAX_UNITS {
            return 0;
        }
        let idx = self.class_of(nu);
        if self.free_list[idx] != 0 {
            return self.remove_node(idx);
        }

        let bytes_needed = self.units_of_class(idx) * UNIT_SIZE;
        if self.lo_unit + bytes_needed <= self.hi_unit {
            let ptr = self.lo_unit;
            self.lo_unit += bytes_needed;
            return ptr as u32;
        }

        self.alloc_units_rare(idx)
    }

    /// Grow a block of `old_nu` units by one unit.
    ///
    /// Returns the (possibly moved) block, or 0 on failure in which case the
    /// old block is left untouched.
    pub fn expand_units(&mut self, old_ptr: u32, old_nu: usize) -> u32 {
        let i0 = self.class_of(old_nu);
        let i1 = self.class_of(old_nu + 1);
        if i0 == i1 {
            return old_ptr;
        }

        let ptr = self.alloc_units(old_nu + 1);
        if ptr != 0 {
            self.copy_units(old_ptr, ptr, old_nu);
            self.insert_node(old_ptr, i0);
        }
        ptr
    }

    /// Shrink a block from `old_nu` to `new_nu` units.
    pub fn shrink_units(&mut self, old_ptr: u32, old_nu: usize, new_nu: usize) -> u32 {
        let i0 = self.class_of(old_nu);
        let i1 = self.class_of(new_nu);
        if i0 == i1 {
            return old_ptr;
        }

        if self.free_list[i1] != 0 {
            let ptr = self.remove_node(i1);
            self.copy_units(old_ptr, ptr, new_nu);
            self.insert_node(old_ptr, i0);
            ptr
        } else {
            self.split_block(old_ptr, i0, i1);
            old_ptr
        }
    }

    /// Free a block of `nu` units.
    pub fn free_units(&mut self, ptr: u32, nu: usize) {
        let idx = self.class_of(nu);
        self.insert_node(ptr, idx);
    }

    fn copy_units(&mut self, from: u32, to: u32, nu: usize) {
        let from = from as usize;
        self.heap
            .copy_within(from..from + nu * UNIT_SIZE, to as usize);
    }

    /// Allocate from the rare path: glue, larger classes, then text space.
    fn alloc_units_rare(&mut self, idx: usize) -> u32 {
        if self.glue_count == 0 {
            self.glue_count = 255;
            self.glue_free_blocks();
            if self.free_list[idx] != 0 {
                return self.remove_node(idx);
            }
        }

        let mut i = idx;
        loop {
            i += 1;
            if i == N_INDEXES {
                self.glue_count = self.glue_count.wrapping_sub(1);
                let size = self.units_of_class(idx) * UNIT_SIZE;
                if self.fake_units_start.saturating_sub(self.text_ptr) > size {
                    self.fake_units_start -= size;
                    self.units_start -= size;
                    ltrace!(
                        "sub-allocator: reclaimed {} bytes of text area, units start at {}",
                        size,
                        self.units_start
                    );
                    return self.units_start as u32;
                }
                return 0;
            }
            if self.free_list[i] != 0 {
                break;
            }
        }

        let ptr = self.remove_node(i);
        self.split_block(ptr, i, idx);
        ptr
    }

    /// Remove a node from free list.
    fn remove_node(&mut self, idx: usize) -> u32 {
        let ptr = self.free_list[idx];
        self.free_list[idx] = self.read_u32(ptr as usize);
        ptr
    }

    /// Insert a node into free list.
    fn insert_node(&mut self, ptr: u32, idx: usize) {
        let old_head = self.free_list[idx];
        self.write_u32(ptr as usize, old_head);
        self.free_list[idx] = ptr;
    }

    /// Return the tail of a block that is larger than needed.
    fn split_block(&mut self, ptr: u32, old_idx: usize, new_idx: usize) {
        let mut diff = self.units_of_class(old_idx) - self.units_of_class(new_idx);
        let mut p = ptr as usize + self.units_of_class(new_idx) * UNIT_SIZE;
        let mut i = self.class_of(diff);
        if self.units_of_class(i) != diff {
            i -= 1;
            self.insert_node(p as u32, i);
            p += self.units_of_class(i) * UNIT_SIZE;
            diff -= self.units_of_class(i);
        }
        let i = self.class_of(diff);
        self.insert_node(p as u32, i);
    }

    // Glue list blocks: stamp u16 @0, unit count u16 @2, next u32 @4, prev u32 @8.

    fn glue_head(&self) -> usize {
        self.heap_end + UNIT_SIZE
    }

    fn block_next(&self, p: usize) -> usize {
        self.read_u32(p + 4) as usize
    }

    fn block_prev(&self, p: usize) -> usize {
        self.read_u32(p + 8) as usize
    }

    fn block_units(&self, p: usize) -> usize {
        self.read_u16(p + 2) as usize
    }

    fn block_insert_after(&mut self, p: usize, at: usize) {
        let next = self.block_next(at);
        self.write_u32(p + 8, at as u32);
        self.write_u32(p + 4, next as u32);
        self.write_u32(at + 4, p as u32);
        self.write_u32(next + 8, p as u32);
    }

    fn block_remove(&mut self, p: usize) {
        let prev = self.block_prev(p);
        let next = self.block_next(p);
        self.write_u32(prev + 4, next as u32);
        self.write_u32(next + 8, prev as u32);
    }

    /// Merge physically adjacent free blocks and redistribute them.
    fn glue_free_blocks(&mut self) {
        let head = self.glue_head();
        self.write_u32(head + 4, head as u32);
        self.write_u32(head + 8, head as u32);

        if self.lo_unit != self.hi_unit {
            self.heap[self.lo_unit] = 0;
        }

        let mut glued = 0usize;
        for i in 0..N_INDEXES {
            while self.free_list[i] != 0 {
                let p = self.remove_node(i) as usize;
                self.block_insert_after(p, head);
                self.write_u16(p, FREE_STAMP);
                self.write_u16(p + 2, self.indx2units[i] as u16);
                glued += 1;
            }
        }

        let mut p = self.block_next(head);
        while p != head {
            loop {
                let nu = self.block_units(p);
                let p1 = p + nu * UNIT_SIZE;
                if self.read_u16(p1) != FREE_STAMP {
                    break;
                }
                let nu1 = self.block_units(p1);
                if nu + nu1 >= 0x10000 {
                    break;
                }
                self.block_remove(p1);
                self.write_u16(p + 2, (nu + nu1) as u16);
            }
            p = self.block_next(p);
        }

        loop {
            let mut p = self.block_next(head);
            if p == head {
                break;
            }
            self.block_remove(p);
            let mut sz = self.block_units(p);
            while sz > MAX_UNITS {
                self.insert_node(p as u32, N_INDEXES - 1);
                sz -= MAX_UNITS;
                p += MAX_UNITS * UNIT_SIZE;
            }
            let mut i = self.class_of(sz);
            if self.units_of_class(i) != sz {
                i -= 1;
                let k = sz - self.units_of_class(i);
                self.insert_node((p + (sz - k) * UNIT_SIZE) as u32, k - 1);
            }
            self.insert_node(p as u32, i);
        }

        ltrace!("sub-allocator: glued {} free blocks", glued);
    }

    /// Read a byte from heap.
    #[inline]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.heap[offset]
    }

    /// Write a byte to heap.
    #[inline]
    pub fn write_u8(&mut self, offset: usize, val: u8) {
        self.heap[offset] = val;
    }

    /// Read a little-endian u16 from heap.
    #[inline]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.heap[offset], self.heap[offset + 1]])
    }

    /// Write a little-endian u16 to heap.
    #[inline]
    pub fn write_u16(&mut self, offset: usize, val: u16) {
        self.heap[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
    }

    /// Read a little-endian u32 from heap.
    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.heap[offset],
            self.heap[offset + 1],
            self.heap[offset + 2],
            self.heap[offset + 3],
        ])
    }

    /// Write a little-endian u32 to heap.
    #[inline]
    pub fn write_u32(&mut self, offset: usize, val: u32) {
        self.heap[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    }
}

impl Default for SubAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn allocator(size: usize) -> SubAllocator {
        let mut sa = SubAllocator::new();
        sa.start_bytes(size);
        sa.init();
        sa
    }

    #[test]
    fn test_size_class_tables() {
        let sa = SubAllocator::new();
        assert_eq!(N_INDEXES, 38);
        assert_eq!(&sa.indx2units[..12], &[1, 2, 3, 4, 6, 8, 10, 12, 15, 18, 21, 24]);
        assert_eq!(sa.indx2units[12], 28);
        assert_eq!(sa.indx2units[N_INDEXES - 1], 128);
        for nu in 1..=MAX_UNITS {
            let idx = sa.class_of(nu);
            assert!(sa.units_of_class(idx) >= nu, "class too small for {}", nu);
            if idx > 0 {
                assert!(sa.units_of_class(idx - 1) < nu, "class not minimal for {}", nu);
            }
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut sa = SubAllocator::new();
        sa.start(1);
        sa.init();
        let p = sa.alloc_context();
        sa.write_u32(p as usize, 0xDEAD_BEEF);
        sa.start(1);
        assert_eq!(sa.read_u32(p as usize), 0xDEAD_BEEF);
        assert_eq!(sa.allocated_size(), 1 << 20);

        sa.stop();
        assert_eq!(sa.allocated_size(), 0);
    }

    #[test]
    fn test_layout_after_init() {
        let sa = allocator(1 << 20);
        let size2 = UNIT_SIZE * ((1 << 20) / 8 / UNIT_SIZE * 7);
        assert_eq!(sa.units_start(), (1 << 20) - size2);
        assert_eq!(sa.lo_unit, sa.units_start());
        assert_eq!(sa.hi_unit, 1 << 20);
        assert!(sa.hi_unit <= sa.heap_end());
        assert_eq!(sa.text_ptr(), 0);
    }

    #[test]
    fn test_contexts_from_top_units_from_bottom() {
        let mut sa = allocator(1 << 20);
        let c1 = sa.alloc_context() as usize;
        let c2 = sa.alloc_context() as usize;
        assert_eq!(c1, (1 << 20) - UNIT_SIZE);
        assert_eq!(c2, c1 - UNIT_SIZE);

        let u1 = sa.alloc_units(5) as usize;
        let u2 = sa.alloc_units(1) as usize;
        assert_eq!(u1, sa.units_start());
        // Five units round up to the six-unit class.
        assert_eq!(u2, u1 + 6 * UNIT_SIZE);
    }

    #[test]
    fn test_free_list_reuse() {
        let mut sa = allocator(1 << 20);
        let a = sa.alloc_units(3);
        let _b = sa.alloc_units(3);
        sa.free_units(a, 3);
        assert_eq!(sa.alloc_units(3), a);
        assert_ne!(sa.alloc_units(3), a);
    }

    #[test]
    fn test_expand_within_class_keeps_pointer() {
        let mut sa = allocator(1 << 20);
        let p = sa.alloc_units(5);
        // 5 and 6 units share a class.
        assert_eq!(sa.expand_units(p, 5), p);
    }

    #[test]
    fn test_expand_moves_and_copies() {
        let mut sa = allocator(1 << 20);
        let p = sa.alloc_units(4);
        for i in 0..4 * UNIT_SIZE {
            sa.write_u8(p as usize + i, i as u8);
        }
        let q = sa.expand_units(p, 4);
        assert_ne!(q, 0);
        assert_ne!(q, p);
        for i in 0..4 * UNIT_SIZE {
            assert_eq!(sa.read_u8(q as usize + i), i as u8);
        }
        // The old block went back to its free list.
        assert_eq!(sa.alloc_units(4), p);
    }

    #[test]
    fn test_shrink_splits_in_place() {
        let mut sa = allocator(1 << 20);
        let p = sa.alloc_units(8);
        let q = sa.shrink_units(p, 8, 2);
        assert_eq!(q, p);
        // The six-unit tail is now free.
        let tail = sa.alloc_units(6);
        assert_eq!(tail as usize, p as usize + 2 * UNIT_SIZE);
    }

    #[test]
    fn test_shrink_prefers_free_block() {
        let mut sa = allocator(1 << 20);
        let small = sa.alloc_units(1);
        let big = sa.alloc_units(4);
        sa.write_u8(big as usize, 0x5A);
        sa.free_units(small, 1);
        let moved = sa.shrink_units(big, 4, 1);
        assert_eq!(moved, small);
        assert_eq!(sa.read_u8(moved as usize), 0x5A);
    }

    #[test]
    fn test_glue_merges_adjacent_blocks() {
        let mut sa = allocator(1 << 20);
        // Exhaust the bump regions so the rare path runs.
        let mut blocks = Vec::new();
        loop {
            let p = sa.alloc_units(1);
            if p == 0 {
                break;
            }
            blocks.push(p);
        }
        // Free two physically adjacent single units.
        blocks.sort_unstable();
        let first = blocks[100];
        let second = blocks[101];
        assert_eq!(second as usize, first as usize + UNIT_SIZE);
        sa.free_units(first, 1);
        sa.free_units(second, 1);
        // Force a fresh glue pass.
        sa.glue_count = 0;
        assert_eq!(sa.alloc_units(2), first);
    }

    #[test]
    fn test_rare_path_reclaims_text_area() {
        let mut sa = allocator(1 << 20);
        while sa.hi_unit != sa.lo_unit {
            sa.alloc_context();
        }
        let before = sa.units_start();
        let p = sa.alloc_context();
        assert_eq!(p as usize, before - UNIT_SIZE);
        assert_eq!(sa.units_start(), before - UNIT_SIZE);
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let mut sa = allocator(64 * 1024);
        let mut count = 0;
        while sa.alloc_context() != 0 {
            count += 1;
            assert!(count < 10_000, "allocator never reported exhaustion");
        }
        assert_eq!(sa.alloc_units(128), 0);
    }

    #[test]
    fn test_text_area_fills_up() {
        let mut sa = allocator(64 * 1024);
        let limit = sa.units_start();
        let mut written = 0;
        while sa.push_text(b'x') {
            written += 1;
        }
        assert_eq!(written + 1, limit);
        sa.retreat_text();
        assert_eq!(sa.text_ptr(), limit - 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(usize),
        Context,
        Free(usize),
        Expand(usize),
        Shrink(usize, usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..=MAX_UNITS).prop_map(Op::Alloc),
            Just(Op::Context),
            any::<usize>().prop_map(Op::Free),
            any::<usize>().prop_map(Op::Expand),
            (any::<usize>(), 1usize..=MAX_UNITS).prop_map(|(i, n)| Op::Shrink(i, n)),
        ]
    }

    proptest! {
        #[test]
        fn prop_live_blocks_never_overlap(ops in prop::collection::vec(op_strategy(), 1..400)) {
            let mut sa = allocator(64 * 1024);
            // (offset, units) of live blocks.
            let mut live: Vec<(usize, usize)> = Vec::new();

            for op in ops {
                match op {
                    Op::Alloc(nu) => {
                        let p = sa.alloc_units(nu) as usize;
                        if p != 0 {
                            live.push((p, nu));
                        }
                    }
                    Op::Context => {
                        let p = sa.alloc_context() as usize;
                        if p != 0 {
                            live.push((p, 1));
                        }
                    }
                    Op::Free(i) if !live.is_empty() => {
                        let (p, nu) = live.swap_remove(i % live.len());
                        sa.free_units(p as u32, nu);
                    }
                    Op::Expand(i) if !live.is_empty() => {
                        let idx = i % live.len();
                        let (p, nu) = live[idx];
                        if nu < MAX_UNITS {
                            let q = sa.expand_units(p as u32, nu) as usize;
                            if q != 0 {
                                live[idx] = (q, nu + 1);
                            }
                        }
                    }
                    Op::Shrink(i, n) if !live.is_empty() => {
                        let idx = i % live.len();
                        let (p, nu) = live[idx];
                        let new_nu = 1 + n % nu;
                        let q = sa.shrink_units(p as u32, nu, new_nu) as usize;
                        prop_assert_ne!(q, 0);
                        live[idx] = (q, new_nu);
                    }
                    _ => {}
                }

                let mut spans: Vec<(usize, usize)> = live
                    .iter()
                    .map(|&(p, nu)| (p, p + nu * UNIT_SIZE))
                    .collect();
                spans.sort_unstable();
                for w in spans.windows(2) {
                    prop_assert!(w[0].1 <= w[1].0, "overlap: {:?} and {:?}", w[0], w[1]);
                }
                for &(start, end) in &spans {
                    prop_assert!(start >= sa.units_start());
                    prop_assert!(end <= sa.heap_end());
                }
            }
        }

        #[test]
        fn prop_freed_block_is_reused(nu in 1usize..=MAX_UNITS, other in 1usize..=MAX_UNITS) {
            let mut sa = allocator(256 * 1024);
            let p = sa.alloc_units(nu);
            let q = sa.alloc_units(other);
            prop_assert_ne!(p, 0);
            prop_assert_ne!(q, 0);
            sa.free_units(p, nu);
            // Any count from the same size class gets the freed block back.
            let same_class = sa.units_of_class(sa.class_of(nu));
            prop_assert_eq!(sa.alloc_units(same_class), p);
        }
    }
}
