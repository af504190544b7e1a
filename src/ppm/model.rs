//! PPMd variant H context model.
//!
//! Based on Dmitry Shkarin's PPMd implementation.
//!
//! Contexts and states live inside the [`SubAllocator`] heap and are
//! addressed by `u32` offsets. Layouts (little-endian):
//!
//! ```text
//! Context (12 bytes)                 State (6 bytes)
//! +0  NumStats  u16                  +0 Symbol     u8
//! +2  SummFreq  u16  | OneState      +1 Freq       u8
//! +4  Stats     u32  | (6 bytes)     +2 Successor  u32
//! +8  Suffix    u32
//! ```
//!
//! A context with a single symbol stores it inline as `OneState`,
//! overlaying `SummFreq` and `Stats`.

use super::byte_reader::ByteReader;
use super::range_coder::{RangeCoder, SubRange};
use super::sub_alloc::SubAllocator;
use crate::error::{PpmError, Result};

#[cfg(test)]
mod reference_encoder;
#[cfg(test)]
pub(crate) use reference_encoder::ReferenceEncoder;

/// PPMd constants.
const INT_BITS: u32 = 7;
const PERIOD_BITS: u32 = 7;
const TOT_BITS: u32 = INT_BITS + PERIOD_BITS;
const INTERVAL: u32 = 1 << INT_BITS;
const BIN_SCALE: u32 = 1 << TOT_BITS;
const MAX_FREQ: u32 = 124;
/// Deepest supported model order.
pub const MAX_O: usize = 64;
const STATE_SIZE: usize = 6;

static INIT_BIN_ESC: [u16; 8] = [
    0x3CDD, 0x1F3F, 0x59BF, 0x48F3, 0x64A1, 0x5ABC, 0x6632, 0x6051,
];

static EXP_ESCAPE: [u8; 16] = [25, 14, 9, 7, 5, 5, 4, 4, 4, 3, 3, 3, 2, 2, 2, 2];

/// PPMd state (symbol + frequency + successor).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct State {
    pub symbol: u8,
    pub freq: u8,
    pub successor: u32,
}

/// SEE2 context for escape estimation.
#[derive(Debug, Clone, Copy)]
struct See2Context {
    summ: u16,
    shift: u8,
    count: u8,
}

impl See2Context {
    fn new(init_val: u16) -> Self {
        let shift = (PERIOD_BITS - 4) as u8;
        Self {
            summ: init_val << shift,
            shift,
            count: 4,
        }
    }

    fn get_mean(&mut self) -> u32 {
        let ret = u32::from(self.summ >> self.shift);
        self.summ = self.summ.wrapping_sub(ret as u16);
        ret + u32::from(ret == 0)
    }

    fn update(&mut self) {
        if u32::from(self.shift) < PERIOD_BITS {
            self.count = self.count.wrapping_sub(1);
            if self.count == 0 {
                self.summ = self.summ.wrapping_add(self.summ);
                self.count = (3u32 << self.shift) as u8;
                self.shift += 1;
            }
        }
    }
}

/// Which SEE2 counter produced an escape estimate.
#[derive(Debug, Clone, Copy)]
enum SeeRef {
    /// The 256-symbol root uses a fixed escape frequency of 1.
    Dummy,
    Table(usize, usize),
}

/// PPMd model.
pub struct PpmModel {
    /// Sub-allocator for contexts.
    sub_alloc: SubAllocator,
    /// Current (lowest reached) context.
    min_context: u32,
    /// Highest-order context of the current position.
    max_context: u32,
    /// State of the last decoded symbol, 0 after an escape.
    found_state: u32,
    /// Number of masked symbols.
    num_masked: usize,
    /// Escape estimate seeded by the last binary-context miss.
    init_esc: u32,
    /// Orders stepped down since the last match.
    order_fall: i32,
    /// Maximum order.
    max_order: i32,
    /// Run length.
    run_length: i32,
    /// Initial run length.
    init_rl: i32,
    /// Symbol exclusion mask, compared against `esc_count`.
    char_mask: [u8; 256],
    /// NS2 index mapping.
    ns2_indx: [u8; 256],
    /// NS2 BS index mapping.
    ns2_bs_indx: [u8; 256],
    /// HB2 flag.
    hb2_flag: [u8; 256],
    /// Escape count.
    esc_count: u8,
    /// Previous success.
    prev_success: u8,
    /// High bits flag.
    hi_bits_flag: u8,
    /// Binary SEE contexts.
    bin_summ: [[u16; 64]; 128],
    /// SEE2 contexts.
    see2_cont: [[See2Context; 16]; 25],
    /// Dummy SEE2 context.
    dummy_see2: See2Context,
    /// Model restarts caused by memory exhaustion.
    restarts: usize,
}

impl PpmModel {
    /// Create a new PPM model without an allocated arena.
    pub fn new() -> Self {
        let mut model = Self {
            sub_alloc: SubAllocator::new(),
            min_context: 0,
            max_context: 0,
            found_state: 0,
            num_masked: 0,
            init_esc: 0,
            order_fall: 0,
            max_order: 0,
            run_length: 0,
            init_rl: 0,
            char_mask: [0; 256],
            ns2_indx: [0; 256],
            ns2_bs_indx: [0; 256],
            hb2_flag: [0; 256],
            esc_count: 0,
            prev_success: 0,
            hi_bits_flag: 0,
            bin_summ: [[0; 64]; 128],
            see2_cont: [[See2Context::new(0); 16]; 25],
            dummy_see2: See2Context {
                summ: 0,
                shift: PERIOD_BITS as u8,
                count: 0,
            },
            restarts: 0,
        };
        model.init_tables();
        model
    }

    fn init_tables(&mut self) {
        self.ns2_bs_indx[0] = 0;
        self.ns2_bs_indx[1] = 2;
        self.ns2_bs_indx[2..11].fill(4);
        self.ns2_bs_indx[11..].fill(6);

        for i in 0..3 {
            self.ns2_indx[i] = i as u8;
        }
        let mut m = 3u8;
        let mut k = 1u32;
        let mut step = 1u32;
        for i in 3..256 {
            self.ns2_indx[i] = m;
            k -= 1;
            if k == 0 {
                step += 1;
                k = step;
                m += 1;
            }
        }

        self.hb2_flag[..0x40].fill(0);
        self.hb2_flag[0x40..].fill(0x08);
    }

    /// Parse a model header and prime a range decoder.
    ///
    /// Header byte: `0x20` resets the model, `0x40` announces an escape
    /// character byte, the low five bits hold the order. A resetting header
    /// is followed by the arena size in MiB minus one.
    pub fn decode_init(&mut self, reader: &mut ByteReader, esc_char: &mut u8) -> Result<RangeCoder> {
        let header = reader.read_byte().ok_or(PpmError::UnexpectedEof)?;
        let reset = header & 0x20 != 0;

        let max_mb = if reset {
            reader.read_byte().ok_or(PpmError::UnexpectedEof)?
        } else {
            if self.sub_alloc.allocated_size() == 0 {
                return Err(PpmError::ModelNotInitialized);
            }
            0
        };

        if header & 0x40 != 0 {
            *esc_char = reader.read_byte().ok_or(PpmError::UnexpectedEof)?;
        }

        let coder = RangeCoder::new(reader);

        if reset {
            let mut max_order = i32::from(header & 0x1F) + 1;
            if max_order > 16 {
                max_order = 16 + (max_order - 16) * 3;
            }
            if max_order == 1 {
                self.sub_alloc.stop();
                self.min_context = 0;
                self.max_context = 0;
                return Err(PpmError::InvalidOrder);
            }

            ldebug!(
                "PPMd init: order={} memory={}MiB esc={}",
                max_order,
                max_mb as usize + 1,
                *esc_char
            );
            self.sub_alloc.start(max_mb as usize + 1);
            self.start_model(max_order);
        }

        if self.min_context == 0 {
            return Err(PpmError::AllocationFailed);
        }

        Ok(coder)
    }

    /// Reinitialize with the smallest usable model (1 MiB, order 2).
    pub fn clean_up(&mut self) {
        self.sub_alloc.stop();
        self.sub_alloc.start(1);
        self.start_model(2);
    }

    /// Model order in effect.
    pub fn max_order(&self) -> i32 {
        self.max_order
    }

    /// Arena size in bytes, 0 when no arena is allocated.
    pub fn allocated_size(&self) -> usize {
        self.sub_alloc.allocated_size()
    }

    /// Number of times the model restarted because the arena was full.
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Start/restart the model.
    fn start_model(&mut self, max_order: i32) {
        self.esc_count = 1;
        self.max_order = max_order;
        self.restart_model();
        self.dummy_see2.shift = PERIOD_BITS as u8;
    }

    /// Discard all statistics and rebuild the root context.
    fn restart_model(&mut self) {
        self.char_mask = [0; 256];
        self.sub_alloc.init();

        self.init_rl = -self.max_order.min(12) - 1;

        let ctx = self.sub_alloc.alloc_context();
        self.min_context = ctx;
        self.max_context = ctx;
        if ctx == 0 {
            return;
        }
        let ctx = ctx as usize;
        self.write_context_suffix(ctx, 0);
        self.order_fall = self.max_order;
        self.write_context_num_stats(ctx, 256);
        self.write_context_summ_freq(ctx, 257);

        let stats = self.sub_alloc.alloc_units(256 / 2);
        self.found_state = stats;
        if stats == 0 {
            self.min_context = 0;
            self.max_context = 0;
            return;
        }
        self.write_context_stats(ctx, stats);
        for i in 0..256 {
            self.write_state(
                stats as usize + i * STATE_SIZE,
                State {
                    symbol: i as u8,
                    freq: 1,
                    successor: 0,
                },
            );
        }

        self.run_length = self.init_rl;
        self.prev_success = 0;

        for i in 0..128 {
            for k in 0..8 {
                let val = (BIN_SCALE - u32::from(INIT_BIN_ESC[k]) / (i as u32 + 2)) as u16;
                for m in (0..64).step_by(8) {
                    self.bin_summ[i][k + m] = val;
                }
            }
        }

        for i in 0..25 {
            for k in 0..16 {
                self.see2_cont[i][k] = See2Context::new((5 * i + 10) as u16);
            }
        }
    }

    fn restart_after_exhaustion(&mut self) {
        lwarn!(
            "PPMd arena of {} bytes exhausted, restarting model",
            self.sub_alloc.allocated_size()
        );
        self.restarts += 1;
        self.restart_model();
        self.esc_count = 0;
    }

    /// Reject references outside the live part of the arena.
    #[inline]
    fn check_ref(&self, offset: u32) -> Result<()> {
        let offset_usize = offset as usize;
        if offset_usize <= self.sub_alloc.text_ptr() || offset_usize > self.sub_alloc.heap_end() {
            return Err(PpmError::InvalidContext { offset });
        }
        Ok(())
    }

    /// Decode a character.
    pub fn decode_char(&mut self, coder: &mut RangeCoder, reader: &mut ByteReader) -> Result<u8> {
        self.check_ref(self.min_context)?;

        let ctx = self.min_context as usize;
        if self.read_context_num_stats(ctx) != 1 {
            self.check_ref(self.read_context_stats(ctx))?;
            self.decode_symbol1(coder)?;
        } else {
            self.decode_bin_symbol(coder)?;
        }

        while self.found_state == 0 {
            coder.normalize(reader);
            self.step_to_unmasked_suffix()?;
            self.decode_symbol2(coder)?;
        }

        let symbol = self.finish_symbol();
        coder.normalize(reader);
        Ok(symbol)
    }

    /// Follow suffix links until a context with unmasked symbols appears.
    fn step_to_unmasked_suffix(&mut self) -> Result<()> {
        loop {
            self.order_fall += 1;
            let suffix = self.read_context_suffix(self.min_context as usize);
            if suffix == 0 {
                return Err(PpmError::EscapeExhausted);
            }
            self.check_ref(suffix)?;
            self.min_context = suffix;
            if self.read_context_num_stats(suffix as usize) as usize != self.num_masked {
                return Ok(());
            }
        }
    }

    /// Descend or update the model after a symbol was found.
    fn finish_symbol(&mut self) -> u8 {
        let fs = self.read_state(self.found_state as usize);
        if self.order_fall == 0 && fs.successor as usize > self.sub_alloc.text_ptr() {
            self.min_context = fs.successor;
            self.max_context = fs.successor;
        } else {
            self.update_model();
            if self.esc_count == 0 {
                self.clear_mask();
            }
        }
        fs.symbol
    }

    /// Decode from a multi-symbol context.
    fn decode_symbol1(&mut self, coder: &mut RangeCoder) -> Result<()> {
        let ctx = self.min_context as usize;
        let scale = u32::from(self.read_context_summ_freq(ctx));
        let stats = self.read_context_stats(ctx) as usize;
        let num_stats = self.read_context_num_stats(ctx) as usize;

        let count = coder.get_current_count(scale)?;
        if count >= scale {
            return Err(PpmError::CountOutOfRange { count, scale });
        }

        let mut hi_cnt = u32::from(self.read_state_freq(stats));
        if count < hi_cnt {
            coder.decode(&SubRange {
                low_count: 0,
                high_count: hi_cnt,
                scale,
            });
            self.first_symbol_hit(scale);
            return Ok(());
        }
        if self.found_state == 0 {
            return Err(PpmError::InvalidContext { offset: ctx as u32 });
        }

        let mut p = stats;
        for _ in 1..num_stats {
            p += STATE_SIZE;
            let freq = u32::from(self.read_state_freq(p));
            hi_cnt += freq;
            if hi_cnt > count {
                coder.decode(&SubRange {
                    low_count: hi_cnt - freq,
                    high_count: hi_cnt,
                    scale,
                });
                self.later_symbol_hit(p);
                return Ok(());
            }
        }

        coder.decode(&SubRange {
            low_count: hi_cnt,
            high_count: scale,
            scale,
        });
        self.symbol1_escape();
        Ok(())
    }

    /// The first (most probable) state of the context matched.
    fn first_symbol_hit(&mut self, scale: u32) {
        let ctx = self.min_context as usize;
        let stats = self.read_context_stats(ctx) as usize;
        let freq = u32::from(self.read_state_freq(stats));

        self.prev_success = u8::from(2 * freq > scale);
        self.run_length += i32::from(self.prev_success);

        let hi_cnt = freq + 4;
        self.write_state_freq(stats, hi_cnt as u8);
        let summ = self.read_context_summ_freq(ctx);
        self.write_context_summ_freq(ctx, summ.wrapping_add(4));
        self.found_state = stats as u32;
        if hi_cnt > MAX_FREQ {
            self.rescale();
        }
    }

    /// A state other than the first matched.
    fn later_symbol_hit(&mut self, p: usize) {
        self.prev_success = 0;
        self.update1(p);
    }

    fn update1(&mut self, p: usize) {
        let ctx = self.min_context as usize;
        self.found_state = p as u32;
        let freq = self.read_state_freq(p).wrapping_add(4);
        self.write_state_freq(p, freq);
        let summ = self.read_context_summ_freq(ctx);
        self.write_context_summ_freq(ctx, summ.wrapping_add(4));

        if freq > self.read_state_freq(p - STATE_SIZE) {
            self.swap_states(p, p - STATE_SIZE);
            self.found_state = (p - STATE_SIZE) as u32;
            if u32::from(freq) > MAX_FREQ {
                self.rescale();
            }
        }
    }

    /// No state of a multi-symbol context matched: mask them all.
    fn symbol1_escape(&mut self) {
        let ctx = self.min_context as usize;
        let stats = self.read_context_stats(ctx) as usize;
        let num_stats = self.read_context_num_stats(ctx) as usize;

        self.hi_bits_flag = self.hb2_flag[self.read_state_symbol(self.found_state as usize) as usize];
        for i in 0..num_stats {
            let sym = self.read_state_symbol(stats + i * STATE_SIZE);
            self.char_mask[sym as usize] = self.esc_count;
        }
        self.num_masked = num_stats;
        self.found_state = 0;
        self.prev_success = 0;
    }

    /// Select the BinSumm cell for the current binary context.
    fn bin_summ_index(&mut self) -> (usize, usize) {
        let ctx = self.min_context as usize;
        let rs = self.read_state(ctx + 2);

        self.hi_bits_flag = self.hb2_flag[self.read_state_symbol(self.found_state as usize) as usize];

        let suffix = self.read_context_suffix(ctx) as usize;
        let suffix_ns = self.read_context_num_stats(suffix).max(1) as usize;
        let col = self.prev_success as usize
            + self.ns2_bs_indx[(suffix_ns - 1).min(255)] as usize
            + self.hi_bits_flag as usize
            + 2 * self.hb2_flag[rs.symbol as usize] as usize
            + ((self.run_length >> 26) & 0x20) as usize;
        let row = (rs.freq as usize).saturating_sub(1).min(127);
        (row, col)
    }

    /// Decode from a binary context.
    fn decode_bin_symbol(&mut self, coder: &mut RangeCoder) -> Result<()> {
        let (row, col) = self.bin_summ_index();
        let bs = u32::from(self.bin_summ[row][col]);

        if coder.get_current_shift_count(TOT_BITS)? < bs {
            coder.decode(&SubRange {
                low_count: 0,
                high_count: bs,
                scale: BIN_SCALE,
            });
            self.bin_symbol_hit(row, col);
        } else {
            coder.decode(&SubRange {
                low_count: bs,
                high_count: BIN_SCALE,
                scale: BIN_SCALE,
            });
            self.bin_symbol_miss(row, col);
        }
        Ok(())
    }

    /// GET_MEAN(bs, PERIOD_BITS, 2)
    #[inline]
    fn bin_mean(bs: u16) -> u16 {
        ((u32::from(bs) + (1 << (PERIOD_BITS - 2))) >> PERIOD_BITS) as u16
    }

    fn bin_symbol_hit(&mut self, row: usize, col: usize) {
        let one_state = self.min_context as usize + 2;
        let freq = self.read_state_freq(one_state);
        if freq < 128 {
            self.write_state_freq(one_state, freq + 1);
        }

        let bs = self.bin_summ[row][col];
        self.bin_summ[row][col] = bs
            .wrapping_add(INTERVAL as u16)
            .wrapping_sub(Self::bin_mean(bs));

        self.found_state = one_state as u32;
        self.prev_success = 1;
        self.run_length += 1;
    }

    fn bin_symbol_miss(&mut self, row: usize, col: usize) {
        let symbol = self.read_state_symbol(self.min_context as usize + 2);

        let bs = self.bin_summ[row][col];
        let bs = bs.wrapping_sub(Self::bin_mean(bs));
        self.bin_summ[row][col] = bs;

        self.init_esc = u32::from(EXP_ESCAPE[((bs >> 10) as usize).min(15)]);
        self.num_masked = 1;
        self.char_mask[symbol as usize] = self.esc_count;
        self.prev_success = 0;
        self.found_state = 0;
    }

    /// Escape frequency for a context with `diff` unmasked symbols.
    fn make_esc_freq2(&mut self, diff: usize) -> (SeeRef, u32) {
        let ctx = self.min_context as usize;
        let num_stats = self.read_context_num_stats(ctx) as usize;
        if num_stats == 256 {
            return (SeeRef::Dummy, 1);
        }

        let suffix = self.read_context_suffix(ctx) as usize;
        let suffix_ns = self.read_context_num_stats(suffix) as i32;
        let summ = self.read_context_summ_freq(ctx) as usize;

        let row = self.ns2_indx[(diff - 1).min(255)] as usize;
        let col = usize::from((diff as i32) < suffix_ns - num_stats as i32)
            + 2 * usize::from(summ < 11 * num_stats)
            + 4 * usize::from(self.num_masked > diff)
            + self.hi_bits_flag as usize;
        let col = col.min(15);
        (SeeRef::Table(row, col), self.see2_cont[row][col].get_mean())
    }

    fn see_update(&mut self, see: SeeRef) {
        match see {
            SeeRef::Dummy => self.dummy_see2.update(),
            SeeRef::Table(row, col) => self.see2_cont[row][col].update(),
        }
    }

    fn see_add(&mut self, see: SeeRef, scale: u32) {
        let cell = match see {
            SeeRef::Dummy => &mut self.dummy_see2,
            SeeRef::Table(row, col) => &mut self.see2_cont[row][col],
        };
        cell.summ = cell.summ.wrapping_add(scale as u16);
    }

    /// Collect the unmasked states of the current context.
    ///
    /// Returns the number collected and their frequency total.
    fn unmasked_states(&self, diff: usize, ps: &mut [u32; 256]) -> Result<(usize, u32)> {
        let ctx = self.min_context as usize;
        let stats = self.read_context_stats(ctx) as usize;
        let num_stats = self.read_context_num_stats(ctx) as usize;

        let mut n = 0usize;
        let mut hi_cnt = 0u32;
        for i in 0..num_stats {
            if n == diff {
                break;
            }
            let p = stats + i * STATE_SIZE;
            let state = self.read_state(p);
            if self.char_mask[state.symbol as usize] != self.esc_count {
                hi_cnt += u32::from(state.freq);
                ps[n] = p as u32;
                n += 1;
            }
        }
        if n != diff {
            return Err(PpmError::InvalidContext { offset: ctx as u32 });
        }
        Ok((n, hi_cnt))
    }

    /// Decode from a context whose masked symbols are excluded.
    fn decode_symbol2(&mut self, coder: &mut RangeCoder) -> Result<()> {
        let ctx = self.min_context as usize;
        let num_stats = self.read_context_num_stats(ctx) as usize;
        let diff = num_stats
            .checked_sub(self.num_masked)
            .filter(|&d| d > 0)
            .ok_or(PpmError::InvalidContext { offset: ctx as u32 })?;
        self.check_ref(self.read_context_stats(ctx))?;

        let (see, esc_freq) = self.make_esc_freq2(diff);
        let mut ps = [0u32; 256];
        let (n, hi_cnt) = self.unmasked_states(diff, &mut ps)?;

        let scale = esc_freq + hi_cnt;
        let count = coder.get_current_count(scale)?;
        if count >= scale {
            return Err(PpmError::CountOutOfRange { count, scale });
        }

        if count < hi_cnt {
            let mut hi = 0u32;
            for &p in &ps[..n] {
                let freq = u32::from(self.read_state_freq(p as usize));
                hi += freq;
                if hi > count {
                    coder.decode(&SubRange {
                        low_count: hi - freq,
                        high_count: hi,
                        scale,
                    });
                    self.see_update(see);
                    self.update2(p as usize);
                    return Ok(());
                }
            }
        }

        coder.decode(&SubRange {
            low_count: hi_cnt,
            high_count: scale,
            scale,
        });
        self.symbol2_escape(&ps[..n], see, scale);
        Ok(())
    }

    fn update2(&mut self, p: usize) {
        let ctx = self.min_context as usize;
        self.found_state = p as u32;
        let freq = self.read_state_freq(p).wrapping_add(4);
        self.write_state_freq(p, freq);
        let summ = self.read_context_summ_freq(ctx);
        self.write_context_summ_freq(ctx, summ.wrapping_add(4));
        if u32::from(freq) > MAX_FREQ {
            self.rescale();
        }
        self.esc_count = self.esc_count.wrapping_add(1);
        self.run_length = self.init_rl;
    }

    fn symbol2_escape(&mut self, ps: &[u32], see: SeeRef, scale: u32) {
        for &p in ps {
            let sym = self.read_state_symbol(p as usize);
            self.char_mask[sym as usize] = self.esc_count;
        }
        self.see_add(see, scale);
        self.num_masked = self.read_context_num_stats(self.min_context as usize) as usize;
    }

    /// Clear the character mask.
    fn clear_mask(&mut self) {
        self.esc_count = 1;
        self.char_mask = [0; 256];
    }

    /// Halve the frequencies of the current context.
    fn rescale(&mut self) {
        let ctx = self.min_context as usize;
        let old_ns = self.read_context_num_stats(ctx) as usize;
        let mut stats = self.read_context_stats(ctx) as usize;

        // Move the found state to the front.
        let mut p = self.found_state as usize;
        while p > stats {
            self.swap_states(p, p - STATE_SIZE);
            p -= STATE_SIZE;
        }

        let first = self.read_state_freq(stats).wrapping_add(4);
        self.write_state_freq(stats, first);
        let summ = self.read_context_summ_freq(ctx).wrapping_add(4);

        let mut esc_freq = i32::from(summ) - i32::from(first);
        let adder = u32::from(self.order_fall != 0);

        let halved = ((u32::from(first) + adder) >> 1) as u8;
        self.write_state_freq(stats, halved);
        let mut new_summ = u32::from(halved);

        p = stats;
        for _ in 1..old_ns {
            p += STATE_SIZE;
            let freq = self.read_state_freq(p);
            esc_freq -= i32::from(freq);
            let halved = ((u32::from(freq) + adder) >> 1) as u8;
            self.write_state_freq(p, halved);
            new_summ += u32::from(halved);

            if halved > self.read_state_freq(p - STATE_SIZE) {
                let tmp = self.read_state(p);
                let mut p1 = p;
                loop {
                    let prev = self.read_state(p1 - STATE_SIZE);
                    self.write_state(p1, prev);
                    p1 -= STATE_SIZE;
                    if p1 == stats || tmp.freq <= self.read_state_freq(p1 - STATE_SIZE) {
                        break;
                    }
                }
                self.write_state(p1, tmp);
            }
        }

        // Zero-frequency states sort to the tail; drop them.
        if self.read_state_freq(p) == 0 {
            let mut zeros = 0usize;
            loop {
                zeros += 1;
                p -= STATE_SIZE;
                if self.read_state_freq(p) != 0 {
                    break;
                }
            }
            esc_freq += zeros as i32;
            let new_ns = old_ns - zeros;
            self.write_context_num_stats(ctx, new_ns as u16);

            if new_ns == 1 {
                let mut tmp = self.read_state(stats);
                loop {
                    tmp.freq -= tmp.freq >> 1;
                    esc_freq >>= 1;
                    if esc_freq <= 1 {
                        break;
                    }
                }
                self.sub_alloc.free_units(stats as u32, (old_ns + 1) >> 1);
                self.write_state(ctx + 2, tmp);
                self.found_state = (ctx + 2) as u32;
                return;
            }
        }

        esc_freq -= esc_freq >> 1;
        new_summ = new_summ.wrapping_add(esc_freq as u32);
        self.write_context_summ_freq(ctx, new_summ as u16);

        let n0 = (old_ns + 1) >> 1;
        let n1 = (self.read_context_num_stats(ctx) as usize + 1) >> 1;
        if n0 != n1 {
            stats = self.sub_alloc.shrink_units(stats as u32, n0, n1) as usize;
            self.write_context_stats(ctx, stats as u32);
        }
        self.found_state = stats as u32;
    }

    /// Locate the state for `symbol` in context `pc`.
    fn find_state(&self, pc: usize, symbol: u8) -> Option<usize> {
        let num_stats = self.read_context_num_stats(pc) as usize;
        if num_stats == 1 {
            return Some(pc + 2);
        }
        let stats = self.read_context_stats(pc) as usize;
        (0..num_stats)
            .map(|i| stats + i * STATE_SIZE)
            .find(|&p| self.read_state_symbol(p) == symbol)
    }

    /// Create a binary child context of `parent` reached through `p_stats`.
    /// Returns the new context, or 0 on failure.
    fn create_child(&mut self, parent: u32, p_stats: usize, first_state: State) -> u32 {
        let pc = self.sub_alloc.alloc_context();
        if pc != 0 {
            self.write_context_num_stats(pc as usize, 1);
            self.write_state(pc as usize + 2, first_state);
            self.write_context_suffix(pc as usize, parent);
            self.write_state_successor(p_stats, pc);
        }
        pc
    }

    /// Materialize the contexts that follow the found state.
    /// Returns the new context, or 0 on failure.
    fn create_successors(&mut self, skip: bool, p1: usize) -> u32 {
        let fs = self.read_state(self.found_state as usize);
        let up_branch = fs.successor;
        let mut pc = self.min_context;
        let mut ps = [0usize; MAX_O];
        let mut pps = 0usize;

        let mut walk = true;
        if !skip {
            ps[pps] = self.found_state as usize;
            pps += 1;
            if self.read_context_suffix(pc as usize) == 0 {
                walk = false;
            }
        }

        if walk {
            let mut entry = if p1 != 0 {
                pc = self.read_context_suffix(pc as usize);
                Some(p1)
            } else {
                None
            };
            loop {
                let p = match entry.take() {
                    Some(p) => p,
                    None => {
                        pc = self.read_context_suffix(pc as usize);
                        if pc == 0 {
                            return 0;
                        }
                        match self.find_state(pc as usize, fs.symbol) {
                            Some(p) => p,
                            None => return 0,
                        }
                    }
                };
                let successor = self.read_state_successor(p);
                if successor != up_branch {
                    pc = successor;
                    break;
                }
                if pps >= MAX_O {
                    return 0;
                }
                ps[pps] = p;
                pps += 1;
                if self.read_context_suffix(pc as usize) == 0 {
                    break;
                }
            }
        }

        if pps == 0 {
            return pc;
        }

        let up_symbol = self.sub_alloc.read_u8(up_branch as usize);
        let up_successor = up_branch + 1;
        let up_freq = if self.read_context_num_stats(pc as usize) != 1 {
            if pc as usize <= self.sub_alloc.text_ptr() {
                return 0;
            }
            let p = match self.find_state(pc as usize, up_symbol) {
                Some(p) => p,
                None => return 0,
            };
            let cf = u32::from(self.read_state_freq(p)).wrapping_sub(1);
            let s0 = u32::from(self.read_context_summ_freq(pc as usize))
                .wrapping_sub(u32::from(self.read_context_num_stats(pc as usize)))
                .wrapping_sub(cf);
            let (cf, s0) = (u64::from(cf), u64::from(s0));
            let extra = if 2 * cf <= s0 {
                u64::from(5 * cf > s0)
            } else {
                (2 * cf + 3 * s0 - 1) / (2 * s0).max(1)
            };
            (1 + extra).min(255) as u8
        } else {
            self.read_state_freq(pc as usize + 2)
        };

        let up_state = State {
            symbol: up_symbol,
            freq: up_freq,
            successor: up_successor,
        };
        while pps > 0 {
            pps -= 1;
            pc = self.create_child(pc, ps[pps], up_state);
            if pc == 0 {
                return 0;
            }
        }
        pc
    }

    /// Update the model after a symbol, restarting it when memory runs out.
    fn update_model(&mut self) {
        if self.try_update_model().is_none() {
            self.restart_after_exhaustion();
        }
    }

    fn try_update_model(&mut self) -> Option<()> {
        let fs = self.read_state(self.found_state as usize);

        // Bump the symbol in the suffix context.
        let mut p = 0usize;
        let suffix = self.read_context_suffix(self.min_context as usize) as usize;
        if u32::from(fs.freq) < MAX_FREQ / 4 && suffix != 0 {
            if self.read_context_num_stats(suffix) != 1 {
                p = self.read_context_stats(suffix) as usize;
                if self.read_state_symbol(p) != fs.symbol {
                    p = self.find_state(suffix, fs.symbol)?;
                    if self.read_state_freq(p) >= self.read_state_freq(p - STATE_SIZE) {
                        self.swap_states(p, p - STATE_SIZE);
                        p -= STATE_SIZE;
                    }
                }
                let freq = self.read_state_freq(p);
                if u32::from(freq) < MAX_FREQ - 9 {
                    self.write_state_freq(p, freq + 2);
                    let summ = self.read_context_summ_freq(suffix);
                    self.write_context_summ_freq(suffix, summ.wrapping_add(2));
                }
            } else {
                p = suffix + 2;
                let freq = self.read_state_freq(p);
                if freq < 32 {
                    self.write_state_freq(p, freq + 1);
                }
            }
        }

        if self.order_fall == 0 {
            let ctx = self.create_successors(true, p);
            if ctx == 0 {
                return None;
            }
            self.min_context = ctx;
            self.max_context = ctx;
            self.write_state_successor(self.found_state as usize, ctx);
            return Some(());
        }

        let text_left = self.sub_alloc.push_text(fs.symbol);
        let mut successor = self.sub_alloc.text_ptr() as u32;
        if !text_left {
            return None;
        }

        let fs_successor;
        if fs.successor != 0 {
            fs_successor = if fs.successor as usize <= self.sub_alloc.text_ptr() {
                match self.create_successors(false, p) {
                    0 => return None,
                    ctx => ctx,
                }
            } else {
                fs.successor
            };
            self.order_fall -= 1;
            if self.order_fall == 0 {
                successor = fs_successor;
                if self.max_context != self.min_context {
                    self.sub_alloc.retreat_text();
                }
            }
        } else {
            self.write_state_successor(self.found_state as usize, successor);
            fs_successor = self.min_context;
        }

        let min_ctx = self.min_context as usize;
        let ns = u32::from(self.read_context_num_stats(min_ctx));
        let s0 = u32::from(self.read_context_summ_freq(min_ctx))
            .wrapping_sub(ns)
            .wrapping_sub(u32::from(fs.freq).wrapping_sub(1));

        let mut pc = self.max_context as usize;
        while pc != min_ctx {
            if pc == 0 {
                return None;
            }
            let ns1 = u32::from(self.read_context_num_stats(pc));
            if ns1 != 1 {
                if ns1 & 1 == 0 {
                    let stats = self
                        .sub_alloc
                        .expand_units(self.read_context_stats(pc), (ns1 >> 1) as usize);
                    if stats == 0 {
                        return None;
                    }
                    self.write_context_stats(pc, stats);
                }
                let summ = u32::from(self.read_context_summ_freq(pc));
                let inc = u32::from(2 * ns1 < ns) + 2 * u32::from(4 * ns1 <= ns && summ <= 8 * ns1);
                self.write_context_summ_freq(pc, (summ + inc) as u16);
            } else {
                let stats = self.sub_alloc.alloc_units(1);
                if stats == 0 {
                    return None;
                }
                let mut one = self.read_state(pc + 2);
                one.freq = if u32::from(one.freq) < MAX_FREQ / 4 - 1 {
                    one.freq * 2
                } else {
                    (MAX_FREQ - 4) as u8
                };
                self.write_state(stats as usize, one);
                self.write_context_stats(pc, stats);
                let summ = u32::from(one.freq) + self.init_esc + u32::from(ns > 3);
                self.write_context_summ_freq(pc, summ as u16);
            }

            let summ = u32::from(self.read_context_summ_freq(pc));
            let cf = 2 * u32::from(fs.freq) * (summ + 6);
            let sf = s0.wrapping_add(summ);
            let freq = if cf < sf.wrapping_mul(6) {
                self.write_context_summ_freq(pc, (summ + 3) as u16);
                1 + u32::from(cf > sf) + u32::from(cf >= sf.wrapping_mul(4))
            } else {
                let freq = 4
                    + u32::from(cf >= sf.wrapping_mul(9))
                    + u32::from(cf >= sf.wrapping_mul(12))
                    + u32::from(cf >= sf.wrapping_mul(15));
                self.write_context_summ_freq(pc, (summ + freq) as u16);
                freq
            };

            let stats = self.read_context_stats(pc) as usize;
            self.write_state(
                stats + ns1 as usize * STATE_SIZE,
                State {
                    symbol: fs.symbol,
                    freq: freq as u8,
                    successor,
                },
            );
            self.write_context_num_stats(pc, (ns1 + 1) as u16);
            pc = self.read_context_suffix(pc) as usize;
        }

        self.max_context = fs_successor;
        self.min_context = fs_successor;
        Some(())
    }

    // Helper methods for reading/writing context and state structures

    #[inline]
    fn read_context_num_stats(&self, offset: usize) -> u16 {
        self.sub_alloc.read_u16(offset)
    }

    #[inline]
    fn write_context_num_stats(&mut self, offset: usize, val: u16) {
        self.sub_alloc.write_u16(offset, val);
    }

    #[inline]
    fn read_context_summ_freq(&self, offset: usize) -> u16 {
        self.sub_alloc.read_u16(offset + 2)
    }

    #[inline]
    fn write_context_summ_freq(&mut self, offset: usize, val: u16) {
        self.sub_alloc.write_u16(offset + 2, val);
    }

    #[inline]
    fn read_context_stats(&self, offset: usize) -> u32 {
        self.sub_alloc.read_u32(offset + 4)
    }

    #[inline]
    fn write_context_stats(&mut self, offset: usize, val: u32) {
        self.sub_alloc.write_u32(offset + 4, val);
    }

    #[inline]
    fn read_context_suffix(&self, offset: usize) -> u32 {
        self.sub_alloc.read_u32(offset + 8)
    }

    #[inline]
    fn write_context_suffix(&mut self, offset: usize, val: u32) {
        self.sub_alloc.write_u32(offset + 8, val);
    }

    #[inline]
    fn read_state_symbol(&self, offset: usize) -> u8 {
        self.sub_alloc.read_u8(offset)
    }

    #[inline]
    fn read_state_freq(&self, offset: usize) -> u8 {
        self.sub_alloc.read_u8(offset + 1)
    }

    #[inline]
    fn write_state_freq(&mut self, offset: usize, freq: u8) {
        self.sub_alloc.write_u8(offset + 1, freq);
    }

    #[inline]
    fn read_state_successor(&self, offset: usize) -> u32 {
        self.sub_alloc.read_u32(offset + 2)
    }

    #[inline]
    fn write_state_successor(&mut self, offset: usize, successor: u32) {
        self.sub_alloc.write_u32(offset + 2, successor);
    }

    fn read_state(&self, offset: usize) -> State {
        State {
            symbol: self.read_state_symbol(offset),
            freq: self.read_state_freq(offset),
            successor: self.read_state_successor(offset),
        }
    }

    fn write_state(&mut self, offset: usize, state: State) {
        self.sub_alloc.write_u8(offset, state.symbol);
        self.sub_alloc.write_u8(offset + 1, state.freq);
        self.sub_alloc.write_u32(offset + 2, state.successor);
    }

    fn swap_states(&mut self, a: usize, b: usize) {
        let sa = self.read_state(a);
        let sb = self.read_state(b);
        self.write_state(a, sb);
        self.write_state(b, sa);
    }
}

impl Default for PpmModel {
    fn default() -> Self {
        Self::new()
    }
}
