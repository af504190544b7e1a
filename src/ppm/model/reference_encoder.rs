//! Encoder twin of the decoding paths, used to produce test payloads.
//!
//! Each `encode_*` step picks the sub-range for a known symbol and then runs
//! the same model update the decoder runs, so both sides stay in lockstep.

use super::{PpmModel, SeeRef, BIN_SCALE, PERIOD_BITS, STATE_SIZE, TOT_BITS};
use crate::ppm::range_coder::{RangeEncoder, SubRange};

impl PpmModel {
    fn encode_char(&mut self, enc: &mut RangeEncoder, symbol: u8) {
        if self.read_context_num_stats(self.min_context as usize) != 1 {
            self.encode_symbol1(enc, symbol);
        } else {
            self.encode_bin_symbol(enc, symbol);
        }

        while self.found_state == 0 {
            enc.normalize();
            self.step_to_unmasked_suffix()
                .expect("every symbol is present in the root context");
            self.encode_symbol2(enc, symbol);
        }

        self.finish_symbol();
        enc.normalize();
    }

    fn encode_bin_symbol(&mut self, enc: &mut RangeEncoder, symbol: u8) {
        let (row, col) = self.bin_summ_index();
        let bs = u32::from(self.bin_summ[row][col]);

        if self.read_state_symbol(self.min_context as usize + 2) == symbol {
            enc.encode_shift(
                &SubRange {
                    low_count: 0,
                    high_count: bs,
                    scale: BIN_SCALE,
                },
                TOT_BITS,
            );
            self.bin_symbol_hit(row, col);
        } else {
            enc.encode_shift(
                &SubRange {
                    low_count: bs,
                    high_count: BIN_SCALE,
                    scale: BIN_SCALE,
                },
                TOT_BITS,
            );
            self.bin_symbol_miss(row, col);
        }
    }

    fn encode_symbol1(&mut self, enc: &mut RangeEncoder, symbol: u8) {
        let ctx = self.min_context as usize;
        let scale = u32::from(self.read_context_summ_freq(ctx));
        let stats = self.read_context_stats(ctx) as usize;
        let num_stats = self.read_context_num_stats(ctx) as usize;

        let first = self.read_state(stats);
        if first.symbol == symbol {
            enc.encode(&SubRange {
                low_count: 0,
                high_count: u32::from(first.freq),
                scale,
            });
            self.first_symbol_hit(scale);
            return;
        }

        let mut low = u32::from(first.freq);
        for i in 1..num_stats {
            let p = stats + i * STATE_SIZE;
            let state = self.read_state(p);
            let freq = u32::from(state.freq);
            if state.symbol == symbol {
                enc.encode(&SubRange {
                    low_count: low,
                    high_count: low + freq,
                    scale,
                });
                self.later_symbol_hit(p);
                return;
            }
            low += freq;
        }

        enc.encode(&SubRange {
            low_count: low,
            high_count: scale,
            scale,
        });
        self.symbol1_escape();
    }

    fn encode_symbol2(&mut self, enc: &mut RangeEncoder, symbol: u8) {
        let num_stats = self.read_context_num_stats(self.min_context as usize) as usize;
        let diff = num_stats - self.num_masked;

        let (see, esc_freq): (SeeRef, u32) = self.make_esc_freq2(diff);
        let mut ps = [0u32; 256];
        let (n, hi_cnt) = self
            .unmasked_states(diff, &mut ps)
            .expect("masked count matches the context");
        let scale = esc_freq + hi_cnt;

        let mut low = 0u32;
        for &p in &ps[..n] {
            let state = self.read_state(p as usize);
            let freq = u32::from(state.freq);
            if state.symbol == symbol {
                enc.encode(&SubRange {
                    low_count: low,
                    high_count: low + freq,
                    scale,
                });
                self.see_update(see);
                self.update2(p as usize);
                return;
            }
            low += freq;
        }

        enc.encode(&SubRange {
            low_count: hi_cnt,
            high_count: scale,
            scale,
        });
        self.symbol2_escape(&ps[..n], see, scale);
    }

    /// Put every SEE2 cell at `summ` with a saturated period.
    pub(crate) fn set_see2_summ(&mut self, summ: u16) {
        for cell in self.see2_cont.iter_mut().flatten() {
            cell.summ = summ;
            cell.shift = PERIOD_BITS as u8;
        }
    }

    /// SEE2 sums, row by row.
    pub(crate) fn see2_sums(&self) -> Vec<u16> {
        self.see2_cont.iter().flatten().map(|cell| cell.summ).collect()
    }
}

/// Produces PPMd text-mode payloads that [`PpmModel::decode_char`] reads back.
///
/// The model persists across payloads, so a payload without a reset
/// continues the statistics of the previous one.
pub(crate) struct ReferenceEncoder {
    model: PpmModel,
}

impl ReferenceEncoder {
    pub(crate) fn new() -> Self {
        Self {
            model: PpmModel::new(),
        }
    }

    /// Encode `data` behind a model header.
    ///
    /// `reset` carries the raw five-bit order and the capacity byte (MiB - 1).
    pub(crate) fn payload(&mut self, reset: Option<(u8, u8)>, esc: Option<u8>, data: &[u8]) -> Vec<u8> {
        let mut header = 0u8;
        if let Some((raw_order, _)) = reset {
            header |= 0x20 | (raw_order & 0x1F);
        }
        if esc.is_some() {
            header |= 0x40;
        }

        let mut out = vec![header];
        if let Some((raw_order, mb)) = reset {
            out.push(mb);
            let mut order = i32::from(raw_order & 0x1F) + 1;
            if order > 16 {
                order = 16 + (order - 16) * 3;
            }
            assert!(order > 1, "order 1 is not encodable");
            self.model.sub_alloc.start(usize::from(mb) + 1);
            self.model.start_model(order);
        }
        if let Some(esc) = esc {
            out.push(esc);
        }

        let mut enc = RangeEncoder::new();
        for &byte in data {
            self.model.encode_char(&mut enc, byte);
        }
        out.extend(enc.finish());
        out
    }

    pub(crate) fn restarts(&self) -> usize {
        self.model.restarts()
    }

    pub(crate) fn model_mut(&mut self) -> &mut PpmModel {
        &mut self.model
    }
}
