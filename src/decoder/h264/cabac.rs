// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CABAC parsing of slice data (9.3): the arithmetic decoding engine, the
//! context models and the binarizations of every syntax element.

use anyhow::anyhow;

use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::parser::SliceType;
use crate::decoder::h264::cabac_tables::*;
use crate::decoder::h264::macroblock::MbArena;
use crate::decoder::h264::macroblock::MbInfo;
use crate::decoder::h264::macroblock::MbType;
use crate::decoder::h264::macroblock::SubMbType;
use crate::decoder::h264::slice::BlockKind;
use crate::decoder::h264::slice::EntropyDecoder;

pub(crate) const CTX_MB_TYPE_I: usize = 3;
const CTX_MB_SKIP_P: usize = 11;
const CTX_MB_TYPE_P: usize = 14;
const CTX_MB_TYPE_P_INTRA: usize = 17;
const CTX_SUB_MB_TYPE_P: usize = 21;
const CTX_MB_SKIP_B: usize = 24;
const CTX_MB_TYPE_B: usize = 27;
const CTX_MB_TYPE_B_INTRA: usize = 32;
const CTX_SUB_MB_TYPE_B: usize = 36;
const CTX_MVD: [usize; 2] = [40, 47];
const CTX_REF_IDX: usize = 54;
pub(crate) const CTX_QP_DELTA: usize = 60;
pub(crate) const CTX_CHROMA_PRED: usize = 64;
const CTX_PREV_INTRA_PRED: usize = 68;
const CTX_REM_INTRA_PRED: usize = 69;
const CTX_CBP_LUMA: usize = 73;
const CTX_CBP_CHROMA: usize = 77;
const CTX_CODED_BLOCK_FLAG: usize = 85;
const CTX_SIG: usize = 105;
const CTX_LAST: usize = 166;
const CTX_ABS_LEVEL: usize = 227;
const CTX_TRANSFORM_8X8: usize = 399;
const CTX_SIG_8X8: usize = 402;
const CTX_LAST_8X8: usize = 417;
const CTX_ABS_LEVEL_8X8: usize = 426;

/// ctxBlockCatOffset of coded_block_flag, by ctxBlockCat 0 to 4.
const CBF_CAT_OFFSET: [usize; 5] = [0, 4, 8, 12, 16];
/// ctxBlockCatOffset of the significance maps.
const SIG_CAT_OFFSET: [usize; 5] = [0, 15, 29, 44, 47];
/// ctxBlockCatOffset of coeff_abs_level_minus1.
const ABS_CAT_OFFSET: [usize; 5] = [0, 10, 20, 30, 39];

/// Bits of the arithmetic decoder that may be consumed past the end of the
/// slice data before the slice is deemed truncated.
const MAX_OVERRUN_BITS: u32 = 16;

/// Initial state of a context, stored as `(pStateIdx << 1) | valMPS`
/// (9.3.1.1).
fn init_state(m: i8, n: i8, slice_qp: i32) -> u8 {
    let pre = (((i32::from(m) * slice_qp.clamp(0, 51)) >> 4) + i32::from(n)).clamp(1, 126);
    if pre <= 63 {
        ((63 - pre) << 1) as u8
    } else {
        (((pre - 64) << 1) | 1) as u8
    }
}

/// Context states of a slice, initialized from its type, cabac_init_idc and
/// SliceQPY.
fn init_contexts(
    slice_type: SliceType,
    cabac_init_idc: u8,
    slice_qp: i32,
) -> anyhow::Result<[u8; NUM_CTX]> {
    let table = match (slice_type, cabac_init_idc) {
        (SliceType::I, _) => &CABAC_INIT_I,
        (_, 0) => &CABAC_INIT_PB_0,
        (_, 1) => &CABAC_INIT_PB_1,
        (_, 2) => &CABAC_INIT_PB_2,
        (_, idc) => return Err(anyhow!("invalid cabac_init_idc {}", idc)),
    };

    let mut states = [0u8; NUM_CTX];
    for (state, [m, n]) in states.iter_mut().zip(table.iter()) {
        *state = init_state(*m, *n, slice_qp);
    }

    Ok(states)
}

/// The arithmetic decoding engine (9.3.1.2 and 9.3.3.2).
#[derive(Clone)]
struct Engine<'a> {
    r: NaluReader<'a>,
    range: u32,
    offset: u32,
    overrun: u32,
}

impl<'a> Engine<'a> {
    fn new(r: NaluReader<'a>) -> anyhow::Result<Self> {
        let mut engine = Self {
            r,
            range: 510,
            offset: 0,
            overrun: 0,
        };
        engine.init()?;
        Ok(engine)
    }

    fn init(&mut self) -> anyhow::Result<()> {
        self.range = 510;
        self.offset = self.r.read_bits(9)?;
        if self.offset >= 510 {
            return Err(anyhow!("invalid arithmetic decoder offset {}", self.offset));
        }
        Ok(())
    }

    /// Reads the next bit into the offset register. Reads past the end of
    /// the data yield zeroes, up to a limit.
    fn next_bit(&mut self) -> anyhow::Result<u32> {
        match self.r.read_bit() {
            Ok(bit) => Ok(u32::from(bit)),
            Err(_) if self.overrun < MAX_OVERRUN_BITS => {
                self.overrun += 1;
                Ok(0)
            }
            Err(e) => Err(anyhow!("slice data exhausted: {}", e)),
        }
    }

    fn renorm(&mut self) -> anyhow::Result<()> {
        while self.range < 256 {
            self.range <<= 1;
            self.offset = (self.offset << 1) | self.next_bit()?;
        }
        Ok(())
    }

    fn decision(&mut self, state: &mut u8) -> anyhow::Result<bool> {
        let p_state = usize::from(*state >> 1);
        let mps = *state & 1;
        let lps = u32::from(RANGE_TAB_LPS[p_state][((self.range >> 6) & 3) as usize]);

        self.range -= lps;
        let bin = if self.offset >= self.range {
            self.offset -= self.range;
            self.range = lps;
            let next_mps = if p_state == 0 { mps ^ 1 } else { mps };
            *state = (TRANS_IDX_LPS[p_state] << 1) | next_mps;
            mps ^ 1
        } else {
            *state = (((p_state + 1).min(62) as u8) << 1) | mps;
            mps
        };

        self.renorm()?;
        Ok(bin == 1)
    }

    fn bypass(&mut self) -> anyhow::Result<bool> {
        self.offset = (self.offset << 1) | self.next_bit()?;
        if self.offset >= self.range {
            self.offset -= self.range;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn terminate(&mut self) -> anyhow::Result<bool> {
        self.range -= 2;
        if self.offset >= self.range {
            Ok(true)
        } else {
            self.renorm()?;
            Ok(false)
        }
    }
}

/// Parses slice data coded with CABAC.
pub struct CabacReader<'a> {
    engine: Engine<'a>,
    states: [u8; NUM_CTX],
    /// mb_qp_delta of the previous macroblock in decoding order.
    last_qp_delta: i32,
}

impl<'a> CabacReader<'a> {
    /// Starts parsing the slice data that `r` points to, right after the
    /// slice header.
    pub fn new(
        mut r: NaluReader<'a>,
        slice_type: SliceType,
        cabac_init_idc: u8,
        slice_qp: i32,
    ) -> anyhow::Result<Self> {
        // cabac_alignment_one_bit
        if !r.is_byte_aligned() {
            r.byte_align();
        }

        Ok(Self {
            engine: Engine::new(r)?,
            states: init_contexts(slice_type, cabac_init_idc, slice_qp)?,
            last_qp_delta: 0,
        })
    }

    fn decision(&mut self, ctx: usize) -> anyhow::Result<bool> {
        self.engine.decision(&mut self.states[ctx])
    }

    fn bypass(&mut self) -> anyhow::Result<bool> {
        self.engine.bypass()
    }

    /// mb_skip_flag.
    pub fn mb_skip_flag(
        &mut self,
        arena: &MbArena,
        cur: usize,
        slice_type: SliceType,
    ) -> anyhow::Result<bool> {
        let cond = |n: Option<usize>| n.map(|n| !arena.mbs[n].skip).unwrap_or(false) as usize;
        let inc = cond(arena.mb_a(cur)) + cond(arena.mb_b(cur));
        let base = if slice_type.is_b() {
            CTX_MB_SKIP_B
        } else {
            CTX_MB_SKIP_P
        };
        self.decision(base + inc)
    }

    /// end_of_slice_flag.
    pub fn end_of_slice_flag(&mut self) -> anyhow::Result<bool> {
        self.engine.terminate()
    }

    /// Sum of the conditions of the left and top macroblocks, with the top
    /// one counting `b_weight` times.
    fn mb_inc(
        arena: &MbArena,
        cur: usize,
        b_weight: usize,
        cond: impl Fn(&MbInfo) -> bool,
    ) -> usize {
        let a = arena.mb_a(cur).map(|n| cond(&arena.mbs[n])).unwrap_or(false);
        let b = arena.mb_b(cur).map(|n| cond(&arena.mbs[n])).unwrap_or(false);
        usize::from(a) + b_weight * usize::from(b)
    }

    /// Intra mb_type bins following the prefix, with `base` the context of
    /// the first bin. Returns the I slice mb_type value (Table 7-11).
    fn intra_mb_type(&mut self, base: usize, inc: usize, intra_slice: bool) -> anyhow::Result<u32> {
        if !self.decision(base + inc)? {
            return Ok(0);
        }
        if self.engine.terminate()? {
            return Ok(25);
        }

        // Contexts of the remaining bins: luma, chroma, chroma 2, and the two
        // prediction mode bins.
        let ctx: [usize; 5] = if intra_slice {
            [base + 3, base + 4, base + 5, base + 6, base + 7]
        } else {
            [base + 1, base + 2, base + 2, base + 3, base + 3]
        };

        let mut mb_type = 1;
        if self.decision(ctx[0])? {
            mb_type += 12;
        }
        if self.decision(ctx[1])? {
            mb_type += 4;
            if self.decision(ctx[2])? {
                mb_type += 4;
            }
        }
        if self.decision(ctx[3])? {
            mb_type += 2;
        }
        if self.decision(ctx[4])? {
            mb_type += 1;
        }

        Ok(mb_type)
    }

    fn p_mb_type(&mut self) -> anyhow::Result<u32> {
        if self.decision(CTX_MB_TYPE_P)? {
            return Ok(5 + self.intra_mb_type(CTX_MB_TYPE_P_INTRA, 0, false)?);
        }

        if !self.decision(CTX_MB_TYPE_P + 1)? {
            Ok(if self.decision(CTX_MB_TYPE_P + 2)? { 3 } else { 0 })
        } else {
            Ok(if self.decision(CTX_MB_TYPE_P + 3)? { 1 } else { 2 })
        }
    }

    fn b_mb_type(&mut self, arena: &MbArena, cur: usize) -> anyhow::Result<u32> {
        let inc = Self::mb_inc(arena, cur, 1, |mb| {
            !matches!(mb.mb_type, MbType::BSkip | MbType::BDirect16x16)
        });

        if !self.decision(CTX_MB_TYPE_B + inc)? {
            return Ok(0);
        }
        if !self.decision(CTX_MB_TYPE_B + 3)? {
            return Ok(1 + u32::from(self.decision(CTX_MB_TYPE_B + 5)?));
        }

        let mut bits = u32::from(self.decision(CTX_MB_TYPE_B + 4)?) << 3;
        for shift in (0..3).rev() {
            bits |= u32::from(self.decision(CTX_MB_TYPE_B + 5)?) << shift;
        }

        match bits {
            0..=7 => Ok(bits + 3),
            13 => Ok(23 + self.intra_mb_type(CTX_MB_TYPE_B_INTRA, 0, false)?),
            14 => Ok(11),
            15 => Ok(22),
            _ => Ok(((bits << 1) | u32::from(self.decision(CTX_MB_TYPE_B + 5)?)) - 4),
        }
    }

    /// coded_block_flag (9.3.3.1.1.9). Returns whether the block has
    /// non-zero coefficients.
    fn coded_block_flag(
        &mut self,
        arena: &MbArena,
        cur: usize,
        kind: BlockKind,
    ) -> anyhow::Result<bool> {
        let cur_intra = arena.mbs[cur].mb_type.is_intra();
        let cond = |n: Option<(usize, usize)>| match n {
            None => cur_intra,
            Some((n, bit)) => {
                let mb = &arena.mbs[n];
                mb.mb_type == MbType::IPcm || (mb.cbf >> bit) & 1 == 1
            }
        };

        let (cat, a, b) = match kind {
            BlockKind::LumaDc => {
                let dc = |n: Option<usize>| n.map(|n| (n, 24));
                (0, dc(arena.mb_a(cur)), dc(arena.mb_b(cur)))
            }
            BlockKind::LumaAc(raster) | BlockKind::Luma4x4(raster) => {
                let (bx, by) = ((raster % 4) as i32, (raster / 4) as i32);
                let cat = if matches!(kind, BlockKind::LumaAc(_)) { 1 } else { 2 };
                (cat, arena.block(cur, bx - 1, by, 4), arena.block(cur, bx, by - 1, 4))
            }
            BlockKind::ChromaDc(c) => {
                let dc = |n: Option<usize>| n.map(|n| (n, 25 + c));
                (3, dc(arena.mb_a(cur)), dc(arena.mb_b(cur)))
            }
            BlockKind::ChromaAc(c, blk) => {
                let (bx, by) = ((blk % 2) as i32, (blk / 2) as i32);
                let ac = |n: Option<(usize, usize)>| n.map(|(n, raster)| (n, 16 + 4 * c + raster));
                (4, ac(arena.block(cur, bx - 1, by, 2)), ac(arena.block(cur, bx, by - 1, 2)))
            }
            BlockKind::Luma8x8(_) => return Ok(true),
        };

        let inc = usize::from(cond(a)) + 2 * usize::from(cond(b));
        self.decision(CTX_CODED_BLOCK_FLAG + CBF_CAT_OFFSET[cat] + inc)
    }

    /// coeff_abs_level_minus1 + 1, followed by its sign.
    fn level(&mut self, abs_base: usize, bin0_inc: usize, gt1_inc: usize) -> anyhow::Result<i32> {
        let mut abs = 1;

        if self.decision(abs_base + bin0_inc)? {
            abs += 1;
            while abs < 15 && self.decision(abs_base + gt1_inc)? {
                abs += 1;
            }

            if abs == 15 {
                let mut k = 0;
                while self.bypass()? {
                    abs += 1 << k;
                    k += 1;
                    if k > 24 {
                        return Err(anyhow!("coeff_abs_level_minus1 suffix too long"));
                    }
                }
                while k > 0 {
                    k -= 1;
                    abs += i32::from(self.bypass()?) << k;
                }
            }
        }

        Ok(if self.bypass()? { -abs } else { abs })
    }

    /// residual_block_cabac() for a block whose coded_block_flag is set.
    fn significance_and_levels(
        &mut self,
        kind: BlockKind,
        coeffs: &mut [i32],
        start: usize,
        end: usize,
        max_num_coeff: usize,
    ) -> anyhow::Result<u8> {
        let (cat, sig_base, last_base, abs_base) = match kind {
            BlockKind::Luma8x8(_) => (5, CTX_SIG_8X8, CTX_LAST_8X8, CTX_ABS_LEVEL_8X8),
            _ => {
                let cat = match kind {
                    BlockKind::LumaDc => 0,
                    BlockKind::LumaAc(_) => 1,
                    BlockKind::Luma4x4(_) => 2,
                    BlockKind::ChromaDc(_) => 3,
                    _ => 4,
                };
                (
                    cat,
                    CTX_SIG + SIG_CAT_OFFSET[cat],
                    CTX_LAST + SIG_CAT_OFFSET[cat],
                    CTX_ABS_LEVEL + ABS_CAT_OFFSET[cat],
                )
            }
        };

        // Index of the first coefficient in the level list.
        let first = if max_num_coeff == 15 { 1 } else { 0 };
        let sig_inc = |i: usize| -> (usize, usize) {
            let idx = i - first;
            match cat {
                3 => (idx.min(2), idx.min(2)),
                5 => (usize::from(SIG_8X8_CTX[idx]), usize::from(LAST_8X8_CTX[idx])),
                _ => (idx, idx),
            }
        };

        let mut significant = [false; 64];
        let mut num_coeff = end + 1;
        let mut i = start;
        while i < num_coeff - 1 {
            let (sig, last) = sig_inc(i);
            if self.decision(sig_base + sig)? {
                significant[i] = true;
                if self.decision(last_base + last)? {
                    num_coeff = i + 1;
                    break;
                }
            }
            i += 1;
        }
        significant[num_coeff - 1] = true;

        let gt1_max = if cat == 3 { 3 } else { 4 };
        let mut eq1 = 0;
        let mut gt1 = 0;
        let mut total = 0u8;

        for i in (start..num_coeff).rev() {
            if !significant[i] {
                continue;
            }

            let bin0_inc = if gt1 != 0 { 0 } else { (1 + eq1).min(4) };
            let level = self.level(abs_base, bin0_inc, 5 + gt1.min(gt1_max))?;
            if level.abs() == 1 {
                eq1 += 1;
            } else {
                gt1 += 1;
            }

            coeffs[i] = level;
            total += 1;
        }

        Ok(total)
    }
}

impl EntropyDecoder for CabacReader<'_> {
    const CABAC: bool = true;

    fn mb_type(
        &mut self,
        arena: &MbArena,
        cur: usize,
        slice_type: SliceType,
    ) -> anyhow::Result<MbType> {
        match slice_type {
            SliceType::I => {
                let inc = Self::mb_inc(arena, cur, 1, |mb| mb.mb_type != MbType::INxN);
                MbType::from_i(self.intra_mb_type(CTX_MB_TYPE_I, inc, true)?)
            }
            SliceType::P => MbType::from_p(self.p_mb_type()?),
            _ => MbType::from_b(self.b_mb_type(arena, cur)?),
        }
    }

    fn pcm_samples(&mut self, samples: &mut [u8; 384]) -> anyhow::Result<()> {
        let r = &mut self.engine.r;
        r.byte_align();
        for sample in samples.iter_mut() {
            *sample = r.read_bits(8)?;
        }
        self.engine.init()
    }

    fn transform_size_8x8_flag(&mut self, arena: &MbArena, cur: usize) -> anyhow::Result<bool> {
        let inc = Self::mb_inc(arena, cur, 1, |mb| mb.transform_8x8);
        self.decision(CTX_TRANSFORM_8X8 + inc)
    }

    fn sub_mb_type(&mut self, slice_type: SliceType) -> anyhow::Result<SubMbType> {
        let c = CTX_SUB_MB_TYPE_P;
        if slice_type.is_p() {
            let sub_mb_type = if self.decision(c)? {
                0
            } else if !self.decision(c + 1)? {
                1
            } else if self.decision(c + 2)? {
                2
            } else {
                3
            };
            return SubMbType::from_p(sub_mb_type);
        }

        let c = CTX_SUB_MB_TYPE_B;
        let sub_mb_type = if !self.decision(c)? {
            0
        } else if !self.decision(c + 1)? {
            1 + u32::from(self.decision(c + 3)?)
        } else {
            let mut t = 3;
            let mut done = false;
            if self.decision(c + 2)? {
                if self.decision(c + 3)? {
                    t = 11 + u32::from(self.decision(c + 3)?);
                    done = true;
                } else {
                    t += 4;
                }
            }
            if !done {
                t += 2 * u32::from(self.decision(c + 3)?);
                t += u32::from(self.decision(c + 3)?);
            }
            t
        };
        SubMbType::from_b(sub_mb_type)
    }

    fn rem_intra_pred_mode(&mut self) -> anyhow::Result<Option<u8>> {
        if self.decision(CTX_PREV_INTRA_PRED)? {
            return Ok(None);
        }

        let mut mode = 0;
        for bit in 0..3 {
            mode |= u8::from(self.decision(CTX_REM_INTRA_PRED)?) << bit;
        }
        Ok(Some(mode))
    }

    fn intra_chroma_pred_mode(&mut self, arena: &MbArena, cur: usize) -> anyhow::Result<u8> {
        let inc = Self::mb_inc(arena, cur, 1, |mb| {
            mb.is_intra() && mb.mb_type != MbType::IPcm && mb.chroma_pred_mode != 0
        });

        if !self.decision(CTX_CHROMA_PRED + inc)? {
            return Ok(0);
        }
        if !self.decision(CTX_CHROMA_PRED + 3)? {
            return Ok(1);
        }
        Ok(if self.decision(CTX_CHROMA_PRED + 3)? { 3 } else { 2 })
    }

    fn ref_idx(
        &mut self,
        arena: &MbArena,
        cur: usize,
        list: usize,
        raster: usize,
        max: u32,
    ) -> anyhow::Result<u8> {
        let (bx, by) = ((raster % 4) as i32, (raster / 4) as i32);
        let cond = |n: Option<(usize, usize)>| {
            n.map(|(n, raster)| {
                let mb = &arena.mbs[n];
                let b8 = (raster / 8) * 2 + (raster % 4) / 2;
                !mb.skip
                    && !mb.is_intra()
                    && (mb.direct >> b8) & 1 == 0
                    && mb.ref_idx[list][raster] > 0
            })
            .unwrap_or(false)
        };

        let mut ctx = usize::from(cond(arena.block(cur, bx - 1, by, 4)))
            + 2 * usize::from(cond(arena.block(cur, bx, by - 1, 4)));
        let mut ref_idx = 0u32;

        while self.decision(CTX_REF_IDX + ctx)? {
            ref_idx += 1;
            ctx = if ctx < 4 { 4 } else { 5 };
            if ref_idx > max {
                return Err(anyhow!("ref_idx {} exceeds {}", ref_idx, max));
            }
        }

        Ok(ref_idx as u8)
    }

    fn mvd(
        &mut self,
        arena: &MbArena,
        cur: usize,
        list: usize,
        raster: usize,
        comp: usize,
    ) -> anyhow::Result<i32> {
        let (bx, by) = ((raster % 4) as i32, (raster / 4) as i32);
        let abs = |n: Option<(usize, usize)>| {
            n.map(|(n, raster)| u32::from(arena.mbs[n].mvd[list][raster][comp]))
                .unwrap_or(0)
        };

        let sum = abs(arena.block(cur, bx - 1, by, 4)) + abs(arena.block(cur, bx, by - 1, 4));
        let inc = match sum {
            0..=2 => 0,
            3..=32 => 1,
            _ => 2,
        };

        let base = CTX_MVD[comp];
        if !self.decision(base + inc)? {
            return Ok(0);
        }

        let mut mvd = 1i32;
        let mut ctx = base + 3;
        while mvd < 9 && self.decision(ctx)? {
            if mvd < 4 {
                ctx += 1;
            }
            mvd += 1;
        }

        if mvd >= 9 {
            let mut k = 3;
            while self.bypass()? {
                mvd += 1 << k;
                k += 1;
                if k > 24 {
                    return Err(anyhow!("mvd suffix too long"));
                }
            }
            while k > 0 {
                k -= 1;
                mvd += i32::from(self.bypass()?) << k;
            }
        }

        Ok(if self.bypass()? { -mvd } else { mvd })
    }

    fn coded_block_pattern(&mut self, arena: &MbArena, cur: usize, _: bool) -> anyhow::Result<u8> {
        // Neighbouring 8x8 blocks: (macroblock offset, 8x8 block index).
        const LEFT: [(i32, usize); 4] = [(-1, 1), (0, 0), (-1, 3), (0, 2)];
        const TOP: [(i32, usize); 4] = [(-1, 2), (-1, 3), (0, 0), (0, 1)];

        let mb_a = arena.mb_a(cur);
        let mb_b = arena.mb_b(cur);
        let mut cbp_luma = 0u8;

        for b8 in 0..4 {
            let cond = |mb: Option<usize>, (outside, n8): (i32, usize), cbp_luma: u8| -> usize {
                let cbp = if outside == 0 {
                    cbp_luma
                } else {
                    match mb {
                        Some(n) => arena.mbs[n].cbp,
                        None => return 0,
                    }
                };
                usize::from((cbp >> n8) & 1 == 0)
            };

            let inc = cond(mb_a, LEFT[b8], cbp_luma) + 2 * cond(mb_b, TOP[b8], cbp_luma);
            if self.decision(CTX_CBP_LUMA + inc)? {
                cbp_luma |= 1 << b8;
            }
        }

        let chroma = |n: Option<usize>, f: fn(u8) -> bool| {
            usize::from(n.map(|n| f(arena.mbs[n].cbp_chroma())).unwrap_or(false))
        };
        let inc = chroma(mb_a, |c| c != 0) + 2 * chroma(mb_b, |c| c != 0);
        let cbp_chroma = if !self.decision(CTX_CBP_CHROMA + inc)? {
            0
        } else {
            let inc = 4 + chroma(mb_a, |c| c == 2) + 2 * chroma(mb_b, |c| c == 2);
            1 + u8::from(self.decision(CTX_CBP_CHROMA + inc)?)
        };

        Ok(cbp_luma | (cbp_chroma << 4))
    }

    fn mb_qp_delta(&mut self) -> anyhow::Result<i32> {
        let mut ctx = usize::from(self.last_qp_delta != 0);
        let mut k = 0i32;

        while self.decision(CTX_QP_DELTA + ctx)? {
            ctx = if ctx < 2 { 2 } else { 3 };
            k += 1;
            if k > 52 {
                return Err(anyhow!("mb_qp_delta out of range"));
            }
        }

        let delta = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        if !(-26..=25).contains(&delta) {
            return Err(anyhow!("mb_qp_delta {} out of range", delta));
        }

        self.last_qp_delta = delta;
        Ok(delta)
    }

    fn no_qp_delta(&mut self) {
        self.last_qp_delta = 0;
    }

    fn residual_block(
        &mut self,
        arena: &MbArena,
        cur: usize,
        kind: BlockKind,
        coeffs: &mut [i32],
        start: usize,
        end: usize,
        max_num_coeff: usize,
    ) -> anyhow::Result<u8> {
        if !self.coded_block_flag(arena, cur, kind)? {
            return Ok(0);
        }
        self.significance_and_levels(kind, coeffs, start, end, max_num_coeff)
    }
}

/// CABAC encoder (9.3.4), used to produce slice data for tests.
#[cfg(test)]
pub(crate) mod encoder {
    use super::*;

    pub struct CabacEncoder {
        bits: Vec<bool>,
        low: u32,
        range: u32,
        outstanding: u32,
        first_bit: bool,
        pub states: [u8; NUM_CTX],
    }

    impl CabacEncoder {
        pub fn new(slice_type: SliceType, cabac_init_idc: u8, slice_qp: i32) -> Self {
            Self {
                bits: Vec::new(),
                low: 0,
                range: 510,
                outstanding: 0,
                first_bit: true,
                states: init_contexts(slice_type, cabac_init_idc, slice_qp).unwrap(),
            }
        }

        fn put_bit(&mut self, bit: bool) {
            if self.first_bit {
                self.first_bit = false;
            } else {
                self.bits.push(bit);
            }
            while self.outstanding > 0 {
                self.bits.push(!bit);
                self.outstanding -= 1;
            }
        }

        fn renorm(&mut self) {
            while self.range < 256 {
                if self.low < 256 {
                    self.put_bit(false);
                } else if self.low >= 512 {
                    self.low -= 512;
                    self.put_bit(true);
                } else {
                    self.low -= 256;
                    self.outstanding += 1;
                }
                self.range <<= 1;
                self.low <<= 1;
            }
        }

        pub fn decision(&mut self, ctx: usize, bin: bool) {
            let state = self.states[ctx];
            let p_state = usize::from(state >> 1);
            let mps = state & 1 == 1;
            let lps = u32::from(RANGE_TAB_LPS[p_state][((self.range >> 6) & 3) as usize]);

            self.range -= lps;
            if bin != mps {
                self.low += self.range;
                self.range = lps;
                let mps = if p_state == 0 { !mps } else { mps };
                self.states[ctx] = (TRANS_IDX_LPS[p_state] << 1) | u8::from(mps);
            } else {
                self.states[ctx] = ((p_state as u8 + 1).min(62) << 1) | u8::from(mps);
            }

            self.renorm();
        }

        pub fn bypass(&mut self, bin: bool) {
            self.low <<= 1;
            if bin {
                self.low += self.range;
            }
            if self.low >= 1024 {
                self.put_bit(true);
                self.low -= 1024;
            } else if self.low < 512 {
                self.put_bit(false);
            } else {
                self.low -= 512;
                self.outstanding += 1;
            }
        }

        pub fn terminate(&mut self, bin: bool) {
            self.range -= 2;
            if bin {
                self.low += self.range;
                self.flush();
            } else {
                self.renorm();
            }
        }

        fn flush(&mut self) {
            self.range = 2;
            self.renorm();
            self.put_bit((self.low >> 9) & 1 == 1);
            self.bits.push((self.low >> 8) & 1 == 1);
            self.bits.push(true);
        }

        /// Writes residual_block_cabac() of a block of category `cat` (0 to 4)
        /// whose coefficients are given in scan order. `cbf_inc` is the
        /// ctxIdxInc of its coded_block_flag.
        pub fn residual_block(&mut self, cat: usize, cbf_inc: usize, coeffs: &[i32]) {
            let Some(last) = coeffs.iter().rposition(|c| *c != 0) else {
                self.decision(CTX_CODED_BLOCK_FLAG + CBF_CAT_OFFSET[cat] + cbf_inc, false);
                return;
            };
            self.decision(CTX_CODED_BLOCK_FLAG + CBF_CAT_OFFSET[cat] + cbf_inc, true);

            let sig_inc = |i: usize| if cat == 3 { i.min(2) } else { i };
            for (i, coeff) in coeffs.iter().enumerate().take(coeffs.len() - 1) {
                self.decision(CTX_SIG + SIG_CAT_OFFSET[cat] + sig_inc(i), *coeff != 0);
                if *coeff != 0 {
                    self.decision(CTX_LAST + SIG_CAT_OFFSET[cat] + sig_inc(i), i == last);
                }
                if i == last {
                    break;
                }
            }

            let abs_base = CTX_ABS_LEVEL + ABS_CAT_OFFSET[cat];
            let gt1_max = if cat == 3 { 3 } else { 4 };
            let (mut eq1, mut gt1) = (0, 0);
            for level in coeffs[..=last].iter().rev().filter(|c| **c != 0) {
                let abs = level.abs();
                let bin0_inc = if gt1 != 0 { 0 } else { (1 + eq1).min(4) };
                self.decision(abs_base + bin0_inc, abs > 1);
                if abs > 1 {
                    for _ in 2..abs.min(15) {
                        self.decision(abs_base + 5 + gt1.min(gt1_max), true);
                    }
                    if abs < 15 {
                        self.decision(abs_base + 5 + gt1.min(gt1_max), false);
                    } else {
                        // UEG0 suffix of abs - 15.
                        let mut value = abs - 15;
                        let mut k = 0;
                        while value >= 1 << k {
                            self.bypass(true);
                            value -= 1 << k;
                            k += 1;
                        }
                        self.bypass(false);
                        while k > 0 {
                            k -= 1;
                            self.bypass((value >> k) & 1 == 1);
                        }
                    }
                    gt1 += 1;
                } else {
                    eq1 += 1;
                }
                self.bypass(*level < 0);
            }
        }

        /// Writes raw bytes after a flush, as for I_PCM samples, and restarts
        /// the arithmetic coder.
        pub fn pcm(&mut self, samples: &[u8]) {
            while self.bits.len() % 8 != 0 {
                self.bits.push(false);
            }
            for byte in samples {
                for i in (0..8).rev() {
                    self.bits.push((byte >> i) & 1 == 1);
                }
            }
            self.low = 0;
            self.range = 510;
            self.outstanding = 0;
            self.first_bit = true;
        }

        /// Returns the coded bytes, padded with zeroes.
        pub fn finish(self) -> Vec<u8> {
            self.bits
                .chunks(8)
                .map(|chunk| {
                    chunk
                        .iter()
                        .enumerate()
                        .fold(0u8, |byte, (i, bit)| byte | (u8::from(*bit) << (7 - i)))
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::encoder::CabacEncoder;
    use super::*;

    fn reader(data: &[u8], slice_type: SliceType) -> CabacReader<'_> {
        CabacReader::new(NaluReader::new(data), slice_type, 0, 26).unwrap()
    }

    #[test]
    fn context_initialization() {
        // m = 20, n = -15 at QP 26: preCtxState = ((20 * 26) >> 4) - 15 = 17.
        assert_eq!(init_state(20, -15, 26), (63 - 17) << 1);
        // m = 0, n = 97: preCtxState 97, so pStateIdx 33 and valMPS 1.
        assert_eq!(init_state(0, 97, 40), (33 << 1) | 1);
        // Clipped to 1..=126.
        assert_eq!(init_state(-46, 127, 51), (63 - 1) << 1);
        assert!(init_contexts(SliceType::P, 3, 26).is_err());
    }

    #[test]
    fn tables_are_consistent() {
        for row in RANGE_TAB_LPS.iter().take(63) {
            assert!(row.windows(2).all(|w| w[0] <= w[1]));
        }
        for (state, next) in TRANS_IDX_LPS.iter().enumerate().take(63) {
            assert!(usize::from(*next) <= state.max(1));
        }
        assert_eq!(SIG_8X8_CTX.iter().max(), Some(&14));
        assert_eq!(LAST_8X8_CTX.iter().max(), Some(&8));
    }

    #[test]
    fn engine_decodes_encoded_bins() {
        let bins: Vec<(usize, bool)> = (0..400)
            .map(|i| ((i * 7) % 40 + 60, (i * 13) % 5 < 2 || i % 11 == 0))
            .collect();

        let mut enc = CabacEncoder::new(SliceType::P, 0, 26);
        for (ctx, bin) in &bins {
            enc.decision(*ctx, *bin);
            enc.bypass(*bin ^ (*ctx % 2 == 0));
        }
        enc.terminate(true);
        let data = enc.finish();

        let mut r = reader(&data, SliceType::P);
        for (ctx, bin) in &bins {
            assert_eq!(r.decision(*ctx).unwrap(), *bin);
            assert_eq!(r.bypass().unwrap(), *bin ^ (*ctx % 2 == 0));
        }
        assert!(r.end_of_slice_flag().unwrap());
    }

    #[test]
    fn pcm_restarts_the_engine() {
        let samples: Vec<u8> = (0..384).map(|i| (i * 3) as u8).collect();

        let mut enc = CabacEncoder::new(SliceType::I, 0, 26);
        // mb_type I_PCM: prefix bin 1, then terminate.
        enc.decision(CTX_MB_TYPE_I, true);
        enc.terminate(true);
        enc.pcm(&samples);
        enc.decision(CTX_MB_TYPE_I + 1, false);
        enc.terminate(true);
        let data = enc.finish();

        let arena = MbArena::new(2, 1);
        let mut r = reader(&data, SliceType::I);
        assert_eq!(r.mb_type(&arena, 0, SliceType::I).unwrap(), MbType::IPcm);

        let mut pcm = [0u8; 384];
        r.pcm_samples(&mut pcm).unwrap();
        assert_eq!(pcm.to_vec(), samples);

        assert!(!r.decision(CTX_MB_TYPE_I + 1).unwrap());
        assert!(r.end_of_slice_flag().unwrap());
    }

    #[test]
    fn b_mb_types() {
        let mut enc = CabacEncoder::new(SliceType::B, 0, 30);
        // B_L0_16x8 (mb_type 4): bits 0001.
        for (ctx, bin) in [(0, true), (3, true), (4, false), (5, false), (5, false), (5, true)] {
            enc.decision(CTX_MB_TYPE_B + ctx, bin);
        }
        // B_8x8 (mb_type 22): bits 1111.
        for (ctx, bin) in [(0, true), (3, true), (4, true), (5, true), (5, true), (5, true)] {
            enc.decision(CTX_MB_TYPE_B + ctx, bin);
        }
        // Intra prefix (bits 1101) followed by I_NxN.
        for (ctx, bin) in [(0, true), (3, true), (4, true), (5, true), (5, false), (5, true)] {
            enc.decision(CTX_MB_TYPE_B + ctx, bin);
        }
        enc.decision(CTX_MB_TYPE_B_INTRA, false);
        // B_Direct_16x16.
        enc.decision(CTX_MB_TYPE_B, false);
        enc.terminate(true);
        let data = enc.finish();

        let arena = MbArena::new(1, 1);
        let mut r = CabacReader::new(NaluReader::new(&data), SliceType::B, 0, 30).unwrap();
        assert_eq!(MbType::from_b(4).unwrap(), r.mb_type(&arena, 0, SliceType::B).unwrap());
        assert_eq!(MbType::B8x8, r.mb_type(&arena, 0, SliceType::B).unwrap());
        assert_eq!(MbType::INxN, r.mb_type(&arena, 0, SliceType::B).unwrap());
        assert_eq!(MbType::BDirect16x16, r.mb_type(&arena, 0, SliceType::B).unwrap());
        assert!(r.end_of_slice_flag().unwrap());
    }

    #[test]
    fn mvd_and_qp_delta_binarization() {
        let values: [i32; 7] = [0, 1, -3, 8, 9, -40, 200];

        let mut enc = CabacEncoder::new(SliceType::P, 0, 26);
        for v in values {
            // UEG3 with uCoff 9, signed. Neighbour sum is 0.
            let abs = v.abs() as u32;
            let base = CTX_MVD[0];
            enc.decision(base, abs > 0);
            if abs > 0 {
                let mut ctx = base + 3;
                for i in 1..abs.min(9) {
                    enc.decision(ctx, true);
                    if i < 4 {
                        ctx += 1;
                    }
                }
                if abs < 9 {
                    enc.decision(ctx, false);
                } else {
                    let mut rem = abs - 9;
                    let mut k = 3;
                    while rem >= (1 << k) {
                        enc.bypass(true);
                        rem -= 1 << k;
                        k += 1;
                    }
                    enc.bypass(false);
                    while k > 0 {
                        k -= 1;
                        enc.bypass((rem >> k) & 1 == 1);
                    }
                }
                enc.bypass(v < 0);
            }
        }
        // mb_qp_delta -2 (k = 4) after a zero delta.
        for (i, bin) in [true, true, true, true, false].into_iter().enumerate() {
            enc.decision(CTX_QP_DELTA + [0, 2, 3, 3, 3][i], bin);
        }
        enc.terminate(true);
        let data = enc.finish();

        let arena = {
            let mut arena = MbArena::new(1, 1);
            arena.mbs[0].slice_num = 0;
            arena
        };
        let mut r = reader(&data, SliceType::P);
        for v in values {
            assert_eq!(r.mvd(&arena, 0, 0, 0, 0).unwrap(), v);
        }
        assert_eq!(r.mb_qp_delta().unwrap(), -2);
        assert!(r.end_of_slice_flag().unwrap());
    }

    #[test]
    fn residual_block_levels() {
        // A luma 4x4 block holding 2, 0, -1, 0, ... , 0: coded_block_flag 1
        // (no neighbours, inter macroblock: ctxIdxInc 0), significance map
        // and levels in reverse order.
        let mut enc = CabacEncoder::new(SliceType::P, 0, 26);
        let cbf = CTX_CODED_BLOCK_FLAG + CBF_CAT_OFFSET[2];
        let sig = CTX_SIG + SIG_CAT_OFFSET[2];
        let last = CTX_LAST + SIG_CAT_OFFSET[2];
        let abs = CTX_ABS_LEVEL + ABS_CAT_OFFSET[2];

        enc.decision(cbf, true);
        enc.decision(sig, true);
        enc.decision(last, false);
        enc.decision(sig + 1, false);
        enc.decision(sig + 2, true);
        enc.decision(last + 2, true);
        // -1: bin0 with ctxIdxInc 1, sign.
        enc.decision(abs + 1, false);
        enc.bypass(true);
        // 2: bin0 with ctxIdxInc 2 (one level equal to 1), then a 0 bin at
        // 5 + 0, sign.
        enc.decision(abs + 2, true);
        enc.decision(abs + 5, false);
        enc.bypass(false);
        enc.terminate(true);
        let data = enc.finish();

        let mut arena = MbArena::new(1, 1);
        arena.mbs[0].slice_num = 0;
        arena.mbs[0].mb_type = MbType::P8x8;

        let mut r = reader(&data, SliceType::P);
        let mut coeffs = [0; 16];
        let total = r
            .residual_block(&arena, 0, BlockKind::Luma4x4(0), &mut coeffs, 0, 15, 16)
            .unwrap();

        assert_eq!(total, 2);
        assert_eq!(&coeffs[..4], &[2, 0, -1, 0]);
        assert!(r.end_of_slice_flag().unwrap());
    }

    #[test]
    fn dc_blocks_of_an_intra_macroblock() {
        // The last luma coefficient sits at the final scan position and -20
        // needs the bypass coded suffix.
        let luma = [4, 3, 0, 0, -20, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let cb = [2, -1, 0, 0];

        // No neighbours around an intra macroblock: ctxIdxInc 3.
        let mut enc = CabacEncoder::new(SliceType::I, 0, 26);
        enc.residual_block(0, 3, &luma);
        enc.residual_block(3, 3, &cb);
        enc.residual_block(3, 3, &[0; 4]);
        enc.terminate(true);
        let data = enc.finish();

        let mut arena = MbArena::new(1, 1);
        arena.mbs[0].slice_num = 0;
        arena.mbs[0].mb_type = MbType::I16x16 {
            pred_mode: 2,
            cbp_luma: 0,
            cbp_chroma: 1,
        };

        let mut r = reader(&data, SliceType::I);
        let mut coeffs = [0; 16];
        let total = r
            .residual_block(&arena, 0, BlockKind::LumaDc, &mut coeffs, 0, 15, 16)
            .unwrap();
        assert_eq!(total, 4);
        assert_eq!(coeffs, luma);

        let mut coeffs = [0; 4];
        let total = r
            .residual_block(&arena, 0, BlockKind::ChromaDc(0), &mut coeffs, 0, 3, 4)
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(coeffs, cb);

        let mut coeffs = [0; 4];
        let total = r
            .residual_block(&arena, 0, BlockKind::ChromaDc(1), &mut coeffs, 0, 3, 4)
            .unwrap();
        assert_eq!(total, 0);
        assert!(r.end_of_slice_flag().unwrap());
    }
}
