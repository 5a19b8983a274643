// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exp-Golomb and CAVLC parsing of slice data (9.1 and 9.2).

use anyhow::anyhow;
use anyhow::Context;

use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::parser::SliceType;
use crate::decoder::h264::macroblock::MbArena;
use crate::decoder::h264::macroblock::MbType;
use crate::decoder::h264::macroblock::SubMbType;
use crate::decoder::h264::slice::BlockKind;
use crate::decoder::h264::slice::EntropyDecoder;

/// coeff_token lengths, indexed by [table][total_coeff * 4 + trailing_ones],
/// for 0 <= nC < 2, 2 <= nC < 4, 4 <= nC < 8 and 8 <= nC (Table 9-5).
pub(crate) const COEFF_TOKEN_LEN: [[u8; 68]; 4] = [
    [
        1, 0, 0, 0, 6, 2, 0, 0, 8, 6, 3, 0, 9, 8, 7, 5, 10, 9, 8, 6, 11, 10, 9, 7, 13, 11, 10, 8,
        13, 13, 11, 9, 13, 13, 13, 10, 14, 14, 13, 11, 14, 14, 14, 13, 15, 15, 14, 14, 15, 15, 15,
        14, 16, 15, 15, 15, 16, 16, 16, 15, 16, 16, 16, 16, 16, 16, 16, 16,
    ],
    [
        2, 0, 0, 0, 6, 2, 0, 0, 6, 5, 3, 0, 7, 6, 6, 4, 8, 6, 6, 4, 8, 7, 7, 5, 9, 8, 8, 6, 11, 9,
        9, 6, 11, 11, 11, 7, 12, 11, 11, 9, 12, 12, 12, 11, 12, 12, 12, 11, 13, 13, 13, 12, 13, 13,
        13, 13, 13, 14, 13, 13, 14, 14, 14, 13, 14, 14, 14, 14,
    ],
    [
        4, 0, 0, 0, 6, 4, 0, 0, 6, 5, 4, 0, 6, 5, 5, 4, 7, 5, 5, 4, 7, 5, 5, 4, 7, 6, 6, 4, 7, 6, 6,
        4, 8, 7, 7, 5, 8, 8, 7, 6, 9, 8, 8, 7, 9, 9, 8, 8, 9, 9, 9, 8, 10, 9, 9, 9, 10, 10, 10, 10,
        10, 10, 10, 10, 10, 10, 10, 10,
    ],
    [
        6, 0, 0, 0, 6, 6, 0, 0, 6, 6, 6, 0, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
        6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
        6, 6, 6, 6, 6, 6,
    ],
];

pub(crate) const COEFF_TOKEN_BITS: [[u8; 68]; 4] = [
    [
        1, 0, 0, 0, 5, 1, 0, 0, 7, 4, 1, 0, 7, 6, 5, 3, 7, 6, 5, 3, 7, 6, 5, 4, 15, 6, 5, 4, 11, 14,
        5, 4, 8, 10, 13, 4, 15, 14, 9, 4, 11, 10, 13, 12, 15, 14, 9, 12, 11, 10, 13, 8, 15, 1, 9,
        12, 11, 14, 13, 8, 7, 10, 9, 12, 4, 6, 5, 8,
    ],
    [
        3, 0, 0, 0, 11, 2, 0, 0, 7, 7, 3, 0, 7, 10, 9, 5, 7, 6, 5, 4, 4, 6, 5, 6, 7, 6, 5, 8, 15, 6,
        5, 4, 11, 14, 13, 4, 15, 10, 9, 4, 11, 14, 13, 12, 8, 10, 9, 8, 15, 14, 13, 12, 11, 10, 9,
        12, 7, 11, 6, 8, 9, 8, 10, 1, 7, 6, 5, 4,
    ],
    [
        15, 0, 0, 0, 15, 14, 0, 0, 11, 15, 13, 0, 8, 12, 14, 12, 15, 10, 11, 11, 11, 8, 9, 10, 9,
        14, 13, 9, 8, 10, 9, 8, 15, 14, 13, 13, 11, 14, 10, 12, 15, 10, 13, 12, 11, 14, 9, 12, 8,
        10, 13, 8, 13, 7, 9, 12, 9, 12, 11, 10, 5, 8, 7, 6, 1, 4, 3, 2,
    ],
    [
        3, 0, 0, 0, 0, 1, 0, 0, 4, 5, 6, 0, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21,
        22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44,
        45, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63,
    ],
];

/// coeff_token of chroma DC blocks (nC == -1), indexed like the tables above.
pub(crate) const CHROMA_DC_COEFF_TOKEN_LEN: [u8; 20] =
    [2, 0, 0, 0, 6, 1, 0, 0, 6, 6, 3, 0, 6, 7, 7, 6, 6, 8, 8, 7];
pub(crate) const CHROMA_DC_COEFF_TOKEN_BITS: [u8; 20] =
    [1, 0, 0, 0, 7, 1, 0, 0, 4, 6, 1, 0, 3, 3, 2, 5, 2, 3, 2, 0];

/// total_zeros of 4x4 blocks, indexed by [total_coeff - 1][total_zeros]
/// (Tables 9-7 and 9-8).
pub(crate) const TOTAL_ZEROS_LEN: [&[u8]; 15] = [
    &[1, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 9],
    &[3, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 6, 6, 6, 6],
    &[4, 3, 3, 3, 4, 4, 3, 3, 4, 5, 5, 6, 5, 6],
    &[5, 3, 4, 4, 3, 3, 3, 4, 3, 4, 5, 5, 5],
    &[4, 4, 4, 3, 3, 3, 3, 3, 4, 5, 4, 5],
    &[6, 5, 3, 3, 3, 3, 3, 3, 4, 3, 6],
    &[6, 5, 3, 3, 3, 2, 3, 4, 3, 6],
    &[6, 4, 5, 3, 2, 2, 3, 3, 6],
    &[6, 6, 4, 2, 2, 3, 2, 5],
    &[5, 5, 3, 2, 2, 2, 4],
    &[4, 4, 3, 3, 1, 3],
    &[4, 4, 2, 1, 3],
    &[3, 3, 1, 2],
    &[2, 2, 1],
    &[1, 1],
];

pub(crate) const TOTAL_ZEROS_BITS: [&[u8]; 15] = [
    &[1, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 1],
    &[7, 6, 5, 4, 3, 5, 4, 3, 2, 3, 2, 3, 2, 1, 0],
    &[5, 7, 6, 5, 4, 3, 4, 3, 2, 3, 2, 1, 1, 0],
    &[3, 7, 5, 4, 6, 5, 4, 3, 3, 2, 2, 1, 0],
    &[5, 4, 3, 7, 6, 5, 4, 3, 2, 1, 1, 0],
    &[1, 1, 7, 6, 5, 4, 3, 2, 1, 1, 0],
    &[1, 1, 5, 4, 3, 3, 2, 1, 1, 0],
    &[1, 1, 1, 3, 3, 2, 2, 1, 0],
    &[1, 0, 1, 3, 2, 1, 1, 1],
    &[1, 0, 1, 3, 2, 1, 1],
    &[0, 1, 1, 2, 1, 3],
    &[0, 1, 1, 1, 1],
    &[0, 1, 1, 1],
    &[0, 1, 1],
    &[0, 1],
];

/// total_zeros of 4:2:0 chroma DC blocks (Table 9-9).
pub(crate) const CHROMA_DC_TOTAL_ZEROS_LEN: [&[u8]; 3] = [&[1, 2, 3, 3], &[1, 2, 2], &[1, 1]];
pub(crate) const CHROMA_DC_TOTAL_ZEROS_BITS: [&[u8]; 3] = [&[1, 1, 1, 0], &[1, 1, 0], &[1, 0]];

/// run_before, indexed by [min(zeros_left, 7) - 1][run_before] (Table 9-10).
pub(crate) const RUN_BEFORE_LEN: [&[u8]; 7] = [
    &[1, 1],
    &[1, 2, 2],
    &[2, 2, 2, 2],
    &[2, 2, 2, 3, 3],
    &[2, 2, 3, 3, 3, 3],
    &[2, 3, 3, 3, 3, 3, 3],
    &[3, 3, 3, 3, 3, 3, 3, 4, 5, 6, 7, 8, 9, 10, 11],
];

pub(crate) const RUN_BEFORE_BITS: [&[u8]; 7] = [
    &[1, 0],
    &[1, 1, 0],
    &[3, 2, 1, 0],
    &[3, 2, 1, 1, 0],
    &[3, 2, 3, 2, 1, 0],
    &[3, 0, 1, 3, 2, 5, 4],
    &[7, 6, 5, 4, 3, 2, 1, 1, 1, 1, 1, 1, 1, 1, 1],
];

/// Table 9-4: coded_block_pattern of Intra_4x4/Intra_8x8 and inter
/// macroblocks, indexed by codeNum.
const INTRA_CBP: [u8; 48] = [
    47, 31, 15, 0, 23, 27, 29, 30, 7, 11, 13, 14, 39, 43, 45, 46, 16, 3, 5, 10, 12, 19, 21, 26, 28,
    35, 37, 42, 44, 1, 2, 4, 8, 17, 18, 20, 24, 6, 9, 22, 25, 32, 33, 34, 36, 40, 38, 41,
];
const INTER_CBP: [u8; 48] = [
    0, 16, 1, 2, 4, 8, 32, 3, 5, 10, 12, 15, 47, 7, 11, 13, 14, 6, 9, 31, 35, 37, 42, 44, 33, 34,
    36, 40, 39, 43, 45, 46, 17, 18, 20, 24, 19, 21, 26, 28, 23, 27, 29, 30, 22, 25, 38, 41,
];

/// Reads a variable length code described by parallel length and value
/// tables. Returns the index of the matching entry.
fn read_vlc(r: &mut NaluReader, lens: &[u8], bits: &[u8]) -> anyhow::Result<usize> {
    let max_len = lens.iter().copied().max().unwrap_or(0);
    let mut code = 0u32;

    for len in 1..=max_len {
        code = (code << 1) | u32::from(r.read_bit()?);
        if let Some(i) = lens
            .iter()
            .zip(bits)
            .position(|(l, b)| *l == len && u32::from(*b) == code)
        {
            return Ok(i);
        }
    }

    Err(anyhow!("invalid variable length code"))
}

/// Parses slice data coded with CAVLC.
pub struct CavlcReader<'a> {
    r: NaluReader<'a>,
    /// Macroblocks left in the current mb_skip_run.
    skip_run: Option<u32>,
}

impl<'a> CavlcReader<'a> {
    pub fn new(r: NaluReader<'a>) -> Self {
        Self { r, skip_run: None }
    }

    /// Whether the next macroblock is skipped, reading mb_skip_run when a new
    /// run starts.
    pub fn mb_skipped(&mut self) -> anyhow::Result<bool> {
        let run = match self.skip_run {
            Some(run) => run,
            None => self.r.read_ue::<u32>().context("reading mb_skip_run")?,
        };

        if run > 0 {
            self.skip_run = Some(run - 1);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Whether the slice ends before the next macroblock.
    pub fn end_of_slice(&mut self) -> bool {
        !self.r.has_more_rsbp_data()
    }

    /// Called once a macroblock has been coded, so the next one starts
    /// with a new mb_skip_run.
    pub fn macroblock_coded(&mut self) {
        self.skip_run = None;
    }

    /// Whether a skip run is still pending.
    pub fn in_skip_run(&self) -> bool {
        matches!(self.skip_run, Some(run) if run > 0)
    }

    fn nc(arena: &MbArena, cur: usize, kind: BlockKind) -> i32 {
        let (bx, by, size, offset) = match kind {
            BlockKind::ChromaDc(_) => return -1,
            BlockKind::LumaDc => (0, 0, 4, 0),
            BlockKind::LumaAc(raster) | BlockKind::Luma4x4(raster) => {
                ((raster % 4) as i32, (raster / 4) as i32, 4, 0)
            }
            BlockKind::Luma8x8(b8) => (((b8 % 2) * 2) as i32, ((b8 / 2) * 2) as i32, 4, 0),
            BlockKind::ChromaAc(c, blk) => ((blk % 2) as i32, (blk / 2) as i32, 2, 16 + 4 * c),
        };

        let count = |bx: i32, by: i32| {
            arena
                .block(cur, bx, by, size)
                .map(|(n, raster)| i32::from(arena.mbs[n].total_coeff[offset + raster]))
        };

        match (count(bx - 1, by), count(bx, by - 1)) {
            (Some(a), Some(b)) => (a + b + 1) >> 1,
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => 0,
        }
    }

    /// 9.2: residual_block_cavlc(). Levels are written to
    /// `coeffs[start..=end]` in scan order; returns TotalCoeff.
    fn residual_block_cavlc(
        &mut self,
        nc: i32,
        coeffs: &mut [i32],
        start: usize,
        end: usize,
        max_num_coeff: usize,
    ) -> anyhow::Result<u8> {
        let r = &mut self.r;

        let token = match nc {
            -1 => read_vlc(r, &CHROMA_DC_COEFF_TOKEN_LEN, &CHROMA_DC_COEFF_TOKEN_BITS)?,
            0..=1 => read_vlc(r, &COEFF_TOKEN_LEN[0], &COEFF_TOKEN_BITS[0])?,
            2..=3 => read_vlc(r, &COEFF_TOKEN_LEN[1], &COEFF_TOKEN_BITS[1])?,
            4..=7 => read_vlc(r, &COEFF_TOKEN_LEN[2], &COEFF_TOKEN_BITS[2])?,
            _ => read_vlc(r, &COEFF_TOKEN_LEN[3], &COEFF_TOKEN_BITS[3])?,
        };
        let total_coeff = token / 4;
        let trailing_ones = token % 4;

        if total_coeff == 0 {
            return Ok(0);
        }
        if total_coeff > max_num_coeff || total_coeff > end - start + 1 {
            return Err(anyhow!(
                "TotalCoeff {} exceeds {} coefficients",
                total_coeff,
                max_num_coeff
            ));
        }

        let mut levels = [0i32; 16];
        let mut suffix_length = if total_coeff > 10 && trailing_ones < 3 { 1 } else { 0 };

        for (i, level) in levels.iter_mut().enumerate().take(total_coeff) {
            if i < trailing_ones {
                *level = if r.read_bit()? { -1 } else { 1 };
                continue;
            }

            let mut level_prefix = 0u32;
            while !r.read_bit()? {
                level_prefix += 1;
                if level_prefix > 31 {
                    return Err(anyhow!("level_prefix too long"));
                }
            }

            let mut level_code = (level_prefix.min(15) << suffix_length) as i32;

            if suffix_length > 0 || level_prefix >= 14 {
                let suffix_size = if level_prefix == 14 && suffix_length == 0 {
                    4
                } else if level_prefix >= 15 {
                    level_prefix as usize - 3
                } else {
                    suffix_length
                };
                if suffix_size > 0 {
                    level_code += r.read_bits::<u32>(suffix_size)? as i32;
                }
            }
            if level_prefix >= 15 && suffix_length == 0 {
                level_code += 15;
            }
            if level_prefix >= 16 {
                level_code += (1 << (level_prefix - 3)) - 4096;
            }
            if i == trailing_ones && trailing_ones < 3 {
                level_code += 2;
            }

            *level = if level_code % 2 == 0 {
                (level_code + 2) >> 1
            } else {
                (-level_code - 1) >> 1
            };

            if suffix_length == 0 {
                suffix_length = 1;
            }
            if level.abs() > (3 << (suffix_length - 1)) && suffix_length < 6 {
                suffix_length += 1;
            }
        }

        let mut zeros_left = if total_coeff < end - start + 1 {
            let tz = if max_num_coeff == 4 {
                read_vlc(
                    r,
                    CHROMA_DC_TOTAL_ZEROS_LEN[total_coeff - 1],
                    CHROMA_DC_TOTAL_ZEROS_BITS[total_coeff - 1],
                )?
            } else {
                read_vlc(r, TOTAL_ZEROS_LEN[total_coeff - 1], TOTAL_ZEROS_BITS[total_coeff - 1])?
            };
            if tz > end - start + 1 - total_coeff {
                return Err(anyhow!("total_zeros {} out of range", tz));
            }
            tz
        } else {
            0
        };

        let mut runs = [0usize; 16];
        for run in runs.iter_mut().take(total_coeff - 1) {
            if zeros_left == 0 {
                break;
            }
            let table = zeros_left.min(7) - 1;
            *run = read_vlc(r, RUN_BEFORE_LEN[table], RUN_BEFORE_BITS[table])?;
            if *run > zeros_left {
                return Err(anyhow!("run_before {} exceeds zerosLeft {}", run, zeros_left));
            }
            zeros_left -= *run;
        }
        runs[total_coeff - 1] = zeros_left;

        let mut coeff_num = start;
        for i in (0..total_coeff).rev() {
            coeff_num += runs[i];
            coeffs[coeff_num] = levels[i];
            coeff_num += 1;
        }

        Ok(total_coeff as u8)
    }
}

impl EntropyDecoder for CavlcReader<'_> {
    const CABAC: bool = false;

    fn mb_type(&mut self, _: &MbArena, _: usize, slice_type: SliceType) -> anyhow::Result<MbType> {
        let mb_type = self.r.read_ue::<u32>()?;
        match slice_type {
            SliceType::I => MbType::from_i(mb_type),
            SliceType::P => MbType::from_p(mb_type),
            _ => MbType::from_b(mb_type),
        }
    }

    fn pcm_samples(&mut self, samples: &mut [u8; 384]) -> anyhow::Result<()> {
        self.r.byte_align();
        for sample in samples.iter_mut() {
            *sample = self.r.read_bits(8)?;
        }
        Ok(())
    }

    fn transform_size_8x8_flag(&mut self, _: &MbArena, _: usize) -> anyhow::Result<bool> {
        Ok(self.r.read_bit()?)
    }

    fn sub_mb_type(&mut self, slice_type: SliceType) -> anyhow::Result<SubMbType> {
        let sub_mb_type = self.r.read_ue::<u32>()?;
        match slice_type {
            SliceType::P => SubMbType::from_p(sub_mb_type),
            _ => SubMbType::from_b(sub_mb_type),
        }
    }

    fn rem_intra_pred_mode(&mut self) -> anyhow::Result<Option<u8>> {
        if self.r.read_bit()? {
            Ok(None)
        } else {
            Ok(Some(self.r.read_bits(3)?))
        }
    }

    fn intra_chroma_pred_mode(&mut self, _: &MbArena, _: usize) -> anyhow::Result<u8> {
        self.r.read_ue_max(3)
    }

    fn ref_idx(
        &mut self,
        _: &MbArena,
        _: usize,
        _: usize,
        _: usize,
        max: u32,
    ) -> anyhow::Result<u8> {
        self.r.read_te(max)
    }

    fn mvd(&mut self, _: &MbArena, _: usize, _: usize, _: usize, _: usize) -> anyhow::Result<i32> {
        self.r.read_se()
    }

    fn coded_block_pattern(&mut self, _: &MbArena, _: usize, intra: bool) -> anyhow::Result<u8> {
        let code_num = self.r.read_ue_max::<usize>(47)?;
        Ok(if intra {
            INTRA_CBP[code_num]
        } else {
            INTER_CBP[code_num]
        })
    }

    fn mb_qp_delta(&mut self) -> anyhow::Result<i32> {
        self.r.read_se_bounded(-26, 25)
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
        let nc = Self::nc(arena, cur, kind);
        self.residual_block_cavlc(nc, coeffs, start, end, max_num_coeff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::BitWriter;

    /// Packs a string of '0' and '1' into bytes, followed by a stop bit.
    fn bits(s: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            for c in s.chars().filter(|c| *c == '0' || *c == '1') {
                w.write_bit(c == '1').unwrap();
            }
            w.write_bit(true).unwrap();
        }
        buf
    }

    fn tables_are_prefix_free(lens: &[u8], codes: &[u8]) {
        let entries: Vec<(u8, u32)> = lens
            .iter()
            .zip(codes)
            .filter(|(l, _)| **l > 0)
            .map(|(l, c)| (*l, u32::from(*c)))
            .collect();

        for (i, (la, ca)) in entries.iter().enumerate() {
            for (j, (lb, cb)) in entries.iter().enumerate() {
                if i != j && la <= lb {
                    assert_ne!(cb >> (lb - la), *ca, "{} is a prefix of {}", i, j);
                }
            }
        }
    }

    #[test]
    fn vlc_tables_are_prefix_free() {
        for t in 0..3 {
            tables_are_prefix_free(&COEFF_TOKEN_LEN[t], &COEFF_TOKEN_BITS[t]);
        }
        tables_are_prefix_free(&CHROMA_DC_COEFF_TOKEN_LEN, &CHROMA_DC_COEFF_TOKEN_BITS);
        for t in 0..15 {
            tables_are_prefix_free(TOTAL_ZEROS_LEN[t], TOTAL_ZEROS_BITS[t]);
        }
        for t in 0..7 {
            tables_are_prefix_free(RUN_BEFORE_LEN[t], RUN_BEFORE_BITS[t]);
        }
    }

    #[test]
    fn cbp_tables_are_permutations() {
        let mut intra = INTRA_CBP.to_vec();
        let mut inter = INTER_CBP.to_vec();
        intra.sort_unstable();
        inter.sort_unstable();
        assert_eq!(intra, (0..48).collect::<Vec<u8>>());
        assert_eq!(inter, (0..48).collect::<Vec<u8>>());
    }

    #[test]
    fn residual_block_example() {
        // Scan order 0 3 0 1 -1 -1 0 1 0 ... with nC = 0.
        // coeff_token (TotalCoeff 5, TrailingOnes 3): 0000100
        // trailing ones signs: 0 1 1 (+1, -1, -1 in reverse scan order)
        // levels: 1 (level 1), 0010 (level 3)
        // total_zeros 3: 111
        // run_before: 10 (1), 1 (0), 1 (0), 01 (1)
        let data = bits("0000100 011 1 0010 111 10 1 1 01");
        let mut reader = CavlcReader::new(NaluReader::new(&data));

        let mut coeffs = [0; 16];
        let total = reader.residual_block_cavlc(0, &mut coeffs, 0, 15, 16).unwrap();

        assert_eq!(total, 5);
        assert_eq!(&coeffs[..8], &[0, 3, 0, 1, -1, -1, 0, 1]);
        assert!(coeffs[8..].iter().all(|c| *c == 0));
    }

    #[test]
    fn empty_and_chroma_dc_blocks() {
        // nC = 4: "1111" is TotalCoeff 0.
        let data = bits("1111");
        let mut reader = CavlcReader::new(NaluReader::new(&data));
        let mut coeffs = [0; 16];
        assert_eq!(reader.residual_block_cavlc(4, &mut coeffs, 0, 15, 16).unwrap(), 0);

        // Chroma DC: "1" is one trailing one, sign "0" (+1), total_zeros "01" (1).
        let data = bits("1 0 01");
        let mut reader = CavlcReader::new(NaluReader::new(&data));
        let mut coeffs = [0; 4];
        assert_eq!(reader.residual_block_cavlc(-1, &mut coeffs, 0, 3, 4).unwrap(), 1);
        assert_eq!(coeffs, [0, 1, 0, 0]);
    }

    #[test]
    fn fixed_length_tokens() {
        // nC >= 8: 6 bit tokens. 000011 is TotalCoeff 0, 000001 is one
        // coefficient with one trailing one.
        let data = bits("000011 000001 1 1");
        let mut reader = CavlcReader::new(NaluReader::new(&data));
        let mut coeffs = [0; 16];
        assert_eq!(reader.residual_block_cavlc(8, &mut coeffs, 0, 15, 16).unwrap(), 0);
        // Sign "1" (-1), total_zeros "1" (0).
        assert_eq!(reader.residual_block_cavlc(9, &mut coeffs, 0, 15, 16).unwrap(), 1);
        assert_eq!(coeffs[0], -1);
    }

    #[test]
    fn large_levels_use_escapes() {
        // nC = 0, TotalCoeff 1, TrailingOnes 0: 000101. level_prefix 14 with
        // a 4 bit suffix: levelCode = 14 + 5 + 2 = 21, level -11.
        // total_zeros 0: "1".
        let data = bits("000101 000000000000001 0101 1");
        let mut reader = CavlcReader::new(NaluReader::new(&data));
        let mut coeffs = [0; 16];
        assert_eq!(reader.residual_block_cavlc(0, &mut coeffs, 0, 15, 16).unwrap(), 1);
        assert_eq!(coeffs[0], -11);
    }

    #[test]
    fn skip_runs() {
        // mb_skip_run 2 then 0.
        let data = bits("011 1");
        let mut reader = CavlcReader::new(NaluReader::new(&data));
        assert!(reader.mb_skipped().unwrap());
        assert!(reader.mb_skipped().unwrap());
        assert!(!reader.mb_skipped().unwrap());
        reader.macroblock_coded();
        assert!(!reader.mb_skipped().unwrap());
    }
}
