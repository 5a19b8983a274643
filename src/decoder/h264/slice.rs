// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Slice data (7.3.4) and the macroblock layer (7.3.5), which are shared by
//! both entropy coders, followed by the reconstruction of every macroblock
//! into the frame being decoded.

use anyhow::anyhow;
use anyhow::Context;
use log::trace;

use crate::codec::h264::nalu::Header;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::SliceType;
use crate::decoder::h264::cabac::CabacReader;
use crate::decoder::h264::cavlc::CavlcReader;
use crate::decoder::h264::frame::Frame;
use crate::decoder::h264::frame::Mv;
use crate::decoder::h264::frame::RefPicture;
use crate::decoder::h264::frame::NO_FRAME;
use crate::decoder::h264::inter::chroma_block;
use crate::decoder::h264::inter::combine;
use crate::decoder::h264::inter::luma_block;
use crate::decoder::h264::inter::Weight;
use crate::decoder::h264::inter::Weighting;
use crate::decoder::h264::intra::predict_16x16;
use crate::decoder::h264::intra::predict_4x4;
use crate::decoder::h264::intra::predict_8x8;
use crate::decoder::h264::intra::predict_chroma;
use crate::decoder::h264::intra::Avail;
use crate::decoder::h264::macroblock::chroma_qp;
use crate::decoder::h264::macroblock::MbArena;
use crate::decoder::h264::macroblock::MbInfo;
use crate::decoder::h264::macroblock::MbType;
use crate::decoder::h264::macroblock::PartPred;
use crate::decoder::h264::macroblock::PartRect;
use crate::decoder::h264::macroblock::PartShape;
use crate::decoder::h264::macroblock::SubMbType;
use crate::decoder::h264::macroblock::SubShape;
use crate::decoder::h264::macroblock::BLK_TO_RASTER;
use crate::decoder::h264::macroblock::CBF_CB_DC;
use crate::decoder::h264::macroblock::CBF_LUMA_DC;
use crate::decoder::h264::macroblock::SLICE_NONE;
use crate::decoder::h264::mvpred::direct_scale_factor;
use crate::decoder::h264::mvpred::p_skip;
use crate::decoder::h264::mvpred::predict;
use crate::decoder::h264::mvpred::BlockMotion;
use crate::decoder::h264::mvpred::DirectContext;
use crate::decoder::h264::transform::add_residual;
use crate::decoder::h264::transform::list_4x4;
use crate::decoder::h264::transform::Dequantizer;
use crate::decoder::DecodeError;

/// A block of residual coefficients, as identified to the entropy decoders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// Intra 16x16 DC coefficients.
    LumaDc,
    /// Intra 16x16 AC coefficients of the 4x4 block at a raster index.
    LumaAc(usize),
    Luma4x4(usize),
    /// 8x8 luma block, by 8x8 block index.
    Luma8x8(usize),
    /// DC coefficients of chroma component 0 (Cb) or 1 (Cr).
    ChromaDc(usize),
    /// AC coefficients of a 4x4 block of a chroma component.
    ChromaAc(usize, usize),
}

/// Reads the syntax elements of the macroblock layer. Implemented by the
/// CAVLC and CABAC readers.
///
/// Context dependent decoders find what they need about the neighbours of
/// macroblock `cur` in the arena, which holds the elements of `cur` decoded
/// so far.
pub trait EntropyDecoder {
    const CABAC: bool;

    fn mb_type(
        &mut self,
        arena: &MbArena,
        cur: usize,
        slice_type: SliceType,
    ) -> anyhow::Result<MbType>;

    /// Reads the 256 luma then 2x64 chroma samples of an I_PCM macroblock.
    fn pcm_samples(&mut self, samples: &mut [u8; 384]) -> anyhow::Result<()>;

    fn transform_size_8x8_flag(&mut self, arena: &MbArena, cur: usize) -> anyhow::Result<bool>;

    fn sub_mb_type(&mut self, slice_type: SliceType) -> anyhow::Result<SubMbType>;

    /// Reads prev_intra_pred_mode_flag and rem_intra_pred_mode. Returns `None`
    /// when the predicted mode is used.
    fn rem_intra_pred_mode(&mut self) -> anyhow::Result<Option<u8>>;

    fn intra_chroma_pred_mode(&mut self, arena: &MbArena, cur: usize) -> anyhow::Result<u8>;

    /// Reads ref_idx_lX of the partition whose top-left 4x4 block is
    /// `raster`. `max` is the largest valid value.
    fn ref_idx(
        &mut self,
        arena: &MbArena,
        cur: usize,
        list: usize,
        raster: usize,
        max: u32,
    ) -> anyhow::Result<u8>;

    /// Reads component `comp` of mvd_lX of the partition whose top-left 4x4
    /// block is `raster`.
    fn mvd(
        &mut self,
        arena: &MbArena,
        cur: usize,
        list: usize,
        raster: usize,
        comp: usize,
    ) -> anyhow::Result<i32>;

    /// Returns CodedBlockPatternLuma in the low nibble and
    /// CodedBlockPatternChroma above.
    fn coded_block_pattern(
        &mut self,
        arena: &MbArena,
        cur: usize,
        intra: bool,
    ) -> anyhow::Result<u8>;

    fn mb_qp_delta(&mut self) -> anyhow::Result<i32>;

    /// Signals a macroblock without mb_qp_delta.
    fn no_qp_delta(&mut self) {}

    /// Reads one residual block into `coeffs[start..=end]`, in scan order.
    /// Returns the number of non-zero coefficients.
    #[allow(clippy::too_many_arguments)]
    fn residual_block(
        &mut self,
        arena: &MbArena,
        cur: usize,
        kind: BlockKind,
        coeffs: &mut [i32],
        start: usize,
        end: usize,
        max_num_coeff: usize,
    ) -> anyhow::Result<u8>;
}

/// Raster index of the top-left 4x4 block of each 8x8 block.
const B8_RASTER: [usize; 4] = [0, 2, 8, 10];

/// Raster indices of the 4x4 blocks of an 8x8 block, in decoding order.
fn b8_blocks(b8: usize) -> [usize; 4] {
    let r = B8_RASTER[b8];
    [r, r + 1, r + 4, r + 5]
}

/// Raster index of the top-left 4x4 block of a partition.
fn raster(part: PartRect) -> usize {
    part.1 * 4 + part.0
}

/// Moves a sub-macroblock partition to its 8x8 block.
fn sub_part(b8: usize, part: PartRect) -> PartRect {
    (part.0 + (b8 % 2) * 2, part.1 + (b8 / 2) * 2, part.2, part.3)
}

fn fill<T: Copy>(blocks: &mut [T; 16], part: PartRect, value: T) {
    let (x, y, w, h) = part;
    for by in y..y + h {
        for bx in x..x + w {
            blocks[by * 4 + bx] = value;
        }
    }
}

fn has_coefficients(coeffs: &[i32]) -> bool {
    coeffs.iter().any(|c| *c != 0)
}

/// Luma sample position of macroblock `addr`.
fn mb_origin(arena: &MbArena, addr: usize) -> (usize, usize) {
    ((addr % arena.width) * 16, (addr / arena.width) * 16)
}

/// Syntax elements of the current macroblock that are only needed until it
/// is reconstructed.
struct MbSyntax {
    sub_mb_types: [SubMbType; 4],
    /// mvd_lX, stored at the top-left block of each partition.
    mvd: [[[i32; 2]; 16]; 2],
    pcm: [u8; 384],
    luma_dc: [i32; 16],
    /// 4x4 luma blocks in raster order. Intra 16x16 AC coefficients start
    /// at index 1.
    luma: [[i32; 16]; 16],
    luma_8x8: [[i32; 64]; 4],
    chroma_dc: [[i32; 4]; 2],
    chroma_ac: [[[i32; 16]; 4]; 2],
}

impl MbSyntax {
    fn new() -> Self {
        Self {
            sub_mb_types: Default::default(),
            mvd: [[[0; 2]; 16]; 2],
            pcm: [0; 384],
            luma_dc: [0; 16],
            luma: [[0; 16]; 16],
            luma_8x8: [[0; 64]; 4],
            chroma_dc: [[0; 4]; 2],
            chroma_ac: [[[0; 16]; 4]; 2],
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

/// How the inter predictions of a slice are weighted (8.4.2.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WeightMode {
    Default,
    Explicit,
    Implicit,
}

fn corrupt(mb_addr: usize, source: anyhow::Error) -> DecodeError {
    DecodeError::CorruptSlice { mb_addr, source }
}

/// Decodes the macroblocks of one slice into the frame of its picture.
pub struct SliceDecoder<'a> {
    header: &'a SliceHeader,
    pps: &'a Pps,
    slice_num: u32,
    ref_lists: [&'a [RefPicture]; 2],
    cur_poc: i32,
    dequantizer: &'a Dequantizer,
    weight_mode: WeightMode,
    /// QP_Y of the previous macroblock of the slice.
    qp: i32,
    syntax: MbSyntax,
}

impl<'a> SliceDecoder<'a> {
    pub fn new(
        header: &'a SliceHeader,
        pps: &'a Pps,
        slice_num: u32,
        ref_lists: [&'a [RefPicture]; 2],
        cur_poc: i32,
        dequantizer: &'a Dequantizer,
    ) -> Self {
        let weight_mode = match header.slice_type {
            SliceType::P | SliceType::Sp if pps.weighted_pred_flag => WeightMode::Explicit,
            SliceType::B => match pps.weighted_bipred_idc {
                1 => WeightMode::Explicit,
                2 => WeightMode::Implicit,
                _ => WeightMode::Default,
            },
            _ => WeightMode::Default,
        };

        Self {
            header,
            pps,
            slice_num,
            ref_lists,
            cur_poc,
            dequantizer,
            weight_mode,
            qp: header.slice_qp(pps),
            syntax: MbSyntax::new(),
        }
    }

    /// Decodes slice_data() of `slice`, whose header is the one this decoder
    /// was created with, into `frame`.
    pub fn decode(
        &mut self,
        slice: &Slice,
        arena: &mut MbArena,
        frame: &mut Frame,
    ) -> Result<(), DecodeError> {
        let first = slice.header.first_mb_in_slice as usize;
        if first >= arena.len() {
            return Err(corrupt(
                first,
                anyhow!("first_mb_in_slice {} is outside the picture", first),
            ));
        }
        if !(0..=51).contains(&self.qp) {
            return Err(corrupt(first, anyhow!("invalid slice QP {}", self.qp)));
        }

        let data = slice.nalu.as_ref();
        let mut r = NaluReader::new(&data[slice.nalu.header.len()..]);
        r.skip_bits(slice.header.header_bit_size)
            .context("skipping the slice header")
            .map_err(|e| corrupt(first, e))?;

        trace!(
            "slice {}: {:?} from macroblock {}, qp {}",
            self.slice_num,
            self.header.slice_type,
            first,
            self.qp
        );

        if self.pps.entropy_coding_mode_flag {
            let hdr = self.header;
            let mut cabac = CabacReader::new(r, hdr.slice_type, hdr.cabac_init_idc, self.qp)
                .map_err(|e| corrupt(first, e))?;

            let mut cur = first;
            loop {
                match self
                    .start_macroblock(arena, cur)
                    .and_then(|()| self.cabac_macroblock(&mut cabac, arena, frame, cur))
                {
                    Ok(true) => return Ok(()),
                    Ok(false) => cur += 1,
                    Err(e) => return Err(self.fail(arena, cur, e)),
                }
            }
        } else {
            let mut cavlc = CavlcReader::new(r);

            let mut cur = first;
            loop {
                if let Err(e) = self
                    .start_macroblock(arena, cur)
                    .and_then(|()| self.cavlc_macroblock(&mut cavlc, arena, frame, cur))
                {
                    return Err(self.fail(arena, cur, e));
                }

                if !cavlc.in_skip_run() && cavlc.end_of_slice() {
                    return Ok(());
                }
                cur += 1;
            }
        }
    }

    fn start_macroblock(&self, arena: &mut MbArena, cur: usize) -> anyhow::Result<()> {
        let mb = arena
            .mbs
            .get_mut(cur)
            .ok_or_else(|| anyhow!("slice runs past the end of the picture"))?;
        if mb.slice_num != SLICE_NONE {
            return Err(anyhow!("macroblock {} is decoded twice", cur));
        }

        mb.start(self.slice_num);
        Ok(())
    }

    /// Leaves macroblock `cur` undecoded so it can be concealed.
    fn fail(&self, arena: &mut MbArena, cur: usize, source: anyhow::Error) -> DecodeError {
        if let Some(mb) = arena.mbs.get_mut(cur) {
            if mb.slice_num == self.slice_num {
                mb.slice_num = SLICE_NONE;
            }
        }

        corrupt(cur, source)
    }

    fn cavlc_macroblock(
        &mut self,
        cavlc: &mut CavlcReader<'_>,
        arena: &mut MbArena,
        frame: &mut Frame,
        cur: usize,
    ) -> anyhow::Result<()> {
        if !self.header.slice_type.is_i() && cavlc.mb_skipped()? {
            self.skip_macroblock(arena, frame, cur)
        } else {
            cavlc.macroblock_coded();
            self.macroblock(cavlc, arena, frame, cur)
        }
    }

    /// Decodes a macroblock and returns end_of_slice_flag.
    fn cabac_macroblock(
        &mut self,
        cabac: &mut CabacReader<'_>,
        arena: &mut MbArena,
        frame: &mut Frame,
        cur: usize,
    ) -> anyhow::Result<bool> {
        let slice_type = self.header.slice_type;
        if !slice_type.is_i() && cabac.mb_skip_flag(arena, cur, slice_type)? {
            cabac.no_qp_delta();
            self.skip_macroblock(arena, frame, cur)?;
        } else {
            self.macroblock(cabac, arena, frame, cur)?;
        }

        cabac.end_of_slice_flag()
    }

    fn num_ref_idx_active(&self, list: usize) -> usize {
        if list == 0 {
            self.header.num_ref_idx_l0_active()
        } else {
            self.header.num_ref_idx_l1_active()
        }
    }

    fn set_qp(&self, mb: &mut MbInfo) {
        mb.qp_y = self.qp;
        mb.qp_c = [
            chroma_qp(self.qp, i32::from(self.pps.chroma_qp_index_offset)),
            chroma_qp(self.qp, i32::from(self.pps.second_chroma_qp_index_offset)),
        ];
    }

    fn skip_macroblock(
        &mut self,
        arena: &mut MbArena,
        frame: &mut Frame,
        cur: usize,
    ) -> anyhow::Result<()> {
        self.syntax.clear();

        let mb = &mut arena.mbs[cur];
        if self.header.slice_type.is_b() {
            mb.mb_type = MbType::BSkip;
            mb.direct = 0xf;
        } else {
            mb.mb_type = MbType::PSkip;
        }
        mb.skip = true;
        self.set_qp(mb);

        self.derive_motion(arena, cur)?;
        self.reconstruct_inter(arena, frame, cur)?;
        self.store_motion(arena, frame, cur);

        trace!("macroblock {}: skipped", cur);
        Ok(())
    }

    /// macroblock_layer() followed by the reconstruction of the macroblock.
    fn macroblock<E: EntropyDecoder>(
        &mut self,
        e: &mut E,
        arena: &mut MbArena,
        frame: &mut Frame,
        cur: usize,
    ) -> anyhow::Result<()> {
        self.syntax.clear();
        let mb_type = e.mb_type(arena, cur, self.header.slice_type)?;
        arena.mbs[cur].mb_type = mb_type;

        if mb_type == MbType::IPcm {
            e.pcm_samples(&mut self.syntax.pcm)?;
            e.no_qp_delta();
            self.pcm_macroblock(arena, frame, cur);
            trace!("macroblock {}: I_PCM", cur);
            return Ok(());
        }

        // noSubMbPartSizeLessThan8x8Flag, with the direct_8x8_inference_flag
        // condition of B_Direct_16x16 folded in.
        let mut no_sub_8x8 = true;
        match mb_type {
            MbType::INxN | MbType::I16x16 { .. } => {
                if mb_type == MbType::INxN && self.pps.transform_8x8_mode_flag {
                    arena.mbs[cur].transform_8x8 = e.transform_size_8x8_flag(arena, cur)?;
                }
                self.intra_mb_pred(e, arena, cur)?;
            }
            MbType::Inter { shape, pred } => self.inter_mb_pred(e, arena, cur, shape, pred)?,
            MbType::P8x8 | MbType::P8x8Ref0 | MbType::B8x8 => {
                no_sub_8x8 = self.sub_mb_pred(e, arena, cur, mb_type)?;
            }
            MbType::BDirect16x16 => {
                arena.mbs[cur].direct = 0xf;
                no_sub_8x8 = self.pps.sps.direct_8x8_inference_flag;
            }
            MbType::IPcm | MbType::PSkip | MbType::BSkip => {
                return Err(anyhow!("unexpected macroblock type {:?}", mb_type))
            }
        }

        let cbp = match mb_type {
            MbType::I16x16 {
                cbp_luma, cbp_chroma, ..
            } => cbp_luma | (cbp_chroma << 4),
            _ => e.coded_block_pattern(arena, cur, mb_type.is_intra())?,
        };
        arena.mbs[cur].cbp = cbp;

        if cbp & 0xf != 0 && self.pps.transform_8x8_mode_flag && !mb_type.is_intra() && no_sub_8x8 {
            arena.mbs[cur].transform_8x8 = e.transform_size_8x8_flag(arena, cur)?;
        }

        if cbp != 0 || matches!(mb_type, MbType::I16x16 { .. }) {
            let delta = e.mb_qp_delta()?;
            self.qp = (self.qp + delta + 52) % 52;
            self.residual(e, arena, cur)?;
        } else {
            e.no_qp_delta();
        }
        self.set_qp(&mut arena.mbs[cur]);

        if mb_type.is_intra() {
            self.reconstruct_intra(arena, frame, cur)?;
        } else {
            self.derive_motion(arena, cur)?;
            self.reconstruct_inter(arena, frame, cur)?;
        }
        self.store_motion(arena, frame, cur);

        trace!("macroblock {}: {:?}, cbp {:#04x}, qp {}", cur, mb_type, cbp, self.qp);
        Ok(())
    }

    fn intra_mb_pred<E: EntropyDecoder>(
        &mut self,
        e: &mut E,
        arena: &mut MbArena,
        cur: usize,
    ) -> anyhow::Result<()> {
        if arena.mbs[cur].mb_type == MbType::INxN {
            if arena.mbs[cur].transform_8x8 {
                for raster in B8_RASTER {
                    let mode = self.intra_mode(e, arena, cur, raster)?;
                    fill(&mut arena.mbs[cur].intra_modes, (raster % 4, raster / 4, 2, 2), mode);
                }
            } else {
                for raster in BLK_TO_RASTER {
                    let mode = self.intra_mode(e, arena, cur, raster)?;
                    arena.mbs[cur].intra_modes[raster] = mode;
                }
            }
        }

        arena.mbs[cur].chroma_pred_mode = e.intra_chroma_pred_mode(arena, cur)?;
        Ok(())
    }

    fn intra_mode<E: EntropyDecoder>(
        &self,
        e: &mut E,
        arena: &MbArena,
        cur: usize,
        raster: usize,
    ) -> anyhow::Result<u8> {
        let predicted = self.predicted_intra_mode(arena, cur, raster);

        Ok(match e.rem_intra_pred_mode()? {
            None => predicted,
            Some(rem) if rem < predicted => rem,
            Some(rem) => rem + 1,
        })
    }

    /// predIntra4x4PredMode / predIntra8x8PredMode of the block whose
    /// top-left 4x4 block is `raster` (8.3.1.1, 8.3.2.1).
    fn predicted_intra_mode(&self, arena: &MbArena, cur: usize, raster: usize) -> u8 {
        let (bx, by) = ((raster % 4) as i32, (raster / 4) as i32);
        let mode = |n: Option<(usize, usize)>| -> Option<u8> {
            let (n, raster) = n?;
            let mb = &arena.mbs[n];
            if n != cur && !self.intra_available(mb) {
                return None;
            }

            Some(if mb.mb_type == MbType::INxN {
                mb.intra_modes[raster]
            } else {
                2
            })
        };

        match (
            mode(arena.block(cur, bx - 1, by, 4)),
            mode(arena.block(cur, bx, by - 1, 4)),
        ) {
            (Some(a), Some(b)) => a.min(b),
            _ => 2,
        }
    }

    /// Whether the samples of an available neighbour may be used for intra
    /// prediction.
    fn intra_available(&self, mb: &MbInfo) -> bool {
        !self.pps.constrained_intra_pred_flag || mb.is_intra()
    }

    fn read_ref_idx<E: EntropyDecoder>(
        &self,
        e: &mut E,
        arena: &MbArena,
        cur: usize,
        list: usize,
        part: PartRect,
    ) -> anyhow::Result<i8> {
        let num_ref = self.num_ref_idx_active(list);
        if num_ref <= 1 {
            return Ok(0);
        }

        let ref_idx = e.ref_idx(arena, cur, list, raster(part), (num_ref - 1) as u32)?;
        if usize::from(ref_idx) >= num_ref {
            return Err(anyhow!("ref_idx_l{} {} out of range", list, ref_idx));
        }

        Ok(ref_idx as i8)
    }

    fn read_mvd<E: EntropyDecoder>(
        &mut self,
        e: &mut E,
        arena: &mut MbArena,
        cur: usize,
        list: usize,
        part: PartRect,
    ) -> anyhow::Result<()> {
        for comp in 0..2 {
            let mvd = e.mvd(arena, cur, list, raster(part), comp)?;
            self.syntax.mvd[list][raster(part)][comp] = mvd;

            let abs = mvd.unsigned_abs().min(u32::from(u16::MAX)) as u16;
            let (x, y, w, h) = part;
            for by in y..y + h {
                for bx in x..x + w {
                    arena.mbs[cur].mvd[list][by * 4 + bx][comp] = abs;
                }
            }
        }

        Ok(())
    }

    fn inter_mb_pred<E: EntropyDecoder>(
        &mut self,
        e: &mut E,
        arena: &mut MbArena,
        cur: usize,
        shape: PartShape,
        pred: [PartPred; 2],
    ) -> anyhow::Result<()> {
        let parts = shape.parts();

        for list in 0..2 {
            for (i, &part) in parts.iter().enumerate() {
                if pred[i].uses_list(list) {
                    let ref_idx = self.read_ref_idx(e, arena, cur, list, part)?;
                    fill(&mut arena.mbs[cur].ref_idx[list], part, ref_idx);
                }
            }
        }

        for list in 0..2 {
            for (i, &part) in parts.iter().enumerate() {
                if pred[i].uses_list(list) {
                    self.read_mvd(e, arena, cur, list, part)?;
                }
            }
        }

        Ok(())
    }

    /// sub_mb_pred(). Returns noSubMbPartSizeLessThan8x8Flag.
    fn sub_mb_pred<E: EntropyDecoder>(
        &mut self,
        e: &mut E,
        arena: &mut MbArena,
        cur: usize,
        mb_type: MbType,
    ) -> anyhow::Result<bool> {
        let direct_8x8_inference = self.pps.sps.direct_8x8_inference_flag;
        let mut no_sub_8x8 = true;

        for b8 in 0..4 {
            let sub = e.sub_mb_type(self.header.slice_type)?;
            if sub.is_direct() {
                arena.mbs[cur].direct |= 1 << b8;
                no_sub_8x8 &= direct_8x8_inference;
            } else if sub.shape != SubShape::S8x8 {
                no_sub_8x8 = false;
            }
            self.syntax.sub_mb_types[b8] = sub;
        }

        for list in 0..2 {
            for b8 in 0..4 {
                let uses_list = self.syntax.sub_mb_types[b8]
                    .pred
                    .map_or(false, |p| p.uses_list(list));
                if !uses_list {
                    continue;
                }

                let part = sub_part(b8, (0, 0, 2, 2));
                let ref_idx = if mb_type == MbType::P8x8Ref0 {
                    0
                } else {
                    self.read_ref_idx(e, arena, cur, list, part)?
                };
                fill(&mut arena.mbs[cur].ref_idx[list], part, ref_idx);
            }
        }

        for list in 0..2 {
            for b8 in 0..4 {
                let sub = self.syntax.sub_mb_types[b8];
                if !sub.pred.map_or(false, |p| p.uses_list(list)) {
                    continue;
                }

                for &part in sub.shape.parts() {
                    self.read_mvd(e, arena, cur, list, sub_part(b8, part))?;
                }
            }
        }

        Ok(no_sub_8x8)
    }

    /// residual() for 4:2:0 content.
    fn residual<E: EntropyDecoder>(
        &mut self,
        e: &mut E,
        arena: &mut MbArena,
        cur: usize,
    ) -> anyhow::Result<()> {
        let (mb_type, cbp, transform_8x8) = {
            let mb = &arena.mbs[cur];
            (mb.mb_type, mb.cbp, mb.transform_8x8)
        };
        let i16x16 = matches!(mb_type, MbType::I16x16 { .. });
        let syntax = &mut self.syntax;

        if i16x16 {
            let kind = BlockKind::LumaDc;
            let n = e.residual_block(arena, cur, kind, &mut syntax.luma_dc, 0, 15, 16)?;
            if n > 0 {
                arena.mbs[cur].cbf |= CBF_LUMA_DC;
            }
        }

        for b8 in 0..4 {
            if cbp & (1 << b8) == 0 {
                continue;
            }
            let blocks = b8_blocks(b8);

            if transform_8x8 && E::CABAC {
                let kind = BlockKind::Luma8x8(b8);
                let n = e.residual_block(arena, cur, kind, &mut syntax.luma_8x8[b8], 0, 63, 64)?;
                let mb = &mut arena.mbs[cur];
                for raster in blocks {
                    mb.cbf |= 1 << raster;
                    mb.total_coeff[raster] = n;
                    if n > 0 {
                        mb.nonzero |= 1 << raster;
                    }
                }
                continue;
            }

            let mut coded = false;
            for (sub, &raster) in blocks.iter().enumerate() {
                let mut coeffs = [0i32; 16];
                let n = if i16x16 {
                    let kind = BlockKind::LumaAc(raster);
                    e.residual_block(arena, cur, kind, &mut coeffs, 1, 15, 15)?
                } else {
                    let kind = BlockKind::Luma4x4(raster);
                    e.residual_block(arena, cur, kind, &mut coeffs, 0, 15, 16)?
                };

                if transform_8x8 {
                    // CAVLC codes an 8x8 block as four interleaved 4x4 blocks.
                    for (k, c) in coeffs.iter().enumerate() {
                        syntax.luma_8x8[b8][4 * k + sub] = *c;
                    }
                } else {
                    syntax.luma[raster] = coeffs;
                }

                let mb = &mut arena.mbs[cur];
                mb.total_coeff[raster] = n;
                if n > 0 {
                    mb.cbf |= 1 << raster;
                    mb.nonzero |= 1 << raster;
                    coded = true;
                }
            }

            if transform_8x8 && coded {
                for raster in blocks {
                    arena.mbs[cur].nonzero |= 1 << raster;
                }
            }
        }

        let cbp_chroma = cbp >> 4;
        if cbp_chroma != 0 {
            for c in 0..2 {
                let kind = BlockKind::ChromaDc(c);
                if e.residual_block(arena, cur, kind, &mut syntax.chroma_dc[c], 0, 3, 4)? > 0 {
                    arena.mbs[cur].cbf |= CBF_CB_DC << c;
                }
            }
        }

        if cbp_chroma == 2 {
            for c in 0..2 {
                for blk in 0..4 {
                    let n = e.residual_block(
                        arena,
                        cur,
                        BlockKind::ChromaAc(c, blk),
                        &mut syntax.chroma_ac[c][blk],
                        1,
                        15,
                        15,
                    )?;

                    let idx = 16 + 4 * c + blk;
                    let mb = &mut arena.mbs[cur];
                    mb.total_coeff[idx] = n;
                    if n > 0 {
                        mb.cbf |= 1 << idx;
                    }
                }
            }
        }

        Ok(())
    }

    fn pcm_macroblock(&self, arena: &mut MbArena, frame: &mut Frame, cur: usize) {
        let (x0, y0) = mb_origin(arena, cur);
        let pcm = &self.syntax.pcm;

        let luma = &mut frame.planes[0];
        for (j, row) in pcm[..256].chunks_exact(16).enumerate() {
            let start = (y0 + j) * luma.width + x0;
            luma.data[start..start + 16].copy_from_slice(row);
        }

        for c in 0..2 {
            let plane = &mut frame.planes[1 + c];
            let samples = &pcm[256 + 64 * c..256 + 64 * (c + 1)];
            for (j, row) in samples.chunks_exact(8).enumerate() {
                let start = (y0 / 2 + j) * plane.width + x0 / 2;
                plane.data[start..start + 8].copy_from_slice(row);
            }
        }

        let mb = &mut arena.mbs[cur];
        mb.cbp = 0x2f;
        mb.total_coeff = [16; 24];
        mb.cbf = (1 << 27) - 1;
        mb.nonzero = 0xffff;
        mb.qp_y = self.qp;
        // Deblocking filters I_PCM macroblocks with a QP of 0.
        mb.qp_c = [
            chroma_qp(0, i32::from(self.pps.chroma_qp_index_offset)),
            chroma_qp(0, i32::from(self.pps.second_chroma_qp_index_offset)),
        ];

        self.store_motion(arena, frame, cur);
    }

    /// Intra availability of the neighbours of the 4x4 (`size` 1) or 8x8
    /// (`size` 2) block whose top-left 4x4 block is `raster`.
    fn block_avail(&self, arena: &MbArena, cur: usize, raster: usize, size: i32) -> Avail {
        let (bx, by) = ((raster % 4) as i32, (raster / 4) as i32);
        let cur_blk = BLK_TO_RASTER[raster];
        let ok = |n: Option<(usize, usize)>| match n {
            Some((n, r)) if n == cur => BLK_TO_RASTER[r] < cur_blk,
            Some((n, _)) => self.intra_available(&arena.mbs[n]),
            None => false,
        };

        Avail {
            left: ok(arena.block(cur, bx - 1, by, 4)),
            top: ok(arena.block(cur, bx, by - 1, 4)),
            top_left: ok(arena.block(cur, bx - 1, by - 1, 4)),
            top_right: ok(arena.block(cur, bx + size, by - 1, 4)),
        }
    }

    fn mb_avail(&self, arena: &MbArena, cur: usize) -> Avail {
        let ok = |n: Option<usize>| n.map_or(false, |n| self.intra_available(&arena.mbs[n]));

        Avail {
            left: ok(arena.mb_a(cur)),
            top: ok(arena.mb_b(cur)),
            top_left: ok(arena.neighbour(cur, -1, -1)),
            top_right: false,
        }
    }

    fn add_luma_4x4(
        &self,
        frame: &mut Frame,
        x: usize,
        y: usize,
        raster: usize,
        mb: &MbInfo,
        dc: Option<i32>,
    ) {
        let coeffs = &self.syntax.luma[raster];
        if dc.map_or(true, |dc| dc == 0) && !has_coefficients(coeffs) {
            return;
        }

        let residual = self
            .dequantizer
            .residual_4x4(list_4x4(mb.is_intra(), 0), mb.qp_y, coeffs, dc);
        add_residual(&mut frame.planes[0], x, y, 4, &residual);
    }

    fn add_luma_8x8(&self, frame: &mut Frame, x: usize, y: usize, b8: usize, mb: &MbInfo) {
        let coeffs = &self.syntax.luma_8x8[b8];
        if !has_coefficients(coeffs) {
            return;
        }

        let residual = self.dequantizer.residual_8x8(mb.is_intra(), mb.qp_y, coeffs);
        add_residual(&mut frame.planes[0], x, y, 8, &residual);
    }

    fn add_chroma(&self, frame: &mut Frame, mb: &MbInfo, x: usize, y: usize) {
        for c in 0..2 {
            let list = list_4x4(mb.is_intra(), 1 + c);
            let qp = mb.qp_c[c];
            let dc = if has_coefficients(&self.syntax.chroma_dc[c]) {
                self.dequantizer.chroma_dc(list, qp, &self.syntax.chroma_dc[c])
            } else {
                [0; 4]
            };

            for (blk, dc) in dc.into_iter().enumerate() {
                let ac = &self.syntax.chroma_ac[c][blk];
                if dc == 0 && !has_coefficients(ac) {
                    continue;
                }

                let residual = self.dequantizer.residual_4x4(list, qp, ac, Some(dc));
                let (bx, by) = (x + (blk % 2) * 4, y + (blk / 2) * 4);
                add_residual(&mut frame.planes[1 + c], bx, by, 4, &residual);
            }
        }
    }

    fn reconstruct_intra(
        &self,
        arena: &MbArena,
        frame: &mut Frame,
        cur: usize,
    ) -> anyhow::Result<()> {
        let mb = &arena.mbs[cur];
        let (x0, y0) = mb_origin(arena, cur);

        match mb.mb_type {
            MbType::INxN if mb.transform_8x8 => {
                for (b8, raster) in B8_RASTER.into_iter().enumerate() {
                    let (x, y) = (x0 + (raster % 4) * 4, y0 + (raster / 4) * 4);
                    let avail = self.block_avail(arena, cur, raster, 2);
                    predict_8x8(&mut frame.planes[0], x, y, mb.intra_modes[raster], avail)?;
                    self.add_luma_8x8(frame, x, y, b8, mb);
                }
            }
            MbType::INxN => {
                for raster in BLK_TO_RASTER {
                    let (x, y) = (x0 + (raster % 4) * 4, y0 + (raster / 4) * 4);
                    let avail = self.block_avail(arena, cur, raster, 1);
                    predict_4x4(&mut frame.planes[0], x, y, mb.intra_modes[raster], avail)?;
                    self.add_luma_4x4(frame, x, y, raster, mb, None);
                }
            }
            MbType::I16x16 { pred_mode, .. } => {
                predict_16x16(&mut frame.planes[0], x0, y0, pred_mode, self.mb_avail(arena, cur))?;

                let dc = if has_coefficients(&self.syntax.luma_dc) {
                    self.dequantizer.luma_dc(mb.qp_y, &self.syntax.luma_dc)
                } else {
                    [0; 16]
                };
                for (raster, dc) in dc.into_iter().enumerate() {
                    let (x, y) = (x0 + (raster % 4) * 4, y0 + (raster / 4) * 4);
                    self.add_luma_4x4(frame, x, y, raster, mb, Some(dc));
                }
            }
            _ => return Err(anyhow!("{:?} is not an intra macroblock", mb.mb_type)),
        }

        let avail = self.mb_avail(arena, cur);
        for c in 0..2 {
            predict_chroma(&mut frame.planes[1 + c], x0 / 2, y0 / 2, mb.chroma_pred_mode, avail)?;
        }
        self.add_chroma(frame, mb, x0 / 2, y0 / 2);

        Ok(())
    }

    /// Direct motion of all the blocks of `cur` (8.4.1.2).
    fn direct_motion(&self, arena: &MbArena, cur: usize) -> anyhow::Result<[BlockMotion; 16]> {
        let col = self.ref_lists[1]
            .first()
            .and_then(|r| r.frame.as_deref())
            .ok_or_else(|| anyhow!("direct prediction without a list 1 reference"))?;

        let ctx = DirectContext {
            col: &col.motion,
            list0: self.ref_lists[0],
            list1: self.ref_lists[1],
            cur_poc: self.cur_poc,
            direct_8x8_inference: self.pps.sps.direct_8x8_inference_flag,
        };

        Ok(if self.header.direct_spatial_mv_pred_flag {
            ctx.spatial(arena, cur)
        } else {
            ctx.temporal(arena, cur)
        })
    }

    fn set_mv(&self, arena: &mut MbArena, cur: usize, list: usize, part: PartRect, mb_part: bool) {
        let r = raster(part);
        let ref_idx = arena.mbs[cur].ref_idx[list][r];
        let mvp = predict(arena, cur, list, ref_idx, part, mb_part);
        let mvd = self.syntax.mvd[list][r];
        let mv = Mv::new(i32::from(mvp.x) + mvd[0], i32::from(mvp.y) + mvd[1]);

        fill(&mut arena.mbs[cur].mv[list], part, mv);
    }

    /// Derives the motion vectors of every partition of `cur` and, for
    /// skipped and direct ones, their reference indices.
    fn derive_motion(&self, arena: &mut MbArena, cur: usize) -> anyhow::Result<()> {
        let set_direct = |mb: &mut MbInfo, direct: &[BlockMotion; 16], raster: usize| {
            for list in 0..2 {
                mb.ref_idx[list][raster] = direct[raster].ref_idx[list];
                mb.mv[list][raster] = direct[raster].mv[list];
            }
        };

        match arena.mbs[cur].mb_type {
            MbType::PSkip => {
                let mv = p_skip(arena, cur);
                let mb = &mut arena.mbs[cur];
                mb.ref_idx = [[0; 16], [-1; 16]];
                mb.mv[0] = [mv; 16];
            }
            MbType::BSkip | MbType::BDirect16x16 => {
                let direct = self.direct_motion(arena, cur)?;
                for raster in 0..16 {
                    set_direct(&mut arena.mbs[cur], &direct, raster);
                }
            }
            MbType::Inter { shape, pred } => {
                for (i, &part) in shape.parts().iter().enumerate() {
                    for list in 0..2 {
                        if pred[i].uses_list(list) {
                            self.set_mv(arena, cur, list, part, true);
                        }
                    }
                }
            }
            MbType::P8x8 | MbType::P8x8Ref0 | MbType::B8x8 => {
                let direct = if arena.mbs[cur].direct != 0 {
                    Some(self.direct_motion(arena, cur)?)
                } else {
                    None
                };

                for b8 in 0..4 {
                    let sub = self.syntax.sub_mb_types[b8];
                    match (sub.pred, &direct) {
                        (Some(pred), _) => {
                            for &part in sub.shape.parts() {
                                for list in 0..2 {
                                    if pred.uses_list(list) {
                                        self.set_mv(arena, cur, list, sub_part(b8, part), false);
                                    }
                                }
                            }
                        }
                        (None, Some(direct)) => {
                            for raster in b8_blocks(b8) {
                                set_direct(&mut arena.mbs[cur], direct, raster);
                            }
                        }
                        (None, None) => {
                            return Err(anyhow!("direct sub-macroblock without direct motion"))
                        }
                    }
                }
            }
            MbType::INxN | MbType::I16x16 { .. } | MbType::IPcm => (),
        }

        Ok(())
    }

    /// Partitions of `mb` that share the same motion, in 4x4 block units.
    fn prediction_units(&self, mb: &MbInfo) -> Vec<PartRect> {
        let direct_units = |b8: usize| -> Vec<PartRect> {
            if self.pps.sps.direct_8x8_inference_flag {
                vec![sub_part(b8, (0, 0, 2, 2))]
            } else {
                SubShape::S4x4.parts().iter().map(|&p| sub_part(b8, p)).collect()
            }
        };

        match mb.mb_type {
            MbType::Inter { shape, .. } => shape.parts().to_vec(),
            MbType::PSkip => vec![(0, 0, 4, 4)],
            MbType::BSkip | MbType::BDirect16x16 => (0..4).flat_map(direct_units).collect(),
            MbType::P8x8 | MbType::P8x8Ref0 | MbType::B8x8 => (0..4)
                .flat_map(|b8| {
                    let sub = self.syntax.sub_mb_types[b8];
                    if sub.is_direct() {
                        direct_units(b8)
                    } else {
                        sub.shape.parts().iter().map(|&p| sub_part(b8, p)).collect()
                    }
                })
                .collect(),
            MbType::INxN | MbType::I16x16 { .. } | MbType::IPcm => Vec::new(),
        }
    }

    fn reference(&self, list: usize, ref_idx: i8) -> anyhow::Result<&'a Frame> {
        let refs: &'a [RefPicture] = self.ref_lists[list];
        usize::try_from(ref_idx)
            .ok()
            .and_then(|i| refs.get(i))
            .and_then(|r| r.frame.as_deref())
            .ok_or_else(|| anyhow!("reference {} of list {} is not available", ref_idx, list))
    }

    /// Implicit bi-predictive weights w0 and w1 (8-201 to 8-203).
    fn implicit_weights(&self, ref_idx: [i8; 2]) -> (i32, i32) {
        let pic = |list: usize| {
            usize::try_from(ref_idx[list])
                .ok()
                .and_then(|i| self.ref_lists[list].get(i))
        };
        let (Some(pic0), Some(pic1)) = (pic(0), pic(1)) else {
            return (32, 32);
        };

        let tb = (self.cur_poc - pic0.poc).clamp(-128, 127);
        let td = (pic1.poc - pic0.poc).clamp(-128, 127);
        if pic0.long_term || pic1.long_term || td == 0 {
            return (32, 32);
        }

        let w1 = direct_scale_factor(tb, td) >> 2;
        if !(-64..=128).contains(&w1) {
            (32, 32)
        } else {
            (64 - w1, w1)
        }
    }

    /// Weighting of colour component `plane` for a block predicted from
    /// `ref_idx`.
    fn weighting(&self, plane: usize, ref_idx: [i8; 2]) -> Weighting {
        match self.weight_mode {
            WeightMode::Default => Weighting::Default,
            WeightMode::Explicit => {
                let t = &self.header.pred_weight_table;
                let weight = |list: usize| {
                    let i = ref_idx[list].max(0) as usize;
                    let (w, o) = match (list, plane) {
                        (0, 0) => (t.luma_weight_l0[i], t.luma_offset_l0[i]),
                        (_, 0) => (t.luma_weight_l1[i], t.luma_offset_l1[i]),
                        (0, c) => (t.chroma_weight_l0[i][c - 1], t.chroma_offset_l0[i][c - 1]),
                        (_, c) => (t.chroma_weight_l1[i][c - 1], t.chroma_offset_l1[i][c - 1]),
                    };
                    Weight {
                        w: i32::from(w),
                        o: i32::from(o),
                    }
                };
                let log_wd = if plane == 0 {
                    t.luma_log2_weight_denom
                } else {
                    t.chroma_log2_weight_denom
                };

                Weighting::Weighted {
                    log_wd: i32::from(log_wd),
                    w0: weight(0),
                    w1: weight(1),
                }
            }
            WeightMode::Implicit if ref_idx[0] >= 0 && ref_idx[1] >= 0 => {
                let (w0, w1) = self.implicit_weights(ref_idx);
                Weighting::Weighted {
                    log_wd: 5,
                    w0: Weight { w: w0, o: 0 },
                    w1: Weight { w: w1, o: 0 },
                }
            }
            WeightMode::Implicit => Weighting::Default,
        }
    }

    /// Motion compensated prediction of the `w`x`h` luma block at (`x`, `y`)
    /// and of its chroma blocks.
    fn predict_block(
        &self,
        frame: &mut Frame,
        x: usize,
        y: usize,
        w: usize,
        h: usize,
        motion: BlockMotion,
    ) -> anyhow::Result<()> {
        let mut luma = [[0u8; 256]; 2];
        let mut chroma = [[[0u8; 64]; 2]; 2];
        let mut used = [false; 2];

        for list in 0..2 {
            let ref_idx = motion.ref_idx[list];
            if ref_idx < 0 {
                continue;
            }

            let reference = self.reference(list, ref_idx)?;
            let mv = motion.mv[list];
            luma_block(&reference.planes[0], x as i32, y as i32, w, h, mv, &mut luma[list]);
            for c in 0..2 {
                chroma_block(
                    &reference.planes[1 + c],
                    (x / 2) as i32,
                    (y / 2) as i32,
                    w / 2,
                    h / 2,
                    mv,
                    &mut chroma[c][list],
                );
            }
            used[list] = true;
        }

        if !used[0] && !used[1] {
            return Err(anyhow!("inter block at ({}, {}) without a reference", x, y));
        }

        combine(
            &mut frame.planes[0],
            x,
            y,
            w,
            h,
            used[0].then_some(&luma[0][..]),
            used[1].then_some(&luma[1][..]),
            self.weighting(0, motion.ref_idx),
        );
        for c in 0..2 {
            combine(
                &mut frame.planes[1 + c],
                x / 2,
                y / 2,
                w / 2,
                h / 2,
                used[0].then_some(&chroma[c][0][..]),
                used[1].then_some(&chroma[c][1][..]),
                self.weighting(1 + c, motion.ref_idx),
            );
        }

        Ok(())
    }

    fn reconstruct_inter(
        &self,
        arena: &MbArena,
        frame: &mut Frame,
        cur: usize,
    ) -> anyhow::Result<()> {
        let mb = &arena.mbs[cur];
        let (x0, y0) = mb_origin(arena, cur);

        for part in self.prediction_units(mb) {
            let r = raster(part);
            let motion = BlockMotion {
                ref_idx: [mb.ref_idx[0][r], mb.ref_idx[1][r]],
                mv: [mb.mv[0][r], mb.mv[1][r]],
            };
            let (x, y) = (x0 + part.0 * 4, y0 + part.1 * 4);
            self.predict_block(frame, x, y, part.2 * 4, part.3 * 4, motion)?;
        }

        if mb.transform_8x8 {
            for (b8, raster) in B8_RASTER.into_iter().enumerate() {
                self.add_luma_8x8(frame, x0 + (raster % 4) * 4, y0 + (raster / 4) * 4, b8, mb);
            }
        } else {
            for raster in 0..16 {
                let (x, y) = (x0 + (raster % 4) * 4, y0 + (raster / 4) * 4);
                self.add_luma_4x4(frame, x, y, raster, mb, None);
            }
        }
        self.add_chroma(frame, mb, x0 / 2, y0 / 2);

        Ok(())
    }

    /// Saves the motion of `cur` in the motion field of the frame.
    fn store_motion(&self, arena: &MbArena, frame: &mut Frame, cur: usize) {
        let mb = &arena.mbs[cur];
        let (mb_x, mb_y) = (cur % arena.width, cur / arena.width);
        let intra = mb.is_intra();

        for raster in 0..16 {
            let idx = frame.motion.index(mb_x * 4 + raster % 4, mb_y * 4 + raster / 4);
            for list in 0..2 {
                let ref_idx = if intra { -1 } else { mb.ref_idx[list][raster] };
                let ref_id = usize::try_from(ref_idx)
                    .ok()
                    .and_then(|i| self.ref_lists[list].get(i))
                    .map_or(NO_FRAME, |r| r.id());

                frame.motion.ref_idx[idx][list] = ref_idx;
                frame.motion.mv[idx][list] = if ref_idx >= 0 {
                    mb.mv[list][raster]
                } else {
                    Mv::ZERO
                };
                frame.motion.ref_id[idx][list] = ref_id;
            }
        }
    }
}

/// Reconstructs every macroblock of `frame` that no slice decoded as a
/// skipped one: the co-located samples of `reference` are copied, or the
/// macroblock is made mid-grey when there is no usable reference. Returns the
/// number of concealed macroblocks.
pub fn conceal_missing(arena: &mut MbArena, frame: &mut Frame, reference: Option<&Frame>) -> usize {
    let reference = reference
        .filter(|r| r.width_in_mbs == frame.width_in_mbs && r.height_in_mbs == frame.height_in_mbs);
    let mut concealed = 0;

    for addr in 0..arena.len() {
        if arena.is_decoded(addr) {
            continue;
        }

        let (x0, y0) = mb_origin(arena, addr);
        for (p, (x, y, size)) in [(x0, y0, 16), (x0 / 2, y0 / 2, 8), (x0 / 2, y0 / 2, 8)]
            .into_iter()
            .enumerate()
        {
            let plane = &mut frame.planes[p];
            for j in 0..size {
                let start = (y + j) * plane.width + x;
                let dst = &mut plane.data[start..start + size];
                match reference {
                    Some(r) => dst.copy_from_slice(&r.planes[p].data[start..start + size]),
                    None => dst.fill(128),
                }
            }
        }

        for raster in 0..16 {
            let idx = frame.motion.index(
                (addr % arena.width) * 4 + raster % 4,
                (addr / arena.width) * 4 + raster / 4,
            );
            frame.motion.ref_idx[idx] = [-1; 2];
            frame.motion.mv[idx] = [Mv::ZERO; 2];
            frame.motion.ref_id[idx] = [NO_FRAME; 2];
        }

        let mb = &mut arena.mbs[addr];
        mb.start(SLICE_NONE);
        mb.skip = true;
        mb.concealed = true;
        concealed += 1;
    }

    concealed
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::codec::h264::parser::PpsBuilder;
    use crate::codec::h264::parser::PredWeightTable;
    use crate::codec::h264::parser::SliceHeaderBuilder;
    use crate::codec::h264::parser::SpsBuilder;

    fn pps(weighted_bipred_idc: u8, constrained_intra_pred: bool) -> Rc<Pps> {
        let sps = SpsBuilder::new().resolution(32, 32).build();
        PpsBuilder::new(sps)
            .weighted_bipred_idc(weighted_bipred_idc)
            .constrained_intra_pred_flag(constrained_intra_pred)
            .build()
    }

    fn reference(id: u64, poc: i32, long_term: bool) -> RefPicture {
        RefPicture {
            frame: Some(Rc::new(Frame::new(id, 2, 2))),
            poc,
            long_term,
        }
    }

    /// A 2x2 picture where macroblocks 0 to 2 are decoded in slice 0.
    fn arena() -> MbArena {
        let mut arena = MbArena::new(2, 2);
        for mb in arena.mbs.iter_mut() {
            mb.start(0);
        }
        arena
    }

    #[test]
    fn predicted_intra_modes() {
        let pps = pps(0, false);
        let header = SliceHeaderBuilder::new(&pps).slice_type(SliceType::I).build();
        let dequantizer = Dequantizer::new(&pps);
        let decoder = SliceDecoder::new(&header, &pps, 0, [&[], &[]], 0, &dequantizer);

        let mut arena = arena();
        arena.mbs[1].mb_type = MbType::INxN;
        arena.mbs[1].intra_modes = [4; 16];
        arena.mbs[2].mb_type = MbType::INxN;
        arena.mbs[2].intra_modes = [6; 16];
        arena.mbs[3].mb_type = MbType::INxN;

        // Top row: the block above is outside the picture.
        assert_eq!(decoder.predicted_intra_mode(&arena, 1, 0), 2);
        // Left is macroblock 2, above is macroblock 1.
        assert_eq!(decoder.predicted_intra_mode(&arena, 3, 0), 4);
        arena.mbs[3].intra_modes[0] = 1;
        assert_eq!(decoder.predicted_intra_mode(&arena, 3, 1), 1);
        // An intra 16x16 neighbour counts as DC.
        arena.mbs[1].mb_type = MbType::I16x16 {
            pred_mode: 0,
            cbp_luma: 0,
            cbp_chroma: 0,
        };
        assert_eq!(decoder.predicted_intra_mode(&arena, 3, 0), 2);
    }

    #[test]
    fn constrained_intra_prediction() {
        let pps = pps(0, true);
        let header = SliceHeaderBuilder::new(&pps).slice_type(SliceType::P).build();
        let dequantizer = Dequantizer::new(&pps);
        let decoder = SliceDecoder::new(&header, &pps, 0, [&[], &[]], 0, &dequantizer);

        let mut arena = arena();
        arena.mbs[1].mb_type = MbType::INxN;
        arena.mbs[1].intra_modes = [0; 16];
        arena.mbs[2].mb_type = MbType::PSkip;
        arena.mbs[3].mb_type = MbType::INxN;

        // The inter macroblock on the left is not available.
        assert_eq!(decoder.predicted_intra_mode(&arena, 3, 0), 2);
        let avail = decoder.mb_avail(&arena, 3);
        assert!(!avail.left);
        assert!(avail.top);
        assert!(!avail.top_left);
    }

    #[test]
    fn intra_block_availability() {
        let pps = pps(0, false);
        let header = SliceHeaderBuilder::new(&pps).slice_type(SliceType::I).build();
        let dequantizer = Dequantizer::new(&pps);
        let decoder = SliceDecoder::new(&header, &pps, 0, [&[], &[]], 0, &dequantizer);
        let arena = arena();

        // Block 3 (raster 5): its top-right neighbour is decoded later.
        let avail = decoder.block_avail(&arena, 3, 5, 1);
        assert!(avail.left && avail.top && avail.top_left);
        assert!(!avail.top_right);

        // Block 5 (raster 3) takes its top-right samples from macroblock C,
        // which is outside the picture for the last column.
        let avail = decoder.block_avail(&arena, 3, 3, 1);
        assert!(avail.top && !avail.top_right);
        // Macroblock 2 has macroblock 1 above right.
        let avail = decoder.block_avail(&arena, 2, 3, 1);
        assert!(avail.top_right);

        // The third 8x8 block sees the second one above right.
        let avail = decoder.block_avail(&arena, 3, 8, 2);
        assert!(avail.top_right);
        let avail = decoder.block_avail(&arena, 3, 10, 2);
        assert!(!avail.top_right);
    }

    #[test]
    fn implicit_weights() {
        let pps = pps(2, false);
        let header = SliceHeaderBuilder::new(&pps).slice_type(SliceType::B).build();
        let dequantizer = Dequantizer::new(&pps);
        let list0 = [reference(1, 0, false), reference(3, 0, true)];
        let list1 = [reference(2, 8, false)];

        let decoder = SliceDecoder::new(&header, &pps, 0, [&list0, &list1], 2, &dequantizer);
        assert_eq!(decoder.implicit_weights([0, 0]), (48, 16));
        // Long term references are not scaled.
        assert_eq!(decoder.implicit_weights([1, 0]), (32, 32));
        assert_eq!(
            decoder.weighting(1, [0, 0]),
            Weighting::Weighted {
                log_wd: 5,
                w0: Weight { w: 48, o: 0 },
                w1: Weight { w: 16, o: 0 },
            }
        );
        // Single list prediction is not weighted.
        assert_eq!(decoder.weighting(0, [0, -1]), Weighting::Default);

        let decoder = SliceDecoder::new(&header, &pps, 0, [&list0, &list1], 4, &dequantizer);
        assert_eq!(decoder.implicit_weights([0, 0]), (32, 32));

        // Too far out: DistScaleFactor >> 2 exceeds 128.
        let decoder = SliceDecoder::new(&header, &pps, 0, [&list0, &list1], 40, &dequantizer);
        assert_eq!(decoder.implicit_weights([0, 0]), (32, 32));
    }

    #[test]
    fn explicit_weights() {
        let sps = SpsBuilder::new().resolution(32, 32).build();
        let pps = PpsBuilder::new(sps).weighted_pred_flag(true).build();
        let mut table = PredWeightTable {
            luma_log2_weight_denom: 6,
            chroma_log2_weight_denom: 4,
            ..Default::default()
        };
        table.luma_weight_l0[1] = 80;
        table.luma_offset_l0[1] = -3;
        table.chroma_weight_l0[1] = [12, 20];
        table.chroma_offset_l0[1] = [1, 2];
        let mut header = SliceHeaderBuilder::new(&pps)
            .slice_type(SliceType::P)
            .build();
        header.pred_weight_table = table;
        let dequantizer = Dequantizer::new(&pps);
        let decoder = SliceDecoder::new(&header, &pps, 0, [&[], &[]], 0, &dequantizer);

        match decoder.weighting(0, [1, -1]) {
            Weighting::Weighted { log_wd, w0, .. } => {
                assert_eq!(log_wd, 6);
                assert_eq!(w0, Weight { w: 80, o: -3 });
            }
            w => panic!("unexpected weighting {:?}", w),
        }
        match decoder.weighting(2, [1, -1]) {
            Weighting::Weighted { log_wd, w0, .. } => {
                assert_eq!(log_wd, 4);
                assert_eq!(w0, Weight { w: 20, o: 2 });
            }
            w => panic!("unexpected weighting {:?}", w),
        }
    }

    #[test]
    fn missing_reference_is_an_error() {
        let pps = pps(0, false);
        let header = SliceHeaderBuilder::new(&pps).slice_type(SliceType::P).build();
        let dequantizer = Dequantizer::new(&pps);
        let gap = [RefPicture {
            frame: None,
            poc: 0,
            long_term: false,
        }];
        let decoder = SliceDecoder::new(&header, &pps, 0, [&gap, &[]], 0, &dequantizer);

        assert!(decoder.reference(0, 0).is_err());
        assert!(decoder.reference(0, 1).is_err());

        let mut frame = Frame::new(10, 2, 2);
        let motion = BlockMotion {
            ref_idx: [0, -1],
            mv: [Mv::ZERO; 2],
        };
        assert!(decoder.predict_block(&mut frame, 0, 0, 16, 16, motion).is_err());
    }

    #[test]
    fn concealment_copies_the_reference() {
        let mut arena = MbArena::new(2, 1);
        arena.mbs[0].start(0);
        let mut frame = Frame::new(2, 2, 1);
        frame.planes[0].data.fill(50);

        let mut reference = Frame::new(1, 2, 1);
        for plane in reference.planes.iter_mut() {
            plane.data.fill(77);
        }

        assert_eq!(conceal_missing(&mut arena, &mut frame, Some(&reference)), 1);
        assert!(arena.mbs[1].concealed);
        assert!(!arena.is_decoded(1));
        // The decoded macroblock is left alone.
        assert_eq!(frame.planes[0].at(15, 15), 50);
        assert_eq!(frame.planes[0].at(16, 0), 77);
        assert_eq!(frame.planes[2].at(8, 7), 77);

        // Without a reference the macroblock is mid-grey.
        let mut arena = MbArena::new(2, 1);
        let mut frame = Frame::new(3, 2, 1);
        frame.planes[1].data.fill(0);
        assert_eq!(conceal_missing(&mut arena, &mut frame, None), 2);
        assert!(frame.planes[1].data.iter().all(|s| *s == 128));
    }
}
