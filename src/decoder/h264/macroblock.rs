// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Macroblock types and the per-picture macroblock state that later
//! macroblocks predict from.

use anyhow::anyhow;

use crate::decoder::h264::frame::Mv;

/// Maps a 4x4 luma block index (decoding order) to its raster position in
/// the macroblock, and back.
pub const BLK_TO_RASTER: [usize; 16] = [0, 1, 4, 5, 2, 3, 6, 7, 8, 9, 12, 13, 10, 11, 14, 15];

/// `slice_num` of a macroblock that has not been decoded in this picture.
pub const SLICE_NONE: u32 = u32::MAX;

/// Table 8-15: QPc as a function of qPi, for qPi >= 30.
const QPC_TABLE: [i32; 22] = [
    29, 30, 31, 32, 32, 33, 34, 34, 35, 35, 36, 36, 37, 37, 37, 38, 38, 38, 39, 39, 39, 39,
];

/// Derives QPc from QPy and a chroma QP offset.
pub fn chroma_qp(qp_y: i32, offset: i32) -> i32 {
    let qpi = (qp_y + offset).clamp(0, 51);
    if qpi < 30 {
        qpi
    } else {
        QPC_TABLE[(qpi - 30) as usize]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartPred {
    L0,
    L1,
    Bi,
}

impl PartPred {
    pub fn uses_list(self, list: usize) -> bool {
        match self {
            PartPred::L0 => list == 0,
            PartPred::L1 => list == 1,
            PartPred::Bi => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartShape {
    P16x16,
    P16x8,
    P8x16,
}

/// Geometry of a partition, in 4x4 block units: x, y, width, height.
pub type PartRect = (usize, usize, usize, usize);

impl PartShape {
    pub fn parts(self) -> &'static [PartRect] {
        match self {
            PartShape::P16x16 => &[(0, 0, 4, 4)],
            PartShape::P16x8 => &[(0, 0, 4, 2), (0, 2, 4, 2)],
            PartShape::P8x16 => &[(0, 0, 2, 4), (2, 0, 2, 4)],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MbType {
    /// I_4x4 or I_8x8, depending on `transform_size_8x8_flag`.
    INxN,
    I16x16 {
        pred_mode: u8,
        cbp_luma: u8,
        cbp_chroma: u8,
    },
    IPcm,
    Inter {
        shape: PartShape,
        pred: [PartPred; 2],
    },
    P8x8,
    P8x8Ref0,
    B8x8,
    #[default]
    PSkip,
    BSkip,
    BDirect16x16,
}

/// Pred modes of the 16x8 and 8x16 B macroblock types, in mb_type order.
const B_PART_PREDS: [[PartPred; 2]; 9] = [
    [PartPred::L0, PartPred::L0],
    [PartPred::L1, PartPred::L1],
    [PartPred::L0, PartPred::L1],
    [PartPred::L1, PartPred::L0],
    [PartPred::L0, PartPred::Bi],
    [PartPred::L1, PartPred::Bi],
    [PartPred::Bi, PartPred::L0],
    [PartPred::Bi, PartPred::L1],
    [PartPred::Bi, PartPred::Bi],
];

impl MbType {
    /// Table 7-11.
    pub fn from_i(mb_type: u32) -> anyhow::Result<Self> {
        match mb_type {
            0 => Ok(MbType::INxN),
            1..=24 => {
                let t = (mb_type - 1) as u8;
                Ok(MbType::I16x16 {
                    pred_mode: t % 4,
                    cbp_chroma: (t / 4) % 3,
                    cbp_luma: if t >= 12 { 15 } else { 0 },
                })
            }
            25 => Ok(MbType::IPcm),
            _ => Err(anyhow!("invalid I mb_type {}", mb_type)),
        }
    }

    /// Table 7-13, followed by the intra types.
    pub fn from_p(mb_type: u32) -> anyhow::Result<Self> {
        let pred = [PartPred::L0, PartPred::L0];
        match mb_type {
            0 => Ok(MbType::Inter {
                shape: PartShape::P16x16,
                pred,
            }),
            1 => Ok(MbType::Inter {
                shape: PartShape::P16x8,
                pred,
            }),
            2 => Ok(MbType::Inter {
                shape: PartShape::P8x16,
                pred,
            }),
            3 => Ok(MbType::P8x8),
            4 => Ok(MbType::P8x8Ref0),
            _ => Self::from_i(mb_type - 5),
        }
    }

    /// Table 7-14, followed by the intra types.
    pub fn from_b(mb_type: u32) -> anyhow::Result<Self> {
        match mb_type {
            0 => Ok(MbType::BDirect16x16),
            1..=3 => {
                let pred = [PartPred::L0, PartPred::L1, PartPred::Bi][mb_type as usize - 1];
                Ok(MbType::Inter {
                    shape: PartShape::P16x16,
                    pred: [pred, pred],
                })
            }
            4..=21 => {
                let t = (mb_type - 4) as usize;
                let shape = if t % 2 == 0 {
                    PartShape::P16x8
                } else {
                    PartShape::P8x16
                };
                Ok(MbType::Inter {
                    shape,
                    pred: B_PART_PREDS[t / 2],
                })
            }
            22 => Ok(MbType::B8x8),
            _ => Self::from_i(mb_type - 23),
        }
    }

    pub fn is_intra(&self) -> bool {
        matches!(self, MbType::INxN | MbType::I16x16 { .. } | MbType::IPcm)
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, MbType::PSkip | MbType::BSkip)
    }

    pub fn is_sub_mb(&self) -> bool {
        matches!(self, MbType::P8x8 | MbType::P8x8Ref0 | MbType::B8x8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubShape {
    S8x8,
    S8x4,
    S4x8,
    S4x4,
}

impl SubShape {
    pub fn parts(self) -> &'static [PartRect] {
        match self {
            SubShape::S8x8 => &[(0, 0, 2, 2)],
            SubShape::S8x4 => &[(0, 0, 2, 1), (0, 1, 2, 1)],
            SubShape::S4x8 => &[(0, 0, 1, 2), (1, 0, 1, 2)],
            SubShape::S4x4 => &[(0, 0, 1, 1), (1, 0, 1, 1), (0, 1, 1, 1), (1, 1, 1, 1)],
        }
    }
}

/// A sub-macroblock type. `pred` is `None` for B_Direct_8x8.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubMbType {
    pub pred: Option<PartPred>,
    pub shape: SubShape,
}

impl Default for SubMbType {
    fn default() -> Self {
        SubMbType {
            pred: Some(PartPred::L0),
            shape: SubShape::S8x8,
        }
    }
}

impl SubMbType {
    /// Table 7-17.
    pub fn from_p(sub_mb_type: u32) -> anyhow::Result<Self> {
        let shape = match sub_mb_type {
            0 => SubShape::S8x8,
            1 => SubShape::S8x4,
            2 => SubShape::S4x8,
            3 => SubShape::S4x4,
            _ => return Err(anyhow!("invalid P sub_mb_type {}", sub_mb_type)),
        };

        Ok(SubMbType {
            pred: Some(PartPred::L0),
            shape,
        })
    }

    /// Table 7-18.
    pub fn from_b(sub_mb_type: u32) -> anyhow::Result<Self> {
        use PartPred::*;
        use SubShape::*;

        let (pred, shape) = match sub_mb_type {
            0 => (None, S4x4),
            1 => (Some(L0), S8x8),
            2 => (Some(L1), S8x8),
            3 => (Some(Bi), S8x8),
            4 => (Some(L0), S8x4),
            5 => (Some(L0), S4x8),
            6 => (Some(L1), S8x4),
            7 => (Some(L1), S4x8),
            8 => (Some(Bi), S8x4),
            9 => (Some(Bi), S4x8),
            10 => (Some(L0), S4x4),
            11 => (Some(L1), S4x4),
            12 => (Some(Bi), S4x4),
            _ => return Err(anyhow!("invalid B sub_mb_type {}", sub_mb_type)),
        };

        Ok(SubMbType { pred, shape })
    }

    pub fn is_direct(&self) -> bool {
        self.pred.is_none()
    }
}

/// Everything later macroblocks need to know about a decoded macroblock.
#[derive(Clone, Debug)]
pub struct MbInfo {
    pub slice_num: u32,
    pub mb_type: MbType,
    pub transform_8x8: bool,
    pub qp_y: i32,
    /// QPc of Cb and Cr, as used by deblocking.
    pub qp_c: [i32; 2],
    /// CodedBlockPatternLuma in the low nibble, CodedBlockPatternChroma above.
    pub cbp: u8,
    /// Intra 4x4/8x8 prediction modes, per 4x4 block in raster order.
    pub intra_modes: [u8; 16],
    pub chroma_pred_mode: u8,
    /// TotalCoeff() per 4x4 block: luma in raster order, then Cb and Cr.
    pub total_coeff: [u8; 24],
    /// coded_block_flag bits: luma 0-15, Cb AC 16-19, Cr AC 20-23, luma DC
    /// 24, Cb DC 25 and Cr DC 26.
    pub cbf: u32,
    /// Luma 4x4 blocks holding non-zero coefficients, in raster order.
    pub nonzero: u16,
    /// Absolute mvd components, per 4x4 block and list.
    pub mvd: [[[u16; 2]; 16]; 2],
    pub ref_idx: [[i8; 16]; 2],
    pub mv: [[Mv; 16]; 2],
    /// 8x8 blocks predicted in direct mode.
    pub direct: u8,
    pub skip: bool,
    pub concealed: bool,
}

pub const CBF_LUMA_DC: u32 = 1 << 24;
pub const CBF_CB_DC: u32 = 1 << 25;

impl Default for MbInfo {
    fn default() -> Self {
        Self {
            slice_num: SLICE_NONE,
            mb_type: Default::default(),
            transform_8x8: false,
            qp_y: 0,
            qp_c: [0; 2],
            cbp: 0,
            intra_modes: [2; 16],
            chroma_pred_mode: 0,
            total_coeff: [0; 24],
            cbf: 0,
            nonzero: 0,
            mvd: [[[0; 2]; 16]; 2],
            ref_idx: [[-1; 16]; 2],
            mv: [[Mv::ZERO; 16]; 2],
            direct: 0,
            skip: false,
            concealed: false,
        }
    }
}

impl MbInfo {
    /// Resets the state before `slice_num` starts decoding this macroblock.
    pub fn start(&mut self, slice_num: u32) {
        *self = MbInfo {
            slice_num,
            ..Default::default()
        };
    }

    pub fn is_intra(&self) -> bool {
        self.mb_type.is_intra() && !self.concealed
    }

    pub fn cbp_luma(&self) -> u8 {
        self.cbp & 0xf
    }

    pub fn cbp_chroma(&self) -> u8 {
        self.cbp >> 4
    }
}

/// Deblocking parameters of a slice.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeblockParams {
    pub disable_deblocking_filter_idc: u8,
    pub filter_offset_a: i32,
    pub filter_offset_b: i32,
}

/// Macroblock state of the picture being decoded. Allocated once per
/// resolution and reset for every picture.
pub struct MbArena {
    pub width: usize,
    pub height: usize,
    pub mbs: Vec<MbInfo>,
    /// Indexed by `slice_num`.
    pub slices: Vec<DeblockParams>,
}

impl MbArena {
    pub fn new(width_in_mbs: usize, height_in_mbs: usize) -> Self {
        Self {
            width: width_in_mbs,
            height: height_in_mbs,
            mbs: vec![Default::default(); width_in_mbs * height_in_mbs],
            slices: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        for mb in self.mbs.iter_mut() {
            mb.slice_num = SLICE_NONE;
            mb.concealed = false;
        }
        self.slices.clear();
    }

    pub fn len(&self) -> usize {
        self.mbs.len()
    }

    pub fn is_decoded(&self, addr: usize) -> bool {
        self.mbs[addr].slice_num != SLICE_NONE
    }

    /// 6.4.8: a macroblock is available to `cur` if it has been decoded and
    /// belongs to the same slice.
    fn available(&self, cur: usize, n: usize) -> Option<usize> {
        if n < cur && self.mbs[n].slice_num == self.mbs[cur].slice_num {
            Some(n)
        } else {
            None
        }
    }

    /// Address of the macroblock at offset (`dx`, `dy`) from `cur`, if
    /// available. `dy` is 0 or -1.
    pub fn neighbour(&self, cur: usize, dx: i32, dy: i32) -> Option<usize> {
        let x = (cur % self.width) as i32 + dx;
        let y = (cur / self.width) as i32 + dy;

        if x < 0 || y < 0 || x >= self.width as i32 || dy > 0 {
            return None;
        }

        self.available(cur, y as usize * self.width + x as usize)
    }

    pub fn mb_a(&self, cur: usize) -> Option<usize> {
        self.neighbour(cur, -1, 0)
    }

    pub fn mb_b(&self, cur: usize) -> Option<usize> {
        self.neighbour(cur, 0, -1)
    }

    /// Locates the block at (`bx`, `by`) relative to the top-left block of
    /// `cur`, for a macroblock `size` blocks wide (4 for luma 4x4 blocks, 2
    /// for chroma 4x4 blocks). Returns the macroblock address and the raster
    /// index of the block in it. Blocks of `cur` itself are always returned;
    /// whether they are decoded yet is up to the caller.
    pub fn block(&self, cur: usize, bx: i32, by: i32, size: i32) -> Option<(usize, usize)> {
        let (dx, nx) = if bx < 0 {
            (-1, bx + size)
        } else if bx >= size {
            (1, bx - size)
        } else {
            (0, bx)
        };
        let (dy, ny) = if by < 0 { (-1, by + size) } else { (0, by) };

        if by >= size || (dx == 1 && dy == 0) {
            return None;
        }

        let n = if dx == 0 && dy == 0 {
            cur
        } else {
            self.neighbour(cur, dx, dy)?
        };

        Some((n, (ny * size + nx) as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blk_to_raster_is_an_involution() {
        for i in 0..16 {
            assert_eq!(BLK_TO_RASTER[BLK_TO_RASTER[i]], i);
        }
    }

    #[test]
    fn chroma_qp_mapping() {
        assert_eq!(chroma_qp(20, 0), 20);
        assert_eq!(chroma_qp(30, 0), 29);
        assert_eq!(chroma_qp(51, 0), 39);
        assert_eq!(chroma_qp(51, 12), 39);
        assert_eq!(chroma_qp(0, -12), 0);
        assert_eq!(chroma_qp(40, -2), 35);
    }

    #[test]
    fn mb_type_tables() {
        assert_eq!(MbType::from_i(0).unwrap(), MbType::INxN);
        assert_eq!(
            MbType::from_i(1).unwrap(),
            MbType::I16x16 {
                pred_mode: 0,
                cbp_luma: 0,
                cbp_chroma: 0
            }
        );
        assert_eq!(
            MbType::from_i(24).unwrap(),
            MbType::I16x16 {
                pred_mode: 3,
                cbp_luma: 15,
                cbp_chroma: 2
            }
        );
        assert_eq!(MbType::from_i(25).unwrap(), MbType::IPcm);
        assert!(MbType::from_i(26).is_err());

        assert_eq!(MbType::from_p(4).unwrap(), MbType::P8x8Ref0);
        assert_eq!(MbType::from_p(5).unwrap(), MbType::INxN);
        assert_eq!(MbType::from_p(30).unwrap(), MbType::IPcm);

        assert_eq!(
            MbType::from_b(11).unwrap(),
            MbType::Inter {
                shape: PartShape::P8x16,
                pred: [PartPred::L1, PartPred::L0]
            }
        );
        assert_eq!(
            MbType::from_b(20).unwrap(),
            MbType::Inter {
                shape: PartShape::P16x8,
                pred: [PartPred::Bi, PartPred::Bi]
            }
        );
        assert_eq!(MbType::from_b(22).unwrap(), MbType::B8x8);
        assert_eq!(MbType::from_b(23).unwrap(), MbType::INxN);
    }

    #[test]
    fn sub_mb_type_tables() {
        assert!(SubMbType::from_b(0).unwrap().is_direct());
        assert_eq!(
            SubMbType::from_b(9).unwrap(),
            SubMbType {
                pred: Some(PartPred::Bi),
                shape: SubShape::S4x8
            }
        );
        assert!(SubMbType::from_b(13).is_err());
        assert_eq!(SubMbType::from_p(3).unwrap().shape, SubShape::S4x4);
    }

    #[test]
    fn neighbour_blocks() {
        // 3x2 macroblocks, all in slice 0 and decoded up to address 4.
        let mut arena = MbArena::new(3, 2);
        for mb in arena.mbs.iter_mut().take(5) {
            mb.slice_num = 0;
        }

        // Left of the first column: outside the picture.
        assert_eq!(arena.block(3, -1, 0, 4), None);
        // Above: macroblock 1, bottom row.
        assert_eq!(arena.block(4, 1, -1, 4), Some((1, 13)));
        // Above right of the last column block: macroblock C.
        assert_eq!(arena.block(4, 4, -1, 4), Some((2, 12)));
        // Above left: macroblock D.
        assert_eq!(arena.block(4, -1, -1, 4), Some((0, 15)));
        // Right of the current macroblock below the top row: not decoded.
        assert_eq!(arena.block(4, 4, 1, 4), None);
        // Inside the current macroblock.
        assert_eq!(arena.block(4, 2, 3, 4), Some((4, 14)));
        // Chroma blocks.
        assert_eq!(arena.block(4, -1, 1, 2), Some((3, 3)));

        // A different slice is not available.
        arena.mbs[4].slice_num = 1;
        assert_eq!(arena.block(4, 0, -1, 4), None);
    }
}
