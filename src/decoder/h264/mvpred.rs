// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Motion vector prediction (8.4.1).

use crate::decoder::h264::frame::FrameId;
use crate::decoder::h264::frame::MotionField;
use crate::decoder::h264::frame::Mv;
use crate::decoder::h264::frame::RefPicture;
use crate::decoder::h264::macroblock::MbArena;
use crate::decoder::h264::macroblock::PartRect;
use crate::decoder::h264::macroblock::BLK_TO_RASTER;

/// Motion of a 4x4 block for both lists. A negative reference index means
/// the list is not used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockMotion {
    pub ref_idx: [i8; 2],
    pub mv: [Mv; 2],
}

impl Default for BlockMotion {
    fn default() -> Self {
        Self {
            ref_idx: [-1; 2],
            mv: [Mv::ZERO; 2],
        }
    }
}

/// Motion of a neighbouring partition, or `None` when the partition is not
/// available. Intra coded neighbours have a reference index of -1.
type Neighbour = Option<(i8, Mv)>;

/// Fetches the list `list` motion of the block at (`bx`, `by`) relative to
/// the macroblock `cur`. Blocks of `cur` are only available when they come
/// before `first_blk` in decoding order.
fn neighbour(
    arena: &MbArena,
    cur: usize,
    bx: i32,
    by: i32,
    list: usize,
    first_blk: usize,
) -> Neighbour {
    let (n, raster) = arena.block(cur, bx, by, 4)?;

    if n == cur && BLK_TO_RASTER[raster] >= first_blk {
        return None;
    }

    let info = &arena.mbs[n];
    if info.is_intra() {
        return Some((-1, Mv::ZERO));
    }

    let ref_idx = info.ref_idx[list][raster];
    if ref_idx < 0 {
        Some((-1, Mv::ZERO))
    } else {
        Some((ref_idx, info.mv[list][raster]))
    }
}

fn median(a: i16, b: i16, c: i16) -> i16 {
    a.max(b).min(a.min(b).max(c))
}

/// 8.4.1.3: predicts the motion vector of the partition `part` (in 4x4
/// block units inside the macroblock) using reference `ref_idx` of `list`.
/// `mb_part` tells whether the partition is a 16x8 or 8x16 macroblock
/// partition, which enables the directional predictions.
pub fn predict(
    arena: &MbArena,
    cur: usize,
    list: usize,
    ref_idx: i8,
    part: PartRect,
    mb_part: bool,
) -> Mv {
    let (x, y, w, h) = part;
    let (bx, by) = (x as i32, y as i32);
    let first_blk = BLK_TO_RASTER[y * 4 + x];

    let mut a = neighbour(arena, cur, bx - 1, by, list, first_blk);
    let mut b = neighbour(arena, cur, bx, by - 1, list, first_blk);
    let mut c = neighbour(arena, cur, bx + w as i32, by - 1, list, first_blk)
        .or_else(|| neighbour(arena, cur, bx - 1, by - 1, list, first_blk));

    let matches = |n: Neighbour| n.map(|(r, _)| r == ref_idx).unwrap_or(false);
    let mv_of = |n: Neighbour| n.map(|(_, mv)| mv).unwrap_or(Mv::ZERO);

    if mb_part {
        match (w, h, x, y) {
            (4, 2, _, 0) if matches(b) => return mv_of(b),
            (4, 2, _, _) if y != 0 && matches(a) => return mv_of(a),
            (2, 4, 0, _) if matches(a) => return mv_of(a),
            (2, 4, _, _) if x != 0 && matches(c) => return mv_of(c),
            _ => (),
        }
    }

    if b.is_none() && c.is_none() && a.is_some() {
        b = a;
        c = a;
    }
    if a.is_none() {
        a = Some((-1, Mv::ZERO));
    }

    let hits = [a, b, c].iter().filter(|n| matches(**n)).count();
    if hits == 1 {
        if matches(a) {
            return mv_of(a);
        } else if matches(b) {
            return mv_of(b);
        } else {
            return mv_of(c);
        }
    }

    let (ma, mb, mc) = (mv_of(a), mv_of(b), mv_of(c));
    Mv {
        x: median(ma.x, mb.x, mc.x),
        y: median(ma.y, mb.y, mc.y),
    }
}

/// 8.4.1.1: motion vector of a P_Skip macroblock.
pub fn p_skip(arena: &MbArena, cur: usize) -> Mv {
    let a = neighbour(arena, cur, -1, 0, 0, 0);
    let b = neighbour(arena, cur, 0, -1, 0, 0);

    match (a, b) {
        (None, _) | (_, None) => Mv::ZERO,
        (Some((0, Mv::ZERO)), _) | (_, Some((0, Mv::ZERO))) => Mv::ZERO,
        _ => predict(arena, cur, 0, 0, (0, 0, 4, 4), true),
    }
}

/// Motion of the co-located 4x4 block, as (refIdxCol, mvCol, refPicCol).
fn colocated(col: &MotionField, idx: usize) -> (i8, Mv, FrameId) {
    let ref_idx = col.ref_idx[idx];
    if ref_idx[0] >= 0 {
        (ref_idx[0], col.mv[idx][0], col.ref_id[idx][0])
    } else if ref_idx[1] >= 0 {
        (ref_idx[1], col.mv[idx][1], col.ref_id[idx][1])
    } else {
        (-1, Mv::ZERO, 0)
    }
}

/// Inputs of direct prediction shared by the macroblocks of a slice.
pub struct DirectContext<'a> {
    pub col: &'a MotionField,
    pub list0: &'a [RefPicture],
    pub list1: &'a [RefPicture],
    pub cur_poc: i32,
    pub direct_8x8_inference: bool,
}

impl DirectContext<'_> {
    /// Index in the co-located motion field of block `raster` of the
    /// macroblock at `mb_addr`, in a picture `width` macroblocks wide.
    fn col_index(&self, mb_addr: usize, width: usize, raster: usize) -> usize {
        let (mut bx, mut by) = (raster % 4, raster / 4);
        if self.direct_8x8_inference {
            bx = if bx < 2 { 0 } else { 3 };
            by = if by < 2 { 0 } else { 3 };
        }

        let x4 = (mb_addr % width) * 4 + bx;
        let y4 = (mb_addr / width) * 4 + by;
        self.col.index(x4, y4)
    }

    fn col_is_short_term(&self) -> bool {
        self.list1.first().map(|r| !r.long_term).unwrap_or(false)
    }

    /// 8.4.1.2.2: spatial direct motion of all the blocks of `cur`.
    pub fn spatial(&self, arena: &MbArena, cur: usize) -> [BlockMotion; 16] {
        let mut ref_idx = [-1i8; 2];

        for (list, r) in ref_idx.iter_mut().enumerate() {
            let a = neighbour(arena, cur, -1, 0, list, 0);
            let b = neighbour(arena, cur, 0, -1, list, 0);
            let c = neighbour(arena, cur, 4, -1, list, 0)
                .or_else(|| neighbour(arena, cur, -1, -1, list, 0));

            let refs = [a, b, c].map(|n| n.map(|(r, _)| r).unwrap_or(-1));
            *r = min_positive(refs[0], min_positive(refs[1], refs[2]));
        }

        if ref_idx[0] < 0 && ref_idx[1] < 0 {
            return [BlockMotion {
                ref_idx: [0, 0],
                mv: [Mv::ZERO; 2],
            }; 16];
        }

        let mut mv_pred = [Mv::ZERO; 2];
        for list in 0..2 {
            if ref_idx[list] >= 0 {
                mv_pred[list] = predict(arena, cur, list, ref_idx[list], (0, 0, 4, 4), false);
            }
        }

        let col_short_term = self.col_is_short_term();
        let mut out = [BlockMotion::default(); 16];
        for (raster, motion) in out.iter_mut().enumerate() {
            let col_index = self.col_index(cur, arena.width, raster);
            let (ref_col, mv_col, _) = colocated(self.col, col_index);
            let col_zero = col_short_term
                && ref_col == 0
                && (-1..=1).contains(&mv_col.x)
                && (-1..=1).contains(&mv_col.y);

            for list in 0..2 {
                motion.ref_idx[list] = ref_idx[list];
                motion.mv[list] = if ref_idx[list] < 0 || (ref_idx[list] == 0 && col_zero) {
                    Mv::ZERO
                } else {
                    mv_pred[list]
                };
            }
        }

        out
    }

    /// 8.4.1.2.3: temporal direct motion of all the blocks of `cur`.
    pub fn temporal(&self, arena: &MbArena, cur: usize) -> [BlockMotion; 16] {
        let mut out = [BlockMotion::default(); 16];
        let poc1 = self.list1.first().map(|r| r.poc).unwrap_or(0);

        for (raster, motion) in out.iter_mut().enumerate() {
            let col_index = self.col_index(cur, arena.width, raster);
            let (ref_col, mv_col, ref_pic_col) = colocated(self.col, col_index);

            let ref_idx_l0 = if ref_col < 0 {
                0
            } else {
                self.list0
                    .iter()
                    .position(|r| r.frame.is_some() && r.id() == ref_pic_col)
                    .unwrap_or(0)
            };

            let pic0 = self.list0.get(ref_idx_l0);
            let (poc0, long_term) = pic0.map(|r| (r.poc, r.long_term)).unwrap_or((0, false));
            let tb = (self.cur_poc - poc0).clamp(-128, 127);
            let td = (poc1 - poc0).clamp(-128, 127);

            let (mv0, mv1) = if long_term || td == 0 {
                (mv_col, Mv::ZERO)
            } else {
                let dsf = direct_scale_factor(tb, td);
                let x = (dsf * i32::from(mv_col.x) + 128) >> 8;
                let y = (dsf * i32::from(mv_col.y) + 128) >> 8;
                (
                    Mv::new(x, y),
                    Mv::new(x - i32::from(mv_col.x), y - i32::from(mv_col.y)),
                )
            };

            *motion = BlockMotion {
                ref_idx: [ref_idx_l0 as i8, 0],
                mv: [mv0, mv1],
            };
        }

        out
    }
}

/// DistScaleFactor of 8-195 to 8-197, with tb and td already clipped.
pub fn direct_scale_factor(tb: i32, td: i32) -> i32 {
    let tx = (16384 + (td / 2).abs()) / td;
    ((tb * tx + 32) >> 6).clamp(-1024, 1023)
}

fn min_positive(x: i8, y: i8) -> i8 {
    if x >= 0 && y >= 0 {
        x.min(y)
    } else {
        x.max(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::h264::macroblock::MbType;
    use crate::decoder::h264::macroblock::PartPred;
    use crate::decoder::h264::macroblock::PartShape;

    /// A 3x2 picture where the top row is decoded with the given L0 motion.
    fn arena_with_top_row(motion: [(i8, Mv); 3]) -> MbArena {
        let mut arena = MbArena::new(3, 2);
        for (addr, (ref_idx, mv)) in motion.into_iter().enumerate() {
            let info = &mut arena.mbs[addr];
            info.start(0);
            info.mb_type = MbType::Inter {
                shape: PartShape::P16x16,
                pred: [PartPred::L0; 2],
            };
            info.ref_idx[0] = [ref_idx; 16];
            info.mv[0] = [mv; 16];
        }
        arena
    }

    #[test]
    fn median_of_three() {
        assert_eq!(median(1, 5, 3), 3);
        assert_eq!(median(-4, -8, 0), -4);
        assert_eq!(median(7, 7, 1), 7);
    }

    #[test]
    fn median_prediction() {
        let top = [(0, Mv::new(4, 4)), (0, Mv::new(8, -2)), (0, Mv::new(2, 6))];
        let mut arena = arena_with_top_row(top);
        arena.mbs[3].start(0);
        arena.mbs[3].mb_type = MbType::Inter {
            shape: PartShape::P16x16,
            pred: [PartPred::L0; 2],
        };
        arena.mbs[3].ref_idx[0] = [0; 16];
        arena.mbs[3].mv[0] = [Mv::new(-6, 0); 16];
        arena.mbs[4].start(0);

        // A = (-6, 0), B = (8, -2), C = (2, 6).
        assert_eq!(predict(&arena, 4, 0, 0, (0, 0, 4, 4), true), Mv::new(2, 0));
    }

    #[test]
    fn single_matching_reference_wins() {
        let top = [(0, Mv::ZERO), (1, Mv::new(8, -2)), (0, Mv::new(2, 6))];
        let mut arena = arena_with_top_row(top);
        arena.mbs[3].start(0);
        arena.mbs[3].mb_type = MbType::IPcm;
        arena.mbs[4].start(0);

        assert_eq!(predict(&arena, 4, 0, 1, (0, 0, 4, 4), true), Mv::new(8, -2));
    }

    #[test]
    fn only_left_available() {
        let mut arena = MbArena::new(2, 1);
        arena.mbs[0].start(0);
        arena.mbs[0].mb_type = MbType::Inter {
            shape: PartShape::P16x16,
            pred: [PartPred::L0; 2],
        };
        arena.mbs[0].ref_idx[0] = [2; 16];
        arena.mbs[0].mv[0] = [Mv::new(12, -4); 16];
        arena.mbs[1].start(0);

        // B and C are outside the picture, so they copy A.
        assert_eq!(predict(&arena, 1, 0, 0, (0, 0, 4, 4), true), Mv::new(12, -4));
        // P_Skip needs both A and B.
        assert_eq!(p_skip(&arena, 1), Mv::ZERO);
    }

    #[test]
    fn directional_16x8() {
        let top = [(0, Mv::ZERO), (1, Mv::new(8, -2)), (0, Mv::new(2, 6))];
        let mut arena = arena_with_top_row(top);
        arena.mbs[3].start(0);
        arena.mbs[3].mb_type = MbType::Inter {
            shape: PartShape::P16x16,
            pred: [PartPred::L0; 2],
        };
        arena.mbs[3].ref_idx[0] = [1; 16];
        arena.mbs[3].mv[0] = [Mv::new(-6, 0); 16];
        arena.mbs[4].start(0);

        // Upper partition takes B when the reference matches.
        assert_eq!(predict(&arena, 4, 0, 1, (0, 0, 4, 2), true), Mv::new(8, -2));
        // Lower partition takes A.
        assert_eq!(predict(&arena, 4, 0, 1, (0, 2, 4, 2), true), Mv::new(-6, 0));
    }

    #[test]
    fn p_skip_zero_neighbour() {
        let mut arena = arena_with_top_row([(0, Mv::ZERO), (0, Mv::ZERO), (0, Mv::new(2, 6))]);
        arena.mbs[3].start(0);
        arena.mbs[3].mb_type = MbType::Inter {
            shape: PartShape::P16x16,
            pred: [PartPred::L0; 2],
        };
        arena.mbs[3].ref_idx[0] = [0; 16];
        arena.mbs[3].mv[0] = [Mv::new(40, 40); 16];
        arena.mbs[4].start(0);

        assert_eq!(p_skip(&arena, 4), Mv::ZERO);
    }

    #[test]
    fn scale_factor() {
        // Current picture half way between the references.
        assert_eq!(direct_scale_factor(2, 4), 128);
        assert_eq!(direct_scale_factor(1, 1), 256);
        assert_eq!(direct_scale_factor(-8, 1), -1024);
    }

    #[test]
    fn min_positive_prefers_valid_indices() {
        assert_eq!(min_positive(-1, 3), 3);
        assert_eq!(min_positive(2, 1), 1);
        assert_eq!(min_positive(-1, -1), -1);
    }
}
