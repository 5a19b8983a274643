// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Deblocking filter process (8.7), applied once all the slices of a frame
//! have been decoded.

use crate::decoder::h264::frame::Frame;
use crate::decoder::h264::frame::MotionField;
use crate::decoder::h264::frame::Mv;
use crate::decoder::h264::frame::Plane;
use crate::decoder::h264::macroblock::MbArena;
use crate::decoder::h264::macroblock::MbInfo;
use crate::decoder::h264::macroblock::MbType;

/// Table 8-16: alpha' by indexA.
const ALPHA: [i32; 52] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 4, 4, 5, 6, 7, 8, 9, 10, 12, 13, 15, 17, 20,
    22, 25, 28, 32, 36, 40, 45, 50, 56, 63, 71, 80, 90, 101, 113, 127, 144, 162, 182, 203, 226,
    255, 255,
];

/// Table 8-16: beta' by indexB.
const BETA: [i32; 52] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 6, 6, 7, 7, 8,
    8, 9, 9, 10, 10, 11, 11, 12, 12, 13, 13, 14, 14, 15, 15, 16, 16, 17, 17, 18, 18,
];

/// Table 8-17: tC0' by indexA, for bS 1, 2 and 3.
const TC0: [[i32; 3]; 52] = [
    [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0],
    [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0],
    [0, 0, 0], [0, 0, 1], [0, 0, 1], [0, 0, 1], [0, 0, 1], [0, 1, 1], [0, 1, 1], [1, 1, 1],
    [1, 1, 1], [1, 1, 1], [1, 1, 1], [1, 1, 2], [1, 1, 2], [1, 1, 2], [1, 1, 2], [1, 2, 3],
    [1, 2, 3], [2, 2, 3], [2, 2, 4], [2, 3, 4], [2, 3, 4], [3, 3, 5], [3, 4, 6], [3, 4, 6],
    [4, 5, 7], [4, 5, 8], [4, 6, 9], [5, 7, 10], [6, 8, 11], [6, 8, 13], [7, 10, 14], [8, 11, 16],
    [9, 12, 18], [10, 13, 20], [11, 15, 23], [13, 17, 25],
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    /// Filtering across a vertical edge, between horizontally adjacent
    /// samples.
    Vertical,
    Horizontal,
}

/// Filter thresholds of an edge.
#[derive(Clone, Copy, Debug)]
struct Thresholds {
    alpha: i32,
    beta: i32,
    index_a: usize,
}

impl Thresholds {
    fn new(qp_p: i32, qp_q: i32, offset_a: i32, offset_b: i32) -> Self {
        let qp_av = (qp_p + qp_q + 1) >> 1;
        let index_a = (qp_av + offset_a).clamp(0, 51) as usize;
        let index_b = (qp_av + offset_b).clamp(0, 51) as usize;

        Self {
            alpha: ALPHA[index_a],
            beta: BETA[index_b],
            index_a,
        }
    }

    fn tc0(&self, bs: u8) -> i32 {
        TC0[self.index_a][usize::from(bs) - 1]
    }
}

fn mv_differs(a: Mv, b: Mv) -> bool {
    (i32::from(a.x) - i32::from(b.x)).abs() >= 4 || (i32::from(a.y) - i32::from(b.y)).abs() >= 4
}

/// Whether the prediction of blocks `p` and `q` of the motion field uses
/// different reference pictures, a different number of motion vectors, or
/// motion vectors far enough apart to need filtering.
fn motion_differs(motion: &MotionField, p: usize, q: usize) -> bool {
    let used = |i: usize| [motion.ref_idx[i][0] >= 0, motion.ref_idx[i][1] >= 0];
    let (up, uq) = (used(p), used(q));
    let count = |u: [bool; 2]| u.iter().filter(|u| **u).count();

    if count(up) != count(uq) {
        return true;
    }

    let (rp, rq) = (motion.ref_id[p], motion.ref_id[q]);
    let (mp, mq) = (motion.mv[p], motion.mv[q]);

    match count(up) {
        0 => false,
        1 => {
            let lp = if up[0] { 0 } else { 1 };
            let lq = if uq[0] { 0 } else { 1 };
            rp[lp] != rq[lq] || mv_differs(mp[lp], mq[lq])
        }
        _ => {
            if !((rp[0] == rq[0] && rp[1] == rq[1]) || (rp[0] == rq[1] && rp[1] == rq[0])) {
                return true;
            }

            if rp[0] != rp[1] {
                if rp[0] == rq[0] {
                    mv_differs(mp[0], mq[0]) || mv_differs(mp[1], mq[1])
                } else {
                    mv_differs(mp[0], mq[1]) || mv_differs(mp[1], mq[0])
                }
            } else {
                (mv_differs(mp[0], mq[0]) || mv_differs(mp[1], mq[1]))
                    && (mv_differs(mp[0], mq[1]) || mv_differs(mp[1], mq[0]))
            }
        }
    }
}

/// 8.7.2.1: boundary filtering strength between block `p_blk` of `p` and
/// block `q_blk` of `q` (raster indices), whose motion is at `p_idx` and
/// `q_idx` of the motion field.
#[allow(clippy::too_many_arguments)]
fn boundary_strength(
    motion: &MotionField,
    p: &MbInfo,
    p_blk: usize,
    p_idx: usize,
    q: &MbInfo,
    q_blk: usize,
    q_idx: usize,
    mb_edge: bool,
) -> u8 {
    if p.mb_type.is_intra() || q.mb_type.is_intra() {
        return if mb_edge { 4 } else { 3 };
    }

    if (p.nonzero >> p_blk) & 1 == 1 || (q.nonzero >> q_blk) & 1 == 1 {
        return 2;
    }

    u8::from(motion_differs(motion, p_idx, q_idx))
}

/// Sample access along one line of samples crossing an edge: q0 is at
/// `base`, p0 at `base - step`.
struct Line<'a> {
    data: &'a mut [u8],
    base: usize,
    step: usize,
}

impl Line<'_> {
    fn p(&self, i: usize) -> i32 {
        i32::from(self.data[self.base - (i + 1) * self.step])
    }

    fn q(&self, i: usize) -> i32 {
        i32::from(self.data[self.base + i * self.step])
    }

    fn set_p(&mut self, i: usize, v: i32) {
        self.data[self.base - (i + 1) * self.step] = v.clamp(0, 255) as u8;
    }

    fn set_q(&mut self, i: usize, v: i32) {
        self.data[self.base + i * self.step] = v.clamp(0, 255) as u8;
    }

    fn filter(&mut self, bs: u8, t: &Thresholds, chroma: bool) {
        let (p0, p1, q0, q1) = (self.p(0), self.p(1), self.q(0), self.q(1));

        if bs == 0
            || (p0 - q0).abs() >= t.alpha
            || (p1 - p0).abs() >= t.beta
            || (q1 - q0).abs() >= t.beta
        {
            return;
        }

        if chroma {
            if bs < 4 {
                let tc = t.tc0(bs) + 1;
                let delta = ((((q0 - p0) << 2) + (p1 - q1) + 4) >> 3).clamp(-tc, tc);
                self.set_p(0, p0 + delta);
                self.set_q(0, q0 - delta);
            } else {
                self.set_p(0, (2 * p1 + p0 + q1 + 2) >> 2);
                self.set_q(0, (2 * q1 + q0 + p1 + 2) >> 2);
            }
            return;
        }

        let (p2, q2) = (self.p(2), self.q(2));
        let ap = (p2 - p0).abs();
        let aq = (q2 - q0).abs();

        if bs < 4 {
            let tc0 = t.tc0(bs);
            let tc = tc0 + i32::from(ap < t.beta) + i32::from(aq < t.beta);
            let delta = ((((q0 - p0) << 2) + (p1 - q1) + 4) >> 3).clamp(-tc, tc);

            self.set_p(0, p0 + delta);
            self.set_q(0, q0 - delta);
            if ap < t.beta {
                self.set_p(1, p1 + ((p2 + ((p0 + q0 + 1) >> 1) - (p1 << 1)) >> 1).clamp(-tc0, tc0));
            }
            if aq < t.beta {
                self.set_q(1, q1 + ((q2 + ((p0 + q0 + 1) >> 1) - (q1 << 1)) >> 1).clamp(-tc0, tc0));
            }
            return;
        }

        let strong = (p0 - q0).abs() < (t.alpha >> 2) + 2;
        let (p3, q3) = (self.p(3), self.q(3));

        if ap < t.beta && strong {
            self.set_p(0, (p2 + 2 * p1 + 2 * p0 + 2 * q0 + q1 + 4) >> 3);
            self.set_p(1, (p2 + p1 + p0 + q0 + 2) >> 2);
            self.set_p(2, (2 * p3 + 3 * p2 + p1 + p0 + q0 + 4) >> 3);
        } else {
            self.set_p(0, (2 * p1 + p0 + q1 + 2) >> 2);
        }

        if aq < t.beta && strong {
            self.set_q(0, (p1 + 2 * p0 + 2 * q0 + 2 * q1 + q2 + 4) >> 3);
            self.set_q(1, (p0 + q0 + q1 + q2 + 2) >> 2);
            self.set_q(2, (2 * q3 + 3 * q2 + q1 + q0 + p0 + 4) >> 3);
        } else {
            self.set_q(0, (2 * q1 + q0 + p1 + 2) >> 2);
        }
    }
}

/// An edge of `len` samples starting at (`x`, `y`).
#[derive(Clone, Copy)]
struct Edge {
    x: usize,
    y: usize,
    dir: Direction,
    len: usize,
}

/// Filters the lines of `plane` crossing `edge`. `bs` gives the strength of
/// each line.
fn filter_edge(
    plane: &mut Plane,
    edge: Edge,
    bs: impl Fn(usize) -> u8,
    t: &Thresholds,
    chroma: bool,
) {
    let Edge { x, y, dir, len } = edge;
    let width = plane.width;
    let (step, along) = match dir {
        Direction::Vertical => (1, width),
        Direction::Horizontal => (width, 1),
    };

    for k in 0..len {
        let mut line = Line {
            data: &mut plane.data,
            base: y * width + x + k * along,
            step,
        };
        line.filter(bs(k), t, chroma);
    }
}

fn luma_qp(mb: &MbInfo) -> i32 {
    if mb.mb_type == MbType::IPcm {
        0
    } else {
        mb.qp_y
    }
}

/// Applies the deblocking filter to `frame`, whose macroblocks are described
/// by `arena`. Macroblocks are processed in raster order, vertical edges
/// first.
pub fn deblock_frame(frame: &mut Frame, arena: &MbArena) {
    let Frame { planes, motion, .. } = frame;
    let width = arena.width;

    for cur in 0..arena.len() {
        let q = &arena.mbs[cur];
        if !arena.is_decoded(cur) || q.concealed {
            continue;
        }

        let Some(params) = arena.slices.get(q.slice_num as usize) else {
            continue;
        };
        if params.disable_deblocking_filter_idc == 1 {
            continue;
        }

        let (mb_x, mb_y) = (cur % width, cur / width);

        for dir in [Direction::Vertical, Direction::Horizontal] {
            let outside = match dir {
                Direction::Vertical if mb_x > 0 => Some(cur - 1),
                Direction::Horizontal if mb_y > 0 => Some(cur - width),
                _ => None,
            };
            let outside = outside.filter(|&n| {
                let p = &arena.mbs[n];
                arena.is_decoded(n)
                    && !p.concealed
                    && !(params.disable_deblocking_filter_idc == 2 && p.slice_num != q.slice_num)
            });

            for edge in 0..4 {
                let p_addr = if edge == 0 {
                    match outside {
                        Some(n) => n,
                        None => continue,
                    }
                } else {
                    cur
                };
                let p = &arena.mbs[p_addr];

                // Raster indices of the blocks on both sides of line block k.
                let blocks = |k: usize| -> (usize, usize) {
                    match dir {
                        Direction::Vertical => (k * 4 + (edge + 3) % 4, k * 4 + edge),
                        Direction::Horizontal => (((edge + 3) % 4) * 4 + k, edge * 4 + k),
                    }
                };
                let motion_index = |addr: usize, blk: usize| {
                    motion.index((addr % width) * 4 + blk % 4, (addr / width) * 4 + blk / 4)
                };

                let mut bs = [0u8; 4];
                for (k, bs) in bs.iter_mut().enumerate() {
                    let (p_blk, q_blk) = blocks(k);
                    *bs = boundary_strength(
                        motion,
                        p,
                        p_blk,
                        motion_index(p_addr, p_blk),
                        q,
                        q_blk,
                        motion_index(cur, q_blk),
                        edge == 0,
                    );
                }
                if bs == [0; 4] {
                    continue;
                }

                let (x, y) = match dir {
                    Direction::Vertical => (mb_x * 16 + edge * 4, mb_y * 16),
                    Direction::Horizontal => (mb_x * 16, mb_y * 16 + edge * 4),
                };

                let (offset_a, offset_b) = (params.filter_offset_a, params.filter_offset_b);
                if !(q.transform_8x8 && edge % 2 == 1) {
                    let t = Thresholds::new(luma_qp(p), luma_qp(q), offset_a, offset_b);
                    let luma = Edge { x, y, dir, len: 16 };
                    filter_edge(&mut planes[0], luma, |k| bs[k / 4], &t, false);
                }

                if edge % 2 == 0 {
                    let chroma = Edge {
                        x: x / 2,
                        y: y / 2,
                        dir,
                        len: 8,
                    };
                    for c in 0..2 {
                        let t = Thresholds::new(p.qp_c[c], q.qp_c[c], offset_a, offset_b);
                        filter_edge(&mut planes[1 + c], chroma, |k| bs[k / 2], &t, true);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::h264::macroblock::DeblockParams;
    use crate::decoder::h264::macroblock::PartPred;
    use crate::decoder::h264::macroblock::PartShape;

    fn intra_arena(width: usize, qp: i32) -> MbArena {
        let mut arena = MbArena::new(width, 1);
        arena.slices.push(DeblockParams::default());
        for mb in arena.mbs.iter_mut() {
            mb.start(0);
            mb.mb_type = MbType::I16x16 {
                pred_mode: 2,
                cbp_luma: 0,
                cbp_chroma: 0,
            };
            mb.qp_y = qp;
            mb.qp_c = [qp; 2];
        }
        arena
    }

    fn fill_luma(frame: &mut Frame, mb_x: usize, value: u8) {
        let plane = &mut frame.planes[0];
        for y in 0..16 {
            for x in 0..16 {
                plane.set(mb_x * 16 + x, y, value);
            }
        }
    }

    #[test]
    fn flat_frames_are_unchanged() {
        let arena = intra_arena(2, 40);
        let mut frame = Frame::new(1, 2, 1);
        let before = frame.planes.clone();

        deblock_frame(&mut frame, &arena);

        for (a, b) in before.iter().zip(frame.planes.iter()) {
            assert_eq!(a.data, b.data);
        }
    }

    #[test]
    fn intra_macroblock_edge() {
        let arena = intra_arena(2, 30);
        let mut frame = Frame::new(1, 2, 1);
        fill_luma(&mut frame, 0, 100);
        fill_luma(&mut frame, 1, 110);

        deblock_frame(&mut frame, &arena);

        // bS 4 with |p0 - q0| too large for the strong filter: only p0 and
        // q0 change.
        for y in 0..16 {
            let row: Vec<u8> = (13..19).map(|x| frame.planes[0].at(x, y)).collect();
            assert_eq!(row, vec![100, 100, 103, 108, 110, 110]);
        }
    }

    #[test]
    fn strong_filter() {
        let arena = intra_arena(2, 40);
        let mut frame = Frame::new(1, 2, 1);
        fill_luma(&mut frame, 0, 100);
        fill_luma(&mut frame, 1, 110);

        deblock_frame(&mut frame, &arena);

        // alpha 80, beta 13: p0 = (100 + 200 + 200 + 220 + 110 + 4) >> 3.
        let row: Vec<u8> = (12..20).map(|x| frame.planes[0].at(x, 0)).collect();
        assert_eq!(row, vec![100, 101, 103, 104, 106, 108, 109, 110]);
    }

    #[test]
    fn disabled_filter() {
        let mut arena = intra_arena(2, 40);
        arena.slices[0].disable_deblocking_filter_idc = 1;
        let mut frame = Frame::new(1, 2, 1);
        fill_luma(&mut frame, 1, 110);

        deblock_frame(&mut frame, &arena);
        assert_eq!(frame.planes[0].at(15, 0), 128);
        assert_eq!(frame.planes[0].at(16, 0), 110);
    }

    #[test]
    fn boundary_strengths() {
        let frame = Frame::new(1, 2, 1);
        let mut motion = frame.motion.clone();
        let inter = MbInfo {
            mb_type: MbType::Inter {
                shape: PartShape::P16x16,
                pred: [PartPred::L0; 2],
            },
            ..Default::default()
        };
        let intra = MbInfo {
            mb_type: MbType::INxN,
            ..Default::default()
        };

        assert_eq!(boundary_strength(&motion, &intra, 3, 3, &inter, 0, 4, true), 4);
        assert_eq!(boundary_strength(&motion, &inter, 0, 0, &intra, 1, 1, false), 3);

        let coded = MbInfo {
            nonzero: 1,
            ..inter.clone()
        };
        assert_eq!(boundary_strength(&motion, &coded, 0, 0, &inter, 1, 1, false), 2);

        // Same reference, motion vectors 4 quarter samples apart.
        for i in [0, 1] {
            motion.ref_idx[i] = [0, -1];
            motion.ref_id[i] = [7, 0];
        }
        motion.mv[1][0] = Mv::new(4, 0);
        assert_eq!(boundary_strength(&motion, &inter, 0, 0, &inter, 1, 1, false), 1);

        motion.mv[1][0] = Mv::new(3, -3);
        assert_eq!(boundary_strength(&motion, &inter, 0, 0, &inter, 1, 1, false), 0);

        // Different reference pictures.
        motion.ref_id[1] = [8, 0];
        assert_eq!(boundary_strength(&motion, &inter, 0, 0, &inter, 1, 1, false), 1);
    }

    #[test]
    fn bipredicted_motion() {
        let frame = Frame::new(1, 1, 1);
        let mut motion = frame.motion.clone();

        // Same two references in swapped lists, same vectors.
        motion.ref_idx[0] = [0, 0];
        motion.ref_id[0] = [3, 4];
        motion.mv[0] = [Mv::new(8, 0), Mv::new(-8, 0)];
        motion.ref_idx[1] = [1, 1];
        motion.ref_id[1] = [4, 3];
        motion.mv[1] = [Mv::new(-8, 0), Mv::new(8, 0)];
        assert!(!motion_differs(&motion, 0, 1));

        // One vector pointing elsewhere.
        motion.mv[1][1] = Mv::new(12, 0);
        assert!(motion_differs(&motion, 0, 1));

        // A single vector against two.
        motion.ref_idx[1] = [0, -1];
        assert!(motion_differs(&motion, 0, 1));
    }
}
