// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Intra prediction (8.3).

use anyhow::anyhow;

use crate::decoder::h264::frame::Plane;

/// Which neighbouring samples of a block may be used for prediction.
#[derive(Clone, Copy, Debug, Default)]
pub struct Avail {
    pub left: bool,
    pub top: bool,
    pub top_left: bool,
    pub top_right: bool,
}

/// Neighbouring samples of a block. Index 0 of both arrays holds the
/// top-left sample, so `top[1 + x]` is p[x, -1] and `left[1 + y]` is
/// p[-1, y].
struct Edges {
    top: [i32; 33],
    left: [i32; 17],
}

impl Edges {
    /// Reads the neighbours of the `size`x`size` block at (`x`, `y`).
    /// Unavailable top-right samples are replaced with p[size - 1, -1].
    fn gather(
        plane: &Plane,
        x: usize,
        y: usize,
        size: usize,
        avail: Avail,
    ) -> anyhow::Result<Self> {
        if (avail.top || avail.top_left) && y == 0 {
            return Err(anyhow!("block at ({}, {}) has no row above", x, y));
        }
        if (avail.left || avail.top_left) && x == 0 {
            return Err(anyhow!("block at ({}, {}) has no column to the left", x, y));
        }
        let right = if avail.top_right { x + 2 * size } else { x + size };
        if (avail.top && right > plane.width) || (avail.left && y + size > plane.height) {
            return Err(anyhow!("block at ({}, {}) reads outside the plane", x, y));
        }

        let mut top = [128; 33];
        let mut left = [128; 17];

        if avail.top {
            for i in 0..size {
                top[1 + i] = i32::from(plane.at(x + i, y - 1));
            }
            for i in size..2 * size {
                top[1 + i] = if avail.top_right {
                    i32::from(plane.at(x + i, y - 1))
                } else {
                    top[size]
                };
            }
        }

        if avail.left {
            for j in 0..size {
                left[1 + j] = i32::from(plane.at(x - 1, y + j));
            }
        }

        if avail.top_left {
            let corner = i32::from(plane.at(x - 1, y - 1));
            top[0] = corner;
            left[0] = corner;
        }

        Ok(Self { top, left })
    }

    #[inline]
    fn t(&self, x: i32) -> i32 {
        self.top[(x + 1) as usize]
    }

    #[inline]
    fn l(&self, y: i32) -> i32 {
        self.left[(y + 1) as usize]
    }

    /// 8.3.2.2.1: reference sample filtering of Intra_8x8 prediction.
    fn filter_8x8(&self, avail: Avail) -> Self {
        let mut out = Edges {
            top: self.top,
            left: self.left,
        };

        if avail.top {
            out.top[1] = if avail.top_left {
                (self.t(-1) + 2 * self.t(0) + self.t(1) + 2) >> 2
            } else {
                (3 * self.t(0) + self.t(1) + 2) >> 2
            };
            for x in 1..15 {
                out.top[1 + x as usize] = (self.t(x - 1) + 2 * self.t(x) + self.t(x + 1) + 2) >> 2;
            }
            out.top[16] = (self.t(14) + 3 * self.t(15) + 2) >> 2;
        }

        if avail.top_left {
            let corner = match (avail.top, avail.left) {
                (false, true) => (3 * self.t(-1) + self.l(0) + 2) >> 2,
                (true, false) => (3 * self.t(-1) + self.t(0) + 2) >> 2,
                (true, true) => (self.t(0) + 2 * self.t(-1) + self.l(0) + 2) >> 2,
                (false, false) => self.t(-1),
            };
            out.top[0] = corner;
            out.left[0] = corner;
        }

        if avail.left {
            out.left[1] = if avail.top_left {
                (self.l(-1) + 2 * self.l(0) + self.l(1) + 2) >> 2
            } else {
                (3 * self.l(0) + self.l(1) + 2) >> 2
            };
            for y in 1..7 {
                out.left[1 + y as usize] = (self.l(y - 1) + 2 * self.l(y) + self.l(y + 1) + 2) >> 2;
            }
            out.left[8] = (self.l(6) + 3 * self.l(7) + 2) >> 2;
        }

        out
    }
}

fn check(cond: bool, what: &str, mode: u8) -> anyhow::Result<()> {
    if cond {
        Ok(())
    } else {
        Err(anyhow!("{} prediction mode {} uses unavailable samples", what, mode))
    }
}

/// Intra_4x4 and Intra_8x8 prediction of a `n`x`n` block, from the
/// (possibly filtered) edges.
fn predict_nxn(e: &Edges, n: i32, mode: u8, avail: Avail) -> anyhow::Result<[[u8; 8]; 8]> {
    let mut pred = [[0u8; 8]; 8];
    let log2n = if n == 4 { 2 } else { 3 };

    match mode {
        0 | 3 | 7 => check(avail.top, "Intra NxN", mode)?,
        1 | 8 => check(avail.left, "Intra NxN", mode)?,
        4..=6 => check(avail.top && avail.left && avail.top_left, "Intra NxN", mode)?,
        2 => (),
        _ => return Err(anyhow!("invalid intra NxN prediction mode {}", mode)),
    }

    let dc = if mode == 2 {
        let sum_top: i32 = (0..n).map(|x| e.t(x)).sum();
        let sum_left: i32 = (0..n).map(|y| e.l(y)).sum();
        match (avail.top, avail.left) {
            (true, true) => (sum_top + sum_left + n) >> (log2n + 1),
            (false, true) => (sum_left + (n >> 1)) >> log2n,
            (true, false) => (sum_top + (n >> 1)) >> log2n,
            (false, false) => 128,
        }
    } else {
        0
    };

    for y in 0..n {
        for x in 0..n {
            let v = match mode {
                0 => e.t(x),
                1 => e.l(y),
                2 => dc,
                3 => {
                    if x == n - 1 && y == n - 1 {
                        (e.t(2 * n - 2) + 3 * e.t(2 * n - 1) + 2) >> 2
                    } else {
                        (e.t(x + y) + 2 * e.t(x + y + 1) + e.t(x + y + 2) + 2) >> 2
                    }
                }
                4 => {
                    if x > y {
                        (e.t(x - y - 2) + 2 * e.t(x - y - 1) + e.t(x - y) + 2) >> 2
                    } else if x < y {
                        (e.l(y - x - 2) + 2 * e.l(y - x - 1) + e.l(y - x) + 2) >> 2
                    } else {
                        (e.t(0) + 2 * e.t(-1) + e.l(0) + 2) >> 2
                    }
                }
                5 => {
                    let z = 2 * x - y;
                    if z >= 0 && z % 2 == 0 {
                        (e.t(x - (y >> 1) - 1) + e.t(x - (y >> 1)) + 1) >> 1
                    } else if z >= 0 {
                        (e.t(x - (y >> 1) - 2) + 2 * e.t(x - (y >> 1) - 1) + e.t(x - (y >> 1)) + 2)
                            >> 2
                    } else if z == -1 {
                        (e.l(0) + 2 * e.l(-1) + e.t(0) + 2) >> 2
                    } else {
                        (e.l(y - 2 * x - 1) + 2 * e.l(y - 2 * x - 2) + e.l(y - 2 * x - 3) + 2) >> 2
                    }
                }
                6 => {
                    let z = 2 * y - x;
                    if z >= 0 && z % 2 == 0 {
                        (e.l(y - (x >> 1) - 1) + e.l(y - (x >> 1)) + 1) >> 1
                    } else if z >= 0 {
                        (e.l(y - (x >> 1) - 2) + 2 * e.l(y - (x >> 1) - 1) + e.l(y - (x >> 1)) + 2)
                            >> 2
                    } else if z == -1 {
                        (e.l(0) + 2 * e.l(-1) + e.t(0) + 2) >> 2
                    } else {
                        (e.t(x - 2 * y - 1) + 2 * e.t(x - 2 * y - 2) + e.t(x - 2 * y - 3) + 2) >> 2
                    }
                }
                7 => {
                    let i = x + (y >> 1);
                    if y % 2 == 0 {
                        (e.t(i) + e.t(i + 1) + 1) >> 1
                    } else {
                        (e.t(i) + 2 * e.t(i + 1) + e.t(i + 2) + 2) >> 2
                    }
                }
                _ => {
                    let z = x + 2 * y;
                    let i = y + (x >> 1);
                    if z > 2 * n - 3 {
                        e.l(n - 1)
                    } else if z == 2 * n - 3 {
                        (e.l(n - 2) + 3 * e.l(n - 1) + 2) >> 2
                    } else if z % 2 == 0 {
                        (e.l(i) + e.l(i + 1) + 1) >> 1
                    } else {
                        (e.l(i) + 2 * e.l(i + 1) + e.l(i + 2) + 2) >> 2
                    }
                }
            };
            pred[y as usize][x as usize] = v as u8;
        }
    }

    Ok(pred)
}

fn write_block(plane: &mut Plane, x: usize, y: usize, n: usize, pred: &[[u8; 8]; 8]) {
    for (j, row) in pred.iter().enumerate().take(n) {
        let start = (y + j) * plane.width + x;
        plane.data[start..start + n].copy_from_slice(&row[..n]);
    }
}

/// Intra_4x4 prediction of the block at (`x`, `y`).
pub fn predict_4x4(
    plane: &mut Plane,
    x: usize,
    y: usize,
    mode: u8,
    avail: Avail,
) -> anyhow::Result<()> {
    let edges = Edges::gather(plane, x, y, 4, avail)?;
    let pred = predict_nxn(&edges, 4, mode, avail)?;
    write_block(plane, x, y, 4, &pred);
    Ok(())
}

/// Intra_8x8 prediction of the block at (`x`, `y`).
pub fn predict_8x8(
    plane: &mut Plane,
    x: usize,
    y: usize,
    mode: u8,
    avail: Avail,
) -> anyhow::Result<()> {
    let edges = Edges::gather(plane, x, y, 8, avail)?.filter_8x8(avail);
    let pred = predict_nxn(&edges, 8, mode, avail)?;
    write_block(plane, x, y, 8, &pred);
    Ok(())
}

fn plane_prediction(plane: &mut Plane, e: &Edges, x0: usize, y0: usize, n: i32, scale: i32) {
    let half = n / 2;
    let mut h = 0;
    let mut v = 0;
    for i in 0..half {
        h += (i + 1) * (e.t(half + i) - e.t(half - 2 - i));
        v += (i + 1) * (e.l(half + i) - e.l(half - 2 - i));
    }

    let a = 16 * (e.l(n - 1) + e.t(n - 1));
    let b = (scale * h + 32) >> 6;
    let c = (scale * v + 32) >> 6;

    for y in 0..n {
        for x in 0..n {
            let value = (a + b * (x - (half - 1)) + c * (y - (half - 1)) + 16) >> 5;
            plane.set(x0 + x as usize, y0 + y as usize, value.clamp(0, 255) as u8);
        }
    }
}

fn fill(plane: &mut Plane, x0: usize, y0: usize, w: usize, h: usize, value: i32) {
    for y in 0..h {
        let start = (y0 + y) * plane.width + x0;
        plane.data[start..start + w].fill(value as u8);
    }
}

/// Intra_16x16 prediction of the macroblock at (`x`, `y`).
pub fn predict_16x16(
    plane: &mut Plane,
    x: usize,
    y: usize,
    mode: u8,
    avail: Avail,
) -> anyhow::Result<()> {
    let e = Edges::gather(plane, x, y, 16, Avail { top_right: false, ..avail })?;

    match mode {
        0 => {
            check(avail.top, "Intra16x16", mode)?;
            for j in 0..16 {
                for i in 0..16 {
                    plane.set(x + i, y + j, e.t(i as i32) as u8);
                }
            }
        }
        1 => {
            check(avail.left, "Intra16x16", mode)?;
            for j in 0..16 {
                fill(plane, x, y + j, 16, 1, e.l(j as i32));
            }
        }
        2 => {
            let sum_top: i32 = (0..16).map(|i| e.t(i)).sum();
            let sum_left: i32 = (0..16).map(|i| e.l(i)).sum();
            let dc = match (avail.top, avail.left) {
                (true, true) => (sum_top + sum_left + 16) >> 5,
                (false, true) => (sum_left + 8) >> 4,
                (true, false) => (sum_top + 8) >> 4,
                (false, false) => 128,
            };
            fill(plane, x, y, 16, 16, dc);
        }
        3 => {
            check(avail.top && avail.left && avail.top_left, "Intra16x16", mode)?;
            plane_prediction(plane, &e, x, y, 16, 5);
        }
        _ => return Err(anyhow!("invalid Intra16x16 prediction mode {}", mode)),
    }

    Ok(())
}

/// Chroma intra prediction of the 8x8 block of a 4:2:0 macroblock.
pub fn predict_chroma(
    plane: &mut Plane,
    x: usize,
    y: usize,
    mode: u8,
    avail: Avail,
) -> anyhow::Result<()> {
    let e = Edges::gather(plane, x, y, 8, Avail { top_right: false, ..avail })?;

    match mode {
        0 => {
            for (bx, by) in [(0, 0), (4, 0), (0, 4), (4, 4)] {
                let sum_top: i32 = (bx..bx + 4).map(|i| e.t(i)).sum();
                let sum_left: i32 = (by..by + 4).map(|i| e.l(i)).sum();
                let top = avail.top.then_some((sum_top + 2) >> 2);
                let left = avail.left.then_some((sum_left + 2) >> 2);

                let dc = match (bx, by) {
                    (4, 0) => top.or(left),
                    (0, 4) => left.or(top),
                    _ => match (avail.top, avail.left) {
                        (true, true) => Some((sum_top + sum_left + 4) >> 3),
                        _ => top.or(left),
                    },
                }
                .unwrap_or(128);

                fill(plane, x + bx as usize, y + by as usize, 4, 4, dc);
            }
        }
        1 => {
            check(avail.left, "Chroma", mode)?;
            for j in 0..8 {
                fill(plane, x, y + j, 8, 1, e.l(j as i32));
            }
        }
        2 => {
            check(avail.top, "Chroma", mode)?;
            for j in 0..8 {
                for i in 0..8 {
                    plane.set(x + i, y + j, e.t(i as i32) as u8);
                }
            }
        }
        3 => {
            check(avail.top && avail.left && avail.top_left, "Chroma", mode)?;
            plane_prediction(plane, &e, x, y, 8, 34);
        }
        _ => return Err(anyhow!("invalid chroma prediction mode {}", mode)),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::h264::frame::Frame;

    fn all() -> Avail {
        Avail {
            left: true,
            top: true,
            top_left: true,
            top_right: true,
        }
    }

    /// A 32x32 luma plane whose samples are `x + 2 * y`.
    fn gradient() -> Plane {
        let mut plane = Frame::new(1, 2, 2).planes[0].clone();
        for y in 0..32 {
            for x in 0..32 {
                plane.set(x, y, (x + 2 * y) as u8);
            }
        }
        plane
    }

    #[test]
    fn dc_without_neighbours_is_mid_grey() {
        let mut plane = gradient();
        predict_4x4(&mut plane, 0, 0, 2, Avail::default()).unwrap();
        predict_16x16(&mut plane, 16, 16, 2, Avail::default()).unwrap();
        assert_eq!(plane.at(3, 3), 128);
        assert_eq!(plane.at(31, 31), 128);
    }

    #[test]
    fn vertical_and_horizontal_copy_edges() {
        let mut plane = gradient();
        predict_4x4(&mut plane, 4, 4, 0, all()).unwrap();
        // p[x, -1] = x + 4 + 2 * 3
        assert_eq!(plane.at(5, 7), 5 + 6);

        predict_4x4(&mut plane, 12, 12, 1, all()).unwrap();
        // p[-1, y] = 11 + 2 * y
        assert_eq!(plane.at(15, 13), 11 + 26);
    }

    #[test]
    fn missing_samples_are_an_error() {
        let mut plane = gradient();
        assert!(predict_4x4(&mut plane, 0, 0, 0, Avail::default()).is_err());
        let top = Avail {
            top: true,
            ..Default::default()
        };
        assert!(predict_16x16(&mut plane, 0, 0, 3, top).is_err());
        assert!(predict_4x4(&mut plane, 0, 8, 0, top).is_ok());
        assert!(predict_4x4(&mut plane, 0, 8, 0, all()).is_err());
        assert!(predict_4x4(&mut plane, 28, 8, 0, all()).is_err());
        assert!(predict_chroma(&mut plane, 0, 0, 1, Avail::default()).is_err());
        assert!(predict_4x4(&mut plane, 4, 4, 9, all()).is_err());
    }

    #[test]
    fn plane_prediction_follows_a_gradient() {
        let mut plane = gradient();
        predict_16x16(&mut plane, 16, 16, 3, all()).unwrap();

        for y in 16..32 {
            for x in 16..32 {
                assert_eq!(i32::from(plane.at(x, y)), (x + 2 * y) as i32);
            }
        }
    }

    #[test]
    fn diagonal_down_left_without_top_right() {
        let mut plane = gradient();
        let avail = Avail {
            top_right: false,
            ..all()
        };
        predict_4x4(&mut plane, 4, 4, 3, avail).unwrap();
        // The top-right samples replicate p[3, -1] = 13; the bottom-right
        // sample only sees them.
        assert_eq!(plane.at(7, 7), 13);
    }

    #[test]
    fn chroma_dc_per_quadrant() {
        let mut plane = Frame::new(1, 2, 2).planes[1].clone();
        for x in 8..16 {
            plane.set(x, 7, if x < 12 { 10 } else { 50 });
        }
        let avail = Avail {
            top: true,
            ..Default::default()
        };
        predict_chroma(&mut plane, 8, 8, 0, avail).unwrap();

        assert_eq!(plane.at(8, 8), 10);
        assert_eq!(plane.at(12, 8), 50);
        assert_eq!(plane.at(8, 12), 10);
        assert_eq!(plane.at(15, 15), 50);
    }

    #[test]
    fn filtered_8x8_dc() {
        let mut plane = Frame::new(1, 2, 2).planes[0].clone();
        for i in 0..32 {
            plane.set(i, 7, 100);
            plane.set(7, i, 100);
        }
        predict_8x8(&mut plane, 8, 8, 2, all()).unwrap();
        assert_eq!(plane.at(12, 12), 100);
    }
}
