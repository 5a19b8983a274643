// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scaling and inverse transforms of residual blocks (8.5.6 to 8.5.13).

use crate::codec::h264::parser::Pps;
use crate::decoder::h264::frame::Plane;

/// Raster position of each coefficient of a 4x4 block, in scan order.
pub const ZIGZAG_4X4: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

/// Raster position of each coefficient of an 8x8 block, in scan order.
pub const ZIGZAG_8X8: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27,
    20, 13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58,
    59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

const NORM_ADJUST_4X4: [[i32; 3]; 6] = [
    [10, 16, 13],
    [11, 18, 14],
    [13, 20, 16],
    [14, 23, 18],
    [16, 25, 20],
    [18, 29, 23],
];

const NORM_ADJUST_8X8: [[i32; 6]; 6] = [
    [20, 18, 32, 19, 25, 24],
    [22, 19, 35, 21, 28, 26],
    [26, 23, 42, 24, 33, 31],
    [28, 25, 45, 26, 35, 33],
    [32, 28, 51, 30, 40, 38],
    [36, 32, 58, 34, 46, 43],
];

fn norm_adjust_4x4(m: usize, pos: usize) -> i32 {
    let (i, j) = (pos / 4, pos % 4);
    match (i % 2, j % 2) {
        (0, 0) => NORM_ADJUST_4X4[m][0],
        (1, 1) => NORM_ADJUST_4X4[m][1],
        _ => NORM_ADJUST_4X4[m][2],
    }
}

fn norm_adjust_8x8(m: usize, pos: usize) -> i32 {
    let (i, j) = (pos / 8, pos % 8);
    let v = if i % 4 == 0 && j % 4 == 0 {
        0
    } else if i % 2 == 1 && j % 2 == 1 {
        1
    } else if i % 4 == 2 && j % 4 == 2 {
        2
    } else if (i % 4 == 0 && j % 2 == 1) || (i % 2 == 1 && j % 4 == 0) {
        3
    } else if (i % 4 == 0 && j % 4 == 2) || (i % 4 == 2 && j % 4 == 0) {
        4
    } else {
        5
    };

    NORM_ADJUST_8X8[m][v]
}

/// Scaling list selector: intra Y, Cb, Cr then inter Y, Cb, Cr.
pub fn list_4x4(intra: bool, plane: usize) -> usize {
    if intra {
        plane
    } else {
        3 + plane
    }
}

/// Scales coefficients and transforms them to residual samples. The level
/// scales are indexed by scan position, like the scaling lists.
pub struct Dequantizer {
    level_scale_4x4: [[[i32; 16]; 6]; 6],
    level_scale_8x8: [[[i32; 64]; 6]; 2],
}

impl Dequantizer {
    pub fn new(pps: &Pps) -> Self {
        let mut level_scale_4x4 = [[[0; 16]; 6]; 6];
        let mut level_scale_8x8 = [[[0; 64]; 6]; 2];

        for (list, scales) in level_scale_4x4.iter_mut().enumerate() {
            for (m, scale) in scales.iter_mut().enumerate() {
                for k in 0..16 {
                    scale[k] = i32::from(pps.scaling_lists_4x4[list][k])
                        * norm_adjust_4x4(m, ZIGZAG_4X4[k]);
                }
            }
        }

        for (list, scales) in level_scale_8x8.iter_mut().enumerate() {
            for (m, scale) in scales.iter_mut().enumerate() {
                for k in 0..64 {
                    scale[k] = i32::from(pps.scaling_lists_8x8[list][k])
                        * norm_adjust_8x8(m, ZIGZAG_8X8[k]);
                }
            }
        }

        Self {
            level_scale_4x4,
            level_scale_8x8,
        }
    }

    /// Scales the 4x4 block `coeffs` (scan order) and returns the residual
    /// in raster order. When `dc` is set it replaces the first coefficient,
    /// already scaled.
    pub fn residual_4x4(
        &self,
        list: usize,
        qp: i32,
        coeffs: &[i32; 16],
        dc: Option<i32>,
    ) -> [i32; 16] {
        let scale = &self.level_scale_4x4[list][(qp % 6) as usize];
        let shift = qp / 6;
        let mut block = [0i32; 16];

        for k in 0..16 {
            let c = coeffs[k];
            if c == 0 {
                continue;
            }
            block[ZIGZAG_4X4[k]] = if shift >= 4 {
                (c * scale[k]) << (shift - 4)
            } else {
                (c * scale[k] + (1 << (3 - shift))) >> (4 - shift)
            };
        }

        if let Some(dc) = dc {
            block[0] = dc;
        }

        idct_4x4(&mut block);
        block
    }

    /// Scales the 8x8 block `coeffs` (scan order) and returns the residual in
    /// raster order.
    pub fn residual_8x8(&self, intra: bool, qp: i32, coeffs: &[i32; 64]) -> [i32; 64] {
        let scale = &self.level_scale_8x8[usize::from(!intra)][(qp % 6) as usize];
        let shift = qp / 6;
        let mut block = [0i32; 64];

        for k in 0..64 {
            let c = coeffs[k];
            if c == 0 {
                continue;
            }
            block[ZIGZAG_8X8[k]] = if shift >= 6 {
                (c * scale[k]) << (shift - 6)
            } else {
                (c * scale[k] + (1 << (5 - shift))) >> (6 - shift)
            };
        }

        idct_8x8(&mut block);
        block
    }

    /// Intra 16x16 luma DC values, indexed by the raster position of the
    /// 4x4 block they belong to.
    pub fn luma_dc(&self, qp: i32, coeffs: &[i32; 16]) -> [i32; 16] {
        let mut c = [0i32; 16];
        for k in 0..16 {
            c[ZIGZAG_4X4[k]] = coeffs[k];
        }

        let f = hadamard_4x4(&c);
        let scale = self.level_scale_4x4[0][(qp % 6) as usize][0];
        let shift = qp / 6;

        f.map(|v| {
            if shift >= 6 {
                (v * scale) << (shift - 6)
            } else {
                (v * scale + (1 << (5 - shift))) >> (6 - shift)
            }
        })
    }

    /// Chroma DC values of the four 4x4 blocks of a chroma plane.
    pub fn chroma_dc(&self, list: usize, qp: i32, c: &[i32; 4]) -> [i32; 4] {
        let f = [
            c[0] + c[1] + c[2] + c[3],
            c[0] - c[1] + c[2] - c[3],
            c[0] + c[1] - c[2] - c[3],
            c[0] - c[1] - c[2] + c[3],
        ];
        let scale = self.level_scale_4x4[list][(qp % 6) as usize][0];
        let shift = qp / 6;

        f.map(|v| ((v * scale) << shift) >> 5)
    }
}

fn hadamard_4x4(c: &[i32; 16]) -> [i32; 16] {
    let mut tmp = [0i32; 16];
    let mut out = [0i32; 16];

    for i in 0..4 {
        let r = &c[i * 4..i * 4 + 4];
        let s01 = r[0] + r[1];
        let d01 = r[0] - r[1];
        let s23 = r[2] + r[3];
        let d23 = r[2] - r[3];
        tmp[i * 4] = s01 + s23;
        tmp[i * 4 + 1] = s01 - s23;
        tmp[i * 4 + 2] = d01 - d23;
        tmp[i * 4 + 3] = d01 + d23;
    }

    for j in 0..4 {
        let s01 = tmp[j] + tmp[4 + j];
        let d01 = tmp[j] - tmp[4 + j];
        let s23 = tmp[8 + j] + tmp[12 + j];
        let d23 = tmp[8 + j] - tmp[12 + j];
        out[j] = s01 + s23;
        out[4 + j] = s01 - s23;
        out[8 + j] = d01 - d23;
        out[12 + j] = d01 + d23;
    }

    out
}

fn idct_4_points(d: [i32; 4]) -> [i32; 4] {
    let e = d[0] + d[2];
    let f = d[0] - d[2];
    let g = (d[1] >> 1) - d[3];
    let h = d[1] + (d[3] >> 1);

    [e + h, f + g, f - g, e - h]
}

/// 8.5.12.2, including the final rounding.
pub fn idct_4x4(block: &mut [i32; 16]) {
    for i in 0..4 {
        let row = idct_4_points([
            block[i * 4],
            block[i * 4 + 1],
            block[i * 4 + 2],
            block[i * 4 + 3],
        ]);
        block[i * 4..i * 4 + 4].copy_from_slice(&row);
    }

    for j in 0..4 {
        let col = idct_4_points([block[j], block[4 + j], block[8 + j], block[12 + j]]);
        for i in 0..4 {
            block[i * 4 + j] = (col[i] + 32) >> 6;
        }
    }
}

fn idct_8_points(d: [i32; 8]) -> [i32; 8] {
    let a0 = d[0] + d[4];
    let a4 = d[0] - d[4];
    let a2 = (d[2] >> 1) - d[6];
    let a6 = d[2] + (d[6] >> 1);

    let b0 = a0 + a6;
    let b2 = a4 + a2;
    let b4 = a4 - a2;
    let b6 = a0 - a6;

    let a1 = -d[3] + d[5] - d[7] - (d[7] >> 1);
    let a3 = d[1] + d[7] - d[3] - (d[3] >> 1);
    let a5 = -d[1] + d[7] + d[5] + (d[5] >> 1);
    let a7 = d[3] + d[5] + d[1] + (d[1] >> 1);

    let b1 = a1 + (a7 >> 2);
    let b7 = a7 - (a1 >> 2);
    let b3 = a3 + (a5 >> 2);
    let b5 = (a3 >> 2) - a5;

    [
        b0 + b7,
        b2 + b5,
        b4 + b3,
        b6 + b1,
        b6 - b1,
        b4 - b3,
        b2 - b5,
        b0 - b7,
    ]
}

/// 8.5.13.2, including the final rounding.
pub fn idct_8x8(block: &mut [i32; 64]) {
    for i in 0..8 {
        let mut row = [0i32; 8];
        row.copy_from_slice(&block[i * 8..i * 8 + 8]);
        block[i * 8..i * 8 + 8].copy_from_slice(&idct_8_points(row));
    }

    for j in 0..8 {
        let mut col = [0i32; 8];
        for i in 0..8 {
            col[i] = block[i * 8 + j];
        }
        let col = idct_8_points(col);
        for i in 0..8 {
            block[i * 8 + j] = (col[i] + 32) >> 6;
        }
    }
}

/// Adds a `size`x`size` residual to the prediction already in `plane`.
pub fn add_residual(plane: &mut Plane, x: usize, y: usize, size: usize, residual: &[i32]) {
    for j in 0..size {
        let row = (y + j) * plane.width + x;
        for i in 0..size {
            let sample = &mut plane.data[row + i];
            *sample = (i32::from(*sample) + residual[j * size + i]).clamp(0, 255) as u8;
        }
    }
}
