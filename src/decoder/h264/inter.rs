// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fractional sample interpolation and weighted sample prediction (8.4.2).

use crate::decoder::h264::frame::Mv;
use crate::decoder::h264::frame::Plane;

const TAPS: [i32; 6] = [1, -5, 20, 20, -5, 1];

#[inline]
fn clip1(v: i32) -> i32 {
    v.clamp(0, 255)
}

/// Reference samples around a block, with two samples of margin before and
/// three after in each direction, read with edge clamping.
struct Window {
    samples: [i32; 21 * 21],
    stride: usize,
}

impl Window {
    fn new(refp: &Plane, x0: i32, y0: i32, w: usize, h: usize) -> Self {
        let stride = w + 5;
        let mut samples = [0; 21 * 21];

        for r in 0..h + 5 {
            for c in 0..stride {
                let sample = refp.clamped(x0 - 2 + c as i32, y0 - 2 + r as i32);
                samples[r * stride + c] = i32::from(sample);
            }
        }

        Self { samples, stride }
    }

    /// Integer sample at (x, y) relative to the block origin.
    #[inline]
    fn full(&self, x: usize, y: usize) -> i32 {
        self.samples[(y + 2) * self.stride + x + 2]
    }

    /// Unscaled horizontal half sample between (x, y) and (x + 1, y), for
    /// window row `r` (y + 2).
    #[inline]
    fn b1_row(&self, x: usize, r: usize) -> i32 {
        let row = r * self.stride + x;
        (0..6).map(|k| TAPS[k] * self.samples[row + k]).sum()
    }

    /// Unscaled vertical half sample between (x, y) and (x, y + 1).
    #[inline]
    fn h1(&self, x: usize, y: usize) -> i32 {
        (0..6)
            .map(|k| TAPS[k] * self.samples[(y + k) * self.stride + x + 2])
            .sum()
    }

    #[inline]
    fn b(&self, x: usize, y: usize) -> i32 {
        clip1((self.b1_row(x, y + 2) + 16) >> 5)
    }

    #[inline]
    fn h(&self, x: usize, y: usize) -> i32 {
        clip1((self.h1(x, y) + 16) >> 5)
    }

    /// Central half sample j.
    #[inline]
    fn j(&self, x: usize, y: usize) -> i32 {
        let j1: i32 = (0..6).map(|k| TAPS[k] * self.b1_row(x, y + k)).sum();
        clip1((j1 + 512) >> 10)
    }
}

/// Luma sample interpolation (8.4.2.2.1) of the `w`x`h` block at (`x`, `y`)
/// displaced by `mv`. Writes `w * h` samples to `out`.
pub fn luma_block(refp: &Plane, x: i32, y: i32, w: usize, h: usize, mv: Mv, out: &mut [u8]) {
    let mvx = i32::from(mv.x);
    let mvy = i32::from(mv.y);
    let x_frac = mvx & 3;
    let y_frac = mvy & 3;
    let win = Window::new(refp, x + (mvx >> 2), y + (mvy >> 2), w, h);

    for yy in 0..h {
        for xx in 0..w {
            let v = match (x_frac, y_frac) {
                (0, 0) => win.full(xx, yy),
                (1, 0) => (win.full(xx, yy) + win.b(xx, yy) + 1) >> 1,
                (2, 0) => win.b(xx, yy),
                (3, 0) => (win.b(xx, yy) + win.full(xx + 1, yy) + 1) >> 1,
                (0, 1) => (win.full(xx, yy) + win.h(xx, yy) + 1) >> 1,
                (0, 2) => win.h(xx, yy),
                (0, 3) => (win.h(xx, yy) + win.full(xx, yy + 1) + 1) >> 1,
                (2, 2) => win.j(xx, yy),
                (2, 1) => (win.b(xx, yy) + win.j(xx, yy) + 1) >> 1,
                (2, 3) => (win.j(xx, yy) + win.b(xx, yy + 1) + 1) >> 1,
                (1, 2) => (win.h(xx, yy) + win.j(xx, yy) + 1) >> 1,
                (3, 2) => (win.j(xx, yy) + win.h(xx + 1, yy) + 1) >> 1,
                (1, 1) => (win.b(xx, yy) + win.h(xx, yy) + 1) >> 1,
                (3, 1) => (win.b(xx, yy) + win.h(xx + 1, yy) + 1) >> 1,
                (1, 3) => (win.h(xx, yy) + win.b(xx, yy + 1) + 1) >> 1,
                _ => (win.h(xx + 1, yy) + win.b(xx, yy + 1) + 1) >> 1,
            };
            out[yy * w + xx] = v as u8;
        }
    }
}

/// Chroma sample interpolation (8.4.2.2.2) for 4:2:0. (`x`, `y`) and the
/// block size are in chroma samples; `mv` is the luma motion vector, which
/// is in 1/8 chroma sample units.
pub fn chroma_block(refp: &Plane, x: i32, y: i32, w: usize, h: usize, mv: Mv, out: &mut [u8]) {
    let mvx = i32::from(mv.x);
    let mvy = i32::from(mv.y);
    let xf = mvx & 7;
    let yf = mvy & 7;
    let x0 = x + (mvx >> 3);
    let y0 = y + (mvy >> 3);

    for yy in 0..h as i32 {
        for xx in 0..w as i32 {
            let a = i32::from(refp.clamped(x0 + xx, y0 + yy));
            let b = i32::from(refp.clamped(x0 + xx + 1, y0 + yy));
            let c = i32::from(refp.clamped(x0 + xx, y0 + yy + 1));
            let d = i32::from(refp.clamped(x0 + xx + 1, y0 + yy + 1));

            let v = ((8 - xf) * (8 - yf) * a
                + xf * (8 - yf) * b
                + (8 - xf) * yf * c
                + xf * yf * d
                + 32)
                >> 6;
            out[(yy * w as i32 + xx) as usize] = v as u8;
        }
    }
}

/// Explicit weighting factors of one reference picture for one colour
/// component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Weight {
    pub w: i32,
    pub o: i32,
}

/// How the prediction samples of a partition are combined (8.4.2.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Weighting {
    Default,
    Weighted {
        log_wd: i32,
        w0: Weight,
        w1: Weight,
    },
}

/// Writes the final prediction of a `w`x`h` block to `dst` at (`x`, `y`).
/// At least one of `p0` and `p1` must be set.
#[allow(clippy::too_many_arguments)]
pub fn combine(
    dst: &mut Plane,
    x: usize,
    y: usize,
    w: usize,
    h: usize,
    p0: Option<&[u8]>,
    p1: Option<&[u8]>,
    weighting: Weighting,
) {
    for yy in 0..h {
        for xx in 0..w {
            let i = yy * w + xx;
            let s0 = p0.map(|p| i32::from(p[i]));
            let s1 = p1.map(|p| i32::from(p[i]));

            let v = match (weighting, s0, s1) {
                (Weighting::Default, Some(a), Some(b)) => (a + b + 1) >> 1,
                (Weighting::Default, Some(a), None) | (Weighting::Default, None, Some(a)) => a,
                (Weighting::Weighted { log_wd, w0, w1 }, Some(a), Some(b)) => {
                    let rounding = 1 << log_wd;
                    ((a * w0.w + b * w1.w + rounding) >> (log_wd + 1)) + ((w0.o + w1.o + 1) >> 1)
                }
                (Weighting::Weighted { log_wd, w0, .. }, Some(a), None) => {
                    weight_single(a, log_wd, w0)
                }
                (Weighting::Weighted { log_wd, w1, .. }, None, Some(b)) => {
                    weight_single(b, log_wd, w1)
                }
                (_, None, None) => 128,
            };

            dst.set(x + xx, y + yy, clip1(v) as u8);
        }
    }
}

fn weight_single(s: i32, log_wd: i32, weight: Weight) -> i32 {
    if log_wd >= 1 {
        ((s * weight.w + (1 << (log_wd - 1))) >> log_wd) + weight.o
    } else {
        s * weight.w + weight.o
    }
}
