// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use crate::Picture;
use crate::PictureError;
use crate::Rect;
use crate::Resolution;
use crate::I420;

/// Unique identifier of a decoded frame, used to tell whether two motion
/// vectors point to the same reference picture. Zero means "no reference".
pub type FrameId = u64;

pub const NO_FRAME: FrameId = 0;

/// A motion vector in quarter luma samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mv {
    pub x: i16,
    pub y: i16,
}

impl Mv {
    pub const ZERO: Mv = Mv { x: 0, y: 0 };

    pub fn new(x: i32, y: i32) -> Self {
        Mv {
            x: x.clamp(i16::MIN.into(), i16::MAX.into()) as i16,
            y: y.clamp(i16::MIN.into(), i16::MAX.into()) as i16,
        }
    }
}

/// An entry of a reference picture list.
#[derive(Clone, Debug, Default)]
pub struct RefPicture {
    /// `None` for frames inferred by a gap in `frame_num`, which cannot be
    /// predicted from.
    pub frame: Option<Rc<Frame>>,
    pub poc: i32,
    pub long_term: bool,
}

impl RefPicture {
    pub fn id(&self) -> FrameId {
        self.frame.as_ref().map(|f| f.id).unwrap_or(NO_FRAME)
    }
}

/// One plane of samples, stored without padding.
#[derive(Clone, Debug)]
pub struct Plane {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl Plane {
    fn new(width: usize, height: usize) -> Self {
        Self {
            data: vec![128; width * height],
            width,
            height,
        }
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.width + x] = value;
    }

    /// Returns the sample at (`x`, `y`), with the coordinates clamped to the
    /// plane as required by motion compensation.
    #[inline]
    pub fn clamped(&self, x: i32, y: i32) -> u8 {
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.data[y * self.width + x]
    }
}

/// Motion of a frame, kept at 4x4 block granularity for the direct
/// prediction of later frames and for deblocking.
#[derive(Clone, Debug)]
pub struct MotionField {
    width4: usize,
    pub mv: Vec<[Mv; 2]>,
    /// -1 when the list is not used (or the block is intra coded).
    pub ref_idx: Vec<[i8; 2]>,
    pub ref_id: Vec<[FrameId; 2]>,
}

impl MotionField {
    fn new(width_in_mbs: usize, height_in_mbs: usize) -> Self {
        let num_blocks = width_in_mbs * height_in_mbs * 16;

        Self {
            width4: width_in_mbs * 4,
            mv: vec![[Mv::ZERO; 2]; num_blocks],
            ref_idx: vec![[-1; 2]; num_blocks],
            ref_id: vec![[NO_FRAME; 2]; num_blocks],
        }
    }

    /// Index of the 4x4 block at (`x4`, `y4`), in 4x4 block units.
    #[inline]
    pub fn index(&self, x4: usize, y4: usize) -> usize {
        y4 * self.width4 + x4
    }
}

/// A frame under reconstruction or held by the DPB.
#[derive(Clone, Debug)]
pub struct Frame {
    pub id: FrameId,
    pub width_in_mbs: usize,
    pub height_in_mbs: usize,
    /// Y, Cb and Cr planes.
    pub planes: [Plane; 3],
    pub motion: MotionField,
}

impl Frame {
    pub fn new(id: FrameId, width_in_mbs: usize, height_in_mbs: usize) -> Self {
        let width = width_in_mbs * 16;
        let height = height_in_mbs * 16;

        Self {
            id,
            width_in_mbs,
            height_in_mbs,
            planes: [
                Plane::new(width, height),
                Plane::new(width / 2, height / 2),
                Plane::new(width / 2, height / 2),
            ],
            motion: MotionField::new(width_in_mbs, height_in_mbs),
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: (self.width_in_mbs * 16) as u32,
            height: (self.height_in_mbs * 16) as u32,
        }
    }

    /// Copies the samples into an output picture.
    pub fn to_picture(&self, crop: Rect, poc: i32) -> Result<Picture<I420>, PictureError> {
        Picture::from_planes(
            self.planes.iter().map(|p| p.data.clone()).collect(),
            self.resolution(),
            crop,
            poc,
        )
    }
}
