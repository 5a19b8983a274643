// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software H.264 decoding and frame grabbing.
//!
//! The [`frame_grab::FrameGrab`] controller pulls samples from a demuxer
//! track, decodes them with [`decoder::h264::H264Decoder`] and returns the
//! pictures in presentation order, with their timestamps.

pub mod bitstream_utils;
pub mod codec;
pub mod decoder;
pub mod frame_grab;

use std::fmt::Debug;
use std::marker::PhantomData;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// A rectangle within a picture, in luma samples.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<Resolution> for Rect {
    fn from(resolution: Resolution) -> Self {
        Rect {
            x: 0,
            y: 0,
            width: resolution.width,
            height: resolution.height,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i420" | "I420" => Ok(DecodedFormat::I420),
            _ => Err("unrecognized output format. Valid values: nv12, i420"),
        }
    }
}

/// Capabilities of a 4:2:0 8-bit sample layout. Implemented by the [`I420`]
/// and [`Nv12`] tags that parameterize [`Picture`].
pub trait SampleFormat: Copy + Clone + Debug + Default + 'static {
    const FORMAT: DecodedFormat;

    /// Number of planes of the layout.
    fn num_planes() -> usize;

    /// Width in bytes and height in rows of plane `plane` for a picture of
    /// `resolution`.
    fn plane_size(resolution: Resolution, plane: usize) -> (usize, usize);

    /// Splits `planes` into separate Y, U and V planes.
    fn to_i420(planes: &[Vec<u8>], resolution: Resolution) -> [Vec<u8>; 3];

    /// Builds the planes of this layout from separate Y, U and V planes.
    fn from_i420(planes: [Vec<u8>; 3], resolution: Resolution) -> Vec<Vec<u8>>;
}

fn chroma_size(resolution: Resolution) -> (usize, usize) {
    (
        (resolution.width as usize + 1) / 2,
        (resolution.height as usize + 1) / 2,
    )
}

/// Planar Y, U, V.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct I420;

impl SampleFormat for I420 {
    const FORMAT: DecodedFormat = DecodedFormat::I420;

    fn num_planes() -> usize {
        3
    }

    fn plane_size(resolution: Resolution, plane: usize) -> (usize, usize) {
        match plane {
            0 => (resolution.width as usize, resolution.height as usize),
            _ => chroma_size(resolution),
        }
    }

    fn to_i420(planes: &[Vec<u8>], _: Resolution) -> [Vec<u8>; 3] {
        [planes[0].clone(), planes[1].clone(), planes[2].clone()]
    }

    fn from_i420(planes: [Vec<u8>; 3], _: Resolution) -> Vec<Vec<u8>> {
        planes.into()
    }
}

/// Planar Y followed by interleaved U and V.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Nv12;

impl SampleFormat for Nv12 {
    const FORMAT: DecodedFormat = DecodedFormat::NV12;

    fn num_planes() -> usize {
        2
    }

    fn plane_size(resolution: Resolution, plane: usize) -> (usize, usize) {
        match plane {
            0 => (resolution.width as usize, resolution.height as usize),
            _ => {
                let (width, height) = chroma_size(resolution);
                (width * 2, height)
            }
        }
    }

    fn to_i420(planes: &[Vec<u8>], _: Resolution) -> [Vec<u8>; 3] {
        let u = planes[1].iter().step_by(2).copied().collect();
        let v = planes[1].iter().skip(1).step_by(2).copied().collect();
        [planes[0].clone(), u, v]
    }

    fn from_i420(planes: [Vec<u8>; 3], _: Resolution) -> Vec<Vec<u8>> {
        let [y, u, v] = planes;
        let uv = u.iter().zip(v.iter()).flat_map(|(u, v)| [*u, *v]).collect();
        vec![y, uv]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PictureError {
    #[error("expected {expected} planes, got {got}")]
    PlaneCount { expected: usize, got: usize },
    #[error("plane {plane} holds {got} bytes, {expected} expected")]
    PlaneSize {
        plane: usize,
        expected: usize,
        got: usize,
    },
}

/// A decoded picture: 8-bit 4:2:0 samples laid out as `F`, plus its visible
/// rectangle and picture order count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Picture<F: SampleFormat = I420> {
    planes: Vec<Vec<u8>>,
    resolution: Resolution,
    crop: Rect,
    poc: i32,
    _format: PhantomData<F>,
}

impl<F: SampleFormat> Picture<F> {
    /// Creates a mid-grey picture of `resolution`.
    pub fn new(resolution: Resolution) -> Self {
        let planes = (0..F::num_planes())
            .map(|i| {
                let (width, height) = F::plane_size(resolution, i);
                vec![128u8; width * height]
            })
            .collect();

        Self {
            planes,
            resolution,
            crop: resolution.into(),
            poc: 0,
            _format: PhantomData,
        }
    }

    /// Creates a picture from its planes, which must be tightly packed.
    pub fn from_planes(
        planes: Vec<Vec<u8>>,
        resolution: Resolution,
        crop: Rect,
        poc: i32,
    ) -> Result<Self, PictureError> {
        if planes.len() != F::num_planes() {
            return Err(PictureError::PlaneCount {
                expected: F::num_planes(),
                got: planes.len(),
            });
        }

        for (i, plane) in planes.iter().enumerate() {
            let (width, height) = F::plane_size(resolution, i);
            if plane.len() != width * height {
                return Err(PictureError::PlaneSize {
                    plane: i,
                    expected: width * height,
                    got: plane.len(),
                });
            }
        }

        let mut picture = Self {
            planes,
            resolution,
            crop: resolution.into(),
            poc,
            _format: PhantomData,
        };
        picture.set_crop(crop);

        Ok(picture)
    }

    pub fn format(&self) -> DecodedFormat {
        F::FORMAT
    }

    /// Returns the size of the sample buffers.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Returns the visible rectangle of the picture.
    pub fn crop(&self) -> Rect {
        self.crop
    }

    /// Sets the visible rectangle, clamped to the picture.
    pub fn set_crop(&mut self, crop: Rect) {
        let x = std::cmp::min(crop.x, self.resolution.width);
        let y = std::cmp::min(crop.y, self.resolution.height);

        self.crop = Rect {
            x,
            y,
            width: std::cmp::min(crop.width, self.resolution.width - x),
            height: std::cmp::min(crop.height, self.resolution.height - y),
        };
    }

    pub fn poc(&self) -> i32 {
        self.poc
    }

    pub fn bit_depth(&self) -> u8 {
        8
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, plane: usize) -> &[u8] {
        &self.planes[plane]
    }

    pub fn plane_mut(&mut self, plane: usize) -> &mut [u8] {
        &mut self.planes[plane]
    }

    pub fn plane_width(&self, plane: usize) -> usize {
        F::plane_size(self.resolution, plane).0
    }

    pub fn plane_height(&self, plane: usize) -> usize {
        F::plane_size(self.resolution, plane).1
    }

    /// Returns a new picture holding only the visible rectangle.
    pub fn clone_cropped(&self) -> Self {
        let resolution = Resolution {
            width: self.crop.width,
            height: self.crop.height,
        };

        let [y, u, v] = F::to_i420(&self.planes, self.resolution);
        let src = [y.as_slice(), u.as_slice(), v.as_slice()];
        let mut dst = vec![0u8; decoded_frame_size(DecodedFormat::I420, resolution)];
        i420_copy(
            src,
            &mut dst,
            resolution.width as usize,
            resolution.height as usize,
            self.i420_strides(),
            self.i420_offsets(),
        );

        let y_size = resolution.width as usize * resolution.height as usize;
        let (chroma_width, chroma_height) = chroma_size(resolution);
        let chroma_plane_size = chroma_width * chroma_height;
        let v = dst.split_off(y_size + chroma_plane_size);
        let u = dst.split_off(y_size);

        Self {
            planes: F::from_i420([dst, u, v], resolution),
            resolution,
            crop: resolution.into(),
            poc: self.poc,
            _format: PhantomData,
        }
    }

    /// Returns the visible samples, tightly packed in the layout of `F`.
    pub fn to_vec(&self) -> Vec<u8> {
        let width = self.crop.width as usize;
        let height = self.crop.height as usize;
        let mut dst = vec![0u8; decoded_frame_size(F::FORMAT, self.crop.into_resolution())];

        match F::FORMAT {
            DecodedFormat::I420 => {
                let src = [
                    self.planes[0].as_slice(),
                    self.planes[1].as_slice(),
                    self.planes[2].as_slice(),
                ];
                i420_copy(
                    src,
                    &mut dst,
                    width,
                    height,
                    self.i420_strides(),
                    self.i420_offsets(),
                )
            }
            DecodedFormat::NV12 => {
                let luma_width = self.resolution.width as usize;
                let src = [self.planes[0].as_slice(), self.planes[1].as_slice()];
                let offsets = [
                    self.crop.y as usize * luma_width + self.crop.x as usize,
                    (self.crop.y as usize / 2) * self.plane_width(1) + (self.crop.x as usize & !1),
                ];
                nv12_copy(
                    src,
                    &mut dst,
                    width,
                    height,
                    [luma_width, self.plane_width(1)],
                    offsets,
                )
            }
        }

        dst
    }

    /// Returns the picture with its samples laid out as `G`.
    pub fn convert<G: SampleFormat>(&self) -> Picture<G> {
        let planes = G::from_i420(F::to_i420(&self.planes, self.resolution), self.resolution);

        Picture {
            planes,
            resolution: self.resolution,
            crop: self.crop,
            poc: self.poc,
            _format: PhantomData,
        }
    }

    /// Largest absolute difference between two samples of the visible areas
    /// of `self` and `other`, or `None` if the areas differ in size.
    pub fn max_diff<G: SampleFormat>(&self, other: &Picture<G>) -> Option<u8> {
        if self.crop.width != other.crop.width || self.crop.height != other.crop.height {
            return None;
        }

        let a = self.convert::<I420>().to_vec();
        let b = other.convert::<I420>().to_vec();

        a.iter().zip(b.iter()).map(|(a, b)| a.abs_diff(*b)).max()
    }

    /// Whether the visible areas of `self` and `other` differ by at most
    /// `tolerance` on every sample.
    pub fn roughly_equal<G: SampleFormat>(&self, other: &Picture<G>, tolerance: u8) -> bool {
        matches!(self.max_diff(other), Some(diff) if diff <= tolerance)
    }

    fn i420_strides(&self) -> [usize; 3] {
        let luma_width = self.resolution.width as usize;
        let chroma_width = chroma_size(self.resolution).0;
        [luma_width, chroma_width, chroma_width]
    }

    fn i420_offsets(&self) -> [usize; 3] {
        let [luma_stride, chroma_stride, _] = self.i420_strides();
        let x = self.crop.x as usize;
        let y = self.crop.y as usize;
        let chroma_offset = (y / 2) * chroma_stride + x / 2;
        [y * luma_stride + x, chroma_offset, chroma_offset]
    }
}

impl Rect {
    fn into_resolution(self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }
}

/// Default per-sample tolerance of [`Picture::roughly_equal`] comparisons
/// against reference dumps.
pub const DEFAULT_SAMPLE_TOLERANCE: u8 = 50;

/// Copies `src` into `dst` as NV12, removing any extra padding.
pub fn nv12_copy(
    src: [&[u8]; 2],
    mut dst: &mut [u8],
    width: usize,
    height: usize,
    strides: [usize; 2],
    offsets: [usize; 2],
) {
    let mut luma = &src[0][offsets[0]..];

    // Copy luma
    for row in 0..height {
        dst[..width].copy_from_slice(&luma[..width]);
        dst = &mut dst[width..];
        if row + 1 < height {
            luma = &luma[strides[0]..];
        }
    }

    // Align width and height to 2 for UV plane.
    let width = if width % 2 == 1 { width + 1 } else { width };
    let height = if height % 2 == 1 { height + 1 } else { height };

    // 1 sample per 4 pixels, but we have two components per line.
    let height = height / 2;

    let mut chroma = &src[1][offsets[1]..];

    // Copy chroma
    for row in 0..height {
        dst[..width].copy_from_slice(&chroma[..width]);
        dst = &mut dst[width..];
        if row + 1 < height {
            chroma = &chroma[strides[1]..];
        }
    }
}

/// Copies `src` into `dst` as I420, removing any extra padding.
pub fn i420_copy(
    src: [&[u8]; 3],
    mut dst: &mut [u8],
    width: usize,
    height: usize,
    strides: [usize; 3],
    offsets: [usize; 3],
) {
    let mut luma = &src[0][offsets[0]..];

    // Copy luma
    for row in 0..height {
        dst[..width].copy_from_slice(&luma[..width]);
        dst = &mut dst[width..];
        if row + 1 < height {
            luma = &luma[strides[0]..];
        }
    }

    // Align width and height to 2 for U and V planes.
    let width = if width % 2 == 1 { width + 1 } else { width };
    let height = if height % 2 == 1 { height + 1 } else { height };

    // 1 sample per 4 pixels.
    let width = width / 2;
    let height = height / 2;

    for plane in 1..3 {
        let mut chroma = &src[plane][offsets[plane]..];

        for row in 0..height {
            dst[..width].copy_from_slice(&chroma[..width]);
            dst = &mut dst[width..];
            if row + 1 < height {
                chroma = &chroma[strides[plane]..];
            }
        }
    }
}

/// Returns the size required to store a frame of `format` and `resolution`,
/// without any padding. This is the minimum size of the destination buffer
/// passed to `nv12_copy` or `i420_copy`.
pub fn decoded_frame_size(format: DecodedFormat, resolution: Resolution) -> usize {
    let width = resolution.width as usize;
    let height = resolution.height as usize;

    match format {
        DecodedFormat::I420 | DecodedFormat::NV12 => {
            let y_size = width * height;
            // U and V planes need to be aligned to 2.
            let uv_size = ((width + 1) / 2) * ((height + 1) / 2) * 2;

            y_size + uv_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(resolution: Resolution) -> Picture<I420> {
        let mut picture = Picture::<I420>::new(resolution);
        for plane in 0..3 {
            let width = picture.plane_width(plane);
            for (i, sample) in picture.plane_mut(plane).iter_mut().enumerate() {
                *sample = ((i % width) * 4 + (i / width) + plane * 50) as u8;
            }
        }
        picture
    }

    #[test]
    fn format_from_str() {
        assert_eq!(DecodedFormat::from_str("nv12"), Ok(DecodedFormat::NV12));
        assert_eq!(DecodedFormat::from_str("I420"), Ok(DecodedFormat::I420));
        assert!(DecodedFormat::from_str("yuyv").is_err());
    }

    #[test]
    fn crop_is_clamped() {
        let mut picture = Picture::<I420>::new(Resolution {
            width: 32,
            height: 16,
        });
        picture.set_crop(Rect {
            x: 8,
            y: 4,
            width: 100,
            height: 100,
        });

        assert_eq!(
            picture.crop(),
            Rect {
                x: 8,
                y: 4,
                width: 24,
                height: 12
            }
        );
    }

    #[test]
    fn to_vec_packs_visible_area() {
        let mut picture = gradient(Resolution {
            width: 8,
            height: 4,
        });
        picture.set_crop(Rect {
            x: 2,
            y: 2,
            width: 4,
            height: 2,
        });

        let packed = picture.to_vec();
        assert_eq!(packed.len(), 4 * 2 + 2 * 2);
        assert_eq!(&packed[..4], &picture.plane(0)[2 * 8 + 2..2 * 8 + 6]);
        assert_eq!(packed[8], picture.plane(1)[4 + 1]);
        assert_eq!(packed[10], picture.plane(2)[4 + 1]);
    }

    #[test]
    fn nv12_conversion_is_lossless() {
        let picture = gradient(Resolution {
            width: 16,
            height: 16,
        });

        let nv12 = picture.convert::<Nv12>();
        assert_eq!(nv12.num_planes(), 2);
        assert_eq!(nv12.plane_width(1), 16);
        assert_eq!(nv12.plane(1)[0], picture.plane(1)[0]);
        assert_eq!(nv12.plane(1)[1], picture.plane(2)[0]);

        assert_eq!(nv12.convert::<I420>(), picture);
        assert_eq!(nv12.max_diff(&picture), Some(0));
        assert_eq!(nv12.to_vec().len(), picture.to_vec().len());
    }

    #[test]
    fn clone_cropped_keeps_visible_samples() {
        let mut picture = gradient(Resolution {
            width: 16,
            height: 16,
        });
        picture.set_crop(Rect {
            x: 4,
            y: 2,
            width: 8,
            height: 10,
        });

        let cropped = picture.clone_cropped();
        assert_eq!(
            cropped.resolution(),
            Resolution {
                width: 8,
                height: 10
            }
        );
        assert_eq!(cropped.to_vec(), picture.to_vec());
        assert!(cropped.roughly_equal(&picture, 0));
    }

    #[test]
    fn roughly_equal_uses_tolerance() {
        let resolution = Resolution {
            width: 16,
            height: 16,
        };
        let a = Picture::<I420>::new(resolution);
        let mut b = Picture::<I420>::new(resolution);
        b.plane_mut(0)[5] = 128 + 40;

        assert_eq!(a.max_diff(&b), Some(40));
        assert!(a.roughly_equal(&b, DEFAULT_SAMPLE_TOLERANCE));
        assert!(!a.roughly_equal(&b, 39));

        let c = Picture::<I420>::new(Resolution {
            width: 32,
            height: 16,
        });
        assert!(!a.roughly_equal(&c, 255));
    }
}
