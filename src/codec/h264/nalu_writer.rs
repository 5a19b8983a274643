// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Write;

use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Byte sink that inserts an `emulation_prevention_three_byte` wherever the
/// payload would otherwise contain `00 00 0x` with `x <= 3` (7.4.1).
struct Escaper<W: Write> {
    out: W,
    /// Number of consecutive zero bytes written last.
    zeros: usize,
    enabled: bool,
}

impl<W: Write> Escaper<W> {
    fn new(out: W, enabled: bool) -> Self {
        Self {
            out,
            zeros: 0,
            enabled,
        }
    }

    /// Writes `bytes` as is. Used for start codes and NAL unit headers.
    fn write_unescaped(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.zeros = 0;
        self.out.write_all(bytes)
    }
}

impl<W: Write> Write for Escaper<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.enabled {
            self.out.write_all(buf)?;
            return Ok(buf.len());
        }

        for &byte in buf {
            if self.zeros >= 2 && byte <= 0x03 {
                self.out.write_all(&[0x03])?;
                self.zeros = 0;
            }

            self.out.write_all(&[byte])?;
            self.zeros = if byte == 0x00 { self.zeros + 1 } else { 0 };
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

#[derive(Error, Debug)]
pub enum NaluWriterError {
    #[error("value {0} cannot be coded as ue(v)")]
    Overflow(u32),
    #[error("NAL unit header written in the middle of a byte")]
    Unaligned,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    BitWriterError(#[from] BitWriterError),
}

pub type NaluWriterResult<T> = std::result::Result<T, NaluWriterError>;

/// Writes Annex B NAL units: a start code, the NAL unit header, then the RBSP
/// bits with emulation prevention when enabled.
pub struct NaluWriter<W: Write>(BitWriter<Escaper<W>>);

impl<W: Write> NaluWriter<W> {
    pub fn new(writer: W, ep_enabled: bool) -> Self {
        Self(BitWriter::new(Escaper::new(writer, ep_enabled)))
    }

    /// `f(n)`: a fixed-size pattern of up to 32 bits.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        Ok(self.0.write_f(bits, value)?)
    }

    /// `u(n)`: an unsigned integer of up to 32 bits.
    pub fn write_u<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.write_f(bits, value)
    }

    /// `ue(v)` (9.1).
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> NaluWriterResult<()> {
        let value: u32 = value.into();
        let code_num = value
            .checked_add(1)
            .ok_or(NaluWriterError::Overflow(value))?;
        let len = 32 - code_num.leading_zeros() as usize;

        self.write_f(len - 1, 0u32)?;
        self.write_f(len, code_num)?;

        Ok(())
    }

    /// `se(v)` (9.1.1).
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> NaluWriterResult<()> {
        let value: i32 = value.into();
        let magnitude = value.unsigned_abs();

        let code_num = if value > 0 {
            2 * magnitude - 1
        } else {
            2 * magnitude
        };

        self.write_ue(code_num)
    }

    /// Starts a new NAL unit with a four byte start code and its header.
    pub fn write_header(&mut self, ref_idc: u8, type_: u8) -> NaluWriterResult<()> {
        if !self.aligned() {
            return Err(NaluWriterError::Unaligned);
        }

        let header = ((ref_idc & 0x3) << 5) | (type_ & 0x1f);
        self.0.inner_mut().write_unescaped(&START_CODE)?;
        self.0.inner_mut().write_unescaped(&[header])?;

        Ok(())
    }

    /// Whether the next bit starts a new byte.
    pub fn aligned(&self) -> bool {
        !self.0.has_data_pending()
    }
}
