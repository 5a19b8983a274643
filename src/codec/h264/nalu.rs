// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::borrow::Cow;
use std::fmt::Debug;
use std::io::Cursor;

use anyhow::anyhow;
use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use bytes::Buf;

pub trait Header: Sized {
    /// Parse the NALU header, returning it.
    fn parse<T: AsRef<[u8]>>(cursor: &Cursor<T>) -> anyhow::Result<Self>;
    /// Whether this header type indicates EOS.
    fn is_end(&self) -> bool;
    /// The length of the header.
    fn len(&self) -> usize;
}

/// A NAL unit, either borrowed from an Annex B / length-prefixed buffer or
/// owned.
#[derive(Debug)]
pub struct Nalu<'a, U> {
    pub header: U,
    /// The mapping that backs this NALU. Possibly shared with the other NALUs
    /// in the Access Unit.
    pub data: Cow<'a, [u8]>,

    pub size: usize,
    pub offset: usize,
    pub sc_offset: usize,
}

impl<'a, U> Nalu<'a, U>
where
    U: Debug + Header,
{
    fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
        // discard all zeroes until the start code pattern is found
        data[offset..]
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])
    }

    /// Find the next Annex B encoded NAL unit.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> anyhow::Result<Nalu<'a, U>> {
        let bitstream = *cursor.get_ref();
        let pos = usize::try_from(cursor.position())?;

        if pos >= bitstream.len() {
            return Err(anyhow!("No NAL found"));
        }

        // Find the start code for this NALU
        let current_nalu_offset = match Self::find_start_code(bitstream, pos) {
            Some(offset) => offset,
            None => return Err(anyhow!("No NAL found")),
        };

        let mut start_code_offset = pos + current_nalu_offset;

        // If the preceding byte is 00, then we actually have a four byte SC,
        // i.e. 00 00 00 01 Where the first 00 is the "zero_byte()"
        if start_code_offset > 0 && bitstream[start_code_offset - 1] == 00 {
            start_code_offset -= 1;
        }

        // The NALU offset is its offset + 3 bytes to skip the start code.
        let nalu_offset = pos + current_nalu_offset + 3;

        // Set the bitstream position to the start of the current NALU
        cursor.set_position(u64::try_from(nalu_offset)?);

        let hdr = U::parse(cursor)?;

        // Find the start of the subsequent NALU.
        let mut next_nalu_offset = match Self::find_start_code(bitstream, nalu_offset) {
            Some(offset) => offset,
            None => cursor.chunk().len(), // Whatever data is left must be part of the current NALU
        };

        while next_nalu_offset > 0 && bitstream[nalu_offset + next_nalu_offset - 1] == 00 {
            // Discard trailing_zero_8bits
            next_nalu_offset -= 1;
        }

        let nal_size = if hdr.is_end() { 1 } else { next_nalu_offset };

        cursor.set_position(u64::try_from(nalu_offset + nal_size)?);

        Ok(Nalu {
            header: hdr,
            data: Cow::Borrowed(bitstream),
            size: nal_size,
            offset: nalu_offset,
            sc_offset: start_code_offset,
        })
    }

    /// Read the next NAL unit of a length-prefixed (AVCC) sample, where each
    /// NAL unit is preceded by its size coded on `length_size` big-endian bytes.
    pub fn next_length_prefixed(
        cursor: &mut Cursor<&'a [u8]>,
        length_size: usize,
    ) -> anyhow::Result<Nalu<'a, U>> {
        let bitstream = *cursor.get_ref();
        let sc_offset = usize::try_from(cursor.position())?;

        let size = match length_size {
            1 => usize::from(cursor.read_u8()?),
            2 => usize::from(cursor.read_u16::<BigEndian>()?),
            3 => usize::try_from(cursor.read_u24::<BigEndian>()?)?,
            4 => usize::try_from(cursor.read_u32::<BigEndian>()?)?,
            _ => return Err(anyhow!("Invalid NAL length size {}", length_size)),
        };

        let offset = sc_offset + length_size;
        if size == 0 || offset + size > bitstream.len() {
            return Err(anyhow!(
                "NAL unit of {} bytes at offset {} overflows the {} bytes sample",
                size,
                offset,
                bitstream.len()
            ));
        }

        let header = U::parse(cursor)?;
        cursor.set_position(u64::try_from(offset + size)?);

        Ok(Nalu {
            header,
            data: Cow::Borrowed(bitstream),
            size,
            offset,
            sc_offset,
        })
    }

    /// Create an owned NAL unit from raw NAL bytes (header included, no start
    /// code), e.g. as stored in an avcC record.
    pub fn from_raw(data: &[u8]) -> anyhow::Result<Nalu<'static, U>> {
        let bytes = data.to_vec();
        let header = U::parse(&Cursor::new(&bytes))?;

        Ok(Nalu {
            header,
            size: bytes.len(),
            data: Cow::Owned(bytes),
            offset: 0,
            sc_offset: 0,
        })
    }
}

impl<'a, U> AsRef<[u8]> for Nalu<'a, U> {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }
}
