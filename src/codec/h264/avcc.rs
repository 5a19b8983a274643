// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of the AVC decoder configuration record (ISO/IEC 14496-15,
//! 5.3.3.1), i.e. the payload of the `avcC` box of MP4 files and of the
//! `CodecPrivate` element of Matroska H.264 tracks.

use std::io::Cursor;
use std::io::Read;

use anyhow::anyhow;
use anyhow::Context;
use byteorder::BigEndian;
use byteorder::ReadBytesExt;

/// Annex B start code prepended to the parameter sets by [`to_annexb`].
///
/// [`to_annexb`]: AvcDecoderConfigurationRecord::to_annexb
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AvcDecoderConfigurationRecord {
    pub configuration_version: u8,
    pub profile_indication: u8,
    pub profile_compatibility: u8,
    pub level_indication: u8,
    /// Size in bytes of the length prefix of each NAL unit in the samples.
    pub nalu_length_size: usize,
    /// Raw SPS NAL units, header included.
    pub sps: Vec<Vec<u8>>,
    /// Raw PPS NAL units, header included.
    pub pps: Vec<Vec<u8>>,
}

impl AvcDecoderConfigurationRecord {
    fn read_parameter_sets(
        cursor: &mut Cursor<&[u8]>,
        count: usize,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut sets = Vec::with_capacity(count);

        for _ in 0..count {
            let len = usize::from(cursor.read_u16::<BigEndian>()?);
            let mut nalu = vec![0u8; len];
            cursor
                .read_exact(&mut nalu)
                .with_context(|| format!("parameter set of {} bytes is truncated", len))?;
            sets.push(nalu);
        }

        Ok(sets)
    }

    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let mut cursor = Cursor::new(data);

        let configuration_version = cursor.read_u8()?;
        if configuration_version != 1 {
            return Err(anyhow!(
                "Unsupported avcC configuration version {}",
                configuration_version
            ));
        }

        let profile_indication = cursor.read_u8()?;
        let profile_compatibility = cursor.read_u8()?;
        let level_indication = cursor.read_u8()?;

        // 6 reserved bits, then lengthSizeMinusOne.
        let nalu_length_size = usize::from(cursor.read_u8()? & 0x3) + 1;
        if nalu_length_size == 3 {
            return Err(anyhow!("Invalid avcC NAL unit length size 3"));
        }

        // 3 reserved bits, then numOfSequenceParameterSets.
        let num_sps = usize::from(cursor.read_u8()? & 0x1f);
        let sps = Self::read_parameter_sets(&mut cursor, num_sps).context("avcC SPS list")?;

        let num_pps = usize::from(cursor.read_u8()?);
        let pps = Self::read_parameter_sets(&mut cursor, num_pps).context("avcC PPS list")?;

        // Trailing High profile extensions (chroma format, bit depths, SPS
        // extensions) repeat what the SPS already says and are ignored.
        log::debug!(
            "avcC: profile {} level {}, {} SPS, {} PPS, {} byte NAL lengths",
            profile_indication,
            level_indication,
            sps.len(),
            pps.len(),
            nalu_length_size
        );

        Ok(Self {
            configuration_version,
            profile_indication,
            profile_compatibility,
            level_indication,
            nalu_length_size,
            sps,
            pps,
        })
    }

    /// Returns the parameter sets as an Annex B byte stream, SPSs first.
    pub fn to_annexb(&self) -> Vec<u8> {
        let mut out = vec![];

        for nalu in self.sps.iter().chain(self.pps.iter()) {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nalu);
        }

        out
    }
}
