// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.
use std::io::Write;

use thiserror::Error;

use crate::codec::h264::nalu_writer::NaluWriter;
use crate::codec::h264::nalu_writer::NaluWriterError;
use crate::codec::h264::parser::HrdParams;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::RefPicListModification;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::SliceType;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::DEFAULT_4X4_INTER;
use crate::codec::h264::parser::DEFAULT_4X4_INTRA;
use crate::codec::h264::parser::DEFAULT_8X8_INTER;
use crate::codec::h264::parser::DEFAULT_8X8_INTRA;
use crate::decoder::h264::cavlc::CHROMA_DC_COEFF_TOKEN_BITS;
use crate::decoder::h264::cavlc::CHROMA_DC_COEFF_TOKEN_LEN;
use crate::decoder::h264::cavlc::CHROMA_DC_TOTAL_ZEROS_BITS;
use crate::decoder::h264::cavlc::CHROMA_DC_TOTAL_ZEROS_LEN;
use crate::decoder::h264::cavlc::COEFF_TOKEN_BITS;
use crate::decoder::h264::cavlc::COEFF_TOKEN_LEN;
use crate::decoder::h264::cavlc::RUN_BEFORE_BITS;
use crate::decoder::h264::cavlc::RUN_BEFORE_LEN;
use crate::decoder::h264::cavlc::TOTAL_ZEROS_BITS;
use crate::decoder::h264::cavlc::TOTAL_ZEROS_LEN;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for SliceSynthesis<'_> {}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// A helper to output typed NALUs to [`std::io::Write`] using [`NaluWriter`].
pub struct Synthesizer<'n, N: private::NaluStruct, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

/// Extended Sample Aspect Ratio - H.264 Table E-1
const EXTENDED_SAR: u8 = 255;

impl<N: private::NaluStruct, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_u(bits, value)?;
        Ok(())
    }

    fn f<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_f(bits, value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    fn scaling_list(&mut self, list: &[u8], default: &[u8]) -> SynthesizerResult<()> {
        // H.264 7.3.2.1.1.1
        if list == default {
            self.se(-8)?;
            return Ok(());
        }

        // The number of list values we want to encode.
        let mut run = list.len();

        // Check how many values at the end of the matrix are the same,
        // so we can save on encoding those.
        for j in (1..list.len()).rev() {
            if list[j - 1] != list[j] {
                break;
            }
            run -= 1;
        }

        // Encode deltas.
        let mut last_scale = 8;
        for scale in &list[0..run] {
            let delta_scale = *scale as i32 - last_scale;
            self.se(delta_scale)?;
            last_scale = *scale as i32;
        }

        // Didn't encode all values, encode -|last_scale| to set decoder's
        // |next_scale| (H.264 7.3.2.1.1.1) to zero, i.e. decoder should repeat
        // last values in matrix.
        if run < list.len() {
            self.se(-last_scale)?;
        }

        Ok(())
    }

    fn default_scaling_list(i: usize) -> &'static [u8] {
        // H.264 Table 7-2
        match i {
            0 => &DEFAULT_4X4_INTRA[..],
            1 => &DEFAULT_4X4_INTRA[..],
            2 => &DEFAULT_4X4_INTRA[..],
            3 => &DEFAULT_4X4_INTER[..],
            4 => &DEFAULT_4X4_INTER[..],
            5 => &DEFAULT_4X4_INTER[..],
            6 => &DEFAULT_8X8_INTRA[..],
            7 => &DEFAULT_8X8_INTER[..],
            8 => &DEFAULT_8X8_INTRA[..],
            9 => &DEFAULT_8X8_INTER[..],
            10 => &DEFAULT_8X8_INTRA[..],
            11 => &DEFAULT_8X8_INTER[..],
            _ => &DEFAULT_8X8_INTER[..],
        }
    }

    fn rbsp_trailing_bits(&mut self) -> SynthesizerResult<()> {
        self.f(1, 1u32)?;

        while !self.writer.aligned() {
            self.f(1, 0u32)?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(
        ref_idc: u8,
        sps: &'n Sps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: sps,
        };

        s.writer.write_header(ref_idc, NaluType::Sps as u8)?;
        s.seq_parameter_set_data()?;
        s.rbsp_trailing_bits()
    }

    fn hrd_parameters(&mut self, hrd_params: &HrdParams) -> SynthesizerResult<()> {
        self.ue(hrd_params.cpb_cnt_minus1)?;
        self.u(4, hrd_params.bit_rate_scale)?;
        self.u(4, hrd_params.cpb_size_scale)?;

        for i in 0..=(hrd_params.cpb_cnt_minus1 as usize) {
            self.ue(hrd_params.bit_rate_value_minus1[i])?;
            self.ue(hrd_params.cpb_size_value_minus1[i])?;
            self.u(1, hrd_params.cbr_flag[i])?;
        }

        self.u(5, hrd_params.initial_cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.dpb_output_delay_length_minus1)?;
        self.u(5, hrd_params.time_offset_length)?;

        Ok(())
    }

    fn vui_parameters(&mut self) -> SynthesizerResult<()> {
        // H.264 E.1.1
        let vui_params = &self.nalu.vui_parameters;

        self.u(1, vui_params.aspect_ratio_info_present_flag)?;
        if vui_params.aspect_ratio_info_present_flag {
            self.u(8, vui_params.aspect_ratio_idc)?;
            if vui_params.aspect_ratio_idc == EXTENDED_SAR {
                self.u(16, vui_params.sar_width)?;
                self.u(16, vui_params.sar_height)?;
            }
        }

        self.u(1, vui_params.overscan_info_present_flag)?;
        if vui_params.overscan_info_present_flag {
            self.u(1, vui_params.overscan_appropriate_flag)?;
        }

        self.u(1, vui_params.video_signal_type_present_flag)?;
        if vui_params.video_signal_type_present_flag {
            self.u(3, vui_params.video_format)?;
            self.u(1, vui_params.video_full_range_flag)?;

            self.u(1, vui_params.colour_description_present_flag)?;
            if vui_params.colour_description_present_flag {
                self.u(8, vui_params.colour_primaries)?;
                self.u(8, vui_params.transfer_characteristics)?;
                self.u(8, vui_params.matrix_coefficients)?;
            }
        }

        self.u(1, vui_params.chroma_loc_info_present_flag)?;
        if vui_params.chroma_loc_info_present_flag {
            self.ue(vui_params.chroma_sample_loc_type_top_field)?;
            self.ue(self.nalu.vui_parameters.chroma_sample_loc_type_bottom_field)?;
        }

        self.u(1, vui_params.timing_info_present_flag)?;
        if vui_params.timing_info_present_flag {
            self.u(32, vui_params.num_units_in_tick)?;
            self.u(32, vui_params.time_scale)?;
            self.u(1, vui_params.fixed_frame_rate_flag)?;
        }

        self.u(1, vui_params.nal_hrd_parameters_present_flag)?;
        if vui_params.nal_hrd_parameters_present_flag {
            self.hrd_parameters(&vui_params.nal_hrd_parameters)?;
        }
        self.u(1, vui_params.vcl_hrd_parameters_present_flag)?;
        if vui_params.vcl_hrd_parameters_present_flag {
            self.hrd_parameters(&vui_params.vcl_hrd_parameters)?;
        }

        if vui_params.nal_hrd_parameters_present_flag || vui_params.vcl_hrd_parameters_present_flag
        {
            self.u(1, vui_params.low_delay_hrd_flag)?;
        }

        self.u(1, vui_params.pic_struct_present_flag)?;

        self.u(1, vui_params.bitstream_restriction_flag)?;
        if vui_params.bitstream_restriction_flag {
            self.u(1, vui_params.motion_vectors_over_pic_boundaries_flag)?;
            self.ue(vui_params.max_bytes_per_pic_denom)?;
            self.ue(vui_params.max_bits_per_mb_denom)?;
            self.ue(vui_params.log2_max_mv_length_horizontal)?;
            self.ue(vui_params.log2_max_mv_length_vertical)?;
            self.ue(vui_params.max_num_reorder_frames)?;
            self.ue(vui_params.max_dec_frame_buffering)?;
        }

        Ok(())
    }

    fn seq_parameter_set_data(&mut self) -> SynthesizerResult<()> {
        // H.264 7.3.2.1.1
        self.u(8, self.nalu.profile_idc)?;
        self.u(1, self.nalu.constraint_set0_flag)?;
        self.u(1, self.nalu.constraint_set1_flag)?;
        self.u(1, self.nalu.constraint_set2_flag)?;
        self.u(1, self.nalu.constraint_set3_flag)?;
        self.u(1, self.nalu.constraint_set4_flag)?;
        self.u(1, self.nalu.constraint_set5_flag)?;
        self.u(2, /* reserved_zero_2bits */ 0u32)?;
        self.u(8, self.nalu.level_idc as u32)?;
        self.ue(self.nalu.seq_parameter_set_id)?;

        if self.nalu.profile_idc == 100
            || self.nalu.profile_idc == 110
            || self.nalu.profile_idc == 122
            || self.nalu.profile_idc == 244
            || self.nalu.profile_idc == 44
            || self.nalu.profile_idc == 83
            || self.nalu.profile_idc == 86
            || self.nalu.profile_idc == 118
            || self.nalu.profile_idc == 128
            || self.nalu.profile_idc == 138
            || self.nalu.profile_idc == 139
            || self.nalu.profile_idc == 134
            || self.nalu.profile_idc == 135
        {
            self.ue(self.nalu.chroma_format_idc)?;

            if self.nalu.chroma_format_idc == 3 {
                self.u(1, self.nalu.separate_colour_plane_flag)?;
            }

            self.ue(self.nalu.bit_depth_luma_minus8)?;
            self.ue(self.nalu.bit_depth_chroma_minus8)?;
            self.u(1, self.nalu.qpprime_y_zero_transform_bypass_flag)?;
            self.u(1, self.nalu.seq_scaling_matrix_present_flag)?;

            if self.nalu.seq_scaling_matrix_present_flag {
                let scaling_list_count = if self.nalu.chroma_format_idc != 3 {
                    8
                } else {
                    12
                };

                for i in 0..scaling_list_count {
                    // Assume if scaling lists are zeroed that they are not present.
                    if i < 6 {
                        if self.nalu.scaling_lists_4x4[i] == [0; 16] {
                            self.u(1, /* seq_scaling_list_present_flag */ false)?;
                        } else {
                            self.u(1, /* seq_scaling_list_present_flag */ true)?;
                            self.scaling_list(
                                &self.nalu.scaling_lists_4x4[i],
                                Self::default_scaling_list(i),
                            )?;
                        }
                    } else if self.nalu.scaling_lists_8x8[i - 6] == [0; 64] {
                        self.u(1, /* seq_scaling_list_present_flag */ false)?;
                    } else {
                        self.u(1, /* seq_scaling_list_present_flag */ true)?;
                        self.scaling_list(
                            &self.nalu.scaling_lists_8x8[i - 6],
                            Self::default_scaling_list(i),
                        )?;
                    }
                }
            }
        }

        self.ue(self.nalu.log2_max_frame_num_minus4)?;
        self.ue(self.nalu.pic_order_cnt_type)?;

        if self.nalu.pic_order_cnt_type == 0 {
            self.ue(self.nalu.log2_max_pic_order_cnt_lsb_minus4)?;
        } else if self.nalu.pic_order_cnt_type == 1 {
            self.u(1, self.nalu.delta_pic_order_always_zero_flag)?;
            self.se(self.nalu.offset_for_non_ref_pic)?;
            self.se(self.nalu.offset_for_top_to_bottom_field)?;
            self.ue(self.nalu.num_ref_frames_in_pic_order_cnt_cycle)?;

            let num_offsets = usize::from(self.nalu.num_ref_frames_in_pic_order_cnt_cycle);
            for offset_for_ref_frame in &self.nalu.offset_for_ref_frame[..num_offsets] {
                self.se(*offset_for_ref_frame)?;
            }
        }

        self.ue(self.nalu.max_num_ref_frames)?;
        self.u(1, self.nalu.gaps_in_frame_num_value_allowed_flag)?;
        self.ue(self.nalu.pic_width_in_mbs_minus1)?;
        self.ue(self.nalu.pic_height_in_map_units_minus1)?;
        self.u(1, self.nalu.frame_mbs_only_flag)?;
        if !self.nalu.frame_mbs_only_flag {
            self.u(1, self.nalu.mb_adaptive_frame_field_flag)?;
        }
        self.u(1, self.nalu.direct_8x8_inference_flag)?;

        self.u(1, self.nalu.frame_cropping_flag)?;
        if self.nalu.frame_cropping_flag {
            self.ue(self.nalu.frame_crop_left_offset)?;
            self.ue(self.nalu.frame_crop_right_offset)?;
            self.ue(self.nalu.frame_crop_top_offset)?;
            self.ue(self.nalu.frame_crop_bottom_offset)?;
        }

        self.u(1, self.nalu.vui_parameters_present_flag)?;
        if self.nalu.vui_parameters_present_flag {
            self.vui_parameters()?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    pub fn synthesize(
        ref_idc: u8,
        pps: &'n Pps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: pps,
        };

        s.writer.write_header(ref_idc, NaluType::Pps as u8)?;
        s.pic_parameter_set_rbsp()?;
        s.rbsp_trailing_bits()
    }

    fn pic_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        self.ue(self.nalu.pic_parameter_set_id)?;
        self.ue(self.nalu.seq_parameter_set_id)?;
        self.u(1, self.nalu.entropy_coding_mode_flag)?;
        self.u(1, self.nalu.bottom_field_pic_order_in_frame_present_flag)?;

        self.ue(self.nalu.num_slice_groups_minus1)?;
        if self.nalu.num_slice_groups_minus1 > 0 {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(self.nalu.num_ref_idx_l0_default_active_minus1)?;
        self.ue(self.nalu.num_ref_idx_l1_default_active_minus1)?;
        self.u(1, self.nalu.weighted_pred_flag)?;
        self.u(2, self.nalu.weighted_bipred_idc)?;
        self.se(self.nalu.pic_init_qp_minus26)?;
        self.se(self.nalu.pic_init_qs_minus26)?;
        self.se(self.nalu.chroma_qp_index_offset)?;
        self.u(1, self.nalu.deblocking_filter_control_present_flag)?;
        self.u(1, self.nalu.constrained_intra_pred_flag)?;
        self.u(1, self.nalu.redundant_pic_cnt_present_flag)?;

        if !(self.nalu.transform_8x8_mode_flag
            || self.nalu.pic_scaling_matrix_present_flag
            || self.nalu.second_chroma_qp_index_offset != self.nalu.chroma_qp_index_offset)
        {
            return Ok(());
        }

        self.u(1, self.nalu.transform_8x8_mode_flag)?;
        self.u(1, self.nalu.pic_scaling_matrix_present_flag)?;

        if self.nalu.pic_scaling_matrix_present_flag {
            let mut scaling_list_count = 6;
            if self.nalu.transform_8x8_mode_flag {
                if self.nalu.sps.chroma_format_idc != 3 {
                    scaling_list_count += 2;
                } else {
                    scaling_list_count += 6;
                }
            }

            for i in 0..scaling_list_count {
                // Assume if scaling lists are zeroed that they are not present.
                if i < 6 {
                    if self.nalu.scaling_lists_4x4[i] == [0; 16] {
                        self.u(1, /* seq_scaling_list_present_flag */ false)?;
                    } else {
                        self.u(1, /* seq_scaling_list_present_flag */ true)?;
                        self.scaling_list(
                            &self.nalu.scaling_lists_4x4[i],
                            Self::default_scaling_list(i),
                        )?;
                    }
                } else if self.nalu.scaling_lists_8x8[i - 6] == [0; 64] {
                    self.u(1, /* seq_scaling_list_present_flag */ false)?;
                } else {
                    self.u(1, /* seq_scaling_list_present_flag */ true)?;
                    self.scaling_list(
                        &self.nalu.scaling_lists_8x8[i - 6],
                        Self::default_scaling_list(i),
                    )?;
                }
            }
        }

        self.se(self.nalu.second_chroma_qp_index_offset)?;

        Ok(())
    }
}

/// Motion of one list of an inter macroblock: the reference index and the
/// motion vector difference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MotionSynthesis {
    pub ref_idx: u8,
    pub mvd: [i16; 2],
}

/// A CAVLC coded macroblock. Residual data is limited to the DC blocks of
/// Intra 16x16 macroblocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MacroblockSynthesis {
    /// P_Skip or B_Skip, coded through mb_skip_run.
    Skip,
    /// I_PCM holding 256 luma samples followed by 64 Cb and 64 Cr samples.
    Pcm(Vec<u8>),
    /// Intra 16x16 prediction without residual.
    Intra16x16 { pred_mode: u8, chroma_pred_mode: u8 },
    /// Intra 16x16 prediction with the Intra16x16DCLevel block (zigzag scan
    /// order) and the Cb and Cr DC blocks. The AC blocks are not coded.
    Intra16x16Dc {
        pred_mode: u8,
        chroma_pred_mode: u8,
        qp_delta: i8,
        luma_dc: [i32; 16],
        chroma_dc: [[i32; 4]; 2],
    },
    /// 16x16 inter prediction without residual. `l1` is only valid in B
    /// slices, where at least one of the lists must be given.
    Inter16x16 {
        l0: Option<MotionSynthesis>,
        l1: Option<MotionSynthesis>,
    },
    /// B_Direct_16x16 without residual.
    Direct16x16,
}

/// Payload of a synthesized slice.
pub enum SliceData<'a> {
    Cavlc(&'a [MacroblockSynthesis]),
    /// Arithmetic coded slice data, written after the cabac_alignment_one_bit
    /// padding.
    Cabac(&'a [u8]),
}

/// A slice NAL unit to synthesize.
pub struct SliceSynthesis<'a> {
    pub header: &'a SliceHeader,
    pub pps: &'a Pps,
    pub idr: bool,
    pub data: SliceData<'a>,
}

impl<'n, 'a, W: Write> Synthesizer<'n, SliceSynthesis<'a>, W> {
    pub fn synthesize(
        ref_idc: u8,
        slice: &'n SliceSynthesis<'a>,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: slice,
        };

        let type_ = if slice.idr {
            NaluType::SliceIdr
        } else {
            NaluType::Slice
        };

        s.writer.write_header(ref_idc, type_ as u8)?;
        s.slice_header(ref_idc)?;

        match slice.data {
            SliceData::Cavlc(mbs) => s.cavlc_slice_data(mbs)?,
            SliceData::Cabac(data) => {
                while !s.writer.aligned() {
                    s.f(1, 1u32)?;
                }

                for byte in data {
                    s.u(8, *byte)?;
                }

                // The arithmetic coder flush already ends with the stop bit.
                return Ok(());
            }
        }

        s.rbsp_trailing_bits()
    }

    fn ref_pic_list_modification(
        &mut self,
        mods: &[RefPicListModification],
    ) -> SynthesizerResult<()> {
        self.u(1, !mods.is_empty())?;
        if mods.is_empty() {
            return Ok(());
        }

        for m in mods {
            self.ue(m.modification_of_pic_nums_idc)?;
            match m.modification_of_pic_nums_idc {
                0 | 1 => self.ue(m.abs_diff_pic_num_minus1)?,
                2 => self.ue(m.long_term_pic_num)?,
                _ => return Ok(()),
            }
        }

        self.ue(3u32)
    }

    fn pred_weight_table(&mut self) -> SynthesizerResult<()> {
        let hdr = self.nalu.header;
        let sps = &self.nalu.pps.sps;
        let pt = &hdr.pred_weight_table;

        self.ue(pt.luma_log2_weight_denom)?;
        if sps.chroma_array_type() != 0 {
            self.ue(pt.chroma_log2_weight_denom)?;
        }

        let default_luma = 1i16 << pt.luma_log2_weight_denom;
        let default_chroma = 1i16 << pt.chroma_log2_weight_denom;

        let num_lists = if hdr.slice_type.is_b() { 2 } else { 1 };
        let num_entries = [hdr.num_ref_idx_l0_active(), hdr.num_ref_idx_l1_active()];

        for (list, num_entries) in num_entries.into_iter().enumerate().take(num_lists) {
            let (luma_weight, luma_offset, chroma_weight, chroma_offset) = if list == 0 {
                (
                    &pt.luma_weight_l0,
                    &pt.luma_offset_l0,
                    &pt.chroma_weight_l0,
                    &pt.chroma_offset_l0,
                )
            } else {
                (
                    &pt.luma_weight_l1,
                    &pt.luma_offset_l1,
                    &pt.chroma_weight_l1,
                    &pt.chroma_offset_l1,
                )
            };

            for i in 0..num_entries {
                let luma_flag = luma_weight[i] != default_luma || luma_offset[i] != 0;
                self.u(1, luma_flag)?;
                if luma_flag {
                    self.se(luma_weight[i])?;
                    self.se(luma_offset[i])?;
                }

                if sps.chroma_array_type() != 0 {
                    let chroma_flag = chroma_weight[i] != [default_chroma; 2]
                        || chroma_offset[i] != [0; 2];
                    self.u(1, chroma_flag)?;
                    if chroma_flag {
                        for j in 0..2 {
                            self.se(chroma_weight[i][j])?;
                            self.se(chroma_offset[i][j])?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn dec_ref_pic_marking(&mut self) -> SynthesizerResult<()> {
        let rpm = &self.nalu.header.dec_ref_pic_marking;

        if self.nalu.idr {
            self.u(1, rpm.no_output_of_prior_pics_flag)?;
            self.u(1, rpm.long_term_reference_flag)?;
            return Ok(());
        }

        self.u(1, rpm.adaptive_ref_pic_marking_mode_flag)?;
        if !rpm.adaptive_ref_pic_marking_mode_flag {
            return Ok(());
        }

        for marking in &rpm.inner {
            let op = marking.memory_management_control_operation;
            self.ue(op)?;

            if op == 1 || op == 3 {
                self.ue(marking.difference_of_pic_nums_minus1)?;
            }
            if op == 2 {
                self.ue(marking.long_term_pic_num)?;
            }
            if op == 3 || op == 6 {
                self.ue(marking.long_term_frame_idx)?;
            }
            if op == 4 {
                self.ue(marking.max_long_term_frame_idx.to_value_plus1())?;
            }
        }

        self.ue(0u32)
    }

    fn slice_header(&mut self, ref_idc: u8) -> SynthesizerResult<()> {
        // H.264 7.3.3, frame coding only.
        let hdr = self.nalu.header;
        let pps = self.nalu.pps;
        let sps = &pps.sps;

        if !sps.frame_mbs_only_flag || sps.separate_colour_plane_flag {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(hdr.first_mb_in_slice)?;
        self.ue(hdr.slice_type as u32)?;
        self.ue(pps.pic_parameter_set_id)?;
        self.u(
            usize::from(sps.log2_max_frame_num_minus4) + 4,
            hdr.frame_num,
        )?;

        if self.nalu.idr {
            self.ue(hdr.idr_pic_id)?;
        }

        if sps.pic_order_cnt_type == 0 {
            self.u(
                usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                hdr.pic_order_cnt_lsb,
            )?;
            if pps.bottom_field_pic_order_in_frame_present_flag {
                self.se(hdr.delta_pic_order_cnt_bottom)?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            self.se(hdr.delta_pic_order_cnt[0])?;
            if pps.bottom_field_pic_order_in_frame_present_flag {
                self.se(hdr.delta_pic_order_cnt[1])?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            self.ue(hdr.redundant_pic_cnt)?;
        }

        let slice_type = hdr.slice_type;
        if slice_type.is_b() {
            self.u(1, hdr.direct_spatial_mv_pred_flag)?;
        }

        if slice_type.is_p() || slice_type.is_sp() || slice_type.is_b() {
            self.u(1, hdr.num_ref_idx_active_override_flag)?;
            if hdr.num_ref_idx_active_override_flag {
                self.ue(hdr.num_ref_idx_l0_active_minus1)?;
                if slice_type.is_b() {
                    self.ue(hdr.num_ref_idx_l1_active_minus1)?;
                }
            }
        }

        if !slice_type.is_i() && !slice_type.is_si() {
            self.ref_pic_list_modification(&hdr.ref_pic_list_modification_l0)?;
        }
        if slice_type.is_b() {
            self.ref_pic_list_modification(&hdr.ref_pic_list_modification_l1)?;
        }

        if (pps.weighted_pred_flag && (slice_type.is_p() || slice_type.is_sp()))
            || (pps.weighted_bipred_idc == 1 && slice_type.is_b())
        {
            self.pred_weight_table()?;
        }

        if ref_idc != 0 {
            self.dec_ref_pic_marking()?;
        }

        if pps.entropy_coding_mode_flag && !slice_type.is_i() && !slice_type.is_si() {
            self.ue(hdr.cabac_init_idc)?;
        }

        self.se(hdr.slice_qp_delta)?;

        if slice_type.is_sp() || slice_type.is_si() {
            return Err(SynthesizerError::Unsupported);
        }

        if pps.deblocking_filter_control_present_flag {
            self.ue(hdr.disable_deblocking_filter_idc)?;
            if hdr.disable_deblocking_filter_idc != 1 {
                self.se(hdr.slice_alpha_c0_offset_div2)?;
                self.se(hdr.slice_beta_offset_div2)?;
            }
        }

        Ok(())
    }

    /// Writes `ref_idx` as te(v) when the list has more than one entry.
    fn ref_idx(&mut self, ref_idx: u8, num_active: usize) -> SynthesizerResult<()> {
        match num_active {
            0 | 1 => Ok(()),
            2 => self.u(1, ref_idx == 0),
            _ => self.ue(ref_idx),
        }
    }

    /// Writes residual_block_cavlc() (9.2) for `coeffs`, given in scan order.
    fn residual_block_cavlc(
        &mut self,
        nc: i32,
        coeffs: &[i32],
        max_num_coeff: usize,
    ) -> SynthesizerResult<()> {
        // Levels from the highest frequency down.
        let levels: Vec<i32> = coeffs.iter().rev().copied().filter(|c| *c != 0).collect();
        let total_coeff = levels.len();
        let trailing_ones = levels
            .iter()
            .take(3)
            .take_while(|l| l.abs() == 1)
            .count();

        let token = total_coeff * 4 + trailing_ones;
        let (lens, bits): (&[u8], &[u8]) = match nc {
            -1 => (&CHROMA_DC_COEFF_TOKEN_LEN, &CHROMA_DC_COEFF_TOKEN_BITS),
            0..=1 => (&COEFF_TOKEN_LEN[0], &COEFF_TOKEN_BITS[0]),
            2..=3 => (&COEFF_TOKEN_LEN[1], &COEFF_TOKEN_BITS[1]),
            4..=7 => (&COEFF_TOKEN_LEN[2], &COEFF_TOKEN_BITS[2]),
            _ => (&COEFF_TOKEN_LEN[3], &COEFF_TOKEN_BITS[3]),
        };
        self.vlc(lens, bits, token)?;

        if total_coeff == 0 {
            return Ok(());
        }

        let mut suffix_length = usize::from(total_coeff > 10 && trailing_ones < 3);
        for (i, level) in levels.iter().enumerate() {
            if i < trailing_ones {
                self.u(1, *level < 0)?;
                continue;
            }

            // 2 * level - 2 for positive levels, -2 * level - 1 otherwise.
            let mut level_code = (2 * level.abs() - 2 + i32::from(*level < 0)) as u32;
            if i == trailing_ones && trailing_ones < 3 {
                level_code -= 2;
            }

            let (prefix, suffix_size, suffix) = if suffix_length == 0 && level_code < 14 {
                (level_code, 0, 0)
            } else if suffix_length == 0 && level_code < 30 {
                (14, 4, level_code - 14)
            } else if suffix_length == 0 {
                (15, 12, level_code - 30)
            } else if level_code < 15 << suffix_length {
                (
                    level_code >> suffix_length,
                    suffix_length,
                    level_code & ((1 << suffix_length) - 1),
                )
            } else {
                (15, 12, level_code - (15 << suffix_length))
            };
            if suffix >= 1 << 12 {
                return Err(SynthesizerError::Unsupported);
            }

            for _ in 0..prefix {
                self.u(1, 0u32)?;
            }
            self.u(1, 1u32)?;
            if suffix_size > 0 {
                self.u(suffix_size, suffix)?;
            }

            if suffix_length == 0 {
                suffix_length = 1;
            }
            if level.abs() > (3 << (suffix_length - 1)) && suffix_length < 6 {
                suffix_length += 1;
            }
        }

        let Some(last) = coeffs.iter().rposition(|c| *c != 0) else {
            return Ok(());
        };

        let mut zeros_left = last + 1 - total_coeff;
        if total_coeff < coeffs.len() {
            if max_num_coeff == 4 {
                self.vlc(
                    CHROMA_DC_TOTAL_ZEROS_LEN[total_coeff - 1],
                    CHROMA_DC_TOTAL_ZEROS_BITS[total_coeff - 1],
                    zeros_left,
                )?;
            } else {
                self.vlc(
                    TOTAL_ZEROS_LEN[total_coeff - 1],
                    TOTAL_ZEROS_BITS[total_coeff - 1],
                    zeros_left,
                )?;
            }
        }

        // run_before of every coefficient but the lowest frequency one.
        let positions: Vec<usize> = (0..=last).rev().filter(|&k| coeffs[k] != 0).collect();
        for pair in positions.windows(2) {
            if zeros_left == 0 {
                break;
            }
            let run = pair[0] - pair[1] - 1;
            let table = zeros_left.min(7) - 1;
            self.vlc(RUN_BEFORE_LEN[table], RUN_BEFORE_BITS[table], run)?;
            zeros_left -= run;
        }

        Ok(())
    }

    /// Writes entry `index` of a code table.
    fn vlc(&mut self, lens: &[u8], bits: &[u8], index: usize) -> SynthesizerResult<()> {
        match (lens.get(index), bits.get(index)) {
            (Some(&len), Some(&code)) if len > 0 => self.u(usize::from(len), code),
            _ => Err(SynthesizerError::Unsupported),
        }
    }

    fn cavlc_slice_data(&mut self, mbs: &[MacroblockSynthesis]) -> SynthesizerResult<()> {
        let hdr = self.nalu.header;
        let sps = &self.nalu.pps.sps;
        let width_in_mbs = sps.width_in_mbs();
        let first_mb = hdr.first_mb_in_slice as usize;
        let slice_type = hdr.slice_type;

        let mb_type_offset = match slice_type {
            SliceType::I => 0u32,
            SliceType::P => 5,
            SliceType::B => 23,
            _ => return Err(SynthesizerError::Unsupported),
        };

        // Total coefficients of the 4x4 blocks: 16 in I_PCM, zero elsewhere.
        let mut is_pcm = vec![false; mbs.len()];
        let mut skip_run = 0u32;

        for (i, mb) in mbs.iter().enumerate() {
            if matches!(mb, MacroblockSynthesis::Skip) {
                if slice_type.is_i() {
                    return Err(SynthesizerError::Unsupported);
                }
                skip_run += 1;
                continue;
            }

            if !slice_type.is_i() {
                self.ue(skip_run)?;
                skip_run = 0;
            }

            match mb {
                MacroblockSynthesis::Skip => (),
                MacroblockSynthesis::Pcm(samples) => {
                    if samples.len() != 384 {
                        return Err(SynthesizerError::Unsupported);
                    }

                    self.ue(mb_type_offset + 25)?;
                    while !self.writer.aligned() {
                        self.f(1, 0u32)?;
                    }
                    for sample in samples {
                        self.u(8, *sample)?;
                    }
                    is_pcm[i] = true;
                }
                MacroblockSynthesis::Intra16x16 {
                    pred_mode,
                    chroma_pred_mode,
                } => {
                    self.ue(mb_type_offset + 1 + u32::from(*pred_mode))?;
                    self.ue(*chroma_pred_mode)?;
                    self.se(0)?;

                    let nc = luma_dc_nc(first_mb, first_mb + i, width_in_mbs, &is_pcm);
                    self.residual_block_cavlc(nc, &[0; 16], 16)?;
                }
                MacroblockSynthesis::Intra16x16Dc {
                    pred_mode,
                    chroma_pred_mode,
                    qp_delta,
                    luma_dc,
                    chroma_dc,
                } => {
                    let cbp_chroma = u32::from(chroma_dc.iter().flatten().any(|c| *c != 0));
                    self.ue(mb_type_offset + 1 + u32::from(*pred_mode) + 4 * cbp_chroma)?;
                    self.ue(*chroma_pred_mode)?;
                    self.se(*qp_delta)?;

                    let nc = luma_dc_nc(first_mb, first_mb + i, width_in_mbs, &is_pcm);
                    self.residual_block_cavlc(nc, luma_dc, 16)?;
                    if cbp_chroma != 0 {
                        for dc in chroma_dc {
                            self.residual_block_cavlc(-1, dc, 4)?;
                        }
                    }
                }
                MacroblockSynthesis::Inter16x16 { l0, l1 } => {
                    if slice_type.is_i() {
                        return Err(SynthesizerError::Unsupported);
                    }

                    let mb_type = match (slice_type, l0, l1) {
                        (SliceType::P, Some(_), None) => 0u32,
                        (SliceType::B, Some(_), None) => 1,
                        (SliceType::B, None, Some(_)) => 2,
                        (SliceType::B, Some(_), Some(_)) => 3,
                        _ => return Err(SynthesizerError::Unsupported),
                    };
                    self.ue(mb_type)?;

                    if let Some(m) = l0 {
                        self.ref_idx(m.ref_idx, hdr.num_ref_idx_l0_active())?;
                    }
                    if let Some(m) = l1 {
                        self.ref_idx(m.ref_idx, hdr.num_ref_idx_l1_active())?;
                    }
                    for m in [l0, l1].into_iter().flatten() {
                        self.se(m.mvd[0])?;
                        self.se(m.mvd[1])?;
                    }

                    // coded_block_pattern 0 of an inter macroblock.
                    self.ue(0u32)?;
                }
                MacroblockSynthesis::Direct16x16 => {
                    if !slice_type.is_b() {
                        return Err(SynthesizerError::Unsupported);
                    }

                    self.ue(0u32)?;
                    self.ue(0u32)?;
                }
            }
        }

        if skip_run > 0 {
            self.ue(skip_run)?;
        }

        Ok(())
    }
}

/// nC of the Intra16x16DCLevel block of macroblock `addr`, from the first
/// 4x4 block of its left and top neighbours in the slice. Only I_PCM
/// neighbours carry coefficients there.
fn luma_dc_nc(first_mb: usize, addr: usize, width_in_mbs: usize, is_pcm: &[bool]) -> i32 {
    let left = (addr % width_in_mbs != 0 && addr > first_mb).then(|| addr - 1);
    let top = (addr >= first_mb + width_in_mbs).then(|| addr - width_in_mbs);
    let total = |n: usize| if is_pcm[n - first_mb] { 16 } else { 0 };

    match (left, top) {
        (Some(a), Some(b)) => (total(a) + total(b) + 1) >> 1,
        (Some(a), None) => total(a),
        (None, Some(b)) => total(b),
        (None, None) => 0,
    }
}
