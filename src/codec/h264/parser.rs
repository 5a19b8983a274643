// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter set and slice header parsing.

// Not every parsed syntax element is consumed by the software decoder.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Cursor;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use bytes::Buf;
use enumn::N;
use log::debug;

use crate::codec::h264::nalu;
use crate::codec::h264::nalu::Header;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::Rect;

pub type Nalu<'a> = nalu::Nalu<'a, NaluHeader>;

/// Table 7-3, Default_4x4_Intra, in zig-zag order.
pub(crate) const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

/// Table 7-3, Default_4x4_Inter, in zig-zag order.
pub(crate) const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

/// Table 7-4, Default_8x8_Intra, in zig-zag order.
pub(crate) const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

/// Table 7-4, Default_8x8_Inter, in zig-zag order.
pub(crate) const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

const MAX_PPS_COUNT: u16 = 256;
const MAX_SPS_COUNT: u8 = 32;

/// The maximum number of frames in the DPB, as per A.3.1, clause h)
pub const DPB_MAX_SIZE: usize = 16;

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

/// One `modification_of_pic_nums_idc` command of a reference list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /// Valid when `modification_of_pic_nums_idc` is 0 or 1.
    pub abs_diff_pic_num_minus1: u32,
    /// Valid when `modification_of_pic_nums_idc` is 2.
    pub long_term_pic_num: u32,
}

/// Explicit weighted prediction parameters (7.3.3.2). Entries not coded in
/// the bitstream hold their inferred default values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,

    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i16; 32],
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i16; 2]; 32],

    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i16; 32],
    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i16; 2]; 32],
}

impl Default for PredWeightTable {
    fn default() -> Self {
        Self {
            luma_log2_weight_denom: 0,
            chroma_log2_weight_denom: 0,
            luma_weight_l0: [1; 32],
            luma_offset_l0: [0; 32],
            chroma_weight_l0: [[1; 2]; 32],
            chroma_offset_l0: [[0; 2]; 32],
            luma_weight_l1: [1; 32],
            luma_offset_l1: [0; 32],
            chroma_weight_l1: [[1; 2]; 32],
            chroma_offset_l1: [[0; 2]; 32],
        }
    }
}

/// Representation of `MaxLongTermFrameIdx`.
///
/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an unsigned integer
/// where 0 means "no long-term frame indices".
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Convert this value back to `max_long_term_frame_idx_plus1`.
    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }
}

impl PartialEq<u32> for MaxLongTermFrameIdx {
    fn eq(&self, other: &u32) -> bool {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => false,
            MaxLongTermFrameIdx::Idx(idx) => idx.eq(other),
        }
    }
}

impl PartialOrd<u32> for MaxLongTermFrameIdx {
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => Some(std::cmp::Ordering::Less),
            MaxLongTermFrameIdx::Idx(idx) => Some(idx.cmp(other)),
        }
    }
}

/// A single memory management control operation (Table 7-9).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    pub memory_management_control_operation: u8,
    /// Operations 1 and 3.
    pub difference_of_pic_nums_minus1: u32,
    /// Operation 2.
    pub long_term_pic_num: u32,
    /// Operations 3 and 6.
    pub long_term_frame_idx: u32,
    /// Operation 4.
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

/// `dec_ref_pic_marking()` as parsed from the slice header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// IDR only: drop the pictures still waiting for output.
    pub no_output_of_prior_pics_flag: bool,
    /// IDR only: mark the IDR picture as long-term with index 0.
    pub long_term_reference_flag: bool,
    /// Non-IDR only: use `inner` instead of the sliding window.
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub inner: Vec<RefPicMarkingInner>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u8,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,
    pub pred_weight_table: PredWeightTable,
    pub dec_ref_pic_marking: RefPicMarking,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,

    /// Same as `MaxPicNum`.
    pub max_pic_num: u32,

    /// Size of the slice_header() in RBSP bits, i.e. the offset of
    /// slice_data() once the NAL header and the emulation prevention bytes are
    /// stripped.
    pub header_bit_size: usize,
}

impl SliceHeader {
    /// Returns `SliceQPY` (7-30).
    pub fn slice_qp(&self, pps: &Pps) -> i32 {
        26 + i32::from(pps.pic_init_qp_minus26) + i32::from(self.slice_qp_delta)
    }

    /// Number of active entries of reference list 0.
    pub fn num_ref_idx_l0_active(&self) -> usize {
        usize::from(self.num_ref_idx_l0_active_minus1) + 1
    }

    /// Number of active entries of reference list 1.
    pub fn num_ref_idx_l1_active(&self) -> usize {
        usize::from(self.num_ref_idx_l1_active_minus1) + 1
    }
}

pub struct SliceHeaderBuilder(SliceHeader);

impl SliceHeaderBuilder {
    pub fn new(pps: &Pps) -> Self {
        SliceHeaderBuilder(SliceHeader {
            pic_parameter_set_id: pps.pic_parameter_set_id,
            num_ref_idx_l0_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_active_minus1: pps.num_ref_idx_l1_default_active_minus1,
            ..Default::default()
        })
    }

    pub fn slice_type(mut self, type_: SliceType) -> Self {
        self.0.slice_type = type_;
        self
    }

    pub fn frame_num(mut self, value: u16) -> Self {
        self.0.frame_num = value;
        self
    }

    pub fn pic_order_cnt_lsb(mut self, value: u16) -> Self {
        self.0.pic_order_cnt_lsb = value;
        self
    }

    pub fn idr_pic_id(mut self, value: u16) -> Self {
        self.0.idr_pic_id = value;
        self
    }

    /// `delta_pic_order_cnt[0]`, used with picture order count type 1.
    pub fn delta_pic_order_cnt(mut self, value: i32) -> Self {
        self.0.delta_pic_order_cnt[0] = value;
        self
    }

    pub fn direct_spatial_mv_pred_flag(mut self, value: bool) -> Self {
        self.0.direct_spatial_mv_pred_flag = value;
        self
    }

    pub fn num_ref_idx_active_override_flag(mut self, value: bool) -> Self {
        self.0.num_ref_idx_active_override_flag = value;
        self
    }

    pub fn num_ref_idx_l0_active_minus1(mut self, value: u8) -> Self {
        self = self.num_ref_idx_active_override_flag(true);
        self.0.num_ref_idx_l0_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l0_active(self, value: u8) -> Self {
        self.num_ref_idx_l0_active_minus1(value - 1)
    }

    pub fn ref_pic_list_modification_l0(mut self, mods: Vec<RefPicListModification>) -> Self {
        self.0.ref_pic_list_modification_flag_l0 = !mods.is_empty();
        self.0.ref_pic_list_modification_l0 = mods;
        self
    }

    pub fn dec_ref_pic_marking(mut self, marking: RefPicMarking) -> Self {
        self.0.dec_ref_pic_marking = marking;
        self
    }

    pub fn slice_qp_delta(mut self, value: i8) -> Self {
        self.0.slice_qp_delta = value;
        self
    }

    pub fn disable_deblocking_filter_idc(mut self, value: u8) -> Self {
        self.0.disable_deblocking_filter_idc = value;
        self
    }

    pub fn build(self) -> SliceHeader {
        self.0
    }
}

/// A H264 slice: its parsed header and the NAL unit carrying slice_data().
pub struct Slice<'a> {
    pub header: SliceHeader,
    pub nalu: Nalu<'a>,
}

/// Table 7-6.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

/// Whether `profile_idc` signals the High profile family syntax of the SPS
/// (chroma format, bit depths and scaling matrices).
fn has_high_profile_syntax(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

/// A H264 Sequence Parameter Set (7.3.2.1.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,

    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,

    pub level_idc: Level,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub seq_scaling_matrix_present_flag: bool,

    /// 4x4 scaling lists in zig-zag order, after the fall-back rules of table
    /// 7-2 are applied.
    pub scaling_lists_4x4: [[u8; 16]; 6],
    /// 8x8 scaling lists in zig-zag order, after the fall-back rules of table
    /// 7-2 are applied.
    pub scaling_lists_8x8: [[u8; 64]; 6],

    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: [i32; 255],

    /// Size of the sliding window (8.2.5.3).
    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    /// ExpectedDeltaPerPicOrderCntCycle, see 7-12.
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Returns the coded width of the stream.
    ///
    /// See 7-13 through 7-17.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Returns the coded height of the stream.
    ///
    /// See 7-13 through 7-17.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    pub fn width_in_mbs(&self) -> usize {
        usize::from(self.pic_width_in_mbs_minus1) + 1
    }

    pub fn height_in_mbs(&self) -> usize {
        (self.height() / 16) as usize
    }

    /// Returns `ChromaArrayType` (7.4.2.1.1).
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Returns `SubWidthC` and `SubHeightC` (table 6-1).
    fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            _ => (1, 1),
        }
    }

    /// Returns `CropUnitX` and `CropUnitY` (7-19 through 7-22).
    fn crop_unit_x_y(&self) -> (u32, u32) {
        let frame_factor = 2 - u32::from(self.frame_mbs_only_flag);
        match self.chroma_array_type() {
            0 => (1, frame_factor),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (sub_width_c, sub_height_c * frame_factor)
            }
        }
    }

    /// Same as MaxFrameNum. See 7-10.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Same as MaxPicOrderCntLsb. See 7-11.
    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// The area of the decoded frames that is meant to be displayed, in luma
    /// samples.
    pub fn visible_rectangle(&self) -> Rect {
        if !self.frame_cropping_flag {
            return Rect {
                x: 0,
                y: 0,
                width: self.width(),
                height: self.height(),
            };
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();

        let crop_left = crop_unit_x * self.frame_crop_left_offset;
        let crop_right = crop_unit_x * self.frame_crop_right_offset;
        let crop_top = crop_unit_y * self.frame_crop_top_offset;
        let crop_bottom = crop_unit_y * self.frame_crop_bottom_offset;

        Rect {
            x: crop_left,
            y: crop_top,
            width: self.width() - crop_left - crop_right,
            height: self.height() - crop_top - crop_bottom,
        }
    }

    /// MaxDpbFrames, derived from the level limits of Table A-1 and the
    /// bitstream restrictions of the VUI.
    pub fn max_dpb_frames(&self) -> usize {
        let profile = self.profile_idc;
        let mut level = self.level_idc;

        // A.3.1 and A.3.2: Level 1b for Baseline, Constrained Baseline and Main
        // profile if level_idc == 11 and constraint_set3_flag == 1
        if matches!(level, Level::L1_1)
            && (profile == Profile::Baseline as u8 || profile == Profile::Main as u8)
            && self.constraint_set3_flag
        {
            level = Level::L1B;
        };

        // Table A.1
        let max_dpb_mbs = match level {
            Level::L1 | Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 | Level::L1_3 | Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 | Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 | Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 | Level::L5_2 => 184320,
            Level::L6 | Level::L6_1 | Level::L6_2 => 696320,
        };

        let frame_mbs = (self.width() / 16) * (self.height() / 16);
        let max_dpb_frames = std::cmp::min(max_dpb_mbs / frame_mbs.max(1), DPB_MAX_SIZE as u32);
        let mut max_dpb_frames =
            std::cmp::max(max_dpb_frames as usize, usize::from(self.max_num_ref_frames));

        if self.vui_parameters_present_flag && self.vui_parameters.bitstream_restriction_flag {
            max_dpb_frames = std::cmp::max(
                usize::from(self.max_num_ref_frames),
                self.vui_parameters.max_dec_frame_buffering as usize,
            );
        }

        max_dpb_frames.clamp(1, DPB_MAX_SIZE)
    }

    /// `max_num_reorder_frames`, either as signaled or as inferred by E.2.1.
    pub fn max_num_order_frames(&self) -> u32 {
        let vui = &self.vui_parameters;
        let present = self.vui_parameters_present_flag && vui.bitstream_restriction_flag;

        if present {
            vui.max_num_reorder_frames
        } else {
            let profile = self.profile_idc;
            if matches!(profile, 44 | 86 | 100 | 110 | 122 | 244) && self.constraint_set3_flag {
                0
            } else {
                self.max_dpb_frames() as u32
            }
        }
    }
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            seq_parameter_set_id: 0,
            profile_idc: Profile::Baseline as u8,
            constraint_set0_flag: false,
            constraint_set1_flag: false,
            constraint_set2_flag: false,
            constraint_set3_flag: false,
            constraint_set4_flag: false,
            constraint_set5_flag: false,
            level_idc: Level::default(),
            chroma_format_idc: 1,
            separate_colour_plane_flag: false,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            qpprime_y_zero_transform_bypass_flag: false,
            seq_scaling_matrix_present_flag: false,
            scaling_lists_4x4: [[16; 16]; 6],
            scaling_lists_8x8: [[16; 64]; 6],
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            delta_pic_order_always_zero_flag: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            num_ref_frames_in_pic_order_cnt_cycle: 0,
            offset_for_ref_frame: [0; 255],
            max_num_ref_frames: 0,
            gaps_in_frame_num_value_allowed_flag: false,
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 0,
            frame_mbs_only_flag: true,
            mb_adaptive_frame_field_flag: false,
            direct_8x8_inference_flag: false,
            frame_cropping_flag: false,
            frame_crop_left_offset: 0,
            frame_crop_right_offset: 0,
            frame_crop_top_offset: 0,
            frame_crop_bottom_offset: 0,
            expected_delta_per_pic_order_cnt_cycle: 0,
            vui_parameters_present_flag: false,
            vui_parameters: Default::default(),
        }
    }
}

#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn profile_idc(mut self, value: Profile) -> Self {
        self.0.profile_idc = value as u8;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value;
        self
    }

    pub fn frame_crop_offsets(mut self, top: u32, bottom: u32, left: u32, right: u32) -> Self {
        self.0.frame_cropping_flag = true;
        self.0.frame_crop_top_offset = top;
        self.0.frame_crop_bottom_offset = bottom;
        self.0.frame_crop_left_offset = left;
        self.0.frame_crop_right_offset = right;
        self
    }

    /// Crop the coded frame by the given amount of luma samples on each side.
    pub fn frame_crop(self, top: u32, bottom: u32, left: u32, right: u32) -> Self {
        let (crop_unit_x, crop_unit_y) = self.0.crop_unit_x_y();

        self.frame_crop_offsets(
            top / crop_unit_y,
            bottom / crop_unit_y,
            left / crop_unit_x,
            right / crop_unit_x,
        )
    }

    /// Set the visible resolution, rounding the coded size up to whole
    /// macroblocks and cropping the difference.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        const MB_SIZE: u32 = 16;

        let mb_width = (width + MB_SIZE - 1) / MB_SIZE;
        let mb_height = (height + MB_SIZE - 1) / MB_SIZE;

        self.0.pic_width_in_mbs_minus1 = (mb_width - 1) as u16;
        self.0.pic_height_in_map_units_minus1 = (mb_height - 1) as u16;

        let compressed_width = mb_width * MB_SIZE;
        let compressed_height = mb_height * MB_SIZE;

        if compressed_width != width || compressed_height != height {
            self = self.frame_crop(0, compressed_height - height, 0, compressed_width - width);
        }

        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    pub fn direct_8x8_inference_flag(mut self, value: bool) -> Self {
        self.0.direct_8x8_inference_flag = value;
        self
    }

    pub fn gaps_in_frame_num_value_allowed_flag(mut self, value: bool) -> Self {
        self.0.gaps_in_frame_num_value_allowed_flag = value;
        self
    }

    pub fn vui_parameters_present(mut self) -> Self {
        if self.0.vui_parameters_present_flag {
            return self;
        }

        self.0.vui_parameters_present_flag = true;
        let vui = &mut self.0.vui_parameters;
        vui.aspect_ratio_info_present_flag = false;
        vui.overscan_info_present_flag = false;
        vui.video_signal_type_present_flag = false;
        vui.colour_description_present_flag = false;
        vui.chroma_loc_info_present_flag = false;
        vui.timing_info_present_flag = false;
        vui.nal_hrd_parameters_present_flag = false;
        vui.vcl_hrd_parameters_present_flag = false;
        vui.pic_struct_present_flag = false;
        vui.bitstream_restriction_flag = false;
        self
    }

    /// Signal the reorder depth and buffer size through the VUI bitstream
    /// restrictions.
    pub fn bitstream_restriction(
        mut self,
        max_num_reorder_frames: u32,
        max_dec_frame_buffering: u32,
    ) -> Self {
        self = self.vui_parameters_present();
        let vui = &mut self.0.vui_parameters;
        vui.bitstream_restriction_flag = true;
        vui.motion_vectors_over_pic_boundaries_flag = true;
        vui.max_bits_per_mb_denom = 1;
        vui.log2_max_mv_length_horizontal = 16;
        vui.log2_max_mv_length_vertical = 16;
        vui.max_num_reorder_frames = max_num_reorder_frames;
        vui.max_dec_frame_buffering = max_dec_frame_buffering;
        self
    }

    pub fn log2_max_frame_num_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_frame_num_minus4 = value;
        self
    }

    pub fn max_frame_num(self, value: u32) -> Self {
        self.log2_max_frame_num_minus4(value.ilog2() as u8 - 4u8)
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.0.pic_order_cnt_type = value;
        self
    }

    pub fn log2_max_pic_order_cnt_lsb_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_pic_order_cnt_lsb_minus4 = value;
        self
    }

    pub fn max_pic_order_cnt_lsb(self, value: u32) -> Self {
        self.log2_max_pic_order_cnt_lsb_minus4(value.ilog2() as u8 - 4u8)
    }

    /// Picture order count type 1 parameters. The expected delta per cycle is
    /// derived from `offset_for_ref_frame`.
    pub fn pic_order_cnt_cycle(
        mut self,
        offset_for_non_ref_pic: i32,
        offset_for_ref_frame: &[i32],
    ) -> Self {
        self.0.pic_order_cnt_type = 1;
        self.0.offset_for_non_ref_pic = offset_for_non_ref_pic;
        self.0.num_ref_frames_in_pic_order_cnt_cycle = offset_for_ref_frame.len() as u8;
        self.0.offset_for_ref_frame[..offset_for_ref_frame.len()]
            .copy_from_slice(offset_for_ref_frame);
        self.0.expected_delta_per_pic_order_cnt_cycle = offset_for_ref_frame.iter().sum();
        self
    }

    pub fn bit_depth_luma_minus8(mut self, value: u8) -> Self {
        self.0.bit_depth_luma_minus8 = value;
        self
    }

    pub fn build(self) -> Rc<Sps> {
        Rc::new(self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    pub cpb_cnt_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

/// Video usability information (Annex E). Only the bitstream restrictions
/// and the timing information influence decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    /// Upper bound of the number of frames preceding any frame in decoding
    /// order and following it in output order.
    pub max_num_reorder_frames: u32,
    /// Required size of the DPB in frames.
    pub max_dec_frame_buffering: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: false,
            aspect_ratio_idc: 0,
            sar_width: 0,
            sar_height: 0,
            overscan_info_present_flag: false,
            overscan_appropriate_flag: false,
            video_signal_type_present_flag: false,
            // Unspecified video format, E.2.1.
            video_format: 5,
            video_full_range_flag: false,
            colour_description_present_flag: false,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
            chroma_loc_info_present_flag: false,
            chroma_sample_loc_type_top_field: 0,
            chroma_sample_loc_type_bottom_field: 0,
            timing_info_present_flag: false,
            num_units_in_tick: 0,
            time_scale: 0,
            fixed_frame_rate_flag: false,
            nal_hrd_parameters_present_flag: false,
            nal_hrd_parameters: Default::default(),
            vcl_hrd_parameters_present_flag: false,
            vcl_hrd_parameters: Default::default(),
            low_delay_hrd_flag: false,
            pic_struct_present_flag: false,
            bitstream_restriction_flag: false,
            motion_vectors_over_pic_boundaries_flag: true,
            max_bytes_per_pic_denom: 0,
            max_bits_per_mb_denom: 0,
            log2_max_mv_length_horizontal: 0,
            log2_max_mv_length_vertical: 0,
            max_num_reorder_frames: 0,
            max_dec_frame_buffering: 0,
        }
    }
}

/// A H264 Picture Parameter Set (7.3.2.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,

    /// CABAC when set, CAVLC otherwise.
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    /// 0: default, 1: explicit, 2: implicit weighted bi-prediction.
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    /// Intra prediction only uses samples of intra coded neighbours.
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,

    /// Scaling lists in effect for pictures using this PPS, in zig-zag order.
    pub scaling_lists_4x4: [[u8; 16]; 6],
    pub scaling_lists_8x8: [[u8; 64]; 6],

    /// Inferred to be `chroma_qp_index_offset` when absent.
    pub second_chroma_qp_index_offset: i8,

    /// The SPS referenced by this PPS.
    pub sps: Rc<Sps>,
}

pub struct PpsBuilder(Pps);

impl PpsBuilder {
    pub fn new(sps: Rc<Sps>) -> Self {
        PpsBuilder(Pps {
            pic_parameter_set_id: 0,
            seq_parameter_set_id: sps.seq_parameter_set_id,
            entropy_coding_mode_flag: false,
            bottom_field_pic_order_in_frame_present_flag: false,
            num_slice_groups_minus1: 0,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            pic_scaling_matrix_present_flag: false,
            scaling_lists_4x4: sps.scaling_lists_4x4,
            scaling_lists_8x8: sps.scaling_lists_8x8,
            second_chroma_qp_index_offset: 0,
            sps,
        })
    }

    pub fn pic_parameter_set_id(mut self, value: u8) -> Self {
        self.0.pic_parameter_set_id = value;
        self
    }

    pub fn entropy_coding_mode_flag(mut self, value: bool) -> Self {
        self.0.entropy_coding_mode_flag = value;
        self
    }

    pub fn pic_init_qp_minus26(mut self, value: i8) -> Self {
        self.0.pic_init_qp_minus26 = value;
        self
    }

    pub fn pic_init_qp(self, value: u8) -> Self {
        self.pic_init_qp_minus26(value as i8 - 26)
    }

    pub fn deblocking_filter_control_present_flag(mut self, value: bool) -> Self {
        self.0.deblocking_filter_control_present_flag = value;
        self
    }

    pub fn constrained_intra_pred_flag(mut self, value: bool) -> Self {
        self.0.constrained_intra_pred_flag = value;
        self
    }

    pub fn weighted_pred_flag(mut self, value: bool) -> Self {
        self.0.weighted_pred_flag = value;
        self
    }

    pub fn weighted_bipred_idc(mut self, value: u8) -> Self {
        self.0.weighted_bipred_idc = value;
        self
    }

    pub fn transform_8x8_mode_flag(mut self, value: bool) -> Self {
        self.0.transform_8x8_mode_flag = value;
        self
    }

    pub fn build(self) -> Rc<Pps> {
        Rc::new(self.0)
    }
}

#[derive(Debug, Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Rc<Sps>>,
    active_ppses: BTreeMap<u8, Rc<Pps>>,
}

impl Parser {
    fn default_scaling_list_4x4(i: usize) -> [u8; 16] {
        // Table 7-2: lists 0-2 are intra, 3-5 inter.
        if i < 3 {
            DEFAULT_4X4_INTRA
        } else {
            DEFAULT_4X4_INTER
        }
    }

    fn default_scaling_list_8x8(i: usize) -> [u8; 64] {
        // Table 7-2: even lists are intra, odd lists inter.
        if i % 2 == 0 {
            DEFAULT_8X8_INTRA
        } else {
            DEFAULT_8X8_INTER
        }
    }

    /// Applies the fall-back rule of table 7-2 to a 4x4 list that was not
    /// transmitted. `intra` and `inter` are the lists used for the first intra
    /// and inter entries (rule A: the defaults, rule B: the sequence lists).
    fn fallback_scaling_list_4x4(
        lists: &mut [[u8; 16]; 6],
        i: usize,
        intra: &[u8; 16],
        inter: &[u8; 16],
    ) {
        lists[i] = match i {
            0 => *intra,
            3 => *inter,
            _ => lists[i - 1],
        }
    }

    fn fallback_scaling_list_8x8(
        lists: &mut [[u8; 64]; 6],
        i: usize,
        intra: &[u8; 64],
        inter: &[u8; 64],
    ) {
        lists[i] = match i {
            0 => *intra,
            1 => *inter,
            _ => lists[i - 2],
        }
    }

    /// Reads one scaling_list() (7.3.2.1.1.1). Returns whether the default
    /// list has to be used instead.
    fn parse_scaling_list(r: &mut NaluReader, scaling_list: &mut [u8]) -> anyhow::Result<bool> {
        let mut last_scale = 8u8;
        let mut next_scale = 8u8;

        for j in 0..scaling_list.len() {
            if next_scale != 0 {
                let delta_scale = r.read_se_bounded::<i32>(-128, 127)?;
                next_scale = ((i32::from(last_scale) + delta_scale + 256) % 256) as u8;
                if j == 0 && next_scale == 0 {
                    return Ok(true);
                }
            }

            scaling_list[j] = if next_scale == 0 {
                last_scale
            } else {
                next_scale
            };

            last_scale = scaling_list[j];
        }

        Ok(false)
    }

    /// Parses the 4x4 and 8x8 lists of a SPS or PPS. Lists that are not
    /// present use the fall-back lists given as `fallback_4x4` and
    /// `fallback_8x8`.
    fn parse_scaling_lists(
        r: &mut NaluReader,
        lists_4x4: &mut [[u8; 16]; 6],
        lists_8x8: &mut [[u8; 64]; 6],
        num_8x8: usize,
        fallback_4x4: (&[u8; 16], &[u8; 16]),
        fallback_8x8: (&[u8; 64], &[u8; 64]),
    ) -> anyhow::Result<()> {
        for i in 0..6 {
            if r.read_bit()? {
                if Parser::parse_scaling_list(r, &mut lists_4x4[i])? {
                    lists_4x4[i] = Parser::default_scaling_list_4x4(i);
                }
            } else {
                Parser::fallback_scaling_list_4x4(lists_4x4, i, fallback_4x4.0, fallback_4x4.1);
            }
        }

        for i in 0..num_8x8 {
            if r.read_bit()? {
                if Parser::parse_scaling_list(r, &mut lists_8x8[i])? {
                    lists_8x8[i] = Parser::default_scaling_list_8x8(i);
                }
            } else {
                Parser::fallback_scaling_list_8x8(lists_8x8, i, fallback_8x8.0, fallback_8x8.1);
            }
        }

        Ok(())
    }

    fn parse_hrd(r: &mut NaluReader, hrd: &mut HrdParams) -> anyhow::Result<()> {
        hrd.cpb_cnt_minus1 = r.read_ue_max(31)?;
        hrd.bit_rate_scale = r.read_bits(4)?;
        hrd.cpb_size_scale = r.read_bits(4)?;

        for sched_sel_idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
            hrd.bit_rate_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cpb_size_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cbr_flag[sched_sel_idx] = r.read_bit()?;
        }

        hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
        hrd.time_offset_length = r.read_bits(5)?;
        Ok(())
    }

    fn parse_vui(r: &mut NaluReader, vui: &mut VuiParams) -> anyhow::Result<()> {
        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            // Extended_SAR
            if vui.aspect_ratio_idc == 255 {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coefficients = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits::<u32>(31)? << 1;
            vui.num_units_in_tick |= u32::from(r.read_bit()?);
            if vui.num_units_in_tick == 0 {
                return Err(anyhow!("num_units_in_tick == 0, which is not allowed by E.2.1"));
            }

            vui.time_scale = r.read_bits::<u32>(31)? << 1;
            vui.time_scale |= u32::from(r.read_bit()?);
            if vui.time_scale == 0 {
                return Err(anyhow!("time_scale == 0, which is not allowed by E.2.1"));
            }

            vui.fixed_frame_rate_flag = r.read_bit()?;
        }

        vui.nal_hrd_parameters_present_flag = r.read_bit()?;
        if vui.nal_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.nal_hrd_parameters)?;
        }

        vui.vcl_hrd_parameters_present_flag = r.read_bit()?;
        if vui.vcl_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.vcl_hrd_parameters)?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            vui.low_delay_hrd_flag = r.read_bit()?;
        }

        vui.pic_struct_present_flag = r.read_bit()?;
        vui.bitstream_restriction_flag = r.read_bit()?;

        if vui.bitstream_restriction_flag {
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.max_bytes_per_pic_denom = r.read_ue()?;
            vui.max_bits_per_mb_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(16)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(16)?;
            vui.max_num_reorder_frames = r.read_ue_max(DPB_MAX_SIZE as u32)?;
            vui.max_dec_frame_buffering = r.read_ue_max(DPB_MAX_SIZE as u32)?;
        }

        Ok(())
    }

    /// Parse a SPS and store it, replacing any SPS with the same id.
    ///
    /// Returns a reference to the new SPS.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> anyhow::Result<&Rc<Sps>> {
        if !matches!(nalu.header.type_, NaluType::Sps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Sps,
                nalu.header.type_
            ));
        }

        let data = nalu.as_ref();
        // Skip the header
        let mut r = NaluReader::new(&data[nalu.header.len()..]);
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set0_flag: r.read_bit()?,
            constraint_set1_flag: r.read_bit()?,
            constraint_set2_flag: r.read_bit()?,
            constraint_set3_flag: r.read_bit()?,
            constraint_set4_flag: r.read_bit()?,
            constraint_set5_flag: r.read_bit()?,
            ..Default::default()
        };

        // skip reserved_zero_2bits
        r.skip_bits(2)?;

        let level: u8 = r.read_bits(8)?;
        sps.level_idc = Level::n(level).with_context(|| format!("Unsupported level {}", level))?;
        sps.seq_parameter_set_id = r.read_ue_max(u32::from(MAX_SPS_COUNT) - 1)?;

        if has_high_profile_syntax(sps.profile_idc) {
            sps.chroma_format_idc = r.read_ue_max(3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };
                // Fall-back rule A.
                Parser::parse_scaling_lists(
                    &mut r,
                    &mut sps.scaling_lists_4x4,
                    &mut sps.scaling_lists_8x8,
                    num_8x8,
                    (&DEFAULT_4X4_INTRA, &DEFAULT_4X4_INTER),
                    (&DEFAULT_8X8_INTRA, &DEFAULT_8X8_INTER),
                )?;
            }
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;
        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            sps.num_ref_frames_in_pic_order_cnt_cycle = r.read_ue_max(254)?;

            let mut offset_acc = 0i32;
            for i in 0..usize::from(sps.num_ref_frames_in_pic_order_cnt_cycle) {
                sps.offset_for_ref_frame[i] = r.read_se()?;

                // (7-12).
                offset_acc = offset_acc.wrapping_add(sps.offset_for_ref_frame[i]);
            }

            sps.expected_delta_per_pic_order_cnt_cycle = offset_acc;
        }

        sps.max_num_ref_frames = r.read_ue_max(DPB_MAX_SIZE as u32)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue_max(1023)?;
        sps.pic_height_in_map_units_minus1 = r.read_ue_max(1023)?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;

            // The cropped area must not be empty or negative.
            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            sps.frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|r| r.checked_mul(crop_unit_x))
                .and_then(|r| sps.width().checked_sub(r))
                .filter(|w| *w > 0)
                .ok_or(anyhow!("Invalid frame crop width"))?;

            sps.frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|r| r.checked_mul(crop_unit_y))
                .and_then(|r| sps.height().checked_sub(r))
                .filter(|h| *h > 0)
                .ok_or(anyhow!("Invalid frame crop height"))?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(&mut r, &mut sps.vui_parameters)?;
        }

        let key = sps.seq_parameter_set_id;
        debug!(
            "Parsed SPS {}: {}x{} profile {} level {:?}",
            key,
            sps.width(),
            sps.height(),
            sps.profile_idc,
            sps.level_idc
        );

        let sps = Rc::new(sps);
        self.active_spses.insert(key, sps);
        self.active_spses
            .get(&key)
            .ok_or(anyhow!("SPS {} vanished after insertion", key))
    }

    /// Parse a PPS and store it, replacing any PPS with the same id. The
    /// referenced SPS must have been parsed before.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> anyhow::Result<&Rc<Pps>> {
        if !matches!(nalu.header.type_, NaluType::Pps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Pps,
                nalu.header.type_
            ));
        }

        let data = nalu.as_ref();
        // Skip the header
        let mut r = NaluReader::new(&data[nalu.header.len()..]);
        let pic_parameter_set_id = r.read_ue_max(u32::from(MAX_PPS_COUNT) - 1)?;
        let seq_parameter_set_id = r.read_ue_max(u32::from(MAX_SPS_COUNT) - 1)?;
        let sps = self.get_sps(seq_parameter_set_id).with_context(|| {
            format!(
                "Broken stream: PPS {} references SPS {} that has not been successfully parsed",
                pic_parameter_set_id, seq_parameter_set_id
            )
        })?;

        let mut pps = PpsBuilder::new(Rc::clone(sps))
            .pic_parameter_set_id(pic_parameter_set_id)
            .0;

        pps.entropy_coding_mode_flag = r.read_bit()?;
        pps.bottom_field_pic_order_in_frame_present_flag = r.read_bit()?;
        pps.num_slice_groups_minus1 = r.read_ue_max(7)?;

        if pps.num_slice_groups_minus1 > 0 {
            return Err(anyhow!(
                "Stream uses {} slice groups, which is not supported",
                pps.num_slice_groups_minus1 + 1
            ));
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(31)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(31)?;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;
        if pps.weighted_bipred_idc == 3 {
            return Err(anyhow!("Invalid weighted_bipred_idc 3"));
        }

        let qp_bd_offset_y = i32::from(6 * (sps.bit_depth_luma_minus8));
        pps.pic_init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;
        pps.pic_init_qs_minus26 = r.read_se_bounded(-26, 25)?;

        pps.chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        if r.has_more_rsbp_data() {
            pps.transform_8x8_mode_flag = r.read_bit()?;
            pps.pic_scaling_matrix_present_flag = r.read_bit()?;

            if pps.pic_scaling_matrix_present_flag {
                let num_8x8 = match (pps.transform_8x8_mode_flag, sps.chroma_format_idc) {
                    (false, _) => 0,
                    (true, 3) => 6,
                    (true, _) => 2,
                };

                if sps.seq_scaling_matrix_present_flag {
                    // Fall-back rule B.
                    Parser::parse_scaling_lists(
                        &mut r,
                        &mut pps.scaling_lists_4x4,
                        &mut pps.scaling_lists_8x8,
                        num_8x8,
                        (&sps.scaling_lists_4x4[0], &sps.scaling_lists_4x4[3]),
                        (&sps.scaling_lists_8x8[0], &sps.scaling_lists_8x8[1]),
                    )?;
                } else {
                    // Fall-back rule A.
                    Parser::parse_scaling_lists(
                        &mut r,
                        &mut pps.scaling_lists_4x4,
                        &mut pps.scaling_lists_8x8,
                        num_8x8,
                        (&DEFAULT_4X4_INTRA, &DEFAULT_4X4_INTER),
                        (&DEFAULT_8X8_INTRA, &DEFAULT_8X8_INTER),
                    )?;
                }
            }

            pps.second_chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        }

        let key = pps.pic_parameter_set_id;
        debug!(
            "Parsed PPS {} (SPS {}), {}",
            key,
            pps.seq_parameter_set_id,
            if pps.entropy_coding_mode_flag {
                "CABAC"
            } else {
                "CAVLC"
            }
        );

        self.active_ppses.insert(key, Rc::new(pps));
        self.active_ppses
            .get(&key)
            .ok_or(anyhow!("PPS {} vanished after insertion", key))
    }

    fn parse_ref_pic_list_modification(
        r: &mut NaluReader,
        num_ref_idx_active_minus1: u8,
        ref_list_mods: &mut Vec<RefPicListModification>,
    ) -> anyhow::Result<()> {
        if num_ref_idx_active_minus1 >= 32 {
            return Err(anyhow!("Broken Data: num_ref_idx_active_minus1 >= 32"));
        }

        loop {
            let mut pic_num_mod = RefPicListModification {
                modification_of_pic_nums_idc: r.read_ue_max(3)?,
                ..Default::default()
            };

            match pic_num_mod.modification_of_pic_nums_idc {
                0 | 1 => {
                    pic_num_mod.abs_diff_pic_num_minus1 = r.read_ue()?;
                }
                2 => {
                    pic_num_mod.long_term_pic_num = r.read_ue()?;
                }
                _ => break,
            }

            // At most one command per list entry, plus the end marker.
            if ref_list_mods.len() > usize::from(num_ref_idx_active_minus1) {
                return Err(anyhow!("Broken Data: too many reference list modifications"));
            }

            ref_list_mods.push(pic_num_mod);
        }

        Ok(())
    }

    fn parse_ref_pic_list_modifications(
        r: &mut NaluReader,
        header: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        if !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.ref_pic_list_modification_flag_l0 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l0 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    header.num_ref_idx_l0_active_minus1,
                    &mut header.ref_pic_list_modification_l0,
                )?;
            }
        }

        if header.slice_type.is_b() {
            header.ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l1 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    header.num_ref_idx_l1_active_minus1,
                    &mut header.ref_pic_list_modification_l1,
                )?;
            }
        }

        Ok(())
    }

    fn parse_pred_weight_table(
        r: &mut NaluReader,
        sps: &Sps,
        header: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        let num_lists = if header.slice_type.is_b() { 2 } else { 1 };
        let num_entries = [header.num_ref_idx_l0_active(), header.num_ref_idx_l1_active()];
        let pt = &mut header.pred_weight_table;
        pt.luma_log2_weight_denom = r.read_ue_max(7)?;
        if sps.chroma_array_type() != 0 {
            pt.chroma_log2_weight_denom = r.read_ue_max(7)?;
        }

        // Weights of entries without explicit flags are inferred to be
        // 2^log2_weight_denom, with a zero offset.
        let default_luma_weight = 1i16 << pt.luma_log2_weight_denom;
        let default_chroma_weight = 1i16 << pt.chroma_log2_weight_denom;
        pt.luma_weight_l0 = [default_luma_weight; 32];
        pt.luma_weight_l1 = [default_luma_weight; 32];
        pt.chroma_weight_l0 = [[default_chroma_weight; 2]; 32];
        pt.chroma_weight_l1 = [[default_chroma_weight; 2]; 32];

        for (list, num_entries) in num_entries.into_iter().enumerate().take(num_lists) {
            let (luma_weight, luma_offset, chroma_weight, chroma_offset) = if list == 0 {
                (
                    &mut pt.luma_weight_l0,
                    &mut pt.luma_offset_l0,
                    &mut pt.chroma_weight_l0,
                    &mut pt.chroma_offset_l0,
                )
            } else {
                (
                    &mut pt.luma_weight_l1,
                    &mut pt.luma_offset_l1,
                    &mut pt.chroma_weight_l1,
                    &mut pt.chroma_offset_l1,
                )
            };

            for i in 0..num_entries {
                if r.read_bit()? {
                    luma_weight[i] = r.read_se_bounded(-128, 127)?;
                    luma_offset[i] = r.read_se_bounded(-128, 127)?;
                }

                if sps.chroma_array_type() != 0 && r.read_bit()? {
                    for j in 0..2 {
                        chroma_weight[i][j] = r.read_se_bounded(-128, 127)?;
                        chroma_offset[i][j] = r.read_se_bounded(-128, 127)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_dec_ref_pic_marking(
        r: &mut NaluReader,
        nalu: &Nalu,
        header: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        let rpm = &mut header.dec_ref_pic_marking;

        if nalu.header.idr_pic_flag {
            rpm.no_output_of_prior_pics_flag = r.read_bit()?;
            rpm.long_term_reference_flag = r.read_bit()?;
            return Ok(());
        }

        rpm.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;
        if !rpm.adaptive_ref_pic_marking_mode_flag {
            return Ok(());
        }

        loop {
            let mut marking = RefPicMarkingInner {
                memory_management_control_operation: r.read_ue_max(6)?,
                ..Default::default()
            };

            let op = marking.memory_management_control_operation;
            if op == 0 {
                break;
            }

            if op == 1 || op == 3 {
                marking.difference_of_pic_nums_minus1 = r.read_ue()?;
            }

            if op == 2 {
                marking.long_term_pic_num = r.read_ue()?;
            }

            if op == 3 || op == 6 {
                marking.long_term_frame_idx = r.read_ue_max(DPB_MAX_SIZE as u32)?;
            }

            if op == 4 {
                marking.max_long_term_frame_idx =
                    MaxLongTermFrameIdx::from_value_plus1(r.read_ue_max(DPB_MAX_SIZE as u32)?);
            }

            // There cannot be more meaningful operations than the DPB has
            // room for, plus mmco 4, 5 and 6.
            if rpm.inner.len() >= 2 * DPB_MAX_SIZE + 3 {
                return Err(anyhow!("Broken Data: too many memory management operations"));
            }

            rpm.inner.push(marking);
        }

        Ok(())
    }

    /// Parse the header of a coded slice. The PPS (and thus the SPS) it
    /// references must already be known.
    pub fn parse_slice_header<'a>(&self, nalu: Nalu<'a>) -> anyhow::Result<Slice<'a>> {
        if !matches!(
            nalu.header.type_,
            NaluType::Slice
                | NaluType::SliceDpa
                | NaluType::SliceDpb
                | NaluType::SliceDpc
                | NaluType::SliceIdr
        ) {
            return Err(anyhow!(
                "Invalid NALU type: {:?} is not a slice NALU",
                nalu.header.type_
            ));
        }

        let data = nalu.as_ref();
        // Skip the header
        let mut r = NaluReader::new(&data[nalu.header.len()..]);

        let mut header = SliceHeader {
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        let slice_type = r.read_ue_max::<u8>(9)? % 5;
        header.slice_type = SliceType::n(slice_type)
            .with_context(|| format!("Invalid slice type {}", slice_type))?;

        header.pic_parameter_set_id = r.read_ue_max(u32::from(MAX_PPS_COUNT) - 1)?;

        let pps = self.get_pps(header.pic_parameter_set_id).with_context(|| {
            format!(
                "Broken stream: slice references PPS {} that has not been successfully parsed",
                header.pic_parameter_set_id
            )
        })?;

        let sps = &pps.sps;

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_bits(2)?;
        }

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit()?;
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit()?;
            }
        }

        header.max_pic_num = if header.field_pic_flag {
            2 * sps.max_frame_num()
        } else {
            sps.max_frame_num()
        };

        if nalu.header.idr_pic_flag {
            header.idr_pic_id = r.read_ue_max(0xffff)?;
        }

        if sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt[1] = r.read_se()?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            header.redundant_pic_cnt = r.read_ue_max(127)?;
        }

        if header.slice_type.is_b() {
            header.direct_spatial_mv_pred_flag = r.read_bit()?;
        }

        if header.slice_type.is_p() || header.slice_type.is_sp() || header.slice_type.is_b() {
            header.num_ref_idx_active_override_flag = r.read_bit()?;
            if header.num_ref_idx_active_override_flag {
                header.num_ref_idx_l0_active_minus1 = r.read_ue_max(31)?;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = r.read_ue_max(31)?;
                }
            } else {
                header.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
                }
            }
        }

        let max_ref_idx = if header.field_pic_flag { 31 } else { 15 };
        if header.num_ref_idx_l0_active_minus1 > max_ref_idx
            || header.num_ref_idx_l1_active_minus1 > max_ref_idx
        {
            return Err(anyhow!(
                "Broken Data: num_ref_idx_active_minus1 ({}, {}) exceeds {}",
                header.num_ref_idx_l0_active_minus1,
                header.num_ref_idx_l1_active_minus1,
                max_ref_idx
            ));
        }

        Parser::parse_ref_pic_list_modifications(&mut r, &mut header)?;

        if (pps.weighted_pred_flag && (header.slice_type.is_p() || header.slice_type.is_sp()))
            || (pps.weighted_bipred_idc == 1 && header.slice_type.is_b())
        {
            Parser::parse_pred_weight_table(&mut r, sps, &mut header)?;
        }

        if nalu.header.ref_idc != 0 {
            Parser::parse_dec_ref_pic_marking(&mut r, &nalu, &mut header)?;
        }

        if pps.entropy_coding_mode_flag && !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.cabac_init_idc = r.read_ue_max(2)?;
        }

        header.slice_qp_delta = r.read_se_bounded(-87, 77)?;
        let qp_bd_offset_y = 6 * i32::from(sps.bit_depth_luma_minus8);
        let slice_qp = header.slice_qp(pps);
        if slice_qp < -qp_bd_offset_y || slice_qp > 51 {
            return Err(anyhow!("Broken Data: SliceQPY {} out of range", slice_qp));
        }

        if header.slice_type.is_sp() || header.slice_type.is_si() {
            if header.slice_type.is_sp() {
                header.sp_for_switch_flag = r.read_bit()?;
            }

            header.slice_qs_delta = r.read_se_bounded(-51, 51)?;
        }

        if pps.deblocking_filter_control_present_flag {
            header.disable_deblocking_filter_idc = r.read_ue_max(2)?;

            if header.disable_deblocking_filter_idc != 1 {
                header.slice_alpha_c0_offset_div2 = r.read_se_bounded(-6, 6)?;
                header.slice_beta_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        header.header_bit_size = r.position();

        Ok(Slice { header, nalu })
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.active_spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.active_ppses.get(&pps_id)
    }

    /// Forget all parameter sets.
    pub fn clear(&mut self) {
        self.active_spses.clear();
        self.active_ppses.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl Header for NaluHeader {
    fn parse<T: AsRef<[u8]>>(cursor: &Cursor<T>) -> anyhow::Result<Self> {
        if !cursor.has_remaining() {
            return Err(anyhow!("Broken Data: empty NAL unit"));
        }

        let byte = cursor.chunk()[0];
        if byte & 0x80 != 0 {
            return Err(anyhow!("Broken Data: forbidden_zero_bit is set"));
        }

        let type_ = NaluType::n(byte & 0x1f)
            .with_context(|| format!("Broken Data: reserved NAL unit type {}", byte & 0x1f))?;

        let ref_idc = (byte & 0x60) >> 5;
        let idr_pic_flag = matches!(type_, NaluType::SliceIdr);

        Ok(NaluHeader {
            ref_idc,
            type_,
            idr_pic_flag,
        })
    }

    fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::SeqEnd | NaluType::StreamEnd)
    }

    fn len(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::h264::synthesizer::Synthesizer;

    fn synthesize_sps(sps: &Sps) -> Vec<u8> {
        let mut buf = Vec::new();
        Synthesizer::<'_, Sps, _>::synthesize(3, sps, &mut buf, true).unwrap();
        buf
    }

    fn synthesize_pps(pps: &Pps) -> Vec<u8> {
        let mut buf = Vec::new();
        Synthesizer::<'_, Pps, _>::synthesize(3, pps, &mut buf, true).unwrap();
        buf
    }

    fn parse_sps(parser: &mut Parser, buf: &[u8]) -> anyhow::Result<Rc<Sps>> {
        let mut cursor = Cursor::new(buf);
        let nalu = Nalu::next(&mut cursor)?;
        parser.parse_sps(&nalu).map(Rc::clone)
    }

    #[test]
    fn parse_synthesized_sps() {
        let sps = SpsBuilder::new()
            .seq_parameter_set_id(3)
            .profile_idc(Profile::Main)
            .level_idc(Level::L3)
            .resolution(320, 240)
            .max_num_ref_frames(4)
            .max_frame_num(256)
            .max_pic_order_cnt_lsb(64)
            .direct_8x8_inference_flag(true)
            .bitstream_restriction(2, 4)
            .build();

        let buf = synthesize_sps(&sps);
        let mut parser = Parser::default();
        let parsed = parse_sps(&mut parser, &buf).unwrap();

        assert_eq!(parsed.seq_parameter_set_id, 3);
        assert_eq!(parsed.width(), 320);
        assert_eq!(parsed.height(), 240);
        assert_eq!(parsed.width_in_mbs(), 20);
        assert_eq!(parsed.height_in_mbs(), 15);
        assert_eq!(parsed.max_frame_num(), 256);
        assert_eq!(parsed.max_pic_order_cnt_lsb(), 64);
        assert_eq!(parsed.max_num_ref_frames, 4);
        assert_eq!(parsed.max_num_order_frames(), 2);
        assert_eq!(parsed.max_dpb_frames(), 4);
        assert!(parser.get_sps(3).is_some());
    }

    #[test]
    fn visible_rectangle_is_cropped() {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::Baseline)
            .resolution(100, 50)
            .build();

        let buf = synthesize_sps(&sps);
        let mut parser = Parser::default();
        let parsed = parse_sps(&mut parser, &buf).unwrap();

        assert_eq!(parsed.width(), 112);
        assert_eq!(parsed.height(), 64);
        assert_eq!(
            parsed.visible_rectangle(),
            Rect {
                x: 0,
                y: 0,
                width: 100,
                height: 50
            }
        );
    }

    #[test]
    fn invalid_sps_crop_width() {
        // SPS with frame_crop_left_offset and frame_crop_right_offset covering
        // the whole coded width.
        let sps = SpsBuilder::new()
            .profile_idc(Profile::Baseline)
            .resolution(32, 32)
            .frame_crop_offsets(0, 0, 8, 8)
            .build();

        let buf = synthesize_sps(&sps);
        let mut parser = Parser::default();
        assert!(parse_sps(&mut parser, &buf).is_err());
    }

    #[test]
    fn truncated_sps_is_an_error() {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::High)
            .resolution(64, 64)
            .build();

        let buf = synthesize_sps(&sps);
        let mut parser = Parser::default();
        assert!(parse_sps(&mut parser, &buf[..7]).is_err());
        assert!(parser.get_sps(0).is_none());
    }

    #[test]
    fn later_sps_replaces_earlier_one() {
        let mut parser = Parser::default();

        let small = SpsBuilder::new().resolution(16, 16).build();
        let large = SpsBuilder::new().resolution(64, 32).build();

        parse_sps(&mut parser, &synthesize_sps(&small)).unwrap();
        parse_sps(&mut parser, &synthesize_sps(&large)).unwrap();

        let sps = parser.get_sps(0).unwrap();
        assert_eq!(sps.width(), 64);
        assert_eq!(sps.height(), 32);
    }

    #[test]
    fn pps_requires_known_sps() {
        let sps = SpsBuilder::new()
            .seq_parameter_set_id(1)
            .resolution(16, 16)
            .build();
        let pps = PpsBuilder::new(Rc::clone(&sps)).build();

        let mut parser = Parser::default();
        let buf = synthesize_pps(&pps);
        let mut cursor = Cursor::new(&buf[..]);
        let nalu = Nalu::next(&mut cursor).unwrap();
        assert!(parser.parse_pps(&nalu).is_err());

        parse_sps(&mut parser, &synthesize_sps(&sps)).unwrap();
        let parsed = parser.parse_pps(&nalu).unwrap();
        assert_eq!(parsed.seq_parameter_set_id, 1);
        assert!(!parsed.entropy_coding_mode_flag);
    }

    #[test]
    fn pps_scaling_lists_fall_back_to_defaults() {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::High)
            .resolution(16, 16)
            .build();

        let mut pps = PpsBuilder::new(Rc::clone(&sps))
            .transform_8x8_mode_flag(true)
            .entropy_coding_mode_flag(true)
            .build();
        {
            let pps = Rc::get_mut(&mut pps).unwrap();
            pps.pic_scaling_matrix_present_flag = true;
            // Zeroed lists are not transmitted: fall-back rule A applies.
            pps.scaling_lists_4x4 = [[0; 16]; 6];
            pps.scaling_lists_4x4[1] = DEFAULT_4X4_INTRA;
            pps.scaling_lists_8x8 = [[0; 64]; 6];
            pps.scaling_lists_8x8[1] = DEFAULT_8X8_INTER;
        }

        let mut parser = Parser::default();
        parse_sps(&mut parser, &synthesize_sps(&sps)).unwrap();
        let buf = synthesize_pps(&pps);
        let mut cursor = Cursor::new(&buf[..]);
        let nalu = Nalu::next(&mut cursor).unwrap();
        let parsed = parser.parse_pps(&nalu).unwrap();

        assert!(parsed.transform_8x8_mode_flag);
        assert_eq!(parsed.scaling_lists_4x4[0], DEFAULT_4X4_INTRA);
        assert_eq!(parsed.scaling_lists_4x4[2], DEFAULT_4X4_INTRA);
        assert_eq!(parsed.scaling_lists_4x4[3], DEFAULT_4X4_INTER);
        assert_eq!(parsed.scaling_lists_4x4[5], DEFAULT_4X4_INTER);
        assert_eq!(parsed.scaling_lists_8x8[0], DEFAULT_8X8_INTRA);
        assert_eq!(parsed.scaling_lists_8x8[1], DEFAULT_8X8_INTER);
    }

    #[test]
    fn nalu_header_rejects_forbidden_bit() {
        let data = [0x00, 0x00, 0x01, 0x87, 0x00];
        let mut cursor = Cursor::new(&data[..]);
        assert!(Nalu::next(&mut cursor).is_err());
    }

    #[test]
    fn max_long_term_frame_idx() {
        assert_eq!(
            MaxLongTermFrameIdx::from_value_plus1(0),
            MaxLongTermFrameIdx::NoLongTermFrameIndices
        );
        assert_eq!(
            MaxLongTermFrameIdx::NoLongTermFrameIndices.to_value_plus1(),
            0
        );

        assert_eq!(
            MaxLongTermFrameIdx::from_value_plus1(25),
            MaxLongTermFrameIdx::Idx(24)
        );
        assert_eq!(MaxLongTermFrameIdx::Idx(24).to_value_plus1(), 25);

        let mut max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
        assert_ne!(max_long_term_frame_idx, 0);
        assert!(max_long_term_frame_idx < 0);
        assert!(max_long_term_frame_idx < 32);

        max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(24);
        assert_ne!(max_long_term_frame_idx, 0);
        assert!(max_long_term_frame_idx > 0);
        assert_eq!(max_long_term_frame_idx, 24);
        assert!(max_long_term_frame_idx < 25);
    }
}
