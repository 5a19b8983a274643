// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h264::parser::RefPicMarking;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsIdr {
    #[default]
    No,
    Yes {
        idr_pic_id: u16,
    },
}

/// Data associated with an h.264 frame. Most fields are extracted from the
/// slice header and kept for the reference marking, list construction and
/// output processes.
#[derive(Clone, Debug, Default)]
pub struct PictureData {
    pub pic_order_cnt_type: u8,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,

    pub pic_num: i32,
    pub long_term_pic_num: u32,
    pub frame_num: i32,
    pub frame_num_offset: i32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: u32,

    pub is_idr: IsIdr,
    pub nal_ref_idc: u8,
    reference: Reference,
    pub ref_pic_marking: RefPicMarking,

    /// Inferred by a gap in frame_num: holds no samples and is never output.
    pub nonexisting: bool,
    pub needed_for_output: bool,
    pub has_mmco_5: bool,

    pub timestamp: u64,
}

impl PictureData {
    /// Creates the "non-existing" frame inferred for `frame_num` by 8.2.5.2.
    pub fn new_non_existing(frame_num: i32, timestamp: u64) -> Self {
        PictureData {
            frame_num,
            nonexisting: true,
            nal_ref_idc: 1,
            pic_num: frame_num,
            reference: Reference::ShortTerm,
            timestamp,
            ..Default::default()
        }
    }

    /// Creates the picture started by `slice`, before its POC is computed.
    pub fn new_from_slice(slice: &Slice, sps: &Sps, timestamp: u64) -> Self {
        let hdr = &slice.header;
        let nalu_hdr = &slice.nalu.header;

        let is_idr = if nalu_hdr.idr_pic_flag {
            IsIdr::Yes {
                idr_pic_id: hdr.idr_pic_id,
            }
        } else {
            IsIdr::No
        };

        let reference = if nalu_hdr.ref_idc != 0 {
            Reference::ShortTerm
        } else {
            Reference::None
        };

        let frame_num = i32::from(hdr.frame_num);

        let (pic_order_cnt_lsb, delta_pic_order_cnt_bottom) = match sps.pic_order_cnt_type {
            0 => (
                i32::from(hdr.pic_order_cnt_lsb),
                hdr.delta_pic_order_cnt_bottom,
            ),
            _ => (0, 0),
        };

        PictureData {
            pic_order_cnt_type: sps.pic_order_cnt_type,
            pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom,
            delta_pic_order_cnt0: hdr.delta_pic_order_cnt[0],
            delta_pic_order_cnt1: hdr.delta_pic_order_cnt[1],
            pic_num: frame_num,
            frame_num,
            is_idr,
            nal_ref_idc: nalu_hdr.ref_idc,
            reference,
            ref_pic_marking: hdr.dec_ref_pic_marking.clone(),
            needed_for_output: true,
            timestamp,
            ..Default::default()
        }
    }

    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn is_long_term(&self) -> bool {
        matches!(self.reference, Reference::LongTerm)
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn set_reference(&mut self, reference: Reference) {
        log::debug!(
            "Set reference of frame_num {} (POC {}) to {:?}",
            self.frame_num,
            self.pic_order_cnt,
            reference
        );
        self.reference = reference;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_existing_frames_are_short_term() {
        let pic = PictureData::new_non_existing(7, 42);

        assert!(pic.nonexisting);
        assert!(pic.is_ref());
        assert!(!pic.is_long_term());
        assert!(!pic.needed_for_output);
        assert_eq!(pic.frame_num, 7);
        assert_eq!(pic.pic_num, 7);
        assert_eq!(pic.timestamp, 42);
    }

    #[test]
    fn reference_transitions() {
        let mut pic = PictureData::default();
        assert!(!pic.is_ref());

        pic.set_reference(Reference::LongTerm);
        assert!(pic.is_ref());
        assert!(pic.is_long_term());

        pic.set_reference(Reference::None);
        assert!(!pic.is_ref());
    }
}
