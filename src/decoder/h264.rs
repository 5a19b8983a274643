// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software H.264 decoder.
//!
//! [`H264Decoder`] takes access units and hands back decoded pictures in
//! output order. Parameter set handling, picture order counts, reference
//! marking and DPB management live here; macroblock decoding is done by
//! [`slice::SliceDecoder`] and the in-loop filter by [`deblock`].
//!
//! Only progressive 8-bit 4:2:0 streams are supported. Streams using
//! interlaced coding, other chroma formats or bit depths, slice groups or
//! data partitioning are rejected with [`DecodeError::UnsupportedStream`]
//! when their parameter sets are activated.

mod cabac;
mod cabac_tables;
pub(crate) mod cavlc;
mod deblock;
mod frame;
mod inter;
mod intra;
mod macroblock;
mod mvpred;
mod slice;
mod transform;

use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use log::debug;
use log::error;
use log::warn;

use crate::codec::h264::avcc::AvcDecoderConfigurationRecord;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbPicRefList;
use crate::codec::h264::dpb::ReferencePicLists;
use crate::codec::h264::parser::MaxLongTermFrameIdx;
use crate::codec::h264::parser::Nalu;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::SliceType;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::decoder::h264::deblock::deblock_frame;
use crate::decoder::h264::frame::Frame;
use crate::decoder::h264::frame::FrameId;
use crate::decoder::h264::frame::RefPicture;
use crate::decoder::h264::macroblock::DeblockParams;
use crate::decoder::h264::macroblock::MbArena;
use crate::decoder::h264::slice::conceal_missing;
use crate::decoder::h264::slice::SliceDecoder;
use crate::decoder::h264::transform::Dequantizer;
use crate::decoder::CorruptSlicePolicy;
use crate::decoder::DecodeError;
use crate::decoder::DecodedFrame;
use crate::decoder::DecoderConfig;
use crate::decoder::Framing;
use crate::decoder::ReadyFramesQueue;
use crate::decoder::Result;
use crate::Rect;

/// Largest DPB allowed by Annex A.
const DPB_MAX_SIZE: usize = 16;

fn malformed(e: anyhow::Error) -> DecodeError {
    DecodeError::MalformedBitstream(e)
}

/// A reconstructed frame, as held by the DPB and the output queue.
#[derive(Clone, Debug)]
struct FrameHandle {
    frame: Rc<Frame>,
    crop: Rect,
    poc: i32,
    timestamp: u64,
}

/// State of the previous reference picture, needed by the POC computation of
/// the next pictures.
#[derive(Debug, Default)]
struct PrevReferencePicInfo {
    frame_num: i32,
    has_mmco_5: bool,
    top_field_order_cnt: i32,
    pic_order_cnt_msb: i32,
    pic_order_cnt_lsb: i32,
}

/// State of the previous picture, needed by the POC computation of the next
/// pictures.
#[derive(Debug, Default)]
struct PrevPicInfo {
    frame_num: i32,
    frame_num_offset: i32,
    has_mmco_5: bool,
}

/// The slice header fields that tell the first slice of a new picture apart
/// (7.4.1.2.4).
#[derive(Debug, PartialEq, Eq)]
struct PictureId {
    frame_num: u16,
    pic_parameter_set_id: u8,
    is_reference: bool,
    pic_order_cnt_lsb: u16,
    delta_pic_order_cnt_bottom: i32,
    delta_pic_order_cnt: [i32; 2],
    idr_pic_id: Option<u16>,
}

impl PictureId {
    fn new(slice: &Slice) -> Self {
        let hdr = &slice.header;

        Self {
            frame_num: hdr.frame_num,
            pic_parameter_set_id: hdr.pic_parameter_set_id,
            is_reference: slice.nalu.header.ref_idc != 0,
            pic_order_cnt_lsb: hdr.pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom: hdr.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt: hdr.delta_pic_order_cnt,
            idr_pic_id: slice.nalu.header.idr_pic_flag.then_some(hdr.idr_pic_id),
        }
    }
}

/// The picture being decoded.
struct CurrentPicState {
    pic: PictureData,
    id: PictureId,
    frame: Frame,
    sps: Rc<Sps>,
    /// The initial reference lists, before per-slice modification.
    ref_pic_lists: ReferencePicLists<FrameHandle>,
    /// The most recent reference frame, copied into macroblocks that could
    /// not be decoded.
    conceal_ref: Option<Rc<Frame>>,
    /// Set when a slice failed under [`CorruptSlicePolicy::Abort`].
    aborted: bool,
}

pub struct H264Decoder {
    config: DecoderConfig,
    framing: Framing,
    parser: Parser,
    dpb: Dpb<FrameHandle>,
    /// SPS of the current coded video sequence.
    active_sps: Option<Rc<Sps>>,
    arena: MbArena,

    prev_ref_pic_info: PrevReferencePicInfo,
    prev_pic_info: PrevPicInfo,
    max_long_term_frame_idx: MaxLongTermFrameIdx,

    cur_pic: Option<CurrentPicState>,
    /// Skip pictures until the next IDR, set after a reset.
    awaiting_idr: bool,
    ready_queue: ReadyFramesQueue<FrameHandle>,
    next_frame_id: FrameId,
}

impl Default for H264Decoder {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl H264Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            framing: Default::default(),
            parser: Default::default(),
            dpb: Default::default(),
            active_sps: None,
            arena: MbArena::new(0, 0),
            prev_ref_pic_info: Default::default(),
            prev_pic_info: Default::default(),
            max_long_term_frame_idx: Default::default(),
            cur_pic: None,
            awaiting_idr: false,
            ready_queue: Default::default(),
            next_frame_id: 1,
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Sets how NAL units are delimited in the buffers passed to
    /// [`decode`](Self::decode).
    pub fn set_framing(&mut self, framing: Framing) {
        self.framing = framing;
    }

    /// Loads the parameter sets of an `avcC` record and switches to the
    /// length-prefixed framing it declares.
    pub fn decode_config_record(&mut self, record: &AvcDecoderConfigurationRecord) -> Result<()> {
        for raw in record.sps.iter().chain(record.pps.iter()) {
            let nalu = Nalu::from_raw(raw).map_err(malformed)?;
            self.handle_nalu(0, nalu)?;
        }

        self.framing = Framing::LengthPrefixed(record.nalu_length_size);
        Ok(())
    }

    /// Decodes one access unit. `timestamp` is attached to the picture it
    /// carries.
    ///
    /// Every NAL unit is processed even if an earlier one fails. The first
    /// error is returned; the pictures that could be decoded are still
    /// available through [`next_frame`](Self::next_frame).
    pub fn decode(&mut self, timestamp: u64, bitstream: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(bitstream);
        let mut first_error = None;

        while (cursor.position() as usize) < bitstream.len() {
            let start = cursor.position();
            let nalu = match self.framing {
                Framing::AnnexB => Nalu::next(&mut cursor),
                Framing::LengthPrefixed(length_size) => {
                    Nalu::next_length_prefixed(&mut cursor, length_size)
                }
            };

            let nalu = match nalu {
                Ok(nalu) => nalu,
                Err(e) => {
                    // A bad NAL header can be skipped in Annex B streams, the
                    // next start code resynchronizes.
                    let resync = self.framing == Framing::AnnexB && cursor.position() > start;
                    if self.framing == Framing::AnnexB && !resync {
                        debug!("No more NAL units: {:#}", e);
                    } else {
                        first_error.get_or_insert(malformed(e));
                    }

                    if resync {
                        continue;
                    }
                    break;
                }
            };

            if let Err(e) = self.handle_nalu(timestamp, nalu) {
                warn!("Error while decoding NAL unit: {}", e);
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.finish_picture() {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the next picture in output order, if one is ready.
    pub fn next_frame(&mut self) -> Option<DecodedFrame> {
        for handle in &mut self.ready_queue {
            match handle.frame.to_picture(handle.crop, handle.poc) {
                Ok(picture) => {
                    return Some(DecodedFrame {
                        timestamp: handle.timestamp,
                        picture,
                    })
                }
                Err(e) => error!("Dropping picture POC {}: {}", handle.poc, e),
            }
        }

        None
    }

    /// Finishes the current picture and moves every picture waiting in the
    /// DPB to the output queue. Decoding resumes with the next IDR picture.
    pub fn flush(&mut self) {
        if let Err(e) = self.finish_picture() {
            warn!("Error while finishing the last picture: {}", e);
        }

        let drained: Vec<_> = self.drain().collect();
        self.ready_queue.extend(drained);
        self.reset_sequence_state();
    }

    /// Discards all pictures, including those not yet output. Parameter
    /// sets are kept, and decoding resumes with the next IDR picture.
    pub fn reset(&mut self) {
        self.cur_pic = None;
        self.dpb.clear();
        self.ready_queue.clear();
        self.reset_sequence_state();
    }

    /// Number of pictures in the output queue.
    pub fn num_ready_frames(&self) -> usize {
        self.ready_queue.len()
    }

    /// Number of pictures held by the DPB.
    pub fn dpb_len(&self) -> usize {
        self.dpb.len()
    }

    /// Timestamps of the pictures decoded but not yet returned by
    /// [`next_frame`](Self::next_frame). A second field shares the timestamp
    /// of the first one.
    pub fn pending_timestamps(&self) -> Vec<u64> {
        let queued = self.ready_queue.iter().map(|handle| handle.timestamp);
        let held = self.dpb.entries().iter().filter_map(|entry| {
            let pic = entry.pic.borrow();
            (pic.needed_for_output && !pic.nonexisting).then_some(pic.timestamp)
        });
        let current = self.cur_pic.iter().map(|cur| cur.pic.timestamp);

        queued.chain(held).chain(current).collect()
    }

    /// Capacity of the DPB for the active sequence.
    pub fn max_dpb_frames(&self) -> usize {
        self.dpb.max_num_pics()
    }

    fn reset_sequence_state(&mut self) {
        self.prev_ref_pic_info = Default::default();
        self.prev_pic_info = Default::default();
        self.max_long_term_frame_idx = Default::default();
        self.awaiting_idr = true;
    }

    fn drain(&mut self) -> impl Iterator<Item = FrameHandle> {
        self.dpb.drain().into_iter().flatten()
    }

    fn handle_nalu(&mut self, timestamp: u64, nalu: Nalu) -> Result<()> {
        match nalu.header.type_ {
            NaluType::Sps => {
                let sps = self.parser.parse_sps(&nalu).map_err(malformed)?;
                debug!(
                    "Parsed SPS {}: {}x{}",
                    sps.seq_parameter_set_id,
                    sps.width(),
                    sps.height()
                );
                check_sps(sps)
            }
            NaluType::Pps => {
                let pps = self.parser.parse_pps(&nalu).map_err(malformed)?;
                debug!("Parsed PPS {}", pps.pic_parameter_set_id);
                Ok(())
            }
            NaluType::Slice | NaluType::SliceIdr => self.handle_slice_nalu(timestamp, nalu),
            NaluType::SliceDpa | NaluType::SliceDpb | NaluType::SliceDpc => Err(
                DecodeError::UnsupportedStream("data partitioned slices".into()),
            ),
            NaluType::AuDelimiter | NaluType::SeqEnd | NaluType::StreamEnd => {
                self.finish_picture()
            }
            other => {
                debug!("Ignoring NAL unit of type {:?}", other);
                Ok(())
            }
        }
    }

    fn handle_slice_nalu(&mut self, timestamp: u64, nalu: Nalu) -> Result<()> {
        let slice = self.parser.parse_slice_header(nalu).map_err(malformed)?;

        if slice.header.redundant_pic_cnt > 0 {
            debug!("Skipping redundant slice");
            return Ok(());
        }

        if slice.header.slice_type.is_sp() || slice.header.slice_type.is_si() {
            return Err(DecodeError::UnsupportedStream(format!(
                "{:?} slices",
                slice.header.slice_type
            )));
        }

        let pps = self
            .parser
            .get_pps(slice.header.pic_parameter_set_id)
            .cloned()
            .with_context(|| format!("unknown PPS {}", slice.header.pic_parameter_set_id))
            .map_err(malformed)?;
        check_pps(&pps)?;

        if self.awaiting_idr {
            if !slice.nalu.header.idr_pic_flag {
                debug!("Skipping slice while waiting for an IDR picture");
                return Ok(());
            }
            self.awaiting_idr = false;
        }

        let new_picture = match &self.cur_pic {
            Some(cur) => cur.id != PictureId::new(&slice),
            None => true,
        };

        let mut finished = Ok(());
        if new_picture {
            finished = self.finish_picture();
            self.begin_picture(timestamp, &slice, &pps)?;
        }

        self.decode_slice(&slice, &pps)?;
        finished
    }

    /// Makes `sps` the active SPS, resizing the DPB and the macroblock state
    /// if the sequence changed.
    fn activate_sps(&mut self, sps: &Rc<Sps>) -> Result<()> {
        check_sps(sps)?;

        let (max_dpb_frames, max_num_reorder_frames) = self.dpb_limits(sps);

        let changed = match &self.active_sps {
            Some(active) => {
                active.width_in_mbs() != sps.width_in_mbs()
                    || active.height_in_mbs() != sps.height_in_mbs()
                    || self.dpb.max_num_pics() != max_dpb_frames
                    || self.dpb.max_num_reorder_frames() != max_num_reorder_frames
            }
            None => true,
        };

        if changed {
            debug!(
                "New sequence: {}x{} macroblocks, DPB of {} frames, {} reorder frames",
                sps.width_in_mbs(),
                sps.height_in_mbs(),
                max_dpb_frames,
                max_num_reorder_frames
            );

            let drained: Vec<_> = self.drain().collect();
            self.ready_queue.extend(drained);
            self.arena = MbArena::new(sps.width_in_mbs(), sps.height_in_mbs());
            self.dpb.set_limits(max_dpb_frames, max_num_reorder_frames);
        }

        self.active_sps = Some(Rc::clone(sps));
        Ok(())
    }

    fn dpb_limits(&self, sps: &Sps) -> (usize, usize) {
        let mut max_dpb_frames = sps.max_dpb_frames();

        if let Some(frames) = self.config.max_dpb_frames_override {
            // The references of the stream must still fit.
            let min_frames = usize::from(sps.max_num_ref_frames).max(1);
            if frames < min_frames {
                warn!(
                    "DPB override of {} frames raised to the {} reference frames of the stream",
                    frames, min_frames
                );
            }
            max_dpb_frames = frames.max(min_frames);
        }

        let max_dpb_frames = max_dpb_frames.clamp(1, DPB_MAX_SIZE);
        let max_num_reorder_frames = (sps.max_num_order_frames() as usize).min(max_dpb_frames);

        (max_dpb_frames, max_num_reorder_frames)
    }

    // 8.2.1
    fn compute_pic_order_count(&mut self, sps: &Sps, pic: &mut PictureData) -> anyhow::Result<()> {
        let is_idr = matches!(pic.is_idr, IsIdr::Yes { .. });

        match pic.pic_order_cnt_type {
            // 8.2.1.1
            0 => {
                let (prev_pic_order_cnt_msb, prev_pic_order_cnt_lsb) = if is_idr {
                    (0, 0)
                } else if self.prev_ref_pic_info.has_mmco_5 {
                    (0, self.prev_ref_pic_info.top_field_order_cnt)
                } else {
                    (
                        self.prev_ref_pic_info.pic_order_cnt_msb,
                        self.prev_ref_pic_info.pic_order_cnt_lsb,
                    )
                };

                let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();

                pic.pic_order_cnt_msb = if pic.pic_order_cnt_lsb < prev_pic_order_cnt_lsb
                    && prev_pic_order_cnt_lsb - pic.pic_order_cnt_lsb >= max_pic_order_cnt_lsb / 2
                {
                    prev_pic_order_cnt_msb + max_pic_order_cnt_lsb
                } else if pic.pic_order_cnt_lsb > prev_pic_order_cnt_lsb
                    && pic.pic_order_cnt_lsb - prev_pic_order_cnt_lsb > max_pic_order_cnt_lsb / 2
                {
                    prev_pic_order_cnt_msb - max_pic_order_cnt_lsb
                } else {
                    prev_pic_order_cnt_msb
                };

                pic.top_field_order_cnt = pic.pic_order_cnt_msb + pic.pic_order_cnt_lsb;
                pic.bottom_field_order_cnt =
                    pic.top_field_order_cnt + pic.delta_pic_order_cnt_bottom;
            }

            // 8.2.1.2
            1 => {
                pic.frame_num_offset = self.frame_num_offset(sps, pic);

                let cycle_len = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);
                let mut abs_frame_num = if cycle_len != 0 {
                    pic.frame_num_offset + pic.frame_num
                } else {
                    0
                };

                if pic.nal_ref_idc == 0 && abs_frame_num > 0 {
                    abs_frame_num -= 1;
                }

                let mut expected_pic_order_cnt = 0;
                if abs_frame_num > 0 {
                    let pic_order_cnt_cycle_cnt = (abs_frame_num - 1) / cycle_len;
                    let frame_num_in_pic_order_cnt_cycle = (abs_frame_num - 1) % cycle_len;

                    expected_pic_order_cnt =
                        pic_order_cnt_cycle_cnt * sps.expected_delta_per_pic_order_cnt_cycle;
                    for i in 0..=frame_num_in_pic_order_cnt_cycle as usize {
                        expected_pic_order_cnt += sps.offset_for_ref_frame[i];
                    }
                }

                if pic.nal_ref_idc == 0 {
                    expected_pic_order_cnt += sps.offset_for_non_ref_pic;
                }

                pic.top_field_order_cnt = expected_pic_order_cnt + pic.delta_pic_order_cnt0;
                pic.bottom_field_order_cnt = pic.top_field_order_cnt
                    + sps.offset_for_top_to_bottom_field
                    + pic.delta_pic_order_cnt1;
            }

            // 8.2.1.3
            2 => {
                pic.frame_num_offset = self.frame_num_offset(sps, pic);

                let temp_pic_order_cnt = if is_idr {
                    0
                } else if pic.nal_ref_idc == 0 {
                    2 * (pic.frame_num_offset + pic.frame_num) - 1
                } else {
                    2 * (pic.frame_num_offset + pic.frame_num)
                };

                pic.top_field_order_cnt = temp_pic_order_cnt;
                pic.bottom_field_order_cnt = temp_pic_order_cnt;
            }

            other => return Err(anyhow!("invalid pic_order_cnt_type {}", other)),
        }

        pic.pic_order_cnt = std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);
        Ok(())
    }

    /// FrameNumOffset for POC types 1 and 2.
    fn frame_num_offset(&self, sps: &Sps, pic: &PictureData) -> i32 {
        let prev_frame_num_offset = if self.prev_pic_info.has_mmco_5 {
            0
        } else {
            self.prev_pic_info.frame_num_offset
        };

        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            0
        } else if self.prev_pic_info.frame_num > pic.frame_num {
            prev_frame_num_offset + sps.max_frame_num() as i32
        } else {
            prev_frame_num_offset
        }
    }

    /// Infers the frames lost in a gap of `frame_num` (8.2.5.2).
    fn handle_frame_num_gap(&mut self, sps: &Sps, frame_num: i32, timestamp: u64) -> Result<()> {
        if self.dpb.is_empty() {
            return Ok(());
        }

        if !sps.gaps_in_frame_num_value_allowed_flag {
            warn!(
                "frame_num jumped from {} to {}, pictures were lost",
                self.prev_ref_pic_info.frame_num, frame_num
            );
        }

        let max_frame_num = sps.max_frame_num() as i32;
        let mut unused_short_term_frame_num =
            (self.prev_ref_pic_info.frame_num + 1) % max_frame_num;

        while unused_short_term_frame_num != frame_num {
            let mut pic = PictureData::new_non_existing(unused_short_term_frame_num, timestamp);
            pic.pic_order_cnt_type = sps.pic_order_cnt_type;
            self.compute_pic_order_count(sps, &mut pic).map_err(malformed)?;

            self.dpb.update_pic_nums(unused_short_term_frame_num, max_frame_num);
            self.dpb
                .sliding_window_marking(sps.max_num_ref_frames)
                .map_err(malformed)?;
            self.dpb.remove_unused();

            let bumped = self.dpb.bump_as_needed(&pic);
            self.ready_queue.extend(bumped.into_iter().flatten());

            self.prev_ref_pic_info.frame_num = unused_short_term_frame_num;
            self.prev_pic_info.frame_num = unused_short_term_frame_num;
            self.prev_pic_info.frame_num_offset = pic.frame_num_offset;
            self.prev_pic_info.has_mmco_5 = false;

            self.dpb
                .store_picture(Rc::new(RefCell::new(pic)), None)
                .map_err(|e| malformed(e.into()))?;

            unused_short_term_frame_num = (unused_short_term_frame_num + 1) % max_frame_num;
        }

        Ok(())
    }

    fn begin_picture(&mut self, timestamp: u64, slice: &Slice, pps: &Rc<Pps>) -> Result<()> {
        let sps = Rc::clone(&pps.sps);
        self.activate_sps(&sps)?;

        let hdr = &slice.header;
        let is_idr = slice.nalu.header.idr_pic_flag;
        let frame_num = i32::from(hdr.frame_num);
        let max_frame_num = sps.max_frame_num() as i32;

        if is_idr {
            self.prev_ref_pic_info.frame_num = 0;
        }

        if frame_num != self.prev_ref_pic_info.frame_num
            && frame_num != (self.prev_ref_pic_info.frame_num + 1) % max_frame_num
        {
            self.handle_frame_num_gap(&sps, frame_num, timestamp)?;
        }

        let mut pic = PictureData::new_from_slice(slice, &sps, timestamp);
        self.compute_pic_order_count(&sps, &mut pic).map_err(malformed)?;

        if is_idr {
            // C.4.4: prior pictures are output unless the stream says
            // otherwise.
            if hdr.dec_ref_pic_marking.no_output_of_prior_pics_flag {
                self.dpb.clear();
            } else {
                let drained: Vec<_> = self.drain().collect();
                self.ready_queue.extend(drained);
            }
        }

        self.dpb.update_pic_nums(frame_num, max_frame_num);
        let ref_pic_lists = self.dpb.build_ref_pic_lists(&pic);
        let conceal_ref = ref_pic_lists
            .ref_pic_list_p0
            .iter()
            .find_map(|entry| entry.handle.as_ref().map(|h| Rc::clone(&h.frame)));

        debug!(
            "Decoding picture POC {}, frame_num {}, {:?}",
            pic.pic_order_cnt, pic.frame_num, pic.is_idr
        );

        self.arena.reset();
        let frame = Frame::new(self.next_frame_id, sps.width_in_mbs(), sps.height_in_mbs());
        self.next_frame_id += 1;

        self.cur_pic = Some(CurrentPicState {
            pic,
            id: PictureId::new(slice),
            frame,
            sps,
            ref_pic_lists,
            conceal_ref,
            aborted: false,
        });

        Ok(())
    }

    fn decode_slice(&mut self, slice: &Slice, pps: &Rc<Pps>) -> Result<()> {
        let Some(cur) = self.cur_pic.as_mut() else {
            return Err(malformed(anyhow!("slice without a picture")));
        };

        if cur.aborted {
            debug!("Skipping slice of a dropped picture");
            return Ok(());
        }

        if pps.sps.width_in_mbs() != cur.sps.width_in_mbs()
            || pps.sps.height_in_mbs() != cur.sps.height_in_mbs()
        {
            return Err(malformed(anyhow!(
                "slice of PPS {} does not match the size of its picture",
                pps.pic_parameter_set_id
            )));
        }

        let hdr = &slice.header;
        let slice_num = self.arena.slices.len() as u32;
        self.arena.slices.push(DeblockParams {
            disable_deblocking_filter_idc: hdr.disable_deblocking_filter_idc,
            filter_offset_a: i32::from(hdr.slice_alpha_c0_offset_div2) * 2,
            filter_offset_b: i32::from(hdr.slice_beta_offset_div2) * 2,
        });

        let result = create_ref_pic_lists(&self.dpb, &cur.pic, hdr, &cur.ref_pic_lists)
            .map_err(|source| DecodeError::CorruptSlice {
                mb_addr: hdr.first_mb_in_slice as usize,
                source,
            })
            .and_then(|[list0, list1]| {
                let list0 = ref_pictures(&list0);
                let list1 = ref_pictures(&list1);
                let dequantizer = Dequantizer::new(pps);

                SliceDecoder::new(
                    hdr,
                    pps,
                    slice_num,
                    [list0.as_slice(), list1.as_slice()],
                    cur.pic.pic_order_cnt,
                    &dequantizer,
                )
                .decode(slice, &mut self.arena, &mut cur.frame)
            });

        match result {
            Ok(()) => Ok(()),
            Err(e) => match self.config.corrupt_slice_policy {
                CorruptSlicePolicy::Conceal => {
                    warn!("Concealing the rest of slice {}: {}", slice_num, e);
                    Ok(())
                }
                CorruptSlicePolicy::Abort => {
                    warn!("Dropping picture POC {}: {}", cur.pic.pic_order_cnt, e);
                    cur.aborted = true;
                    Err(e)
                }
            },
        }
    }

    // 8.2.5.4
    fn handle_memory_management_ops(&mut self, pic: &mut PictureData) {
        let markings = pic.ref_pic_marking.inner.clone();

        for marking in &markings {
            let result = match marking.memory_management_control_operation {
                0 => break,
                1 => self.dpb.mmco_op_1(pic, marking),
                2 => self.dpb.mmco_op_2(marking),
                3 => self.dpb.mmco_op_3(pic, marking),
                4 => {
                    self.max_long_term_frame_idx = self.dpb.mmco_op_4(marking);
                    Ok(())
                }
                5 => {
                    self.max_long_term_frame_idx = self.dpb.mmco_op_5(pic);
                    Ok(())
                }
                6 => {
                    self.dpb.mmco_op_6(pic, marking);
                    Ok(())
                }
                other => {
                    warn!("Unknown memory_management_control_operation {}", other);
                    break;
                }
            };

            if let Err(e) = result {
                warn!(
                    "Ignoring memory_management_control_operation {}: {}",
                    marking.memory_management_control_operation, e
                );
            }
        }
    }

    // 8.2.5.1
    fn reference_pic_marking(&mut self, sps: &Sps, pic: &mut PictureData) -> Result<()> {
        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            self.dpb.mark_all_as_unused_for_ref();

            if pic.ref_pic_marking.long_term_reference_flag {
                pic.set_reference(Reference::LongTerm);
                pic.long_term_frame_idx = 0;
                self.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
            } else {
                pic.set_reference(Reference::ShortTerm);
                self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
            }

            return Ok(());
        }

        if pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag {
            self.handle_memory_management_ops(pic);
        } else {
            self.dpb
                .sliding_window_marking(sps.max_num_ref_frames)
                .map_err(malformed)?;
        }

        Ok(())
    }

    fn fill_prev_ref_info(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_ref_pic_info;

        prev.has_mmco_5 = pic.has_mmco_5;
        prev.top_field_order_cnt = pic.top_field_order_cnt;
        prev.pic_order_cnt_msb = pic.pic_order_cnt_msb;
        prev.pic_order_cnt_lsb = pic.pic_order_cnt_lsb;
        prev.frame_num = pic.frame_num;
    }

    fn fill_prev_info(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_pic_info;

        prev.frame_num = pic.frame_num;
        prev.has_mmco_5 = pic.has_mmco_5;
        prev.frame_num_offset = pic.frame_num_offset;
    }

    /// Completes the current picture: conceals missing macroblocks, runs the
    /// deblocking filter, marks references and stores the picture in the DPB
    /// or the output queue.
    fn finish_picture(&mut self) -> Result<()> {
        let Some(cur) = self.cur_pic.take() else {
            return Ok(());
        };

        let CurrentPicState {
            mut pic,
            mut frame,
            sps,
            conceal_ref,
            aborted,
            ..
        } = cur;

        if aborted {
            debug!("Dropped picture POC {}", pic.pic_order_cnt);
            return Ok(());
        }

        let concealed = conceal_missing(&mut self.arena, &mut frame, conceal_ref.as_deref());
        if concealed > 0 {
            warn!(
                "Concealed {} macroblocks of picture POC {}",
                concealed, pic.pic_order_cnt
            );
        }

        deblock_frame(&mut frame, &self.arena);

        // Memory management operation 5 rewrites the POC of the picture, the
        // output keeps the decoded one.
        let handle = FrameHandle {
            frame: Rc::new(frame),
            crop: sps.visible_rectangle(),
            poc: pic.pic_order_cnt,
            timestamp: pic.timestamp,
        };

        if pic.is_ref() {
            self.reference_pic_marking(&sps, &mut pic)?;
            self.fill_prev_ref_info(&pic);
        }
        self.fill_prev_info(&pic);

        self.dpb.remove_unused();

        if pic.has_mmco_5 {
            let drained: Vec<_> = self.drain().collect();
            self.ready_queue.extend(drained);
        }

        let bumped = self.dpb.bump_as_needed(&pic);
        self.ready_queue.extend(bumped.into_iter().flatten());

        if pic.is_ref() || self.dpb.has_empty_frame_buffer() {
            self.dpb
                .store_picture(Rc::new(RefCell::new(pic)), Some(handle))
                .map_err(|e| malformed(e.into()))?;
        } else {
            self.ready_queue.push(handle);
        }

        let bumped = self.dpb.bump_reorder_overflow();
        self.ready_queue.extend(bumped.into_iter().flatten());

        Ok(())
    }
}

fn check_sps(sps: &Sps) -> Result<()> {
    let unsupported = if !sps.frame_mbs_only_flag {
        Some("field or MBAFF coding".to_string())
    } else if sps.separate_colour_plane_flag || sps.chroma_format_idc != 1 {
        Some(format!("chroma_format_idc {}", sps.chroma_format_idc))
    } else if sps.bit_depth_luma_minus8 != 0 || sps.bit_depth_chroma_minus8 != 0 {
        Some(format!(
            "bit depth {}/{}",
            sps.bit_depth_luma_minus8 + 8,
            sps.bit_depth_chroma_minus8 + 8
        ))
    } else if sps.qpprime_y_zero_transform_bypass_flag {
        Some("transform bypass".to_string())
    } else {
        None
    };

    match unsupported {
        Some(what) => Err(DecodeError::UnsupportedStream(format!(
            "SPS {} uses {}",
            sps.seq_parameter_set_id, what
        ))),
        None => Ok(()),
    }
}

fn check_pps(pps: &Pps) -> Result<()> {
    if pps.num_slice_groups_minus1 > 0 {
        return Err(DecodeError::UnsupportedStream(format!(
            "PPS {} uses {} slice groups",
            pps.pic_parameter_set_id,
            pps.num_slice_groups_minus1 + 1
        )));
    }

    check_sps(&pps.sps)
}

fn ref_pictures(list: &DpbPicRefList<FrameHandle>) -> Vec<RefPicture> {
    list.iter()
        .map(|entry| {
            let pic = entry.pic.borrow();
            RefPicture {
                frame: entry.handle.as_ref().map(|h| Rc::clone(&h.frame)),
                poc: pic.pic_order_cnt,
                long_term: pic.is_long_term(),
            }
        })
        .collect()
}

/// Builds RefPicList0 and RefPicList1 of a slice from the initial lists of
/// its picture.
fn create_ref_pic_lists(
    dpb: &Dpb<FrameHandle>,
    cur_pic: &PictureData,
    hdr: &SliceHeader,
    ref_pic_lists: &ReferencePicLists<FrameHandle>,
) -> anyhow::Result<[DpbPicRefList<FrameHandle>; 2]> {
    match hdr.slice_type {
        SliceType::P | SliceType::Sp => Ok([
            modify_ref_pic_list(dpb, cur_pic, hdr, 0, ref_pic_lists.ref_pic_list_p0.clone())?,
            Vec::new(),
        ]),
        SliceType::B => Ok([
            modify_ref_pic_list(dpb, cur_pic, hdr, 0, ref_pic_lists.ref_pic_list_b0.clone())?,
            modify_ref_pic_list(dpb, cur_pic, hdr, 1, ref_pic_lists.ref_pic_list_b1.clone())?,
        ]),
        SliceType::I | SliceType::Si => Ok([Vec::new(), Vec::new()]),
    }
}

// 8.2.4.3
fn modify_ref_pic_list(
    dpb: &Dpb<FrameHandle>,
    cur_pic: &PictureData,
    hdr: &SliceHeader,
    list: usize,
    mut ref_pic_list: DpbPicRefList<FrameHandle>,
) -> anyhow::Result<DpbPicRefList<FrameHandle>> {
    let (num_active, modifications) = if list == 0 {
        (hdr.num_ref_idx_l0_active(), &hdr.ref_pic_list_modification_l0)
    } else {
        (hdr.num_ref_idx_l1_active(), &hdr.ref_pic_list_modification_l1)
    };

    ref_pic_list.truncate(num_active);

    let max_pic_num = hdr.max_pic_num as i32;
    let mut pic_num_pred = cur_pic.pic_num;
    let mut ref_idx = 0;

    for modification in modifications {
        let entry = match modification.modification_of_pic_nums_idc {
            // 8.2.4.3.1
            idc @ (0 | 1) => {
                let abs_diff_pic_num = modification.abs_diff_pic_num_minus1 as i32 + 1;

                let pic_num_no_wrap = if idc == 0 {
                    let pic_num = pic_num_pred - abs_diff_pic_num;
                    if pic_num < 0 {
                        pic_num + max_pic_num
                    } else {
                        pic_num
                    }
                } else {
                    let pic_num = pic_num_pred + abs_diff_pic_num;
                    if pic_num >= max_pic_num {
                        pic_num - max_pic_num
                    } else {
                        pic_num
                    }
                };
                pic_num_pred = pic_num_no_wrap;

                let pic_num = if pic_num_no_wrap > cur_pic.pic_num {
                    pic_num_no_wrap - max_pic_num
                } else {
                    pic_num_no_wrap
                };

                dpb.find_short_term_with_pic_num(pic_num)
                    .with_context(|| format!("no short-term reference with pic_num {}", pic_num))?
            }
            // 8.2.4.3.2
            2 => dpb
                .find_long_term_with_long_term_pic_num(modification.long_term_pic_num)
                .with_context(|| {
                    format!(
                        "no long-term reference with long_term_pic_num {}",
                        modification.long_term_pic_num
                    )
                })?,
            3 => break,
            other => return Err(anyhow!("invalid modification_of_pic_nums_idc {}", other)),
        };

        let entry = entry.clone();
        ref_pic_list.insert(ref_idx.min(ref_pic_list.len()), entry.clone());
        ref_idx += 1;

        // Later occurrences of the moved picture are removed.
        let mut i = ref_idx;
        while i < ref_pic_list.len() {
            if Rc::ptr_eq(&ref_pic_list[i].pic, &entry.pic) {
                ref_pic_list.remove(i);
            } else {
                i += 1;
            }
        }

        ref_pic_list.truncate(num_active);
    }

    Ok(ref_pic_list)
}

#[cfg(test)]
mod tests {
    use crate::bitstream_utils::NalIterator;
    use crate::codec::h264::parser::Level;
    use crate::codec::h264::parser::PpsBuilder;
    use crate::codec::h264::parser::Profile;
    use crate::codec::h264::parser::RefPicMarking;
    use crate::codec::h264::parser::RefPicMarkingInner;
    use crate::codec::h264::parser::RefPicListModification;
    use crate::codec::h264::parser::SliceHeaderBuilder;
    use crate::codec::h264::parser::SpsBuilder;
    use crate::codec::h264::synthesizer::MacroblockSynthesis;
    use crate::codec::h264::synthesizer::MotionSynthesis;
    use crate::codec::h264::synthesizer::SliceData;
    use crate::codec::h264::synthesizer::SliceSynthesis;
    use crate::codec::h264::synthesizer::Synthesizer;
    use crate::decoder::h264::cabac::encoder::CabacEncoder;
    use crate::decoder::h264::cabac::CTX_CHROMA_PRED;
    use crate::decoder::h264::cabac::CTX_MB_TYPE_I;
    use crate::decoder::h264::cabac::CTX_QP_DELTA;

    use super::*;

    /// Builds Annex B streams of synthesized NAL units.
    struct Stream {
        sps: Rc<Sps>,
        pps: Rc<Pps>,
    }

    impl Stream {
        /// Main profile, two reorder frames in a DPB of three.
        fn sps(width_in_mbs: u32, height_in_mbs: u32, max_num_ref_frames: u8) -> SpsBuilder {
            SpsBuilder::new()
                .profile_idc(Profile::Main)
                .level_idc(Level::L4)
                .resolution(width_in_mbs * 16, height_in_mbs * 16)
                .max_num_ref_frames(max_num_ref_frames)
                .max_frame_num(16)
                .max_pic_order_cnt_lsb(64)
                .direct_8x8_inference_flag(true)
                .bitstream_restriction(2, 3)
        }

        fn new(width_in_mbs: u32, height_in_mbs: u32, max_num_ref_frames: u8) -> Self {
            Self::with_sps(Self::sps(width_in_mbs, height_in_mbs, max_num_ref_frames).build())
        }

        fn with_sps(sps: Rc<Sps>) -> Self {
            let pps = PpsBuilder::new(Rc::clone(&sps)).build();
            Self { sps, pps }
        }

        fn parameter_sets(&self) -> Vec<u8> {
            let mut buf = Vec::new();
            Synthesizer::<'_, Sps, _>::synthesize(3, &self.sps, &mut buf, true).unwrap();
            Synthesizer::<'_, Pps, _>::synthesize(3, &self.pps, &mut buf, true).unwrap();
            buf
        }

        fn slice(
            &self,
            buf: &mut Vec<u8>,
            ref_idc: u8,
            idr: bool,
            header: &SliceHeader,
            data: SliceData,
        ) {
            let slice = SliceSynthesis {
                header,
                pps: &self.pps,
                idr,
                data,
            };
            Synthesizer::<'_, SliceSynthesis, _>::synthesize(ref_idc, &slice, &mut *buf, true)
                .unwrap();
        }

        fn header(
            &self,
            slice_type: SliceType,
            frame_num: u16,
            poc_lsb: u16,
        ) -> SliceHeaderBuilder {
            SliceHeaderBuilder::new(&self.pps)
                .slice_type(slice_type)
                .frame_num(frame_num)
                .pic_order_cnt_lsb(poc_lsb)
        }

        /// A picture whose macroblocks are all skipped.
        fn skipped(&self, ref_idc: u8, header: &SliceHeader) -> Vec<u8> {
            let num_mbs = self.sps.width_in_mbs() * self.sps.height_in_mbs();
            let mbs = vec![MacroblockSynthesis::Skip; num_mbs];
            let mut buf = Vec::new();
            self.slice(&mut buf, ref_idc, false, header, SliceData::Cavlc(&mbs));
            buf
        }

        /// An IDR access unit made of PCM macroblocks, preceded by the
        /// parameter sets.
        fn idr(&self, samples: &[Vec<u8>]) -> Vec<u8> {
            let mut buf = self.parameter_sets();
            let header = self.header(SliceType::I, 0, 0).build();
            let mbs: Vec<_> = samples.iter().cloned().map(MacroblockSynthesis::Pcm).collect();
            self.slice(&mut buf, 3, true, &header, SliceData::Cavlc(&mbs));
            buf
        }
    }

    /// PCM samples of a macroblock whose luma is `f(x, y)` and chroma is
    /// constant.
    fn pcm(f: impl Fn(usize, usize) -> u8, cb: u8, cr: u8) -> Vec<u8> {
        let mut samples = Vec::with_capacity(384);
        for y in 0..16 {
            for x in 0..16 {
                samples.push(f(x, y));
            }
        }
        samples.extend(std::iter::repeat(cb).take(64));
        samples.extend(std::iter::repeat(cr).take(64));
        samples
    }

    fn collect_frames(decoder: &mut H264Decoder) -> Vec<DecodedFrame> {
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    #[test]
    fn pcm_picture_is_bit_exact() {
        let stream = Stream::new(2, 1, 1);
        let mbs = [
            pcm(|x, y| (x * 8 + y) as u8, 60, 200),
            pcm(|x, y| (255 - x * 4 - y * 3) as u8, 90, 30),
        ];

        let mut decoder = H264Decoder::default();
        decoder.decode(7, &stream.idr(&mbs)).unwrap();
        decoder.flush();

        let frame = decoder.next_frame().unwrap();
        assert!(decoder.next_frame().is_none());
        assert_eq!(frame.timestamp, 7);
        assert_eq!(frame.picture.poc(), 0);

        let luma = frame.picture.plane(0);
        assert_eq!(frame.picture.plane_width(0), 32);
        for y in 0..16 {
            for x in 0..32 {
                let expected = mbs[x / 16][y * 16 + x % 16];
                assert_eq!(luma[y * 32 + x], expected, "luma at ({}, {})", x, y);
            }
        }

        let cb = frame.picture.plane(1);
        assert_eq!(&cb[..8], &[60; 8]);
        assert_eq!(&cb[8..16], &[90; 8]);
        let cr = frame.picture.plane(2);
        assert_eq!(&cr[..8], &[200; 8]);
        assert_eq!(&cr[8..16], &[30; 8]);
    }

    #[test]
    fn length_prefixed_framing() {
        let stream = Stream::new(1, 1, 1);
        let mb = pcm(|x, y| (x * 3 + y * 5) as u8, 70, 180);
        let annexb = stream.idr(&[mb.clone()]);

        let mut sample = Vec::new();
        for nal in NalIterator::new(&annexb) {
            sample.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            sample.extend_from_slice(nal);
        }

        let mut decoder = H264Decoder::default();
        decoder.set_framing(Framing::LengthPrefixed(2));
        decoder.decode(0, &sample).unwrap();
        decoder.flush();

        let frame = decoder.next_frame().unwrap();
        assert_eq!(&frame.picture.plane(0)[..16], &mb[..16]);
        assert_eq!(frame.picture.plane(1)[0], 70);

        // A size running past the end of the sample is malformed.
        let mut decoder = H264Decoder::default();
        decoder.set_framing(Framing::LengthPrefixed(2));
        let err = decoder.decode(0, &[0x00, 0x40, 0x67, 0x42]).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedBitstream(_)));
    }

    #[test]
    fn intra_16x16_without_residual_is_grey() {
        let stream = Stream::new(2, 2, 1);
        let mut buf = stream.parameter_sets();
        let header = stream.header(SliceType::I, 0, 0).build();
        // DC prediction everywhere: no neighbour for the first macroblock,
        // then the propagated 128.
        let mbs = vec![
            MacroblockSynthesis::Intra16x16 {
                pred_mode: 2,
                chroma_pred_mode: 0,
            };
            4
        ];
        stream.slice(&mut buf, 3, true, &header, SliceData::Cavlc(&mbs));

        let mut decoder = H264Decoder::default();
        decoder.decode(0, &buf).unwrap();
        decoder.flush();

        let frame = decoder.next_frame().unwrap();
        assert!(frame.picture.to_vec().iter().all(|s| *s == 128));
    }

    #[test]
    fn p_skip_copies_the_reference() {
        let stream = Stream::new(2, 1, 1);
        let mbs = [pcm(|x, y| (x * 13 + y * 7) as u8, 10, 20), pcm(|_, y| (y * 16) as u8, 30, 40)];

        let mut decoder = H264Decoder::default();
        decoder.decode(0, &stream.idr(&mbs)).unwrap();

        let mut buf = Vec::new();
        let header = stream.header(SliceType::P, 1, 2).build();
        let skips = [MacroblockSynthesis::Skip, MacroblockSynthesis::Skip];
        stream.slice(&mut buf, 2, false, &header, SliceData::Cavlc(&skips));
        decoder.decode(1, &buf).unwrap();
        decoder.flush();

        let frames = collect_frames(&mut decoder);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].picture.poc(), 2);
        assert_eq!(frames[0].picture.to_vec(), frames[1].picture.to_vec());
    }

    #[test]
    fn inter_prediction_follows_the_motion_vector() {
        let stream = Stream::new(1, 1, 1);
        let reference = pcm(|x, y| (x * 10 + y) as u8, 50, 50);

        let mut decoder = H264Decoder::default();
        decoder.decode(0, &stream.idr(&[reference.clone()])).unwrap();

        // Two luma samples to the right.
        let mut buf = Vec::new();
        let header = stream.header(SliceType::P, 1, 2).build();
        let mbs = [MacroblockSynthesis::Inter16x16 {
            l0: Some(MotionSynthesis {
                ref_idx: 0,
                mvd: [8, 0],
            }),
            l1: None,
        }];
        stream.slice(&mut buf, 2, false, &header, SliceData::Cavlc(&mbs));
        decoder.decode(1, &buf).unwrap();
        decoder.flush();

        let frames = collect_frames(&mut decoder);
        assert_eq!(frames.len(), 2);
        let luma = frames[1].picture.plane(0);
        for y in 0..16 {
            for x in 0..16 {
                let src = (x + 2).min(15);
                assert_eq!(luma[y * 16 + x], reference[y * 16 + src], "({}, {})", x, y);
            }
        }
        assert!(frames[1].picture.plane(1).iter().all(|s| *s == 50));
    }

    #[test]
    fn cabac_pcm_picture() {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::Main)
            .level_idc(Level::L4)
            .resolution(32, 16)
            .max_num_ref_frames(1)
            .build();
        let pps = PpsBuilder::new(Rc::clone(&sps))
            .entropy_coding_mode_flag(true)
            .build();
        let stream = Stream {
            sps,
            pps: Rc::clone(&pps),
        };

        let mbs = [pcm(|x, _| (x * 16) as u8, 1, 2), pcm(|_, y| (y * 3) as u8, 3, 4)];

        let mut enc = CabacEncoder::new(SliceType::I, 0, 26);
        // mb_type I_PCM, the second macroblock has an intra left neighbour
        // that is not I_NxN.
        enc.decision(CTX_MB_TYPE_I, true);
        enc.terminate(true);
        enc.pcm(&mbs[0]);
        enc.terminate(false);
        enc.decision(CTX_MB_TYPE_I + 1, true);
        enc.terminate(true);
        enc.pcm(&mbs[1]);
        enc.terminate(true);
        let data = enc.finish();

        let mut buf = stream.parameter_sets();
        let header = stream.header(SliceType::I, 0, 0).build();
        stream.slice(&mut buf, 3, true, &header, SliceData::Cabac(&data));

        let mut decoder = H264Decoder::default();
        decoder.decode(0, &buf).unwrap();
        decoder.flush();

        let frame = decoder.next_frame().unwrap();
        let luma = frame.picture.plane(0);
        assert_eq!(&luma[..16], &mbs[0][..16]);
        assert_eq!(&luma[16..32], &mbs[1][..16]);
        assert_eq!(luma[15 * 32 + 20], mbs[1][15 * 16 + 4]);
        assert_eq!(&frame.picture.plane(2)[8..16], &[4; 8]);
    }

    /// Intra16x16DCLevel in zigzag order, and the Cb and Cr DC levels.
    const DC_LUMA: [i32; 16] = [4, 3, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    const DC_CHROMA: [[i32; 4]; 2] = [[2, 1, 0, 0], [-3, 0, 0, 0]];

    /// A single macroblock picture at QP 26 (30 - 4) without deblocking.
    fn dc_residual_stream(cabac: bool) -> (Stream, SliceHeader) {
        let sps = Stream::new(1, 1, 1).sps;
        let pps = PpsBuilder::new(Rc::clone(&sps))
            .entropy_coding_mode_flag(cabac)
            .pic_init_qp(30)
            .deblocking_filter_control_present_flag(true)
            .build();
        let stream = Stream { sps, pps };
        let header = stream
            .header(SliceType::I, 0, 0)
            .slice_qp_delta(-4)
            .disable_deblocking_filter_idc(1)
            .build();
        (stream, header)
    }

    /// DC prediction of 128 plus the inverse transformed DC levels: the
    /// luma DC dequantizes to 520, 208 and -104 per 8x8 quadrant, the
    /// chroma DC to 312 and 104 for Cb and -312 for Cr.
    fn assert_dc_residual(frame: &DecodedFrame) {
        let picture = &frame.picture;
        assert_eq!(picture.plane_height(0), 16);
        assert_eq!(picture.plane_height(1), 8);

        let luma = picture.plane(0);
        for y in 0..16 {
            for x in 0..16 {
                let expected = match (x < 8, y < 8) {
                    (true, true) => 136,
                    (false, false) => 126,
                    _ => 131,
                };
                assert_eq!(luma[y * 16 + x], expected, "luma at ({}, {})", x, y);
            }
        }

        let cb = picture.plane(1);
        for y in 0..8 {
            for x in 0..8 {
                let expected = if x < 4 { 133 } else { 130 };
                assert_eq!(cb[y * 8 + x], expected, "cb at ({}, {})", x, y);
            }
        }
        assert!(picture.plane(2).iter().all(|s| *s == 123));
    }

    #[test]
    fn cavlc_dc_residual() {
        let (stream, header) = dc_residual_stream(false);
        let mbs = [MacroblockSynthesis::Intra16x16Dc {
            pred_mode: 2,
            chroma_pred_mode: 0,
            qp_delta: 0,
            luma_dc: DC_LUMA,
            chroma_dc: DC_CHROMA,
        }];

        let mut buf = stream.parameter_sets();
        stream.slice(&mut buf, 3, true, &header, SliceData::Cavlc(&mbs));

        let mut decoder = H264Decoder::default();
        decoder.decode(0, &buf).unwrap();
        decoder.flush();
        assert_dc_residual(&decoder.next_frame().unwrap());
    }

    #[test]
    fn cabac_dc_residual() {
        let (stream, header) = dc_residual_stream(true);

        let mut enc = CabacEncoder::new(SliceType::I, 0, 26);
        // mb_type I_16x16_2_1_0: neither I_NxN nor I_PCM, no luma AC,
        // chroma DC only, prediction mode 2.
        enc.decision(CTX_MB_TYPE_I, true);
        enc.terminate(false);
        enc.decision(CTX_MB_TYPE_I + 3, false);
        enc.decision(CTX_MB_TYPE_I + 4, true);
        enc.decision(CTX_MB_TYPE_I + 5, false);
        enc.decision(CTX_MB_TYPE_I + 6, true);
        enc.decision(CTX_MB_TYPE_I + 7, false);
        // intra_chroma_pred_mode 0, mb_qp_delta 0.
        enc.decision(CTX_CHROMA_PRED, false);
        enc.decision(CTX_QP_DELTA, false);
        enc.residual_block(0, 3, &DC_LUMA);
        enc.residual_block(3, 3, &DC_CHROMA[0]);
        enc.residual_block(3, 3, &DC_CHROMA[1]);
        enc.terminate(true);
        let data = enc.finish();

        let mut buf = stream.parameter_sets();
        stream.slice(&mut buf, 3, true, &header, SliceData::Cabac(&data));

        let mut decoder = H264Decoder::default();
        decoder.decode(0, &buf).unwrap();
        decoder.flush();
        assert_dc_residual(&decoder.next_frame().unwrap());
    }

    #[test]
    fn b_frames_are_output_in_poc_order() {
        let stream = Stream::new(1, 1, 2);
        let grey = [pcm(|_, _| 128, 128, 128)];

        let mut decoder = H264Decoder::default();
        let mut frames = Vec::new();

        decoder.decode(0, &stream.idr(&grey)).unwrap();
        frames.extend(collect_frames(&mut decoder));

        // P (POC 6), B (POC 2), B (POC 4), P (POC 12).
        let pictures = [
            (SliceType::P, 1, 6, 2),
            (SliceType::B, 2, 2, 0),
            (SliceType::B, 2, 4, 0),
            (SliceType::P, 2, 12, 2),
        ];
        for (i, (slice_type, frame_num, poc_lsb, ref_idc)) in pictures.into_iter().enumerate() {
            let header = stream
                .header(slice_type, frame_num, poc_lsb)
                .direct_spatial_mv_pred_flag(true)
                .build();
            decoder
                .decode(i as u64 + 1, &stream.skipped(ref_idc, &header))
                .unwrap();
            frames.extend(collect_frames(&mut decoder));
        }

        decoder.flush();
        frames.extend(collect_frames(&mut decoder));

        let pocs: Vec<_> = frames.iter().map(|f| f.picture.poc()).collect();
        assert_eq!(pocs, vec![0, 2, 4, 6, 12]);
        let timestamps: Vec<_> = frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(timestamps, vec![0, 2, 3, 1, 4]);
    }

    #[test]
    fn sliding_window_keeps_max_num_ref_frames() {
        let stream = Stream::new(1, 1, 1);
        let mut decoder = H264Decoder::default();
        decoder.decode(0, &stream.idr(&[pcm(|_, _| 30, 40, 50)])).unwrap();

        for frame_num in 1..5u16 {
            let header = stream.header(SliceType::P, frame_num, frame_num * 2).build();
            decoder
                .decode(u64::from(frame_num), &stream.skipped(2, &header))
                .unwrap();

            assert_eq!(decoder.dpb.num_ref_frames(), 1);
            assert!(decoder.dpb_len() <= decoder.max_dpb_frames());
        }

        decoder.flush();
        let frames = collect_frames(&mut decoder);
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(|f| f.picture.plane(0).iter().all(|s| *s == 30)));
    }

    #[test]
    fn list_modification_moves_the_older_reference_first() {
        let stream = Stream::new(1, 1, 2);
        let mut decoder = H264Decoder::default();
        decoder.decode(0, &stream.idr(&[pcm(|_, _| 10, 128, 128)])).unwrap();

        // A P picture coded as PCM so that it differs from the IDR.
        let mut buf = Vec::new();
        let header = stream.header(SliceType::P, 1, 2).build();
        stream.slice(
            &mut buf,
            2,
            false,
            &header,
            SliceData::Cavlc(&[MacroblockSynthesis::Pcm(pcm(|_, _| 200, 128, 128))]),
        );
        decoder.decode(1, &buf).unwrap();

        // Skip from the IDR (pic_num 0) moved to index 0: 2 - (1 + 1) = 0.
        let header = stream
            .header(SliceType::P, 2, 4)
            .ref_pic_list_modification_l0(vec![RefPicListModification {
                modification_of_pic_nums_idc: 0,
                abs_diff_pic_num_minus1: 1,
                long_term_pic_num: 0,
            }])
            .build();
        let mut buf = Vec::new();
        stream.slice(&mut buf, 2, false, &header, SliceData::Cavlc(&[MacroblockSynthesis::Skip]));
        decoder.decode(2, &buf).unwrap();
        decoder.flush();

        let frames = collect_frames(&mut decoder);
        assert_eq!(frames.len(), 3);
        assert!(frames[2].picture.plane(0).iter().all(|s| *s == 10));
    }

    fn pocs_and_timestamps(frames: &[DecodedFrame]) -> (Vec<i32>, Vec<u64>) {
        frames.iter().map(|f| (f.picture.poc(), f.timestamp)).unzip()
    }

    #[test]
    fn poc_type_1_follows_the_reference_cycle() {
        // Every reference frame advances the POC by 4, a non-reference one
        // sits 2 before the expected count.
        let sps = Stream::sps(1, 1, 1).pic_order_cnt_cycle(-2, &[4]).build();
        let stream = Stream::with_sps(sps);

        let mut decoder = H264Decoder::default();
        decoder.decode(0, &stream.idr(&[pcm(|_, _| 100, 128, 128)])).unwrap();

        // (frame_num, nal_ref_idc, delta_pic_order_cnt[0])
        let pictures = [(1, 2, 0), (2, 2, 0), (3, 0, 0), (3, 2, 2)];
        for (i, (frame_num, ref_idc, delta)) in pictures.into_iter().enumerate() {
            let header = stream
                .header(SliceType::P, frame_num, 0)
                .delta_pic_order_cnt(delta)
                .build();
            decoder
                .decode(i as u64 + 1, &stream.skipped(ref_idc, &header))
                .unwrap();
        }
        decoder.flush();

        let (pocs, timestamps) = pocs_and_timestamps(&collect_frames(&mut decoder));
        assert_eq!(pocs, vec![0, 4, 6, 8, 14]);
        assert_eq!(timestamps, vec![0, 1, 3, 2, 4]);
    }

    #[test]
    fn poc_type_2_is_decoding_order() {
        let sps = Stream::sps(1, 1, 1).pic_order_cnt_type(2).build();
        let stream = Stream::with_sps(sps);

        let mut decoder = H264Decoder::default();
        decoder.decode(0, &stream.idr(&[pcm(|_, _| 100, 128, 128)])).unwrap();

        // frame_num wraps at 16, a non-reference picture follows frame 3.
        let mut pictures: Vec<(u16, u8)> = (1..=17).map(|i| (i % 16, 2)).collect();
        pictures.insert(3, (4, 0));

        let mut expected = vec![0];
        for (i, (frame_num, ref_idc)) in pictures.into_iter().enumerate() {
            let header = stream.header(SliceType::P, frame_num, 0).build();
            decoder
                .decode(i as u64 + 1, &stream.skipped(ref_idc, &header))
                .unwrap();

            let offset = if i >= 16 { 16 } else { 0 };
            let poc = 2 * (offset + i32::from(frame_num)) - i32::from(ref_idc == 0);
            expected.push(poc);
        }
        decoder.flush();

        let (pocs, timestamps) = pocs_and_timestamps(&collect_frames(&mut decoder));
        assert_eq!(pocs, expected);
        assert!(pocs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(timestamps, (0..19).collect::<Vec<u64>>());
    }

    #[test]
    fn pic_order_cnt_lsb_wraps_around() {
        let sps = Stream::sps(1, 1, 1).max_pic_order_cnt_lsb(16).build();
        let stream = Stream::with_sps(sps);

        let mut decoder = H264Decoder::default();
        decoder.decode(0, &stream.idr(&[pcm(|_, _| 100, 128, 128)])).unwrap();

        // (frame_num, nal_ref_idc, pic_order_cnt_lsb): lsb 0 after 12 starts
        // a new MSB period, the non-reference lsb 14 belongs to the old one.
        let pictures = [
            (1, 2, 4),
            (2, 2, 8),
            (3, 2, 12),
            (4, 2, 0),
            (5, 0, 14),
            (5, 2, 4),
            (6, 2, 10),
        ];
        for (i, (frame_num, ref_idc, lsb)) in pictures.into_iter().enumerate() {
            let header = stream.header(SliceType::P, frame_num, lsb).build();
            decoder
                .decode(i as u64 + 1, &stream.skipped(ref_idc, &header))
                .unwrap();
        }
        decoder.flush();

        let (pocs, timestamps) = pocs_and_timestamps(&collect_frames(&mut decoder));
        assert_eq!(pocs, vec![0, 4, 8, 12, 14, 16, 20, 26]);
        assert_eq!(timestamps, vec![0, 1, 2, 3, 5, 4, 6, 7]);
    }

    #[test]
    fn frame_num_gap_infers_reference_frames() {
        let sps = Stream::sps(1, 1, 3)
            .gaps_in_frame_num_value_allowed_flag(true)
            .bitstream_restriction(0, 3)
            .build();
        let stream = Stream::with_sps(sps);

        let mut decoder = H264Decoder::default();
        decoder.decode(0, &stream.idr(&[pcm(|_, _| 100, 128, 128)])).unwrap();
        let header = stream.header(SliceType::P, 1, 2).build();
        decoder.decode(1, &stream.skipped(2, &header)).unwrap();

        // frame_num 2 and 3 are missing.
        let mut buf = Vec::new();
        let header = stream.header(SliceType::P, 4, 8).build();
        let mbs = [MacroblockSynthesis::Pcm(pcm(|_, _| 40, 50, 60))];
        stream.slice(&mut buf, 2, false, &header, SliceData::Cavlc(&mbs));
        decoder.decode(2, &buf).unwrap();

        // The sliding window made room for the two inferred frames.
        assert_eq!(decoder.dpb.num_ref_frames(), 3);
        assert_eq!(decoder.dpb_len(), 3);
        let nonexisting = decoder
            .dpb
            .entries()
            .iter()
            .filter(|entry| entry.pic.borrow().nonexisting)
            .count();
        assert_eq!(nonexisting, 2);

        decoder.flush();
        let frames = collect_frames(&mut decoder);
        let (pocs, timestamps) = pocs_and_timestamps(&frames);
        assert_eq!(pocs, vec![0, 2, 8]);
        assert_eq!(timestamps, vec![0, 1, 2]);
        assert!(frames[2].picture.plane(0).iter().all(|s| *s == 40));
        assert!(decoder.pending_timestamps().is_empty());
    }

    fn mmco(memory_management_control_operation: u8) -> RefPicMarkingInner {
        RefPicMarkingInner {
            memory_management_control_operation,
            ..Default::default()
        }
    }

    #[test]
    fn adaptive_reference_marking() {
        let sps = Stream::sps(1, 1, 4).bitstream_restriction(2, 4).build();
        let stream = Stream::with_sps(sps);
        let long_terms = |decoder: &H264Decoder| decoder.dpb.long_term_refs_iter().count();

        let mut decoder = H264Decoder::default();
        decoder.decode(0, &stream.idr(&[pcm(|_, _| 100, 128, 128)])).unwrap();
        let header = stream.header(SliceType::P, 1, 2).build();
        decoder.decode(1, &stream.skipped(2, &header)).unwrap();
        assert_eq!(decoder.dpb.num_ref_frames(), 2);

        // Long-term indices up to 1, frame_num 0 becomes long-term index 0
        // and the current picture long-term index 1.
        let marking = RefPicMarking {
            adaptive_ref_pic_marking_mode_flag: true,
            inner: vec![
                RefPicMarkingInner {
                    max_long_term_frame_idx: MaxLongTermFrameIdx::Idx(1),
                    ..mmco(4)
                },
                RefPicMarkingInner {
                    difference_of_pic_nums_minus1: 1,
                    long_term_frame_idx: 0,
                    ..mmco(3)
                },
                RefPicMarkingInner {
                    long_term_frame_idx: 1,
                    ..mmco(6)
                },
            ],
            ..Default::default()
        };
        let header = stream.header(SliceType::P, 2, 4).dec_ref_pic_marking(marking).build();
        decoder.decode(2, &stream.skipped(2, &header)).unwrap();
        assert_eq!(decoder.dpb.num_ref_frames(), 3);
        assert_eq!(long_terms(&decoder), 2);

        // Drop frame_num 1 (pic_num 3 - 2) and long_term_pic_num 0.
        let marking = RefPicMarking {
            adaptive_ref_pic_marking_mode_flag: true,
            inner: vec![
                RefPicMarkingInner {
                    difference_of_pic_nums_minus1: 1,
                    ..mmco(1)
                },
                RefPicMarkingInner {
                    long_term_pic_num: 0,
                    ..mmco(2)
                },
            ],
            ..Default::default()
        };
        let header = stream.header(SliceType::P, 3, 6).dec_ref_pic_marking(marking).build();
        decoder.decode(3, &stream.skipped(2, &header)).unwrap();
        assert_eq!(decoder.dpb.num_ref_frames(), 2);
        assert_eq!(long_terms(&decoder), 1);

        // Operation 5 drops every reference and restarts the POC: the next
        // picture has POC 2 yet follows in output order.
        let marking = RefPicMarking {
            adaptive_ref_pic_marking_mode_flag: true,
            inner: vec![mmco(5)],
            ..Default::default()
        };
        let header = stream.header(SliceType::P, 4, 8).dec_ref_pic_marking(marking).build();
        decoder.decode(4, &stream.skipped(2, &header)).unwrap();
        assert_eq!(decoder.dpb.num_ref_frames(), 1);
        assert_eq!(long_terms(&decoder), 0);

        let header = stream.header(SliceType::P, 1, 2).build();
        decoder.decode(5, &stream.skipped(2, &header)).unwrap();
        decoder.flush();

        let (pocs, timestamps) = pocs_and_timestamps(&collect_frames(&mut decoder));
        assert_eq!(pocs, vec![0, 2, 4, 6, 8, 2]);
        assert_eq!(timestamps, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn truncated_sps_is_malformed() {
        let stream = Stream::new(1, 1, 1);
        let mut sps = Vec::new();
        Synthesizer::<'_, Sps, _>::synthesize(3, &stream.sps, &mut sps, true).unwrap();

        let mut decoder = H264Decoder::default();
        let err = decoder.decode(0, &sps[..7]).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedBitstream(_)));

        decoder.flush();
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn output_is_deterministic() {
        let stream = Stream::new(2, 2, 1);
        let mbs: Vec<_> = (0..4)
            .map(|i| pcm(move |x, y| (x * 9 + y * 5 + i * 40) as u8, 100 + i as u8, 90))
            .collect();
        let bitstream = stream.idr(&mbs);

        let header = stream.header(SliceType::P, 1, 2).build();
        let inter = MacroblockSynthesis::Inter16x16 {
            l0: Some(MotionSynthesis {
                ref_idx: 0,
                mvd: [-5, 3],
            }),
            l1: None,
        };
        let p_mbs = [
            inter.clone(),
            MacroblockSynthesis::Skip,
            MacroblockSynthesis::Skip,
            inter,
        ];
        let mut p = Vec::new();
        stream.slice(&mut p, 2, false, &header, SliceData::Cavlc(&p_mbs));

        let digest = || {
            let mut decoder = H264Decoder::default();
            decoder.decode(0, &bitstream).unwrap();
            decoder.decode(1, &p).unwrap();
            decoder.flush();

            let frames = collect_frames(&mut decoder);
            assert_eq!(frames.len(), 2);
            let mut context = md5::Context::new();
            for frame in frames {
                context.consume(frame.picture.to_vec());
            }
            context.compute()
        };

        assert_eq!(digest(), digest());
    }

    fn p_without_reference(stream: &Stream) -> Vec<u8> {
        let mut buf = stream.parameter_sets();
        let header = stream.header(SliceType::P, 0, 0).build();
        stream.slice(&mut buf, 2, false, &header, SliceData::Cavlc(&[MacroblockSynthesis::Skip]));
        buf
    }

    #[test]
    fn corrupt_slice_is_concealed() {
        let stream = Stream::new(1, 1, 1);
        let mut decoder = H264Decoder::default();

        decoder.decode(0, &p_without_reference(&stream)).unwrap();
        decoder.flush();
        let frame = decoder.next_frame().unwrap();
        assert!(frame.picture.to_vec().iter().all(|s| *s == 128));
    }

    #[test]
    fn corrupt_slice_aborts_the_picture() {
        let stream = Stream::new(1, 1, 1);
        let mut decoder = H264Decoder::new(DecoderConfig {
            corrupt_slice_policy: CorruptSlicePolicy::Abort,
            ..Default::default()
        });

        let err = decoder.decode(0, &p_without_reference(&stream)).unwrap_err();
        assert!(matches!(err, DecodeError::CorruptSlice { mb_addr: 0, .. }));

        decoder.flush();
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn interlaced_stream_is_unsupported() {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::Main)
            .resolution(16, 32)
            .frame_mbs_only_flag(false)
            .build();
        let stream = Stream::with_sps(sps);

        let mut decoder = H264Decoder::default();
        let err = decoder.decode(0, &stream.parameter_sets()).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedStream(_)));
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn high_bit_depth_is_unsupported() {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::High10)
            .resolution(16, 16)
            .bit_depth_luma_minus8(2)
            .build();
        let stream = Stream::with_sps(sps);

        let mut decoder = H264Decoder::default();
        let err = decoder.decode(0, &stream.parameter_sets()).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedStream(_)));
    }

    #[test]
    fn dpb_override_is_applied() {
        let stream = Stream::new(1, 1, 1);
        let mut decoder = H264Decoder::new(DecoderConfig {
            max_dpb_frames_override: Some(1),
            ..Default::default()
        });

        decoder.decode(0, &stream.idr(&[pcm(|_, _| 1, 2, 3)])).unwrap();
        assert_eq!(decoder.max_dpb_frames(), 1);
    }

    #[test]
    fn reset_waits_for_an_idr() {
        let stream = Stream::new(1, 1, 1);
        let mut decoder = H264Decoder::default();
        decoder.decode(0, &stream.idr(&[pcm(|_, _| 1, 2, 3)])).unwrap();
        assert_eq!(decoder.dpb_len(), 1);
        decoder.reset();
        assert_eq!(decoder.dpb_len(), 0);
        assert_eq!(decoder.num_ready_frames(), 0);

        let header = stream.header(SliceType::P, 1, 2).build();
        let mut buf = Vec::new();
        stream.slice(&mut buf, 2, false, &header, SliceData::Cavlc(&[MacroblockSynthesis::Skip]));
        decoder.decode(1, &buf).unwrap();
        assert!(decoder.next_frame().is_none());

        decoder.decode(2, &stream.idr(&[pcm(|_, _| 9, 9, 9)])).unwrap();
        decoder.flush();
        let frames = collect_frames(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp, 2);
    }
}
