// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::rc::Rc;

use anyhow::Context;
use log::debug;
use thiserror::Error;

use crate::codec::h264::parser::MaxLongTermFrameIdx;
use crate::codec::h264::parser::RefPicMarkingInner;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;

pub type DpbPicRefList<T> = Vec<DpbEntry<T>>;

/// The initial reference picture lists of a picture (8.2.4.2). Slices start
/// from these and apply their own modifications.
pub struct ReferencePicLists<T> {
    /// Initial RefPicList0 of P slices.
    pub ref_pic_list_p0: DpbPicRefList<T>,
    /// Initial RefPicList0 of B slices.
    pub ref_pic_list_b0: DpbPicRefList<T>,
    /// Initial RefPicList1 of B slices.
    pub ref_pic_list_b1: DpbPicRefList<T>,
}

impl<T> Default for ReferencePicLists<T> {
    fn default() -> Self {
        Self {
            ref_pic_list_p0: Default::default(),
            ref_pic_list_b0: Default::default(),
            ref_pic_list_b1: Default::default(),
        }
    }
}

// A DPB entry: the bookkeeping of a frame plus its decoded samples. `handle`
// is `None` for the frames inferred by a gap in frame_num.
pub struct DpbEntry<T> {
    pub pic: Rc<RefCell<PictureData>>,
    pub handle: Option<T>,
}

impl<T: Clone> Clone for DpbEntry<T> {
    fn clone(&self) -> Self {
        Self {
            pic: Rc::clone(&self.pic),
            handle: self.handle.clone(),
        }
    }
}

pub struct Dpb<T> {
    /// List of `PictureData` and handles to decoded frames.
    entries: Vec<DpbEntry<T>>,
    /// The maximum number of frames that can be stored.
    max_num_pics: usize,
    /// Upper bound of the frames that may precede any frame in decoding order
    /// and follow it in output order.
    max_num_reorder_frames: usize,
}

#[derive(Debug, Error)]
pub enum StorePictureError {
    #[error("DPB is full")]
    DpbIsFull,
}

#[derive(Debug, Error)]
pub enum MmcoError {
    #[error("could not find a ShortTerm picture with pic_num {0}")]
    NoShortTermPic(i32),
    #[error("could not find a LongTerm picture with long_term_pic_num {0}")]
    NoLongTermPic(u32),
    #[error("picture cannot be marked as nonexisting for MMCO=3")]
    ExpectedExisting,
}

impl<T: Clone> Dpb<T> {
    /// Returns an iterator over the underlying H264 pictures stored in the
    /// DPB.
    fn pictures(&self) -> impl Iterator<Item = Ref<'_, PictureData>> {
        self.entries.iter().map(|h| h.pic.borrow())
    }

    /// Returns a mutable iterator over the underlying H264 pictures stored in
    /// the DPB.
    fn pictures_mut(&mut self) -> impl Iterator<Item = RefMut<'_, PictureData>> {
        self.entries.iter().map(|h| h.pic.borrow_mut())
    }

    /// Returns the length of the DPB.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a reference to the whole DPB entries.
    pub fn entries(&self) -> &Vec<DpbEntry<T>> {
        &self.entries
    }

    /// Set the DPB's limits in terms of maximum number or pictures.
    pub fn set_limits(&mut self, max_num_pics: usize, max_num_reorder_frames: usize) {
        self.max_num_pics = max_num_pics;
        self.max_num_reorder_frames = max_num_reorder_frames;
    }

    /// Get a reference to the dpb's max num pics.
    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    pub fn max_num_reorder_frames(&self) -> usize {
        self.max_num_reorder_frames
    }

    /// Returns the number of reference frames, non-existing ones included.
    pub fn num_ref_frames(&self) -> usize {
        self.pictures().filter(|p| p.is_ref()).count()
    }

    /// Number of frames waiting to be output.
    pub fn num_needed_for_output(&self) -> usize {
        self.pictures().filter(|p| p.needed_for_output).count()
    }

    /// Find the short term reference picture with the lowest `frame_num_wrap`
    /// value.
    pub fn find_short_term_lowest_frame_num_wrap(&self) -> Option<&DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|h| matches!(h.pic.borrow().reference(), Reference::ShortTerm))
            .min_by_key(|h| h.pic.borrow().frame_num_wrap)
    }

    /// Mark all pictures in the DPB as unused for reference.
    pub fn mark_all_as_unused_for_ref(&mut self) {
        for mut picture in self.pictures_mut() {
            picture.set_reference(Reference::None);
        }
    }

    /// Remove unused pictures from the DPB. A picture is not going to be used
    /// anymore if it's a) not a reference and b) not needed for output
    pub fn remove_unused(&mut self) {
        self.entries.retain(|handle| {
            let pic = handle.pic.borrow();
            let discard = !pic.is_ref() && !pic.needed_for_output;

            if discard {
                debug!(
                    "Removing unused picture frame_num {} POC {}",
                    pic.frame_num, pic.pic_order_cnt
                );
            }

            !discard
        });
    }

    /// Find a short term reference picture with the given `pic_num` value.
    fn find_short_term_with_pic_num_pos(&self, pic_num: i32) -> Option<usize> {
        let position = self
            .pictures()
            .position(|p| matches!(p.reference(), Reference::ShortTerm) && p.pic_num == pic_num);

        debug!(
            "find_short_term_with_pic_num: {}, found position {:?}",
            pic_num, position
        );

        position
    }

    /// Find a short term reference picture with the given `pic_num` value.
    pub fn find_short_term_with_pic_num(&self, pic_num: i32) -> Option<&DpbEntry<T>> {
        let position = self.find_short_term_with_pic_num_pos(pic_num)?;
        Some(&self.entries[position])
    }

    /// Find a long term reference picture with the given `long_term_pic_num`
    /// value.
    fn find_long_term_with_long_term_pic_num_pos(&self, long_term_pic_num: u32) -> Option<usize> {
        let position = self.pictures().position(|p| {
            matches!(p.reference(), Reference::LongTerm) && p.long_term_pic_num == long_term_pic_num
        });

        debug!(
            "find_long_term_with_long_term_pic_num: {}, found position {:?}",
            long_term_pic_num, position
        );

        position
    }

    /// Find a long term reference picture with the given `long_term_pic_num`
    /// value.
    pub fn find_long_term_with_long_term_pic_num(
        &self,
        long_term_pic_num: u32,
    ) -> Option<&DpbEntry<T>> {
        let position = self.find_long_term_with_long_term_pic_num_pos(long_term_pic_num)?;
        Some(&self.entries[position])
    }

    /// Store a picture and its handle in the DPB.
    pub fn store_picture(
        &mut self,
        picture: Rc<RefCell<PictureData>>,
        handle: Option<T>,
    ) -> Result<(), StorePictureError> {
        if self.entries.len() >= self.max_num_pics {
            return Err(StorePictureError::DpbIsFull);
        }

        {
            let mut pic = picture.borrow_mut();

            // C.4.2. Decoding of gaps in frame_num and storage of "non-existing"
            // pictures
            pic.needed_for_output = pic.needed_for_output && !pic.nonexisting;

            debug!(
                "Stored picture POC {}, frame_num {}, the DPB length is {}",
                pic.pic_order_cnt,
                pic.frame_num,
                self.entries.len() + 1
            );
        }

        self.entries.push(DpbEntry {
            pic: picture,
            handle,
        });

        Ok(())
    }

    /// Whether the DPB has an empty slot for a new picture.
    pub fn has_empty_frame_buffer(&self) -> bool {
        self.entries.len() < self.max_num_pics
    }

    /// Whether the DPB needs bumping before `to_insert` can be handled, as
    /// described by clauses 1, 4, 5 and 6 of C.4.5.3.
    pub fn needs_bumping(&self, to_insert: &PictureData) -> bool {
        // Clauses 2 and 3 (IDR and mmco 5) drain the DPB and are handled by
        // the decoder.
        if self.has_empty_frame_buffer() {
            return false;
        }

        // No empty frame buffer and one is needed for a "non-existing" frame.
        if to_insert.nonexisting {
            return true;
        }

        // No empty frame buffer and one is needed for a non-IDR reference.
        let non_idr_ref = to_insert.is_ref() && matches!(to_insert.is_idr, IsIdr::No);
        if non_idr_ref {
            return true;
        }

        // No empty frame buffer and the DPB holds frames waiting for output
        // that precede the current non-reference frame.
        let lowest_poc = match self.find_lowest_poc_for_bumping() {
            Some(handle) => handle.pic.borrow().pic_order_cnt,
            None => return false,
        };

        to_insert.pic_order_cnt > lowest_poc
    }

    /// Find the lowest POC in the DPB that can be bumped.
    fn find_lowest_poc_for_bumping(&self) -> Option<&DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|handle| handle.pic.borrow().needed_for_output)
            .min_by_key(|handle| handle.pic.borrow().pic_order_cnt)
    }

    /// Bump the dpb, returning a picture as per the bumping process described in C.4.5.3.
    fn bump(&mut self) -> Option<Option<T>> {
        let dpb_entry = self.find_lowest_poc_for_bumping()?.clone();
        let mut pic = dpb_entry.pic.borrow_mut();

        debug!(
            "Bumping picture POC {} frame_num {} from the dpb",
            pic.pic_order_cnt, pic.frame_num
        );

        pic.needed_for_output = false;

        drop(pic);
        Some(dpb_entry.handle)
    }

    /// Drains the DPB by continuously invoking the bumping process.
    pub fn drain(&mut self) -> Vec<Option<T>> {
        debug!("Draining the DPB.");

        let mut pics = vec![];

        while let Some(pic) = self.bump() {
            pics.push(pic);
        }

        self.clear();

        pics
    }

    /// Clears the DPB, dropping all the pictures.
    pub fn clear(&mut self) {
        debug!("Clearing the DPB");

        self.entries.clear();
    }

    /// Returns an iterator of short term refs.
    pub fn short_term_refs_iter(&self) -> impl Iterator<Item = &DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|&handle| matches!(handle.pic.borrow().reference(), Reference::ShortTerm))
    }

    /// Returns an iterator of long term refs.
    pub fn long_term_refs_iter(&self) -> impl Iterator<Item = &DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|&handle| matches!(handle.pic.borrow().reference(), Reference::LongTerm))
    }

    /// Derives FrameNumWrap, PicNum and LongTermPicNum of the references
    /// (8.2.4.1) for a frame with the given `frame_num`.
    pub fn update_pic_nums(&mut self, frame_num: i32, max_frame_num: i32) {
        for mut pic in self.pictures_mut() {
            match *pic.reference() {
                Reference::None => (),
                Reference::LongTerm => {
                    pic.long_term_pic_num = pic.long_term_frame_idx;
                }
                Reference::ShortTerm => {
                    pic.frame_num_wrap = if pic.frame_num > frame_num {
                        pic.frame_num - max_frame_num
                    } else {
                        pic.frame_num
                    };

                    pic.pic_num = pic.frame_num_wrap;
                }
            }
        }
    }

    /// Bumps the DPB if needed. DPB bumping is described on C.4.5.3.
    pub fn bump_as_needed(&mut self, current_pic: &PictureData) -> Vec<Option<T>> {
        let mut pics = vec![];
        while self.needs_bumping(current_pic) {
            match self.bump() {
                Some(pic) => pics.push(pic),
                None => return pics,
            }
            self.remove_unused();
        }

        pics
    }

    /// Outputs frames while more than `max_num_reorder_frames` are waiting
    /// for output: none of them can be preceded in output order by a frame
    /// that is still to be decoded.
    pub fn bump_reorder_overflow(&mut self) -> Vec<Option<T>> {
        let mut pics = vec![];
        while self.num_needed_for_output() > self.max_num_reorder_frames {
            match self.bump() {
                Some(pic) => pics.push(pic),
                None => break,
            }
        }

        self.remove_unused();
        pics
    }

    /// Sliding window reference marking (8.2.5.3).
    pub fn sliding_window_marking(&mut self, max_num_ref_frames: u8) -> anyhow::Result<()> {
        let mut num_ref_pics = self.num_ref_frames();
        let max_num_ref_frames = usize::from(std::cmp::max(1, max_num_ref_frames));

        while num_ref_pics >= max_num_ref_frames {
            let to_unmark = self
                .find_short_term_lowest_frame_num_wrap()
                .context("Could not find a ShortTerm picture to unmark in the DPB")?;

            to_unmark.pic.borrow_mut().set_reference(Reference::None);
            num_ref_pics -= 1;
        }

        Ok(())
    }

    /// Marks the short-term picture `CurrPicNum - (difference_of_pic_nums_minus1 + 1)` as unused.
    pub fn mmco_op_1(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = pic.pic_num - (marking.difference_of_pic_nums_minus1 as i32 + 1);

        debug!("MMCO op 1 for pic_num_x {}", pic_num_x);
        log::trace!("Dpb state before MMCO=1: {:#?}", self);

        let to_mark = self
            .find_short_term_with_pic_num(pic_num_x)
            .ok_or(MmcoError::NoShortTermPic(pic_num_x))?;

        to_mark.pic.borrow_mut().set_reference(Reference::None);

        Ok(())
    }

    /// Marks the long-term picture `long_term_pic_num` as unused.
    pub fn mmco_op_2(&mut self, marking: &RefPicMarkingInner) -> Result<(), MmcoError> {
        debug!(
            "MMCO op 2 for long_term_pic_num {}",
            marking.long_term_pic_num
        );
        log::trace!("Dpb state before MMCO=2: {:#?}", self);

        let to_mark = self
            .find_long_term_with_long_term_pic_num(marking.long_term_pic_num)
            .ok_or(MmcoError::NoLongTermPic(marking.long_term_pic_num))?;

        to_mark.pic.borrow_mut().set_reference(Reference::None);

        Ok(())
    }

    /// Turns a short-term picture into a long-term one with index
    /// `long_term_frame_idx`.
    pub fn mmco_op_3(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = pic.pic_num - (marking.difference_of_pic_nums_minus1 as i32 + 1);

        debug!("MMCO op 3 for pic_num_x {}", pic_num_x);
        log::trace!("Dpb state before MMCO=3: {:#?}", self);

        let to_mark_as_long_pos = self
            .find_short_term_with_pic_num_pos(pic_num_x)
            .ok_or(MmcoError::NoShortTermPic(pic_num_x))?;

        if self.entries[to_mark_as_long_pos].pic.borrow().nonexisting {
            return Err(MmcoError::ExpectedExisting);
        }

        let long_term_frame_idx = marking.long_term_frame_idx;

        // A frame already holding LongTermFrameIdx loses it.
        for mut picture in self.pictures_mut() {
            if matches!(picture.reference(), Reference::LongTerm)
                && picture.long_term_frame_idx == long_term_frame_idx
            {
                picture.set_reference(Reference::None);
                break;
            }
        }

        let mut to_mark_as_long = self.entries[to_mark_as_long_pos].pic.borrow_mut();
        to_mark_as_long.set_reference(Reference::LongTerm);
        to_mark_as_long.long_term_frame_idx = long_term_frame_idx;
        to_mark_as_long.long_term_pic_num = long_term_frame_idx;

        Ok(())
    }

    /// Returns the new `max_long_term_frame_idx`.
    pub fn mmco_op_4(&mut self, marking: &RefPicMarkingInner) -> MaxLongTermFrameIdx {
        debug!(
            "MMCO op 4, max_long_term_frame_idx: {:?}",
            marking.max_long_term_frame_idx
        );
        log::trace!("Dpb state before MMCO=4: {:#?}", self);

        for mut dpb_pic in self
            .pictures_mut()
            .filter(|pic| matches!(pic.reference(), Reference::LongTerm))
            .filter(|pic| marking.max_long_term_frame_idx < pic.long_term_frame_idx)
        {
            dpb_pic.set_reference(Reference::None);
        }

        marking.max_long_term_frame_idx
    }

    /// Returns the new `max_long_term_frame_idx`.
    pub fn mmco_op_5(&mut self, pic: &mut PictureData) -> MaxLongTermFrameIdx {
        debug!("MMCO op 5, marking all pictures in the DPB as unused for reference");
        log::trace!("Dpb state before MMCO=5: {:#?}", self);

        self.mark_all_as_unused_for_ref();

        pic.has_mmco_5 = true;

        // The picture is inferred to have had frame_num equal to 0 for all
        // subsequent use in the decoding process.
        pic.frame_num = 0;

        // tempPicOrderCnt = PicOrderCnt(CurrPic), subtracted from both field
        // order counts.
        pic.top_field_order_cnt -= pic.pic_order_cnt;
        pic.bottom_field_order_cnt -= pic.pic_order_cnt;
        pic.pic_order_cnt = std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);

        MaxLongTermFrameIdx::NoLongTermFrameIndices
    }

    /// Marks the current picture as long-term with index
    /// `long_term_frame_idx`.
    pub fn mmco_op_6(&mut self, pic: &mut PictureData, marking: &RefPicMarkingInner) {
        let long_term_frame_idx = marking.long_term_frame_idx;

        debug!("MMCO op 6, long_term_frame_idx: {}", long_term_frame_idx);
        log::trace!("Dpb state before MMCO=6: {:#?}", self);

        for mut dpb_pic in self.pictures_mut() {
            if matches!(dpb_pic.reference(), Reference::LongTerm)
                && dpb_pic.long_term_frame_idx == long_term_frame_idx
            {
                dpb_pic.set_reference(Reference::None);
                break;
            }
        }

        pic.set_reference(Reference::LongTerm);
        pic.long_term_frame_idx = long_term_frame_idx;
        pic.long_term_pic_num = long_term_frame_idx;
    }

    fn debug_ref_list(ref_pic_list: &[DpbEntry<T>], ref_pic_list_name: &str) {
        debug!(
            "{}: (ShortTerm|LongTerm, (PicNum|LongTermPicNum), POC) {:?}",
            ref_pic_list_name,
            ref_pic_list
                .iter()
                .map(|h| {
                    let p = h.pic.borrow();
                    match p.reference() {
                        Reference::LongTerm => {
                            ("LongTerm", p.long_term_pic_num as i32, p.pic_order_cnt)
                        }
                        _ => ("ShortTerm", p.pic_num, p.pic_order_cnt),
                    }
                })
                .collect::<Vec<_>>()
        );
    }

    fn sort_pic_num_descending(pics: &mut [DpbEntry<T>]) {
        pics.sort_by_key(|h| std::cmp::Reverse(h.pic.borrow().pic_num));
    }

    fn sort_long_term_pic_num_ascending(pics: &mut [DpbEntry<T>]) {
        pics.sort_by_key(|h| h.pic.borrow().long_term_pic_num);
    }

    fn sort_poc_descending(pics: &mut [DpbEntry<T>]) {
        pics.sort_by_key(|h| std::cmp::Reverse(h.pic.borrow().pic_order_cnt));
    }

    fn sort_poc_ascending(pics: &mut [DpbEntry<T>]) {
        pics.sort_by_key(|h| h.pic.borrow().pic_order_cnt);
    }

    // When the reference picture list RefPicList1 has more than one entry
    // and RefPicList1 is identical to the reference picture list
    // RefPicList0, the first two entries RefPicList1[0] and RefPicList1[1]
    // are switched.
    fn swap_b1_if_needed(b0: &DpbPicRefList<T>, b1: &mut DpbPicRefList<T>) {
        if b1.len() > 1
            && b0.len() == b1.len()
            && b0.iter().zip(b1.iter()).all(|(x0, x1)| Rc::ptr_eq(&x0.pic, &x1.pic))
        {
            b1.swap(0, 1);
        }
    }

    /// 8.2.4.2.1 Initialization process for the reference picture list for P
    /// and SP slices in frames
    fn build_ref_pic_list_p(&self) -> DpbPicRefList<T> {
        let mut ref_pic_list_p0: Vec<_> = self.short_term_refs_iter().cloned().collect();

        Self::sort_pic_num_descending(&mut ref_pic_list_p0);

        let num_short_term_refs = ref_pic_list_p0.len();

        ref_pic_list_p0.extend(self.long_term_refs_iter().cloned());
        Self::sort_long_term_pic_num_ascending(&mut ref_pic_list_p0[num_short_term_refs..]);

        Self::debug_ref_list(&ref_pic_list_p0, "ref_pic_list_p0");

        ref_pic_list_p0
    }

    // 8.2.4.2.3 Initialization process for reference picture lists for B slices
    // in frames
    fn build_ref_pic_list_b(&self, cur_pic: &PictureData) -> (DpbPicRefList<T>, DpbPicRefList<T>) {
        let mut short_term_refs: Vec<_> = self.short_term_refs_iter().cloned().collect();

        // When pic_order_cnt_type is equal to 0, reference pictures that are
        // marked as "non-existing" as specified in clause 8.2.5.2 are not
        // included in either RefPicList0 or RefPicList1.
        if cur_pic.pic_order_cnt_type == 0 {
            short_term_refs.retain(|h| !h.pic.borrow().nonexisting);
        }

        let (mut before, mut after): (Vec<_>, Vec<_>) = short_term_refs
            .into_iter()
            .partition(|h| h.pic.borrow().pic_order_cnt < cur_pic.pic_order_cnt);

        // Short term pictures preceding the current one by descending POC,
        // then the following ones by ascending POC.
        Self::sort_poc_descending(&mut before);
        Self::sort_poc_ascending(&mut after);

        let mut long_term_refs: Vec<_> = self
            .long_term_refs_iter()
            .filter(|h| !h.pic.borrow().nonexisting)
            .cloned()
            .collect();
        Self::sort_long_term_pic_num_ascending(&mut long_term_refs);

        let mut ref_pic_list_b0 = before.clone();
        ref_pic_list_b0.extend(after.iter().cloned());
        ref_pic_list_b0.extend(long_term_refs.iter().cloned());

        let mut ref_pic_list_b1 = after;
        ref_pic_list_b1.append(&mut before);
        ref_pic_list_b1.extend(long_term_refs);

        Self::swap_b1_if_needed(&ref_pic_list_b0, &mut ref_pic_list_b1);

        Self::debug_ref_list(&ref_pic_list_b0, "ref_pic_list_b0");
        Self::debug_ref_list(&ref_pic_list_b1, "ref_pic_list_b1");

        (ref_pic_list_b0, ref_pic_list_b1)
    }

    /// Returns the initial lists of reference pictures for `pic`.
    pub fn build_ref_pic_lists(&self, pic: &PictureData) -> ReferencePicLists<T> {
        let num_refs = self
            .pictures()
            .filter(|p| p.is_ref() && !p.nonexisting)
            .count();

        // 8.2.4.2.1 ~ 8.2.4.2.4: When this process is invoked, there shall be
        // at least one reference frame that is currently marked as "used for
        // reference" and is not marked as "non-existing".
        if num_refs == 0 {
            return Default::default();
        }

        let (ref_pic_list_b0, ref_pic_list_b1) = self.build_ref_pic_list_b(pic);

        ReferencePicLists {
            ref_pic_list_p0: self.build_ref_pic_list_p(),
            ref_pic_list_b0,
            ref_pic_list_b1,
        }
    }
}

impl<T> Default for Dpb<T> {
    fn default() -> Self {
        // See https://github.com/rust-lang/rust/issues/26925 on why this can't
        // be derived.
        Self {
            entries: Default::default(),
            max_num_pics: Default::default(),
            max_num_reorder_frames: Default::default(),
        }
    }
}

impl<T> std::fmt::Debug for Dpb<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pics = self
            .entries
            .iter()
            .map(|h| &h.pic)
            .enumerate()
            .collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pictures", &pics)
            .field("max_num_pics", &self.max_num_pics)
            .field("max_num_reorder_frames", &self.max_num_reorder_frames)
            .finish()
    }
}
