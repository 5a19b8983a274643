// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame grabbing: sequential and random access to the decoded pictures of a
//! video track.
//!
//! [`FrameGrab`] owns an [`H264Decoder`] and pulls coded samples from a
//! [`DemuxerTrack`] until the decoder emits a picture. Pictures are returned
//! in presentation order, each with its presentation time and duration.

use std::collections::BTreeMap;
use std::io;
use std::io::Cursor;
use std::rc::Rc;

use log::debug;
use log::warn;
use thiserror::Error;

use crate::codec::h264::avcc::AvcDecoderConfigurationRecord;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::parser::Nalu;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;
use crate::decoder::h264::H264Decoder;
use crate::decoder::DecodeError;
use crate::decoder::DecoderConfig;
use crate::Picture;

/// Timestamps closer than this are considered equal.
const TIME_EPSILON: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    H264,
    Unknown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackMeta {
    /// Duration of the track in seconds.
    pub total_duration: f64,
    pub total_frames: usize,
    pub codec: Codec,
    /// Present for tracks whose samples carry length-prefixed NAL units.
    pub decoder_config: Option<AvcDecoderConfigurationRecord>,
}

/// A coded sample: one access unit.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub data: Vec<u8>,
    /// Presentation time in seconds.
    pub pts: f64,
    /// Duration in seconds.
    pub duration: f64,
    /// Position of the sample in the track, in decoding order.
    pub index: usize,
    /// Whether decoding can start at this sample.
    pub is_sync: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SeekTarget {
    Frame(usize),
    Second(f64),
}

/// A video track of a container, as provided by a demuxer.
pub trait DemuxerTrack {
    fn meta(&self) -> &TrackMeta;

    /// Returns the next sample in decoding order, or `None` at the end of the
    /// track.
    fn next_sample(&mut self) -> io::Result<Option<Sample>>;

    /// Moves to the last random access sample at or before `target` and
    /// returns it. The following calls to [`next_sample`] return the samples
    /// after it. Returns `None` if `target` is outside the track.
    ///
    /// [`next_sample`]: DemuxerTrack::next_sample
    fn seek(&mut self, target: SeekTarget) -> io::Result<Option<Sample>>;
}

/// A track held in memory, built from an Annex B elementary stream or from
/// samples extracted by a demuxer.
#[derive(Clone, Debug)]
pub struct ElementaryStreamTrack {
    meta: TrackMeta,
    samples: Vec<Sample>,
    pos: usize,
}

impl ElementaryStreamTrack {
    /// Splits an Annex B stream into access units played at `fps` frames per
    /// second. Access units holding an IDR picture are random access points.
    ///
    /// Elementary streams carry no timing, so each access unit is given the
    /// presentation slot its picture order count implies.
    pub fn from_annexb(stream: &[u8], fps: f64) -> anyhow::Result<Self> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(anyhow::anyhow!("invalid frame rate {}", fps));
        }

        let duration = 1.0 / fps;
        let units = split_access_units(stream);
        let slots = presentation_slots(&units);
        let samples = units
            .into_iter()
            .zip(slots)
            .enumerate()
            .map(|(index, ((data, is_sync), slot))| Sample {
                data,
                pts: slot as f64 * duration,
                duration,
                index,
                is_sync,
            })
            .collect();

        Ok(Self::from_samples(samples, Codec::H264, None))
    }

    /// Wraps samples already split by a demuxer.
    pub fn from_samples(
        samples: Vec<Sample>,
        codec: Codec,
        decoder_config: Option<AvcDecoderConfigurationRecord>,
    ) -> Self {
        let total_duration = samples
            .iter()
            .map(|s| s.pts + s.duration)
            .fold(0.0, f64::max);

        Self {
            meta: TrackMeta {
                total_duration,
                total_frames: samples.len(),
                codec,
                decoder_config,
            },
            samples,
            pos: 0,
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl DemuxerTrack for ElementaryStreamTrack {
    fn meta(&self) -> &TrackMeta {
        &self.meta
    }

    fn next_sample(&mut self) -> io::Result<Option<Sample>> {
        let sample = self.samples.get(self.pos).cloned();
        if sample.is_some() {
            self.pos += 1;
        }
        Ok(sample)
    }

    fn seek(&mut self, target: SeekTarget) -> io::Result<Option<Sample>> {
        let index = match target {
            SeekTarget::Frame(index) => Some(index).filter(|i| *i < self.samples.len()),
            SeekTarget::Second(second) => self
                .samples
                .iter()
                .rposition(|s| s.pts <= second + TIME_EPSILON),
        };

        let Some(index) = index else {
            return Ok(None);
        };

        let sync = self.samples[..=index]
            .iter()
            .rposition(|s| s.is_sync)
            .unwrap_or(0);
        self.pos = sync + 1;

        Ok(Some(self.samples[sync].clone()))
    }
}

/// Whether `nalu` ends the access unit of the preceding VCL NAL units
/// (7.4.1.2.3).
fn starts_access_unit(nalu: &Nalu) -> bool {
    match nalu.header.type_ {
        NaluType::AuDelimiter
        | NaluType::Sps
        | NaluType::Pps
        | NaluType::Sei
        | NaluType::PrefixUnit
        | NaluType::SubsetSps
        | NaluType::DepthSps => true,
        NaluType::Slice | NaluType::SliceIdr | NaluType::SliceDpa => {
            let data = nalu.as_ref();
            let mut r = NaluReader::new(&data[1..]);
            matches!(r.read_ue::<u32>(), Ok(0))
        }
        _ => false,
    }
}

/// Groups the NAL units of an Annex B stream into access units, keeping the
/// start codes. Returns each access unit and whether it holds an IDR picture.
fn split_access_units(stream: &[u8]) -> Vec<(Vec<u8>, bool)> {
    const START_CODE: [u8; 4] = [0, 0, 0, 1];

    let mut units = Vec::new();
    let mut cursor = Cursor::new(stream);
    let mut current = Vec::new();
    let mut has_vcl = false;
    let mut is_idr = false;

    loop {
        let pos = cursor.position();
        let nalu = match Nalu::next(&mut cursor) {
            Ok(nalu) => nalu,
            // Unparsable NAL header, resume at the next start code.
            Err(_) if cursor.position() != pos => continue,
            Err(_) => break,
        };

        if has_vcl && starts_access_unit(&nalu) {
            units.push((std::mem::take(&mut current), is_idr));
            has_vcl = false;
            is_idr = false;
        }

        match nalu.header.type_ {
            NaluType::Slice | NaluType::SliceDpa => has_vcl = true,
            NaluType::SliceIdr => {
                has_vcl = true;
                is_idr = true;
            }
            _ => (),
        }

        current.extend_from_slice(&START_CODE);
        current.extend_from_slice(nalu.as_ref());
    }

    if has_vcl {
        units.push((current, is_idr));
    }

    units
}

/// Picture order count of each access unit, from the header of its first
/// slice (8.2.1). Only the ordering matters here, so the state a decoder
/// keeps for reference marking is left out.
#[derive(Debug, Default)]
struct PocOrder {
    prev_ref_msb: i32,
    prev_ref_lsb: i32,
    prev_frame_num: i32,
    prev_frame_num_offset: i32,
}

impl PocOrder {
    /// Returns the POC of the picture `slice` belongs to, and whether the
    /// picture starts a new output period: pictures before an IDR picture or
    /// a memory_management_control_operation 5 are all presented before it.
    fn next(&mut self, sps: &Sps, slice: &Slice) -> (bool, i32) {
        let hdr = &slice.header;
        let idr = slice.nalu.header.idr_pic_flag;
        let reference = slice.nalu.header.ref_idc != 0;
        let frame_num = i32::from(hdr.frame_num);
        let mmco_5 = hdr
            .dec_ref_pic_marking
            .inner
            .iter()
            .any(|op| op.memory_management_control_operation == 5);

        if idr {
            *self = Default::default();
        }

        let frame_num_offset = if self.prev_frame_num > frame_num {
            self.prev_frame_num_offset + sps.max_frame_num() as i32
        } else {
            self.prev_frame_num_offset
        };

        let poc = match sps.pic_order_cnt_type {
            0 => {
                let lsb = i32::from(hdr.pic_order_cnt_lsb);
                let max_lsb = sps.max_pic_order_cnt_lsb();
                let msb = if lsb < self.prev_ref_lsb && self.prev_ref_lsb - lsb >= max_lsb / 2 {
                    self.prev_ref_msb + max_lsb
                } else if lsb > self.prev_ref_lsb && lsb - self.prev_ref_lsb > max_lsb / 2 {
                    self.prev_ref_msb - max_lsb
                } else {
                    self.prev_ref_msb
                };

                if reference {
                    self.prev_ref_msb = msb;
                    self.prev_ref_lsb = lsb;
                }

                let top = msb + lsb;
                if hdr.field_pic_flag {
                    top
                } else {
                    top.min(top + hdr.delta_pic_order_cnt_bottom)
                }
            }
            1 => {
                let cycle_len = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);
                let mut abs_frame_num = if cycle_len != 0 {
                    frame_num_offset + frame_num
                } else {
                    0
                };
                if !reference && abs_frame_num > 0 {
                    abs_frame_num -= 1;
                }

                let mut expected = 0;
                if abs_frame_num > 0 {
                    let in_cycle = ((abs_frame_num - 1) % cycle_len) as usize;
                    expected = (abs_frame_num - 1) / cycle_len
                        * sps.expected_delta_per_pic_order_cnt_cycle
                        + sps.offset_for_ref_frame[..=in_cycle].iter().sum::<i32>();
                }
                if !reference {
                    expected += sps.offset_for_non_ref_pic;
                }

                let top = expected + hdr.delta_pic_order_cnt[0];
                let bottom = expected
                    + sps.offset_for_top_to_bottom_field
                    + hdr.delta_pic_order_cnt[usize::from(!hdr.field_pic_flag)];
                match (hdr.field_pic_flag, hdr.bottom_field_flag) {
                    (true, false) => top,
                    (true, true) => bottom,
                    (false, _) => top.min(bottom),
                }
            }
            _ if idr => 0,
            _ => 2 * (frame_num_offset + frame_num) - i32::from(!reference),
        };

        self.prev_frame_num = frame_num;
        self.prev_frame_num_offset = frame_num_offset;

        if mmco_5 {
            // The picture counts as POC 0 and the following ones restart
            // from it.
            *self = Default::default();
            return (true, 0);
        }

        (idr, poc)
    }
}

/// Returns the presentation slot of each access unit: its rank when the
/// access units are sorted by output period, then picture order count.
fn presentation_slots(units: &[(Vec<u8>, bool)]) -> Vec<usize> {
    let mut parser = Parser::default();
    let mut order = PocOrder::default();
    let mut period = 0usize;
    let mut poc = 0;
    let mut keys = Vec::with_capacity(units.len());

    for (index, (data, _)) in units.iter().enumerate() {
        let mut cursor = Cursor::new(data.as_slice());

        loop {
            let pos = cursor.position();
            let nalu = match Nalu::next(&mut cursor) {
                Ok(nalu) => nalu,
                Err(_) if cursor.position() != pos => continue,
                Err(_) => break,
            };

            let parsed = match nalu.header.type_ {
                NaluType::Sps => parser.parse_sps(&nalu).map(|_| ()),
                NaluType::Pps => parser.parse_pps(&nalu).map(|_| ()),
                NaluType::Slice | NaluType::SliceIdr => {
                    let slice = parser.parse_slice_header(nalu).and_then(|slice| {
                        let sps = parser
                            .get_pps(slice.header.pic_parameter_set_id)
                            .map(|pps| Rc::clone(&pps.sps))
                            .ok_or_else(|| anyhow::anyhow!("slice refers to an unknown PPS"))?;
                        Ok(order.next(&sps, &slice))
                    });

                    match slice {
                        Ok((new_period, slice_poc)) => {
                            period += usize::from(new_period && index > 0);
                            poc = slice_poc;
                        }
                        Err(e) => debug!("No POC for access unit {}: {:#}", index, e),
                    }
                    break;
                }
                _ => Ok(()),
            };

            if let Err(e) = parsed {
                debug!("Ignoring parameter set in access unit {}: {:#}", index, e);
            }
        }

        // Access units without a usable slice keep the POC of the previous
        // one, which leaves them in decoding order.
        keys.push((period, poc, index));
    }

    keys.sort_unstable();

    let mut slots = vec![0; units.len()];
    for (slot, (_, _, index)) in keys.into_iter().enumerate() {
        slots[index] = slot;
    }
    slots
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Return the first picture at or after the target.
    Exact,
    /// Return the first picture decoded from the random access point before
    /// the target.
    Sloppy,
}

#[derive(Error, Debug)]
pub enum GrabError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("track codec {0:?} is not supported")]
    UnsupportedCodec(Codec),
    /// An I/O error happened earlier; the session cannot be used anymore.
    #[error("the frame grab session is closed")]
    Closed,
}

impl From<io::Error> for GrabError {
    fn from(e: io::Error) -> Self {
        GrabError::Decode(DecodeError::ChannelIO(e))
    }
}

/// A decoded picture with its presentation time and duration, in seconds.
#[derive(Debug)]
pub struct PictureWithMetadata {
    pub picture: Picture,
    pub timestamp: f64,
    pub duration: f64,
}

impl PictureWithMetadata {
    /// Picture order count of the picture within its coded video sequence.
    pub fn poc(&self) -> i32 {
        self.picture.poc()
    }
}

/// Timing of a sample fed to the decoder whose picture was not output yet.
#[derive(Debug, Default, Clone, Copy)]
struct PendingTime {
    pts: f64,
    duration: f64,
}

/// Where the pictures returned so far come from: the random access sample
/// decoding started at, and how many pictures were returned since.
#[derive(Debug, Default, Clone, Copy)]
struct Position {
    sync_index: usize,
    returned: usize,
}

pub struct FrameGrab<T: DemuxerTrack> {
    track: T,
    decoder: H264Decoder,
    /// Timing of the samples whose picture is still in the decoder, by sample
    /// index.
    pending: BTreeMap<u64, PendingTime>,
    position: Position,
    end_of_track: bool,
    closed: bool,
}

impl<T: DemuxerTrack> FrameGrab<T> {
    pub fn new(track: T) -> Result<Self, GrabError> {
        Self::with_config(track, Default::default())
    }

    pub fn with_config(track: T, config: DecoderConfig) -> Result<Self, GrabError> {
        let meta = track.meta();
        if meta.codec != Codec::H264 {
            return Err(GrabError::UnsupportedCodec(meta.codec));
        }

        let mut decoder = H264Decoder::new(config);
        if let Some(record) = &meta.decoder_config {
            decoder.decode_config_record(record)?;
        }

        debug!(
            "Frame grab over {} frames, {:.3}s",
            meta.total_frames, meta.total_duration
        );

        Ok(Self {
            track,
            decoder,
            pending: BTreeMap::new(),
            position: Default::default(),
            end_of_track: false,
            closed: false,
        })
    }

    pub fn video_track(&self) -> &T {
        &self.track
    }

    /// Ends the session and gives the track back.
    pub fn into_video_track(self) -> T {
        self.track
    }

    pub fn meta(&self) -> &TrackMeta {
        self.track.meta()
    }

    fn check_open(&self) -> Result<(), GrabError> {
        if self.closed {
            Err(GrabError::Closed)
        } else {
            Ok(())
        }
    }

    fn read_sample(
        &mut self,
        sample: io::Result<Option<Sample>>,
    ) -> Result<Option<Sample>, GrabError> {
        sample.map_err(|e| {
            self.closed = true;
            GrabError::from(e)
        })
    }

    fn decode_sample(&mut self, sample: Sample) -> Result<(), GrabError> {
        let index = sample.index as u64;
        self.pending.insert(
            index,
            PendingTime {
                pts: sample.pts,
                duration: sample.duration,
            },
        );

        let result = match self.decoder.decode(index, &sample.data) {
            Ok(()) => Ok(()),
            Err(DecodeError::MalformedBitstream(e)) => {
                warn!("Skipping malformed data in sample {}: {:#}", sample.index, e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        };

        // Samples that yielded no picture, or only the second field of one,
        // are never looked up.
        let held = self.decoder.pending_timestamps();
        self.pending.retain(|index, _| held.contains(index));

        result
    }

    /// Drops all decoding state and starts over from the random access
    /// sample `sync`.
    fn restart(&mut self, sync: Sample) -> Result<(), GrabError> {
        self.decoder.reset();
        self.pending.clear();
        self.end_of_track = false;
        self.position = Position {
            sync_index: sync.index,
            returned: 0,
        };
        self.decode_sample(sync)
    }

    fn pull_frame(&mut self) -> Result<Option<PictureWithMetadata>, GrabError> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                let time = self.pending.remove(&frame.timestamp).unwrap_or_else(|| {
                    warn!("No timing for the picture of sample {}", frame.timestamp);
                    PendingTime::default()
                });
                self.position.returned += 1;

                return Ok(Some(PictureWithMetadata {
                    picture: frame.picture,
                    timestamp: time.pts,
                    duration: time.duration,
                }));
            }

            if self.end_of_track {
                return Ok(None);
            }

            let sample = self.track.next_sample();
            match self.read_sample(sample)? {
                Some(sample) => self.decode_sample(sample)?,
                None => {
                    debug!("End of track, flushing the decoder");
                    self.end_of_track = true;
                    self.decoder.flush();
                }
            }
        }
    }

    /// Returns the next picture in presentation order, or `None` at the end
    /// of the track.
    pub fn next_frame(&mut self) -> Result<Option<PictureWithMetadata>, GrabError> {
        self.check_open()?;
        self.pull_frame()
    }

    /// Same as [`next_frame`](Self::next_frame), without the metadata.
    pub fn next_native_frame(&mut self) -> Result<Option<Picture>, GrabError> {
        Ok(self.next_frame()?.map(|frame| frame.picture))
    }

    /// Decodes again from the random access sample of `position` and drops
    /// the pictures already returned from it.
    fn restore(&mut self, position: Position) -> Result<(), GrabError> {
        debug!(
            "Restoring the position after {} pictures from sample {}",
            position.returned, position.sync_index
        );

        let sample = self.track.seek(SeekTarget::Frame(position.sync_index));
        let Some(sync) = self.read_sample(sample)? else {
            return Ok(());
        };

        self.restart(sync)?;
        while self.position.returned < position.returned {
            if self.pull_frame()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn seek(
        &mut self,
        target: SeekTarget,
        mode: SeekMode,
    ) -> Result<PictureWithMetadata, GrabError> {
        self.check_open()?;

        let meta = self.track.meta();
        let in_track = match target {
            SeekTarget::Frame(index) => index < meta.total_frames,
            SeekTarget::Second(second) => (0.0..=meta.total_duration).contains(&second),
        };
        if !in_track {
            return Err(DecodeError::NotFound.into());
        }

        let prior = self.position;
        let sample = self.track.seek(target);
        let Some(sample) = self.read_sample(sample)? else {
            self.restore(prior)?;
            return Err(DecodeError::NotFound.into());
        };

        debug!(
            "Seeking to {:?} ({:?}) from sample {} at {:.3}s",
            target, mode, sample.index, sample.pts
        );

        let mut frame_index = sample.index;
        self.restart(sample)?;

        loop {
            let Some(frame) = self.pull_frame()? else {
                debug!("{:?} is past the last picture", target);
                self.restore(prior)?;
                return Err(DecodeError::NotFound.into());
            };

            let reached = match (mode, target) {
                (SeekMode::Sloppy, _) => true,
                (SeekMode::Exact, SeekTarget::Frame(index)) => frame_index >= index,
                (SeekMode::Exact, SeekTarget::Second(second)) => {
                    frame.timestamp + TIME_EPSILON >= second
                }
            };

            if reached {
                return Ok(frame);
            }
            frame_index += 1;
        }
    }

    /// Returns the first picture presented at or after `second`.
    pub fn seek_to_second(&mut self, second: f64) -> Result<PictureWithMetadata, GrabError> {
        self.seek(SeekTarget::Second(second), SeekMode::Exact)
    }

    /// Returns the first picture of the random access point preceding
    /// `second`, which is faster than an exact seek.
    pub fn seek_to_second_sloppy(
        &mut self,
        second: f64,
    ) -> Result<PictureWithMetadata, GrabError> {
        self.seek(SeekTarget::Second(second), SeekMode::Sloppy)
    }

    pub fn seek_to_frame(
        &mut self,
        index: usize,
        mode: SeekMode,
    ) -> Result<PictureWithMetadata, GrabError> {
        self.seek(SeekTarget::Frame(index), mode)
    }

    pub fn seek_to_frame_sloppy(&mut self, index: usize) -> Result<PictureWithMetadata, GrabError> {
        self.seek(SeekTarget::Frame(index), SeekMode::Sloppy)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::bitstream_utils::NalIterator;
    use crate::codec::h264::parser::Level;
    use crate::codec::h264::parser::Pps;
    use crate::codec::h264::parser::PpsBuilder;
    use crate::codec::h264::parser::Profile;
    use crate::codec::h264::parser::SliceHeaderBuilder;
    use crate::codec::h264::parser::SliceType;
    use crate::codec::h264::parser::Sps;
    use crate::codec::h264::parser::SpsBuilder;
    use crate::codec::h264::synthesizer::MacroblockSynthesis;
    use crate::codec::h264::synthesizer::MotionSynthesis;
    use crate::codec::h264::synthesizer::SliceData;
    use crate::codec::h264::synthesizer::SliceSynthesis;
    use crate::codec::h264::synthesizer::Synthesizer;

    const FPS: f64 = 25.0;
    const GOPS: usize = 3;

    fn parameter_sets() -> (Rc<Sps>, Rc<Pps>) {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::Main)
            .level_idc(Level::L3)
            .resolution(32, 16)
            .max_num_ref_frames(2)
            .max_frame_num(16)
            .max_pic_order_cnt_lsb(64)
            .direct_8x8_inference_flag(true)
            .bitstream_restriction(2, 3)
            .build();
        let pps = PpsBuilder::new(Rc::clone(&sps)).build();
        (sps, pps)
    }

    fn pcm(seed: usize) -> Vec<u8> {
        (0..384).map(|i| ((i % 16) * 7 + (i / 16) * 3 + seed * 50) as u8).collect()
    }

    /// Annex B stream of `GOPS` groups coded I P B B P, presented I B B P P.
    fn stream() -> Vec<u8> {
        use crate::codec::h264::synthesizer::MacroblockSynthesis::Skip;

        let (sps, pps) = parameter_sets();
        let mut buf = Vec::new();

        for gop in 0..GOPS {
            Synthesizer::<'_, Sps, _>::synthesize(3, &sps, &mut buf, true).unwrap();
            Synthesizer::<'_, Pps, _>::synthesize(3, &pps, &mut buf, true).unwrap();

            let inter = |x: i16| MacroblockSynthesis::Inter16x16 {
                l0: Some(MotionSynthesis {
                    ref_idx: 0,
                    mvd: [x, 2],
                }),
                l1: None,
            };

            // (type, frame_num, poc lsb, ref_idc, macroblocks)
            let pictures = [
                (
                    SliceType::I,
                    0,
                    0,
                    3,
                    vec![
                        MacroblockSynthesis::Pcm(pcm(gop)),
                        MacroblockSynthesis::Pcm(pcm(gop + 1)),
                    ],
                ),
                (SliceType::P, 1, 6, 2, vec![inter(4 * gop as i16 + 3), Skip]),
                (SliceType::B, 2, 2, 0, vec![Skip, MacroblockSynthesis::Direct16x16]),
                (SliceType::B, 2, 4, 0, vec![Skip, Skip]),
                (SliceType::P, 2, 8, 2, vec![Skip, inter(-6)]),
            ];

            for (slice_type, frame_num, poc_lsb, ref_idc, mbs) in pictures {
                let header = SliceHeaderBuilder::new(&pps)
                    .slice_type(slice_type)
                    .frame_num(frame_num)
                    .pic_order_cnt_lsb(poc_lsb)
                    .idr_pic_id(gop as u16)
                    .direct_spatial_mv_pred_flag(true)
                    .build();
                let slice = SliceSynthesis {
                    header: &header,
                    pps: &pps,
                    idr: slice_type == SliceType::I,
                    data: SliceData::Cavlc(&mbs),
                };
                Synthesizer::<'_, SliceSynthesis, _>::synthesize(ref_idc, &slice, &mut buf, true)
                    .unwrap();
            }
        }

        buf
    }

    fn grab() -> FrameGrab<ElementaryStreamTrack> {
        let track = ElementaryStreamTrack::from_annexb(&stream(), FPS).unwrap();
        FrameGrab::new(track).unwrap()
    }

    fn digest(frame: &PictureWithMetadata) -> md5::Digest {
        md5::compute(frame.picture.to_vec())
    }

    fn decode_all(grab: &mut FrameGrab<impl DemuxerTrack>) -> Vec<PictureWithMetadata> {
        let mut frames = Vec::new();
        while let Some(frame) = grab.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn access_units_are_split() {
        let track = ElementaryStreamTrack::from_annexb(&stream(), FPS).unwrap();
        let samples = track.samples();

        assert_eq!(samples.len(), GOPS * 5);
        assert_eq!(track.meta().total_frames, GOPS * 5);
        assert!((track.meta().total_duration - (GOPS * 5) as f64 / FPS).abs() < 1e-9);

        let sync: Vec<_> = samples.iter().map(|s| s.is_sync).collect();
        assert_eq!(&sync[..6], &[true, false, false, false, false, true]);

        // Decoding order I P B B P, presented I B B P P.
        let slots: Vec<_> = samples[5..10].iter().map(|s| (s.pts * FPS).round() as usize).collect();
        assert_eq!(slots, vec![5, 8, 6, 7, 9]);
        assert!(samples.iter().all(|s| (s.duration - 1.0 / FPS).abs() < 1e-9));

        // The parameter sets travel with the IDR access unit.
        let nal_count = NalIterator::new(&samples[0].data).count();
        assert_eq!(nal_count, 3);
        assert_eq!(NalIterator::new(&samples[1].data).count(), 1);
    }

    #[test]
    fn frames_are_returned_in_presentation_order() {
        let mut grab = grab();
        let frames = decode_all(&mut grab);

        assert_eq!(frames.len(), grab.meta().total_frames);

        let pocs: Vec<_> = frames.iter().map(|f| f.poc()).collect();
        assert_eq!(&pocs[..5], &[0, 2, 4, 6, 8]);
        assert_eq!(&pocs[5..10], &[0, 2, 4, 6, 8]);

        for pair in frames.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
        for (i, frame) in frames.iter().enumerate() {
            assert!((frame.timestamp - i as f64 / FPS).abs() < 1e-9);
            assert!((frame.duration - 1.0 / FPS).abs() < 1e-9);
        }

        // The end of the track is sticky.
        assert!(grab.next_frame().unwrap().is_none());
        assert!(grab.next_native_frame().unwrap().is_none());

        let track = grab.into_video_track();
        assert_eq!(track.samples().len(), GOPS * 5);
    }

    #[test]
    fn decoding_is_deterministic() {
        let first: Vec<_> = decode_all(&mut grab()).iter().map(digest).collect();
        let second: Vec<_> = decode_all(&mut grab()).iter().map(digest).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn exact_seek_matches_full_decode() {
        let reference = decode_all(&mut grab());

        let mut grab = grab();
        for target in [7, 3, 12, 0, 9] {
            let frame = grab.seek_to_second(reference[target].timestamp).unwrap();
            assert_eq!(digest(&frame), digest(&reference[target]), "frame {}", target);
            assert!((frame.timestamp - reference[target].timestamp).abs() < 1e-9);

            let frame = grab.seek_to_frame(target, SeekMode::Exact).unwrap();
            assert_eq!(digest(&frame), digest(&reference[target]), "frame {}", target);
        }

        // Decoding continues after the target.
        let frame = grab.seek_to_second(reference[6].timestamp).unwrap();
        assert_eq!(frame.poc(), 2);
        let next = grab.next_frame().unwrap().unwrap();
        assert_eq!(digest(&next), digest(&reference[7]));
    }

    #[test]
    fn exact_seek_between_frames_returns_the_next_one() {
        let reference = decode_all(&mut grab());
        let mut grab = grab();

        let between = (reference[7].timestamp + reference[8].timestamp) / 2.0;
        let frame = grab.seek_to_second(between).unwrap();
        assert_eq!(digest(&frame), digest(&reference[8]));
    }

    #[test]
    fn sloppy_seek_returns_the_random_access_picture() {
        let reference = decode_all(&mut grab());
        let mut grab = grab();

        let frame = grab.seek_to_second_sloppy(reference[8].timestamp).unwrap();
        assert_eq!(frame.poc(), 0);
        assert_eq!(digest(&frame), digest(&reference[5]));
        assert!((frame.timestamp - reference[5].timestamp).abs() < 1e-9);

        let frame = grab.seek_to_frame_sloppy(14).unwrap();
        assert_eq!(digest(&frame), digest(&reference[10]));
    }

    #[test]
    fn seek_past_the_end_is_not_found() {
        let reference = decode_all(&mut grab());
        let mut grab = grab();

        assert_eq!(digest(&grab.next_frame().unwrap().unwrap()), digest(&reference[0]));

        let err = grab.seek_to_second(100.0).unwrap_err();
        assert!(matches!(err, GrabError::Decode(DecodeError::NotFound)));
        let err = grab.seek_to_frame(GOPS * 5, SeekMode::Exact).unwrap_err();
        assert!(matches!(err, GrabError::Decode(DecodeError::NotFound)));

        // The session goes on from where it was.
        assert_eq!(digest(&grab.next_frame().unwrap().unwrap()), digest(&reference[1]));
    }

    #[test]
    fn seek_after_the_last_picture_keeps_the_position() {
        let reference = decode_all(&mut grab());
        let mut grab = grab();
        let last = reference[reference.len() - 1].timestamp;
        let end = grab.meta().total_duration;
        assert!(last < end - 0.01);

        assert_eq!(digest(&grab.next_frame().unwrap().unwrap()), digest(&reference[0]));
        let err = grab.seek_to_second(end - 0.01).unwrap_err();
        assert!(matches!(err, GrabError::Decode(DecodeError::NotFound)));

        let next = grab.next_frame().unwrap().unwrap();
        assert_eq!(digest(&next), digest(&reference[1]));
        assert!((next.timestamp - reference[1].timestamp).abs() < 1e-9);

        // Same after a seek into the middle of a group.
        let frame = grab.seek_to_second(reference[6].timestamp).unwrap();
        assert_eq!(digest(&frame), digest(&reference[6]));
        assert!(grab.seek_to_second(end - 0.01).is_err());
        let next = grab.next_frame().unwrap().unwrap();
        assert_eq!(digest(&next), digest(&reference[7]));

        // And once every picture was returned.
        while grab.next_frame().unwrap().is_some() {}
        assert!(grab.seek_to_second(end - 0.01).is_err());
        assert!(grab.next_frame().unwrap().is_none());
    }

    #[test]
    fn malformed_samples_do_not_shift_timestamps() {
        let reference = decode_all(&mut grab());
        let track = ElementaryStreamTrack::from_annexb(&stream(), FPS).unwrap();

        // First group only, with the data of the first B picture replaced by
        // a slice whose header is cut short.
        let mut samples = track.samples()[..5].to_vec();
        assert_eq!((samples[2].pts * FPS).round(), 1.0);
        samples[2].data = vec![0, 0, 0, 1, 0x01, 0xff];

        let track = ElementaryStreamTrack::from_samples(samples, Codec::H264, None);
        let mut grab = FrameGrab::new(track).unwrap();
        let frames = decode_all(&mut grab);

        let pocs: Vec<_> = frames.iter().map(|f| f.poc()).collect();
        assert_eq!(pocs, vec![0, 4, 6, 8]);

        let slots: Vec<_> = frames.iter().map(|f| (f.timestamp * FPS).round() as usize).collect();
        assert_eq!(slots, vec![0, 2, 3, 4]);

        for (frame, expected) in frames.iter().zip([0, 2, 3, 4]) {
            assert_eq!(digest(frame), digest(&reference[expected]));
        }
    }

    #[test]
    fn length_prefixed_samples() {
        let reference = decode_all(&mut grab());
        let annexb = ElementaryStreamTrack::from_annexb(&stream(), FPS).unwrap();

        let (sps, pps) = {
            let first = &annexb.samples()[0].data;
            let mut nals = NalIterator::new(first);
            (nals.next().unwrap().to_vec(), nals.next().unwrap().to_vec())
        };
        let record = AvcDecoderConfigurationRecord {
            configuration_version: 1,
            profile_indication: sps[1],
            profile_compatibility: sps[2],
            level_indication: sps[3],
            nalu_length_size: 4,
            sps: vec![sps],
            pps: vec![pps],
        };

        let samples = annexb
            .samples()
            .iter()
            .map(|s| {
                let mut data = Vec::new();
                for nal in NalIterator::new(&s.data) {
                    data.extend_from_slice(&(nal.len() as u32).to_be_bytes());
                    data.extend_from_slice(nal);
                }
                Sample { data, ..s.clone() }
            })
            .collect();

        let track = ElementaryStreamTrack::from_samples(samples, Codec::H264, Some(record));
        let mut grab = FrameGrab::new(track).unwrap();
        let frames = decode_all(&mut grab);

        let digests: Vec<_> = frames.iter().map(digest).collect();
        let expected: Vec<_> = reference.iter().map(digest).collect();
        assert_eq!(digests, expected);
    }

    #[test]
    fn ipp_sequence_matches_the_reference_dump() {
        let (sps, pps) = parameter_sets();
        let mut buf = Vec::new();
        Synthesizer::<'_, Sps, _>::synthesize(3, &sps, &mut buf, true).unwrap();
        Synthesizer::<'_, Pps, _>::synthesize(3, &pps, &mut buf, true).unwrap();

        let mbs = [pcm(1), pcm(2)];
        for frame_num in 0..3u16 {
            let (slice_type, data): (SliceType, Vec<MacroblockSynthesis>) = if frame_num == 0 {
                (SliceType::I, mbs.iter().cloned().map(MacroblockSynthesis::Pcm).collect())
            } else {
                (SliceType::P, vec![MacroblockSynthesis::Skip, MacroblockSynthesis::Skip])
            };
            let header = SliceHeaderBuilder::new(&pps)
                .slice_type(slice_type)
                .frame_num(frame_num)
                .pic_order_cnt_lsb(frame_num * 2)
                .build();
            let slice = SliceSynthesis {
                header: &header,
                pps: &pps,
                idr: frame_num == 0,
                data: SliceData::Cavlc(&data),
            };
            Synthesizer::<'_, SliceSynthesis, _>::synthesize(2, &slice, &mut buf, true).unwrap();
        }

        // Raster planes of the two PCM macroblocks side by side.
        let mut planes = vec![vec![0u8; 32 * 16], vec![0u8; 16 * 8], vec![0u8; 16 * 8]];
        for (mb, samples) in mbs.iter().enumerate() {
            for row in 0..16 {
                let dst = row * 32 + mb * 16;
                planes[0][dst..dst + 16].copy_from_slice(&samples[row * 16..row * 16 + 16]);
            }
            for (plane, base) in [(1, 256), (2, 320)] {
                for row in 0..8 {
                    let dst = row * 16 + mb * 8;
                    let src = base + row * 8;
                    planes[plane][dst..dst + 8].copy_from_slice(&samples[src..src + 8]);
                }
            }
        }
        let resolution = crate::Resolution {
            width: 32,
            height: 16,
        };
        let reference =
            Picture::<crate::I420>::from_planes(planes, resolution, resolution.into(), 0).unwrap();

        let track = ElementaryStreamTrack::from_annexb(&buf, 30.0).unwrap();
        let mut grab = FrameGrab::new(track).unwrap();
        let frames = decode_all(&mut grab);

        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert!((frame.timestamp - i as f64 / 30.0).abs() < 1e-9);
            assert!(frame
                .picture
                .roughly_equal(&reference, crate::DEFAULT_SAMPLE_TOLERANCE));
        }
    }

    /// A track whose channel fails after `ok_samples` samples.
    struct FailingTrack {
        inner: ElementaryStreamTrack,
        ok_samples: usize,
    }

    impl DemuxerTrack for FailingTrack {
        fn meta(&self) -> &TrackMeta {
            self.inner.meta()
        }

        fn next_sample(&mut self) -> io::Result<Option<Sample>> {
            if self.ok_samples == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "channel closed"));
            }
            self.ok_samples -= 1;
            self.inner.next_sample()
        }

        fn seek(&mut self, target: SeekTarget) -> io::Result<Option<Sample>> {
            self.inner.seek(target)
        }
    }

    #[test]
    fn channel_errors_close_the_session() {
        let track = FailingTrack {
            inner: ElementaryStreamTrack::from_annexb(&stream(), FPS).unwrap(),
            ok_samples: 2,
        };
        let mut grab = FrameGrab::new(track).unwrap();

        let err = grab.next_frame().unwrap_err();
        assert!(matches!(err, GrabError::Decode(DecodeError::ChannelIO(_))));
        assert!(matches!(grab.next_frame(), Err(GrabError::Closed)));
        assert!(matches!(grab.seek_to_frame_sloppy(0), Err(GrabError::Closed)));
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let track = ElementaryStreamTrack::from_samples(Vec::new(), Codec::Unknown, None);
        assert!(matches!(
            FrameGrab::new(track),
            Err(GrabError::UnsupportedCodec(Codec::Unknown))
        ));
    }
}
