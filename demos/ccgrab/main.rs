// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! ccgrab, a frame grabber built on the software H.264 decoder. Reads Annex B or Matroska input,
//! optionally seeks, and writes the grabbed frames or their MD5 checksums.

use std::fs::File;
use std::io::Cursor;
use std::io::Read;
use std::io::Write;

use cros_framegrab::codec::h264::avcc::AvcDecoderConfigurationRecord;
use cros_framegrab::decoder::CorruptSlicePolicy;
use cros_framegrab::decoder::DecoderConfig;
use cros_framegrab::frame_grab::Codec;
use cros_framegrab::frame_grab::ElementaryStreamTrack;
use cros_framegrab::frame_grab::FrameGrab;
use cros_framegrab::frame_grab::PictureWithMetadata;
use cros_framegrab::frame_grab::Sample;
use cros_framegrab::frame_grab::SeekMode;
use matroska_demuxer::Frame;
use matroska_demuxer::MatroskaFile;
use matroska_demuxer::TrackType;

use crate::util::Args;
use crate::util::CorruptSlices;
use crate::util::Md5Computation;

mod util;

const MKV_MAGIC: [u8; 4] = [0x1a, 0x45, 0xdf, 0xa3];

/// Reads the whole video track of a Matroska file.
fn mkv_track(input: &[u8]) -> anyhow::Result<ElementaryStreamTrack> {
    let mut mkv = MatroskaFile::open(Cursor::new(input))?;
    let track = mkv
        .tracks()
        .iter()
        .find(|t| t.track_type() == TrackType::Video)
        .ok_or_else(|| anyhow::anyhow!("no video track in input file"))?;

    let track_number = track.track_number().get();
    let (codec, decoder_config) = match track.codec_id() {
        "V_MPEG4/ISO/AVC" => {
            let private = track
                .codec_private()
                .ok_or_else(|| anyhow::anyhow!("AVC track without decoder configuration"))?;
            (Codec::H264, Some(AvcDecoderConfigurationRecord::parse(private)?))
        }
        _ => (Codec::Unknown, None),
    };
    let default_duration = track.default_duration().map(|d| d.get() as f64 / 1e9);
    let scale = mkv.info().timestamp_scale().get() as f64 / 1e9;

    let mut samples: Vec<Sample> = Vec::new();
    let mut frame = Frame::default();
    while mkv.next_frame(&mut frame)? {
        if frame.track != track_number {
            continue;
        }

        samples.push(Sample {
            data: std::mem::take(&mut frame.data),
            pts: frame.timestamp as f64 * scale,
            duration: default_duration.unwrap_or(0.0),
            index: samples.len(),
            is_sync: frame.is_keyframe.unwrap_or(samples.is_empty()),
        });
    }

    Ok(ElementaryStreamTrack::from_samples(samples, codec, decoder_config))
}

fn write_frame(
    args: &Args,
    output: &mut Option<File>,
    md5_context: &mut md5::Context,
    frame: &PictureWithMetadata,
) {
    let data = frame.picture.to_vec();

    if let Some(output) = output {
        output.write_all(&data).expect("failed to write to output file");
    }

    match args.compute_md5 {
        None => (),
        Some(Md5Computation::Frame) => {
            println!("{:x} {:.3} poc {}", md5::compute(&data), frame.timestamp, frame.poc())
        }
        Some(Md5Computation::Stream) => md5_context.consume(&data),
    }
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let input = {
        let mut buf = Vec::new();
        File::open(&args.input)
            .expect("error opening input file")
            .read_to_end(&mut buf)
            .expect("error reading input file");
        buf
    };

    let track = if input.starts_with(&MKV_MAGIC) {
        mkv_track(&input).expect("error demuxing input file")
    } else {
        ElementaryStreamTrack::from_annexb(&input, args.fps).expect("error splitting input file")
    };

    let config = DecoderConfig {
        corrupt_slice_policy: match args.corrupt_slices {
            CorruptSlices::Conceal => CorruptSlicePolicy::Conceal,
            CorruptSlices::Abort => CorruptSlicePolicy::Abort,
        },
        max_dpb_frames_override: args.dpb_size,
    };

    let mut grab = FrameGrab::with_config(track, config).expect("error creating frame grabber");
    let meta = grab.meta();
    log::info!(
        "{} frames, {:.3}s, codec {:?}",
        meta.total_frames,
        meta.total_duration,
        meta.codec
    );

    let mut output = args
        .output
        .as_ref()
        .map(|p| File::create(p).expect("error creating output file"));
    let mut md5_context = md5::Context::new();
    let mode = if args.sloppy { SeekMode::Sloppy } else { SeekMode::Exact };

    let first = match (args.seek_frame, args.seek_second) {
        (Some(index), _) => Some(grab.seek_to_frame(index, mode).expect("error seeking")),
        (None, Some(second)) if args.sloppy => {
            Some(grab.seek_to_second_sloppy(second).expect("error seeking"))
        }
        (None, Some(second)) => Some(grab.seek_to_second(second).expect("error seeking")),
        (None, None) => None,
    };

    let limit = args.count.unwrap_or(usize::MAX);
    let mut grabbed = 0;
    if let Some(frame) = first {
        if limit > 0 {
            write_frame(&args, &mut output, &mut md5_context, &frame);
            grabbed += 1;
        }
    }

    while grabbed < limit {
        match grab.next_frame().expect("error decoding frame") {
            Some(frame) => write_frame(&args, &mut output, &mut md5_context, &frame),
            None => break,
        }
        grabbed += 1;
    }

    if args.compute_md5 == Some(Md5Computation::Stream) {
        println!("{:x}", md5_context.compute());
    }
}
