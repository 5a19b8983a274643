// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Md5Computation {
    Stream,
    Frame,
}

impl FromStr for Md5Computation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Md5Computation::Stream),
            "frame" => Ok(Md5Computation::Frame),
            _ => Err("unrecognized MD5 computation option. Valid values: stream, frame"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CorruptSlices {
    Conceal,
    Abort,
}

impl FromStr for CorruptSlices {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conceal" => Ok(CorruptSlices::Conceal),
            "abort" => Ok(CorruptSlices::Abort),
            _ => Err("unrecognized corrupt slice policy. Valid values: conceal, abort"),
        }
    }
}

/// Grabs the decoded frames of an H.264 stream (Annex B or Matroska)
#[derive(Debug, FromArgs)]
pub struct Args {
    /// input file
    #[argh(positional)]
    pub input: PathBuf,

    /// output file to write the decoded I420 frames to
    #[argh(option)]
    pub output: Option<PathBuf>,

    /// frame rate of Annex B input. Default: 25
    #[argh(option, default = "25.0")]
    pub fps: f64,

    /// seek to this frame number before grabbing
    #[argh(option)]
    pub seek_frame: Option<usize>,

    /// seek to this time in seconds before grabbing
    #[argh(option)]
    pub seek_second: Option<f64>,

    /// stop at the random access point preceding the seek target
    #[argh(switch)]
    pub sloppy: bool,

    /// maximum number of frames to grab
    #[argh(option)]
    pub count: Option<usize>,

    /// whether to display the MD5 of the decoded stream, and at which granularity (stream or
    /// frame)
    #[argh(option)]
    pub compute_md5: Option<Md5Computation>,

    /// what to do with pictures holding undecodable slices (conceal or abort). Default: conceal
    #[argh(option, default = "CorruptSlices::Conceal")]
    pub corrupt_slices: CorruptSlices,

    /// number of frames of the decoded picture buffer, overriding the stream's value
    #[argh(option)]
    pub dpb_size: Option<usize>,
}
