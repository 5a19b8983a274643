// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod h264;

use std::collections::VecDeque;

use thiserror::Error;

use crate::Picture;

#[derive(Error, Debug)]
pub enum DecodeError {
    /// A NAL unit violates the bitstream syntax. Decoding can resume at the
    /// next NAL unit.
    #[error("malformed bitstream: {0:#}")]
    MalformedBitstream(anyhow::Error),
    /// A slice could not be decoded past macroblock `mb_addr`.
    #[error("corrupt slice at macroblock {mb_addr}: {source:#}")]
    CorruptSlice {
        mb_addr: usize,
        source: anyhow::Error,
    },
    /// A valid stream that uses coding tools this decoder does not support.
    #[error("unsupported stream: {0}")]
    UnsupportedStream(String),
    #[error("channel I/O error: {0}")]
    ChannelIO(#[from] std::io::Error),
    #[error("not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// What to do with a picture when one of its slices fails to decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorruptSlicePolicy {
    /// Drop the picture and report the error. Decoding resumes with the next
    /// picture.
    Abort,
    /// Reconstruct the macroblocks that could not be decoded as skipped ones
    /// and emit the picture.
    #[default]
    Conceal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderConfig {
    pub corrupt_slice_policy: CorruptSlicePolicy,
    /// Number of frames of the DPB, instead of the one derived from the SPS.
    pub max_dpb_frames_override: Option<usize>,
}

/// How NAL units are delimited in the buffers given to the decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    /// Start code delimited (Annex B).
    #[default]
    AnnexB,
    /// Each NAL unit is preceded by its size, coded on the given number of
    /// big-endian bytes.
    LengthPrefixed(usize),
}

/// A picture leaving the decoder, in output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Timestamp of the access unit the picture was decoded from.
    pub timestamp: u64,
    pub picture: Picture,
}

/// A queue where decoded frames wait until they are retrieved by the client.
pub(crate) struct ReadyFramesQueue<T> {
    /// Queue of all the frames waiting to be sent to the client.
    queue: VecDeque<T>,
}

impl<T> Default for ReadyFramesQueue<T> {
    fn default() -> Self {
        Self {
            queue: Default::default(),
        }
    }
}

impl<T> ReadyFramesQueue<T> {
    /// Push `handle` to the back of the queue.
    pub(crate) fn push(&mut self, handle: T) {
        self.queue.push_back(handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.queue.iter()
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear()
    }
}

impl<T> Extend<T> for ReadyFramesQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.queue.extend(iter)
    }
}

/// Allows us to manipulate the frames list like an iterator without consuming it and resetting its
/// display order counter.
impl<'a, T> Iterator for &'a mut ReadyFramesQueue<T> {
    type Item = T;

    /// Returns the next frame (if any) waiting to be dequeued.
    fn next(&mut self) -> Option<T> {
        self.queue.pop_front()
    }
}
