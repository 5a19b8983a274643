// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use cros_framegrab::frame_grab::ElementaryStreamTrack;
use cros_framegrab::frame_grab::FrameGrab;
use cros_framegrab::frame_grab::SeekMode;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(track) = ElementaryStreamTrack::from_annexb(data, 25.0) else {
        return;
    };
    let Ok(mut grab) = FrameGrab::new(track) else {
        return;
    };

    while let Ok(Some(_)) = grab.next_frame() {}

    let total_frames = grab.meta().total_frames;
    if total_frames > 0 {
        let _ = grab.seek_to_frame(total_frames / 2, SeekMode::Exact);
        let _ = grab.next_frame();
    }
});
