// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;

use mxc_codecs::codec::StreamFormat;
use mxc_codecs::config::BitstreamMode;
use mxc_codecs::MapType;
use mxc_codecs::MirrorDirection;
use mxc_codecs::Rotation;

#[derive(Debug, PartialEq, Eq)]
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

/// Decodes a stream on a simulated VPU
#[derive(Debug, FromArgs)]
pub struct Args {
    /// input file in the simulated decoder's container format. A synthetic stream is generated
    /// when omitted.
    #[argh(positional)]
    pub input: Option<PathBuf>,

    /// number of frames of the synthetic stream. Default: 30
    #[argh(option, default = "30")]
    pub frames: usize,

    /// codec family the stream is declared as. Default: avc
    #[argh(option, default = "StreamFormat::Avc")]
    pub format: StreamFormat,

    /// picture width reported by the simulated decoder. Default: 320
    #[argh(option, default = "320")]
    pub width: u32,

    /// picture height reported by the simulated decoder. Default: 240
    #[argh(option, default = "240")]
    pub height: u32,

    /// clockwise rotation applied to decoded pictures (0, 90, 180 or 270)
    #[argh(option)]
    pub rotation: Option<Rotation>,

    /// mirroring applied to decoded pictures (none, ver, hor or both). Default: none
    #[argh(option, default = "MirrorDirection::None")]
    pub mirror: MirrorDirection,

    /// frame buffer layout (linear, tiled-frame or tiled-field). Default: linear
    #[argh(option, default = "MapType::Linear")]
    pub map_type: MapType,

    /// whether the decoder writes interleaved chroma
    #[argh(switch)]
    pub chroma_interleave: bool,

    /// whether the decoder restarts truncated frames instead of waiting for more data
    #[argh(switch)]
    pub rollback: bool,

    /// stop after this many frames
    #[argh(option, default = "0")]
    pub frame_count: u64,

    /// output file to write the decoded frames to
    #[argh(option)]
    pub output: Option<PathBuf>,

    /// framebuffer device to show the decoded frames on, instead of writing them
    #[argh(option)]
    pub framebuffer: Option<PathBuf>,

    /// whether to display the MD5 of the decoded stream, and at which granularity (stream or
    /// frame)
    #[argh(option)]
    pub compute_md5: Option<Md5Computation>,
}

impl Args {
    pub fn bitstream_mode(&self) -> BitstreamMode {
        if self.rollback {
            BitstreamMode::Rollback
        } else {
            BitstreamMode::Normal
        }
    }
}
