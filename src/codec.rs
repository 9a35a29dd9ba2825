// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-format knowledge needed by the host side of the decoder.
//!
//! The VPU parses the bitstream itself, so the host only needs to know a handful of things about
//! each format: how to align the picture height, which auxiliary memory areas the firmware wants
//! and how to describe the stream in the logs. This is captured by [`CodecDescriptor`], which is
//! looked up once per session through [`descriptor`].

pub mod mpeg4;

use std::str::FromStr;

use enumn::N;

use crate::backend::InitialInfo;
use crate::Resolution;

/// Size of the parameter-set save area used by the H.264 decoder.
pub const PS_SAVE_SIZE: usize = 0x080000;

/// Compressed formats supported by the VPU, with the values used by the firmware.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StreamFormat {
    Mpeg4 = 0,
    H263 = 1,
    Avc = 2,
    Vc1 = 3,
    Mpeg2 = 4,
    Div3 = 5,
    Rv = 6,
    Mjpg = 7,
    Avs = 8,
    Vp8 = 9,
}

impl FromStr for StreamFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mpeg4" | "MPEG4" => Ok(StreamFormat::Mpeg4),
            "h263" | "H263" => Ok(StreamFormat::H263),
            "h264" | "H264" | "avc" => Ok(StreamFormat::Avc),
            "vc1" | "VC1" => Ok(StreamFormat::Vc1),
            "mpeg2" | "MPEG2" => Ok(StreamFormat::Mpeg2),
            "div3" | "DIV3" => Ok(StreamFormat::Div3),
            "rv" | "RV" => Ok(StreamFormat::Rv),
            "mjpg" | "MJPG" | "mjpeg" => Ok(StreamFormat::Mjpg),
            "avs" | "AVS" => Ok(StreamFormat::Avs),
            "vp8" | "VP8" => Ok(StreamFormat::Vp8),
            _ => Err("unrecognized stream format. Valid values: mpeg4, h263, h264, vc1, mpeg2, div3, rv, mjpg, avs, vp8"),
        }
    }
}

/// Chroma layout of a JPEG picture.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum JpegSourceFormat {
    #[default]
    Yuv420 = 0,
    Yuv422 = 1,
    /// 4:2:2 with vertical chroma subsampling.
    Yuv224 = 2,
    Yuv444 = 3,
    Yuv400 = 4,
}

impl JpegSourceFormat {
    /// Total size of the luma and chroma planes for a `luma_size` bytes luma plane.
    pub fn frame_size(self, luma_size: usize) -> usize {
        match self {
            JpegSourceFormat::Yuv420 => luma_size * 3 / 2,
            JpegSourceFormat::Yuv422 | JpegSourceFormat::Yuv224 => luma_size * 2,
            JpegSourceFormat::Yuv444 => luma_size * 3,
            JpegSourceFormat::Yuv400 => luma_size,
        }
    }

    /// Size of each chroma plane for a `luma_size` bytes luma plane.
    pub fn chroma_size(self, luma_size: usize) -> usize {
        match self {
            JpegSourceFormat::Yuv420 => luma_size / 4,
            JpegSourceFormat::Yuv422 | JpegSourceFormat::Yuv224 => luma_size / 2,
            JpegSourceFormat::Yuv444 => luma_size,
            JpegSourceFormat::Yuv400 => 0,
        }
    }
}

/// Format-specific behavior of a decoding session.
pub trait CodecDescriptor: Sync {
    fn name(&self) -> &'static str;

    /// Alignment of the frame buffer height. Interlaced content of some formats is decoded field
    /// by field into 32-line aligned buffers.
    fn height_alignment(&self, _interlaced: bool) -> u32 {
        16
    }

    /// Logs what the decoder found in the sequence header.
    fn log_stream_info(&self, info: &InitialInfo) {
        log::info!(
            "{} Profile: {} Level: {}",
            self.name(),
            info.profile,
            info.level
        );
    }

    /// Size of the parameter-set save area the firmware needs, if any.
    fn ps_save_buffer_size(&self) -> Option<usize> {
        None
    }

    /// Size of the slice working area the firmware needs, if any.
    fn slice_buffer_size(&self, _info: &InitialInfo) -> Option<usize> {
        None
    }

    /// Size of the macroblock parameter area the firmware needs for pictures of `resolution`, if
    /// any.
    fn macroblock_buffer_size(&self, _resolution: Resolution) -> Option<usize> {
        None
    }

    /// Whether frame buffers carry a co-located motion vector area.
    fn has_mv_col(&self) -> bool {
        true
    }

    /// Whether every picture is independent. Such streams are always output through the rotator
    /// and frame buffers are never held back for display.
    fn is_still_picture(&self) -> bool {
        false
    }

    /// Whether the decoder is able to report user data for this format.
    fn has_user_data(&self) -> bool {
        true
    }
}

fn log_aspect_ratio_index(info: &InitialInfo) {
    if info.aspect_ratio != 0 {
        log::info!("Aspect Ratio Table index: {}", info.aspect_ratio);
    } else {
        log::info!("Aspect Ratio is not present.");
    }
}

struct Avc;

impl CodecDescriptor for Avc {
    fn name(&self) -> &'static str {
        "H.264"
    }

    fn height_alignment(&self, interlaced: bool) -> u32 {
        if interlaced {
            32
        } else {
            16
        }
    }

    fn log_stream_info(&self, info: &InitialInfo) {
        log::info!(
            "H.264 Profile: {} Level: {} Interlace: {}",
            info.profile,
            info.level,
            info.interlaced
        );

        match info.aspect_ratio {
            0 => log::info!("Aspect Ratio is not present."),
            ar if ar >> 16 == 0 => log::info!("aspect_ratio_idc: {}", ar & 0xff),
            ar => log::info!("sar_width: {}, sar_height: {}", ar >> 16, ar & 0xffff),
        }
    }

    fn ps_save_buffer_size(&self) -> Option<usize> {
        Some(PS_SAVE_SIZE)
    }

    fn slice_buffer_size(&self, info: &InitialInfo) -> Option<usize> {
        Some(info.worst_slice_size as usize * 1024)
    }
}

struct Vc1;

impl CodecDescriptor for Vc1 {
    fn name(&self) -> &'static str {
        "VC1"
    }

    fn height_alignment(&self, interlaced: bool) -> u32 {
        if interlaced {
            32
        } else {
            16
        }
    }

    fn log_stream_info(&self, info: &InitialInfo) {
        match info.profile {
            0 => log::info!("VC1 Profile: Simple"),
            1 => log::info!("VC1 Profile: Main"),
            2 => log::info!("VC1 Profile: Advanced"),
            p => log::info!("VC1 Profile: {}", p),
        }
        log::info!(
            "Level: {} Interlace: {} Progressive Segmented Frame: {}",
            info.level,
            info.interlaced,
            info.vc1_psf
        );
        if info.aspect_ratio != 0 {
            log::info!(
                "Aspect Ratio [X, Y]:[{:3}, {:3}]",
                (info.aspect_ratio >> 8) & 0xff,
                info.aspect_ratio & 0xff
            );
        } else {
            log::info!("Aspect Ratio is not present.");
        }
    }
}

struct Mpeg2;

impl CodecDescriptor for Mpeg2 {
    fn name(&self) -> &'static str {
        "Mpeg2"
    }

    fn height_alignment(&self, interlaced: bool) -> u32 {
        if interlaced {
            32
        } else {
            16
        }
    }

    fn log_stream_info(&self, info: &InitialInfo) {
        log::info!(
            "Mpeg2 Profile: {} Level: {} Progressive Sequence Flag: {}",
            info.profile,
            info.level,
            !info.interlaced
        );
        log_aspect_ratio_index(info);
    }
}

struct Mpeg4;

impl CodecDescriptor for Mpeg4 {
    fn name(&self) -> &'static str {
        "Mpeg4"
    }

    fn log_stream_info(&self, info: &InitialInfo) {
        let (profile, level) = mpeg4::profile_and_level(info.profile, info.level);
        log::info!(
            "Mpeg4 Profile: {:?} Level: {} Interlaced: {}",
            profile,
            level,
            info.interlaced
        );
        log_aspect_ratio_index(info);
    }
}

struct Vp8;

impl CodecDescriptor for Vp8 {
    fn name(&self) -> &'static str {
        "VP8"
    }

    fn height_alignment(&self, interlaced: bool) -> u32 {
        if interlaced {
            32
        } else {
            16
        }
    }

    fn log_stream_info(&self, info: &InitialInfo) {
        log::info!("VP8 Profile: {} Level: {}", info.profile, info.level);
        log::info!(
            "hScaleFactor: {} vScaleFactor: {}",
            info.vp8_scale.0,
            info.vp8_scale.1
        );
    }

    fn macroblock_buffer_size(&self, resolution: Resolution) -> Option<usize> {
        let macroblocks = (resolution.width as usize * resolution.height as usize) / 256;
        Some(68 * macroblocks)
    }
}

struct Mjpg;

impl CodecDescriptor for Mjpg {
    fn name(&self) -> &'static str {
        "MJPG"
    }

    fn log_stream_info(&self, info: &InitialInfo) {
        log::info!("MJPG SourceFormat: {:?}", info.jpeg_source_format);
    }

    fn has_mv_col(&self) -> bool {
        false
    }

    fn is_still_picture(&self) -> bool {
        true
    }
}

struct Rv;

impl CodecDescriptor for Rv {
    fn name(&self) -> &'static str {
        "RV"
    }

    fn has_user_data(&self) -> bool {
        false
    }
}

/// Formats for which the host has nothing specific to do.
struct Plain(&'static str);

impl CodecDescriptor for Plain {
    fn name(&self) -> &'static str {
        self.0
    }
}

static H263: Plain = Plain("H263");
static DIV3: Plain = Plain("DIV3");
static AVS: Plain = Plain("AVS");

/// Returns the descriptor for `format`.
pub fn descriptor(format: StreamFormat) -> &'static dyn CodecDescriptor {
    match format {
        StreamFormat::Avc => &Avc,
        StreamFormat::Vc1 => &Vc1,
        StreamFormat::Mpeg2 => &Mpeg2,
        StreamFormat::Mpeg4 => &Mpeg4,
        StreamFormat::Vp8 => &Vp8,
        StreamFormat::Mjpg => &Mjpg,
        StreamFormat::H263 => &H263,
        StreamFormat::Div3 => &DIV3,
        StreamFormat::Rv => &Rv,
        StreamFormat::Avs => &AVS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_values() {
        assert_eq!(StreamFormat::n(2), Some(StreamFormat::Avc));
        assert_eq!(StreamFormat::n(7), Some(StreamFormat::Mjpg));
        assert_eq!(StreamFormat::n(10), None);
        assert_eq!(JpegSourceFormat::n(4), Some(JpegSourceFormat::Yuv400));
    }

    #[test]
    fn interlaced_height_alignment() {
        for format in [
            StreamFormat::Avc,
            StreamFormat::Vc1,
            StreamFormat::Mpeg2,
            StreamFormat::Vp8,
        ] {
            assert_eq!(descriptor(format).height_alignment(true), 32);
            assert_eq!(descriptor(format).height_alignment(false), 16);
        }
        assert_eq!(descriptor(StreamFormat::Mpeg4).height_alignment(true), 16);
        assert_eq!(descriptor(StreamFormat::Mjpg).height_alignment(true), 16);
    }

    #[test]
    fn auxiliary_buffers() {
        let info = InitialInfo {
            worst_slice_size: 200,
            ..Default::default()
        };
        let avc = descriptor(StreamFormat::Avc);
        assert_eq!(avc.slice_buffer_size(&info), Some(200 * 1024));
        assert_eq!(avc.ps_save_buffer_size(), Some(PS_SAVE_SIZE));

        let vp8 = descriptor(StreamFormat::Vp8);
        assert_eq!(
            vp8.macroblock_buffer_size(Resolution::new(320, 240)),
            Some(68 * 300)
        );
        assert_eq!(vp8.slice_buffer_size(&info), None);

        assert!(!descriptor(StreamFormat::Mjpg).has_mv_col());
        assert!(descriptor(StreamFormat::Mpeg2).has_mv_col());
        assert!(!descriptor(StreamFormat::Rv).has_user_data());
        assert!(descriptor(StreamFormat::Avc).has_user_data());
    }

    #[test]
    fn jpeg_frame_sizes() {
        assert_eq!(JpegSourceFormat::Yuv420.frame_size(64), 96);
        assert_eq!(JpegSourceFormat::Yuv422.frame_size(64), 128);
        assert_eq!(JpegSourceFormat::Yuv444.frame_size(64), 192);
        assert_eq!(JpegSourceFormat::Yuv400.frame_size(64), 64);
        assert_eq!(JpegSourceFormat::Yuv400.chroma_size(64), 0);
    }
}
