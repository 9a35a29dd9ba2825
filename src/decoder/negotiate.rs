// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Discovery of the stream geometry and buffer requirements.

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::InitialInfo;
use crate::backend::ReportBufferSizes;
use crate::backend::VpuBackend;
use crate::codec::descriptor;
use crate::codec::JpegSourceFormat;
use crate::codec::StreamFormat;
use crate::utils::align_up;
use crate::Rect;
use crate::Resolution;

/// Extra buffers needed by interlaced streams, which are post-processed field by field.
const INTERLACED_EXTRA_BUFFERS: usize = 2;

#[derive(Error, Debug)]
pub enum NegotiateError {
    #[error("failed to parse the sequence header: {0}")]
    InitialInfo(#[source] BackendError),
    #[error("invalid picture size {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },
}

/// Everything the host needs to know about a stream to size its buffers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub format: StreamFormat,
    /// Size of the pictures as coded in the stream. Decoded sizes are compared against it to
    /// detect resolution changes.
    pub picture_resolution: Resolution,
    /// Size of the pictures, after JPEG downscaling.
    pub display_resolution: Resolution,
    /// Size of the frame buffers, aligned to the macroblock grid.
    pub coded_resolution: Resolution,
    pub stride: u32,
    /// Visible area. Derived from the display resolution when the stream does not provide one
    /// and the coded size is larger.
    pub crop: Rect,
    pub interlaced: bool,
    /// Number of buffers the decoder needs to operate.
    pub min_buffer_count: usize,
    /// Number of buffers to register as decoding targets.
    pub buffer_count: usize,
    pub slice_buffer_size: usize,
    pub jpeg_source_format: JpegSourceFormat,
    pub frame_rate: (u32, u32),
    pub report_buffer_sizes: ReportBufferSizes,
}

impl StreamInfo {
    /// Builds the stream information from what the decoder reported.
    pub fn from_initial_info(
        format: StreamFormat,
        info: &InitialInfo,
        extended_buffer_count: usize,
        jpeg_scale_down: (u8, u8),
    ) -> Result<Self, NegotiateError> {
        let codec = descriptor(format);

        let mut buffer_count = info.min_frame_buffer_count + extended_buffer_count;
        if info.interlaced {
            buffer_count += INTERLACED_EXTRA_BUFFERS;
        }

        let display_resolution = if format == StreamFormat::Mjpg {
            Resolution::new(
                info.pic_width >> jpeg_scale_down.0,
                info.pic_height >> jpeg_scale_down.1,
            )
        } else {
            Resolution::new(info.pic_width, info.pic_height)
        };

        let coded_resolution = Resolution::new(
            align_up(display_resolution.width as usize, 16) as u32,
            align_up(
                display_resolution.height as usize,
                codec.height_alignment(info.interlaced) as usize,
            ) as u32,
        );
        if coded_resolution.width == 0 || coded_resolution.height == 0 {
            return Err(NegotiateError::InvalidGeometry {
                width: info.pic_width,
                height: info.pic_height,
            });
        }

        let mut crop = info.crop;
        if crop.is_empty()
            && (coded_resolution.width > display_resolution.width
                || coded_resolution.height > display_resolution.height)
        {
            crop = Rect::new(0, 0, display_resolution.width, display_resolution.height);
        }

        Ok(Self {
            format,
            picture_resolution: Resolution::new(info.pic_width, info.pic_height),
            display_resolution,
            coded_resolution,
            stride: coded_resolution.width,
            crop,
            interlaced: info.interlaced,
            min_buffer_count: info.min_frame_buffer_count,
            buffer_count,
            slice_buffer_size: codec.slice_buffer_size(info).unwrap_or(0),
            jpeg_source_format: info.jpeg_source_format,
            frame_rate: (info.frame_rate_res, info.frame_rate_div),
            report_buffer_sizes: info.report_buffer_sizes,
        })
    }
}

/// Asks the decoder to parse the sequence header currently in the bitstream ring and derives the
/// stream geometry from it.
pub fn negotiate<B: VpuBackend + ?Sized>(
    backend: &mut B,
    format: StreamFormat,
    extended_buffer_count: usize,
    jpeg_scale_down: (u8, u8),
) -> Result<StreamInfo, NegotiateError> {
    // Do not block on a truncated header while parsing.
    backend.set_escape_sequence_init(true);
    let info = backend.initial_info();
    backend.set_escape_sequence_init(false);
    let info = info.map_err(NegotiateError::InitialInfo)?;

    if info.stream_info_obtained {
        descriptor(format).log_stream_info(&info);
    }
    log::info!(
        "Decoder: width = {}, height = {}, frameRateRes = {}, frameRateDiv = {}, count = {}",
        info.pic_width,
        info.pic_height,
        info.frame_rate_res,
        info.frame_rate_div,
        info.min_frame_buffer_count
    );

    let stream = StreamInfo::from_initial_info(format, &info, extended_buffer_count, jpeg_scale_down)?;
    log::debug!(
        "minfb {}, extfb {}, registering {} buffers",
        stream.min_buffer_count,
        extended_buffer_count,
        stream.buffer_count
    );
    log::info!(
        "CROP left/top/right/bottom {} {} {} {}",
        stream.crop.left,
        stream.crop.top,
        stream.crop.right,
        stream.crop.bottom
    );

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::progressive_info;
    use crate::backend::dummy::SimulatedVpu;
    use crate::backend::OpenParams;
    use crate::config::BitstreamMode;
    use crate::memory::heap::PhysicalBus;
    use crate::MapType;

    fn open(vpu: &mut SimulatedVpu, format: StreamFormat) {
        vpu.open(&OpenParams {
            format,
            bitstream_phys: 0x1000,
            bitstream_size: 0x1000,
            reorder: true,
            deblocking: false,
            chroma_interleave: false,
            map_type: MapType::Linear,
            tiled_to_linear: false,
            bitstream_mode: BitstreamMode::Normal,
            jpeg_line_buffer: false,
            ps_save_buffer: None,
        })
        .unwrap();
    }

    #[test]
    fn progressive_1080p() {
        let info = progressive_info(1920, 1080, 4);
        let stream = StreamInfo::from_initial_info(StreamFormat::Avc, &info, 2, (0, 0)).unwrap();
        assert_eq!(stream.coded_resolution, Resolution::new(1920, 1088));
        assert_eq!(stream.stride, 1920);
        assert_eq!(stream.buffer_count, 6);
        assert_eq!(stream.crop, Rect::new(0, 0, 1920, 1080));
        assert_eq!(stream.slice_buffer_size, 64 * 1024);
    }

    #[test]
    fn interlaced_streams_get_taller_buffers() {
        let mut info = progressive_info(720, 482, 3);
        info.interlaced = true;
        let stream = StreamInfo::from_initial_info(StreamFormat::Mpeg2, &info, 2, (0, 0)).unwrap();
        assert_eq!(stream.coded_resolution, Resolution::new(720, 512));
        assert_eq!(stream.buffer_count, 3 + 2 + 2);

        let stream = StreamInfo::from_initial_info(StreamFormat::Mpeg4, &info, 2, (0, 0)).unwrap();
        assert_eq!(stream.coded_resolution, Resolution::new(720, 496));
    }

    #[test]
    fn stream_crop_is_kept() {
        let mut info = progressive_info(1920, 1080, 4);
        info.crop = Rect::new(0, 0, 1920, 1080);
        let stream = StreamInfo::from_initial_info(StreamFormat::Avc, &info, 0, (0, 0)).unwrap();
        assert_eq!(stream.crop, info.crop);

        // Aligned content has no implicit crop.
        let info = progressive_info(640, 480, 2);
        let stream = StreamInfo::from_initial_info(StreamFormat::Vp8, &info, 0, (0, 0)).unwrap();
        assert!(stream.crop.is_empty());
    }

    #[test]
    fn jpeg_scale_down() {
        let info = progressive_info(1280, 720, 1);
        let stream = StreamInfo::from_initial_info(StreamFormat::Mjpg, &info, 0, (1, 2)).unwrap();
        assert_eq!(stream.display_resolution, Resolution::new(640, 180));
        assert_eq!(stream.coded_resolution, Resolution::new(640, 192));
    }

    #[test]
    fn empty_picture_is_rejected() {
        let info = progressive_info(0, 480, 2);
        assert!(matches!(
            StreamInfo::from_initial_info(StreamFormat::Avc, &info, 2, (0, 0)),
            Err(NegotiateError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn escape_sequence_is_restored_on_failure() {
        let mut vpu = SimulatedVpu::new(PhysicalBus::new(), progressive_info(320, 240, 2))
            .with_failing_initial_info();
        open(&mut vpu, StreamFormat::Avc);
        assert!(matches!(
            negotiate(&mut vpu, StreamFormat::Avc, 2, (0, 0)),
            Err(NegotiateError::InitialInfo(_))
        ));
        assert_eq!(vpu.journal().escape_sequence_init, vec![true, false]);
    }

    #[test]
    fn negotiate_with_simulated_decoder() {
        let mut vpu = SimulatedVpu::new(PhysicalBus::new(), progressive_info(320, 240, 3));
        open(&mut vpu, StreamFormat::H263);
        let stream = negotiate(&mut vpu, StreamFormat::H263, 1, (0, 0)).unwrap();
        assert_eq!(stream.buffer_count, 4);
        assert_eq!(stream.min_buffer_count, 3);
        assert_eq!(stream.slice_buffer_size, 0);
    }
}
