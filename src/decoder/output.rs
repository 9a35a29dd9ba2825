// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Delivery of decoded pictures.
//!
//! The [`Dispatcher`] reads a displayed frame buffer, turns it into a packed I420 picture (or the
//! raw JPEG planes) and hands it to an [`OutputSink`]. Detiling, chroma deinterleaving and
//! cropping are applied as independent steps, depending on the session configuration.

use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use crate::backend::TiledPlane;
use crate::backend::VpuBackend;
use crate::codec::JpegSourceFormat;
use crate::codec::StreamFormat;
use crate::config::DecoderConfig;
use crate::decoder::negotiate::StreamInfo;
use crate::decoder::pool::FrameBuffer;
use crate::display::DisplayError;
use crate::display::DisplaySurface;
use crate::display::SurfaceConfig;
use crate::image_processing::crop_i420;
use crate::image_processing::i420_size;
use crate::image_processing::nv12_to_i420;
use crate::ipu::IpuDevice;
use crate::ipu::IpuError;
use crate::ipu::IpuPixelFormat;
use crate::ipu::IpuTask;
use crate::ipu::IpuTaskDriver;
use crate::ipu::OutputTarget;
use crate::Rect;
use crate::Rotation;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("failed to write picture: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Display(#[from] DisplayError),
    #[error(transparent)]
    Ipu(#[from] IpuError),
    #[error("tiled address {addr:#x} is outside of the frame buffer")]
    TiledAddress { addr: u64 },
    #[error("frame buffer of {size} bytes is smaller than the {expected} bytes picture")]
    ShortBuffer { size: usize, expected: usize },
    #[error("dispatcher used before the stream geometry is known")]
    NotPrepared,
}

/// Geometry of the pictures a sink receives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    /// Size of every delivered picture, in bytes.
    pub frame_size: usize,
}

/// Destination of decoded pictures. Selected when the session is created and kept until it is
/// dropped.
pub trait OutputSink {
    /// Called before the first picture, and again if the delivered geometry changes.
    fn configure(&mut self, _geometry: &FrameGeometry) -> Result<(), OutputError> {
        Ok(())
    }

    fn deliver(&mut self, picture: &[u8]) -> Result<(), OutputError>;

    /// Called when a decoding run ends.
    fn finish(&mut self) -> Result<(), OutputError> {
        Ok(())
    }
}

/// Writes pictures back to back, e.g. into a raw YUV file.
pub struct WriterSink<W: Write> {
    writer: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> OutputSink for WriterSink<W> {
    fn deliver(&mut self, picture: &[u8]) -> Result<(), OutputError> {
        self.writer.write_all(picture)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Default)]
struct Collected {
    geometry: Option<FrameGeometry>,
    frames: Vec<Vec<u8>>,
}

/// Keeps every picture in memory. Clones share the same storage, so a clone can be kept to
/// inspect what a session delivered.
#[derive(Clone, Default)]
pub struct BufferSink(Arc<Mutex<Collected>>);

impl BufferSink {
    pub fn new() -> Self {
        Default::default()
    }

    fn collected(&self) -> std::sync::MutexGuard<'_, Collected> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.collected().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.collected().frames.clone()
    }

    pub fn geometry(&self) -> Option<FrameGeometry> {
        self.collected().geometry
    }

    /// CRC32 of every picture received so far.
    pub fn checksums(&self) -> Vec<u32> {
        self.collected()
            .frames
            .iter()
            .map(|f| crc32fast::hash(f))
            .collect()
    }
}

impl OutputSink for BufferSink {
    fn configure(&mut self, geometry: &FrameGeometry) -> Result<(), OutputError> {
        self.collected().geometry = Some(*geometry);
        Ok(())
    }

    fn deliver(&mut self, picture: &[u8]) -> Result<(), OutputError> {
        self.collected().frames.push(picture.to_vec());
        Ok(())
    }
}

/// Shows every picture on a display surface.
pub struct FramebufferSink<D: DisplaySurface> {
    surface: D,
}

impl<D: DisplaySurface> FramebufferSink<D> {
    pub fn new(surface: D) -> Self {
        Self { surface }
    }

    pub fn surface(&self) -> &D {
        &self.surface
    }
}

impl<D: DisplaySurface> OutputSink for FramebufferSink<D> {
    fn configure(&mut self, geometry: &FrameGeometry) -> Result<(), OutputError> {
        let phys = self.surface.configure(&SurfaceConfig {
            width: geometry.width,
            height: geometry.height,
            bits_per_pixel: IpuPixelFormat::Yuv420P.bits_per_pixel(),
            nonstd: IpuPixelFormat::Yuv420P.fourcc(),
        })?;
        log::debug!(
            "display configured for {}x{} at {:#x}",
            geometry.width,
            geometry.height,
            phys
        );
        Ok(())
    }

    fn deliver(&mut self, picture: &[u8]) -> Result<(), OutputError> {
        self.surface.write(picture)?;
        self.surface.pan()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), OutputError> {
        self.surface.blank(true)?;
        Ok(())
    }
}

/// Where an [`IpuSink`] sends the converted pictures.
pub enum IpuTarget {
    Display(Box<dyn DisplaySurface>),
    Writer(Box<dyn Write>),
}

/// Runs every picture through an IPU task, e.g. to scale or rotate it for a display.
///
/// The input side of `task` is replaced by the geometry of the delivered pictures when the sink
/// is configured.
pub struct IpuSink<D: IpuDevice> {
    driver: IpuTaskDriver<D>,
    task: IpuTask,
    target: IpuTarget,
}

impl<D: IpuDevice> IpuSink<D> {
    pub fn new(device: D, task: IpuTask, target: IpuTarget) -> Self {
        Self {
            driver: IpuTaskDriver::new(device),
            task,
            target,
        }
    }

    pub fn driver(&self) -> &IpuTaskDriver<D> {
        &self.driver
    }

    pub fn task(&self) -> &IpuTask {
        &self.task
    }
}

impl<D: IpuDevice> OutputSink for IpuSink<D> {
    fn configure(&mut self, geometry: &FrameGeometry) -> Result<(), OutputError> {
        let crop = &mut self.task.input.crop;
        crop.x = 0;
        crop.y = 0;
        crop.w = geometry.width;
        crop.h = geometry.height;
        self.task.input.width = geometry.width;
        self.task.input.height = geometry.height;
        self.task.input.format = IpuPixelFormat::Yuv420P;
        Ok(())
    }

    fn deliver(&mut self, picture: &[u8]) -> Result<(), OutputError> {
        let target = match &mut self.target {
            IpuTarget::Display(surface) => OutputTarget::Display(surface.as_mut()),
            IpuTarget::Writer(writer) => OutputTarget::Writer(writer.as_mut()),
        };
        self.driver.submit(&self.task, picture, target)?;
        Ok(())
    }
}

/// What is known about the pictures of the current stream.
#[derive(Copy, Clone, Debug)]
struct PictureLayout {
    stride: u32,
    height: u32,
    jpeg_source_format: JpegSourceFormat,
}

/// Turns displayed frame buffers into pictures for an [`OutputSink`].
pub struct Dispatcher {
    sink: Box<dyn OutputSink>,
    still_picture: bool,
    chroma_interleave: bool,
    untile: bool,
    rotation: Rotation,
    layout: Option<PictureLayout>,
    geometry: Option<FrameGeometry>,
    scratch: Vec<u8>,
}

impl Dispatcher {
    pub fn new(config: &DecoderConfig, sink: Box<dyn OutputSink>) -> Self {
        Self {
            sink,
            still_picture: config.format == StreamFormat::Mjpg,
            chroma_interleave: config.chroma_interleave,
            untile: config.map_type.is_tiled() && !config.tiled_to_linear,
            rotation: if config.rotation_enabled {
                config.rotation
            } else {
                Rotation::None
            },
            layout: None,
            geometry: None,
            scratch: Vec::new(),
        }
    }

    /// Sets up the dispatcher for the pictures of `stream`.
    pub fn prepare(&mut self, stream: &StreamInfo) {
        self.layout = Some(PictureLayout {
            stride: stream.stride,
            height: stream.coded_resolution.height,
            jpeg_source_format: stream.jpeg_source_format,
        });
        self.geometry = None;
    }

    /// Size of the pictures as laid out by the post-processing path.
    fn picture_size(&self, layout: &PictureLayout) -> (usize, usize) {
        let (w, h) = (layout.stride as usize, layout.height as usize);
        if self.rotation.is_transposing() {
            (h, w)
        } else {
            (w, h)
        }
    }

    /// Size of the picture stored in a frame buffer.
    fn image_size(&self, layout: &PictureLayout) -> usize {
        let luma_size = layout.stride as usize * layout.height as usize;
        if self.still_picture {
            layout.jpeg_source_format.frame_size(luma_size)
        } else {
            luma_size * 3 / 2
        }
    }

    /// Copies the tiled picture of `buffer` into a linear I420 picture.
    fn untile<B: VpuBackend + ?Sized>(
        &mut self,
        backend: &B,
        buffer: &FrameBuffer,
        width: usize,
        height: usize,
    ) -> Result<(), OutputError> {
        let mapping = buffer.memory().map();
        let base = buffer.memory().phys_addr();
        let block = |plane: TiledPlane, x: usize, y: usize| {
            let addr = backend.tiled_address(buffer.desc(), plane, x as u32, y as u32);
            addr.checked_sub(base)
                .map(|offset| offset as usize)
                .and_then(|offset| mapping.get(offset..offset + 8))
                .ok_or(OutputError::TiledAddress { addr })
        };

        self.scratch.clear();
        self.scratch.resize(i420_size(width, height), 0);
        let (luma, chroma) = self.scratch.split_at_mut(width * height);
        let (cb, cr) = chroma.split_at_mut(width * height / 4);

        for y in 0..height {
            for x in (0..width).step_by(8) {
                let len = 8.min(width - x);
                let row = y * width + x;
                luma[row..row + len].copy_from_slice(&block(TiledPlane::Luma, x, y)?[..len]);
            }
        }

        for y in 0..height / 2 {
            for x in (0..width).step_by(8) {
                let src = block(TiledPlane::Chroma, x, y)?;
                let row = y * (width / 2) + x / 2;
                for (i, pair) in src.chunks_exact(2).enumerate() {
                    if let (Some(u), Some(v)) = (cb.get_mut(row + i), cr.get_mut(row + i)) {
                        *u = pair[0];
                        *v = pair[1];
                    }
                }
            }
        }

        Ok(())
    }

    /// Reconfigures the sink if the pictures about to be delivered have a new geometry.
    fn configure_sink(
        &mut self,
        width: usize,
        height: usize,
        frame_size: usize,
    ) -> Result<(), OutputError> {
        let geometry = FrameGeometry {
            width: width as u32,
            height: height as u32,
            frame_size,
        };
        if self.geometry != Some(geometry) {
            self.sink.configure(&geometry)?;
            self.geometry = Some(geometry);
        }
        Ok(())
    }

    fn deliver_scratch(&mut self, width: usize, height: usize) -> Result<usize, OutputError> {
        let size = self.scratch.len();
        self.configure_sink(width, height, size)?;
        self.sink.deliver(&self.scratch)?;
        Ok(size)
    }

    /// Outputs the picture held by `buffer`, restricted to `crop` unless it is empty.
    ///
    /// Returns the number of bytes delivered to the sink.
    pub fn dispatch<B: VpuBackend + ?Sized>(
        &mut self,
        backend: &B,
        buffer: &FrameBuffer,
        crop: Rect,
    ) -> Result<usize, OutputError> {
        let layout = self.layout.ok_or(OutputError::NotPrepared)?;
        let (width, height) = self.picture_size(&layout);

        // Detiled pictures are always output whole.
        if buffer.is_tiled() && self.untile {
            self.untile(backend, buffer, width, height)?;
            return self.deliver_scratch(width, height);
        }

        let image_size = self.image_size(&layout);
        let size = buffer.memory().size();
        if size < image_size {
            return Err(OutputError::ShortBuffer {
                size,
                expected: image_size,
            });
        }

        if self.still_picture || (!self.chroma_interleave && crop.is_empty()) {
            self.configure_sink(width, height, image_size)?;
            let mapping = buffer.memory().map();
            self.sink.deliver(&mapping[..image_size])?;
            return Ok(image_size);
        }

        self.scratch.clear();
        {
            let mapping = buffer.memory().map();
            if self.chroma_interleave {
                self.scratch.resize(image_size, 0);
                nv12_to_i420(&mapping[..image_size], &mut self.scratch, width, height);
            } else {
                self.scratch.extend_from_slice(&mapping[..image_size]);
            }
        }

        if crop.is_empty() {
            return self.deliver_scratch(width, height);
        }

        self.scratch = crop_i420(&self.scratch, width, height, crop);
        let crop_width = (crop.width() as usize).min(width.saturating_sub(crop.left as usize));
        let crop_height = (crop.height() as usize).min(height.saturating_sub(crop.top as usize));
        self.deliver_scratch(crop_width, crop_height)
    }

    pub fn finish(&mut self) -> Result<(), OutputError> {
        self.sink.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::dummy::progressive_info;
    use crate::backend::dummy::SimulatedVpu;
    use crate::backend::BufferInfo;
    use crate::backend::OpenParams;
    use crate::config::BitstreamMode;
    use crate::decoder::pool::FrameBufferPool;
    use crate::decoder::pool::PoolOptions;
    use crate::display::dummy::SimulatedDisplay;
    use crate::ipu::dummy::SimulatedIpu;
    use crate::ipu::ImageDesc;
    use crate::memory::heap::HeapAllocator;
    use crate::MapType;

    const WIDTH: u32 = 32;
    const HEIGHT: u32 = 16;

    struct Fixture {
        allocator: HeapAllocator,
        vpu: SimulatedVpu,
        pool: FrameBufferPool,
        stream: StreamInfo,
    }

    /// Sets up a pool of 32x16 frame buffers.
    fn fixture(config: &DecoderConfig) -> Fixture {
        let allocator = HeapAllocator::default();
        let info = progressive_info(WIDTH, HEIGHT, 1);
        let stream = StreamInfo::from_initial_info(config.format, &info, 0, (0, 0)).unwrap();
        let mut vpu = SimulatedVpu::new(allocator.bus().clone(), info);
        vpu.open(&OpenParams {
            format: config.format,
            bitstream_phys: 0x1000,
            bitstream_size: 0x1000,
            reorder: true,
            deblocking: false,
            chroma_interleave: config.chroma_interleave,
            map_type: config.map_type,
            tiled_to_linear: config.tiled_to_linear,
            bitstream_mode: BitstreamMode::Normal,
            jpeg_line_buffer: false,
            ps_save_buffer: None,
        })
        .unwrap();
        let pool = FrameBufferPool::allocate(
            &mut vpu,
            &allocator,
            &stream,
            &PoolOptions {
                map_type: config.map_type,
                tiled_to_linear: config.tiled_to_linear,
                post_processing: false,
                deblocking: false,
            },
            &BufferInfo::default(),
        )
        .unwrap();

        Fixture {
            allocator,
            vpu,
            pool,
            stream,
        }
    }

    /// Writes a luma plane whose samples are their column number into buffer 0, followed by
    /// either interleaved (0x40 + column, 0xc0 + column) chroma pairs or flat 0x40 / 0xc0 planes.
    fn paint_gradient(fixture: &Fixture, interleaved: bool) {
        let w = WIDTH as usize;
        let h = HEIGHT as usize;
        let mut picture = Vec::new();
        for _ in 0..h {
            picture.extend((0..w).map(|x| x as u8));
        }
        if interleaved {
            for _ in 0..h / 2 {
                for x in 0..w / 2 {
                    picture.push(0x40 + x as u8);
                    picture.push(0xc0 + x as u8);
                }
            }
        } else {
            picture.extend(std::iter::repeat(0x40).take(w * h / 4));
            picture.extend(std::iter::repeat(0xc0).take(w * h / 4));
        }
        let desc = fixture.pool.get(0).unwrap().desc();
        fixture.allocator.bus().write(desc.y, &picture).unwrap();
    }

    #[test]
    fn planar_pictures_are_delivered_whole() {
        let config = DecoderConfig::new(StreamFormat::Mpeg2);
        let fixture = fixture(&config);
        paint_gradient(&fixture, false);
        let sink = BufferSink::new();
        let mut dispatcher = Dispatcher::new(&config, Box::new(sink.clone()));
        dispatcher.prepare(&fixture.stream);

        let size = dispatcher
            .dispatch(&fixture.vpu, fixture.pool.get(0).unwrap(), Rect::default())
            .unwrap();

        assert_eq!(size, 32 * 16 * 3 / 2);
        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..4], &[0, 1, 2, 3]);
        assert_eq!(
            sink.geometry(),
            Some(FrameGeometry {
                width: 32,
                height: 16,
                frame_size: size
            })
        );
    }

    #[test]
    fn interleaved_chroma_is_split() {
        let mut config = DecoderConfig::new(StreamFormat::Mpeg2);
        config.chroma_interleave = true;
        let fixture = fixture(&config);
        paint_gradient(&fixture, true);
        let sink = BufferSink::new();
        let mut dispatcher = Dispatcher::new(&config, Box::new(sink.clone()));
        dispatcher.prepare(&fixture.stream);

        dispatcher
            .dispatch(&fixture.vpu, fixture.pool.get(0).unwrap(), Rect::default())
            .unwrap();

        let frame = &sink.frames()[0];
        let y_size = 32 * 16;
        assert_eq!(&frame[y_size..y_size + 3], &[0x40, 0x41, 0x42]);
        assert_eq!(&frame[y_size * 5 / 4..y_size * 5 / 4 + 3], &[0xc0, 0xc1, 0xc2]);
    }

    #[test]
    fn cropping_after_deinterleaving() {
        let mut config = DecoderConfig::new(StreamFormat::Mpeg2);
        config.chroma_interleave = true;
        let fixture = fixture(&config);
        paint_gradient(&fixture, true);
        let sink = BufferSink::new();
        let mut dispatcher = Dispatcher::new(&config, Box::new(sink.clone()));
        dispatcher.prepare(&fixture.stream);

        let size = dispatcher
            .dispatch(
                &fixture.vpu,
                fixture.pool.get(0).unwrap(),
                Rect::new(8, 0, 24, 8),
            )
            .unwrap();

        assert_eq!(size, 16 * 8 * 3 / 2);
        let frame = &sink.frames()[0];
        assert_eq!(&frame[..3], &[8, 9, 10]);
        // U plane starts at chroma column 4.
        assert_eq!(frame[16 * 8], 0x44);
        assert_eq!(frame[16 * 8 + 32], 0xc4);
        assert_eq!(sink.geometry().unwrap().width, 16);
    }

    #[test]
    fn tiled_pictures_are_untiled() {
        let mut config = DecoderConfig::new(StreamFormat::Mpeg2);
        config.map_type = MapType::TiledFrame;
        let config = config.normalized();
        let fixture = fixture(&config);
        assert!(fixture.pool.get(0).unwrap().is_tiled());
        let desc = *fixture.pool.get(0).unwrap().desc();
        let luma: Vec<u8> = (0..32 * 16).map(|i| (i % 32) as u8).collect();
        let chroma: Vec<u8> = (0..32 * 8)
            .map(|i| if i % 2 == 0 { 0x40 } else { 0xc0 })
            .collect();
        let bus = fixture.allocator.bus();
        bus.write(desc.y, &luma).unwrap();
        bus.write(desc.cb, &chroma).unwrap();

        let sink = BufferSink::new();
        let mut dispatcher = Dispatcher::new(&config, Box::new(sink.clone()));
        dispatcher.prepare(&fixture.stream);
        let size = dispatcher
            .dispatch(&fixture.vpu, fixture.pool.get(0).unwrap(), Rect::new(0, 0, 8, 8))
            .unwrap();

        // Detiled pictures are never cropped.
        assert_eq!(size, 32 * 16 * 3 / 2);
        let frame = &sink.frames()[0];
        assert_eq!(&frame[..32], &luma[..32]);
        assert!(frame[32 * 16..32 * 16 + 128].iter().all(|&b| b == 0x40));
        assert!(frame[32 * 16 + 128..].iter().all(|&b| b == 0xc0));
    }

    #[test]
    fn jpeg_pictures_are_delivered_with_their_planes() {
        let config = DecoderConfig::new(StreamFormat::Mjpg);
        let fixture = fixture(&config);
        let sink = BufferSink::new();
        let mut dispatcher = Dispatcher::new(&config, Box::new(sink.clone()));
        dispatcher.prepare(&fixture.stream);

        let size = dispatcher
            .dispatch(
                &fixture.vpu,
                fixture.pool.get(0).unwrap(),
                Rect::new(0, 0, 8, 8),
            )
            .unwrap();
        assert_eq!(size, 32 * 16 * 3 / 2);
        assert_eq!(sink.frames()[0].len(), size);
    }

    #[test]
    fn rotated_pictures_have_swapped_dimensions() {
        let mut config = DecoderConfig::new(StreamFormat::Mpeg2);
        config.rotation_enabled = true;
        config.rotation = Rotation::Rotate90;
        let fixture = fixture(&config);
        let sink = BufferSink::new();
        let mut dispatcher = Dispatcher::new(&config, Box::new(sink.clone()));
        dispatcher.prepare(&fixture.stream);

        dispatcher
            .dispatch(&fixture.vpu, fixture.pool.get(0).unwrap(), Rect::default())
            .unwrap();
        let geometry = sink.geometry().unwrap();
        assert_eq!((geometry.width, geometry.height), (16, 32));
    }

    #[test]
    fn framebuffer_sink_pans_every_picture() {
        let allocator = HeapAllocator::default();
        let display = SimulatedDisplay::new(Arc::new(allocator));
        let mut sink = FramebufferSink::new(display);
        sink.configure(&FrameGeometry {
            width: 4,
            height: 4,
            frame_size: 24,
        })
        .unwrap();
        sink.deliver(&[7u8; 24]).unwrap();
        sink.deliver(&[9u8; 24]).unwrap();
        sink.finish().unwrap();

        let display = sink.surface();
        assert_eq!(display.pans(), 2);
        assert_eq!(display.contents(), vec![9u8; 24]);
        assert_eq!(display.config().unwrap().bits_per_pixel, 12);
        assert!(display.is_blanked());
    }

    #[test]
    fn ipu_sink_converts_every_picture() {
        let allocator = HeapAllocator::default();
        let output: Vec<u8> = Vec::new();
        let task = IpuTask::new(
            ImageDesc::new(0, 0, IpuPixelFormat::Yuv420P),
            ImageDesc::new(8, 8, IpuPixelFormat::Yuv420P),
        );
        let mut sink = IpuSink::new(
            SimulatedIpu::new(allocator),
            task,
            IpuTarget::Writer(Box::new(output)),
        );
        sink.configure(&FrameGeometry {
            width: 8,
            height: 8,
            frame_size: 96,
        })
        .unwrap();
        sink.deliver(&[3u8; 96]).unwrap();

        assert_eq!(sink.task().input.width, 8);
        assert_eq!(sink.task().input.crop.h, 8);
        assert_eq!(sink.driver().device().queued().len(), 1);
    }

    #[test]
    fn odd_crops_reach_the_ipu() {
        let config = DecoderConfig::new(StreamFormat::Vp8);
        let fixture = fixture(&config);
        paint_gradient(&fixture, false);
        let task = IpuTask::new(
            ImageDesc::new(0, 0, IpuPixelFormat::Yuv420P),
            ImageDesc::new(16, 8, IpuPixelFormat::Yuv420P),
        );
        let sink = IpuSink::new(
            SimulatedIpu::new(HeapAllocator::default()),
            task,
            IpuTarget::Writer(Box::new(Vec::<u8>::new())),
        );
        let mut dispatcher = Dispatcher::new(&config, Box::new(sink));
        dispatcher.prepare(&fixture.stream);

        let size = dispatcher
            .dispatch(&fixture.vpu, fixture.pool.get(0).unwrap(), Rect::new(0, 0, 15, 7))
            .unwrap();
        assert_eq!(size, 15 * 7 + 2 * 8 * 4);

        dispatcher
            .dispatch(&fixture.vpu, fixture.pool.get(0).unwrap(), Rect::new(0, 0, 15, 7))
            .unwrap();
    }

    #[test]
    fn checksums_identify_pictures() {
        let mut sink = BufferSink::new();
        sink.deliver(&[1, 2, 3]).unwrap();
        sink.deliver(&[1, 2, 3]).unwrap();
        sink.deliver(&[3, 2, 1]).unwrap();
        let sums = sink.checksums();
        assert_eq!(sums[0], sums[1]);
        assert_ne!(sums[0], sums[2]);
        assert_eq!(sums[0], crc32fast::hash(&[1, 2, 3]));
    }
}
