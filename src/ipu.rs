// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One-shot tasks on the image processing unit (IPU).
//!
//! An [`IpuTask`] describes a complete conversion: input and output geometry and pixel format,
//! cropping, rotation, deinterlacing and an optional overlay. [`IpuTaskDriver::submit`] sets up
//! the buffers the task needs, gets the task accepted by the device, runs it and hands the result
//! to a display surface or a writer. Nothing is kept between two submissions.

pub mod dummy;

use std::io::Write;

use enumn::N;
use thiserror::Error;

use crate::display::DisplayError;
use crate::display::DisplaySurface;
use crate::display::SurfaceConfig;
use crate::image_processing::i420_size;
use crate::memory::DmaBuffer;
use crate::memory::MemoryError;
use crate::utils::page_align;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// Pixel formats understood by the IPU, identified by their fourcc.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum IpuPixelFormat {
    Rgb565 = fourcc(b"RGBP"),
    Bgr24 = fourcc(b"BGR3"),
    Rgb24 = fourcc(b"RGB3"),
    Bgr32 = fourcc(b"BGR4"),
    Bgra32 = fourcc(b"BGRA"),
    Rgb32 = fourcc(b"RGB4"),
    Rgba32 = fourcc(b"RGBA"),
    Abgr32 = fourcc(b"ABGR"),
    Yuyv = fourcc(b"YUYV"),
    Uyvy = fourcc(b"UYVY"),
    Yuv422P = fourcc(b"422P"),
    Yvu422P = fourcc(b"YV16"),
    Yuv444 = fourcc(b"Y444"),
    Yuv444P = fourcc(b"444P"),
    Yuv420P = fourcc(b"I420"),
    Yvu420P = fourcc(b"YV12"),
    Yuv420P2 = fourcc(b"YU12"),
    Nv12 = fourcc(b"NV12"),
    TiledNv12 = fourcc(b"TNVP"),
    /// Tiled NV12 with both fields stored separately.
    TiledNv12F = fourcc(b"TNVF"),
    Grey = fourcc(b"GREY"),
}

impl IpuPixelFormat {
    pub fn fourcc(self) -> u32 {
        self as u32
    }

    pub fn bits_per_pixel(self) -> u32 {
        use IpuPixelFormat::*;

        match self {
            Rgb565 | Yuyv | Uyvy | Yuv422P | Yvu422P => 16,
            Bgr24 | Rgb24 | Yuv444 | Yuv444P => 24,
            Bgr32 | Bgra32 | Rgb32 | Rgba32 | Abgr32 => 32,
            Yuv420P | Yvu420P | Yuv420P2 | Nv12 | TiledNv12 => 12,
            TiledNv12F | Grey => 8,
        }
    }

    /// Size of a `width`x`height` picture in this format.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            IpuPixelFormat::TiledNv12F => (page_align(pixels / 2) + page_align(pixels / 4)) * 2,
            IpuPixelFormat::Yuv420P | IpuPixelFormat::Yvu420P | IpuPixelFormat::Yuv420P2 => {
                i420_size(width as usize, height as usize)
            }
            _ => pixels * self.bits_per_pixel() as usize / 8,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: IpuPixelFormat,
    pub crop: Crop,
}

impl ImageDesc {
    /// Describes a whole `width`x`height` picture.
    pub fn new(width: u32, height: u32, format: IpuPixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            crop: Crop {
                x: 0,
                y: 0,
                w: width,
                h: height,
            },
        }
    }

    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

/// Rotation and flipping applied by the IPU, in the driver's encoding.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum IpuRotation {
    #[default]
    None = 0,
    VerticalFlip = 1,
    HorizontalFlip = 2,
    Rotate180 = 3,
    Rotate90Right = 4,
    Rotate90RightVerticalFlip = 5,
    Rotate90RightHorizontalFlip = 6,
    Rotate90Left = 7,
}

/// Motion setting of the deinterlacer. Anything but high motion also reads the next field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Motion {
    Medium,
    Low,
    High,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Alpha {
    /// Same alpha for the whole overlay.
    Global(u8),
    /// Per-pixel alpha plane.
    Local,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Overlay {
    pub image: ImageDesc,
    pub alpha: Alpha,
    pub color_key: Option<u32>,
}

/// A complete IPU conversion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IpuTask {
    pub input: ImageDesc,
    pub output: ImageDesc,
    pub rotation: IpuRotation,
    pub deinterlace: Option<Motion>,
    pub overlay: Option<Overlay>,
}

impl IpuTask {
    pub fn new(input: ImageDesc, output: ImageDesc) -> Self {
        Self {
            input,
            output,
            rotation: IpuRotation::None,
            deinterlace: None,
            overlay: None,
        }
    }

    fn needs_next_field(&self) -> bool {
        matches!(self.deinterlace, Some(m) if m != Motion::High)
    }
}

/// Verdict of the device on a task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckResult {
    Ok,
    /// The task has to be split and the input crop is too wide for that.
    SplitInputWidthOver,
    SplitInputHeightOver,
    SplitOutputWidthOver,
    SplitOutputHeightOver,
    Failed(i32),
}

/// Physical addresses of the buffers of a queued task.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskBuffers {
    pub input: u64,
    /// Next field, for motion-adaptive deinterlacing.
    pub input_next: Option<u64>,
    pub overlay: Option<u64>,
    pub local_alpha: Option<u64>,
    pub output: u64,
}

#[derive(Error, Debug)]
pub enum IpuError {
    #[error("task rejected by the IPU with code {0}")]
    CheckFailed(i32),
    #[error("cannot shrink the crop any further to split the task")]
    CropExhausted,
    #[error("input is {len} bytes, expected {expected}")]
    InputTooShort { len: usize, expected: usize },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Display(#[from] DisplayError),
    #[error("failed to write the output: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Device(#[from] anyhow::Error),
}

/// Interface to an IPU.
pub trait IpuDevice {
    /// Allocates contiguous memory the IPU can access.
    fn allocate(&self, size: usize) -> Result<DmaBuffer, MemoryError>;

    fn check_task(&mut self, task: &IpuTask) -> Result<CheckResult, IpuError>;

    /// Runs `task` to completion.
    fn queue_task(&mut self, task: &IpuTask, buffers: &TaskBuffers) -> Result<(), IpuError>;
}

/// Where the result of a task goes.
pub enum OutputTarget<'a> {
    Display(&'a mut dyn DisplaySurface),
    Writer(&'a mut dyn Write),
}

/// Fills `buffer` with four horizontal bands of increasing intensity.
fn fill_bands(buffer: &mut DmaBuffer) {
    let mut mapping = buffer.map_mut();
    let quarter = mapping.len() / 4;
    for (i, value) in [0x00, 0x55, 0xaa, 0xff].into_iter().enumerate() {
        let end = if i == 3 { mapping.len() } else { (i + 1) * quarter };
        mapping[i * quarter..end].fill(value);
    }
}

/// Runs [`IpuTask`]s on an [`IpuDevice`].
pub struct IpuTaskDriver<D: IpuDevice> {
    device: D,
}

impl<D: IpuDevice> IpuTaskDriver<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Asks the device to validate `task`, shrinking its crops by 8 pixels whenever they prevent
    /// the task from being split.
    fn check(&mut self, task: &mut IpuTask) -> Result<u32, IpuError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let crop = match self.device.check_task(task)? {
                CheckResult::Ok => return Ok(attempts),
                CheckResult::Failed(code) => return Err(IpuError::CheckFailed(code)),
                CheckResult::SplitInputWidthOver => &mut task.input.crop.w,
                CheckResult::SplitInputHeightOver => &mut task.input.crop.h,
                CheckResult::SplitOutputWidthOver => &mut task.output.crop.w,
                CheckResult::SplitOutputHeightOver => &mut task.output.crop.h,
            };
            if *crop <= 8 {
                return Err(IpuError::CropExhausted);
            }
            *crop -= 8;
        }
    }

    /// Converts `input` according to `task` and sends the result to `target`.
    ///
    /// Returns the task as it has been run, which may have smaller crops than the one passed.
    pub fn submit(
        &mut self,
        task: &IpuTask,
        input: &[u8],
        target: OutputTarget<'_>,
    ) -> Result<IpuTask, IpuError> {
        let mut task = *task;
        let input_size = task.input.frame_size();
        if input.len() < input_size {
            return Err(IpuError::InputTooShort {
                len: input.len(),
                expected: input_size,
            });
        }

        let mut input_buffer = self.device.allocate(input_size)?;
        let mut next_field_buffer = if task.needs_next_field() {
            Some(self.device.allocate(input_size)?)
        } else {
            None
        };

        let mut overlay_buffers = None;
        if let Some(overlay) = &task.overlay {
            let mut image = self.device.allocate(overlay.image.frame_size())?;
            fill_bands(&mut image);
            let alpha = match overlay.alpha {
                Alpha::Local => {
                    let mut alpha = self.device.allocate(
                        overlay.image.width as usize * overlay.image.height as usize,
                    )?;
                    fill_bands(&mut alpha);
                    Some(alpha)
                }
                Alpha::Global(_) => None,
            };
            overlay_buffers = Some((image, alpha));
        }

        let output_size = task.output.frame_size();
        let mut target = target;
        let (output_buffer, output_phys) = match &mut target {
            OutputTarget::Display(surface) => {
                let phys = surface.configure(&SurfaceConfig {
                    width: task.output.width,
                    height: task.output.height,
                    bits_per_pixel: task.output.format.bits_per_pixel(),
                    nonstd: task.output.format.fourcc(),
                })?;
                (None, phys)
            }
            OutputTarget::Writer(_) => {
                let buffer = self.device.allocate(output_size)?;
                let phys = buffer.phys_addr();
                (Some(buffer), phys)
            }
        };

        let attempts = self.check(&mut task)?;
        log::debug!("IPU task accepted after {} checks: {:?}", attempts, task);

        input_buffer.write_at(0, &input[..input_size])?;
        if let Some(buffer) = next_field_buffer.as_mut() {
            buffer.write_at(0, &input[..input_size])?;
        }

        let buffers = TaskBuffers {
            input: input_buffer.phys_addr(),
            input_next: next_field_buffer.as_ref().map(|b| b.phys_addr()),
            overlay: overlay_buffers.as_ref().map(|(image, _)| image.phys_addr()),
            local_alpha: overlay_buffers
                .as_ref()
                .and_then(|(_, alpha)| alpha.as_ref().map(|a| a.phys_addr())),
            output: output_phys,
        };
        self.device.queue_task(&task, &buffers)?;

        match target {
            OutputTarget::Display(surface) => surface.pan()?,
            OutputTarget::Writer(writer) => {
                if let Some(buffer) = &output_buffer {
                    writer.write_all(&buffer.map()[..output_size])?;
                }
            }
        }

        Ok(task)
    }
}
