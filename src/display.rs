// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Display surfaces decoded or converted pictures can be shown on.
//!
//! [`FramebufferDevice`] drives a Linux framebuffer (`/dev/fbN`) through its screen info ioctls.
//! The [`dummy`] surface keeps the picture in simulated contiguous memory instead.

pub mod dummy;

use std::fs::File;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::slice;

use nix::errno::Errno;
use nix::ioctl_read_bad;
use nix::ioctl_write_int_bad;
use nix::ioctl_write_ptr_bad;
use nix::libc;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use thiserror::Error;

use crate::memory::MemoryError;

/// Number of framebuffer nodes probed when looking a device up by name.
const MAX_FRAMEBUFFERS: usize = 5;

// Defined in include/uapi/linux/fb.h
const FBIOGET_VSCREENINFO: u32 = 0x4600;
const FBIOPUT_VSCREENINFO: u32 = 0x4601;
const FBIOGET_FSCREENINFO: u32 = 0x4602;
const FBIOPAN_DISPLAY: u32 = 0x4606;
const FBIOBLANK: u32 = 0x4611;
const FB_ACTIVATE_FORCE: u32 = 128;
const FB_VMODE_YWRAP: u32 = 256;
const FB_BLANK_UNBLANK: libc::c_int = 0;
const FB_BLANK_POWERDOWN: libc::c_int = 4;

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
struct fb_bitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
struct fb_var_screeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: fb_bitfield,
    green: fb_bitfield,
    blue: fb_bitfield,
    transp: fb_bitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
struct fb_fix_screeninfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    type_: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

impl fb_fix_screeninfo {
    fn id(&self) -> &[u8] {
        let len = self.id.iter().position(|&c| c == 0).unwrap_or(self.id.len());
        &self.id[..len]
    }
}

ioctl_read_bad!(fbioget_vscreeninfo, FBIOGET_VSCREENINFO, fb_var_screeninfo);
ioctl_write_ptr_bad!(fbioput_vscreeninfo, FBIOPUT_VSCREENINFO, fb_var_screeninfo);
ioctl_read_bad!(fbioget_fscreeninfo, FBIOGET_FSCREENINFO, fb_fix_screeninfo);
ioctl_write_ptr_bad!(fbiopan_display, FBIOPAN_DISPLAY, fb_var_screeninfo);
ioctl_write_int_bad!(fbioblank, FBIOBLANK);

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("no framebuffer named {0:?}")]
    NotFound(String),
    #[error("{operation} failed: {source}")]
    Ioctl {
        operation: &'static str,
        source: nix::Error,
    },
    #[error("failed to map the framebuffer: {0}")]
    Map(nix::Error),
    #[error("the surface has not been configured")]
    NotConfigured,
    #[error("{len} bytes do not fit in a {size} bytes surface")]
    TooLarge { len: usize, size: usize },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Geometry and pixel format requested from a display surface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SurfaceConfig {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    /// Driver-specific pixel format code, for non-RGB surfaces.
    pub nonstd: u32,
}

impl SurfaceConfig {
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.bits_per_pixel as usize / 8
    }
}

/// A surface pictures can be written or DMA'd to, then flipped on screen.
pub trait DisplaySurface {
    /// Applies `config`, unblanks the surface and returns the physical address of its memory.
    fn configure(&mut self, config: &SurfaceConfig) -> Result<u64, DisplayError>;

    /// Shows the current content of the surface.
    fn pan(&mut self) -> Result<(), DisplayError>;

    fn blank(&mut self, blank: bool) -> Result<(), DisplayError>;

    /// Copies `data` at the start of the surface memory.
    fn write(&mut self, data: &[u8]) -> Result<(), DisplayError>;
}

fn handle_eintr<T>(cb: &mut impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match cb() {
            Err(Errno::EINTR) => continue,
            res => return res,
        }
    }
}

struct Mapping {
    addr: NonNull<libc::c_void>,
    len: usize,
}

/// A Linux framebuffer device.
pub struct FramebufferDevice {
    file: File,
    path: PathBuf,
    var: fb_var_screeninfo,
    fix: fb_fix_screeninfo,
    mapping: Option<Mapping>,
}

impl FramebufferDevice {
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, DisplayError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut device = Self {
            file,
            path,
            var: Default::default(),
            fix: Default::default(),
            mapping: None,
        };
        device.refresh()?;
        Ok(device)
    }

    /// Opens the first of `/dev/fb0` to `/dev/fb4` whose identifier is `id`.
    pub fn find_by_id(id: &str) -> Result<Self, DisplayError> {
        for i in 0..MAX_FRAMEBUFFERS {
            let path = format!("/dev/fb{}", i);
            let device = match Self::open_path(&path) {
                Ok(device) => device,
                Err(_) => continue,
            };
            log::debug!(
                "{} is {:?}",
                path,
                String::from_utf8_lossy(device.fix.id())
            );
            if device.fix.id() == id.as_bytes() {
                log::info!("found framebuffer {} at {}", id, path);
                return Ok(device);
            }
        }

        Err(DisplayError::NotFound(id.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn refresh(&mut self) -> Result<(), DisplayError> {
        let fd = self.file.as_raw_fd();
        let mut var = fb_var_screeninfo::default();
        let mut fix = fb_fix_screeninfo::default();
        // SAFETY: both structures match the kernel layout and are filled in by the driver.
        handle_eintr(&mut || unsafe { fbioget_vscreeninfo(fd, &mut var) }).map_err(|source| {
            DisplayError::Ioctl {
                operation: "FBIOGET_VSCREENINFO",
                source,
            }
        })?;
        // SAFETY: see above.
        handle_eintr(&mut || unsafe { fbioget_fscreeninfo(fd, &mut fix) }).map_err(|source| {
            DisplayError::Ioctl {
                operation: "FBIOGET_FSCREENINFO",
                source,
            }
        })?;
        self.var = var;
        self.fix = fix;
        Ok(())
    }

    fn unmap(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            // SAFETY: the mapping was created by `map` with this length.
            if let Err(e) = unsafe { munmap(mapping.addr, mapping.len) } {
                log::error!("failed to unmap {}: {}", self.path.display(), e);
            }
        }
    }

    fn map(&mut self) -> Result<(), DisplayError> {
        self.unmap();
        let Some(len) = NonZeroUsize::new(self.fix.smem_len as usize) else {
            return Ok(());
        };

        // SAFETY: the mapping does not alias any Rust object and is released in `unmap`.
        let addr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.file.as_fd(),
                0,
            )
        }
        .map_err(DisplayError::Map)?;

        self.mapping = Some(Mapping {
            addr,
            len: len.get(),
        });
        Ok(())
    }
}

impl DisplaySurface for FramebufferDevice {
    fn configure(&mut self, config: &SurfaceConfig) -> Result<u64, DisplayError> {
        let mut var = self.var;
        var.xres = config.width;
        var.xres_virtual = config.width;
        var.yres = config.height;
        var.yres_virtual = config.height;
        var.activate |= FB_ACTIVATE_FORCE;
        var.vmode |= FB_VMODE_YWRAP;
        var.nonstd = config.nonstd;
        var.bits_per_pixel = config.bits_per_pixel;

        let fd = self.file.as_raw_fd();
        // SAFETY: `var` matches the kernel layout.
        handle_eintr(&mut || unsafe { fbioput_vscreeninfo(fd, &var) }).map_err(|source| {
            DisplayError::Ioctl {
                operation: "FBIOPUT_VSCREENINFO",
                source,
            }
        })?;
        self.refresh()?;
        self.map()?;
        self.blank(false)?;

        log::debug!(
            "{} configured for {}x{}, {} bpp, memory at {:#x}",
            self.path.display(),
            self.var.xres,
            self.var.yres,
            self.var.bits_per_pixel,
            self.fix.smem_start
        );
        Ok(self.fix.smem_start as u64)
    }

    fn pan(&mut self) -> Result<(), DisplayError> {
        let fd = self.file.as_raw_fd();
        let var = self.var;
        // SAFETY: `var` matches the kernel layout.
        handle_eintr(&mut || unsafe { fbiopan_display(fd, &var) }).map_err(|source| {
            DisplayError::Ioctl {
                operation: "FBIOPAN_DISPLAY",
                source,
            }
        })?;
        Ok(())
    }

    fn blank(&mut self, blank: bool) -> Result<(), DisplayError> {
        let fd = self.file.as_raw_fd();
        let mode = if blank {
            FB_BLANK_POWERDOWN
        } else {
            FB_BLANK_UNBLANK
        };
        // SAFETY: FBIOBLANK takes its argument by value.
        handle_eintr(&mut || unsafe { fbioblank(fd, mode) }).map_err(|source| {
            DisplayError::Ioctl {
                operation: "FBIOBLANK",
                source,
            }
        })?;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), DisplayError> {
        let mapping = self.mapping.as_ref().ok_or(DisplayError::NotConfigured)?;
        if data.len() > mapping.len {
            return Err(DisplayError::TooLarge {
                len: data.len(),
                size: mapping.len,
            });
        }

        // SAFETY: `addr` points to a live mapping of `len` bytes owned by `self`.
        let memory =
            unsafe { slice::from_raw_parts_mut(mapping.addr.as_ptr() as *mut u8, mapping.len) };
        memory[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for FramebufferDevice {
    fn drop(&mut self) {
        if self.mapping.is_some() {
            if let Err(e) = self.blank(true) {
                log::warn!("failed to blank {}: {}", self.path.display(), e);
            }
        }
        self.unmap();
    }
}
