// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contiguous memory obtained from the `mxc_vpu` kernel driver.

use std::fs::File;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::ops::DerefMut;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use nix::errno::Errno;
use nix::ioctl_readwrite_bad;
use nix::libc;
use nix::request_code_none;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;

use crate::memory::DmaAllocator;
use crate::memory::DmaBuffer;
use crate::memory::DmaMemory;
use crate::memory::MemoryError;

pub const VPU_DEVICE: &str = "/dev/mxc_vpu";

// Defined in include/linux/mxc_vpu.h
const VPU_IOC_MAGIC: u8 = b'V';

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
struct vpu_mem_desc {
    size: libc::c_int,
    phy_addr: libc::c_ulong,
    cpu_addr: libc::c_ulong,
    virt_uaddr: libc::c_ulong,
}

ioctl_readwrite_bad!(
    vpu_ioc_phymem_alloc,
    request_code_none!(VPU_IOC_MAGIC, 0),
    vpu_mem_desc
);
ioctl_readwrite_bad!(
    vpu_ioc_phymem_free,
    request_code_none!(VPU_IOC_MAGIC, 1),
    vpu_mem_desc
);

fn handle_eintr<T>(cb: &mut impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match cb() {
            Err(Errno::EINTR) => continue,
            res => return res,
        }
    }
}

/// Returns the allocation described by `desc` to the driver.
fn free_phymem(device: &File, mut desc: vpu_mem_desc) -> nix::Result<()> {
    let fd = device.as_raw_fd();
    // SAFETY: `desc` is a valid `vpu_mem_desc` the driver only reads.
    handle_eintr(&mut || unsafe { vpu_ioc_phymem_free(fd, &mut desc) }).map(|_| ())
}

struct MxcMemory {
    device: Arc<File>,
    desc: vpu_mem_desc,
    addr: NonNull<libc::c_void>,
    len: usize,
}

// The mapping is owned exclusively by this object and only handed out through borrows.
unsafe impl Send for MxcMemory {}

impl DmaMemory for MxcMemory {
    fn phys_addr(&self) -> u64 {
        self.desc.phy_addr as u64
    }

    fn size(&self) -> usize {
        self.len
    }

    fn map(&self) -> Box<dyn Deref<Target = [u8]> + '_> {
        // SAFETY: `addr` points to a live mapping of `len` bytes for the lifetime of `self`.
        Box::new(unsafe { slice::from_raw_parts(self.addr.as_ptr() as *const u8, self.len) })
    }

    fn map_mut(&mut self) -> Box<dyn DerefMut<Target = [u8]> + '_> {
        // SAFETY: same as above, and `&mut self` guarantees exclusive access.
        Box::new(unsafe { slice::from_raw_parts_mut(self.addr.as_ptr() as *mut u8, self.len) })
    }
}

impl Drop for MxcMemory {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `MxcAllocator::allocate` with this length.
        if let Err(e) = unsafe { munmap(self.addr, self.len) } {
            log::error!("failed to unmap buffer at {:#x}: {}", self.desc.phy_addr, e);
        }

        if let Err(e) = free_phymem(&self.device, self.desc) {
            log::error!("failed to free buffer at {:#x}: {}", self.desc.phy_addr, e);
        }
    }
}

/// Allocator backed by the VPU driver's reserved memory.
pub struct MxcAllocator {
    device: Arc<File>,
}

impl MxcAllocator {
    pub fn open() -> Result<Self, MemoryError> {
        Self::open_path(VPU_DEVICE)
    }

    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, MemoryError> {
        let device = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            device: Arc::new(device),
        })
    }
}

impl DmaAllocator for MxcAllocator {
    fn allocate(&self, size: usize) -> Result<DmaBuffer, MemoryError> {
        let len = NonZeroUsize::new(size).ok_or(MemoryError::ZeroSize)?;
        let mut desc = vpu_mem_desc {
            size: size as libc::c_int,
            ..Default::default()
        };

        let fd = self.device.as_raw_fd();
        // SAFETY: `desc` is a valid `vpu_mem_desc` the driver fills in.
        handle_eintr(&mut || unsafe { vpu_ioc_phymem_alloc(fd, &mut desc) })
            .map_err(|source| MemoryError::AllocationFailed { size, source })?;

        // The driver maps its reserved memory using the physical address as offset.
        // SAFETY: the mapping does not alias any Rust object and is released in `Drop`.
        let addr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.device.as_fd(),
                desc.phy_addr as libc::off_t,
            )
        };
        let addr = match addr {
            Ok(addr) => addr,
            Err(source) => {
                let phys = desc.phy_addr as u64;
                if let Err(e) = free_phymem(&self.device, desc) {
                    log::error!("failed to free buffer at {:#x}: {}", phys, e);
                }
                return Err(MemoryError::MapFailed { phys, source });
            }
        };

        log::debug!("allocated {} bytes at {:#x}", size, desc.phy_addr);

        Ok(DmaBuffer::new(Box::new(MxcMemory {
            device: Arc::clone(&self.device),
            desc,
            addr,
            len: size,
        })))
    }
}
