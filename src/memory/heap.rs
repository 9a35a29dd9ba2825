// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contiguous memory emulated on the heap.
//!
//! Every allocation is given a fake physical address on a [`PhysicalBus`], through which the
//! simulated hardware blocks read and write it, just like the real ones would through DMA.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::memory::DmaAllocator;
use crate::memory::DmaBuffer;
use crate::memory::DmaMemory;
use crate::memory::MemoryError;
use crate::utils::page_align;
use crate::utils::PAGE_SIZE;

const BUS_BASE: u64 = 0x1000_0000;

type Region = Arc<Mutex<Vec<u8>>>;

fn lock(region: &Region) -> MutexGuard<'_, Vec<u8>> {
    region.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct BusState {
    regions: BTreeMap<u64, (usize, Region)>,
    next_addr: u64,
}

/// Physical address space shared by a [`HeapAllocator`] and the simulated devices.
#[derive(Clone, Default)]
pub struct PhysicalBus(Arc<Mutex<BusState>>);

impl PhysicalBus {
    pub fn new() -> Self {
        Default::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, size: usize) -> (u64, Region) {
        let mut state = self.state();
        if state.next_addr == 0 {
            state.next_addr = BUS_BASE;
        }
        let phys = state.next_addr;
        // Keep a guard page between regions so that overruns are not silently absorbed.
        state.next_addr += (page_align(size) + PAGE_SIZE) as u64;
        let region = Arc::new(Mutex::new(vec![0u8; size]));
        state.regions.insert(phys, (size, Arc::clone(&region)));

        (phys, region)
    }

    fn remove(&self, phys: u64) {
        self.state().regions.remove(&phys);
    }

    /// Finds the region containing `phys..phys + len` and the offset of `phys` within it.
    fn resolve(&self, phys: u64, len: usize) -> Result<(Region, usize), MemoryError> {
        let state = self.state();
        let (&start, (size, region)) = state
            .regions
            .range(..=phys)
            .next_back()
            .ok_or(MemoryError::Unmapped { phys, len })?;
        let offset = (phys - start) as usize;
        if offset + len > *size {
            return Err(MemoryError::Unmapped { phys, len });
        }

        Ok((Arc::clone(region), offset))
    }

    pub fn read(&self, phys: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        let (region, offset) = self.resolve(phys, dst.len())?;
        dst.copy_from_slice(&lock(&region)[offset..offset + dst.len()]);
        Ok(())
    }

    pub fn write(&self, phys: u64, src: &[u8]) -> Result<(), MemoryError> {
        let (region, offset) = self.resolve(phys, src.len())?;
        lock(&region)[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn fill(&self, phys: u64, len: usize, value: u8) -> Result<(), MemoryError> {
        let (region, offset) = self.resolve(phys, len)?;
        lock(&region)[offset..offset + len].fill(value);
        Ok(())
    }

    /// Number of allocations currently alive on the bus.
    pub fn live_regions(&self) -> usize {
        self.state().regions.len()
    }
}

struct HeapMemory {
    phys: u64,
    size: usize,
    data: Region,
    bus: PhysicalBus,
}

struct HeapMapping<'a>(MutexGuard<'a, Vec<u8>>);

impl Deref for HeapMapping<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl DerefMut for HeapMapping<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.0.as_mut_slice()
    }
}

impl DmaMemory for HeapMemory {
    fn phys_addr(&self) -> u64 {
        self.phys
    }

    fn size(&self) -> usize {
        self.size
    }

    fn map(&self) -> Box<dyn Deref<Target = [u8]> + '_> {
        Box::new(HeapMapping(lock(&self.data)))
    }

    fn map_mut(&mut self) -> Box<dyn DerefMut<Target = [u8]> + '_> {
        Box::new(HeapMapping(lock(&self.data)))
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        self.bus.remove(self.phys);
    }
}

/// Allocator handing out heap memory registered on a [`PhysicalBus`].
#[derive(Clone, Default)]
pub struct HeapAllocator {
    bus: PhysicalBus,
}

impl HeapAllocator {
    pub fn new(bus: PhysicalBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &PhysicalBus {
        &self.bus
    }
}

impl DmaAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<DmaBuffer, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }

        let (phys, data) = self.bus.insert(size);
        log::trace!("heap allocation of {} bytes at {:#x}", size, phys);

        Ok(DmaBuffer::new(Box::new(HeapMemory {
            phys,
            size,
            data,
            bus: self.bus.clone(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_writes_are_visible_on_the_bus() {
        let allocator = HeapAllocator::default();
        let mut buffer = allocator.allocate(64).unwrap();
        buffer.write_at(16, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 4];
        allocator.bus().read(buffer.phys_addr() + 16, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        allocator.bus().fill(buffer.phys_addr(), 4, 0xaa).unwrap();
        assert_eq!(&buffer.map()[..4], &[0xaa; 4]);
    }

    #[test]
    fn dropped_buffers_leave_the_bus() {
        let allocator = HeapAllocator::default();
        let a = allocator.allocate(100).unwrap();
        let b = allocator.allocate(PAGE_SIZE * 2).unwrap();
        assert!(b.phys_addr() > a.phys_addr() + 100);
        assert_eq!(allocator.bus().live_regions(), 2);

        let phys = a.phys_addr();
        drop(a);
        assert_eq!(allocator.bus().live_regions(), 1);
        assert!(matches!(
            allocator.bus().read(phys, &mut [0u8; 1]),
            Err(MemoryError::Unmapped { .. })
        ));
    }

    #[test]
    fn out_of_range_accesses_are_rejected() {
        let allocator = HeapAllocator::default();
        let mut buffer = allocator.allocate(8).unwrap();
        assert!(buffer.write_at(6, &[0; 4]).is_err());
        assert!(allocator
            .bus()
            .write(buffer.phys_addr() + 6, &[0; 4])
            .is_err());
        assert!(matches!(allocator.allocate(0), Err(MemoryError::ZeroSize)));
    }
}
