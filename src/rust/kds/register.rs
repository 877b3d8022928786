// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime;
use ::std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        Arc,
        Mutex,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Memory-mapped register window.
///
/// Offsets are in bytes and 32-bit aligned.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: usize) -> u32;

    fn write32(&self, offset: usize, value: u32);

    /// Writes consecutive words starting at `offset`.
    fn write_block(&self, offset: usize, values: &[u32]) {
        for (ix, value) in values.iter().enumerate() {
            self.write32(offset + (ix << 2), *value);
        }
    }

    /// Reads consecutive words starting at `offset`.
    fn read_block(&self, offset: usize, values: &mut [u32]) {
        for (ix, value) in values.iter_mut().enumerate() {
            *value = self.read32(offset + (ix << 2));
        }
    }
}

pub type SharedRegisterIo = Arc<dyn RegisterIo>;

/// Register window backed by host memory.
///
/// Stands in for a device BAR in simulations and tests. Every write is recorded. Offsets can be made clear-on-read,
/// and a CU control register can be made to complete every start immediately.
pub struct MemoryRegion {
    inner: Mutex<MemoryRegionInner>,
}

struct MemoryRegionInner {
    words: Vec<u32>,
    writes: Vec<(usize, u32)>,
    clear_on_read: HashSet<usize>,
    /// Control register offset to the value it takes after a start.
    auto_complete: HashMap<usize, u32>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl MemoryRegion {
    /// Creates a zeroed window of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryRegionInner {
                words: vec![0; size.div_ceil(4)],
                writes: Vec::new(),
                clear_on_read: HashSet::new(),
                auto_complete: HashMap::new(),
            }),
        }
    }

    /// Size of the window in bytes.
    pub fn size(&self) -> usize {
        runtime::lock(&self.inner).words.len() * 4
    }

    /// Sets a word without recording a write. Models a change made by hardware.
    pub fn poke(&self, offset: usize, value: u32) {
        let mut inner = runtime::lock(&self.inner);
        if let Some(word) = inner.words.get_mut(offset >> 2) {
            *word = value;
        }
    }

    /// Reads a word without side effects.
    pub fn peek(&self, offset: usize) -> u32 {
        runtime::lock(&self.inner).words.get(offset >> 2).copied().unwrap_or(0)
    }

    /// Makes reads of `offset` return the value and reset it to zero.
    pub fn set_clear_on_read(&self, offset: usize) {
        runtime::lock(&self.inner).clear_on_read.insert(offset);
    }

    /// Makes every start written to the control register at `offset` complete at once with `done` bits.
    pub fn set_auto_complete(&self, offset: usize, done: u32) {
        runtime::lock(&self.inner).auto_complete.insert(offset, done);
    }

    /// Drains the record of writes performed so far.
    pub fn take_writes(&self) -> Vec<(usize, u32)> {
        ::std::mem::take(&mut runtime::lock(&self.inner).writes)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl RegisterIo for MemoryRegion {
    fn read32(&self, offset: usize) -> u32 {
        let mut inner = runtime::lock(&self.inner);
        let clear: bool = inner.clear_on_read.contains(&offset);
        match inner.words.get_mut(offset >> 2) {
            Some(word) => {
                let value: u32 = *word;
                if clear {
                    *word = 0;
                }
                value
            },
            None => {
                warn!("read32(): offset out of range (offset={:#x})", offset);
                0
            },
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut inner = runtime::lock(&self.inner);
        inner.writes.push((offset, value));
        let stored: u32 = match inner.auto_complete.get(&offset) {
            // Starts finish immediately, acknowledgements leave the status untouched.
            Some(done) if (value & 1) != 0 => *done,
            Some(_) => match inner.words.get(offset >> 2) {
                Some(current) => *current,
                None => value,
            },
            None => value,
        };
        match inner.words.get_mut(offset >> 2) {
            Some(word) => *word = stored,
            None => warn!("write32(): offset out of range (offset={:#x})", offset),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ::anyhow::Result;

    #[test]
    fn clear_on_read_and_write_log() -> Result<()> {
        let region: MemoryRegion = MemoryRegion::new(0x100);
        region.set_clear_on_read(0x8);
        region.poke(0x8, 0xf0);
        crate::ensure_eq!(region.read32(0x8), 0xf0);
        crate::ensure_eq!(region.read32(0x8), 0);

        region.write_block(0x10, &[1, 2, 3]);
        crate::ensure_eq!(region.take_writes(), vec![(0x10, 1), (0x14, 2), (0x18, 3)]);
        crate::ensure_eq!(region.take_writes().is_empty(), true);
        Ok(())
    }

    #[test]
    fn auto_complete_control_register() -> Result<()> {
        let region: MemoryRegion = MemoryRegion::new(0x100);
        region.set_auto_complete(0x40, 0x6);
        region.write32(0x40, 0x1);
        crate::ensure_eq!(region.peek(0x40), 0x6);
        region.write32(0x40, 0x10);
        crate::ensure_eq!(region.peek(0x40), 0x6);
        Ok(())
    }
}
