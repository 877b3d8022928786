// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::bitmap::Bitmap128,
    kds::{
        command::{
            Command,
            CommandId,
        },
        packet::CommandType,
        register::SharedRegisterIo,
    },
    runtime::limits,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// First of the command-completion status registers in the CSR region.
pub const STATUS_REGISTER_ADDR: usize = 0x0;

/// First of the registers through which the host signals new commands to the embedded scheduler.
pub const CQ_STATUS_REGISTER_ADDR: usize = 0x58;

/// Tag of the versioned CU statistics layout.
pub const CUSTAT_VERSION_MAGIC: u32 = 0x51a1_0000;

/// Slot reserved for control commands.
pub const CTRL_SLOT: usize = 0;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Host side of the embedded scheduler command queue.
pub struct EmbeddedScheduler {
    csr: SharedRegisterIo,
    cq: SharedRegisterIo,
    cq_size: usize,
    num_slots: usize,
    slot_size: usize,
    /// Whether each new command is signalled through the CQ status registers.
    cq_intr: bool,
    command_queue: Vec<Option<CommandId>>,
    /// Busy slots. Slot 0 is permanently marked, control commands track it with `ctrl_busy`.
    slot_status: Bitmap128,
    ctrl_busy: bool,
    version: u32,
    cu_usage: Vec<u32>,
    cu_status: Vec<u32>,
    cq_slot_status: Vec<u32>,
    cq_slot_usage: Vec<u32>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl EmbeddedScheduler {
    pub fn new(csr: SharedRegisterIo, cq: SharedRegisterIo) -> Self {
        Self {
            csr,
            cq,
            cq_size: 0,
            num_slots: 0,
            slot_size: 0,
            cq_intr: false,
            command_queue: vec![None; limits::MAX_SLOTS],
            slot_status: Bitmap128::default(),
            ctrl_busy: false,
            version: 0,
            cu_usage: vec![0; limits::MAX_CUS],
            cu_status: vec![0; limits::MAX_CUS],
            cq_slot_status: vec![0; limits::MAX_SLOTS],
            cq_slot_usage: vec![0; limits::MAX_SLOTS],
        }
    }

    /// Lays out the command queue in `num_slots` equal slots and forgets every in-flight command.
    pub fn configure(&mut self, cq_size: usize, num_slots: usize, cq_intr: bool) {
        let num_slots: usize = num_slots.clamp(1, limits::MAX_SLOTS);
        debug!(
            "configure(): cq_size={:#x}, slots={:?}, slot_size={:#x}, cq_intr={:?}",
            cq_size,
            num_slots,
            cq_size / num_slots,
            cq_intr
        );
        self.cq_size = cq_size;
        self.num_slots = num_slots;
        self.slot_size = cq_size / num_slots;
        self.cq_intr = cq_intr;
        self.version = 0;
        self.cu_usage.fill(0);
        self.cu_status.fill(0);
        self.command_queue.fill(None);
        self.cq_slot_status.fill(0);
        self.cq_slot_usage.fill(0);
        self.slot_status.clear_all();
        self.slot_status.set(CTRL_SLOT);
        self.ctrl_busy = false;
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn cq_size(&self) -> usize {
        self.cq_size
    }

    pub fn cq_intr(&self) -> bool {
        self.cq_intr
    }

    /// Reserves a slot. Control commands always get slot 0.
    pub fn acquire_slot(&mut self, is_ctrl: bool) -> Option<usize> {
        if is_ctrl {
            if self.ctrl_busy {
                info!("acquire_slot(): ctrl slot is busy");
                return None;
            }
            self.ctrl_busy = true;
            return Some(CTRL_SLOT);
        }
        let slot: usize = self.slot_status.first_free(self.num_slots)?;
        self.slot_status.set(slot);
        Some(slot)
    }

    pub fn release_slot(&mut self, slot: usize, is_ctrl: bool) {
        trace!("release_slot(): slot={:?}, ctrl={:?}", slot, is_ctrl);
        if is_ctrl {
            self.ctrl_busy = false;
        } else {
            self.slot_status.clear(slot);
        }
        if let Some(entry) = self.command_queue.get_mut(slot) {
            *entry = None;
        }
    }

    /// Command occupying `slot`.
    pub fn command_at(&self, slot: usize) -> Option<CommandId> {
        self.command_queue.get(slot).copied().flatten()
    }

    pub fn is_slot_busy(&self, slot: usize) -> bool {
        self.command_at(slot).is_some()
    }

    /// Copies a command into a free slot and signals it. Returns the slot, or `None` if the queue is full.
    ///
    /// When `write_cu_idx` is set, the first CU mask of a CU command is replaced with the CU picked by the host.
    pub fn start(&mut self, cmd: &Command, id: CommandId, write_cu_idx: bool) -> Option<usize> {
        let is_ctrl: bool = cmd.cmd_type() == Some(CommandType::Ctrl);
        let slot: usize = self.acquire_slot(is_ctrl)?;
        let slot_addr: usize = slot * self.slot_size;
        let packet: &[u32] = cmd.packet();
        let end: usize = (1 + cmd.header().count()).min(packet.len());

        match cmd.cu_idx() {
            Some(cu_idx) if write_cu_idx && cmd.cmd_type() == Some(CommandType::Cu) => {
                self.cq.write32(slot_addr + 4, cu_idx as u32);
                self.cq.write_block(slot_addr + 8, packet.get(2..end).unwrap_or(&[]));
            },
            _ => self.cq.write_block(slot_addr + 4, packet.get(1..end).unwrap_or(&[])),
        }

        // Header goes last, the embedded scheduler picks up the slot as soon as it changes.
        self.cq.write32(slot_addr, cmd.header().raw());

        if self.cq_intr {
            let mask_idx: usize = slot >> 5;
            let mask: u32 = 1 << (slot & 31);
            trace!(
                "start(): signalling slot mask {:#x} at {:#x}",
                mask,
                CQ_STATUS_REGISTER_ADDR + (mask_idx << 2)
            );
            self.csr.write32(CQ_STATUS_REGISTER_ADDR + (mask_idx << 2), mask);
        }

        self.cq_slot_usage[slot] = self.cq_slot_usage[slot].wrapping_add(1);
        self.command_queue[slot] = Some(id);
        trace!("start(): uid={:?}, slot={:?}", cmd.uid(), slot);
        Some(slot)
    }

    /// Reads back the statistics the embedded scheduler wrote into `slot` for a CU statistics command.
    pub fn read_custat(&mut self, slot: usize, num_cus: usize) {
        let slot_addr: usize = slot * self.slot_size;
        let custat_version: u32 = self.cq.read32(slot_addr + 4);

        self.version = u32::MAX;
        self.cu_usage.fill(u32::MAX);
        self.cu_status.fill(u32::MAX);
        self.cq_slot_status.fill(u32::MAX);

        if custat_version != CUSTAT_VERSION_MAGIC {
            let num_cus: usize = num_cus.min(limits::MAX_CUS);
            self.cq.read_block(slot_addr + 4, &mut self.cu_usage[..num_cus]);
            return;
        }

        let max_idx: usize = self.slot_size >> 2;
        let mut idx: usize = 2;
        self.version = self.cq.read32(slot_addr + (idx << 2));
        idx += 1;
        let ert_num_cq_slots: usize = self.cq.read32(slot_addr + (idx << 2)) as usize;
        idx += 1;
        let ert_num_cus: usize = self.cq.read32(slot_addr + (idx << 2)) as usize;
        idx += 1;

        if ert_num_cus > limits::MAX_CUS || ert_num_cq_slots > limits::MAX_CUS {
            warn!(
                "read_custat(): bogus statistics (cus={:?}, slots={:?})",
                ert_num_cus, ert_num_cq_slots
            );
            return;
        }

        let words: usize = ert_num_cus.min(max_idx.saturating_sub(idx));
        self.cq.read_block(slot_addr + (idx << 2), &mut self.cu_usage[..words]);
        idx += words;

        let words: usize = ert_num_cus.min(max_idx.saturating_sub(idx));
        self.cq.read_block(slot_addr + (idx << 2), &mut self.cu_status[..words]);
        idx += words;

        let words: usize = ert_num_cq_slots.min(max_idx.saturating_sub(idx));
        self.cq.read_block(slot_addr + (idx << 2), &mut self.cq_slot_status[..words]);
    }

    /// Reads (and thereby clears) one 32-bit command-completion status register.
    pub fn read_status(&self, mask_idx: usize) -> u32 {
        self.csr.read32(STATUS_REGISTER_ADDR + (mask_idx << 2))
    }

    /// Drains stale completion status. Returns what each status register held.
    pub fn clear_status(&self) -> [u32; limits::MAX_STATUS_REGISTERS] {
        let mut drained: [u32; limits::MAX_STATUS_REGISTERS] = [0; limits::MAX_STATUS_REGISTERS];
        for (mask_idx, value) in drained.iter_mut().enumerate() {
            *value = self.read_status(mask_idx);
        }
        drained
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn cu_usage(&self, cu_idx: usize) -> u32 {
        self.cu_usage.get(cu_idx).copied().unwrap_or(0)
    }

    pub fn cu_status(&self, cu_idx: usize) -> u32 {
        self.cu_status.get(cu_idx).copied().unwrap_or(0)
    }

    pub fn cq_slot_status(&self, slot: usize) -> u32 {
        self.cq_slot_status.get(slot).copied().unwrap_or(0)
    }

    pub fn cq_slot_usage(&self, slot: usize) -> u32 {
        self.cq_slot_usage.get(slot).copied().unwrap_or(0)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
