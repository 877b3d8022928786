// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::bitmap::Bitmap128,
    runtime::{
        fail::Fail,
        limits,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

const STATE_MASK: u32 = 0xf;
const CUSTOM_SHIFT: u32 = 4;
const CUSTOM_MASK: u32 = 0xff;
const STAT_ENABLED_BIT: u32 = 1 << 4;
const EXTRA_MASKS_SHIFT: u32 = 10;
const EXTRA_MASKS_MASK: u32 = 0x3;
const COUNT_SHIFT: u32 = 12;
const COUNT_MASK: u32 = 0x7ff;
const OPCODE_SHIFT: u32 = 23;
const OPCODE_MASK: u32 = 0x1f;
const TYPE_SHIFT: u32 = 28;
const TYPE_MASK: u32 = 0xf;

//======================================================================================================================
// Structures
//======================================================================================================================

/// State of a command as seen by the scheduler.
///
/// `New` and the three terminal states are also published in the header of the caller's buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandState {
    New = 1,
    Queued = 2,
    Running = 3,
    Completed = 4,
    Error = 5,
    Abort = 6,
    Submitted = 7,
}

/// Operation requested by a command packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    StartCu = 0,
    Configure = 2,
    Exit = 3,
    Abort = 4,
    ExecWrite = 5,
    CuStat = 6,
    StartCopyBo = 7,
}

/// Routing class of a command packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandType {
    Default = 0,
    KdsLocal = 1,
    Ctrl = 2,
    Cu = 3,
}

/// First word of every command packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader(u32);

/// Feature word of a configure packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigFeatures(u32);

/// Decoded configure packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigurePacket {
    pub slot_size: u32,
    pub cu_shift: u32,
    pub cu_base_addr: u32,
    pub features: ConfigFeatures,
    /// One encoded address word per CU.
    pub cu_addrs: Vec<u32>,
}

/// Start-kernel packet builder and accessors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartKernelPacket {
    pub opcode: Opcode,
    /// First mask plus up to three extra masks.
    pub cu_masks: Vec<u32>,
    pub regmap: Vec<u32>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CommandState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(CommandState::New),
            2 => Some(CommandState::Queued),
            3 => Some(CommandState::Running),
            4 => Some(CommandState::Completed),
            5 => Some(CommandState::Error),
            6 => Some(CommandState::Abort),
            7 => Some(CommandState::Submitted),
            _ => None,
        }
    }

    /// Checks whether a command in this state is finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Completed | CommandState::Error | CommandState::Abort)
    }
}

impl Opcode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Opcode::StartCu),
            2 => Some(Opcode::Configure),
            3 => Some(Opcode::Exit),
            4 => Some(Opcode::Abort),
            5 => Some(Opcode::ExecWrite),
            6 => Some(Opcode::CuStat),
            7 => Some(Opcode::StartCopyBo),
            _ => None,
        }
    }
}

impl CommandType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(CommandType::Default),
            1 => Some(CommandType::KdsLocal),
            2 => Some(CommandType::Ctrl),
            3 => Some(CommandType::Cu),
            _ => None,
        }
    }
}

impl PacketHeader {
    /// Builds a header for a packet in the `New` state with `count` payload words.
    pub fn new(opcode: Opcode, cmd_type: CommandType, count: usize) -> Self {
        let count: u32 = (count.min(limits::MAX_PACKET_WORDS) as u32) & COUNT_MASK;
        Self(
            (CommandState::New as u32)
                | (count << COUNT_SHIFT)
                | ((opcode as u32 & OPCODE_MASK) << OPCODE_SHIFT)
                | ((cmd_type as u32 & TYPE_MASK) << TYPE_SHIFT),
        )
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn state(&self) -> Option<CommandState> {
        CommandState::from_raw(self.0 & STATE_MASK)
    }

    pub fn with_state(self, state: CommandState) -> Self {
        Self((self.0 & !STATE_MASK) | state as u32)
    }

    pub fn custom(&self) -> u32 {
        (self.0 >> CUSTOM_SHIFT) & CUSTOM_MASK
    }

    pub fn stat_enabled(&self) -> bool {
        (self.0 & STAT_ENABLED_BIT) != 0
    }

    /// Number of CU masks beyond the mandatory first one.
    pub fn extra_cu_masks(&self) -> usize {
        ((self.0 >> EXTRA_MASKS_SHIFT) & EXTRA_MASKS_MASK) as usize
    }

    pub fn with_extra_cu_masks(self, extra: usize) -> Self {
        let extra: u32 = (extra as u32) & EXTRA_MASKS_MASK;
        Self((self.0 & !(EXTRA_MASKS_MASK << EXTRA_MASKS_SHIFT)) | (extra << EXTRA_MASKS_SHIFT))
    }

    /// Number of payload words following the header.
    pub fn count(&self) -> usize {
        ((self.0 >> COUNT_SHIFT) & COUNT_MASK) as usize
    }

    pub fn with_count(self, count: usize) -> Self {
        let count: u32 = (count.min(limits::MAX_PACKET_WORDS) as u32) & COUNT_MASK;
        Self((self.0 & !(COUNT_MASK << COUNT_SHIFT)) | (count << COUNT_SHIFT))
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_raw((self.0 >> OPCODE_SHIFT) & OPCODE_MASK)
    }

    pub fn with_opcode(self, opcode: Opcode) -> Self {
        Self((self.0 & !(OPCODE_MASK << OPCODE_SHIFT)) | ((opcode as u32) << OPCODE_SHIFT))
    }

    pub fn cmd_type(&self) -> Option<CommandType> {
        CommandType::from_raw((self.0 >> TYPE_SHIFT) & TYPE_MASK)
    }

    pub fn with_type(self, cmd_type: CommandType) -> Self {
        Self((self.0 & !(TYPE_MASK << TYPE_SHIFT)) | ((cmd_type as u32) << TYPE_SHIFT))
    }
}

impl ConfigFeatures {
    pub const ERT: u32 = 1 << 0;
    pub const POLLING: u32 = 1 << 1;
    pub const CU_DMA: u32 = 1 << 2;
    pub const CU_ISR: u32 = 1 << 3;
    pub const CQ_INT: u32 = 1 << 4;
    pub const CDMA: u32 = 1 << 5;
    pub const DATAFLOW: u32 = 1 << 6;
    pub const RW_SHARED: u32 = 1 << 7;
    pub const KDS_30: u32 = 1 << 8;
    pub const DMSG: u32 = 1 << 9;
    pub const ECHO: u32 = 1 << 10;
    pub const INTR: u32 = 1 << 11;
    pub const DSA52: u32 = 1 << 31;

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn has(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    /// Sets or clears `flag`.
    pub fn with(self, flag: u32, on: bool) -> Self {
        if on {
            Self(self.0 | flag)
        } else {
            Self(self.0 & !flag)
        }
    }

    pub fn ert(&self) -> bool {
        self.has(Self::ERT)
    }

    pub fn polling(&self) -> bool {
        self.has(Self::POLLING)
    }

    pub fn cu_dma(&self) -> bool {
        self.has(Self::CU_DMA)
    }

    pub fn cq_int(&self) -> bool {
        self.has(Self::CQ_INT)
    }

    pub fn dataflow(&self) -> bool {
        self.has(Self::DATAFLOW)
    }
}

impl ConfigurePacket {
    /// Payload words preceding the CU address list.
    pub const FIXED_WORDS: usize = 5;

    /// Decodes a configure packet. The payload count must match the number of CUs it announces.
    pub fn parse(words: &[u32]) -> Result<Self, Fail> {
        if words.len() < 1 + Self::FIXED_WORDS {
            return Err(Fail::new(libc::EINVAL, "configure packet is too short"));
        }
        let header: PacketHeader = PacketHeader::from(words[0]);
        let num_cus: usize = words[2] as usize;
        if header.count() != Self::FIXED_WORDS + num_cus {
            let cause: String = format!(
                "invalid configure command (count={:?}, expected 5+num_cus({:?}))",
                header.count(),
                num_cus
            );
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if num_cus > limits::MAX_CUS || words.len() < 1 + header.count() {
            return Err(Fail::new(libc::EINVAL, "configure packet does not hold all CU addresses"));
        }

        Ok(Self {
            slot_size: words[1],
            cu_shift: words[3],
            cu_base_addr: words[4],
            features: ConfigFeatures(words[5]),
            cu_addrs: words[6..6 + num_cus].to_vec(),
        })
    }

    /// Encodes the packet, header included.
    pub fn to_words(&self) -> Vec<u32> {
        let count: usize = Self::FIXED_WORDS + self.cu_addrs.len();
        let header: PacketHeader = PacketHeader::new(Opcode::Configure, CommandType::Ctrl, count);
        let mut words: Vec<u32> = Vec::with_capacity(1 + count);
        words.push(header.raw());
        words.push(self.slot_size);
        words.push(self.cu_addrs.len() as u32);
        words.push(self.cu_shift);
        words.push(self.cu_base_addr);
        words.push(self.features.raw());
        words.extend_from_slice(&self.cu_addrs);
        words
    }
}

impl StartKernelPacket {
    /// Encodes the packet, header included.
    pub fn to_words(&self) -> Vec<u32> {
        let num_masks: usize = self.cu_masks.len().clamp(1, limits::MAX_CU_MASKS);
        let count: usize = num_masks + self.regmap.len();
        let header: PacketHeader =
            PacketHeader::new(self.opcode, CommandType::Cu, count).with_extra_cu_masks(num_masks - 1);
        let mut words: Vec<u32> = Vec::with_capacity(1 + count);
        words.push(header.raw());
        for ix in 0..num_masks {
            words.push(self.cu_masks.get(ix).copied().unwrap_or(0));
        }
        words.extend_from_slice(&self.regmap);
        words
    }

    /// CUs a start-kernel packet may run on.
    pub fn cu_bitmap(words: &[u32]) -> Bitmap128 {
        let header: PacketHeader = match words.first() {
            Some(raw) => PacketHeader::from(*raw),
            None => return Bitmap128::default(),
        };
        let end: usize = (2 + header.extra_cu_masks()).min(words.len());
        Bitmap128::from_masks(words.get(1..end).unwrap_or(&[]))
    }

    /// Register map of a start-kernel packet, clamped to the words actually present.
    pub fn regmap(words: &[u32]) -> &[u32] {
        let header: PacketHeader = match words.first() {
            Some(raw) => PacketHeader::from(*raw),
            None => return &[],
        };
        let start: usize = 2 + header.extra_cu_masks();
        let size: usize = header.count().saturating_sub(1 + header.extra_cu_masks());
        let end: usize = (start + size).min(words.len());
        words.get(start..end).unwrap_or(&[])
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u32> for PacketHeader {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<PacketHeader> for u32 {
    fn from(header: PacketHeader) -> Self {
        header.0
    }
}

impl From<u32> for ConfigFeatures {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
