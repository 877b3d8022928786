// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Maximum number of compute units per execution core.
pub const MAX_CUS: usize = 128;

/// Maximum number of command queue slots handled by the embedded scheduler.
pub const MAX_SLOTS: usize = 128;

/// Maximum number of dependencies a command may declare, and dependents it may trigger.
pub const MAX_DEPS: usize = 8;

/// Maximum number of 32-bit CU masks carried by a start-kernel packet.
pub const MAX_CU_MASKS: usize = 4;

/// Number of 32-bit completion status registers.
pub const MAX_STATUS_REGISTERS: usize = 4;

/// Default size of the command queue region in bytes.
pub const ERT_CQ_SIZE: usize = 0x10000;

/// Maximum number of copy-engine CUs appended to a configuration.
pub const MAX_CDMA: usize = 4;

/// Upper bound on the payload word count that fits in a packet header.
pub const MAX_PACKET_WORDS: usize = 0x7ff;
