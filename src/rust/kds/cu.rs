// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::kds::{
    command::{
        CommandId,
        CommandPool,
    },
    packet::Opcode,
    register::SharedRegisterIo,
};
use ::std::collections::VecDeque;

//======================================================================================================================
// Constants
//======================================================================================================================

pub const AP_START: u32 = 0x1;
pub const AP_DONE: u32 = 0x2;
pub const AP_IDLE: u32 = 0x4;
pub const AP_READY: u32 = 0x8;
pub const AP_CONTINUE: u32 = 0x10;

/// Handshake where a new command may start only after the previous one finished.
pub const AP_CTRL_HS: u32 = 0;
/// Dataflow handshake, commands may overlap.
pub const AP_CTRL_CHAIN: u32 = 1;

/// Low bits of a CU address word carry the handshake and the context count.
pub const CU_ADDR_HANDSHAKE_MASK: u32 = 0xff;

/// Offset of the register through which a CU reports the context of a finished command.
const CTX_OUT_OFFSET: usize = 0x14;

/// Index in the register map of the input context word.
const CTX_IN_REGMAP_IX: usize = 4;

/// First register map word written to a CU. Words below are control and interrupt registers.
const REGMAP_FIRST_ARG: usize = 4;

/// First register map word holding an (offset, value) pair in out-of-order commands.
const REGMAP_FIRST_PAIR: usize = 6;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Secondary location that mirrors CU starts and acknowledgements, watched by the embedded scheduler.
#[derive(Clone)]
pub struct PollAddress {
    pub io: SharedRegisterIo,
    pub offset: usize,
}

/// One hardware execution engine.
pub struct ComputeUnit {
    idx: usize,
    /// Base address with handshake bits cleared.
    addr: u32,
    control: u32,
    /// Number of contexts advertised by the CU. Zero means no explicit context support.
    ctx_cfg: usize,
    /// Control register bits that signal completion.
    ap_check: u32,
    /// Last value read from (or written to) the control register.
    ctrlreg: u32,
    run_cnt: usize,
    error: bool,
    ctx: Vec<VecDeque<CommandId>>,
    done: VecDeque<CommandId>,
    bar: SharedRegisterIo,
    poll: Option<PollAddress>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ComputeUnit {
    /// Creates an unconfigured CU with a single context.
    pub fn new(bar: SharedRegisterIo) -> Self {
        Self {
            idx: 0,
            addr: u32::MAX,
            control: AP_CTRL_HS,
            ctx_cfg: 0,
            ap_check: AP_DONE | AP_IDLE,
            ctrlreg: 0,
            run_cnt: 0,
            error: false,
            ctx: vec![VecDeque::new()],
            done: VecDeque::new(),
            bar,
            poll: None,
        }
    }

    /// Checks whether an encoded CU address word refers to a mapped CU.
    pub fn addr_valid(addr: u32) -> bool {
        (addr | CU_ADDR_HANDSHAKE_MASK) != u32::MAX
    }

    /// Reconfigures the CU from an encoded address word, dropping any tracked command.
    pub fn reset(&mut self, idx: usize, addr: u32, poll: Option<PollAddress>) {
        self.error = false;
        self.ctx_cfg = ((addr & 0xf8) >> 3) as usize;
        self.idx = idx;
        self.control = addr & 0x7;
        self.addr = addr & !CU_ADDR_HANDSHAKE_MASK;
        self.poll = poll;
        self.ap_check = if self.control == AP_CTRL_CHAIN {
            AP_DONE
        } else {
            AP_DONE | AP_IDLE
        };
        self.ctrlreg = 0;
        self.run_cnt = 0;
        self.done.clear();

        let nctx: usize = self.ctx.len().max(self.ctx_cfg);
        self.ctx.resize_with(nctx, VecDeque::new);
        for queue in self.ctx.iter_mut() {
            queue.clear();
        }

        info!(
            "reset(): cu={:?}, addr={:#x}, control={:?}, ctx={:?}, poll={:?}",
            self.idx,
            self.addr,
            self.control,
            self.ctx_cfg,
            self.poll.as_ref().map(|p| p.offset)
        );
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn base_addr(&self) -> u32 {
        self.addr
    }

    pub fn is_valid(&self) -> bool {
        Self::addr_valid(self.addr)
    }

    pub fn is_dataflow(&self) -> bool {
        self.control == AP_CTRL_CHAIN
    }

    /// Checks whether the CU hit a protocol violation and refuses further work.
    pub fn is_faulted(&self) -> bool {
        self.error
    }

    pub fn num_contexts(&self) -> usize {
        self.ctx_cfg
    }

    pub fn run_count(&self) -> usize {
        self.run_cnt
    }

    pub fn done_count(&self) -> usize {
        self.done.len()
    }

    /// Number of commands started on context `ctx` and not yet completed.
    pub fn context_depth(&self, ctx: usize) -> usize {
        self.ctx.get(ctx).map_or(0, |queue| queue.len())
    }

    /// Reads the control register.
    pub fn status(&self) -> u32 {
        self.bar.read32(self.addr as usize)
    }

    /// Context a command asks to run on.
    fn ctx_in(&self, pool: &CommandPool, id: CommandId) -> Option<usize> {
        if self.ctx_cfg == 0 {
            return Some(0);
        }
        let cmd = pool.get(id)?;
        let regmap: &[u32] = cmd.regmap();
        // Both the input and output context words must be present.
        let ctx: usize = if regmap.len() < 6 {
            error!(
                "ctx_in(): regmap too small for context parameters (uid={:?}, size={:?})",
                cmd.uid(),
                regmap.len()
            );
            0
        } else {
            regmap[CTX_IN_REGMAP_IX] as usize
        };
        if ctx < self.ctx_cfg {
            Some(ctx)
        } else {
            error!(
                "ctx_in(): invalid input context (cu={:?}, uid={:?}, ctx={:?}, max={:?})",
                self.idx,
                cmd.uid(),
                ctx,
                self.ctx_cfg
            );
            None
        }
    }

    /// Context of the command the CU just finished. An out-of-range value faults the CU.
    fn ctx_out(&mut self, pool: &mut CommandPool) -> Option<usize> {
        if self.ctx_cfg == 0 {
            return Some(0);
        }
        let ctx: usize = self.bar.read32(self.addr as usize + CTX_OUT_OFFSET) as usize;
        if ctx < self.ctx_cfg {
            return Some(ctx);
        }
        error!(
            "ctx_out(): invalid output context (cu={:?}, ctx={:?}, max={:?})",
            self.idx, ctx, self.ctx_cfg
        );
        self.abort(pool);
        None
    }

    /// Moves a started command straight to the done queue, flagged as aborted.
    fn abort_cmd(&mut self, pool: &mut CommandPool, id: CommandId) {
        if let Some(cmd) = pool.get_mut(id) {
            error!("abort_cmd(): cu={:?}, uid={:?}", self.idx, cmd.uid());
            cmd.set_aborted();
        }
        self.done.push_back(id);
    }

    /// Aborts every command on every context and marks the CU unusable until it is reset.
    pub fn abort(&mut self, pool: &mut CommandPool) {
        for ctx in 0..self.ctx.len() {
            while let Some(id) = self.ctx[ctx].pop_front() {
                self.abort_cmd(pool, id);
                self.run_cnt = self.run_cnt.saturating_sub(1);
            }
        }
        self.error = true;
        error!("abort(): cu={:?} marked in error", self.idx);
    }

    /// Moves the oldest command of the reported context to the done queue.
    fn pop_ctx(&mut self, pool: &mut CommandPool) -> bool {
        let ctx: usize = match self.ctx_out(pool) {
            Some(ctx) => ctx,
            None => return false,
        };
        match self.ctx.get_mut(ctx).and_then(|queue| queue.pop_front()) {
            Some(id) => {
                trace!("pop_ctx(): cu={:?}, ctx={:?}, id={:?}", self.idx, ctx, id);
                self.done.push_back(id);
                self.run_cnt = self.run_cnt.saturating_sub(1);
                true
            },
            None => {
                error!("pop_ctx(): missing cmd (cu={:?}, ctx={:?})", self.idx, ctx);
                self.abort(pool);
                false
            },
        }
    }

    /// Tracks a command on its context, or aborts it at once if the context is bad or the CU is faulted.
    fn push_ctx(&mut self, pool: &mut CommandPool, id: CommandId) -> bool {
        let ctx: Option<usize> = if self.error { None } else { self.ctx_in(pool, id) };
        match ctx.filter(|ctx| *ctx < self.ctx.len()) {
            Some(ctx) => {
                trace!("push_ctx(): cu={:?}, ctx={:?}, id={:?}", self.idx, ctx, id);
                self.ctx[ctx].push_back(id);
                self.run_cnt += 1;
                true
            },
            None => {
                self.abort_cmd(pool, id);
                false
            },
        }
    }

    /// Acknowledges a completion on a dataflow CU.
    fn acknowledge(&self) {
        if !self.is_dataflow() {
            return;
        }
        self.bar.write32(self.addr as usize, AP_CONTINUE);
        // The embedded scheduler holds back further notifications until acknowledged.
        if let Some(poll) = self.poll.as_ref().filter(|_| self.run_cnt > 0) {
            poll.io.write32(poll.offset, AP_CONTINUE);
        }
    }

    /// Reads the control register and retires one command if it signals completion.
    pub fn poll(&mut self, pool: &mut CommandPool) {
        self.ctrlreg = self.status();
        trace!("poll(): cu={:?}, ctrlreg={:#x}, run={:?}", self.idx, self.ctrlreg, self.run_cnt);
        if self.run_cnt > 0 && (self.ctrlreg & self.ap_check) != 0 {
            self.pop_ctx(pool);
            self.acknowledge();
        }
    }

    /// Checks whether the CU can accept another command, polling it if needed.
    pub fn ready(&mut self, pool: &mut CommandPool) -> bool {
        if (self.ctrlreg & AP_START) != 0 || (!self.is_dataflow() && self.run_cnt > 0) {
            self.poll(pool);
        }
        if self.is_dataflow() {
            (self.ctrlreg & AP_START) == 0
        } else {
            self.run_cnt == 0
        }
    }

    /// Writes the register map of a command and asserts start.
    ///
    /// A command with a bad context, or sent to a faulted CU, lands directly on the done queue as aborted.
    pub fn start(&mut self, pool: &mut CommandPool, id: CommandId) {
        if !self.push_ctx(pool, id) {
            return;
        }

        if let Some(cmd) = pool.get(id) {
            let regmap: &[u32] = cmd.regmap();
            if cmd.opcode() == Some(Opcode::ExecWrite) {
                let mut ix: usize = REGMAP_FIRST_PAIR;
                while ix + 1 < regmap.len() {
                    self.bar.write32(self.addr as usize + regmap[ix] as usize, regmap[ix + 1]);
                    ix += 2;
                }
            } else if regmap.len() > REGMAP_FIRST_ARG {
                self.bar
                    .write_block(self.addr as usize + (REGMAP_FIRST_ARG << 2), &regmap[REGMAP_FIRST_ARG..]);
            }
        }

        self.ctrlreg |= AP_START;
        self.bar.write32(self.addr as usize, AP_START);
        if let Some(poll) = self.poll.as_ref() {
            poll.io.write32(poll.offset, AP_START);
        }
        trace!("start(): cu={:?}, id={:?}, run={:?}", self.idx, id, self.run_cnt);
    }

    /// First finished command, polling the CU if nothing is known to be done.
    pub fn first_done(&mut self, pool: &mut CommandPool) -> Option<CommandId> {
        if self.done.is_empty() && self.run_cnt > 0 {
            self.poll(pool);
        }
        self.done.front().copied()
    }

    pub fn pop_done(&mut self) -> Option<CommandId> {
        self.done.pop_front()
    }

    /// Stops tracking a command, wherever it is queued.
    pub fn forget(&mut self, id: CommandId) -> bool {
        for queue in self.ctx.iter_mut() {
            if let Some(pos) = queue.iter().position(|x| *x == id) {
                queue.remove(pos);
                self.run_cnt = self.run_cnt.saturating_sub(1);
                return true;
            }
        }
        if let Some(pos) = self.done.iter().position(|x| *x == id) {
            self.done.remove(pos);
            return true;
        }
        false
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
