// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::bitmap::Bitmap128,
    kds::{
        command::{
            CommandId,
            CommandPool,
        },
        cu::{
            ComputeUnit,
            PollAddress,
            AP_IDLE,
            AP_START,
        },
        diagnostics::{
            CuDiagnostics,
            Diagnostics,
            ErtDiagnostics,
        },
        ert::{
            EmbeddedScheduler,
            CTRL_SLOT,
        },
        packet::{
            CommandState,
            CommandType,
            ConfigFeatures,
            ConfigurePacket,
            Opcode,
        },
        register::SharedRegisterIo,
    },
    runtime::{
        self,
        fail::Fail,
        limits,
    },
};
use ::arrayvec::ArrayVec;
use ::bit_iter::BitIter;
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Condvar,
        Mutex,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Slot count forced on embedded schedulers that move CU arguments by DMA.
const CU_DMA_MAX_SLOTS: usize = 32;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Identity of an accelerator image.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub struct XclbinId(u128);

/// How commands of an execution core reach the hardware and how their completion is detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecMode {
    /// Host starts and polls CUs. Control commands complete inline.
    HostScheduled,
    /// Every command goes through the embedded scheduler command queue.
    FullErt,
    /// Host starts dataflow CUs and the embedded scheduler polls them on its behalf.
    HybridPoll,
}

/// Completion channel through which some embedded schedulers report finished slots.
pub trait CompletionMailbox: Send + Sync {
    /// Next finished slot, if any.
    fn pop_slot(&self) -> Option<usize>;
}

/// Executes host-local commands, such as buffer copies.
pub trait LocalHandler: Send + Sync {
    fn execute(&self, packet: &[u32]) -> Result<(), Fail>;
}

/// Hardware resources of a device, handed to its execution core.
#[derive(Clone)]
pub struct ExecResources {
    /// CU register space.
    pub bar: SharedRegisterIo,
    /// Embedded scheduler status registers.
    pub csr: SharedRegisterIo,
    /// Embedded scheduler command queue.
    pub cq: SharedRegisterIo,
    pub cq_size: usize,
    pub intr_base: u32,
    pub intr_num: u32,
    /// Whether the shell carries an embedded scheduler.
    pub ert_available: bool,
    pub dsa52: bool,
    /// Copy engines exposed as implicit CUs. Zero entries are unused.
    pub cdma_addrs: ArrayVec<u32, { limits::MAX_CDMA }>,
    pub mailbox: Option<Arc<dyn CompletionMailbox>>,
    pub local_handler: Option<Arc<dyn LocalHandler>>,
    /// Shell quirk that disables CU argument DMA.
    pub cu_dma_off: bool,
}

/// Interrupt state shared between the interrupt entry and the scheduler.
#[derive(Default)]
pub struct IrqStatus {
    /// One flag per status register with unread completions.
    pending: [AtomicBool; limits::MAX_STATUS_REGISTERS],
    polling: AtomicBool,
}

/// Completion accounting of a device and wake-up of threads waiting on it.
#[derive(Default)]
pub struct HostNotifier {
    outstanding: AtomicUsize,
    total: AtomicU64,
    generation: Mutex<u64>,
    cond: Condvar,
}

/// Command-processing state of one device.
pub struct ExecCore {
    index: usize,
    res: ExecResources,
    /// Commands the scheduler must keep polling for.
    poll: Arc<AtomicUsize>,
    irq: Arc<IrqStatus>,
    notifier: Arc<HostNotifier>,
    mode: ExecMode,
    xclbin_id: Option<XclbinId>,
    num_cus: usize,
    num_cdma: usize,
    cq_interrupt: bool,
    configure_active: bool,
    configured: bool,
    stopped: bool,
    flush: bool,
    /// Kept across reconfigurations and reset in place.
    cus: Vec<ComputeUnit>,
    ert: Option<EmbeddedScheduler>,
    pending_cu: Vec<VecDeque<CommandId>>,
    pending_ctrl: VecDeque<CommandId>,
    pending_kds: VecDeque<CommandId>,
    running: VecDeque<CommandId>,
    /// Queued commands not yet submitted.
    staging: VecDeque<CommandId>,
    /// Commands left behind by a reset, aborted on the next pass.
    stale: Vec<CommandId>,
    num_running: usize,
    num_pending: usize,
    cu_load: Vec<usize>,
    cu_usage: Vec<u32>,
    cu_status: Vec<u32>,
    first_cu: usize,
}

pub type SharedExecCore = Arc<Mutex<ExecCore>>;

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ExecResources {
    /// Resources of a device with an embedded scheduler and a command queue of `cq_size` bytes.
    pub fn new(bar: SharedRegisterIo, csr: SharedRegisterIo, cq: SharedRegisterIo, cq_size: usize) -> Self {
        Self {
            bar,
            csr,
            cq,
            cq_size,
            intr_base: 0,
            intr_num: limits::MAX_STATUS_REGISTERS as u32,
            ert_available: true,
            dsa52: false,
            cdma_addrs: ArrayVec::new(),
            mailbox: None,
            local_handler: None,
            cu_dma_off: false,
        }
    }
}

impl IrqStatus {
    /// Flags status register `mask_idx` as holding completions.
    pub fn set_pending(&self, mask_idx: usize) -> bool {
        match self.pending.get(mask_idx) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            },
            None => false,
        }
    }

    /// Consumes the pending flag of status register `mask_idx`.
    pub fn take_pending(&self, mask_idx: usize) -> bool {
        self.pending
            .get(mask_idx)
            .is_some_and(|flag| flag.swap(false, Ordering::AcqRel))
    }

    pub fn clear(&self) {
        for flag in self.pending.iter() {
            flag.store(false, Ordering::Release);
        }
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    pub fn set_polling(&self, polling: bool) {
        self.polling.store(polling, Ordering::Release);
    }
}

impl HostNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts for an admitted command.
    pub fn note_added(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    /// Accounts for a finished command and wakes every waiter.
    pub fn notify(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        *runtime::lock(&self.generation) += 1;
        self.cond.notify_all();
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Number of notifications so far.
    pub fn generation(&self) -> u64 {
        *runtime::lock(&self.generation)
    }

    /// Blocks until a notification newer than `seen` arrives or `timeout` elapses. Returns the current generation.
    pub fn wait_for(&self, seen: u64, timeout: Duration) -> u64 {
        let guard = runtime::lock(&self.generation);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

impl ExecCore {
    pub fn new(index: usize, res: ExecResources, poll: Arc<AtomicUsize>, notifier: Arc<HostNotifier>) -> Self {
        let irq: Arc<IrqStatus> = Arc::new(IrqStatus::default());
        irq.set_polling(true);
        Self {
            index,
            res,
            poll,
            irq,
            notifier,
            mode: ExecMode::HostScheduled,
            xclbin_id: None,
            num_cus: 0,
            num_cdma: 0,
            cq_interrupt: false,
            configure_active: false,
            configured: false,
            stopped: false,
            flush: false,
            cus: Vec::new(),
            ert: None,
            pending_cu: (0..limits::MAX_CUS).map(|_| VecDeque::new()).collect(),
            pending_ctrl: VecDeque::new(),
            pending_kds: VecDeque::new(),
            running: VecDeque::new(),
            staging: VecDeque::new(),
            stale: Vec::new(),
            num_running: 0,
            num_pending: 0,
            cu_load: vec![0; limits::MAX_CUS],
            cu_usage: vec![0; limits::MAX_CUS],
            cu_status: vec![0; limits::MAX_CUS],
            first_cu: usize::MAX,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn irq(&self) -> Arc<IrqStatus> {
        self.irq.clone()
    }

    pub fn notifier(&self) -> Arc<HostNotifier> {
        self.notifier.clone()
    }

    pub fn resources(&self) -> &ExecResources {
        &self.res
    }

    pub fn is_polling(&self) -> bool {
        self.irq.is_polling()
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn is_configure_active(&self) -> bool {
        self.configure_active
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_flush(&self) -> bool {
        self.flush
    }

    /// Fails every live and newly submitted command on the next pass.
    pub fn set_flush(&mut self) {
        error!("set_flush(): exec={:?} flushing commands", self.index);
        self.flush = true;
    }

    pub fn cq_interrupt(&self) -> bool {
        self.cq_interrupt
    }

    pub fn xclbin_id(&self) -> Option<XclbinId> {
        self.xclbin_id
    }

    pub fn num_cus(&self) -> usize {
        self.num_cus
    }

    pub fn num_cdma(&self) -> usize {
        self.num_cdma
    }

    pub fn num_running(&self) -> usize {
        self.num_running
    }

    pub fn num_pending(&self) -> usize {
        self.num_pending
    }

    /// Commands submitted to or running on CU `cu_idx`.
    pub fn cu_load(&self, cu_idx: usize) -> usize {
        self.cu_load.get(cu_idx).copied().unwrap_or(0)
    }

    pub fn cu(&self, cu_idx: usize) -> Option<&ComputeUnit> {
        self.cus.get(cu_idx).filter(|_| cu_idx < self.num_cus)
    }

    pub fn ert(&self) -> Option<&EmbeddedScheduler> {
        self.ert.as_ref()
    }

    /// Base address of CU `cu_idx`.
    pub fn cu_base_addr(&self, cu_idx: usize) -> Option<u32> {
        self.cu(cu_idx).map(|cu| cu.base_addr())
    }

    /// Number of commands started on CU `cu_idx`.
    pub fn cu_usage(&self, cu_idx: usize) -> u32 {
        match (self.mode, self.ert.as_ref()) {
            (ExecMode::FullErt, Some(ert)) => ert.cu_usage(cu_idx),
            _ => self.cu_usage.get(cu_idx).copied().unwrap_or(0),
        }
    }

    pub fn cu_status(&self, cu_idx: usize) -> u32 {
        self.cu_status.get(cu_idx).copied().unwrap_or(0)
    }

    /// Checks whether a command with `opcode` may be added to this core.
    pub fn can_admit(&self, opcode: Option<Opcode>) -> Result<(), Fail> {
        if self.stopped {
            let cause: String = format!("execution core {:?} is stopped", self.index);
            warn!("can_admit(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        if self.flush {
            let cause: String = format!("execution core {:?} is flushing", self.index);
            warn!("can_admit(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        if !self.configured && opcode != Some(Opcode::Configure) {
            let cause: String = format!("execution core {:?} is not configured (opcode={:?})", self.index, opcode);
            warn!("can_admit(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(())
    }

    /// Runs one pass of the command pipeline: completion, then submission, then start.
    pub fn service(&mut self, pool: &mut CommandPool) {
        self.abort_stale(pool);
        self.running_to_complete(pool);
        self.queued_to_submitted(pool);
        self.submitted_to_running(pool);
    }

    /// Takes ownership of a new command.
    pub fn new_to_queued(&mut self, pool: &mut CommandPool, id: CommandId) {
        let state: CommandState = match pool.get_mut(id) {
            Some(cmd) => cmd.update_state(self.flush),
            None => return,
        };
        if state == CommandState::Abort {
            self.abort_cmd(pool, id);
            return;
        }
        if let Some(cmd) = pool.get_mut(id) {
            cmd.set_state(CommandState::Queued);
        }
        self.staging.push_back(id);
    }

    /// Fails a command that never ran.
    pub fn abort_cmd(&mut self, pool: &mut CommandPool, id: CommandId) {
        let state: CommandState = match pool.get(id) {
            Some(cmd) if cmd.state().is_terminal() => cmd.state(),
            Some(_) => CommandState::Abort,
            None => return,
        };
        self.retire(pool, id, state);
        pool.remove(id);
    }

    /// Fails a command that never ran with `Error`.
    pub fn error_cmd(&mut self, pool: &mut CommandPool, id: CommandId) {
        if let Some(cmd) = pool.get_mut(id) {
            cmd.set_state(CommandState::Error);
        }
        self.abort_cmd(pool, id);
    }

    fn abort_stale(&mut self, pool: &mut CommandPool) {
        for id in ::std::mem::take(&mut self.stale) {
            if let Some(cu_idx) = pool.get(id).and_then(|cmd| cmd.cu_idx()) {
                if let Some(cu) = self.cus.get_mut(cu_idx) {
                    cu.forget(id);
                }
            }
            info!("abort_stale(): exec={:?}, id={:?}", self.index, id);
            if let Some(cmd) = pool.get_mut(id) {
                cmd.set_state(CommandState::Abort);
            }
            self.abort_cmd(pool, id);
        }
    }

    fn queued_to_submitted(&mut self, pool: &mut CommandPool) {
        for id in ::std::mem::take(&mut self.staging) {
            let waiting: bool = match pool.get(id) {
                Some(cmd) => cmd.wait_count() > 0,
                None => continue,
            };
            if !waiting {
                self.submit_cmd(pool, id);
                continue;
            }
            let state: CommandState = match pool.get_mut(id) {
                Some(cmd) => cmd.update_state(self.flush),
                None => continue,
            };
            if state == CommandState::Abort {
                self.abort_cmd(pool, id);
            } else {
                self.staging.push_back(id);
            }
        }
    }

    fn submit_cmd(&mut self, pool: &mut CommandPool, id: CommandId) -> bool {
        let (state, cmd_type): (CommandState, Option<CommandType>) = match pool.get_mut(id) {
            Some(cmd) => (cmd.update_state(self.flush), cmd.cmd_type()),
            None => return false,
        };
        if state == CommandState::Abort {
            self.abort_cmd(pool, id);
            return false;
        }

        let submitted: bool = match cmd_type {
            Some(CommandType::Cu) => self.submit_cu_cmd(pool, id),
            Some(CommandType::KdsLocal) => self.submit_kds_cmd(pool, id),
            Some(CommandType::Ctrl) => self.submit_ctrl_cmd(pool, id),
            other => {
                error!("submit_cmd(): unknown command type {:?}", other);
                self.error_cmd(pool, id);
                false
            },
        };

        if submitted {
            let polling: bool = self.is_polling();
            if let Some(cmd) = pool.get_mut(id) {
                cmd.set_state(CommandState::Submitted);
                if polling {
                    self.poll.fetch_add(1, Ordering::AcqRel);
                    cmd.set_polled(true);
                }
            }
            self.num_pending += 1;
        }
        submitted
    }

    /// Least loaded usable CU among `bitmap`. Ties go to the lowest index.
    pub fn pick_cu(&self, bitmap: &Bitmap128) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for cu_idx in bitmap.iter().take_while(|ix| *ix < self.num_cus) {
            if self.cus.get(cu_idx).map_or(true, |cu| cu.is_faulted()) {
                continue;
            }
            let load: usize = self.cu_load[cu_idx];
            if best.map_or(true, |(_, min)| load < min) {
                best = Some((cu_idx, load));
                if load == 0 {
                    break;
                }
            }
        }
        best.map(|(cu_idx, _)| cu_idx)
    }

    fn submit_cu_cmd(&mut self, pool: &mut CommandPool, id: CommandId) -> bool {
        let bitmap: Bitmap128 = match pool.get(id) {
            Some(cmd) => cmd.cu_bitmap(),
            None => return false,
        };
        let cu_idx: usize = match self.pick_cu(&bitmap) {
            Some(cu_idx) => cu_idx,
            None => {
                warn!("submit_cu_cmd(): no usable CU (exec={:?}, cus={:?})", self.index, bitmap);
                if let Some(cmd) = pool.get_mut(id) {
                    cmd.set_state(CommandState::Abort);
                }
                self.abort_cmd(pool, id);
                return false;
            },
        };
        if let Some(cmd) = pool.get_mut(id) {
            cmd.set_cu(cu_idx);
        }
        self.pending_cu[cu_idx].push_back(id);
        self.cu_load[cu_idx] += 1;
        trace!("submit_cu_cmd(): id={:?}, cu={:?}, load={:?}", id, cu_idx, self.cu_load[cu_idx]);
        true
    }

    fn submit_ctrl_cmd(&mut self, pool: &mut CommandPool, id: CommandId) -> bool {
        let opcode: Option<Opcode> = pool.get(id).and_then(|cmd| cmd.opcode());
        if opcode == Some(Opcode::Configure) {
            let configured: Result<(), Fail> = if self.configure_active {
                Err(Fail::new(libc::EBUSY, "configure already in progress"))
            } else {
                self.cfg_cmd(pool, id)
            };
            if let Err(e) = configured {
                warn!("submit_ctrl_cmd(): configure rejected: {:?}", e);
                self.error_cmd(pool, id);
                return false;
            }
        }
        self.pending_ctrl.push_back(id);
        true
    }

    fn submit_kds_cmd(&mut self, pool: &mut CommandPool, id: CommandId) -> bool {
        let result: Result<(), Fail> = match (pool.get(id), self.res.local_handler.as_ref()) {
            (Some(cmd), Some(handler)) => handler.execute(cmd.packet()),
            (Some(_), None) => Err(Fail::new(libc::EINVAL, "no handler for host-local commands")),
            (None, _) => return false,
        };
        if let Err(e) = result {
            warn!("submit_kds_cmd(): local command failed: {:?}", e);
            self.error_cmd(pool, id);
            return false;
        }
        self.pending_kds.push_back(id);
        true
    }

    fn submitted_to_running(&mut self, pool: &mut CommandPool) {
        let mut started: usize = self.sweep_aborted(pool);
        started += self.start_ctrl(pool);
        started += self.start_cus(pool);
        started += self.start_kds(pool);
        self.num_pending = self.num_pending.saturating_sub(started);
    }

    /// Fails every pending command whose client went away or whose core is flushing, wherever it sits in its queue.
    fn sweep_aborted(&mut self, pool: &mut CommandPool) -> usize {
        let flush: bool = self.flush;
        let mut aborted: Vec<CommandId> = Vec::new();
        let mut keep = |id: &CommandId| -> bool {
            match pool.get_mut(*id).map(|cmd| cmd.update_state(flush)) {
                Some(state) if state == CommandState::Abort => {
                    aborted.push(*id);
                    false
                },
                Some(_) => true,
                None => false,
            }
        };
        for queue in self.pending_cu.iter_mut() {
            queue.retain(&mut keep);
        }
        self.pending_ctrl.retain(&mut keep);
        self.pending_kds.retain(&mut keep);

        if !aborted.is_empty() {
            debug!("sweep_aborted(): exec={:?}, aborted={:?}", self.index, aborted.len());
        }
        let count: usize = aborted.len();
        for id in aborted {
            self.abort_cmd(pool, id);
        }
        count
    }

    /// Fails a pending command whose client went away or whose core is flushing.
    fn take_aborted(&mut self, pool: &mut CommandPool, id: CommandId) -> bool {
        let state: CommandState = match pool.get_mut(id) {
            Some(cmd) => cmd.update_state(self.flush),
            None => return true,
        };
        if state != CommandState::Abort {
            return false;
        }
        self.abort_cmd(pool, id);
        true
    }

    fn start_ctrl(&mut self, pool: &mut CommandPool) -> usize {
        let id: CommandId = match self.pending_ctrl.pop_front() {
            Some(id) => id,
            None => return 0,
        };
        if self.take_aborted(pool, id) || self.start_ctrl_cmd(pool, id) {
            return 1;
        }
        self.pending_ctrl.push_front(id);
        0
    }

    fn start_ctrl_cmd(&mut self, pool: &mut CommandPool, id: CommandId) -> bool {
        let opcode: Option<Opcode> = pool.get(id).and_then(|cmd| cmd.opcode());
        match self.mode {
            // Nothing to run for control commands on the host.
            ExecMode::HostScheduled => {
                self.mark_complete(pool, id);
                pool.remove(id);
                true
            },
            // CU statistics are kept by the host itself.
            ExecMode::HybridPoll if opcode == Some(Opcode::CuStat) => {
                self.mark_complete(pool, id);
                pool.remove(id);
                true
            },
            ExecMode::FullErt | ExecMode::HybridPoll => self.ert_start_cmd(pool, id),
        }
    }

    fn ert_start_cmd(&mut self, pool: &mut CommandPool, id: CommandId) -> bool {
        let write_cu_idx: bool = self.res.mailbox.is_none();
        let (ert, cmd) = match (self.ert.as_mut(), pool.get_mut(id)) {
            (Some(ert), Some(cmd)) => (ert, cmd),
            _ => return false,
        };
        match ert.start(cmd, id, write_cu_idx) {
            Some(slot) => {
                cmd.set_slot(Some(slot));
                cmd.set_state(CommandState::Running);
                self.running.push_back(id);
                self.num_running += 1;
                true
            },
            None => false,
        }
    }

    fn start_cus(&mut self, pool: &mut CommandPool) -> usize {
        // Rotate the first CU checked so that low indexes are not favoured.
        self.first_cu = if self.first_cu < self.num_cus {
            self.first_cu + 1
        } else {
            0
        };
        let start_cu: usize = self.first_cu;
        let mut total: usize = 0;
        loop {
            let prev: usize = total;
            total += self.start_cu_range(pool, start_cu, self.num_cus);
            total += self.start_cu_range(pool, 0, start_cu.min(self.num_cus));
            if total <= prev {
                break;
            }
        }
        total
    }

    fn start_cu_range(&mut self, pool: &mut CommandPool, start: usize, end: usize) -> usize {
        let mut started: usize = 0;
        for cu_idx in start..end {
            let id: CommandId = match self.pending_cu[cu_idx].front() {
                Some(id) => *id,
                None => continue,
            };
            if self.take_aborted(pool, id) || self.start_cu_cmd(pool, cu_idx, id) {
                self.pending_cu[cu_idx].pop_front();
                started += 1;
            }
        }
        started
    }

    fn start_cu_cmd(&mut self, pool: &mut CommandPool, cu_idx: usize, id: CommandId) -> bool {
        match self.mode {
            ExecMode::HostScheduled | ExecMode::HybridPoll => {
                let cu: &mut ComputeUnit = match self.cus.get_mut(cu_idx) {
                    Some(cu) => cu,
                    None => return false,
                };
                if !cu.ready(pool) {
                    return false;
                }
                cu.start(pool, id);
                if let Some(cmd) = pool.get_mut(id) {
                    cmd.set_state(CommandState::Running);
                }
                self.running.push_back(id);
                self.num_running += 1;
                self.cu_usage[cu_idx] = self.cu_usage[cu_idx].wrapping_add(1);
                true
            },
            ExecMode::FullErt => self.ert_start_cmd(pool, id),
        }
    }

    fn start_kds(&mut self, pool: &mut CommandPool) -> usize {
        let id: CommandId = match self.pending_kds.pop_front() {
            Some(id) => id,
            None => return 0,
        };
        if !self.take_aborted(pool, id) {
            // Already executed at submission.
            self.mark_complete(pool, id);
            pool.remove(id);
        }
        1
    }

    fn running_to_complete(&mut self, pool: &mut CommandPool) {
        let running: Vec<CommandId> = self.running.iter().copied().collect();
        for id in running {
            let state: CommandState = match pool.get(id) {
                Some(cmd) => cmd.state(),
                None => continue,
            };
            // A single query may complete several commands.
            if state != CommandState::Running {
                continue;
            }
            if self.flush {
                self.purge(pool, id);
                self.mark_state(pool, id, CommandState::Abort);
                continue;
            }
            self.query_cmd(pool, id);
        }

        let mut finished: Vec<CommandId> = Vec::new();
        self.running.retain(|id| match pool.get(*id) {
            Some(cmd) if cmd.state().is_terminal() => {
                finished.push(*id);
                false
            },
            Some(_) => true,
            None => false,
        });
        for id in finished {
            self.num_running = self.num_running.saturating_sub(1);
            pool.remove(id);
        }
    }

    /// Drops a running command from the CU tracking it.
    fn purge(&mut self, pool: &CommandPool, id: CommandId) {
        if let Some(cu_idx) = pool.get(id).and_then(|cmd| cmd.cu_idx()) {
            if let Some(cu) = self.cus.get_mut(cu_idx) {
                cu.forget(id);
            }
        }
    }

    fn query_cmd(&mut self, pool: &mut CommandPool, id: CommandId) {
        let (is_ctrl, cu_idx, slot_idx): (bool, Option<usize>, Option<usize>) = match pool.get(id) {
            Some(cmd) => (cmd.cmd_type() == Some(CommandType::Ctrl), cmd.cu_idx(), cmd.slot_idx()),
            None => return,
        };
        match self.mode {
            ExecMode::HostScheduled => {
                if let Some(cu_idx) = cu_idx.filter(|_| !is_ctrl) {
                    self.penguin_query(pool, cu_idx, id);
                }
            },
            ExecMode::FullErt => self.ert_query_cmd(pool, is_ctrl, slot_idx),
            ExecMode::HybridPoll if is_ctrl => self.ert_query_cmd(pool, is_ctrl, slot_idx),
            // Status register bits stand for CUs, offset by one for the control slot.
            ExecMode::HybridPoll => {
                if let Some(cu_idx) = cu_idx {
                    self.ert_query_csr(pool, is_ctrl, (cu_idx + 1) >> 5);
                }
            },
        }
    }

    fn penguin_query(&mut self, pool: &mut CommandPool, cu_idx: usize, id: CommandId) {
        let done: bool = match self.cus.get_mut(cu_idx) {
            Some(cu) => {
                if cu.first_done(pool) == Some(id) {
                    cu.pop_done();
                    true
                } else {
                    false
                }
            },
            None => false,
        };
        if done {
            self.mark_complete(pool, id);
        }
    }

    fn ert_query_cmd(&mut self, pool: &mut CommandPool, is_ctrl: bool, slot_idx: Option<usize>) {
        if self.res.mailbox.is_some() {
            self.ert_query_mailbox(pool, is_ctrl);
        } else if let Some(slot) = slot_idx {
            self.ert_query_csr(pool, is_ctrl, slot >> 5);
        }
    }

    fn ert_query_mailbox(&mut self, pool: &mut CommandPool, is_ctrl: bool) {
        let mailbox: Arc<dyn CompletionMailbox> = match self.res.mailbox.as_ref() {
            Some(mailbox) => mailbox.clone(),
            None => return,
        };
        let mut slots: Vec<usize> = Vec::new();
        while let Some(slot) = mailbox.pop_slot() {
            slots.push(slot);
        }
        for slot in slots {
            if is_ctrl && slot == CTRL_SLOT {
                self.process_cmd_mask(pool, 0x1, 0);
                continue;
            }
            self.process_mask(pool, 1 << (slot & 31), slot >> 5);
        }
    }

    fn ert_query_csr(&mut self, pool: &mut CommandPool, is_ctrl: bool, mask_idx: usize) {
        if !(self.is_polling() || self.irq.take_pending(mask_idx)) {
            return;
        }
        let mut mask: u32 = match self.ert.as_ref() {
            Some(ert) => ert.read_status(mask_idx),
            None => return,
        };
        trace!("ert_query_csr(): mask_idx={:?}, mask={:#x}", mask_idx, mask);
        if mask == 0 {
            return;
        }
        if is_ctrl && mask_idx == 0 && (mask & 0x1) != 0 {
            self.process_cmd_mask(pool, 0x1, 0);
            mask ^= 0x1;
        }
        if mask != 0 {
            self.process_mask(pool, mask, mask_idx);
        }
    }

    fn process_mask(&mut self, pool: &mut CommandPool, mask: u32, mask_idx: usize) {
        match self.mode {
            ExecMode::FullErt => self.process_cmd_mask(pool, mask, mask_idx),
            ExecMode::HybridPoll => self.process_cu_mask(pool, mask, mask_idx),
            ExecMode::HostScheduled => warn!("process_mask(): unexpected status (mask={:#x})", mask),
        }
    }

    /// Completes the commands in the slots flagged by `mask`.
    fn process_cmd_mask(&mut self, pool: &mut CommandPool, mask: u32, mask_idx: usize) {
        for bit in BitIter::from(mask) {
            let slot: usize = (mask_idx << 5) + bit;
            if let Some(id) = self.ert.as_ref().and_then(|ert| ert.command_at(slot)) {
                self.mark_complete(pool, id);
            }
        }
    }

    /// Completes every finished command of the CUs flagged by `mask`.
    fn process_cu_mask(&mut self, pool: &mut CommandPool, mask: u32, mask_idx: usize) {
        for bit in BitIter::from(mask) {
            let cu_idx: usize = match ((mask_idx << 5) + bit).checked_sub(1) {
                Some(cu_idx) if cu_idx < self.num_cus => cu_idx,
                _ => continue,
            };
            // The CU may already have been polled when it was last started.
            loop {
                let id: CommandId = match self.cus[cu_idx].first_done(pool) {
                    Some(id) => id,
                    None => break,
                };
                self.cus[cu_idx].pop_done();
                self.mark_complete(pool, id);
            }
        }
    }

    fn mark_complete(&mut self, pool: &mut CommandPool, id: CommandId) {
        let state: CommandState = match pool.get(id) {
            Some(cmd) if cmd.is_aborted() => CommandState::Abort,
            Some(_) => CommandState::Completed,
            None => return,
        };
        self.mark_state(pool, id, state);
    }

    /// Moves a command to a terminal state. The caller frees it.
    fn mark_state(&mut self, pool: &mut CommandPool, id: CommandId, state: CommandState) {
        let is_ctrl: bool = match pool.get(id) {
            Some(cmd) => cmd.cmd_type() == Some(CommandType::Ctrl),
            None => return,
        };
        if is_ctrl {
            self.finish_cmd(pool, id, state);
        }
        self.retire(pool, id, state);
    }

    /// Post-processing of control commands.
    fn finish_cmd(&mut self, pool: &CommandPool, id: CommandId, state: CommandState) {
        let (opcode, slot_idx): (Option<Opcode>, Option<usize>) = match pool.get(id) {
            Some(cmd) => (cmd.opcode(), cmd.slot_idx()),
            None => return,
        };
        match opcode {
            Some(Opcode::Configure) if state == CommandState::Completed => {
                info!("finish_cmd(): exec={:?} configured (mode={:?})", self.index, self.mode);
                self.configured = true;
                self.configure_active = false;
            },
            Some(Opcode::Configure) => self.configure_active = false,
            Some(Opcode::CuStat) => {
                if let (ExecMode::FullErt, Some(ert), Some(slot)) = (self.mode, self.ert.as_mut(), slot_idx) {
                    ert.read_custat(slot, self.num_cus);
                }
                self.update_custatus();
            },
            _ => (),
        }
    }

    /// Publishes the final state, releases what the command holds and wakes its dependents.
    fn retire(&mut self, pool: &mut CommandPool, id: CommandId, state: CommandState) {
        let cmd = match pool.get_mut(id) {
            Some(cmd) => cmd,
            None => return,
        };
        trace!("retire(): exec={:?}, uid={:?}, state={:?}", self.index, cmd.uid(), state);
        if let Some(cu_idx) = cmd.cu_idx() {
            if let Some(load) = self.cu_load.get_mut(cu_idx) {
                *load = load.saturating_sub(1);
            }
            cmd.clear_cu();
        }
        cmd.publish_state(state);
        if cmd.is_polled() {
            let _ = self
                .poll
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            cmd.set_polled(false);
        }
        if let (Some(ert), Some(slot)) = (self.ert.as_mut(), cmd.slot_idx()) {
            ert.release_slot(slot, cmd.cmd_type() == Some(CommandType::Ctrl));
            cmd.set_slot(None);
        }
        cmd.client().note_completed();
        self.notifier.notify();

        pool.mark_deactive(id);
        pool.trigger_chain(id);
    }

    /// Applies a configure command. On success the core enters its new mode with configuration in progress.
    fn cfg_cmd(&mut self, pool: &mut CommandPool, id: CommandId) -> Result<(), Fail> {
        if self.configured {
            info!("cfg_cmd(): exec={:?} is already configured", self.index);
            return Err(Fail::new(libc::EINVAL, "execution core is already configured"));
        }
        let mut cfg: ConfigurePacket = match pool.get(id) {
            Some(cmd) => ConfigurePacket::parse(cmd.packet())?,
            None => return Err(Fail::new(libc::EINVAL, "no such command")),
        };
        if cfg.slot_size == 0 {
            return Err(Fail::new(libc::EINVAL, "configure command has zero slot size"));
        }

        let ert: bool = self.res.mailbox.is_some() || self.res.ert_available;
        let mut ert_full: bool = ert && cfg.features.ert() && !cfg.features.dataflow();
        let mut ert_poll: bool = ert && cfg.features.ert() && cfg.features.dataflow();
        if self.res.mailbox.is_some() {
            info!("cfg_cmd(): forcing polling mode for mailbox completion");
            cfg.features = cfg.features.with(ConfigFeatures::POLLING, true);
            ert_full = cfg.features.ert();
            ert_poll = false;
        }

        let cq_size: usize = self.res.cq_size;
        let mut slot_size: usize = cfg.slot_size as usize;
        let mut num_slots: usize = cq_size / slot_size;
        if num_slots > limits::MAX_SLOTS || num_slots == 0 {
            num_slots = num_slots.clamp(1, limits::MAX_SLOTS);
            slot_size = cq_size / num_slots;
        }
        if ert_full && cfg.features.cu_dma() && num_slots > CU_DMA_MAX_SLOTS {
            info!("cfg_cmd(): limiting command queue to {:?} slots", CU_DMA_MAX_SLOTS);
            num_slots = CU_DMA_MAX_SLOTS;
            slot_size = cq_size / num_slots;
        }
        if ert_poll {
            slot_size = cq_size / limits::MAX_CUS;
        }

        // Copy engines are appended as implicit CUs.
        let mut num_cdma: usize = 0;
        for addr in self.res.cdma_addrs.iter().filter(|addr| **addr != 0) {
            if cfg.cu_addrs.len() >= limits::MAX_CUS {
                break;
            }
            cfg.cu_addrs.push(*addr);
            num_cdma += 1;
        }
        // Slot 0 is reserved for control commands, which leaves one fewer poll address than slots.
        if ert_poll && cfg.cu_addrs.len() >= limits::MAX_CUS {
            let cause: String = format!("too many CUs for assisted polling ({:?})", cfg.cu_addrs.len());
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        self.num_cus = cfg.cu_addrs.len();
        self.num_cdma = num_cdma;
        while self.cus.len() < self.num_cus {
            self.cus.push(ComputeUnit::new(self.res.bar.clone()));
        }
        for (cu_idx, addr) in cfg.cu_addrs.iter().enumerate() {
            let poll: Option<PollAddress> = if ert_poll {
                Some(PollAddress {
                    io: self.res.cq.clone(),
                    offset: (cu_idx + 1) * slot_size,
                })
            } else {
                None
            };
            self.cus[cu_idx].reset(cu_idx, *addr, poll);
        }

        if (ert_full || ert_poll) && self.ert.is_none() {
            self.ert = Some(EmbeddedScheduler::new(self.res.csr.clone(), self.res.cq.clone()));
        }

        let cq_int: bool = cfg.features.cq_int();
        match self.ert.as_mut() {
            Some(ert) if ert_poll => {
                info!("cfg_cmd(): configuring dataflow mode with assisted polling");
                cfg.features = cfg
                    .features
                    .with(ConfigFeatures::CU_ISR, false)
                    .with(ConfigFeatures::CU_DMA, false);
                ert.configure(cq_size, limits::MAX_CUS, cq_int);
                self.mode = ExecMode::HybridPoll;
                self.irq.set_polling(cfg.features.polling());
            },
            Some(ert) if ert_full => {
                info!("cfg_cmd(): configuring embedded scheduler mode");
                ert.configure(cq_size, num_slots, cq_int);
                self.mode = ExecMode::FullErt;
                self.irq.set_polling(cfg.features.polling());
                self.cq_interrupt = cq_int;
                cfg.features = cfg
                    .features
                    .with(ConfigFeatures::DSA52, self.res.dsa52)
                    .with(ConfigFeatures::CDMA, num_cdma > 0);
            },
            _ => {
                info!("cfg_cmd(): configuring host scheduled mode");
                self.mode = ExecMode::HostScheduled;
                self.irq.set_polling(true);
            },
        }

        if self.res.cu_dma_off {
            cfg.features = cfg.features.with(ConfigFeatures::CU_DMA, false);
        }

        // Other configure commands are refused until this one completes.
        self.configure_active = true;

        info!(
            "cfg_cmd(): exec={:?}, mode={:?}, dataflow={:?}, slots={:?}, cudma={:?}, cdma={:?}, cus={:?}",
            self.index,
            self.mode,
            cfg.features.dataflow(),
            num_slots,
            cfg.features.cu_dma(),
            self.num_cdma,
            self.num_cus
        );

        cfg.slot_size = slot_size as u32;
        if let Some(cmd) = pool.get_mut(id) {
            cmd.set_packet(cfg.to_words());
        }
        Ok(())
    }

    fn update_custatus(&mut self) {
        let num_regular: usize = self.num_cus.saturating_sub(self.num_cdma);
        for cu_idx in 0..self.num_cus {
            let status: u32 = match (self.cus.get(cu_idx), self.mode, self.ert.as_ref()) {
                // Copy engines and free-running kernels are not mapped.
                (Some(cu), _, _) if cu_idx >= num_regular || !cu.is_valid() => 0,
                (Some(_), ExecMode::FullErt, Some(ert)) => {
                    if ert.cu_status(cu_idx) != 0 {
                        AP_START
                    } else {
                        AP_IDLE
                    }
                },
                (Some(cu), _, _) => cu.status(),
                (None, _, _) => 0,
            };
            self.cu_status[cu_idx] = status;
        }
    }

    /// Prepares the core for accelerator image `xclbin_id`.
    ///
    /// Loading the image already configured only lifts a stop. Otherwise configuration is dropped and every command
    /// left in the core is aborted on the next pass.
    pub fn reset(&mut self, xclbin_id: Option<XclbinId>) {
        info!("reset(): exec={:?}, configured={:?}", self.index, self.configured);
        if xclbin_id.is_none() || (self.xclbin_id == xclbin_id && self.configured) {
            self.stopped = false;
            return;
        }

        info!("reset(): exec={:?}, xclbin {:?} -> {:?}", self.index, self.xclbin_id, xclbin_id);
        self.xclbin_id = xclbin_id;
        self.num_cus = 0;
        self.num_cdma = 0;
        self.irq.set_polling(true);
        self.cq_interrupt = false;
        self.configure_active = false;
        self.configured = false;
        self.stopped = false;
        self.flush = false;
        self.mode = ExecMode::HostScheduled;

        let mut stale: Vec<CommandId> = Vec::new();
        for queue in self.pending_cu.iter_mut() {
            stale.extend(queue.drain(..));
        }
        stale.extend(self.pending_ctrl.drain(..));
        stale.extend(self.pending_kds.drain(..));
        stale.extend(self.staging.drain(..));
        stale.extend(self.running.drain(..));
        if !stale.is_empty() {
            warn!("reset(): exec={:?} drops {:?} commands", self.index, stale.len());
        }
        self.stale.extend(stale);

        self.cu_load.fill(0);
        self.cu_usage.fill(0);
        self.num_running = 0;
        self.num_pending = 0;
        self.irq.clear();
    }

    /// Refuses further commands. Waiting for outstanding ones is up to the caller.
    pub fn stop(&mut self) {
        info!("stop(): exec={:?}", self.index);
        self.stopped = true;
        self.clear_csr();
    }

    /// Drains stale completion status, which assisted polling can leave behind.
    pub fn clear_csr(&mut self) {
        if self.mode == ExecMode::HostScheduled {
            return;
        }
        if let Some(ert) = self.ert.as_ref() {
            for (mask_idx, value) in ert.clear_status().iter().enumerate() {
                if *value != 0 {
                    info!("clear_csr(): csr[{:?}]={:#x} cleared", mask_idx, value);
                }
            }
        }
    }

    /// Requires a new configure command before further work.
    pub fn reconfig(&mut self) {
        info!("reconfig(): exec={:?}", self.index);
        self.configured = false;
        self.configure_active = false;
    }

    /// Aborts every command the core holds, running or not.
    pub fn abort_all(&mut self, pool: &mut CommandPool) {
        for queue in self.pending_cu.iter_mut() {
            self.stale.extend(queue.drain(..));
        }
        self.stale.extend(self.pending_ctrl.drain(..));
        self.stale.extend(self.pending_kds.drain(..));
        self.stale.extend(self.staging.drain(..));
        self.stale.extend(self.running.drain(..));
        self.num_running = 0;
        self.num_pending = 0;
        self.abort_stale(pool);
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let cus: Vec<CuDiagnostics> = (0..self.num_cus)
            .map(|cu_idx| CuDiagnostics {
                base_addr: self.cu_base_addr(cu_idx).unwrap_or(0),
                usage: self.cu_usage(cu_idx),
                status: self.cu_status(cu_idx),
            })
            .collect();
        let ert: Option<ErtDiagnostics> = match (self.mode, self.ert.as_ref()) {
            (ExecMode::FullErt, Some(ert)) => Some(ErtDiagnostics {
                version: ert.version(),
                slot_usage: (0..ert.num_slots()).map(|slot| ert.cq_slot_usage(slot)).collect(),
                slot_busy: (0..ert.num_slots()).map(|slot| ert.is_slot_busy(slot)).collect(),
                slot_status: (0..ert.num_slots()).map(|slot| ert.cq_slot_status(slot)).collect(),
                cu_state: (0..self.num_cus).map(|cu_idx| ert.cu_status(cu_idx)).collect(),
            }),
            _ => None,
        };
        Diagnostics {
            mode: self.mode,
            configured: self.configured,
            stopped: self.stopped,
            flush: self.flush,
            polling: self.is_polling(),
            num_cdma: self.num_cdma,
            num_slots: self.ert.as_ref().map_or(0, |ert| ert.num_slots()),
            cus,
            num_pending: self.num_pending,
            num_running: self.num_running,
            outstanding: self.notifier.outstanding(),
            total: self.notifier.total(),
            ert,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u128> for XclbinId {
    fn from(val: u128) -> Self {
        XclbinId(val)
    }
}

impl From<XclbinId> for u128 {
    fn from(val: XclbinId) -> Self {
        val.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kds::{
        buffer::ExecBuffer,
        client::{
            ClientContext,
            ClientId,
            SharedClient,
        },
        command::Command,
        cu::{
            AP_CONTINUE,
            AP_CTRL_CHAIN,
            AP_DONE,
        },
        ert::{
            CUSTAT_VERSION_MAGIC,
            STATUS_REGISTER_ADDR,
        },
        packet::{
            PacketHeader,
            StartKernelPacket,
        },
        register::MemoryRegion,
    };
    use ::anyhow::Result;

    const CU_STRIDE: u32 = 0x1_0000;

    struct Harness {
        bar: Arc<MemoryRegion>,
        csr: Arc<MemoryRegion>,
        cq: Arc<MemoryRegion>,
        exec: ExecCore,
        pool: CommandPool,
        client: SharedClient,
        poll: Arc<AtomicUsize>,
    }

    /// Slots reported finished by a test embedded scheduler.
    #[derive(Default)]
    struct SlotMailbox {
        slots: Mutex<VecDeque<usize>>,
    }

    impl CompletionMailbox for SlotMailbox {
        fn pop_slot(&self) -> Option<usize> {
            crate::runtime::lock(&self.slots).pop_front()
        }
    }

    impl SlotMailbox {
        fn push(&self, slot: usize) {
            crate::runtime::lock(&self.slots).push_back(slot);
        }
    }

    impl Harness {
        fn new(ert_available: bool) -> Self {
            Self::with_mailbox(ert_available, None)
        }

        fn with_mailbox(ert_available: bool, mailbox: Option<Arc<dyn CompletionMailbox>>) -> Self {
            let bar: Arc<MemoryRegion> = Arc::new(MemoryRegion::new(0x10_0000));
            let csr: Arc<MemoryRegion> = Arc::new(MemoryRegion::new(0x100));
            let cq: Arc<MemoryRegion> = Arc::new(MemoryRegion::new(limits::ERT_CQ_SIZE));
            // Status registers clear when the host reads them.
            for mask_idx in 0..limits::MAX_STATUS_REGISTERS {
                csr.set_clear_on_read(mask_idx << 2);
            }
            let mut res: ExecResources =
                ExecResources::new(bar.clone(), csr.clone(), cq.clone(), limits::ERT_CQ_SIZE);
            res.ert_available = ert_available;
            res.mailbox = mailbox;
            let poll: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
            Self {
                bar,
                csr,
                cq,
                exec: ExecCore::new(0, res, poll.clone(), Arc::new(HostNotifier::new())),
                pool: CommandPool::new(),
                client: Arc::new(ClientContext::new(ClientId::from(1), 1)),
                poll,
            }
        }

        fn submit(&mut self, words: Vec<u32>) -> (CommandId, ExecBuffer) {
            let client: SharedClient = self.client.clone();
            self.submit_as(&client, words)
        }

        fn submit_as(&mut self, client: &SharedClient, words: Vec<u32>) -> (CommandId, ExecBuffer) {
            let buffer: ExecBuffer = ExecBuffer::new(words);
            let cmd: Command = Command::new(0, 0, client.clone(), buffer.clone(), ArrayVec::new());
            let id: CommandId = self.pool.insert(cmd);
            self.exec.new_to_queued(&mut self.pool, id);
            (id, buffer)
        }

        fn configure(&mut self, slot_size: u32, features: ConfigFeatures, num_cus: u32) -> ExecBuffer {
            let cu_addrs: Vec<u32> = (1..=num_cus).map(|ix| ix * CU_STRIDE).collect();
            let (_, buffer) = self.submit(
                ConfigurePacket {
                    slot_size,
                    cu_shift: 16,
                    cu_base_addr: CU_STRIDE,
                    features,
                    cu_addrs,
                }
                .to_words(),
            );
            self.exec.service(&mut self.pool);
            buffer
        }
    }

    #[test]
    fn least_loaded_cu_is_picked() -> Result<()> {
        let mut h: Harness = Harness::new(false);
        h.configure(0x1000, ConfigFeatures::default(), 3);
        crate::ensure_eq!(h.exec.is_configured(), true);
        h.exec.cu_load[0] = 3;
        h.exec.cu_load[1] = 1;
        h.exec.cu_load[2] = 2;
        let all: Bitmap128 = Bitmap128::from_masks(&[0b111]);
        crate::ensure_eq!(h.exec.pick_cu(&all), Some(1));

        h.exec.cu_load[0] = 1;
        crate::ensure_eq!(h.exec.pick_cu(&all), Some(0));
        crate::ensure_eq!(h.exec.pick_cu(&Bitmap128::from_masks(&[0b1000])), None);
        Ok(())
    }

    #[test]
    fn host_scheduled_configure_completes_inline() -> Result<()> {
        let mut h: Harness = Harness::new(true);
        let cfg: ExecBuffer = h.configure(0x1000, ConfigFeatures::default(), 2);
        crate::ensure_eq!(cfg.state(), Some(CommandState::Completed));
        crate::ensure_eq!(h.exec.mode(), ExecMode::HostScheduled);
        crate::ensure_eq!(h.exec.is_polling(), true);
        crate::ensure_eq!(h.exec.cu_base_addr(1), Some(2 * CU_STRIDE));
        crate::ensure_eq!(h.pool.is_empty(), true);
        crate::ensure_eq!(h.poll.load(Ordering::Acquire), 0);
        Ok(())
    }

    #[test]
    fn full_ert_clamps_slots_with_cu_dma() -> Result<()> {
        let mut h: Harness = Harness::new(true);
        let features: ConfigFeatures = ConfigFeatures::default()
            .with(ConfigFeatures::ERT, true)
            .with(ConfigFeatures::CU_DMA, true)
            .with(ConfigFeatures::POLLING, true);
        let cfg: ExecBuffer = h.configure(0x400, features, 4);
        crate::ensure_eq!(h.exec.mode(), ExecMode::FullErt);
        crate::ensure_eq!(h.exec.ert().map(|ert| ert.num_slots()), Some(32));
        crate::ensure_eq!(h.exec.ert().map(|ert| ert.slot_size()), Some(limits::ERT_CQ_SIZE / 32));
        // Completion waits for the embedded scheduler.
        crate::ensure_eq!(cfg.state(), Some(CommandState::New));
        crate::ensure_eq!(h.exec.is_configured(), false);
        crate::ensure_eq!(h.exec.is_configure_active(), true);
        crate::ensure_eq!(h.exec.num_running(), 1);
        Ok(())
    }

    #[test]
    fn dataflow_selects_assisted_polling() -> Result<()> {
        let mut h: Harness = Harness::new(true);
        let features: ConfigFeatures = ConfigFeatures::default()
            .with(ConfigFeatures::ERT, true)
            .with(ConfigFeatures::DATAFLOW, true);
        h.configure(0x1000, features, 2);
        crate::ensure_eq!(h.exec.mode(), ExecMode::HybridPoll);
        crate::ensure_eq!(h.exec.is_polling(), false);
        crate::ensure_eq!(h.exec.ert().map(|ert| ert.num_slots()), Some(limits::MAX_CUS));
        Ok(())
    }

    #[test]
    fn malformed_configure_is_an_error() -> Result<()> {
        let mut h: Harness = Harness::new(true);
        let mut words: Vec<u32> = ConfigurePacket {
            slot_size: 0x1000,
            cu_shift: 16,
            cu_base_addr: 0,
            features: ConfigFeatures::default(),
            cu_addrs: vec![CU_STRIDE],
        }
        .to_words();
        words[2] = 4;
        let (_, buffer) = h.submit(words);
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(buffer.state(), Some(CommandState::Error));
        crate::ensure_eq!(h.exec.is_configured(), false);
        crate::ensure_eq!(h.pool.is_empty(), true);
        Ok(())
    }

    #[test]
    fn host_scheduled_cu_command_runs_to_completion() -> Result<()> {
        let mut h: Harness = Harness::new(false);
        h.configure(0x1000, ConfigFeatures::default(), 2);
        let (_, buffer) = h.submit(
            StartKernelPacket {
                opcode: Opcode::StartCu,
                cu_masks: vec![0b10],
                regmap: vec![0; 6],
            }
            .to_words(),
        );
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(h.exec.num_running(), 1);
        crate::ensure_eq!(h.exec.cu_load(1), 1);
        crate::ensure_eq!(h.poll.load(Ordering::Acquire), 1);

        h.bar.poke((2 * CU_STRIDE) as usize, AP_DONE | AP_IDLE);
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(buffer.state(), Some(CommandState::Completed));
        crate::ensure_eq!(h.exec.cu_load(1), 0);
        crate::ensure_eq!(h.exec.cu_usage(1), 1);
        crate::ensure_eq!(h.poll.load(Ordering::Acquire), 0);
        crate::ensure_eq!(h.pool.is_empty(), true);
        Ok(())
    }

    #[test]
    fn reset_to_new_image_aborts_leftovers() -> Result<()> {
        let mut h: Harness = Harness::new(false);
        h.exec.reset(Some(XclbinId::from(1)));
        h.configure(0x1000, ConfigFeatures::default(), 1);
        let (_, buffer) = h.submit(
            StartKernelPacket {
                opcode: Opcode::StartCu,
                cu_masks: vec![0b1],
                regmap: vec![0; 6],
            }
            .to_words(),
        );
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(h.exec.num_running(), 1);

        // Same image, nothing to do.
        h.exec.reset(Some(XclbinId::from(1)));
        crate::ensure_eq!(h.exec.is_configured(), true);

        h.exec.reset(Some(XclbinId::from(2)));
        crate::ensure_eq!(h.exec.is_configured(), false);
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(buffer.state(), Some(CommandState::Abort));
        crate::ensure_eq!(h.pool.is_empty(), true);
        crate::ensure_eq!(h.poll.load(Ordering::Acquire), 0);
        Ok(())
    }

    #[test]
    fn admission_rules() -> Result<()> {
        let mut h: Harness = Harness::new(false);
        match h.exec.can_admit(Some(Opcode::StartCu)) {
            Err(e) if e.errno == libc::EINVAL => (),
            other => anyhow::bail!("unconfigured core admitted a CU command: {:?}", other),
        }
        h.exec.can_admit(Some(Opcode::Configure))?;
        h.configure(0x1000, ConfigFeatures::default(), 1);
        h.exec.can_admit(Some(Opcode::StartCu))?;
        h.exec.stop();
        match h.exec.can_admit(Some(Opcode::StartCu)) {
            Err(e) if e.errno == libc::EBUSY => (),
            other => anyhow::bail!("stopped core admitted a command: {:?}", other),
        }
        h.exec.reset(None);
        h.exec.can_admit(Some(Opcode::StartCu))?;
        h.exec.reconfig();
        crate::ensure_eq!(h.exec.is_configured(), false);
        Ok(())
    }

    #[test]
    fn dataflow_configure_waits_for_embedded_scheduler() -> Result<()> {
        let mut h: Harness = Harness::new(true);
        let features: ConfigFeatures = ConfigFeatures::default()
            .with(ConfigFeatures::ERT, true)
            .with(ConfigFeatures::DATAFLOW, true)
            .with(ConfigFeatures::POLLING, true);
        let cu_addr: u32 = CU_STRIDE | AP_CTRL_CHAIN;
        let (_, cfg) = h.submit(
            ConfigurePacket {
                slot_size: 0x1000,
                cu_shift: 16,
                cu_base_addr: CU_STRIDE,
                features,
                cu_addrs: vec![cu_addr],
            }
            .to_words(),
        );
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(h.exec.mode(), ExecMode::HybridPoll);
        crate::ensure_eq!(cfg.state(), Some(CommandState::New));
        crate::ensure_eq!(h.exec.cu(0).map(|cu| cu.is_dataflow()), Some(true));
        crate::ensure_eq!(h.exec.ert().map(|ert| ert.is_slot_busy(CTRL_SLOT)), Some(true));
        Ok(())
    }

    fn start_cu(cu_mask: u32, arg: u32) -> Vec<u32> {
        StartKernelPacket {
            opcode: Opcode::StartCu,
            cu_masks: vec![cu_mask],
            regmap: vec![0, 0, 0, 0, arg, 0],
        }
        .to_words()
    }

    #[test]
    fn aborted_client_is_swept_from_behind_other_pending_work() -> Result<()> {
        let mut h: Harness = Harness::new(false);
        h.configure(0x1000, ConfigFeatures::default(), 1);
        let other: SharedClient = Arc::new(ClientContext::new(ClientId::from(2), 2));

        let (_, a1) = h.submit(start_cu(0b1, 1));
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(h.exec.num_running(), 1);

        // Both wait on the busy CU, the other client's command at the front.
        let (_, b1) = h.submit_as(&other, start_cu(0b1, 2));
        let (_, a2) = h.submit(start_cu(0b1, 3));
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(h.exec.num_pending(), 2);
        crate::ensure_eq!(h.exec.cu_load(0), 3);

        h.client.set_abort();
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(a2.state(), Some(CommandState::Abort));
        crate::ensure_eq!(b1.state(), Some(CommandState::New));
        crate::ensure_eq!(a1.state(), Some(CommandState::New));
        crate::ensure_eq!(h.exec.num_pending(), 1);
        crate::ensure_eq!(h.exec.cu_load(0), 2);
        Ok(())
    }

    #[test]
    fn assisted_polling_completes_through_cu_status_bits() -> Result<()> {
        let mut h: Harness = Harness::new(true);
        let features: ConfigFeatures = ConfigFeatures::default()
            .with(ConfigFeatures::ERT, true)
            .with(ConfigFeatures::DATAFLOW, true)
            .with(ConfigFeatures::POLLING, true);
        let (_, cfg) = h.submit(
            ConfigurePacket {
                slot_size: 0x1000,
                cu_shift: 16,
                cu_base_addr: CU_STRIDE,
                features,
                cu_addrs: vec![CU_STRIDE | AP_CTRL_CHAIN],
            }
            .to_words(),
        );
        h.exec.service(&mut h.pool);
        h.csr.poke(STATUS_REGISTER_ADDR, 0x1);
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(cfg.state(), Some(CommandState::Completed));
        crate::ensure_eq!(h.exec.is_configured(), true);

        let (_, buffer) = h.submit(start_cu(0b1, 0));
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(h.exec.num_running(), 1);
        let poll_offset: usize = limits::ERT_CQ_SIZE / limits::MAX_CUS;
        crate::ensure_eq!(h.cq.peek(poll_offset), AP_START);

        // Nothing flagged yet.
        h.bar.poke(CU_STRIDE as usize, AP_DONE);
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(buffer.state(), Some(CommandState::New));

        // Bit 0 is the control slot, CU 0 reports on bit 1.
        h.csr.poke(STATUS_REGISTER_ADDR, 0b10);
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(buffer.state(), Some(CommandState::Completed));
        crate::ensure_eq!(h.bar.peek(CU_STRIDE as usize), AP_CONTINUE);
        crate::ensure_eq!(h.exec.cu_usage(0), 1);
        crate::ensure_eq!(h.pool.is_empty(), true);
        Ok(())
    }

    #[test]
    fn mailbox_reports_finished_slots() -> Result<()> {
        let mailbox: Arc<SlotMailbox> = Arc::new(SlotMailbox::default());
        let mut h: Harness = Harness::with_mailbox(false, Some(mailbox.clone()));
        let cfg: ExecBuffer = h.configure(0x1000, ConfigFeatures::default().with(ConfigFeatures::ERT, true), 2);
        crate::ensure_eq!(h.exec.mode(), ExecMode::FullErt);
        crate::ensure_eq!(h.exec.is_polling(), true);
        crate::ensure_eq!(cfg.state(), Some(CommandState::New));
        mailbox.push(CTRL_SLOT);
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(cfg.state(), Some(CommandState::Completed));

        let (_, buffer) = h.submit(start_cu(0b10, 0));
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(h.exec.ert().map(|ert| ert.is_slot_busy(1)), Some(true));
        // The CU mask is passed through unchanged, the embedded scheduler picks the CU.
        crate::ensure_eq!(h.cq.peek(0x1000 + 4), 0b10);

        h.exec.service(&mut h.pool);
        crate::ensure_eq!(buffer.state(), Some(CommandState::New));
        mailbox.push(1);
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(buffer.state(), Some(CommandState::Completed));
        crate::ensure_eq!(h.exec.ert().map(|ert| ert.is_slot_busy(1)), Some(false));
        crate::ensure_eq!(h.exec.num_running(), 0);
        Ok(())
    }

    #[test]
    fn cu_statistics_are_read_back_from_the_slot() -> Result<()> {
        let mut h: Harness = Harness::new(true);
        let features: ConfigFeatures = ConfigFeatures::default()
            .with(ConfigFeatures::ERT, true)
            .with(ConfigFeatures::POLLING, true);
        h.configure(0x1000, features, 2);
        h.csr.poke(STATUS_REGISTER_ADDR, 0x1);
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(h.exec.is_configured(), true);

        let mut words: Vec<u32> = vec![PacketHeader::new(Opcode::CuStat, CommandType::Ctrl, 12).raw()];
        words.extend_from_slice(&[0; 12]);
        let (_, buffer) = h.submit(words);
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(h.exec.ert().map(|ert| ert.is_slot_busy(CTRL_SLOT)), Some(true));

        // Version, slot count, CU count, then usage and status per CU.
        let layout: [u32; 8] = [CUSTAT_VERSION_MAGIC, 0x2, 2, 2, 7, 9, 1, 0];
        for (ix, word) in layout.iter().enumerate() {
            h.cq.poke(4 + (ix << 2), *word);
        }
        h.csr.poke(STATUS_REGISTER_ADDR, 0x1);
        h.exec.service(&mut h.pool);
        crate::ensure_eq!(buffer.state(), Some(CommandState::Completed));
        crate::ensure_eq!(h.exec.ert().map(|ert| ert.version()), Some(0x2));
        crate::ensure_eq!((h.exec.cu_usage(0), h.exec.cu_usage(1)), (7, 9));
        crate::ensure_eq!((h.exec.cu_status(0), h.exec.cu_status(1)), (AP_START, AP_IDLE));
        Ok(())
    }
}
