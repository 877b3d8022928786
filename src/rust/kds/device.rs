// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::bitmap::Bitmap128,
    kds::{
        buffer::ExecBuffer,
        client::{
            ClientContext,
            ClientId,
            ClientReservation,
            IpReference,
            SharedClient,
        },
        command::Command,
        diagnostics::Diagnostics,
        exec::{
            ExecResources,
            HostNotifier,
            IrqStatus,
            SharedExecCore,
            XclbinId,
        },
        packet::{
            CommandState,
            CommandType,
            Opcode,
            PacketHeader,
            StartKernelPacket,
        },
        scheduler::Scheduler,
    },
    runtime::{
        self,
        fail::Fail,
        limits,
    },
};
use ::arrayvec::ArrayVec;
use ::std::{
    collections::HashMap,
    ops::Range,
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
        Mutex,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// CU a client context refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CuIndex {
    Physical(usize),
    /// Shared context not tied to a CU. Grants access to the implicit copy engines.
    Virtual,
}

/// An accelerator card as seen by its clients.
pub struct Device {
    scheduler: Scheduler,
    exec_idx: usize,
    exec: SharedExecCore,
    notifier: Arc<HostNotifier>,
    irq: Arc<IrqStatus>,
    intr_range: Range<u32>,
    next_client: AtomicU32,
    state: Mutex<DeviceState>,
}

/// Client bookkeeping, guarded by the device lock.
struct DeviceState {
    clients: HashMap<ClientId, ClientEntry>,
    ip_reference: Vec<IpReference>,
    xclbin_id: Option<XclbinId>,
    /// Clients holding at least one context, each of which pins the loaded image.
    xclbin_locks: usize,
    offline: bool,
    /// Set when a client gave up on its commands. Submissions fail until the next reset.
    needs_reset: bool,
}

struct ClientEntry {
    client: SharedClient,
    rsv: ClientReservation,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Device {
    /// Attaches a new device to `scheduler`.
    pub fn new(scheduler: &Scheduler, res: ExecResources) -> Result<Self, Fail> {
        let intr_range: Range<u32> = res.intr_base..res.intr_base.saturating_add(res.intr_num);
        let notifier: Arc<HostNotifier> = Arc::new(HostNotifier::new());
        let (exec_idx, exec): (usize, SharedExecCore) = scheduler.attach(res, notifier.clone())?;
        let irq: Arc<IrqStatus> = runtime::lock(&exec).irq();
        Ok(Self {
            scheduler: scheduler.clone(),
            exec_idx,
            exec,
            notifier,
            irq,
            intr_range,
            next_client: AtomicU32::new(1),
            state: Mutex::new(DeviceState {
                clients: HashMap::new(),
                ip_reference: vec![IpReference::default(); limits::MAX_CUS],
                xclbin_id: None,
                xclbin_locks: 0,
                offline: false,
                needs_reset: false,
            }),
        })
    }

    pub fn exec(&self) -> &SharedExecCore {
        &self.exec
    }

    pub fn notifier(&self) -> &Arc<HostNotifier> {
        &self.notifier
    }

    pub fn xclbin_id(&self) -> Option<XclbinId> {
        runtime::lock(&self.state).xclbin_id
    }

    pub fn needs_reset(&self) -> bool {
        runtime::lock(&self.state).needs_reset
    }

    pub fn num_clients(&self) -> usize {
        runtime::lock(&self.state).clients.len()
    }

    pub fn ip_reference(&self, cu_idx: usize) -> IpReference {
        runtime::lock(&self.state)
            .ip_reference
            .get(cu_idx)
            .copied()
            .unwrap_or_default()
    }

    /// Contexts held by `client`.
    pub fn reservation(&self, client: &SharedClient) -> Option<ClientReservation> {
        runtime::lock(&self.state)
            .clients
            .get(&client.id())
            .map(|entry| entry.rsv.clone())
    }

    pub fn set_offline(&self, offline: bool) {
        info!("set_offline(): offline={:?}", offline);
        runtime::lock(&self.state).offline = offline;
    }

    /// Number of regular CUs and the range of implicit copy-engine CUs.
    fn cu_layout(&self) -> (usize, Range<usize>) {
        let exec = runtime::lock(&self.exec);
        let num_regular: usize = exec.num_cus().saturating_sub(exec.num_cdma());
        (num_regular, num_regular..exec.num_cus())
    }

    pub fn create_client(&self, pid: u32) -> Result<SharedClient, Fail> {
        let mut state = runtime::lock(&self.state);
        if state.offline {
            let cause: String = format!("device is offline (pid={:?})", pid);
            warn!("create_client(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        let id: ClientId = ClientId::from(self.next_client.fetch_add(1, Ordering::Relaxed));
        let client: SharedClient = Arc::new(ClientContext::new(id, pid));
        state.clients.insert(
            id,
            ClientEntry {
                client: client.clone(),
                rsv: ClientReservation::default(),
            },
        );
        info!("create_client(): pid={:?}, clients={:?}", pid, state.clients.len());
        Ok(client)
    }

    /// Tears down a client. Waits for its commands to drain, then gives back every context it still holds.
    pub fn destroy_client(&self, client: &SharedClient) {
        client.set_abort();
        self.scheduler.intr();

        let tunables = self.scheduler.tunables();
        let mut outstanding: usize = client.outstanding();
        let mut loops: usize = 0;
        while outstanding > 0 {
            info!("destroy_client(): pid={:?} waiting for {:?} outstanding commands", client.pid(), outstanding);
            let seen: u64 = self.notifier.generation();
            self.notifier.wait_for(seen, tunables.client_poll);
            let now: usize = client.outstanding();
            loops = if now == outstanding { loops + 1 } else { 0 };
            if loops >= tunables.client_timeout_loops {
                error!(
                    "destroy_client(): pid={:?} gives up with {:?} outstanding commands, device needs reset",
                    client.pid(),
                    now
                );
                runtime::lock(&self.state).needs_reset = true;
                self.scheduler.request_reset();
                break;
            }
            outstanding = now;
        }

        let (num_regular, _): (usize, Range<usize>) = self.cu_layout();
        let mut state = runtime::lock(&self.state);
        let state: &mut DeviceState = &mut state;
        let entry: ClientEntry = match state.clients.remove(&client.id()) {
            Some(entry) => entry,
            None => {
                warn!("destroy_client(): unknown client (pid={:?})", client.pid());
                return;
            },
        };
        info!("destroy_client(): client exits (pid={:?})", entry.client.pid());
        if entry.rsv.num_ctx() == 0 {
            return;
        }

        // The application exited without freeing its contexts.
        for cu_idx in entry.rsv.cu_bitmap.iter() {
            // Copy engines carry no reference.
            if cu_idx >= num_regular {
                continue;
            }
            if state.ip_reference[cu_idx].release().is_ok() {
                info!("destroy_client(): context reclaimed (pid={:?}, cu={:?})", client.pid(), cu_idx);
            }
        }
        state.xclbin_locks = state.xclbin_locks.saturating_sub(1);
    }

    /// Consumes one completion of `client`. Returns whether there was one.
    pub fn poll_client(&self, client: &SharedClient) -> bool {
        client.take_trigger()
    }

    /// Blocks until `client` has a completion to consume, or `timeout` elapses.
    pub fn wait_for_completion(&self, client: &SharedClient, timeout: Duration) -> bool {
        let deadline: Instant = Instant::now() + timeout;
        loop {
            let seen: u64 = self.notifier.generation();
            if client.take_trigger() {
                return true;
            }
            let now: Instant = Instant::now();
            if now >= deadline {
                return false;
            }
            self.notifier.wait_for(seen, deadline - now);
        }
    }

    /// Loads a new accelerator image. Refused while any client holds a context on the current one.
    pub fn load_xclbin(&self, xclbin_id: XclbinId) -> Result<(), Fail> {
        {
            let mut state = runtime::lock(&self.state);
            if state.xclbin_locks > 0 {
                let cause: String = format!("image is in use by {:?} clients", state.xclbin_locks);
                warn!("load_xclbin(): {}", cause);
                return Err(Fail::new(libc::EBUSY, &cause));
            }
            state.xclbin_id = Some(xclbin_id);
            state.ip_reference.fill(IpReference::default());
        }
        self.reset(Some(xclbin_id));
        Ok(())
    }

    fn check_xclbin(state: &DeviceState, xclbin_id: XclbinId) -> Result<(), Fail> {
        if state.xclbin_id != Some(xclbin_id) {
            let cause: String = format!("context on wrong image (loaded={:?})", state.xclbin_id);
            warn!("check_xclbin(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        Ok(())
    }

    /// Opens a context on a CU of the loaded image.
    pub fn alloc_context(
        &self,
        client: &SharedClient,
        xclbin_id: XclbinId,
        cu: CuIndex,
        shared: bool,
    ) -> Result<(), Fail> {
        let (num_regular, implicit): (usize, Range<usize>) = self.cu_layout();
        let cu_valid: bool = match cu {
            CuIndex::Physical(cu_idx) => runtime::lock(&self.exec).cu(cu_idx).is_some_and(|cu| cu.is_valid()),
            CuIndex::Virtual => true,
        };

        let mut state = runtime::lock(&self.state);
        let state: &mut DeviceState = &mut state;
        Self::check_xclbin(state, xclbin_id)?;
        let entry: &mut ClientEntry = match state.clients.get_mut(&client.id()) {
            Some(entry) => entry,
            None => return Err(Fail::new(libc::EINVAL, "unknown client")),
        };

        match cu {
            CuIndex::Physical(cu_idx) => {
                if cu_idx >= num_regular || !cu_valid {
                    let cause: String = format!("invalid CU {:?} (num_cus={:?})", cu_idx, num_regular);
                    warn!("alloc_context(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                }
                if entry.rsv.cu_bitmap.is_set(cu_idx) {
                    let cause: String = format!("context on CU {:?} already added by this client", cu_idx);
                    warn!("alloc_context(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                }
                state.ip_reference[cu_idx].acquire(client.pid(), shared)?;
            },
            CuIndex::Virtual if !shared => {
                warn!("alloc_context(): exclusive virtual context (pid={:?})", client.pid());
                return Err(Fail::new(libc::EINVAL, "virtual CU cannot be reserved exclusively"));
            },
            CuIndex::Virtual => (),
        }

        // The first context pins the image.
        if entry.rsv.num_ctx() == 0 {
            state.xclbin_locks += 1;
        }

        match cu {
            CuIndex::Physical(cu_idx) => {
                entry.rsv.cu_bitmap.set(cu_idx);
                entry.rsv.num_cus += 1;
            },
            CuIndex::Virtual => {
                if entry.rsv.virt_cu_ref == 0 {
                    for cu_idx in implicit {
                        entry.rsv.cu_bitmap.set(cu_idx);
                    }
                }
                entry.rsv.virt_cu_ref += 1;
            },
        }
        info!(
            "alloc_context(): pid={:?}, cu={:?}, shared={:?}, ctx={:?}",
            client.pid(),
            cu,
            shared,
            entry.rsv.num_ctx()
        );
        Ok(())
    }

    /// Closes a context opened with [Device::alloc_context].
    pub fn free_context(&self, client: &SharedClient, xclbin_id: XclbinId, cu: CuIndex) -> Result<(), Fail> {
        let (_, implicit): (usize, Range<usize>) = self.cu_layout();
        let mut state = runtime::lock(&self.state);
        let state: &mut DeviceState = &mut state;
        Self::check_xclbin(state, xclbin_id)?;
        let entry: &mut ClientEntry = match state.clients.get_mut(&client.id()) {
            Some(entry) => entry,
            None => return Err(Fail::new(libc::EINVAL, "unknown client")),
        };

        match cu {
            CuIndex::Virtual => {
                if entry.rsv.virt_cu_ref == 0 {
                    return Err(Fail::new(libc::EINVAL, "no virtual context to free"));
                }
                entry.rsv.virt_cu_ref -= 1;
                if entry.rsv.virt_cu_ref == 0 {
                    for cu_idx in implicit {
                        entry.rsv.cu_bitmap.clear(cu_idx);
                    }
                }
            },
            CuIndex::Physical(cu_idx) => {
                if !entry.rsv.cu_bitmap.is_set(cu_idx) {
                    let cause: String = format!("CU {:?} is not reserved by this client", cu_idx);
                    warn!("free_context(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                }
                entry.rsv.cu_bitmap.clear(cu_idx);
                entry.rsv.num_cus -= 1;
                if let Err(e) = state.ip_reference[cu_idx].release() {
                    warn!("free_context(): {:?}", e);
                }
            },
        }

        // Last context gone, the image may be replaced.
        if entry.rsv.num_ctx() == 0 {
            state.xclbin_locks = state.xclbin_locks.saturating_sub(1);
        }
        info!("free_context(): pid={:?}, cu={:?}, ctx={:?}", client.pid(), cu, entry.rsv.num_ctx());
        Ok(())
    }

    /// Base address of a CU the client holds exclusively.
    pub fn cu_map_addr(&self, client: &SharedClient, cu_idx: usize) -> Result<u32, Fail> {
        {
            let state = runtime::lock(&self.state);
            let held: bool = state
                .clients
                .get(&client.id())
                .is_some_and(|entry| entry.rsv.cu_bitmap.is_set(cu_idx));
            let exclusive: bool = state
                .ip_reference
                .get(cu_idx)
                .and_then(|reference| reference.exclusive_holder())
                == Some(client.pid());
            if !held || !exclusive {
                let cause: String = format!("CU {:?} is not held exclusively by this client", cu_idx);
                warn!("cu_map_addr(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
        }
        match runtime::lock(&self.exec).cu_base_addr(cu_idx) {
            Some(addr) => Ok(addr),
            None => Err(Fail::new(libc::EINVAL, "no such CU")),
        }
    }

    /// Checks a caller buffer and settles its routing class.
    fn validate(&self, client: &SharedClient, buffer: &ExecBuffer) -> Result<Opcode, Fail> {
        let mut header: PacketHeader = buffer.header();
        if buffer.size_bytes() < 4 * (1 + header.count()) {
            let cause: String = format!("exec buffer is too small (count={:?})", header.count());
            warn!("validate(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let opcode: Opcode = match header.opcode() {
            Some(opcode) => opcode,
            None => return Err(Fail::new(libc::EINVAL, "unknown opcode")),
        };

        // CU style commands must specify CU type, copies are carried out by the host.
        match opcode {
            Opcode::StartCu | Opcode::ExecWrite => buffer.set_type(CommandType::Cu),
            Opcode::StartCopyBo => buffer.set_type(CommandType::KdsLocal),
            _ => (),
        }
        header = buffer.header();

        match header.cmd_type() {
            Some(CommandType::Cu) => (),
            Some(CommandType::Ctrl) | Some(CommandType::KdsLocal) => return Ok(opcode),
            other => {
                let cause: String = format!("unsupported command type {:?}", other);
                warn!("validate(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        }

        // Payload holds at least the mandatory CU mask and the extra ones.
        if header.count() < 1 + header.extra_cu_masks() {
            warn!("validate(): exec buffer payload count is too small");
            return Err(Fail::new(libc::EINVAL, "exec buffer payload count is too small"));
        }

        let held: Bitmap128 = match runtime::lock(&self.state).clients.get(&client.id()) {
            Some(entry) => entry.rsv.cu_bitmap,
            None => return Err(Fail::new(libc::EINVAL, "unknown client")),
        };
        if held.is_empty() {
            warn!("validate(): no CUs in context (pid={:?})", client.pid());
            return Err(Fail::new(libc::EINVAL, "client holds no CU context"));
        }
        let requested: Bitmap128 = StartKernelPacket::cu_bitmap(&buffer.snapshot());
        if requested.is_empty() {
            warn!("validate(): no CUs specified for command");
            return Err(Fail::new(libc::EINVAL, "no CUs specified for command"));
        }
        if !requested.is_subset_of(&held) {
            let cause: String = format!("CU mismatch (cmd={:?}, ctx={:?})", requested, held);
            warn!("validate(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(opcode)
    }

    /// Submits an execution buffer that runs after `deps`.
    pub fn execute(&self, client: &SharedClient, buffer: &ExecBuffer, deps: &[ExecBuffer]) -> Result<(), Fail> {
        if self.needs_reset() {
            warn!("execute(): device needs reset");
            return Err(Fail::new(libc::EBUSY, "device needs reset"));
        }
        let opcode: Opcode = self.validate(client, buffer)?;
        if deps.len() > limits::MAX_DEPS {
            let cause: String = format!("too many dependencies ({:?})", deps.len());
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let deps: ArrayVec<ExecBuffer, { limits::MAX_DEPS }> = deps.iter().cloned().collect();

        // Stop and reset wait for the exec lock.
        let exec = runtime::lock(&self.exec);
        exec.can_admit(Some(opcode))?;
        buffer.set_state(CommandState::New);
        let cmd: Command = Command::new(self.scheduler.next_uid(), self.exec_idx, client.clone(), buffer.clone(), deps);
        client.note_admitted();
        self.notifier.note_added();
        if let Err(e) = self.scheduler.add_cmd(cmd) {
            client.note_rejected();
            self.notifier.notify();
            return Err(e);
        }
        drop(exec);
        Ok(())
    }

    /// Refuses new commands and waits for the outstanding ones. Forces a flush if they do not drain in time.
    pub fn stop(&self) {
        runtime::lock(&self.exec).stop();

        let tunables = self.scheduler.tunables();
        for _ in 0..tunables.stop_retries {
            if self.notifier.outstanding() == 0 {
                break;
            }
            let seen: u64 = self.notifier.generation();
            self.notifier.wait_for(seen, tunables.stop_interval);
        }
        if self.notifier.outstanding() == 0 {
            return;
        }

        runtime::lock(&self.exec).set_flush();
        self.scheduler.intr();
        let deadline: Instant = Instant::now() + tunables.flush_wait;
        while self.notifier.outstanding() > 0 {
            let now: Instant = Instant::now();
            if now >= deadline {
                break;
            }
            let seen: u64 = self.notifier.generation();
            self.notifier.wait_for(seen, deadline - now);
        }
        let outstanding: usize = self.notifier.outstanding();
        if outstanding > 0 {
            error!("stop(): {:?} commands still outstanding after flush", outstanding);
        }
    }

    /// Resets the execution core for `xclbin_id`. `None` only lifts a stop.
    pub fn reset(&self, xclbin_id: Option<XclbinId>) {
        runtime::lock(&self.exec).reset(xclbin_id);
        runtime::lock(&self.state).needs_reset = false;
        self.scheduler.intr();
    }

    /// Requires a new configure command before further work.
    pub fn reconfig(&self) {
        runtime::lock(&self.exec).reconfig();
    }

    /// Interrupt entry for line `irq`.
    pub fn interrupt(&self, irq: u32) -> Result<(), Fail> {
        if self.irq.is_polling() {
            error!("interrupt(): unhandled isr (irq={:?})", irq);
            return Err(Fail::new(libc::EINVAL, "interrupt while polling"));
        }
        if !self.intr_range.contains(&irq) || !self.irq.set_pending((irq - self.intr_range.start) as usize) {
            let cause: String = format!("interrupt out of range (irq={:?})", irq);
            error!("interrupt(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        self.scheduler.intr();
        Ok(())
    }

    pub fn diagnostics(&self) -> Diagnostics {
        runtime::lock(&self.exec).diagnostics()
    }

    /// Detaches the device from the scheduler, aborting whatever it still holds.
    pub fn detach(&self) {
        self.scheduler.detach(self.exec_idx);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
