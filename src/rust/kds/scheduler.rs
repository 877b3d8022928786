// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Command scheduler shared by every device.
//!
//! New commands reach the scheduler through an inbound channel. Each pass of the scheduler moves them into the
//! execution core they target and then services every core. The worker thread sleeps until a command arrives, an
//! interrupt is signalled, or some running command needs polling.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kds::{
        command::{
            Command,
            CommandId,
            CommandPool,
        },
        config::Tunables,
        exec::{
            ExecCore,
            ExecResources,
            HostNotifier,
            SharedExecCore,
        },
        packet::CommandState,
    },
    runtime::{
        self,
        fail::Fail,
    },
};
use ::crossbeam_channel::{
    self,
    Receiver,
    Select,
    Sender,
    TrySendError,
};
use ::slab::Slab;
use ::std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
    },
    thread::{
        self,
        JoinHandle,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

const WORKER_NAME: &str = "kds-scheduler0";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle to the scheduler. Clones share the same scheduler.
#[derive(Clone)]
pub struct Scheduler(Arc<SchedulerShared>);

struct SchedulerShared {
    tunables: Tunables,
    inbound_tx: Sender<Command>,
    inbound_rx: Receiver<Command>,
    /// Interrupt signal. Holds at most one pending wake-up.
    intc_tx: Sender<()>,
    intc_rx: Receiver<()>,
    /// Running commands that are completed by polling.
    poll: Arc<AtomicUsize>,
    stop: AtomicBool,
    /// Set when a client gave up waiting for its commands.
    reset: AtomicBool,
    next_uid: AtomicU64,
    state: Mutex<SchedulerState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// State owned by whoever runs a scheduler pass.
struct SchedulerState {
    pool: CommandPool,
    cores: Slab<SharedExecCore>,
    /// Notifiers of detached cores, for commands still addressed to them.
    detached: HashMap<usize, Arc<HostNotifier>>,
    loop_cnt: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Scheduler {
    pub fn new(tunables: Tunables) -> Self {
        let (inbound_tx, inbound_rx): (Sender<Command>, Receiver<Command>) = crossbeam_channel::unbounded();
        let (intc_tx, intc_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);
        Self(Arc::new(SchedulerShared {
            tunables,
            inbound_tx,
            inbound_rx,
            intc_tx,
            intc_rx,
            poll: Arc::new(AtomicUsize::new(0)),
            stop: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            next_uid: AtomicU64::new(0),
            state: Mutex::new(SchedulerState {
                pool: CommandPool::new(),
                cores: Slab::new(),
                detached: HashMap::new(),
                loop_cnt: 0,
            }),
            worker: Mutex::new(None),
        }))
    }

    pub fn tunables(&self) -> &Tunables {
        &self.0.tunables
    }

    /// Registers the execution core of a new device. The worker thread is started with the first core.
    ///
    /// The command queue of the device is capped at the configured size.
    pub fn attach(
        &self,
        mut res: ExecResources,
        notifier: Arc<HostNotifier>,
    ) -> Result<(usize, SharedExecCore), Fail> {
        if res.cq_size > self.0.tunables.cq_size {
            info!(
                "attach(): limiting command queue to {:#x} bytes (device has {:#x})",
                self.0.tunables.cq_size, res.cq_size
            );
            res.cq_size = self.0.tunables.cq_size;
        }
        let (index, exec): (usize, SharedExecCore) = {
            let mut guard = runtime::lock(&self.0.state);
            let state: &mut SchedulerState = &mut guard;
            let entry = state.cores.vacant_entry();
            let index: usize = entry.key();
            let exec: SharedExecCore = Arc::new(Mutex::new(ExecCore::new(
                index,
                res,
                self.0.poll.clone(),
                notifier,
            )));
            entry.insert(exec.clone());
            state.detached.remove(&index);
            (index, exec)
        };
        info!("attach(): exec={:?}", index);

        if self.0.tunables.worker_thread {
            if let Err(e) = self.start() {
                runtime::lock(&self.0.state).cores.try_remove(index);
                return Err(e);
            }
        }
        Ok((index, exec))
    }

    /// Removes an execution core, aborting whatever it still holds. The worker thread stops with the last core.
    pub fn detach(&self, index: usize) {
        let last: bool = {
            let mut state = runtime::lock(&self.0.state);
            let state: &mut SchedulerState = &mut state;
            if let Some(exec) = state.cores.try_remove(index) {
                let mut exec = runtime::lock(&exec);
                exec.abort_all(&mut state.pool);
                state.detached.insert(index, exec.notifier());
            }
            state.cores.is_empty()
        };
        info!("detach(): exec={:?}, last={:?}", index, last);
        if last {
            self.shutdown();
        }
    }

    /// Identifier for the next command, unique for the lifetime of the scheduler.
    pub fn next_uid(&self) -> u64 {
        self.0.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    /// Hands a new command over to the scheduler.
    pub fn add_cmd(&self, cmd: Command) -> Result<(), Fail> {
        trace!("add_cmd(): uid={:?}, exec={:?}", cmd.uid(), cmd.exec());
        if let Err(e) = self.0.inbound_tx.send(cmd) {
            let cause: String = format!("scheduler is gone (uid={:?})", e.0.uid());
            error!("add_cmd(): {}", cause);
            return Err(Fail::new(libc::EIO, &cause));
        }
        Ok(())
    }

    /// Wakes the scheduler to look at completion status.
    pub fn intr(&self) {
        match self.0.intc_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => (),
            Err(TrySendError::Disconnected(())) => warn!("intr(): scheduler is gone"),
        }
    }

    /// Asks the next pass to drop its polling state.
    pub fn request_reset(&self) {
        warn!("request_reset(): scheduler reset requested");
        self.0.reset.store(true, Ordering::Release);
        self.intr();
    }

    /// Number of running commands completed by polling.
    pub fn poll_count(&self) -> usize {
        self.0.poll.load(Ordering::Acquire)
    }

    /// Number of live commands, queued or running.
    pub fn num_live(&self) -> usize {
        runtime::lock(&self.0.state).pool.len()
    }

    pub fn is_running(&self) -> bool {
        runtime::lock(&self.0.worker).is_some()
    }

    /// Checks whether there is work that cannot wait for a wake-up.
    fn has_work(&self) -> bool {
        self.0.stop.load(Ordering::Acquire)
            || !self.0.inbound_rx.is_empty()
            || !self.0.intc_rx.is_empty()
            || self.0.poll.load(Ordering::Acquire) > 0
    }

    /// Blocks until there is something to do.
    fn wait(&self) {
        if self.has_work() {
            return;
        }
        let mut sel: Select = Select::new();
        sel.recv(&self.0.inbound_rx);
        sel.recv(&self.0.intc_rx);
        sel.ready();
    }

    /// Runs one scheduler pass.
    pub fn run_once(&self) {
        // Consume the pending interrupt, the pass below looks at every core anyway.
        while self.0.intc_rx.try_recv().is_ok() {}

        let mut guard = runtime::lock(&self.0.state);
        let state: &mut SchedulerState = &mut guard;

        if self.0.reset.swap(false, Ordering::AcqRel) {
            self.reset(state);
        }

        self.queue_cmds(state);

        let cores: Vec<SharedExecCore> = state.cores.iter().map(|(_, exec)| exec.clone()).collect();
        for exec in cores {
            runtime::lock(&exec).service(&mut state.pool);
        }

        state.loop_cnt += 1;
    }

    /// Drops polling state after a client gave up on its commands.
    fn reset(&self, state: &mut SchedulerState) {
        warn!("reset(): scheduler is resetting after timeout");
        self.0.poll.store(0, Ordering::Release);
        for id in state.pool.ids() {
            if let Some(cmd) = state.pool.get_mut(id) {
                cmd.set_polled(false);
            }
        }
    }

    /// Moves new commands into the execution cores they target.
    fn queue_cmds(&self, state: &mut SchedulerState) {
        while let Ok(cmd) = self.0.inbound_rx.try_recv() {
            let exec: SharedExecCore = match state.cores.get(cmd.exec()) {
                Some(exec) => exec.clone(),
                None => {
                    warn!("queue_cmds(): no execution core {:?} (uid={:?})", cmd.exec(), cmd.uid());
                    let notifier: Option<Arc<HostNotifier>> = state.detached.get(&cmd.exec()).cloned();
                    Self::drop_orphan(cmd, notifier.as_deref());
                    continue;
                },
            };
            let id: CommandId = state.pool.insert(cmd);
            let mut exec = runtime::lock(&exec);
            match state.pool.chain_dependencies(id) {
                Ok(()) => {
                    exec.new_to_queued(&mut state.pool, id);
                    if state.pool.get(id).is_some() {
                        state.pool.mark_active(id);
                    }
                },
                Err(e) => {
                    warn!("queue_cmds(): cannot chain command: {:?}", e);
                    exec.error_cmd(&mut state.pool, id);
                },
            }
        }
    }

    /// Fails a command whose execution core went away.
    fn drop_orphan(mut cmd: Command, notifier: Option<&HostNotifier>) {
        cmd.publish_state(CommandState::Abort);
        cmd.client().note_completed();
        if let Some(notifier) = notifier {
            notifier.notify();
        }
    }

    /// Spawns the worker thread, unless it runs already.
    pub fn start(&self) -> Result<(), Fail> {
        let mut worker = runtime::lock(&self.0.worker);
        if worker.is_some() {
            return Ok(());
        }
        self.0.stop.store(false, Ordering::Release);
        let scheduler: Scheduler = self.clone();
        let handle: JoinHandle<()> = thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || scheduler.worker_loop())?;
        info!("start(): {} started", WORKER_NAME);
        *worker = Some(handle);
        Ok(())
    }

    fn worker_loop(&self) {
        let yield_interval: usize = self.0.tunables.yield_interval.max(1);
        let mut loops: usize = 0;
        loop {
            self.wait();
            if self.0.stop.load(Ordering::Acquire) {
                break;
            }
            self.run_once();
            loops += 1;
            if loops % yield_interval == 0 {
                thread::yield_now();
            }
        }
        info!("worker_loop(): {} exits", WORKER_NAME);
    }

    /// Stops the worker thread and aborts every command left.
    pub fn shutdown(&self) {
        self.0.stop.store(true, Ordering::Release);
        self.intr();
        let handle: Option<JoinHandle<()>> = runtime::lock(&self.0.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("shutdown(): {} panicked", WORKER_NAME);
            }
        }

        let mut guard = runtime::lock(&self.0.state);
        let state: &mut SchedulerState = &mut guard;
        while let Ok(cmd) = self.0.inbound_rx.try_recv() {
            let notifier: Option<Arc<HostNotifier>> = match state.cores.get(cmd.exec()) {
                Some(exec) => Some(runtime::lock(exec).notifier()),
                None => state.detached.get(&cmd.exec()).cloned(),
            };
            Self::drop_orphan(cmd, notifier.as_deref());
        }
        for (_, exec) in state.cores.iter() {
            runtime::lock(exec).abort_all(&mut state.pool);
        }
        self.0.stop.store(false, Ordering::Release);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
