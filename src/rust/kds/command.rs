// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::bitmap::Bitmap128,
    kds::{
        buffer::{
            BufferId,
            ExecBuffer,
        },
        client::SharedClient,
        packet::{
            CommandState,
            CommandType,
            Opcode,
            PacketHeader,
            StartKernelPacket,
        },
    },
    runtime::{
        fail::Fail,
        limits,
    },
};
use ::arrayvec::ArrayVec;
use ::slab::Slab;
use ::std::collections::HashMap;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Index of a live command in the [CommandPool].
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub struct CommandId(usize);

/// One in-flight accelerator operation.
pub struct Command {
    /// Unique across the lifetime of the scheduler, unlike [CommandId] which is recycled.
    uid: u64,
    /// Index of the execution core that owns this command.
    exec: usize,
    client: SharedClient,
    buffer: ExecBuffer,
    /// Packet contents captured at submission.
    packet: Vec<u32>,
    /// Predecessors, released once chained.
    deps: ArrayVec<ExecBuffer, { limits::MAX_DEPS }>,
    /// Dependents to trigger on completion.
    chain: ArrayVec<(CommandId, u64), { limits::MAX_DEPS }>,
    wait_count: usize,
    state: CommandState,
    aborted: bool,
    cu_idx: Option<usize>,
    slot_idx: Option<usize>,
    /// Whether the command holds a poll credit of the scheduler.
    polled: bool,
}

/// Arena of live commands.
///
/// Slots are recycled on removal. Also tracks which buffers currently have a live command, so that new commands can
/// chain to in-flight predecessors.
#[derive(Default)]
pub struct CommandPool {
    slab: Slab<Command>,
    active: HashMap<BufferId, CommandId>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Command {
    /// Creates a command in the `New` state out of a buffer and the buffers it depends on.
    pub fn new(
        uid: u64,
        exec: usize,
        client: SharedClient,
        buffer: ExecBuffer,
        deps: ArrayVec<ExecBuffer, { limits::MAX_DEPS }>,
    ) -> Self {
        let packet: Vec<u32> = buffer.snapshot();
        Self {
            uid,
            exec,
            client,
            buffer,
            packet,
            wait_count: deps.len(),
            deps,
            chain: ArrayVec::new(),
            state: CommandState::New,
            aborted: false,
            cu_idx: None,
            slot_idx: None,
            polled: false,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn exec(&self) -> usize {
        self.exec
    }

    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    pub fn buffer(&self) -> &ExecBuffer {
        &self.buffer
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader::from(self.packet.first().copied().unwrap_or(0))
    }

    pub fn opcode(&self) -> Option<Opcode> {
        self.header().opcode()
    }

    pub fn cmd_type(&self) -> Option<CommandType> {
        self.header().cmd_type()
    }

    /// Packet words, header included.
    pub fn packet(&self) -> &[u32] {
        &self.packet
    }

    /// Replaces the packet words. Used when configuration rewrites the packet before it is sent to hardware.
    pub fn set_packet(&mut self, packet: Vec<u32>) {
        self.packet = packet;
    }

    /// CUs this command may run on.
    pub fn cu_bitmap(&self) -> Bitmap128 {
        StartKernelPacket::cu_bitmap(&self.packet)
    }

    /// Register map of a CU command.
    pub fn regmap(&self) -> &[u32] {
        StartKernelPacket::regmap(&self.packet)
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Moves to an internal state without publishing it.
    pub fn set_state(&mut self, state: CommandState) {
        self.state = state;
    }

    /// Moves to `state` and publishes it in the caller's buffer.
    pub fn publish_state(&mut self, state: CommandState) {
        self.state = state;
        self.buffer.set_state(state);
    }

    /// Aborts commands that have not started when their client is torn down, and every command of a flushing core.
    pub fn update_state(&mut self, flush: bool) -> CommandState {
        if self.state != CommandState::Running && self.client.is_aborted() {
            info!("update_state(): aborting cmd of stale client (uid={:?}, pid={:?})", self.uid, self.client.pid());
            self.publish_state(CommandState::Abort);
        }
        if flush {
            info!("update_state(): aborting cmd of flushed core (uid={:?})", self.uid);
            self.publish_state(CommandState::Abort);
        }
        self.state
    }

    pub fn wait_count(&self) -> usize {
        self.wait_count
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Flags the command so that its final state becomes `Abort` regardless of what hardware reports.
    pub fn set_aborted(&mut self) {
        self.aborted = true;
    }

    pub fn cu_idx(&self) -> Option<usize> {
        self.cu_idx
    }

    pub fn set_cu(&mut self, cu_idx: usize) {
        self.cu_idx = Some(cu_idx);
    }

    /// Detaches the command from the CU it was dispatched to.
    pub fn clear_cu(&mut self) {
        self.cu_idx = None;
    }

    pub fn slot_idx(&self) -> Option<usize> {
        self.slot_idx
    }

    pub fn set_slot(&mut self, slot_idx: Option<usize>) {
        self.slot_idx = slot_idx;
    }

    pub fn is_polled(&self) -> bool {
        self.polled
    }

    pub fn set_polled(&mut self, polled: bool) {
        self.polled = polled;
    }

    pub fn num_dependents(&self) -> usize {
        self.chain.len()
    }
}

impl CommandPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a command and returns the index under which it lives.
    pub fn insert(&mut self, cmd: Command) -> CommandId {
        CommandId(self.slab.insert(cmd))
    }

    pub fn get(&self, id: CommandId) -> Option<&Command> {
        self.slab.get(id.0)
    }

    pub fn get_mut(&mut self, id: CommandId) -> Option<&mut Command> {
        self.slab.get_mut(id.0)
    }

    /// Returns a command to the pool, releasing the buffer reference it holds.
    pub fn remove(&mut self, id: CommandId) -> Option<Command> {
        self.mark_deactive(id);
        let cmd: Option<Command> = self.slab.try_remove(id.0);
        if let Some(cmd) = cmd.as_ref() {
            trace!("remove(): uid={:?}, id={:?}", cmd.uid, id);
        }
        cmd
    }

    /// Number of live commands.
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// Indexes of all live commands.
    pub fn ids(&self) -> Vec<CommandId> {
        self.slab.iter().map(|(ix, _)| CommandId(ix)).collect()
    }

    /// Live command currently associated with `buffer`, if any.
    pub fn active(&self, buffer: BufferId) -> Option<CommandId> {
        self.active.get(&buffer).copied()
    }

    /// Chains command `id` to the live predecessors among its dependencies.
    ///
    /// Dependencies without a live command have already finished and are discounted from the wait count. Fails when
    /// a predecessor already has the maximum number of dependents; the wait count is then left as computed so far.
    pub fn chain_dependencies(&mut self, id: CommandId) -> Result<(), Fail> {
        let (uid, deps): (u64, ArrayVec<ExecBuffer, { limits::MAX_DEPS }>) = match self.slab.get_mut(id.0) {
            Some(cmd) => (cmd.uid, ::std::mem::take(&mut cmd.deps)),
            None => return Err(Fail::new(libc::EINVAL, "no such command")),
        };

        for dep in deps.iter() {
            let pred_id: CommandId = match self.active(dep.id()) {
                Some(pred_id) if pred_id != id && self.slab.contains(pred_id.0) => pred_id,
                _ => {
                    // Predecessor already finished.
                    if let Some(cmd) = self.slab.get_mut(id.0) {
                        cmd.wait_count = cmd.wait_count.saturating_sub(1);
                    }
                    continue;
                },
            };
            let pred: &mut Command = &mut self.slab[pred_id.0];
            if pred.chain.try_push((id, uid)).is_err() {
                let cause: String = format!(
                    "cmd {:?} chain count exceeds maximum allowed ({:?})",
                    pred.uid,
                    limits::MAX_DEPS
                );
                error!("chain_dependencies(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
            trace!("chain_dependencies(): pred={:?}, dependent={:?}", pred.uid, uid);
        }

        Ok(())
    }

    /// Makes command `id` discoverable as a predecessor through its buffer.
    pub fn mark_active(&mut self, id: CommandId) {
        if let Some(cmd) = self.slab.get(id.0) {
            self.active.insert(cmd.buffer.id(), id);
        }
    }

    /// Drops the association between command `id` and its buffer.
    pub fn mark_deactive(&mut self, id: CommandId) {
        if let Some(cmd) = self.slab.get(id.0) {
            let buffer: BufferId = cmd.buffer.id();
            if self.active.get(&buffer) == Some(&id) {
                self.active.remove(&buffer);
            }
        }
    }

    /// Releases every dependent of command `id` by one.
    pub fn trigger_chain(&mut self, id: CommandId) {
        let chain: ArrayVec<(CommandId, u64), { limits::MAX_DEPS }> = match self.slab.get_mut(id.0) {
            Some(cmd) => ::std::mem::take(&mut cmd.chain),
            None => return,
        };
        for (dependent, uid) in chain {
            // The dependent may have been aborted and its slot reused.
            if let Some(cmd) = self.slab.get_mut(dependent.0).filter(|cmd| cmd.uid == uid) {
                cmd.wait_count = cmd.wait_count.saturating_sub(1);
                trace!("trigger_chain(): uid={:?}, wait_count={:?}", uid, cmd.wait_count);
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<usize> for CommandId {
    fn from(val: usize) -> Self {
        CommandId(val)
    }
}

impl From<CommandId> for usize {
    fn from(val: CommandId) -> Self {
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
        client::{
            ClientContext,
            ClientId,
        },
        packet::StartKernelPacket,
    };
    use ::anyhow::Result;
    use ::std::sync::Arc;

    fn start_buffer() -> ExecBuffer {
        ExecBuffer::new(
            StartKernelPacket {
                opcode: Opcode::StartCu,
                cu_masks: vec![0x1],
                regmap: vec![0; 6],
            }
            .to_words(),
        )
    }

    fn new_cmd(uid: u64, client: &SharedClient, buffer: &ExecBuffer, deps: &[ExecBuffer]) -> Command {
        let deps: ArrayVec<ExecBuffer, { limits::MAX_DEPS }> = deps.iter().cloned().collect();
        Command::new(uid, 0, client.clone(), buffer.clone(), deps)
    }

    #[test]
    fn finished_dependency_is_discounted() -> Result<()> {
        let client: SharedClient = Arc::new(ClientContext::new(ClientId::from(1), 1));
        let mut pool: CommandPool = CommandPool::new();
        let a: ExecBuffer = start_buffer();
        let b: ExecBuffer = start_buffer();

        let a_id: CommandId = pool.insert(new_cmd(0, &client, &a, &[]));
        pool.mark_active(a_id);
        let b_id: CommandId = pool.insert(new_cmd(1, &client, &b, &[a.clone()]));
        pool.chain_dependencies(b_id)?;
        crate::ensure_eq!(pool.get(b_id).map(|c| c.wait_count()), Some(1));

        pool.trigger_chain(a_id);
        pool.remove(a_id);
        crate::ensure_eq!(pool.get(b_id).map(|c| c.wait_count()), Some(0));
        crate::ensure_eq!(pool.active(a.id()), None);

        // A late dependent finds no live predecessor.
        let c: ExecBuffer = start_buffer();
        let c_id: CommandId = pool.insert(new_cmd(2, &client, &c, &[a.clone()]));
        pool.chain_dependencies(c_id)?;
        crate::ensure_eq!(pool.get(c_id).map(|c| c.wait_count()), Some(0));
        Ok(())
    }

    #[test]
    fn ninth_dependent_is_refused() -> Result<()> {
        let client: SharedClient = Arc::new(ClientContext::new(ClientId::from(1), 1));
        let mut pool: CommandPool = CommandPool::new();
        let root: ExecBuffer = start_buffer();
        let root_id: CommandId = pool.insert(new_cmd(0, &client, &root, &[]));
        pool.mark_active(root_id);

        for uid in 1..=limits::MAX_DEPS as u64 {
            let id: CommandId = pool.insert(new_cmd(uid, &client, &start_buffer(), &[root.clone()]));
            pool.chain_dependencies(id)?;
        }
        crate::ensure_eq!(pool.get(root_id).map(|c| c.num_dependents()), Some(limits::MAX_DEPS));

        let ninth: CommandId = pool.insert(new_cmd(99, &client, &start_buffer(), &[root.clone()]));
        match pool.chain_dependencies(ninth) {
            Err(e) if e.errno == libc::EINVAL => (),
            other => anyhow::bail!("ninth dependent should be refused: {:?}", other),
        }
        crate::ensure_eq!(pool.get(root_id).map(|c| c.num_dependents()), Some(limits::MAX_DEPS));
        Ok(())
    }

    #[test]
    fn trigger_skips_recycled_slot() -> Result<()> {
        let client: SharedClient = Arc::new(ClientContext::new(ClientId::from(1), 1));
        let mut pool: CommandPool = CommandPool::new();
        let a: ExecBuffer = start_buffer();
        let a_id: CommandId = pool.insert(new_cmd(0, &client, &a, &[]));
        pool.mark_active(a_id);

        let b_id: CommandId = pool.insert(new_cmd(1, &client, &start_buffer(), &[a.clone()]));
        pool.chain_dependencies(b_id)?;
        pool.remove(b_id);

        // Reuses the slot of the removed dependent.
        let c_id: CommandId = pool.insert(new_cmd(2, &client, &start_buffer(), &[a.clone(), a.clone()]));
        crate::ensure_eq!(c_id, b_id);
        pool.trigger_chain(a_id);
        crate::ensure_eq!(pool.get(c_id).map(|c| c.wait_count()), Some(2));
        Ok(())
    }

    #[test]
    fn removal_releases_buffer() -> Result<()> {
        let client: SharedClient = Arc::new(ClientContext::new(ClientId::from(1), 1));
        let mut pool: CommandPool = CommandPool::new();
        let a: ExecBuffer = start_buffer();
        let id: CommandId = pool.insert(new_cmd(0, &client, &a, &[]));
        crate::ensure_eq!(a.ref_count(), 2);
        pool.remove(id);
        crate::ensure_eq!(a.ref_count(), 1);
        crate::ensure_eq!(pool.is_empty(), true);
        Ok(())
    }
}
