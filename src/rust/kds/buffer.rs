// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kds::packet::{
        CommandState,
        CommandType,
        PacketHeader,
    },
    runtime,
};
use ::std::sync::{
    atomic::{
        AtomicU64,
        Ordering,
    },
    Arc,
    Mutex,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Source of buffer identifiers.
static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Identity of an execution buffer.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub struct BufferId(u64);

/// Backing storage of an execution buffer.
struct BufferObject {
    id: BufferId,
    words: Mutex<Vec<u32>>,
}

/// Caller-owned command buffer.
///
/// The caller keeps one handle to poll the published state; the scheduler holds another while the command is live.
/// Cloning a handle takes a reference, dropping it releases the reference.
#[derive(Clone)]
pub struct ExecBuffer(Arc<BufferObject>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ExecBuffer {
    /// Wraps a command packet into a new buffer.
    pub fn new(words: Vec<u32>) -> Self {
        let id: BufferId = BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed));
        Self(Arc::new(BufferObject {
            id,
            words: Mutex::new(words),
        }))
    }

    pub fn id(&self) -> BufferId {
        self.0.id
    }

    /// Size of the buffer in bytes.
    pub fn size_bytes(&self) -> usize {
        runtime::lock(&self.0.words).len() * 4
    }

    /// Header word, or an all-zero header if the buffer is empty.
    pub fn header(&self) -> PacketHeader {
        PacketHeader::from(runtime::lock(&self.0.words).first().copied().unwrap_or(0))
    }

    /// Copies the current contents of the buffer.
    pub fn snapshot(&self) -> Vec<u32> {
        runtime::lock(&self.0.words).clone()
    }

    /// Published command state.
    pub fn state(&self) -> Option<CommandState> {
        self.header().state()
    }

    /// Publishes a command state in the header.
    pub fn set_state(&self, state: CommandState) {
        self.update_header(|header| header.with_state(state));
    }

    /// Rewrites the routing class of the packet.
    pub fn set_type(&self, cmd_type: CommandType) {
        self.update_header(|header| header.with_type(cmd_type));
    }

    /// Number of live handles to this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    fn update_header<F: FnOnce(PacketHeader) -> PacketHeader>(&self, f: F) {
        let mut words = runtime::lock(&self.0.words);
        if let Some(raw) = words.first_mut() {
            *raw = f(PacketHeader::from(*raw)).raw();
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<BufferId> for u64 {
    fn from(val: BufferId) -> Self {
        val.0
    }
}

impl ::std::fmt::Debug for ExecBuffer {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "ExecBuffer({:?})", self.0.id)
    }
}
