// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::bitmap::Bitmap128,
    runtime::fail::Fail,
};
use ::std::sync::{
    atomic::{
        AtomicBool,
        AtomicUsize,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Marks an ip reference as exclusively held. The remaining bits carry the holder's pid.
const IP_EXCLUSIVE: u32 = 1 << 31;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Identity of a client of a device.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub struct ClientId(u32);

/// Per-process state shared between the request handlers and the scheduler.
pub struct ClientContext {
    id: ClientId,
    pid: u32,
    /// Set on teardown so that commands still queued fail fast.
    abort: AtomicBool,
    /// Completions not yet consumed by a readiness poll.
    trigger: AtomicUsize,
    /// Admitted commands not yet finished.
    outstanding: AtomicUsize,
}

pub type SharedClient = Arc<ClientContext>;

/// Per-CU reservation word.
///
/// Holds either the number of shared users, or the pid of the exclusive holder tagged with [IP_EXCLUSIVE].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpReference(u32);

/// CU contexts a client currently holds on a device.
#[derive(Clone, Debug, Default)]
pub struct ClientReservation {
    pub cu_bitmap: Bitmap128,
    /// Number of physical CU contexts.
    pub num_cus: usize,
    /// Number of virtual CU contexts.
    pub virt_cu_ref: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ClientContext {
    pub fn new(id: ClientId, pid: u32) -> Self {
        Self {
            id,
            pid,
            abort: AtomicBool::new(false),
            trigger: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Fails every command of this client that has not started yet.
    pub fn set_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn pending_triggers(&self) -> usize {
        self.trigger.load(Ordering::Acquire)
    }

    /// Accounts for a command taken on behalf of this client.
    pub fn note_admitted(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Gives back a command that was never admitted.
    pub fn note_rejected(&self) {
        Self::saturating_decrement(&self.outstanding);
    }

    /// Accounts for a finished command and makes the client readable.
    pub fn note_completed(&self) {
        Self::saturating_decrement(&self.outstanding);
        self.trigger.fetch_add(1, Ordering::AcqRel);
    }

    /// Consumes one pending completion, if any.
    pub fn take_trigger(&self) -> bool {
        Self::saturating_decrement(&self.trigger)
    }

    fn saturating_decrement(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl IpReference {
    /// Takes a shared or exclusive reference on behalf of `pid`.
    pub fn acquire(&mut self, pid: u32, shared: bool) -> Result<(), Fail> {
        if let Some(holder) = self.exclusive_holder() {
            let cause: String = format!("CU is exclusively held by process {:?}", holder);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        if !shared && self.0 != 0 {
            let cause: String = format!("CU has {:?} shared users", self.0);
            return Err(Fail::new(libc::EBUSY, &cause));
        }

        if shared {
            if self.0 + 1 >= IP_EXCLUSIVE {
                return Err(Fail::new(libc::EBUSY, "too many shared users"));
            }
            self.0 += 1;
        } else {
            self.0 = IP_EXCLUSIVE | (pid & !IP_EXCLUSIVE);
        }
        Ok(())
    }

    /// Drops one reference.
    pub fn release(&mut self) -> Result<(), Fail> {
        if self.0 == 0 {
            return Err(Fail::new(libc::EINVAL, "CU has never been reserved"));
        }
        if self.exclusive_holder().is_some() {
            self.0 = 0;
        } else {
            self.0 -= 1;
        }
        Ok(())
    }

    pub fn exclusive_holder(&self) -> Option<u32> {
        if (self.0 & IP_EXCLUSIVE) != 0 {
            Some(self.0 & !IP_EXCLUSIVE)
        } else {
            None
        }
    }

    pub fn shared_users(&self) -> u32 {
        if self.exclusive_holder().is_some() {
            0
        } else {
            self.0
        }
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl ClientReservation {
    /// Number of contexts held, physical and virtual.
    pub fn num_ctx(&self) -> usize {
        self.num_cus + self.virt_cu_ref
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u32> for ClientId {
    fn from(val: u32) -> Self {
        ClientId(val)
    }
}

impl From<ClientId> for u32 {
    fn from(val: ClientId) -> Self {
        val.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
